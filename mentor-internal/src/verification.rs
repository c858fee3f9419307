use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::store::{UserRecord, UserStore};
use crate::usage::UsageWindow;

/// Unverified accounts may send this many messages before the gate closes.
pub const VERIFICATION_THRESHOLD: u32 = 12;

/// Minimum gap between two code issuances for the same user.
pub const RESEND_COOLDOWN_SECONDS: i64 = 120;

/// Issued codes are valid for this long.
pub const CODE_EXPIRY_MINUTES: i64 = 10;

/// Pending verification challenge for a user. All three fields are set
/// together on issuance and cleared together on successful confirmation.
/// Only the SHA-256 hash of the code is ever stored.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationState {
    pub code_hash: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_sent_at: Option<DateTime<Utc>>,
}

impl VerificationState {
    pub fn is_empty(&self) -> bool {
        self.code_hash.is_none() && self.expires_at.is_none() && self.last_sent_at.is_none()
    }
}

/// Hash a verification code for storage or comparison.
/// The codes are hashed with a gateway-specific prefix.
pub fn hash_verification_code(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"mentor-");
    hasher.update(code.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Outcome of asking for a new code to be issued.
#[derive(Debug, PartialEq)]
pub enum IssueOutcome {
    Issued(IssuedCode),
    AlreadyVerified,
    RateLimited { retry_after_seconds: u64 },
}

/// A freshly generated code, handed to the mailer and then dropped.
/// This is the only place the plaintext code exists.
#[derive(Debug, PartialEq)]
pub struct IssuedCode {
    pub code: String,
    pub expires_in_minutes: i64,
}

/// Outcome of submitting a code for confirmation. The three failure cases
/// are distinguished so callers can tell the user what actually went wrong.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConfirmOutcome {
    Verified,
    AlreadyVerified,
    NoCodeIssued,
    CodeExpired,
    CodeMismatch,
}

/// Issues and confirms email verification codes against the user store.
pub struct VerificationGate {
    store: Arc<dyn UserStore>,
}

impl VerificationGate {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }

    /// Whether the verification gate blocks this user: unverified and at or
    /// past the message threshold. Verified users are never blocked here.
    pub fn requires_verification(user: &UserRecord, window: &UsageWindow, threshold: u32) -> bool {
        user.email_verified.is_none() && window.messages_used >= threshold
    }

    /// Generate a 6-digit code for the user, persist its hash with a
    /// 10-minute expiry, and return the plaintext for delivery.
    ///
    /// Re-issuance within the cooldown is refused with the exact number of
    /// seconds left. Issuing a new code invalidates any previous one since
    /// the stored hash is overwritten.
    pub async fn issue_code(
        &self,
        user: &UserRecord,
        now: DateTime<Utc>,
    ) -> Result<IssueOutcome, Error> {
        if user.email_verified.is_some() {
            return Ok(IssueOutcome::AlreadyVerified);
        }

        if let Some(retry_after_seconds) = cooldown_remaining(&user.verification, now) {
            tracing::debug!(
                user_id = user.id.as_str(),
                retry_after_seconds,
                "Verification code resend within cooldown"
            );
            return Ok(IssueOutcome::RateLimited {
                retry_after_seconds,
            });
        }

        let code = generate_code();
        let code_hash = hash_verification_code(&code);
        let expires_at = now + Duration::minutes(CODE_EXPIRY_MINUTES);
        self.store
            .set_verification_code(&user.id, &code_hash, expires_at, now)
            .await?;

        tracing::info!(
            user_id = user.id.as_str(),
            expires_at = %expires_at,
            "Issued verification code"
        );

        Ok(IssueOutcome::Issued(IssuedCode {
            code,
            expires_in_minutes: CODE_EXPIRY_MINUTES,
        }))
    }

    /// Check a submitted code against the stored hash. On success the user
    /// is marked verified and the challenge fields are cleared in one write.
    ///
    /// Confirming an already-verified account succeeds without touching the
    /// store, so a double-submitted form does not surface an error.
    pub async fn confirm_code(
        &self,
        user: &UserRecord,
        submitted: &str,
        now: DateTime<Utc>,
    ) -> Result<ConfirmOutcome, Error> {
        if user.email_verified.is_some() {
            return Ok(ConfirmOutcome::AlreadyVerified);
        }

        let (Some(stored_hash), Some(expires_at)) = (
            user.verification.code_hash.as_deref(),
            user.verification.expires_at,
        ) else {
            return Ok(ConfirmOutcome::NoCodeIssued);
        };

        if now >= expires_at {
            return Ok(ConfirmOutcome::CodeExpired);
        }

        if hash_verification_code(submitted) != stored_hash {
            return Ok(ConfirmOutcome::CodeMismatch);
        }

        self.store.clear_verification(&user.id, now).await?;

        tracing::info!(user_id = user.id.as_str(), "Email verified");

        Ok(ConfirmOutcome::Verified)
    }
}

/// Seconds left in the resend cooldown, or `None` when a new code may be
/// issued. Rounds up so a caller that waits the returned number of seconds
/// is guaranteed to be outside the window.
pub fn cooldown_remaining(state: &VerificationState, now: DateTime<Utc>) -> Option<u64> {
    let last_sent_at = state.last_sent_at?;
    let elapsed_ms = (now - last_sent_at).num_milliseconds();
    let cooldown_ms = RESEND_COOLDOWN_SECONDS * 1000;
    if elapsed_ms >= cooldown_ms {
        return None;
    }
    let remaining_ms = cooldown_ms - elapsed_ms;
    Some((remaining_ms as u64).div_ceil(1000).max(1))
}

/// Uniformly random 6-digit code. The lower bound of 100000 keeps the
/// leading digit nonzero so the code is always exactly six characters.
fn generate_code() -> String {
    let code: u32 = rand::rng().random_range(100_000..=999_999);
    code.to_string()
}
