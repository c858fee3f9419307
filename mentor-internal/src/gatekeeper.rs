use std::sync::Arc;

use axum::http::StatusCode;
use chrono::{DateTime, Utc};

use crate::error::Error;
use crate::plan::Plan;
use crate::store::{load_user, UserStore};
use crate::usage::UsageTracker;
use crate::verification::{VerificationGate, VERIFICATION_THRESHOLD};

/// The single yes/no answer for "may this user send one more message".
#[derive(Debug, PartialEq)]
pub enum AccessDecision {
    /// The message was admitted and already charged; the fields reflect the
    /// post-increment window.
    Allow {
        messages_used: u32,
        message_limit: u32,
    },
    Deny(DenialReason),
}

/// Why a message was refused. Each reason carries the context a client
/// needs to render a useful message without a second request.
#[derive(Debug, PartialEq)]
pub enum DenialReason {
    EmailVerificationRequired {
        messages_used: u32,
        threshold: u32,
    },
    PlanLimitReached {
        plan: Plan,
        messages_used: u32,
        message_limit: u32,
    },
    UserNotFound {
        user_id: String,
    },
}

impl DenialReason {
    /// Stable machine-readable code for response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            DenialReason::EmailVerificationRequired { .. } => "EMAIL_VERIFICATION_REQUIRED",
            DenialReason::PlanLimitReached { .. } => "PLAN_LIMIT_REACHED",
            DenialReason::UserNotFound { .. } => "USER_NOT_FOUND",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            DenialReason::EmailVerificationRequired { .. } => StatusCode::FORBIDDEN,
            DenialReason::PlanLimitReached { .. } => StatusCode::FORBIDDEN,
            DenialReason::UserNotFound { .. } => StatusCode::NOT_FOUND,
        }
    }
}

/// Runs the full admission sequence for one inbound message:
/// load, refresh the window, verification gate, quota gate, then the
/// atomic charge. The charge is unconditional once both gates pass, so a
/// message is paid for whether or not the model call after it succeeds.
pub struct AccessGatekeeper {
    store: Arc<dyn UserStore>,
    tracker: UsageTracker,
    verification_threshold: u32,
}

impl AccessGatekeeper {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self {
            tracker: UsageTracker::new(store.clone()),
            store,
            verification_threshold: VERIFICATION_THRESHOLD,
        }
    }

    #[cfg(test)]
    fn with_threshold(mut self, threshold: u32) -> Self {
        self.verification_threshold = threshold;
        self
    }

    /// Decide whether the user may send one more message, charging for it
    /// if so.
    ///
    /// The verification gate is checked before the quota gate: an unverified
    /// user past the threshold sees the verification denial even when their
    /// quota is also exhausted. Store failures propagate as errors; a broken
    /// store never turns into an Allow.
    pub async fn check_access(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessDecision, Error> {
        let Some(user) = load_user(self.store.as_ref(), user_id, now).await? else {
            return Ok(AccessDecision::Deny(DenialReason::UserNotFound {
                user_id: user_id.to_string(),
            }));
        };

        let window = self.tracker.refresh(&user, now).await?;

        if VerificationGate::requires_verification(&user, &window, self.verification_threshold) {
            tracing::debug!(
                user_id,
                messages_used = window.messages_used,
                "Denied: email verification required"
            );
            return Ok(AccessDecision::Deny(
                DenialReason::EmailVerificationRequired {
                    messages_used: window.messages_used,
                    threshold: self.verification_threshold,
                },
            ));
        }

        if window.messages_used >= window.message_limit {
            tracing::debug!(
                user_id,
                plan = %user.plan,
                messages_used = window.messages_used,
                message_limit = window.message_limit,
                "Denied: plan limit reached"
            );
            return Ok(AccessDecision::Deny(DenialReason::PlanLimitReached {
                plan: user.plan,
                messages_used: window.messages_used,
                message_limit: window.message_limit,
            }));
        }

        let charged = self.tracker.increment(user_id, 1).await?;

        Ok(AccessDecision::Allow {
            messages_used: charged.messages_used,
            message_limit: charged.message_limit,
        })
    }
}
