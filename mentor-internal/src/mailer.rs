use async_trait::async_trait;

use crate::error::Error;
use crate::verification::IssuedCode;

/// Delivery boundary for verification codes. The real deployment hands this
/// to an email service; the gateway itself never inspects the code again
/// after passing it here.
#[async_trait]
pub trait VerificationMailer: Send + Sync {
    async fn send_verification_code(
        &self,
        email: &str,
        name: Option<&str>,
        issued: &IssuedCode,
    ) -> Result<(), Error>;
}

/// Development mailer that records the send in the log. The code itself is
/// never logged; plaintext codes exist only in the outbound message.
pub struct LogMailer;

#[async_trait]
impl VerificationMailer for LogMailer {
    async fn send_verification_code(
        &self,
        email: &str,
        name: Option<&str>,
        issued: &IssuedCode,
    ) -> Result<(), Error> {
        tracing::info!(
            email,
            name = name.unwrap_or("<unset>"),
            expires_in_minutes = issued.expires_in_minutes,
            "Would send verification code email"
        );
        Ok(())
    }
}
