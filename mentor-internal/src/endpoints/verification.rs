use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppState;
use crate::store::load_user;
use crate::verification::{ConfirmOutcome, IssueOutcome};

use super::user_id_from_headers;

/// POST /v1/verification/request
///
/// Issue a fresh code and hand it to the mailer. Already-verified accounts
/// get a 200 without a send; resends inside the cooldown get a 429 with the
/// seconds left.
pub async fn request_code_handler(
    State(app_state): AppState,
    headers: HeaderMap,
) -> Result<Response, Error> {
    let user_id = user_id_from_headers(&headers)?;
    let now = Utc::now();

    let user = load_user(app_state.store.as_ref(), &user_id, now)
        .await?
        .ok_or_else(|| Error::new(ErrorDetails::UserNotFound { user_id }))?;

    match app_state.verification_gate.issue_code(&user, now).await? {
        IssueOutcome::AlreadyVerified => Ok((
            StatusCode::OK,
            Json(json!({"message": "Email is already verified"})),
        )
            .into_response()),
        IssueOutcome::RateLimited {
            retry_after_seconds,
        } => Ok((
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "RATE_LIMITED",
                "retry_after": retry_after_seconds,
            })),
        )
            .into_response()),
        IssueOutcome::Issued(issued) => {
            app_state
                .mailer
                .send_verification_code(&user.email, user.name.as_deref(), &issued)
                .await?;
            Ok((
                StatusCode::OK,
                Json(json!({
                    "message": "Verification code sent",
                    "expires_in_minutes": issued.expires_in_minutes,
                })),
            )
                .into_response())
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfirmRequest {
    pub code: String,
}

/// POST /v1/verification/confirm
///
/// Check a submitted code. The three failure modes come back as distinct
/// machine-readable codes so the client can say what actually went wrong.
pub async fn confirm_code_handler(
    State(app_state): AppState,
    headers: HeaderMap,
    Json(params): Json<ConfirmRequest>,
) -> Result<Response, Error> {
    let user_id = user_id_from_headers(&headers)?;
    let now = Utc::now();

    if params.code.len() != 6 || !params.code.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::new(ErrorDetails::InvalidRequest {
            message: "`code` must be a 6-digit string".to_string(),
        }));
    }

    let user = load_user(app_state.store.as_ref(), &user_id, now)
        .await?
        .ok_or_else(|| Error::new(ErrorDetails::UserNotFound { user_id }))?;

    let outcome = app_state
        .verification_gate
        .confirm_code(&user, &params.code, now)
        .await?;

    let response = match outcome {
        ConfirmOutcome::Verified => (
            StatusCode::OK,
            Json(json!({"message": "Email verified"})),
        ),
        ConfirmOutcome::AlreadyVerified => (
            StatusCode::OK,
            Json(json!({"message": "Email is already verified"})),
        ),
        ConfirmOutcome::NoCodeIssued => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "NO_CODE_ISSUED"})),
        ),
        ConfirmOutcome::CodeExpired => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "CODE_EXPIRED"})),
        ),
        ConfirmOutcome::CodeMismatch => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "CODE_MISMATCH"})),
        ),
    };

    Ok(response.into_response())
}
