use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Json;
use chrono::Utc;
use serde_json::{json, Value};

use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppState;
use crate::store::load_user;
use crate::verification::{VerificationGate, VERIFICATION_THRESHOLD};

use super::user_id_from_headers;

/// GET /v1/usage
///
/// Report the user's current window. Reads refresh first, so a stale window
/// never leaks into the meter a client renders.
pub async fn usage_handler(
    State(app_state): AppState,
    headers: HeaderMap,
) -> Result<Json<Value>, Error> {
    let user_id = user_id_from_headers(&headers)?;
    let now = Utc::now();

    let user = load_user(app_state.store.as_ref(), &user_id, now)
        .await?
        .ok_or_else(|| Error::new(ErrorDetails::UserNotFound { user_id }))?;

    let window = app_state.tracker.refresh(&user, now).await?;

    Ok(Json(json!({
        "plan": user.plan,
        "messages_used": window.messages_used,
        "message_limit": window.message_limit,
        "remaining": window.remaining(),
        "reset_at": window.reset_at,
        "email_verified": user.email_verified.is_some(),
        "verification_required": VerificationGate::requires_verification(
            &user,
            &window,
            VERIFICATION_THRESHOLD,
        ),
        "verification_threshold": VERIFICATION_THRESHOLD,
    })))
}
