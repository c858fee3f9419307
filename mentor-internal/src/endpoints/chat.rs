use std::convert::Infallible;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;

use crate::error::{Error, ErrorDetails};
use crate::gatekeeper::{AccessDecision, DenialReason};
use crate::gateway_util::AppState;
use crate::inference::ChatMessage;

use super::user_id_from_headers;

/// Post-charge usage headers on streamed responses, so clients can show a
/// meter without a second request.
pub const USAGE_USED_HEADER: &str = "x-mentor-usage-messages-used";
pub const USAGE_LIMIT_HEADER: &str = "x-mentor-usage-message-limit";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
}

/// POST /v1/chat
///
/// Runs the admission sequence, then streams the model response as SSE.
/// The message is charged when admitted, before the provider is called;
/// provider failures after that point do not refund it.
pub async fn chat_handler(
    State(app_state): AppState,
    headers: HeaderMap,
    Json(params): Json<ChatRequest>,
) -> Result<Response, Error> {
    let user_id = user_id_from_headers(&headers)?;

    if params.messages.is_empty() {
        return Err(Error::new(ErrorDetails::InvalidRequest {
            message: "`messages` must not be empty".to_string(),
        }));
    }

    let decision = app_state
        .gatekeeper
        .check_access(&user_id, Utc::now())
        .await?;

    let (messages_used, message_limit) = match decision {
        AccessDecision::Deny(reason) => return Ok(denial_response(&reason)),
        AccessDecision::Allow {
            messages_used,
            message_limit,
        } => (messages_used, message_limit),
    };

    let stream = app_state
        .provider
        .stream_chat(params.messages, params.model)
        .await?;

    let events = stream
        .map(|delta| match delta {
            Ok(text) => Event::default().data(text),
            Err(e) => {
                let (_, body) = e.to_response_json();
                Event::default().event("error").data(body.to_string())
            }
        })
        .chain(futures::stream::once(async {
            Event::default().data("[DONE]")
        }))
        .map(Ok::<Event, Infallible>);

    let mut response = Sse::new(events).keep_alive(KeepAlive::new()).into_response();
    response
        .headers_mut()
        .insert(USAGE_USED_HEADER, HeaderValue::from(messages_used));
    response
        .headers_mut()
        .insert(USAGE_LIMIT_HEADER, HeaderValue::from(message_limit));
    Ok(response)
}

/// Denials are well-formed responses, not errors: the gate worked as
/// intended and the body tells the client exactly why and what to do next.
fn denial_response(reason: &DenialReason) -> Response {
    let body = match reason {
        DenialReason::EmailVerificationRequired {
            messages_used,
            threshold,
        } => json!({
            "error": reason.code(),
            "messages_used": messages_used,
            "threshold": threshold,
        }),
        DenialReason::PlanLimitReached {
            plan,
            messages_used,
            message_limit,
        } => json!({
            "error": reason.code(),
            "plan": plan,
            "messages_used": messages_used,
            "message_limit": message_limit,
        }),
        DenialReason::UserNotFound { user_id } => json!({
            "error": reason.code(),
            "user_id": user_id,
        }),
    };
    (reason.status_code(), Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_denial_response_shapes() {
        let response = denial_response(&DenialReason::EmailVerificationRequired {
            messages_used: 12,
            threshold: 12,
        });
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = denial_response(&DenialReason::UserNotFound {
            user_id: "ghost".to_string(),
        });
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
