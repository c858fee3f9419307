use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use sha2::{Digest, Sha256};

/// Header carrying the resolved user id into downstream handlers. Set by the
/// session middleware only; any client-supplied value is discarded.
pub const USER_ID_HEADER: &str = "x-mentor-user-id";

/// Hash a session token for storage or lookup.
/// The tokens are hashed with a gateway-specific prefix.
pub fn hash_session_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"mentor-");
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Session token table: hashed token to user id. Plaintext tokens are hashed
/// on insert and never kept.
#[derive(Clone, Default)]
pub struct SessionKeys {
    tokens: Arc<RwLock<HashMap<String, String>>>,
}

impl SessionKeys {
    pub fn new(tokens: &HashMap<String, String>) -> Self {
        let hashed = tokens
            .iter()
            .map(|(token, user_id)| (hash_session_token(token), user_id.clone()))
            .collect();
        Self {
            tokens: Arc::new(RwLock::new(hashed)),
        }
    }

    /// Resolve a plaintext bearer token to a user id.
    pub fn resolve(&self, token: &str) -> Option<String> {
        let hashed = hash_session_token(token);
        #[expect(clippy::expect_used)]
        let tokens = self.tokens.read().expect("RwLock poisoned");
        tokens.get(&hashed).cloned()
    }

    pub fn insert_token(&self, token: &str, user_id: &str) {
        #[expect(clippy::expect_used)]
        let mut tokens = self.tokens.write().expect("RwLock poisoned");
        tokens.insert(hash_session_token(token), user_id.to_string());
    }

    pub fn remove_token(&self, token: &str) {
        #[expect(clippy::expect_used)]
        let mut tokens = self.tokens.write().expect("RwLock poisoned");
        tokens.remove(&hash_session_token(token));
    }
}

/// Middleware guarding user-scoped routes: requires a valid bearer token and
/// injects the resolved user id as a request header for handlers to read.
pub async fn require_session(
    State(sessions): State<SessionKeys>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    // Strip any spoofed identity header before resolving the real one
    request.headers_mut().remove(USER_ID_HEADER);

    let token = request
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    let Some(token) = token else {
        return unauthorized("Missing or malformed Authorization header");
    };

    let Some(user_id) = sessions.resolve(token) else {
        return unauthorized("Invalid session token");
    };

    match HeaderValue::from_str(&user_id) {
        Ok(value) => {
            request.headers_mut().insert(USER_ID_HEADER, value);
        }
        Err(_) => {
            tracing::error!("Session table contains a user id that is not a valid header value");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Internal error: invalid session entry"})),
            )
                .into_response();
        }
    }

    next.run(request).await
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": message}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_token() {
        let sessions = SessionKeys::new(&HashMap::from([(
            "tok-abc".to_string(),
            "user-1".to_string(),
        )]));

        assert_eq!(sessions.resolve("tok-abc").as_deref(), Some("user-1"));
        assert_eq!(sessions.resolve("tok-xyz"), None);
    }

    #[test]
    fn test_insert_and_remove_token() {
        let sessions = SessionKeys::default();
        assert_eq!(sessions.resolve("tok"), None);

        sessions.insert_token("tok", "user-2");
        assert_eq!(sessions.resolve("tok").as_deref(), Some("user-2"));

        sessions.remove_token("tok");
        assert_eq!(sessions.resolve("tok"), None);
    }

    #[test]
    fn test_tokens_are_stored_hashed() {
        let sessions = SessionKeys::new(&HashMap::from([(
            "tok-abc".to_string(),
            "user-1".to_string(),
        )]));

        let tokens = sessions.tokens.read().unwrap();
        assert!(!tokens.contains_key("tok-abc"));
        assert!(tokens.contains_key(&hash_session_token("tok-abc")));
    }
}
