use axum::http::HeaderMap;

use crate::error::{Error, ErrorDetails};
use crate::sessions::USER_ID_HEADER;

pub mod chat;
pub mod fallback;
pub mod status;
pub mod usage;
pub mod verification;

/// Read the user id resolved by the session middleware. User-scoped routes
/// are always behind that middleware, so a missing header means the router
/// is wired wrong, not that the client is unauthenticated.
pub(crate) fn user_id_from_headers(headers: &HeaderMap) -> Result<String, Error> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::new(ErrorDetails::InternalError {
                message: "Request reached a user-scoped handler without a resolved user id"
                    .to_string(),
            })
        })
}
