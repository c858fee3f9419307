pub mod config_parser; // gateway config file
pub mod endpoints; // API endpoints
pub mod error; // error handling
pub mod gatekeeper; // access decisions for inbound messages
pub mod gateway_util; // utilities for gateway
pub mod inference; // model inference
pub mod mailer; // verification code delivery
pub mod observability; // utilities for observability (logs)
pub mod plan; // billing tiers and quotas
pub mod sessions; // session token authentication
pub mod store; // user persistence
pub mod usage; // usage window tracking
pub mod verification; // email verification
