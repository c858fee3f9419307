use axum::response::Json;
use serde_json::{json, Value};

pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// GET /status
pub async fn status_handler() -> Json<Value> {
    Json(json!({"status": "ok", "version": GATEWAY_VERSION}))
}

/// GET /health
pub async fn health_handler() -> Json<Value> {
    Json(json!({"status": "ok"}))
}
