//! End-to-end tests for the gateway router: session auth, the admission
//! sequence on /v1/chat, the verification endpoints, and the usage report.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use tower::ServiceExt;

use mentor_internal::config_parser::Config;
use mentor_internal::error::Error;
use mentor_internal::gateway_util::{build_router, AppStateData};
use mentor_internal::inference::EchoProvider;
use mentor_internal::mailer::VerificationMailer;
use mentor_internal::plan::Plan;
use mentor_internal::store::{CreateUserParams, MemoryUserStore, UserDocument, UserStore};
use mentor_internal::usage::UsageWindow;
use mentor_internal::verification::{IssuedCode, VerificationState};

/// Captures issued codes so tests can confirm them.
#[derive(Default)]
struct CapturingMailer {
    codes: Mutex<Vec<String>>,
}

impl CapturingMailer {
    fn last_code(&self) -> Option<String> {
        self.codes.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl VerificationMailer for CapturingMailer {
    async fn send_verification_code(
        &self,
        _email: &str,
        _name: Option<&str>,
        issued: &IssuedCode,
    ) -> Result<(), Error> {
        self.codes.lock().unwrap().push(issued.code.clone());
        Ok(())
    }
}

struct TestApp {
    router: Router,
    store: Arc<MemoryUserStore>,
    mailer: Arc<CapturingMailer>,
}

/// Gateway wired to an in-memory store, the echo provider, and a capturing
/// mailer, with one session token `tok-1` for user `user-1`.
fn test_app(store: Arc<MemoryUserStore>) -> TestApp {
    let config = Config {
        sessions: HashMap::from([("tok-1".to_string(), "user-1".to_string())]),
        ..Default::default()
    };
    let mailer = Arc::new(CapturingMailer::default());
    let state = AppStateData::with_parts(
        config,
        store.clone(),
        Arc::new(EchoProvider),
        mailer.clone(),
    );
    TestApp {
        router: build_router(state),
        store,
        mailer,
    }
}

async fn seeded_app(plan: Plan) -> TestApp {
    let store = Arc::new(MemoryUserStore::new());
    store
        .create_user(
            CreateUserParams::new("ada@example.com")
                .with_id("user-1")
                .with_plan(plan),
            Utc::now(),
        )
        .await
        .unwrap();
    test_app(store)
}

fn chat_request(token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/chat")
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder
        .body(Body::from(
            json!({
                "messages": [{"role": "user", "content": "what is a lifetime"}]
            })
            .to_string(),
        ))
        .unwrap()
}

fn post_request(uri: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_request(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_health_and_status_are_public() {
    let app = seeded_app(Plan::Free).await;

    let response = app
        .router
        .clone()
        .oneshot(get_request("/health", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .router
        .clone()
        .oneshot(get_request("/status", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let app = seeded_app(Plan::Free).await;
    let response = app
        .router
        .clone()
        .oneshot(get_request("/v2/chat", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("Route not found"));
}

#[tokio::test]
async fn test_missing_or_invalid_token_is_401() {
    let app = seeded_app(Plan::Free).await;

    let response = app.router.clone().oneshot(chat_request(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .router
        .clone()
        .oneshot(chat_request(Some("not-a-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_spoofed_identity_header_is_ignored() {
    let store = Arc::new(MemoryUserStore::new());
    store
        .create_user(
            CreateUserParams::new("ada@example.com").with_id("user-1"),
            Utc::now(),
        )
        .await
        .unwrap();
    store
        .create_user(
            CreateUserParams::new("eve@example.com").with_id("user-2"),
            Utc::now(),
        )
        .await
        .unwrap();
    let app = test_app(store.clone());

    // Authenticated as user-1, trying to charge user-2
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat")
        .header("authorization", "Bearer tok-1")
        .header("x-mentor-user-id", "user-2")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"messages": [{"role": "user", "content": "hi"}]}).to_string(),
        ))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let user_1 = store.fetch_user("user-1").await.unwrap().unwrap();
    let user_2 = store.fetch_user("user-2").await.unwrap().unwrap();
    assert_eq!(user_1.usage.unwrap().messages_used, 1);
    assert_eq!(user_2.usage.unwrap().messages_used, 0);
}

#[tokio::test]
async fn test_chat_streams_and_reports_usage_headers() {
    let app = seeded_app(Plan::Free).await;

    let response = app
        .router
        .clone()
        .oneshot(chat_request(Some("tok-1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-mentor-usage-messages-used")
            .unwrap(),
        "1"
    );
    assert_eq!(
        response
            .headers()
            .get("x-mentor-usage-message-limit")
            .unwrap(),
        "50"
    );
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let body = body_text(response).await;
    assert!(body.contains("what"));
    assert!(body.ends_with("data: [DONE]\n\n"));
}

#[tokio::test]
async fn test_chat_for_unknown_user_is_404() {
    // Session resolves, but the user document does not exist
    let app = test_app(Arc::new(MemoryUserStore::new()));

    let response = app
        .router
        .clone()
        .oneshot(chat_request(Some("tok-1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"], "USER_NOT_FOUND");
}

#[tokio::test]
async fn test_empty_messages_is_400_and_not_charged() {
    let app = seeded_app(Plan::Free).await;

    let response = app
        .router
        .clone()
        .oneshot(post_request("/v1/chat", "tok-1", json!({"messages": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let doc = app.store.fetch_user("user-1").await.unwrap().unwrap();
    assert_eq!(doc.usage.unwrap().messages_used, 0);
}

#[tokio::test]
async fn test_unverified_user_is_blocked_at_threshold_and_recovers() {
    let app = seeded_app(Plan::Free).await;

    // The first 12 messages go through
    for _ in 0..12 {
        let response = app
            .router
            .clone()
            .oneshot(chat_request(Some("tok-1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // Message 13 is refused with the verification denial
    let response = app
        .router
        .clone()
        .oneshot(chat_request(Some("tok-1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["error"], "EMAIL_VERIFICATION_REQUIRED");
    assert_eq!(body["messages_used"], 12);
    assert_eq!(body["threshold"], 12);

    // The refusal was not charged
    let doc = app.store.fetch_user("user-1").await.unwrap().unwrap();
    assert_eq!(doc.usage.unwrap().messages_used, 12);

    // Request a code, confirm it, and chat works again
    let response = app
        .router
        .clone()
        .oneshot(post_request("/v1/verification/request", "tok-1", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let code = app.mailer.last_code().expect("mailer captured a code");

    let response = app
        .router
        .clone()
        .oneshot(post_request(
            "/v1/verification/confirm",
            "tok-1",
            json!({"code": code}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .router
        .clone()
        .oneshot(chat_request(Some("tok-1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-mentor-usage-messages-used")
            .unwrap(),
        "13"
    );
}

#[tokio::test]
async fn test_plan_limit_denial() {
    let now = Utc::now();
    let store = Arc::new(MemoryUserStore::new());
    store.insert_document(UserDocument {
        id: "user-1".to_string(),
        email: "ada@example.com".to_string(),
        name: None,
        plan: Plan::Free,
        email_verified: Some(now),
        usage: Some(UsageWindow {
            messages_used: 50,
            message_limit: 50,
            reset_at: now + chrono::Duration::days(10),
        }),
        verification: Some(VerificationState::default()),
        created_at: now,
        updated_at: now,
    });
    let app = test_app(store);

    let response = app
        .router
        .clone()
        .oneshot(chat_request(Some("tok-1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["error"], "PLAN_LIMIT_REACHED");
    assert_eq!(body["plan"], "free");
    assert_eq!(body["messages_used"], 50);
    assert_eq!(body["message_limit"], 50);
}

#[tokio::test]
async fn test_verification_request_cooldown_is_429() {
    let app = seeded_app(Plan::Free).await;

    let response = app
        .router
        .clone()
        .oneshot(post_request("/v1/verification/request", "tok-1", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .router
        .clone()
        .oneshot(post_request("/v1/verification/request", "tok-1", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(response).await;
    assert_eq!(body["error"], "RATE_LIMITED");
    let retry_after = body["retry_after"].as_u64().unwrap();
    assert!(retry_after > 0 && retry_after <= 120);

    // Only one code was ever sent
    assert_eq!(app.mailer.codes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_confirm_failure_codes() {
    let app = seeded_app(Plan::Free).await;

    // Before any request
    let response = app
        .router
        .clone()
        .oneshot(post_request(
            "/v1/verification/confirm",
            "tok-1",
            json!({"code": "123456"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "NO_CODE_ISSUED");

    // Malformed code is rejected before any store lookup
    let response = app
        .router
        .clone()
        .oneshot(post_request(
            "/v1/verification/confirm",
            "tok-1",
            json!({"code": "12ab"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Wrong code after a request
    app.router
        .clone()
        .oneshot(post_request("/v1/verification/request", "tok-1", json!({})))
        .await
        .unwrap();
    let issued = app.mailer.last_code().unwrap();
    let wrong = if issued == "111111" { "222222" } else { "111111" };
    let response = app
        .router
        .clone()
        .oneshot(post_request(
            "/v1/verification/confirm",
            "tok-1",
            json!({"code": wrong}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "CODE_MISMATCH");
}

#[tokio::test]
async fn test_usage_report() {
    let app = seeded_app(Plan::Pro).await;

    for _ in 0..3 {
        app.router
            .clone()
            .oneshot(chat_request(Some("tok-1")))
            .await
            .unwrap();
    }

    let response = app
        .router
        .clone()
        .oneshot(get_request("/v1/usage", Some("tok-1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["plan"], "pro");
    assert_eq!(body["messages_used"], 3);
    assert_eq!(body["message_limit"], 1000);
    assert_eq!(body["remaining"], 997);
    assert_eq!(body["email_verified"], false);
    assert_eq!(body["verification_required"], false);
    assert_eq!(body["verification_threshold"], 12);
    assert!(body["reset_at"].is_string());
}

#[tokio::test]
async fn test_usage_report_reads_do_not_charge() {
    let app = seeded_app(Plan::Free).await;

    for _ in 0..5 {
        let response = app
            .router
            .clone()
            .oneshot(get_request("/v1/usage", Some("tok-1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let doc = app.store.fetch_user("user-1").await.unwrap().unwrap();
    assert_eq!(doc.usage.unwrap().messages_used, 0);
}
