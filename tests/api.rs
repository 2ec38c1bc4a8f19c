//! Router-level tests. These exercise the HTTP surface up to the first
//! database access, so they run without a live Postgres (the pool is lazy).

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use sha2::Sha256;
use sqlx::postgres::PgPoolOptions;
use tower::util::ServiceExt;

use tessera_server::config::Config;
use tessera_server::handlers::webhooks::SIGNATURE_HEADER;
use tessera_server::routes::{create_routes, AppState};

const WEBHOOK_SECRET: &str = "whsec_test123";

fn test_config() -> Config {
    Config {
        database_url: "postgres://localhost/tessera_test".to_string(),
        bind_port: 0,
        jwt_secret: "test-jwt-secret".to_string(),
        webhook_secret: WEBHOOK_SECRET.to_string(),
        provider_base_url: "http://localhost:9".to_string(),
        provider_secret_key: "sk_test".to_string(),
    }
}

fn test_app() -> Router {
    let config = test_config();
    let pool = PgPoolOptions::new()
        .connect_lazy(&config.database_url)
        .expect("valid database url");
    create_routes(AppState::new(pool, config))
}

fn sign(payload: &[u8], secret: &str) -> String {
    let timestamp = chrono::Utc::now().timestamp();
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(payload);
    format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    )
}

#[tokio::test]
async fn health_returns_ok() {
    let response = test_app()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["data"]["service"], "tessera-api");
}

#[tokio::test]
async fn responses_carry_security_headers() {
    let response = test_app()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(
        response.headers().get("X-Content-Type-Options").unwrap(),
        "nosniff"
    );
    assert_eq!(response.headers().get("X-Frame-Options").unwrap(), "DENY");
}

#[tokio::test]
async fn webhook_without_signature_is_rejected() {
    let response = test_app()
        .oneshot(
            Request::post("/payments/webhook")
                .body(Body::from(r#"{"id":"evt_1","type":"x","data":{"object":{"id":"pi"}}}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn webhook_with_wrong_secret_is_rejected() {
    let payload = br#"{"id":"evt_1","type":"payment_intent.succeeded","data":{"object":{"id":"pi"}}}"#;
    let response = test_app()
        .oneshot(
            Request::post("/payments/webhook")
                .header(SIGNATURE_HEADER, sign(payload, "wrong_secret"))
                .body(Body::from(payload.as_slice()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn webhook_acknowledges_unhandled_event_type() {
    // Validly signed but an event type the state machine does not handle:
    // must be acknowledged with 200 so the provider stops retrying.
    let payload = br#"{"id":"evt_2","type":"charge.updated","data":{"object":{"id":"pi_9"}}}"#;
    let response = test_app()
        .oneshot(
            Request::post("/payments/webhook")
                .header(SIGNATURE_HEADER, sign(payload, WEBHOOK_SECRET))
                .body(Body::from(payload.as_slice()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn webhook_acknowledges_signed_but_unparseable_body() {
    let payload = b"not json";
    let response = test_app()
        .oneshot(
            Request::post("/payments/webhook")
                .header(SIGNATURE_HEADER, sign(payload, WEBHOOK_SECRET))
                .body(Body::from(payload.as_slice()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn registration_with_no_participants_fails_fast() {
    let body = serde_json::json!({
        "eventId": uuid::Uuid::new_v4(),
        "tickets": [],
        "participants": [],
    });

    let response = test_app()
        .oneshot(
            Request::post("/registrations")
                .header(header::CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn registration_with_zero_quantity_line_fails_fast() {
    let body = serde_json::json!({
        "eventId": uuid::Uuid::new_v4(),
        "tickets": [{ "ticketTypeId": uuid::Uuid::new_v4(), "quantity": 0 }],
        "participants": [{
            "ticketTypeId": null,
            "email": "ada@example.com",
            "firstName": "Ada",
            "lastName": "Lovelace",
        }],
    });

    let response = test_app()
        .oneshot(
            Request::post("/registrations")
                .header(header::CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn garbage_bearer_token_is_unauthorized() {
    let body = serde_json::json!({
        "registrationId": uuid::Uuid::new_v4(),
    });

    let response = test_app()
        .oneshot(
            Request::post("/payments/create-intent")
                .header(header::AUTHORIZATION, "Bearer not-a-jwt")
                .header(header::CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
