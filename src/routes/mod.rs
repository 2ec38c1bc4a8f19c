use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::{create_cors_layer, security_headers, Config};
use crate::handlers::{self, payments, registrations, webhooks};
use crate::services::provider::PaymentProvider;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub provider: PaymentProvider,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let provider = PaymentProvider::from_config(&config);
        Self {
            pool,
            config: Arc::new(config),
            provider,
        }
    }
}

pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/registrations", post(registrations::create))
        .route("/registrations/:id", get(registrations::show))
        .route("/registrations/:id/cancel", post(registrations::cancel))
        .route("/payments/create-intent", post(payments::create_intent))
        .route("/payments/webhook", post(webhooks::receive))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(security_headers))
        .layer(create_cors_layer())
        .with_state(state)
}
