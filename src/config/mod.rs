use std::env;

pub mod cors;
pub mod security;

pub use cors::create_cors_layer;
pub use security::security_headers;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_port: u16,
    pub jwt_secret: String,
    pub webhook_secret: String,
    pub provider_base_url: String,
    pub provider_secret_key: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/tessera".to_string()),
            bind_port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3001),
            jwt_secret: env::var("JWT_SECRET").unwrap_or_else(|_| "dev-jwt-secret".to_string()),
            webhook_secret: env::var("PAYMENT_WEBHOOK_SECRET")
                .unwrap_or_else(|_| "whsec_dev".to_string()),
            provider_base_url: env::var("PAYMENT_PROVIDER_URL")
                .unwrap_or_else(|_| "https://api.payments.example.com".to_string()),
            provider_secret_key: env::var("PAYMENT_PROVIDER_SECRET_KEY")
                .unwrap_or_else(|_| "sk_test_dev".to_string()),
        }
    }
}
