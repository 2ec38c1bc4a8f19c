//! Thin client for the payment provider's intent API. Callers must invoke
//! these methods outside any open database transaction; provider latency
//! must never hold row locks.

use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::config::Config;
use crate::utils::error::AppError;

pub const INTENT_STATUS_SUCCEEDED: &str = "succeeded";

#[derive(Clone)]
pub struct PaymentProvider {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderIntent {
    pub id: String,
    pub client_secret: String,
    pub status: String,
}

impl PaymentProvider {
    pub fn new(base_url: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            secret_key: secret_key.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.provider_base_url, &config.provider_secret_key)
    }

    pub async fn create_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        purchase_id: Uuid,
    ) -> Result<ProviderIntent, AppError> {
        let response = self
            .http
            .post(format!("{}/v1/payment_intents", self.base_url))
            .bearer_auth(&self.secret_key)
            .json(&json!({
                "amount": amount_minor,
                "currency": currency,
                "metadata": { "purchase_id": purchase_id },
            }))
            .send()
            .await
            .map_err(|e| AppError::ExternalServiceError(format!("create intent failed: {e}")))?;

        Self::parse_intent(response).await
    }

    pub async fn get_intent(&self, intent_id: &str) -> Result<ProviderIntent, AppError> {
        let response = self
            .http
            .get(format!("{}/v1/payment_intents/{intent_id}", self.base_url))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| AppError::ExternalServiceError(format!("get intent failed: {e}")))?;

        Self::parse_intent(response).await
    }

    async fn parse_intent(response: reqwest::Response) -> Result<ProviderIntent, AppError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(%status, %body, "Payment provider rejected the request");
            return Err(AppError::ExternalServiceError(format!(
                "provider returned {status}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::ExternalServiceError(format!("malformed provider reply: {e}")))
    }
}
