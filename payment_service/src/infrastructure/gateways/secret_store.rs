//! Cliente HTTP del secret store externo que custodia los MAC secrets.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::error;

use crate::domain::error::PaymentError;
use crate::domain::gateways::SecretStore;

#[derive(Deserialize)]
struct SecretPayload {
    value: String,
}

pub struct HttpSecretStore {
    http: reqwest::Client,
    base_url: String,
}

impl HttpSecretStore {
    pub fn new(base_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build secret store HTTP client");
        Self { http, base_url }
    }
}

#[async_trait]
impl SecretStore for HttpSecretStore {
    async fn fetch_mac_secret(&self, secret_ref: &str) -> Result<String, PaymentError> {
        let url = format!("{}/secrets/{}", self.base_url.trim_end_matches('/'), secret_ref);

        let response = self.http.get(&url).send().await.map_err(|e| {
            error!(secret_ref, "secret store unreachable: {}", e);
            PaymentError::SecretStore(format!("secret store unreachable: {}", e))
        })?;

        if !response.status().is_success() {
            return Err(PaymentError::SecretStore(format!(
                "secret store returned {} for {}",
                response.status(),
                secret_ref
            )));
        }

        let payload: SecretPayload = response
            .json()
            .await
            .map_err(|e| PaymentError::SecretStore(format!("bad secret payload: {}", e)))?;

        Ok(payload.value)
    }
}
