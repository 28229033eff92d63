//! CRUD de suscripciones salientes de webhooks de un comercio.

use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::domain::entities::WebhookSubscription;
use crate::domain::error::PaymentError;
use crate::domain::repository::WebhookRepository;

#[derive(Debug, Clone)]
pub struct UpsertWebhookSubscriptionRequest {
    pub merchant_id: Uuid,
    pub url: String,
    /// Clave HMAC del suscriptor; si falta se genera una.
    pub signing_key: Option<String>,
    pub event_types: Vec<String>,
    pub active: bool,
}

pub struct WebhookSubscriptionsUseCase {
    webhooks: Arc<dyn WebhookRepository>,
}

impl WebhookSubscriptionsUseCase {
    pub fn new(webhooks: Arc<dyn WebhookRepository>) -> Self {
        Self { webhooks }
    }

    pub async fn create(
        &self,
        request: UpsertWebhookSubscriptionRequest,
    ) -> Result<WebhookSubscription, PaymentError> {
        validate_url(&request.url)?;

        let now = Utc::now();
        let subscription = WebhookSubscription {
            id: Uuid::new_v4(),
            merchant_id: request.merchant_id,
            url: request.url,
            signing_key: request
                .signing_key
                .unwrap_or_else(|| format!("whsec_{}", Uuid::new_v4().simple())),
            event_types: request.event_types,
            active: request.active,
            created_at: now,
            updated_at: now,
        };
        let saved = self.webhooks.save_subscription(subscription).await?;
        info!(subscription_id = %saved.id, url = %saved.url, "webhook subscription created");
        Ok(saved)
    }

    pub async fn get(
        &self,
        id: Uuid,
        merchant_id: Uuid,
    ) -> Result<WebhookSubscription, PaymentError> {
        self.webhooks
            .find_subscription(id)
            .await?
            .filter(|s| s.merchant_id == merchant_id)
            .ok_or(PaymentError::NotFound(id))
    }

    pub async fn list(&self, merchant_id: Uuid) -> Result<Vec<WebhookSubscription>, PaymentError> {
        self.webhooks.list_subscriptions(merchant_id).await
    }

    pub async fn update(
        &self,
        id: Uuid,
        request: UpsertWebhookSubscriptionRequest,
    ) -> Result<WebhookSubscription, PaymentError> {
        validate_url(&request.url)?;

        let mut subscription = self.get(id, request.merchant_id).await?;
        subscription.url = request.url;
        if let Some(key) = request.signing_key {
            subscription.signing_key = key;
        }
        subscription.event_types = request.event_types;
        subscription.active = request.active;
        self.webhooks.update_subscription(subscription).await
    }

    pub async fn delete(&self, id: Uuid, merchant_id: Uuid) -> Result<(), PaymentError> {
        self.webhooks.delete_subscription(id, merchant_id).await
    }
}

fn validate_url(url: &str) -> Result<(), PaymentError> {
    if !url.starts_with("https://") && !url.starts_with("http://") {
        return Err(PaymentError::Validation(
            "webhook url must be an absolute http(s) URL".to_string(),
        ));
    }
    Ok(())
}
