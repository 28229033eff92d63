//! Entrega durable de webhooks.
//!
//! Barrido: (1) abanico de eventos de outbox a filas de entrega, (2) reclamo
//! de entregas vencidas con SKIP LOCKED, (3) POST firmado bajo el bulkhead
//! por host. 2xx marca DELIVERED; cualquier otro resultado reprograma con
//! backoff exponencial (base 1 min, tope 24 h) hasta agotar los intentos.
//! El consumidor debe ser idempotente sobre el event id del payload.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::entities::{DeliveryStatus, WebhookDelivery, WebhookSubscription};
use crate::domain::error::PaymentError;
use crate::domain::repository::WebhookRepository;
use crate::infrastructure::resilience::backoff::BackoffPolicy;
use crate::infrastructure::resilience::bulkhead::HostBulkhead;

type HmacSha256 = Hmac<Sha256>;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);
const SWEEP_BATCH: i64 = 100;

#[derive(Clone)]
pub struct WebhookDeliveryJob {
    webhooks: Arc<dyn WebhookRepository>,
    http: reqwest::Client,
    bulkhead: Arc<HostBulkhead>,
    backoff: BackoffPolicy,
    max_attempts: i32,
}

impl WebhookDeliveryJob {
    pub fn new(
        webhooks: Arc<dyn WebhookRepository>,
        bulkhead: Arc<HostBulkhead>,
        max_attempts: i32,
    ) -> Self {
        // Pool chico por host: un suscriptor lento no debe acaparar conexiones
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(2)
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .expect("failed to build webhook HTTP client");
        Self {
            webhooks,
            http,
            bulkhead,
            backoff: BackoffPolicy::webhook(),
            max_attempts,
        }
    }

    /// Loop del worker; corre hasta la señal de apagado.
    pub async fn run_loop(self: Arc<Self>, tick: Duration, cancel: CancellationToken) {
        info!("webhook delivery worker started");
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.run_once(&cancel).await {
                        error!("webhook sweep failed: {}", e);
                    }
                }
            }
        }
        info!("webhook delivery worker stopped");
    }

    /// Un barrido completo. Expuesto aparte del loop para poder probarlo.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<(), PaymentError> {
        let dispatched = self.webhooks.dispatch_pending_events(SWEEP_BATCH).await?;
        if dispatched > 0 {
            info!(dispatched, "outbox events fanned out to deliveries");
        }

        let due = self.webhooks.claim_due_deliveries(Utc::now(), SWEEP_BATCH).await?;
        if due.is_empty() {
            return Ok(());
        }

        let mut inflight = JoinSet::new();
        for delivery in due {
            let job = self.clone();
            let cancel = cancel.clone();
            inflight.spawn(async move { job.deliver_one(delivery, &cancel).await });
        }
        // Drenaje: el coordinador de apagado puede bloquear en este join
        while let Some(result) = inflight.join_next().await {
            if let Err(e) = result {
                error!("webhook delivery task panicked: {}", e);
            }
        }

        Ok(())
    }

    async fn deliver_one(&self, delivery: WebhookDelivery, cancel: &CancellationToken) {
        let subscription = match self.webhooks.find_subscription(delivery.subscription_id).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                warn!(delivery_id = %delivery.id, "subscription vanished, exhausting delivery");
                let dead = WebhookDelivery {
                    status: DeliveryStatus::EXHAUSTED,
                    ..delivery
                };
                let _ = self.webhooks.record_delivery_attempt(&dead).await;
                return;
            }
            Err(e) => {
                error!(delivery_id = %delivery.id, "failed to load subscription: {}", e);
                return;
            }
        };

        let host = host_of(&subscription.url);
        let _permit = match self.bulkhead.acquire(&host, cancel).await {
            Ok(permit) => permit,
            Err(PaymentError::Canceled) => return,
            Err(e) => {
                warn!(delivery_id = %delivery.id, "webhook bulkhead saturated: {}", e);
                return; // la entrega sigue reclamable en el próximo barrido
            }
        };

        let outcome = self.post(&subscription, &delivery, cancel).await;
        let updated = apply_attempt_outcome(
            delivery,
            outcome,
            Utc::now(),
            &self.backoff,
            self.max_attempts,
        );

        match updated.status {
            DeliveryStatus::DELIVERED => {
                info!(delivery_id = %updated.id, attempts = updated.attempts, "webhook delivered")
            }
            DeliveryStatus::EXHAUSTED => {
                warn!(delivery_id = %updated.id, attempts = updated.attempts, "webhook exhausted")
            }
            _ => {}
        }

        if let Err(e) = self.webhooks.record_delivery_attempt(&updated).await {
            error!(delivery_id = %updated.id, "failed to record delivery attempt: {}", e);
        }
    }

    async fn post(
        &self,
        subscription: &WebhookSubscription,
        delivery: &WebhookDelivery,
        cancel: &CancellationToken,
    ) -> Result<u16, String> {
        let body = serde_json::json!({
            "id": delivery.event_id,
            "type": delivery.event_type,
            "created_at": delivery.created_at,
            "merchant_id": subscription.merchant_id,
            "data": delivery.payload,
        })
        .to_string();

        let timestamp = Utc::now().timestamp();
        let signature = sign_payload(&subscription.signing_key, timestamp, &body)
            .map_err(|e| e.to_string())?;

        let request = self
            .http
            .post(&subscription.url)
            .header("Content-Type", "application/json")
            .header("X-Delivery-Id", delivery.id.to_string())
            .header("X-Timestamp", timestamp.to_string())
            .header("Signature", format!("sha256={}", signature))
            .body(body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err("canceled".to_string()),
            result = request => result.map_err(|e| e.to_string())?,
        };

        Ok(response.status().as_u16())
    }
}

/// Firma del payload: HMAC-SHA256 sobre `timestamp.body` con la clave de la
/// suscripción, en hex.
pub fn sign_payload(key: &str, timestamp: i64, body: &str) -> Result<String, PaymentError> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|_| PaymentError::Internal("invalid webhook signing key".into()))?;
    mac.update(format!("{}.{}", timestamp, body).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Aplica el resultado de un intento a la fila de entrega. Puro, para poder
/// verificar el cronograma (monotonía, tope, agotamiento) sin red.
pub fn apply_attempt_outcome(
    mut delivery: WebhookDelivery,
    outcome: Result<u16, String>,
    now: DateTime<Utc>,
    backoff: &BackoffPolicy,
    max_attempts: i32,
) -> WebhookDelivery {
    delivery.attempts += 1;
    delivery.updated_at = now;

    match outcome {
        Ok(status) if (200..300).contains(&(status as i32)) => {
            delivery.status = DeliveryStatus::DELIVERED;
            delivery.last_response_status = Some(status as i32);
            delivery.last_error = None;
        }
        Ok(status) => {
            delivery.last_response_status = Some(status as i32);
            delivery.last_error = Some(format!("subscriber returned {}", status));
            schedule_retry(&mut delivery, now, backoff, max_attempts);
        }
        Err(error) => {
            delivery.last_response_status = None;
            delivery.last_error = Some(error);
            schedule_retry(&mut delivery, now, backoff, max_attempts);
        }
    }

    delivery
}

fn schedule_retry(
    delivery: &mut WebhookDelivery,
    now: DateTime<Utc>,
    backoff: &BackoffPolicy,
    max_attempts: i32,
) {
    if delivery.attempts >= max_attempts {
        delivery.status = DeliveryStatus::EXHAUSTED;
        return;
    }
    delivery.status = DeliveryStatus::FAILED;
    let wait = backoff.delay(delivery.attempts.saturating_sub(1) as u32);
    delivery.next_attempt_at =
        now + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::hours(24));
}

fn host_of(url: &str) -> String {
    url.trim_start_matches("https://")
        .trim_start_matches("http://")
        .split(['/', ':'])
        .next()
        .unwrap_or("unknown")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn delivery() -> WebhookDelivery {
        let now = Utc::now();
        WebhookDelivery {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            event_type: "transaction.approved".to_string(),
            payload: serde_json::json!({"transaction_id": Uuid::new_v4()}),
            status: DeliveryStatus::PENDING,
            attempts: 0,
            next_attempt_at: now,
            last_response_status: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::webhook()
        }
    }

    #[test]
    fn signature_is_deterministic_and_key_bound() {
        let a = sign_payload("whsec_1", 1700000000, "{\"x\":1}").unwrap();
        let b = sign_payload("whsec_1", 1700000000, "{\"x\":1}").unwrap();
        let c = sign_payload("whsec_2", 1700000000, "{\"x\":1}").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn success_marks_delivered() {
        let updated =
            apply_attempt_outcome(delivery(), Ok(204), Utc::now(), &no_jitter(), 12);
        assert_eq!(updated.status, DeliveryStatus::DELIVERED);
        assert_eq!(updated.attempts, 1);
        assert_eq!(updated.last_response_status, Some(204));
    }

    #[test]
    fn retry_schedule_is_strictly_increasing_and_capped() {
        let backoff = no_jitter();
        let now = Utc::now();
        let mut current = delivery();
        let mut previous_next = now;

        for attempt in 1..=11 {
            current = apply_attempt_outcome(current, Ok(500), now, &backoff, 12);
            assert_eq!(current.status, DeliveryStatus::FAILED, "attempt {}", attempt);
            assert!(current.next_attempt_at > previous_next || attempt == 11);
            assert!(current.next_attempt_at <= now + chrono::Duration::hours(24));
            previous_next = current.next_attempt_at;
        }
    }

    #[test]
    fn delivery_is_exhausted_after_max_attempts() {
        let backoff = no_jitter();
        let now = Utc::now();
        let mut current = delivery();
        for _ in 0..12 {
            current = apply_attempt_outcome(current, Err("connect refused".into()), now, &backoff, 12);
        }
        assert_eq!(current.status, DeliveryStatus::EXHAUSTED);
        assert_eq!(current.attempts, 12);
    }

    #[test]
    fn network_error_keeps_the_error_message() {
        let updated = apply_attempt_outcome(
            delivery(),
            Err("dns failure".into()),
            Utc::now(),
            &no_jitter(),
            12,
        );
        assert_eq!(updated.status, DeliveryStatus::FAILED);
        assert_eq!(updated.last_error.as_deref(), Some("dns failure"));
    }

    #[test]
    fn host_extraction_handles_ports_and_paths() {
        assert_eq!(host_of("https://api.shop.test/hooks/1"), "api.shop.test");
        assert_eq!(host_of("http://localhost:8080/hook"), "localhost");
    }
}
