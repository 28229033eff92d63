//! Sweep de verificación ACH.
//!
//! Promueve métodos ACH pendientes consultando el resultado del pre-note en
//! el gateway, una vez pasada la ventana de 3 días. La consulta de candidatos
//! se apoya en el índice parcial de payment_methods.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::entities::{event_types, VerificationStatus, WebhookEvent};
use crate::domain::error::PaymentError;
use crate::domain::gateways::{CardGateway, PrenoteOutcome};
use crate::domain::repository::{PaymentMethodRepository, WebhookRepository};
use crate::infrastructure::credentials::CredentialResolver;

const SWEEP_BATCH: i64 = 100;
const PRENOTE_WINDOW_DAYS: i64 = 3;

pub struct AchVerificationJob {
    payment_methods: Arc<dyn PaymentMethodRepository>,
    webhooks: Arc<dyn WebhookRepository>,
    credentials: Arc<CredentialResolver>,
    gateway: Arc<dyn CardGateway>,
}

impl AchVerificationJob {
    pub fn new(
        payment_methods: Arc<dyn PaymentMethodRepository>,
        webhooks: Arc<dyn WebhookRepository>,
        credentials: Arc<CredentialResolver>,
        gateway: Arc<dyn CardGateway>,
    ) -> Self {
        Self {
            payment_methods,
            webhooks,
            credentials,
            gateway,
        }
    }

    pub async fn run_loop(self: Arc<Self>, tick: Duration, cancel: CancellationToken) {
        info!("ACH verification worker started");
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.run_once(&cancel).await {
                        error!("ACH verification sweep failed: {}", e);
                    }
                }
            }
        }
        info!("ACH verification worker stopped");
    }

    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<(), PaymentError> {
        let cutoff = Utc::now() - ChronoDuration::days(PRENOTE_WINDOW_DAYS);
        let pending = self
            .payment_methods
            .find_pending_ach_older_than(cutoff, SWEEP_BATCH)
            .await?;
        if pending.is_empty() {
            return Ok(());
        }
        info!(count = pending.len(), "checking pending ACH pre-notes");

        for method in pending {
            if cancel.is_cancelled() {
                return Err(PaymentError::Canceled);
            }

            let resolved = match self.credentials.get(method.merchant_id).await {
                Ok(r) => r,
                Err(e) => {
                    error!(payment_method_id = %method.id, "credential resolution failed: {}", e);
                    continue;
                }
            };

            match self
                .gateway
                .prenote_status(&resolved.credentials, &method.reuse_token, cancel)
                .await
            {
                Ok(PrenoteOutcome::Verified) => {
                    match self
                        .payment_methods
                        .set_verification(method.id, VerificationStatus::VERIFIED, None)
                        .await
                    {
                        Ok(updated) => {
                            info!(payment_method_id = %updated.id, "ACH method verified");
                            self.emit(event_types::PAYMENT_METHOD_VERIFIED, &updated, None)
                                .await;
                        }
                        Err(e) => error!(
                            payment_method_id = %method.id,
                            "failed to persist verification: {}", e
                        ),
                    }
                }
                Ok(PrenoteOutcome::Failed { reason_code }) => {
                    match self
                        .payment_methods
                        .set_verification(
                            method.id,
                            VerificationStatus::FAILED,
                            Some(reason_code.clone()),
                        )
                        .await
                    {
                        Ok(updated) => {
                            warn!(
                                payment_method_id = %updated.id,
                                reason = %reason_code,
                                "ACH pre-note failed, method is permanently unusable"
                            );
                            self.emit(
                                event_types::PAYMENT_METHOD_FAILED,
                                &updated,
                                Some(reason_code),
                            )
                            .await;
                        }
                        Err(e) => error!(
                            payment_method_id = %method.id,
                            "failed to persist verification failure: {}", e
                        ),
                    }
                }
                // El pre-note sigue en tránsito; se reintenta el próximo tick
                Ok(PrenoteOutcome::Pending) => {}
                Err(PaymentError::Canceled) => return Err(PaymentError::Canceled),
                Err(e) => {
                    warn!(payment_method_id = %method.id, "pre-note lookup failed: {}", e);
                }
            }
        }

        Ok(())
    }

    async fn emit(
        &self,
        event_type: &str,
        method: &crate::domain::entities::PaymentMethod,
        reason_code: Option<String>,
    ) {
        let event = WebhookEvent {
            id: uuid::Uuid::new_v4(),
            event_type: event_type.to_string(),
            merchant_id: method.merchant_id,
            created_at: Utc::now(),
            data: serde_json::json!({
                "payment_method_id": method.id,
                "verification_status": method.verification_status,
                "failure_code": reason_code,
            }),
        };
        if let Err(e) = self.webhooks.insert_event(&event).await {
            error!(payment_method_id = %method.id, "failed to enqueue event: {}", e);
        }
    }
}
