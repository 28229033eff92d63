//! Sweep de facturación de suscripciones.
//!
//! Cada tick reclama las suscripciones activas vencidas (SKIP LOCKED) y
//! dispara un SALE por el core con una clave de idempotencia DERIVADA de
//! (subscription_id, inicio del período): dos réplicas del sweep, o un
//! reintento tras un crash, producen una sola transacción por período.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::entities::{
    SubscriptionStatus, TransactionStatus, WebhookEvent, event_types,
};
use crate::domain::error::PaymentError;
use crate::domain::repository::{SubscriptionRepository, WebhookRepository};
use crate::use_cases::process_payment::{PaymentRequest, ProcessPaymentUseCase};

const SWEEP_BATCH: i64 = 50;

pub struct SubscriptionBillingJob {
    subscriptions: Arc<dyn SubscriptionRepository>,
    webhooks: Arc<dyn WebhookRepository>,
    payments: Arc<ProcessPaymentUseCase>,
    failure_threshold: i32,
}

impl SubscriptionBillingJob {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepository>,
        webhooks: Arc<dyn WebhookRepository>,
        payments: Arc<ProcessPaymentUseCase>,
        failure_threshold: i32,
    ) -> Self {
        Self {
            subscriptions,
            webhooks,
            payments,
            failure_threshold,
        }
    }

    pub async fn run_loop(self: Arc<Self>, tick: Duration, cancel: CancellationToken) {
        info!("subscription billing worker started");
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.run_once(&cancel).await {
                        error!("billing sweep failed: {}", e);
                    }
                }
            }
        }
        info!("subscription billing worker stopped");
    }

    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<(), PaymentError> {
        let due = self.subscriptions.claim_due(Utc::now(), SWEEP_BATCH).await?;
        if due.is_empty() {
            return Ok(());
        }
        info!(count = due.len(), "billing due subscriptions");

        for subscription in due {
            if cancel.is_cancelled() {
                return Err(PaymentError::Canceled);
            }

            let period_start = subscription.next_billing_at;
            let request = PaymentRequest {
                transaction_id: subscription.billing_idempotency_key(period_start),
                merchant_id: subscription.merchant_id,
                customer_id: Some(subscription.customer_id),
                payment_method_id: subscription.payment_method_id,
                subscription_id: Some(subscription.id),
                amount_cents: subscription.amount_cents,
                currency: subscription.currency.clone(),
            };

            let mut subscription = subscription;
            match self.payments.sale(request, cancel).await {
                Ok(transaction) => {
                    subscription.next_billing_at =
                        subscription.next_period_after(period_start);
                    if transaction.status == TransactionStatus::APPROVED {
                        subscription.consecutive_failures = 0;
                    } else {
                        subscription.consecutive_failures += 1;
                        warn!(
                            subscription_id = %subscription.id,
                            failures = subscription.consecutive_failures,
                            "subscription charge declined"
                        );
                        if subscription.consecutive_failures >= self.failure_threshold {
                            subscription.status = SubscriptionStatus::PAST_DUE;
                            let event = WebhookEvent {
                                id: uuid::Uuid::new_v4(),
                                event_type: event_types::SUBSCRIPTION_PAST_DUE.to_string(),
                                merchant_id: subscription.merchant_id,
                                created_at: Utc::now(),
                                data: serde_json::json!({
                                    "subscription_id": subscription.id,
                                    "consecutive_failures": subscription.consecutive_failures,
                                }),
                            };
                            if let Err(e) = self.webhooks.insert_event(&event).await {
                                error!(
                                    subscription_id = %subscription.id,
                                    "failed to enqueue past_due event: {}",
                                    e
                                );
                            }
                        }
                    }
                    if let Err(e) = self.subscriptions.update(subscription).await {
                        error!("failed to advance subscription after charge: {}", e);
                    }
                }
                Err(PaymentError::Canceled) => return Err(PaymentError::Canceled),
                Err(e) => {
                    // Sin fila escrita (breaker/overload/transitorio agotado):
                    // no avanzamos el período; el próximo tick reintenta con
                    // la MISMA clave derivada
                    warn!(subscription_id = %subscription.id, "charge attempt errored: {}", e);
                }
            }
        }

        Ok(())
    }
}
