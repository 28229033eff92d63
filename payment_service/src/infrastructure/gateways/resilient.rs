//! Envoltura de resiliencia del gateway: circuit breaker + bulkhead +
//! reintentos clasificados con backoff cancelable.
//!
//! Reglas de reintento: solo los errores transitorios se reintentan, siempre
//! con el MISMO transaction_id para que el gateway deduplique. Agotados los
//! intentos, el transitorio se degrada a GatewayRejected. `CircuitOpen` se
//! decide antes del primer intento; una vez hecho contacto upstream la
//! operación corre hasta su resultado.

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::domain::error::PaymentError;
use crate::domain::gateways::{
    CardGateway, GatewayCredentials, GatewayResponse, KeyExchangeRequest, PrenoteOutcome,
    ServerPostRequest, TacGrant,
};
use crate::infrastructure::resilience::backoff::{cancellable_delay, BackoffPolicy};
use crate::infrastructure::resilience::bulkhead::Bulkhead;
use crate::infrastructure::resilience::circuit_breaker::CircuitBreaker;

/// Espera máxima por un slot del bulkhead antes de fallar rápido.
const BULKHEAD_WAIT: Duration = Duration::from_secs(2);

pub struct ResilientGateway {
    inner: Arc<dyn CardGateway>,
    breaker: Arc<CircuitBreaker>,
    bulkhead: Bulkhead,
    max_attempts: u32,
    backoff: BackoffPolicy,
}

impl ResilientGateway {
    pub fn new(
        inner: Arc<dyn CardGateway>,
        breaker: Arc<CircuitBreaker>,
        bulkhead: Bulkhead,
        max_attempts: u32,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            inner,
            breaker,
            bulkhead,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    async fn with_envelope<'a, T>(
        &'a self,
        cancel: &'a CancellationToken,
        mut call: impl FnMut() -> Pin<Box<dyn Future<Output = Result<T, PaymentError>> + Send + 'a>>,
    ) -> Result<T, PaymentError> {
        // Abierto => sin contacto upstream y sin fila persistida.
        self.breaker.try_acquire()?;
        let _permit = self.bulkhead.acquire_within(BULKHEAD_WAIT, cancel).await?;

        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(PaymentError::Canceled);
            }

            match call().await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(err) if err.is_transient() => {
                    self.breaker.record_failure();
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(PaymentError::GatewayRejected(format!(
                            "gateway retries exhausted after {} attempts: {}",
                            attempt, err
                        )));
                    }
                    warn!(attempt, error = %err, "transient gateway error, backing off");
                    cancellable_delay(self.backoff.delay(attempt - 1), cancel).await?;
                }
                Err(err @ PaymentError::GatewayRejected(_)) => {
                    // Rechazo de protocolo: la request es inválida, no el upstream.
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl CardGateway for ResilientGateway {
    async fn key_exchange(
        &self,
        credentials: &GatewayCredentials,
        request: &KeyExchangeRequest,
        cancel: &CancellationToken,
    ) -> Result<TacGrant, PaymentError> {
        self.with_envelope(cancel, || {
            Box::pin(self.inner.key_exchange(credentials, request, cancel))
        })
        .await
    }

    async fn server_post(
        &self,
        credentials: &GatewayCredentials,
        request: &ServerPostRequest,
        cancel: &CancellationToken,
    ) -> Result<GatewayResponse, PaymentError> {
        self.with_envelope(cancel, || {
            Box::pin(self.inner.server_post(credentials, request, cancel))
        })
        .await
    }

    async fn prenote_status(
        &self,
        credentials: &GatewayCredentials,
        reuse_token: &str,
        cancel: &CancellationToken,
    ) -> Result<PrenoteOutcome, PaymentError> {
        self.with_envelope(cancel, || {
            Box::pin(self.inner.prenote_status(credentials, reuse_token, cancel))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::gateways::GatewayTranGroup;
    use crate::infrastructure::resilience::circuit_breaker::BreakerConfig;
    use mockall::mock;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    mock! {
        pub CardGatewayImpl {}

        #[async_trait]
        impl CardGateway for CardGatewayImpl {
            async fn key_exchange(
                &self,
                credentials: &GatewayCredentials,
                request: &KeyExchangeRequest,
                cancel: &CancellationToken,
            ) -> Result<TacGrant, PaymentError>;
            async fn server_post(
                &self,
                credentials: &GatewayCredentials,
                request: &ServerPostRequest,
                cancel: &CancellationToken,
            ) -> Result<GatewayResponse, PaymentError>;
            async fn prenote_status(
                &self,
                credentials: &GatewayCredentials,
                reuse_token: &str,
                cancel: &CancellationToken,
            ) -> Result<PrenoteOutcome, PaymentError>;
        }
    }

    fn credentials() -> GatewayCredentials {
        GatewayCredentials {
            cust_nbr: "1000".into(),
            merch_nbr: "2000".into(),
            dba_nbr: "1".into(),
            terminal_nbr: "3".into(),
            mac_secret: "secret".into(),
        }
    }

    fn server_post_request() -> ServerPostRequest {
        ServerPostRequest {
            transaction_id: Uuid::new_v4(),
            tran_group: GatewayTranGroup::Sale,
            amount_cents: 2999,
            currency: "USD".into(),
            reuse_token: Some("BRIC-1".into()),
            parent_gateway_ref: None,
        }
    }

    fn approved_response() -> GatewayResponse {
        GatewayResponse {
            approved: true,
            response_code: "00".into(),
            response_text: Some("APPROVED".into()),
            authorization_code: Some("123456".into()),
            gateway_ref: Some("GUID-1".into()),
            card_brand: None,
            masked_account: None,
        }
    }

    fn resilient(inner: MockCardGatewayImpl) -> ResilientGateway {
        ResilientGateway::new(
            Arc::new(inner),
            Arc::new(CircuitBreaker::new("test", BreakerConfig::default())),
            Bulkhead::new(10),
            3,
            BackoffPolicy {
                base: Duration::from_millis(10),
                multiplier: 2.0,
                cap: Duration::from_millis(100),
                jitter: 0.0,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_is_retried_with_same_request() {
        let mut inner = MockCardGatewayImpl::new();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        inner.expect_server_post().times(2).returning(move |_, req, _| {
            // Todos los intentos comparten el mismo TRAN_NBR
            assert_eq!(req.amount_cents, 2999);
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(PaymentError::Transient("connection reset".into()))
            } else {
                Ok(approved_response())
            }
        });

        let gateway = resilient(inner);
        let cancel = CancellationToken::new();
        let response = gateway
            .server_post(&credentials(), &server_post_request(), &cancel)
            .await
            .unwrap();
        assert!(response.approved);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_degrade_to_rejected() {
        let mut inner = MockCardGatewayImpl::new();
        inner
            .expect_server_post()
            .times(3)
            .returning(|_, _, _| Err(PaymentError::Transient("timeout".into())));

        let gateway = resilient(inner);
        let cancel = CancellationToken::new();
        let err = gateway
            .server_post(&credentials(), &server_post_request(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::GatewayRejected(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_short_circuits_without_upstream_contact() {
        let mut inner = MockCardGatewayImpl::new();
        inner.expect_server_post().never();

        let breaker = Arc::new(CircuitBreaker::new("test", BreakerConfig::default()));
        for _ in 0..5 {
            breaker.record_failure();
        }

        let gateway = ResilientGateway::new(
            Arc::new(inner),
            breaker,
            Bulkhead::new(10),
            3,
            BackoffPolicy::gateway(Duration::from_millis(10)),
        );
        let cancel = CancellationToken::new();
        let err = gateway
            .server_post(&credentials(), &server_post_request(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, PaymentError::CircuitOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn declined_response_is_success_for_the_breaker() {
        let mut inner = MockCardGatewayImpl::new();
        inner.expect_server_post().times(6).returning(|_, _, _| {
            Ok(GatewayResponse {
                approved: false,
                response_code: "05".into(),
                response_text: Some("DO NOT HONOR".into()),
                authorization_code: None,
                gateway_ref: None,
                card_brand: None,
                masked_account: None,
            })
        });

        let gateway = resilient(inner);
        let cancel = CancellationToken::new();
        // Seis declines seguidos no abren el circuito
        for _ in 0..6 {
            let response = gateway
                .server_post(&credentials(), &server_post_request(), &cancel)
                .await
                .unwrap();
            assert!(!response.approved);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_returns_canceled() {
        let mut inner = MockCardGatewayImpl::new();
        inner
            .expect_server_post()
            .times(1)
            .returning(|_, _, _| Err(PaymentError::Transient("timeout".into())));

        let gateway = ResilientGateway::new(
            Arc::new(inner),
            Arc::new(CircuitBreaker::new("test", BreakerConfig::default())),
            Bulkhead::new(10),
            3,
            BackoffPolicy {
                base: Duration::from_secs(3600),
                multiplier: 2.0,
                cap: Duration::from_secs(3600),
                jitter: 0.0,
            },
        );

        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let handle = tokio::spawn(async move {
            gateway
                .server_post(&credentials(), &server_post_request(), &child)
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err, PaymentError::Canceled);
    }
}
