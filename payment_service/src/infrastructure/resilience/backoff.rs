//! Backoff exponencial con jitter y esperas cancelables.
//!
//! Ninguna espera de este módulo es un sleep incondicional: todas compiten
//! con la señal de cancelación en un `select!`.

use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::domain::error::PaymentError;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    /// Jitter simétrico: el delay final se multiplica por uniform(1-j, 1+j).
    pub jitter: f64,
}

impl BackoffPolicy {
    /// Política entre reintentos al gateway: 100 ms x2, tope 30 s, jitter 10%.
    pub fn gateway(base: Duration) -> Self {
        Self {
            base,
            multiplier: 2.0,
            cap: Duration::from_secs(30),
            jitter: 0.1,
        }
    }

    /// Política de reintentos de webhooks: 1 min x2, tope 24 h, jitter 10%.
    pub fn webhook() -> Self {
        Self {
            base: Duration::from_secs(60),
            multiplier: 2.0,
            cap: Duration::from_secs(24 * 60 * 60),
            jitter: 0.1,
        }
    }

    /// delay(attempt) = min(cap, base * multiplier^attempt) * uniform(1-j, 1+j).
    /// `attempt` cuenta desde 0 (la espera previa al segundo intento).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.min(63) as i32);
        let raw = self.base.as_secs_f64() * exp;
        let capped = raw.min(self.cap.as_secs_f64());
        let factor = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * factor)
    }
}

/// Espera `delay` o retorna `Canceled` apenas se dispare la señal.
pub async fn cancellable_delay(
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), PaymentError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(PaymentError::Canceled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_within_jitter() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            cap: Duration::from_secs(30),
            jitter: 0.1,
        };
        for attempt in 0..5u32 {
            let expected = 100.0 * 2.0f64.powi(attempt as i32);
            let d = policy.delay(attempt).as_secs_f64() * 1000.0;
            assert!(d >= expected * 0.9 - 1.0, "attempt {attempt}: {d} < min");
            assert!(d <= expected * 1.1 + 1.0, "attempt {attempt}: {d} > max");
        }
    }

    #[test]
    fn delay_is_capped() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(60),
            multiplier: 2.0,
            cap: Duration::from_secs(120),
            jitter: 0.0,
        };
        assert_eq!(policy.delay(10), Duration::from_secs(120));
    }

    #[test]
    fn webhook_schedule_is_monotonic_up_to_cap() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::webhook()
        };
        let mut previous = Duration::ZERO;
        for attempt in 0..12u32 {
            let d = policy.delay(attempt);
            assert!(d >= previous);
            assert!(d <= Duration::from_secs(24 * 60 * 60));
            previous = d;
        }
    }

    #[tokio::test]
    async fn cancelled_token_aborts_the_wait() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = cancellable_delay(Duration::from_secs(3600), &cancel).await;
        assert_eq!(result, Err(PaymentError::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_mid_wait_returns_immediately() {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let wait = tokio::spawn(async move {
            cancellable_delay(Duration::from_secs(30), &child).await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        assert_eq!(wait.await.unwrap(), Err(PaymentError::Canceled));
    }
}
