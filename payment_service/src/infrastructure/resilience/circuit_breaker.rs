//! Circuit breaker por endpoint upstream.
//!
//! closed -> open cuando hay `failure_threshold` fallas consecutivas o la
//! tasa de fallas sobre la ventana deslizante supera el umbral; open ->
//! half-open al vencer el timeout; half-open -> closed tras
//! `probe_successes` sondas exitosas consecutivas; cualquier sonda fallida
//! reabre. En estado abierto las llamadas retornan `CircuitOpen` sin tocar
//! la red y sin persistir fila alguna.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::domain::error::PaymentError;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub window_size: usize,
    pub failure_rate: f64,
    pub open_timeout: Duration,
    pub probe_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_size: 20,
            failure_rate: 0.5,
            open_timeout: Duration::from_secs(30),
            probe_successes: 3,
        }
    }
}

#[derive(Debug)]
enum BreakerState {
    Closed {
        consecutive_failures: u32,
        // true = falla; ventana deslizante de los últimos N resultados
        window: VecDeque<bool>,
    },
    Open {
        until: Instant,
    },
    HalfOpen {
        successes: u32,
    },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
                window: VecDeque::new(),
            }),
        }
    }

    /// Chequeo previo a la llamada. `Err(CircuitOpen)` significa no llamar.
    pub fn try_acquire(&self) -> Result<(), PaymentError> {
        let mut state = self.state.lock().unwrap();
        match &*state {
            BreakerState::Closed { .. } | BreakerState::HalfOpen { .. } => Ok(()),
            BreakerState::Open { until } => {
                if Instant::now() >= *until {
                    *state = BreakerState::HalfOpen { successes: 0 };
                    Ok(())
                } else {
                    Err(PaymentError::CircuitOpen)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            BreakerState::Closed {
                consecutive_failures,
                window,
            } => {
                *consecutive_failures = 0;
                Self::push_sample(window, self.config.window_size, false);
            }
            BreakerState::HalfOpen { successes } => {
                *successes += 1;
                if *successes >= self.config.probe_successes {
                    *state = BreakerState::Closed {
                        consecutive_failures: 0,
                        window: VecDeque::new(),
                    };
                }
            }
            BreakerState::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            BreakerState::Closed {
                consecutive_failures,
                window,
            } => {
                *consecutive_failures += 1;
                Self::push_sample(window, self.config.window_size, true);

                let rate_tripped = window.len() >= self.config.window_size && {
                    let failures = window.iter().filter(|f| **f).count();
                    failures as f64 / window.len() as f64 >= self.config.failure_rate
                };

                if *consecutive_failures >= self.config.failure_threshold || rate_tripped {
                    warn!(breaker = %self.name, "circuit breaker opened");
                    *state = BreakerState::Open {
                        until: Instant::now() + self.config.open_timeout,
                    };
                }
            }
            BreakerState::HalfOpen { .. } => {
                warn!(breaker = %self.name, "probe failed, circuit breaker reopened");
                *state = BreakerState::Open {
                    until: Instant::now() + self.config.open_timeout,
                };
            }
            BreakerState::Open { .. } => {}
        }
    }

    fn push_sample(window: &mut VecDeque<bool>, size: usize, failed: bool) {
        if window.len() == size {
            window.pop_front();
        }
        window.push_back(failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("test", BreakerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn five_consecutive_failures_open_the_circuit() {
        let cb = breaker();
        for _ in 0..5 {
            cb.try_acquire().unwrap();
            cb.record_failure();
        }
        assert_eq!(cb.try_acquire(), Err(PaymentError::CircuitOpen));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_rate_over_window_opens_the_circuit() {
        let cb = breaker();
        // 20 muestras intercaladas: 10 fallas de 20 = 50%, nunca 5 seguidas
        for i in 0..20 {
            cb.try_acquire().unwrap();
            if i % 2 == 0 {
                cb.record_failure();
            } else {
                cb.record_success();
            }
        }
        assert_eq!(cb.try_acquire(), Err(PaymentError::CircuitOpen));
    }

    #[tokio::test(start_paused = true)]
    async fn open_transitions_to_half_open_after_timeout() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        assert_eq!(cb.try_acquire(), Err(PaymentError::CircuitOpen));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn three_probe_successes_close_the_circuit() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        for _ in 0..3 {
            cb.try_acquire().unwrap();
            cb.record_success();
        }
        // Cerrado de nuevo: una falla aislada no debe abrirlo
        cb.try_acquire().unwrap();
        cb.record_failure();
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_reopens_immediately() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        cb.try_acquire().unwrap();
        cb.record_failure();
        assert_eq!(cb.try_acquire(), Err(PaymentError::CircuitOpen));
    }
}
