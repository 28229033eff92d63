//! Bulkheads: semáforos de concurrencia acotada por recurso aislado.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::domain::error::PaymentError;

/// Semáforo con adquisición cancelable y modo fail-fast.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_permits: usize,
}

impl Bulkhead {
    pub fn new(permits: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            max_permits: permits,
        }
    }

    /// Espera un slot; abandona la espera ante cancelación.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, PaymentError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(PaymentError::Canceled),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| PaymentError::Overloaded)
            }
        }
    }

    /// Espera a lo sumo `wait_budget`; si no hay slot dentro del presupuesto
    /// falla rápido con `Overloaded` en lugar de encolar al caller.
    pub async fn acquire_within(
        &self,
        wait_budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, PaymentError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(PaymentError::Canceled),
            _ = tokio::time::sleep(wait_budget) => Err(PaymentError::Overloaded),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| PaymentError::Overloaded)
            }
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_permits(&self) -> usize {
        self.max_permits
    }
}

/// Par de permisos (global, por host) de una entrega saliente.
pub struct HostPermit {
    _total: OwnedSemaphorePermit,
    _host: OwnedSemaphorePermit,
}

/// Bulkhead de webhooks: un tope global más un tope por host destino, para
/// que un suscriptor lento no agote la capacidad de los demás.
#[derive(Debug)]
pub struct HostBulkhead {
    total: Bulkhead,
    per_host_permits: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HostBulkhead {
    pub fn new(total_permits: usize, per_host_permits: usize) -> Self {
        Self {
            total: Bulkhead::new(total_permits),
            per_host_permits,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(
        &self,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<HostPermit, PaymentError> {
        let host_semaphore = {
            let mut hosts = self.hosts.lock().unwrap();
            hosts
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_permits)))
                .clone()
        };

        let total = self.total.acquire(cancel).await?;
        let host_permit = tokio::select! {
            _ = cancel.cancelled() => return Err(PaymentError::Canceled),
            permit = host_semaphore.acquire_owned() => {
                permit.map_err(|_| PaymentError::Overloaded)?
            }
        };

        Ok(HostPermit {
            _total: total,
            _host: host_permit,
        })
    }

    pub fn available_total(&self) -> usize {
        self.total.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_are_returned_on_drop() {
        let bulkhead = Bulkhead::new(1);
        let cancel = CancellationToken::new();

        let permit = bulkhead.acquire(&cancel).await.unwrap();
        assert_eq!(bulkhead.available_permits(), 0);
        drop(permit);
        assert_eq!(bulkhead.available_permits(), 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_a_saturated_wait() {
        let bulkhead = Bulkhead::new(1);
        let cancel = CancellationToken::new();
        let _held = bulkhead.acquire(&cancel).await.unwrap();

        cancel.cancel();
        let result = bulkhead.acquire(&cancel).await;
        assert_eq!(result.err(), Some(PaymentError::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_within_fails_fast_when_saturated() {
        let bulkhead = Bulkhead::new(1);
        let cancel = CancellationToken::new();
        let _held = bulkhead.acquire(&cancel).await.unwrap();

        let result = bulkhead
            .acquire_within(Duration::from_millis(50), &cancel)
            .await;
        assert_eq!(result.err(), Some(PaymentError::Overloaded));
    }

    #[tokio::test]
    async fn per_host_cap_is_independent_of_total() {
        let bulkhead = HostBulkhead::new(10, 1);
        let cancel = CancellationToken::new();

        let _slow_host = bulkhead.acquire("slow.example", &cancel).await.unwrap();
        // El host lento está lleno; otro host sigue teniendo capacidad
        let other = bulkhead.acquire("fast.example", &cancel).await;
        assert!(other.is_ok());
        assert_eq!(bulkhead.available_total(), 8);
    }
}
