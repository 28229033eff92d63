//! Registro de tareas de fondo y coordinación del apagado ordenado.
//!
//! Orden de apagado: (1) el server deja de aceptar RPCs (axum graceful
//! shutdown sobre el mismo token), (2) se cancela el token y los sweeps
//! abandonan sus esperas, (3) se drenan las tareas registradas en orden
//! inverso de registro, cada una con el presupuesto restante, (4) el caller
//! cierra el pool. Al vencer el presupuesto se loguea el trabajo residual y
//! se aborta lo que quede.

use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct TaskRegistry {
    cancel: CancellationToken,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Token hijo para propagar la señal de apagado a una tarea u operación.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Registra y lanza una tarea de fondo con nombre.
    pub fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.tasks
            .lock()
            .unwrap()
            .push((name.to_string(), handle));
        info!(task = name, "background task registered");
    }

    /// Dispara la señal de apagado sin esperar el drenaje.
    pub fn trigger_shutdown(&self) {
        self.cancel.cancel();
    }

    /// Apagado ordenado: cancela y drena en orden inverso de registro dentro
    /// del presupuesto. Retorna false si quedó trabajo residual.
    pub async fn shutdown(&self, budget: Duration) -> bool {
        self.cancel.cancel();

        let mut tasks: Vec<(String, JoinHandle<()>)> =
            std::mem::take(&mut *self.tasks.lock().unwrap());
        tasks.reverse();

        let deadline = tokio::time::Instant::now() + budget;
        let mut clean = true;

        for (name, handle) in tasks {
            let abort = handle.abort_handle();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => info!(task = %name, "background task drained"),
                Ok(Err(e)) => {
                    clean = false;
                    error!(task = %name, "background task panicked during drain: {}", e);
                }
                Err(_) => {
                    clean = false;
                    warn!(task = %name, "shutdown budget expired with residual work, aborting");
                    abort.abort();
                }
            }
        }

        clean
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn cooperative_tasks_drain_within_budget() {
        let registry = TaskRegistry::new();
        let token = registry.cancellation_token();
        registry.spawn("cooperative", async move {
            token.cancelled().await;
        });

        assert!(registry.shutdown(Duration::from_secs(30)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_task_is_reported_after_budget() {
        let registry = TaskRegistry::new();
        // Tarea que ignora la cancelación
        registry.spawn("stuck", async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        assert!(!registry.shutdown(Duration::from_secs(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn child_tokens_observe_the_broadcast() {
        let registry = TaskRegistry::new();
        let a = registry.cancellation_token();
        let b = registry.cancellation_token();
        registry.trigger_shutdown();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }
}
