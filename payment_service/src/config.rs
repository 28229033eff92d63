//! Configuración del Payment Service.
//!
//! Todas las claves reconocidas se enumeran aquí; no hay otras variables
//! mágicas leídas en el resto del código.

use anyhow::{Context, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string.
    pub database_url: String,

    /// Máximo de conexiones del pool (regla: peak_TPS x avg_query_secs x 1.25).
    pub database_max_connections: u32,

    /// Endpoint del secret store externo (guarda los MAC secrets por comercio).
    pub secret_store_url: String,

    /// Base URL del gateway para Browser Post (key exchange + post del formulario).
    pub gateway_browser_post_url: String,

    /// Base URL del gateway para Server Post.
    pub gateway_server_post_url: String,

    /// Timeout por llamada al gateway.
    pub gateway_timeout: Duration,

    /// Reintentos máximos contra el gateway (solo errores transitorios).
    pub gateway_retry_attempts: u32,

    /// Base del backoff exponencial entre reintentos.
    pub gateway_retry_base: Duration,

    /// Fallas consecutivas que abren el circuit breaker.
    pub breaker_failure_threshold: u32,

    /// Tiempo en estado abierto antes de pasar a half-open.
    pub breaker_open_timeout: Duration,

    /// Probes exitosos consecutivos que cierran el circuito.
    pub breaker_probe_successes: u32,

    /// Slots del bulkhead hacia el gateway.
    pub gateway_bulkhead_permits: usize,

    /// Slots totales del bulkhead de webhooks salientes.
    pub webhook_bulkhead_permits: usize,

    /// Slots por host destino de webhooks.
    pub webhook_per_host_permits: usize,

    /// Intentos máximos de entrega de un webhook antes de marcarlo exhausted.
    pub webhook_max_attempts: i32,

    /// Intervalo del sweep de entregas de webhooks.
    pub webhook_tick: Duration,

    /// Intervalo del sweep de facturación de suscripciones.
    pub billing_tick: Duration,

    /// Fallas consecutivas de cobro que pasan una suscripción a past_due.
    pub billing_failure_threshold: i32,

    /// Intervalo del sweep de verificación ACH.
    pub ach_tick: Duration,

    /// Presupuesto total del apagado ordenado.
    pub shutdown_budget: Duration,

    /// Clave pública (PEM, RSA) para validar los bearer tokens del RPC.
    pub auth_public_key_pem: String,

    /// Códigos de respuesta del gateway tratados como transitorios (CSV).
    /// Se mezclan sobre los defaults incorporados.
    pub gateway_transient_codes: Vec<String>,

    /// Host de escucha HTTP.
    pub host: String,

    /// Puerto de escucha HTTP.
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            database_max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 20)?,
            secret_store_url: std::env::var("SECRET_STORE_URL")
                .context("SECRET_STORE_URL must be set")?,
            gateway_browser_post_url: std::env::var("GATEWAY_BROWSER_POST_URL")
                .context("GATEWAY_BROWSER_POST_URL must be set")?,
            gateway_server_post_url: std::env::var("GATEWAY_SERVER_POST_URL")
                .context("GATEWAY_SERVER_POST_URL must be set")?,
            gateway_timeout: Duration::from_secs(parse_var("GATEWAY_TIMEOUT_SECS", 30)?),
            gateway_retry_attempts: parse_var("GATEWAY_RETRY_ATTEMPTS", 3)?,
            gateway_retry_base: Duration::from_millis(parse_var("GATEWAY_RETRY_BASE_MS", 100)?),
            breaker_failure_threshold: parse_var("BREAKER_FAILURE_THRESHOLD", 5)?,
            breaker_open_timeout: Duration::from_secs(parse_var("BREAKER_OPEN_TIMEOUT_SECS", 30)?),
            breaker_probe_successes: parse_var("BREAKER_PROBE_SUCCESSES", 3)?,
            gateway_bulkhead_permits: parse_var("GATEWAY_BULKHEAD_PERMITS", 100)?,
            webhook_bulkhead_permits: parse_var("WEBHOOK_BULKHEAD_PERMITS", 50)?,
            webhook_per_host_permits: parse_var("WEBHOOK_PER_HOST_PERMITS", 5)?,
            webhook_max_attempts: parse_var("WEBHOOK_MAX_ATTEMPTS", 12)?,
            webhook_tick: Duration::from_secs(parse_var("WEBHOOK_TICK_SECS", 30)?),
            billing_tick: Duration::from_secs(parse_var("BILLING_TICK_SECS", 60)?),
            billing_failure_threshold: parse_var("BILLING_FAILURE_THRESHOLD", 3)?,
            ach_tick: Duration::from_secs(parse_var("ACH_TICK_SECS", 3600)?),
            shutdown_budget: Duration::from_secs(parse_var("SHUTDOWN_BUDGET_SECS", 30)?),
            auth_public_key_pem: std::env::var("AUTH_PUBLIC_KEY_PEM")
                .context("AUTH_PUBLIC_KEY_PEM must be set")?,
            gateway_transient_codes: std::env::var("GATEWAY_TRANSIENT_CODES")
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect(),
            host: std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parse_var("PORT", 3000)?,
        })
    }
}

fn parse_var<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + ToString,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().with_context(|| format!("Invalid {}", key)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_var_prefers_env_value() {
        std::env::set_var("PAYMENT_TEST_PARSE_VAR", "42");
        let parsed: u32 = parse_var("PAYMENT_TEST_PARSE_VAR", 7).unwrap();
        assert_eq!(parsed, 42);
        std::env::remove_var("PAYMENT_TEST_PARSE_VAR");
    }

    #[test]
    fn parse_var_falls_back_to_default() {
        let parsed: u64 = parse_var("PAYMENT_TEST_MISSING_VAR", 30).unwrap();
        assert_eq!(parsed, 30);
    }
}
