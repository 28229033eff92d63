//! Implementaciones Postgres de los ports de persistencia.
//!
//! Toda consulta corre bajo el deadline de su tier, compuesto con el deadline
//! del caller (el que venza primero gana, porque el timeout externo cancela
//! el future completo).

pub mod chargeback_repository;
pub mod merchant_repository;
pub mod models;
pub mod payment_method_repository;
pub mod subscription_repository;
pub mod transaction_repository;
pub mod webhook_repository;

use std::future::Future;
use std::time::Duration;

use crate::domain::error::PaymentError;

/// Clasificación de la consulta según su presupuesto de tiempo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryTier {
    /// Lookups por clave primaria o índice único.
    Simple,
    /// Joins, agregaciones o barridos acotados.
    Complex,
    /// Reportes y listados grandes.
    Report,
}

impl QueryTier {
    pub fn deadline(&self) -> Duration {
        match self {
            QueryTier::Simple => Duration::from_secs(2),
            QueryTier::Complex => Duration::from_secs(5),
            QueryTier::Report => Duration::from_secs(30),
        }
    }
}

/// Ejecuta la consulta bajo el deadline del tier.
pub async fn with_deadline<T>(
    tier: QueryTier,
    query: impl Future<Output = Result<T, sqlx::Error>>,
) -> Result<T, PaymentError> {
    match tokio::time::timeout(tier.deadline(), query).await {
        Ok(result) => result.map_err(|e| PaymentError::Repository(e.to_string())),
        Err(_) => Err(PaymentError::Canceled),
    }
}
