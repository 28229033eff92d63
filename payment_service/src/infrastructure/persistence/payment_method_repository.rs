use crate::domain::entities::{PaymentMethod, VerificationStatus};
use crate::domain::error::PaymentError;
use crate::domain::repository::PaymentMethodRepository;
use crate::infrastructure::persistence::models::PaymentMethodModel;
use crate::infrastructure::persistence::{with_deadline, QueryTier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

pub struct PostgresPaymentMethodRepository {
    pool: PgPool,
}

impl PostgresPaymentMethodRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentMethodRepository for PostgresPaymentMethodRepository {
    async fn save(&self, method: PaymentMethod) -> Result<PaymentMethod, PaymentError> {
        // Upsert por id: el callback de STORAGE puede reintentar
        let model = with_deadline(
            QueryTier::Simple,
            sqlx::query_as::<_, PaymentMethodModel>(
                r#"
                INSERT INTO payment_methods (
                    id, merchant_id, customer_id, kind, brand, last_four, reuse_token,
                    verification_status, verification_failure_code, active, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (id) DO NOTHING
                RETURNING *
                "#,
            )
            .bind(method.id)
            .bind(method.merchant_id)
            .bind(method.customer_id)
            .bind(method.kind)
            .bind(&method.brand)
            .bind(&method.last_four)
            .bind(&method.reuse_token)
            .bind(method.verification_status)
            .bind(&method.verification_failure_code)
            .bind(method.active)
            .bind(method.created_at)
            .bind(method.updated_at)
            .fetch_optional(&self.pool),
        )
        .await?;

        match model {
            Some(m) => Ok(m.into()),
            // Conflicto: ya insertado por un intento previo; devolvemos el confirmado
            None => self
                .find_by_id(method.id)
                .await?
                .ok_or_else(|| PaymentError::Repository("payment method upsert race".into())),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentMethod>, PaymentError> {
        let model = with_deadline(
            QueryTier::Simple,
            sqlx::query_as::<_, PaymentMethodModel>(
                r#"SELECT * FROM payment_methods WHERE id = $1"#,
            )
            .bind(id)
            .fetch_optional(&self.pool),
        )
        .await?;

        Ok(model.map(Into::into))
    }

    async fn find_by_merchant(
        &self,
        merchant_id: Uuid,
    ) -> Result<Vec<PaymentMethod>, PaymentError> {
        let models = with_deadline(
            QueryTier::Complex,
            sqlx::query_as::<_, PaymentMethodModel>(
                r#"
                SELECT * FROM payment_methods
                WHERE merchant_id = $1 AND active
                ORDER BY created_at DESC
                "#,
            )
            .bind(merchant_id)
            .fetch_all(&self.pool),
        )
        .await?;

        Ok(models.into_iter().map(Into::into).collect())
    }

    async fn deactivate(&self, id: Uuid, merchant_id: Uuid) -> Result<(), PaymentError> {
        let result = with_deadline(
            QueryTier::Simple,
            sqlx::query(
                r#"
                UPDATE payment_methods
                SET active = FALSE, updated_at = $3
                WHERE id = $1 AND merchant_id = $2
                "#,
            )
            .bind(id)
            .bind(merchant_id)
            .bind(Utc::now())
            .execute(&self.pool),
        )
        .await?;

        if result.rows_affected() == 0 {
            return Err(PaymentError::NotFound(id));
        }
        Ok(())
    }

    /// Barrido ACH: se apoya en el índice parcial
    /// (kind, verification_status, created_at) WHERE kind='ACH' AND pending.
    async fn find_pending_ach_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentMethod>, PaymentError> {
        let models = with_deadline(
            QueryTier::Complex,
            sqlx::query_as::<_, PaymentMethodModel>(
                r#"
                SELECT * FROM payment_methods
                WHERE kind = 'ACH'
                  AND verification_status = 'PENDING'
                  AND created_at < $1
                ORDER BY created_at ASC
                LIMIT $2
                "#,
            )
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&self.pool),
        )
        .await?;

        Ok(models.into_iter().map(Into::into).collect())
    }

    async fn set_verification(
        &self,
        id: Uuid,
        status: VerificationStatus,
        failure_code: Option<String>,
    ) -> Result<PaymentMethod, PaymentError> {
        let model = with_deadline(
            QueryTier::Simple,
            sqlx::query_as::<_, PaymentMethodModel>(
                r#"
                UPDATE payment_methods
                SET verification_status = $2,
                    verification_failure_code = $3,
                    updated_at = $4
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(status)
            .bind(failure_code)
            .bind(Utc::now())
            .fetch_optional(&self.pool),
        )
        .await?;

        match model {
            Some(m) => Ok(m.into()),
            None => Err(PaymentError::NotFound(id)),
        }
    }
}
