use crate::domain::entities::Chargeback;
use crate::domain::error::PaymentError;
use crate::domain::repository::ChargebackRepository;
use crate::infrastructure::persistence::models::ChargebackModel;
use crate::infrastructure::persistence::{with_deadline, QueryTier};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

pub struct PostgresChargebackRepository {
    pool: PgPool,
}

impl PostgresChargebackRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChargebackRepository for PostgresChargebackRepository {
    /// El gateway reenvía disputas; upsert por su id de disputa.
    async fn upsert(&self, chargeback: Chargeback) -> Result<Chargeback, PaymentError> {
        let model = with_deadline(
            QueryTier::Simple,
            sqlx::query_as::<_, ChargebackModel>(
                r#"
                INSERT INTO chargebacks (
                    id, merchant_id, transaction_id, gateway_dispute_id,
                    amount_cents, currency, reason_code, status, received_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (gateway_dispute_id) DO UPDATE
                SET status = EXCLUDED.status,
                    reason_code = EXCLUDED.reason_code
                RETURNING *
                "#,
            )
            .bind(chargeback.id)
            .bind(chargeback.merchant_id)
            .bind(chargeback.transaction_id)
            .bind(&chargeback.gateway_dispute_id)
            .bind(chargeback.amount_cents)
            .bind(&chargeback.currency)
            .bind(&chargeback.reason_code)
            .bind(&chargeback.status)
            .bind(chargeback.received_at)
            .fetch_one(&self.pool),
        )
        .await?;

        Ok(model.into())
    }

    async fn list_by_merchant(&self, merchant_id: Uuid) -> Result<Vec<Chargeback>, PaymentError> {
        let models = with_deadline(
            QueryTier::Report,
            sqlx::query_as::<_, ChargebackModel>(
                r#"
                SELECT * FROM chargebacks
                WHERE merchant_id = $1
                ORDER BY received_at DESC
                "#,
            )
            .bind(merchant_id)
            .fetch_all(&self.pool),
        )
        .await?;

        Ok(models.into_iter().map(Into::into).collect())
    }
}
