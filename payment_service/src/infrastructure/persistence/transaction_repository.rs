//! Repositorio de transacciones y unidad de trabajo de grupo para PostgreSQL.
//!
//! La serialización por grupo se hace con `pg_advisory_xact_lock` sobre la
//! raíz: toda operación de escritura del grupo (incluido un replay del mismo
//! id) toma el lock primero, por lo que los duplicados concurrentes se
//! encolan detrás de la operación en vuelo y leen la fila ya confirmada.

use crate::domain::entities::{Transaction, WebhookEvent};
use crate::domain::error::PaymentError;
use crate::domain::group::MAX_GROUP_DEPTH;
use crate::domain::repository::{GroupOperation, TransactionOutcome, TransactionRepository};
use crate::infrastructure::persistence::models::TransactionModel;
use crate::infrastructure::persistence::{with_deadline, QueryTier};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

pub struct PostgresTransactionRepository {
    pool: PgPool,
}

impl PostgresTransactionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionRepository for PostgresTransactionRepository {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Transaction>, PaymentError> {
        let model = with_deadline(
            QueryTier::Simple,
            sqlx::query_as::<_, TransactionModel>(r#"SELECT * FROM transactions WHERE id = $1"#)
                .bind(id)
                .fetch_optional(&self.pool),
        )
        .await?;

        Ok(model.map(Into::into))
    }

    /// Árbol del grupo por CTE recursivo, profundidad acotada (guarda DoS),
    /// orden created_at ASC con desempate por id.
    async fn find_group(&self, root_id: Uuid) -> Result<Vec<Transaction>, PaymentError> {
        let models = with_deadline(
            QueryTier::Complex,
            sqlx::query_as::<_, TransactionModel>(
                r#"
                WITH RECURSIVE tree AS (
                    SELECT t.*, 1 AS depth
                    FROM transactions t
                    WHERE t.id = $1 AND t.parent_transaction_id IS NULL
                    UNION ALL
                    SELECT c.*, tree.depth + 1
                    FROM transactions c
                    JOIN tree ON c.parent_transaction_id = tree.id
                    WHERE tree.depth < $2
                )
                SELECT id, merchant_id, customer_id, payment_method_id, subscription_id,
                       tran_type, parent_transaction_id, root_transaction_id, amount_cents,
                       currency, status, gateway_response_code, authorization_code,
                       reuse_token, created_at, updated_at
                FROM tree
                ORDER BY created_at ASC, id ASC
                "#,
            )
            .bind(root_id)
            .bind(MAX_GROUP_DEPTH)
            .fetch_all(&self.pool),
        )
        .await?;

        Ok(models.into_iter().map(Into::into).collect())
    }

    async fn list_by_merchant(
        &self,
        merchant_id: Uuid,
        customer_id: Option<Uuid>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Transaction>, PaymentError> {
        let models = with_deadline(
            QueryTier::Report,
            sqlx::query_as::<_, TransactionModel>(
                r#"
                SELECT * FROM transactions
                WHERE merchant_id = $1
                  AND ($2::uuid IS NULL OR customer_id = $2)
                ORDER BY created_at DESC
                LIMIT $3 OFFSET $4
                "#,
            )
            .bind(merchant_id)
            .bind(customer_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool),
        )
        .await?;

        Ok(models.into_iter().map(Into::into).collect())
    }

    async fn begin_group_operation(
        &self,
        root_id: Uuid,
    ) -> Result<Box<dyn GroupOperation>, PaymentError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PaymentError::Repository(e.to_string()))?;

        // La espera por el lock puede extenderse hasta el commit de la
        // operación en vuelo (que incluye su llamada al gateway); tier Report.
        with_deadline(
            QueryTier::Report,
            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
                .bind(root_id)
                .execute(&mut *tx),
        )
        .await?;

        Ok(Box::new(PgGroupOperation { tx, root_id }))
    }
}

pub struct PgGroupOperation {
    tx: sqlx::Transaction<'static, Postgres>,
    root_id: Uuid,
}

#[async_trait]
impl GroupOperation for PgGroupOperation {
    async fn find_existing(&mut self, id: Uuid) -> Result<Option<Transaction>, PaymentError> {
        let model = with_deadline(
            QueryTier::Simple,
            sqlx::query_as::<_, TransactionModel>(r#"SELECT * FROM transactions WHERE id = $1"#)
                .bind(id)
                .fetch_optional(&mut *self.tx),
        )
        .await?;

        Ok(model.map(Into::into))
    }

    async fn load_group(&mut self) -> Result<Vec<Transaction>, PaymentError> {
        // El lock ya serializa el grupo; alcanza la consulta plana por raíz.
        let models = with_deadline(
            QueryTier::Simple,
            sqlx::query_as::<_, TransactionModel>(
                r#"
                SELECT * FROM transactions
                WHERE root_transaction_id = $1
                ORDER BY created_at ASC, id ASC
                "#,
            )
            .bind(self.root_id)
            .fetch_all(&mut *self.tx),
        )
        .await?;

        Ok(models.into_iter().map(Into::into).collect())
    }

    async fn insert_pending(&mut self, transaction: &Transaction) -> Result<(), PaymentError> {
        let model = TransactionModel::from(transaction);
        with_deadline(
            QueryTier::Simple,
            sqlx::query(
                r#"
                INSERT INTO transactions (
                    id, merchant_id, customer_id, payment_method_id, subscription_id,
                    tran_type, parent_transaction_id, root_transaction_id, amount_cents,
                    currency, status, gateway_response_code, authorization_code,
                    reuse_token, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                "#,
            )
            .bind(model.id)
            .bind(model.merchant_id)
            .bind(model.customer_id)
            .bind(model.payment_method_id)
            .bind(model.subscription_id)
            .bind(model.tran_type)
            .bind(model.parent_transaction_id)
            .bind(model.root_transaction_id)
            .bind(model.amount_cents)
            .bind(model.currency)
            .bind(model.status)
            .bind(model.gateway_response_code)
            .bind(model.authorization_code)
            .bind(model.reuse_token)
            .bind(model.created_at)
            .bind(model.updated_at)
            .execute(&mut *self.tx),
        )
        .await?;

        Ok(())
    }

    async fn record_outcome(
        &mut self,
        outcome: TransactionOutcome,
    ) -> Result<Transaction, PaymentError> {
        let model = with_deadline(
            QueryTier::Simple,
            sqlx::query_as::<_, TransactionModel>(
                r#"
                UPDATE transactions
                SET status = $1,
                    gateway_response_code = $2,
                    authorization_code = $3,
                    reuse_token = $4,
                    updated_at = $5
                WHERE id = $6
                RETURNING *
                "#,
            )
            .bind(outcome.status)
            .bind(outcome.gateway_response_code)
            .bind(outcome.authorization_code)
            .bind(outcome.reuse_token)
            .bind(Utc::now())
            .bind(outcome.transaction_id)
            .fetch_one(&mut *self.tx),
        )
        .await?;

        Ok(model.into())
    }

    async fn enqueue_event(&mut self, event: &WebhookEvent) -> Result<(), PaymentError> {
        with_deadline(
            QueryTier::Simple,
            sqlx::query(
                r#"
                INSERT INTO webhook_events (id, event_type, merchant_id, payload, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(event.id)
            .bind(&event.event_type)
            .bind(event.merchant_id)
            .bind(&event.data)
            .bind(event.created_at)
            .execute(&mut *self.tx),
        )
        .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), PaymentError> {
        self.tx
            .commit()
            .await
            .map_err(|e| PaymentError::Repository(e.to_string()))
    }
}
