use crate::domain::entities::{
    Chargeback, Merchant, PaymentMethod, Subscription, Transaction, TransactionStatus,
    VerificationStatus, WebhookDelivery, WebhookEvent, WebhookSubscription,
};
use crate::domain::error::PaymentError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

// Ports de persistencia. Un repositorio por agregado; la unidad de trabajo
// transaccional de un grupo se modela aparte como `GroupOperation`.

#[async_trait]
pub trait MerchantRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Merchant>, PaymentError>;
    async fn find_by_slug(&self, slug: &str) -> Result<Option<Merchant>, PaymentError>;
}

#[async_trait]
pub trait PaymentMethodRepository: Send + Sync {
    async fn save(&self, method: PaymentMethod) -> Result<PaymentMethod, PaymentError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentMethod>, PaymentError>;
    async fn find_by_merchant(&self, merchant_id: Uuid)
        -> Result<Vec<PaymentMethod>, PaymentError>;
    async fn deactivate(&self, id: Uuid, merchant_id: Uuid) -> Result<(), PaymentError>;
    /// Métodos ACH pendientes creados antes del corte. Soportado por el
    /// índice parcial sobre (kind, verification_status, created_at).
    async fn find_pending_ach_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentMethod>, PaymentError>;
    async fn set_verification(
        &self,
        id: Uuid,
        status: VerificationStatus,
        failure_code: Option<String>,
    ) -> Result<PaymentMethod, PaymentError>;
}

#[async_trait]
pub trait TransactionRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Transaction>, PaymentError>;
    /// Árbol completo del grupo, orden created_at ASC (empates por id ASC),
    /// profundidad acotada como guarda anti-DoS.
    async fn find_group(&self, root_id: Uuid) -> Result<Vec<Transaction>, PaymentError>;
    async fn list_by_merchant(
        &self,
        merchant_id: Uuid,
        customer_id: Option<Uuid>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Transaction>, PaymentError>;
    /// Abre la unidad de trabajo de una operación de escritura sobre el grupo
    /// `root_id`. Toma el lock de serialización del grupo antes de retornar.
    async fn begin_group_operation(
        &self,
        root_id: Uuid,
    ) -> Result<Box<dyn GroupOperation>, PaymentError>;
}

/// Resultado final de un intento que recibió respuesta del gateway.
#[derive(Debug, Clone)]
pub struct TransactionOutcome {
    pub transaction_id: Uuid,
    pub status: TransactionStatus,
    pub gateway_response_code: Option<String>,
    pub authorization_code: Option<String>,
    pub reuse_token: Option<String>,
}

/// Unidad de trabajo de una operación que cambia el estado de un grupo.
///
/// Implementaciones concretas mantienen abierta una transacción de base de
/// datos con el lock del grupo tomado; todo lo escrito aquí (fila de la
/// transacción + evento de outbox) se confirma de forma atómica en `commit`.
/// Los duplicados concurrentes del mismo `id` quedan bloqueados en
/// `begin_group_operation` hasta el commit y luego leen la fila confirmada.
#[async_trait]
pub trait GroupOperation: Send {
    /// Fila ya confirmada con este id, si existe (replay idempotente).
    async fn find_existing(&mut self, id: Uuid) -> Result<Option<Transaction>, PaymentError>;
    /// Filas actuales del grupo, para derivar `GroupState`.
    async fn load_group(&mut self) -> Result<Vec<Transaction>, PaymentError>;
    /// Inserta la fila en PENDING antes de llamar al gateway.
    async fn insert_pending(&mut self, transaction: &Transaction) -> Result<(), PaymentError>;
    /// Registra el resultado del intento sobre la fila insertada.
    async fn record_outcome(
        &mut self,
        outcome: TransactionOutcome,
    ) -> Result<Transaction, PaymentError>;
    /// Inserta el evento en el outbox, dentro de la misma transacción.
    async fn enqueue_event(&mut self, event: &WebhookEvent) -> Result<(), PaymentError>;
    async fn commit(self: Box<Self>) -> Result<(), PaymentError>;
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn save(&self, subscription: Subscription) -> Result<Subscription, PaymentError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Subscription>, PaymentError>;
    async fn list_by_merchant(
        &self,
        merchant_id: Uuid,
    ) -> Result<Vec<Subscription>, PaymentError>;
    async fn update(&self, subscription: Subscription) -> Result<Subscription, PaymentError>;
    /// Reclama suscripciones activas vencidas (`next_billing_at <= now`) con
    /// FOR UPDATE SKIP LOCKED, estampando `last_attempt_at` para que otras
    /// réplicas del sweep las salteen.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Subscription>, PaymentError>;
}

#[async_trait]
pub trait WebhookRepository: Send + Sync {
    async fn save_subscription(
        &self,
        subscription: WebhookSubscription,
    ) -> Result<WebhookSubscription, PaymentError>;
    async fn find_subscription(
        &self,
        id: Uuid,
    ) -> Result<Option<WebhookSubscription>, PaymentError>;
    async fn list_subscriptions(
        &self,
        merchant_id: Uuid,
    ) -> Result<Vec<WebhookSubscription>, PaymentError>;
    async fn update_subscription(
        &self,
        subscription: WebhookSubscription,
    ) -> Result<WebhookSubscription, PaymentError>;
    async fn delete_subscription(&self, id: Uuid, merchant_id: Uuid) -> Result<(), PaymentError>;

    /// Inserta un evento en el outbox fuera de una operación de grupo
    /// (promociones ACH, suscripciones past_due).
    async fn insert_event(&self, event: &WebhookEvent) -> Result<(), PaymentError>;
    /// Abanico: convierte eventos sin despachar en filas de entrega, una por
    /// suscripción activa cuyo filtro acepta el tipo de evento.
    async fn dispatch_pending_events(&self, limit: i64) -> Result<u64, PaymentError>;
    /// Entregas vencidas (`status=PENDING AND next_attempt_at <= now`) con
    /// FOR UPDATE SKIP LOCKED.
    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>, PaymentError>;
    async fn record_delivery_attempt(
        &self,
        delivery: &WebhookDelivery,
    ) -> Result<(), PaymentError>;
    /// Entregas que siguen sin resolver, para el reporte de drenaje en shutdown.
    async fn count_pending_deliveries(&self) -> Result<i64, PaymentError>;
}

#[async_trait]
pub trait ChargebackRepository: Send + Sync {
    /// Upsert por `gateway_dispute_id` (el gateway reenvía disputas).
    async fn upsert(&self, chargeback: Chargeback) -> Result<Chargeback, PaymentError>;
    async fn list_by_merchant(&self, merchant_id: Uuid) -> Result<Vec<Chargeback>, PaymentError>;
}
