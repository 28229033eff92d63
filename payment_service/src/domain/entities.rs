use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::error::PaymentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(non_camel_case_types)]
pub enum TransactionStatus {
    PENDING,
    APPROVED,
    DECLINED,
    ERROR,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(non_camel_case_types)]
pub enum TransactionType {
    AUTHORIZE,
    CAPTURE,
    SALE,
    VOID,
    REFUND,
}

impl TransactionType {
    /// True para los tipos que inician un grupo (sin padre).
    pub fn is_root(&self) -> bool {
        matches!(self, TransactionType::AUTHORIZE | TransactionType::SALE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_method_kind", rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(non_camel_case_types)]
pub enum PaymentMethodKind {
    CREDIT_CARD,
    ACH,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "verification_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(non_camel_case_types)]
pub enum VerificationStatus {
    PENDING,
    VERIFIED,
    FAILED,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "subscription_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(non_camel_case_types)]
pub enum SubscriptionStatus {
    ACTIVE,
    PAST_DUE,
    CANCELED,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "billing_unit", rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(non_camel_case_types)]
pub enum BillingUnit {
    DAY,
    WEEK,
    MONTH,
    YEAR,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "delivery_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(non_camel_case_types)]
pub enum DeliveryStatus {
    PENDING,
    DELIVERED,
    FAILED,
    EXHAUSTED,
}

/// Comercio registrado en el sistema.
///
/// Los identificadores de terminal son opacos para nosotros; se reenvían al
/// gateway tal cual. `mac_secret_ref` es una referencia al secret store,
/// nunca el valor del secreto.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Merchant {
    pub id: Uuid,
    pub slug: String, // Unique
    pub cust_nbr: String,
    pub merch_nbr: String,
    pub dba_nbr: String,
    pub terminal_nbr: String,
    pub mac_secret_ref: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Medio de pago tokenizado (tarjeta o cuenta ACH).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub kind: PaymentMethodKind,
    pub brand: Option<String>,
    pub last_four: Option<String>,
    pub reuse_token: String,
    pub verification_status: VerificationStatus,
    pub verification_failure_code: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentMethod {
    /// Regla de uso: un método ACH solo es utilizable cuando está verificado.
    /// Un método con verificación fallida queda inutilizable de forma permanente.
    pub fn ensure_usable(&self) -> Result<(), PaymentError> {
        if !self.active {
            return Err(PaymentError::InvalidState(format!(
                "payment method {} is deactivated",
                self.id
            )));
        }
        if self.kind == PaymentMethodKind::ACH
            && self.verification_status != VerificationStatus::VERIFIED
        {
            return Err(PaymentError::InvalidState(format!(
                "ACH payment method {} is not verified (status {:?})",
                self.id, self.verification_status
            )));
        }
        Ok(())
    }
}

/// Registro central de una operación contra el gateway.
///
/// `id` lo elige el iniciador ANTES de llamar al gateway y funciona como
/// clave de idempotencia tanto en nuestra persistencia como en el gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub payment_method_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub tran_type: TransactionType,
    pub parent_transaction_id: Option<Uuid>,
    pub root_transaction_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub status: TransactionStatus,
    pub gateway_response_code: Option<String>,
    pub authorization_code: Option<String>,
    pub reuse_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Crea la raíz de un grupo (AUTHORIZE o SALE) en estado PENDING.
    ///
    /// Invariante: para una raíz, `root_transaction_id == id` y el padre es null.
    pub fn new_root(
        id: Uuid,
        merchant_id: Uuid,
        tran_type: TransactionType,
        amount_cents: i64,
        currency: &str,
    ) -> Result<Self, PaymentError> {
        if !tran_type.is_root() {
            return Err(PaymentError::Validation(format!(
                "{:?} cannot start a transaction group",
                tran_type
            )));
        }
        if amount_cents <= 0 {
            return Err(PaymentError::Validation(
                "amount_cents must be positive".to_string(),
            ));
        }
        validate_currency(currency)?;

        let now = Utc::now();
        Ok(Self {
            id,
            merchant_id,
            customer_id: None,
            payment_method_id: None,
            subscription_id: None,
            tran_type,
            parent_transaction_id: None,
            root_transaction_id: id,
            amount_cents,
            currency: currency.to_uppercase(),
            status: TransactionStatus::PENDING,
            gateway_response_code: None,
            authorization_code: None,
            reuse_token: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Crea una operación hija (CAPTURE/VOID/REFUND) colgando de `parent`.
    ///
    /// Invariante: el `root_transaction_id` de toda hija es el de su padre.
    pub fn new_child(
        id: Uuid,
        parent: &Transaction,
        tran_type: TransactionType,
        amount_cents: i64,
    ) -> Result<Self, PaymentError> {
        if tran_type.is_root() {
            return Err(PaymentError::Validation(format!(
                "{:?} cannot reference a parent transaction",
                tran_type
            )));
        }
        if amount_cents < 0 {
            return Err(PaymentError::Validation(
                "amount_cents must not be negative".to_string(),
            ));
        }

        let now = Utc::now();
        Ok(Self {
            id,
            merchant_id: parent.merchant_id,
            customer_id: parent.customer_id,
            payment_method_id: parent.payment_method_id,
            subscription_id: parent.subscription_id,
            tran_type,
            parent_transaction_id: Some(parent.id),
            root_transaction_id: parent.root_transaction_id,
            amount_cents,
            currency: parent.currency.clone(),
            status: TransactionStatus::PENDING,
            gateway_response_code: None,
            authorization_code: None,
            reuse_token: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_approved(&self) -> bool {
        self.status == TransactionStatus::APPROVED
    }
}

fn validate_currency(currency: &str) -> Result<(), PaymentError> {
    if currency.trim().len() != 3 {
        return Err(PaymentError::Validation(
            "currency must be a 3-letter ISO code".to_string(),
        ));
    }
    Ok(())
}

/// Suscripción de cobro recurrente.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub customer_id: Uuid,
    pub payment_method_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub cadence_count: i32,
    pub cadence_unit: BillingUnit,
    pub next_billing_at: DateTime<Utc>,
    pub status: SubscriptionStatus,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub consecutive_failures: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(
        merchant_id: Uuid,
        customer_id: Uuid,
        payment_method_id: Uuid,
        amount_cents: i64,
        currency: &str,
        cadence_count: i32,
        cadence_unit: BillingUnit,
        first_billing_at: DateTime<Utc>,
    ) -> Result<Self, PaymentError> {
        if amount_cents <= 0 {
            return Err(PaymentError::Validation(
                "amount_cents must be positive".to_string(),
            ));
        }
        if cadence_count <= 0 {
            return Err(PaymentError::Validation(
                "cadence_count must be positive".to_string(),
            ));
        }
        validate_currency(currency)?;

        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            merchant_id,
            customer_id,
            payment_method_id,
            amount_cents,
            currency: currency.to_uppercase(),
            cadence_count,
            cadence_unit,
            next_billing_at: first_billing_at,
            status: SubscriptionStatus::ACTIVE,
            last_attempt_at: None,
            consecutive_failures: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Siguiente fecha de facturación a partir de `from`, en UTC.
    /// La aritmética de meses/años satura al último día del mes (31 ene + 1 mes = 28/29 feb).
    pub fn next_period_after(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        let count = self.cadence_count as i64;
        match self.cadence_unit {
            BillingUnit::DAY => from + Duration::days(count),
            BillingUnit::WEEK => from + Duration::weeks(count),
            BillingUnit::MONTH => from
                .checked_add_months(Months::new(self.cadence_count as u32))
                .unwrap_or(from),
            BillingUnit::YEAR => {
                let months = (self.cadence_count as u32).saturating_mul(12);
                from.checked_add_months(Months::new(months)).unwrap_or(from)
            }
        }
    }

    /// Clave de idempotencia derivada para el cobro del período que inicia en
    /// `period_start`: estable entre reintentos y entre réplicas del sweep.
    pub fn billing_idempotency_key(&self, period_start: DateTime<Utc>) -> Uuid {
        let name = format!("{}:{}", self.id, period_start.timestamp());
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }
}

/// Suscripción saliente de webhooks de un comercio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub url: String,
    pub signing_key: String,
    pub event_types: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookSubscription {
    /// True si la suscripción quiere recibir este tipo de evento.
    /// Un filtro vacío significa "todos los eventos".
    pub fn accepts(&self, event_type: &str) -> bool {
        self.active
            && (self.event_types.is_empty() || self.event_types.iter().any(|t| t == event_type))
    }
}

/// Evento de negocio emitido por las operaciones que cambian estado.
/// Se inserta en el outbox dentro de la misma transacción de base de datos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub event_type: String,
    pub merchant_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

pub mod event_types {
    pub const TRANSACTION_APPROVED: &str = "transaction.approved";
    pub const TRANSACTION_DECLINED: &str = "transaction.declined";
    pub const TRANSACTION_ERROR: &str = "transaction.error";
    pub const PAYMENT_METHOD_VERIFIED: &str = "payment_method.verified";
    pub const PAYMENT_METHOD_FAILED: &str = "payment_method.failed";
    pub const SUBSCRIPTION_PAST_DUE: &str = "subscription.past_due";
}

impl WebhookEvent {
    pub fn for_transaction(transaction: &Transaction) -> Self {
        let event_type = match transaction.status {
            TransactionStatus::APPROVED => event_types::TRANSACTION_APPROVED,
            TransactionStatus::DECLINED => event_types::TRANSACTION_DECLINED,
            _ => event_types::TRANSACTION_ERROR,
        };
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            merchant_id: transaction.merchant_id,
            created_at: Utc::now(),
            data: serde_json::json!({
                "transaction_id": transaction.id,
                "transaction_type": transaction.tran_type,
                "status": transaction.status,
                "amount_cents": transaction.amount_cents,
                "currency": transaction.currency,
                "parent_transaction_id": transaction.parent_transaction_id,
                "root_transaction_id": transaction.root_transaction_id,
            }),
        }
    }
}

/// Entrega pendiente o realizada de un evento a una suscripción concreta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub event_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_response_status: Option<i32>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Disputa reportada por el gateway sobre una transacción nuestra.
/// Solo se registra para reporting; no dispara lógica de negocio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chargeback {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub transaction_id: Uuid,
    pub gateway_dispute_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub reason_code: Option<String>,
    pub status: String,
    pub received_at: DateTime<Utc>,
}
