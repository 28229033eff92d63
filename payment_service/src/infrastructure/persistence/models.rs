use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::domain::entities::{
    BillingUnit, Chargeback, DeliveryStatus, Merchant, PaymentMethod, PaymentMethodKind,
    Subscription, SubscriptionStatus, Transaction, TransactionStatus, TransactionType,
    VerificationStatus, WebhookDelivery, WebhookSubscription,
};

#[derive(Debug, FromRow)]
pub struct MerchantModel {
    pub id: Uuid,
    pub slug: String,
    pub cust_nbr: String,
    pub merch_nbr: String,
    pub dba_nbr: String,
    pub terminal_nbr: String,
    pub mac_secret_ref: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<MerchantModel> for Merchant {
    fn from(m: MerchantModel) -> Self {
        Self {
            id: m.id,
            slug: m.slug,
            cust_nbr: m.cust_nbr,
            merch_nbr: m.merch_nbr,
            dba_nbr: m.dba_nbr,
            terminal_nbr: m.terminal_nbr,
            mac_secret_ref: m.mac_secret_ref,
            active: m.active,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct PaymentMethodModel {
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

impl From<PaymentMethodModel> for PaymentMethod {
    fn from(m: PaymentMethodModel) -> Self {
        Self {
            id: m.id,
            merchant_id: m.merchant_id,
            customer_id: m.customer_id,
            kind: m.kind,
            brand: m.brand,
            last_four: m.last_four,
            reuse_token: m.reuse_token,
            verification_status: m.verification_status,
            verification_failure_code: m.verification_failure_code,
            active: m.active,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct TransactionModel {
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

impl From<&Transaction> for TransactionModel {
    fn from(t: &Transaction) -> Self {
        Self {
            id: t.id,
            merchant_id: t.merchant_id,
            customer_id: t.customer_id,
            payment_method_id: t.payment_method_id,
            subscription_id: t.subscription_id,
            tran_type: t.tran_type,
            parent_transaction_id: t.parent_transaction_id,
            root_transaction_id: t.root_transaction_id,
            amount_cents: t.amount_cents,
            currency: t.currency.clone(),
            status: t.status,
            gateway_response_code: t.gateway_response_code.clone(),
            authorization_code: t.authorization_code.clone(),
            reuse_token: t.reuse_token.clone(),
            created_at: t.created_at,
            updated_at: t.updated_at,
        }
    }
}

impl From<TransactionModel> for Transaction {
    fn from(m: TransactionModel) -> Self {
        Self {
            id: m.id,
            merchant_id: m.merchant_id,
            customer_id: m.customer_id,
            payment_method_id: m.payment_method_id,
            subscription_id: m.subscription_id,
            tran_type: m.tran_type,
            parent_transaction_id: m.parent_transaction_id,
            root_transaction_id: m.root_transaction_id,
            amount_cents: m.amount_cents,
            currency: m.currency,
            status: m.status,
            gateway_response_code: m.gateway_response_code,
            authorization_code: m.authorization_code,
            reuse_token: m.reuse_token,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct SubscriptionModel {
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

impl From<SubscriptionModel> for Subscription {
    fn from(m: SubscriptionModel) -> Self {
        Self {
            id: m.id,
            merchant_id: m.merchant_id,
            customer_id: m.customer_id,
            payment_method_id: m.payment_method_id,
            amount_cents: m.amount_cents,
            currency: m.currency,
            cadence_count: m.cadence_count,
            cadence_unit: m.cadence_unit,
            next_billing_at: m.next_billing_at,
            status: m.status,
            last_attempt_at: m.last_attempt_at,
            consecutive_failures: m.consecutive_failures,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct WebhookSubscriptionModel {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub url: String,
    pub signing_key: String,
    pub event_types: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<WebhookSubscriptionModel> for WebhookSubscription {
    fn from(m: WebhookSubscriptionModel) -> Self {
        Self {
            id: m.id,
            merchant_id: m.merchant_id,
            url: m.url,
            signing_key: m.signing_key,
            event_types: m.event_types,
            active: m.active,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct WebhookDeliveryModel {
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

impl From<WebhookDeliveryModel> for WebhookDelivery {
    fn from(m: WebhookDeliveryModel) -> Self {
        Self {
            id: m.id,
            subscription_id: m.subscription_id,
            event_id: m.event_id,
            event_type: m.event_type,
            payload: m.payload,
            status: m.status,
            attempts: m.attempts,
            next_attempt_at: m.next_attempt_at,
            last_response_status: m.last_response_status,
            last_error: m.last_error,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct ChargebackModel {
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

impl From<ChargebackModel> for Chargeback {
    fn from(m: ChargebackModel) -> Self {
        Self {
            id: m.id,
            merchant_id: m.merchant_id,
            transaction_id: m.transaction_id,
            gateway_dispute_id: m.gateway_dispute_id,
            amount_cents: m.amount_cents,
            currency: m.currency,
            reason_code: m.reason_code,
            status: m.status,
            received_at: m.received_at,
        }
    }
}
