use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use sqlx::PgPool;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::api::auth::AuthVerifier;
use crate::api::browser_post;
use crate::api::error::ApiError;
use crate::api::response::ApiResponse;
use crate::domain::entities::{BillingUnit, Chargeback, Transaction};
use crate::domain::error::PaymentError;
use crate::domain::repository::{ChargebackRepository, TransactionRepository};
use crate::use_cases::browser_post::BrowserPostUseCase;
use crate::use_cases::capture_payment::{CapturePaymentUseCase, CaptureRequest};
use crate::use_cases::get_transaction::GetTransactionUseCase;
use crate::use_cases::payment_methods::PaymentMethodsUseCase;
use crate::use_cases::process_payment::{PaymentRequest, ProcessPaymentUseCase};
use crate::use_cases::refund_payment::{RefundPaymentUseCase, RefundRequest};
use crate::use_cases::subscriptions::{CreateSubscriptionRequest, ManageSubscriptionsUseCase};
use crate::use_cases::void_payment::{VoidPaymentUseCase, VoidRequest};
use crate::use_cases::webhook_subscriptions::{
    UpsertWebhookSubscriptionRequest, WebhookSubscriptionsUseCase,
};

/// Presupuesto de la capa de servicio; el deadline externo del RPC es mayor
/// y las consultas internas corren bajo sus propios tiers.
const SERVICE_DEADLINE: Duration = Duration::from_secs(50);

// Estado compartido de la aplicación
pub struct AppState {
    pub auth: AuthVerifier,
    pub payments: Arc<ProcessPaymentUseCase>,
    pub captures: CapturePaymentUseCase,
    pub voids: VoidPaymentUseCase,
    pub refunds: RefundPaymentUseCase,
    pub browser_post: Arc<BrowserPostUseCase>,
    pub payment_methods: PaymentMethodsUseCase,
    pub subscriptions: ManageSubscriptionsUseCase,
    pub webhook_subscriptions: WebhookSubscriptionsUseCase,
    pub queries: GetTransactionUseCase,
    pub chargebacks: Arc<dyn ChargebackRepository>,
    pub transactions: Arc<dyn TransactionRepository>,
    pub pool: PgPool,
    /// Tamaño configurado del pool, para el reporte de salud.
    pub pool_max_connections: u32,
    /// Token raíz de apagado; cada request deriva un hijo.
    pub shutdown: CancellationToken,
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/payments/authorize", post(authorize))
        .route("/payments/sale", post(sale))
        .route("/payments/{parent_id}/capture", post(capture))
        .route("/payments/{parent_id}/void", post(void))
        .route("/payments/{parent_id}/refund", post(refund))
        .route("/transactions", get(list_transactions))
        .route("/transactions/{id}", get(get_transaction))
        .route("/transactions/{id}/group", get(get_transaction_group))
        .route("/tokenize", post(browser_post::tokenize))
        .route("/browser-post/form-config", post(browser_post::form_config))
        .route("/browser-post/callback", post(browser_post::callback))
        .route("/payment-methods", get(list_payment_methods))
        .route("/payment-methods/{id}", get(get_payment_method))
        .route("/payment-methods/{id}", delete(deactivate_payment_method))
        .route("/subscriptions", post(create_subscription))
        .route("/subscriptions", get(list_subscriptions))
        .route("/subscriptions/{id}", get(get_subscription))
        .route("/subscriptions/{id}/cancel", post(cancel_subscription))
        .route("/subscriptions/{id}/reactivate", post(reactivate_subscription))
        .route("/webhook-subscriptions", post(create_webhook_subscription))
        .route("/webhook-subscriptions", get(list_webhook_subscriptions))
        .route("/webhook-subscriptions/{id}", get(get_webhook_subscription))
        .route("/webhook-subscriptions/{id}", put(update_webhook_subscription))
        .route("/webhook-subscriptions/{id}", delete(delete_webhook_subscription))
        .route("/chargebacks", get(list_chargebacks))
        .route("/chargebacks/ingest", post(ingest_chargeback))
        .route("/health", get(health))
        .with_state(state)
}

pub(crate) fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

/// Corre la operación bajo el presupuesto de la capa de servicio y la señal
/// de apagado; lo que venza primero la cancela.
pub(crate) async fn bounded<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = Result<T, PaymentError>>,
) -> Result<T, PaymentError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(PaymentError::Canceled),
        result = tokio::time::timeout(SERVICE_DEADLINE, operation) => {
            result.map_err(|_| PaymentError::Canceled)?
        }
    }
}

// DTO de entrada para authorize/sale
#[derive(Deserialize, ToSchema)]
pub struct InitiatePaymentRequest {
    /// Clave de idempotencia elegida por el cliente; estable entre reintentos.
    pub transaction_id: Uuid,
    pub merchant_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub payment_method_id: Uuid,
    /// Centavos enteros; nunca decimales en el wire.
    pub amount_cents: i64,
    pub currency: String,
}

impl InitiatePaymentRequest {
    fn into_payment_request(self) -> PaymentRequest {
        PaymentRequest {
            transaction_id: self.transaction_id,
            merchant_id: self.merchant_id,
            customer_id: self.customer_id,
            payment_method_id: self.payment_method_id,
            subscription_id: None,
            amount_cents: self.amount_cents,
            currency: self.currency,
        }
    }
}

// POST /payments/authorize
#[utoipa::path(
    post,
    path = "/payments/authorize",
    request_body = InitiatePaymentRequest,
    responses((status = 200, body = ApiResponse<serde_json::Value>))
)]
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<InitiatePaymentRequest>,
) -> Result<Json<ApiResponse<Transaction>>, ApiError> {
    state
        .auth
        .authorize_merchant(bearer(&headers), payload.merchant_id)?;
    let cancel = state.shutdown.child_token();
    let transaction = bounded(
        &cancel,
        state.payments.authorize(payload.into_payment_request(), &cancel),
    )
    .await?;
    Ok(Json(ApiResponse::success(transaction)))
}

// POST /payments/sale
#[utoipa::path(
    post,
    path = "/payments/sale",
    request_body = InitiatePaymentRequest,
    responses((status = 200, body = ApiResponse<serde_json::Value>))
)]
pub async fn sale(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<InitiatePaymentRequest>,
) -> Result<Json<ApiResponse<Transaction>>, ApiError> {
    state
        .auth
        .authorize_merchant(bearer(&headers), payload.merchant_id)?;
    let cancel = state.shutdown.child_token();
    let transaction = bounded(
        &cancel,
        state.payments.sale(payload.into_payment_request(), &cancel),
    )
    .await?;
    Ok(Json(ApiResponse::success(transaction)))
}

#[derive(Deserialize, ToSchema)]
pub struct ChildOperationRequest {
    pub transaction_id: Uuid,
    pub merchant_id: Uuid,
    /// Requerido para capture y refund; ignorado en void.
    pub amount_cents: Option<i64>,
}

// POST /payments/{parent_id}/capture
#[utoipa::path(
    post,
    path = "/payments/{parent_id}/capture",
    request_body = ChildOperationRequest,
    responses((status = 200, body = ApiResponse<serde_json::Value>))
)]
pub async fn capture(
    State(state): State<Arc<AppState>>,
    Path(parent_id): Path<Uuid>,
    headers: HeaderMap,
    Json(payload): Json<ChildOperationRequest>,
) -> Result<Json<ApiResponse<Transaction>>, ApiError> {
    state
        .auth
        .authorize_merchant(bearer(&headers), payload.merchant_id)?;
    let amount_cents = payload.amount_cents.ok_or_else(|| {
        PaymentError::Validation("amount_cents is required for capture".to_string())
    })?;
    let cancel = state.shutdown.child_token();
    let transaction = bounded(
        &cancel,
        state.captures.execute(
            CaptureRequest {
                transaction_id: payload.transaction_id,
                parent_transaction_id: parent_id,
                merchant_id: payload.merchant_id,
                amount_cents,
            },
            &cancel,
        ),
    )
    .await?;
    Ok(Json(ApiResponse::success(transaction)))
}

// POST /payments/{parent_id}/void
pub async fn void(
    State(state): State<Arc<AppState>>,
    Path(parent_id): Path<Uuid>,
    headers: HeaderMap,
    Json(payload): Json<ChildOperationRequest>,
) -> Result<Json<ApiResponse<Transaction>>, ApiError> {
    state
        .auth
        .authorize_merchant(bearer(&headers), payload.merchant_id)?;
    let cancel = state.shutdown.child_token();
    let transaction = bounded(
        &cancel,
        state.voids.execute(
            VoidRequest {
                transaction_id: payload.transaction_id,
                parent_transaction_id: parent_id,
                merchant_id: payload.merchant_id,
            },
            &cancel,
        ),
    )
    .await?;
    Ok(Json(ApiResponse::success(transaction)))
}

// POST /payments/{parent_id}/refund
#[utoipa::path(
    post,
    path = "/payments/{parent_id}/refund",
    request_body = ChildOperationRequest,
    responses((status = 200, body = ApiResponse<serde_json::Value>))
)]
pub async fn refund(
    State(state): State<Arc<AppState>>,
    Path(parent_id): Path<Uuid>,
    headers: HeaderMap,
    Json(payload): Json<ChildOperationRequest>,
) -> Result<Json<ApiResponse<Transaction>>, ApiError> {
    state
        .auth
        .authorize_merchant(bearer(&headers), payload.merchant_id)?;
    let amount_cents = payload.amount_cents.ok_or_else(|| {
        PaymentError::Validation("amount_cents is required for refund".to_string())
    })?;
    let cancel = state.shutdown.child_token();
    let transaction = bounded(
        &cancel,
        state.refunds.execute(
            RefundRequest {
                transaction_id: payload.transaction_id,
                parent_transaction_id: parent_id,
                merchant_id: payload.merchant_id,
                amount_cents,
            },
            &cancel,
        ),
    )
    .await?;
    Ok(Json(ApiResponse::success(transaction)))
}

#[derive(Deserialize)]
pub struct ListTransactionsQuery {
    pub customer_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

// GET /transactions (alcance: el comercio del token)
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListTransactionsQuery>,
) -> Result<Json<ApiResponse<Vec<Transaction>>>, ApiError> {
    let claims = state.auth.verify(bearer(&headers))?;
    let cancel = state.shutdown.child_token();
    let transactions = bounded(
        &cancel,
        state
            .queries
            .list(claims.sub, query.customer_id, query.limit, query.offset),
    )
    .await?;
    Ok(Json(ApiResponse::success(transactions)))
}

// GET /transactions/{id}
#[utoipa::path(
    get,
    path = "/transactions/{id}",
    responses((status = 200, body = ApiResponse<serde_json::Value>))
)]
pub async fn get_transaction(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Transaction>>, ApiError> {
    let claims = state.auth.verify(bearer(&headers))?;
    let cancel = state.shutdown.child_token();
    let transaction = bounded(&cancel, state.queries.get(id, claims.sub)).await?;
    Ok(Json(ApiResponse::success(transaction)))
}

// GET /transactions/{id}/group
pub async fn get_transaction_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<Transaction>>>, ApiError> {
    let claims = state.auth.verify(bearer(&headers))?;
    let cancel = state.shutdown.child_token();
    let group = bounded(&cancel, state.queries.group(id, claims.sub)).await?;
    Ok(Json(ApiResponse::success(group)))
}

// GET /payment-methods
pub async fn list_payment_methods(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<crate::domain::entities::PaymentMethod>>>, ApiError> {
    let claims = state.auth.verify(bearer(&headers))?;
    let cancel = state.shutdown.child_token();
    let methods = bounded(&cancel, state.payment_methods.list(claims.sub)).await?;
    Ok(Json(ApiResponse::success(methods)))
}

// GET /payment-methods/{id}
pub async fn get_payment_method(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<crate::domain::entities::PaymentMethod>>, ApiError> {
    let claims = state.auth.verify(bearer(&headers))?;
    let cancel = state.shutdown.child_token();
    let method = bounded(&cancel, state.payment_methods.get(id, claims.sub)).await?;
    Ok(Json(ApiResponse::success(method)))
}

// DELETE /payment-methods/{id} (baja lógica)
pub async fn deactivate_payment_method(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let claims = state.auth.verify(bearer(&headers))?;
    let cancel = state.shutdown.child_token();
    bounded(&cancel, state.payment_methods.deactivate(id, claims.sub)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, ToSchema)]
pub struct CreateSubscriptionBody {
    pub merchant_id: Uuid,
    pub customer_id: Uuid,
    pub payment_method_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub cadence_count: i32,
    #[schema(value_type = String)]
    pub cadence_unit: BillingUnit,
    #[schema(value_type = String)]
    pub first_billing_at: chrono::DateTime<chrono::Utc>,
}

// POST /subscriptions
pub async fn create_subscription(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateSubscriptionBody>,
) -> Result<Json<ApiResponse<crate::domain::entities::Subscription>>, ApiError> {
    state
        .auth
        .authorize_merchant(bearer(&headers), payload.merchant_id)?;
    let cancel = state.shutdown.child_token();
    let subscription = bounded(
        &cancel,
        state.subscriptions.create(CreateSubscriptionRequest {
            merchant_id: payload.merchant_id,
            customer_id: payload.customer_id,
            payment_method_id: payload.payment_method_id,
            amount_cents: payload.amount_cents,
            currency: payload.currency,
            cadence_count: payload.cadence_count,
            cadence_unit: payload.cadence_unit,
            first_billing_at: payload.first_billing_at,
        }),
    )
    .await?;
    Ok(Json(ApiResponse::success(subscription)))
}

// GET /subscriptions
pub async fn list_subscriptions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<crate::domain::entities::Subscription>>>, ApiError> {
    let claims = state.auth.verify(bearer(&headers))?;
    let cancel = state.shutdown.child_token();
    let subscriptions = bounded(&cancel, state.subscriptions.list(claims.sub)).await?;
    Ok(Json(ApiResponse::success(subscriptions)))
}

// GET /subscriptions/{id}
pub async fn get_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<crate::domain::entities::Subscription>>, ApiError> {
    let claims = state.auth.verify(bearer(&headers))?;
    let cancel = state.shutdown.child_token();
    let subscription = bounded(&cancel, state.subscriptions.get(id, claims.sub)).await?;
    Ok(Json(ApiResponse::success(subscription)))
}

// POST /subscriptions/{id}/cancel
pub async fn cancel_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<crate::domain::entities::Subscription>>, ApiError> {
    let claims = state.auth.verify(bearer(&headers))?;
    let cancel = state.shutdown.child_token();
    let subscription = bounded(&cancel, state.subscriptions.cancel(id, claims.sub)).await?;
    Ok(Json(ApiResponse::success(subscription)))
}

// POST /subscriptions/{id}/reactivate
pub async fn reactivate_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<crate::domain::entities::Subscription>>, ApiError> {
    let claims = state.auth.verify(bearer(&headers))?;
    let cancel = state.shutdown.child_token();
    let subscription = bounded(&cancel, state.subscriptions.reactivate(id, claims.sub)).await?;
    Ok(Json(ApiResponse::success(subscription)))
}

#[derive(Deserialize, ToSchema)]
pub struct WebhookSubscriptionBody {
    pub merchant_id: Uuid,
    pub url: String,
    pub signing_key: Option<String>,
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl WebhookSubscriptionBody {
    fn into_request(self) -> UpsertWebhookSubscriptionRequest {
        UpsertWebhookSubscriptionRequest {
            merchant_id: self.merchant_id,
            url: self.url,
            signing_key: self.signing_key,
            event_types: self.event_types,
            active: self.active,
        }
    }
}

// POST /webhook-subscriptions
pub async fn create_webhook_subscription(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<WebhookSubscriptionBody>,
) -> Result<Json<ApiResponse<crate::domain::entities::WebhookSubscription>>, ApiError> {
    state
        .auth
        .authorize_merchant(bearer(&headers), payload.merchant_id)?;
    let cancel = state.shutdown.child_token();
    let subscription = bounded(
        &cancel,
        state.webhook_subscriptions.create(payload.into_request()),
    )
    .await?;
    Ok(Json(ApiResponse::success(subscription)))
}

// GET /webhook-subscriptions
pub async fn list_webhook_subscriptions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<crate::domain::entities::WebhookSubscription>>>, ApiError> {
    let claims = state.auth.verify(bearer(&headers))?;
    let cancel = state.shutdown.child_token();
    let subscriptions = bounded(&cancel, state.webhook_subscriptions.list(claims.sub)).await?;
    Ok(Json(ApiResponse::success(subscriptions)))
}

// GET /webhook-subscriptions/{id}
pub async fn get_webhook_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<crate::domain::entities::WebhookSubscription>>, ApiError> {
    let claims = state.auth.verify(bearer(&headers))?;
    let cancel = state.shutdown.child_token();
    let subscription = bounded(&cancel, state.webhook_subscriptions.get(id, claims.sub)).await?;
    Ok(Json(ApiResponse::success(subscription)))
}

// PUT /webhook-subscriptions/{id}
pub async fn update_webhook_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(payload): Json<WebhookSubscriptionBody>,
) -> Result<Json<ApiResponse<crate::domain::entities::WebhookSubscription>>, ApiError> {
    state
        .auth
        .authorize_merchant(bearer(&headers), payload.merchant_id)?;
    let cancel = state.shutdown.child_token();
    let subscription = bounded(
        &cancel,
        state
            .webhook_subscriptions
            .update(id, payload.into_request()),
    )
    .await?;
    Ok(Json(ApiResponse::success(subscription)))
}

// DELETE /webhook-subscriptions/{id}
pub async fn delete_webhook_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let claims = state.auth.verify(bearer(&headers))?;
    let cancel = state.shutdown.child_token();
    bounded(&cancel, state.webhook_subscriptions.delete(id, claims.sub)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// GET /chargebacks
pub async fn list_chargebacks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<Chargeback>>>, ApiError> {
    let claims = state.auth.verify(bearer(&headers))?;
    let cancel = state.shutdown.child_token();
    let chargebacks = bounded(&cancel, state.chargebacks.list_by_merchant(claims.sub)).await?;
    Ok(Json(ApiResponse::success(chargebacks)))
}

#[derive(Deserialize, ToSchema)]
pub struct IngestChargebackBody {
    pub gateway_dispute_id: String,
    pub transaction_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub reason_code: Option<String>,
    pub status: String,
}

// POST /chargebacks/ingest — reporte de disputa del gateway. El comercio se
// resuelve de la transacción original, nunca del cuerpo.
pub async fn ingest_chargeback(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<IngestChargebackBody>,
) -> Result<Json<ApiResponse<Chargeback>>, ApiError> {
    let cancel = state.shutdown.child_token();
    let chargeback = bounded(&cancel, async {
        let transaction = state
            .transactions
            .find_by_id(payload.transaction_id)
            .await?
            .ok_or(PaymentError::NotFound(payload.transaction_id))?;

        state
            .chargebacks
            .upsert(Chargeback {
                id: Uuid::new_v4(),
                merchant_id: transaction.merchant_id,
                transaction_id: transaction.id,
                gateway_dispute_id: payload.gateway_dispute_id,
                amount_cents: payload.amount_cents,
                currency: payload.currency,
                reason_code: payload.reason_code,
                status: payload.status,
                received_at: chrono::Utc::now(),
            })
            .await
    })
    .await?;
    Ok(Json(ApiResponse::success(chargeback)))
}

// GET /health — saturación del pool observable antes de que sea fatal
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": if state.shutdown.is_cancelled() { "draining" } else { "ok" },
        "db_pool": {
            "size": state.pool.size(),
            "idle": state.pool.num_idle(),
            "max": state.pool_max_connections,
        },
    }))
}
