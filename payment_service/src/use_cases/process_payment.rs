//! Caso de uso central: AUTHORIZE y SALE contra un método de pago guardado.
//!
//! Protocolo de idempotencia (crítico, ver también capture/void/refund):
//! 1. Se abre la unidad de trabajo del grupo, que toma el lock de la raíz.
//! 2. Si ya existe una fila confirmada con el id pedido se devuelve tal cual.
//! 3. Se inserta la fila en PENDING, se llama al gateway con el MISMO id
//!    (su campo de idempotencia) con el lock tomado, se registra el
//!    resultado y el evento de outbox, y se confirma todo junto.
//! Un duplicado concurrente queda bloqueado en el paso 1 hasta el commit y
//! entonces lee la fila confirmada: dos callers jamás ven resultados
//! distintos para el mismo id.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::domain::entities::{Transaction, TransactionType};
use crate::domain::error::PaymentError;
use crate::domain::gateways::{CardGateway, GatewayTranGroup, ServerPostRequest};
use crate::domain::repository::{PaymentMethodRepository, TransactionRepository};
use crate::infrastructure::credentials::CredentialResolver;
use crate::use_cases::finalize_with_gateway;

#[derive(Debug, Clone)]
pub struct PaymentRequest {
    /// Clave de idempotencia elegida por el iniciador, reutilizada verbatim
    /// en cada reintento (incluida la llamada al gateway).
    pub transaction_id: Uuid,
    pub merchant_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub payment_method_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub amount_cents: i64,
    pub currency: String,
}

/// Caso de uso central para el procesamiento de pagos con método guardado.
///
/// Coordina el gating del método, la resolución de credenciales, la unidad
/// de trabajo del grupo y la llamada Server Post al gateway.
///
/// # Examples
/// ```ignore
/// use payment_service::use_cases::process_payment::ProcessPaymentUseCase;
/// use std::sync::Arc;
///
/// let use_case = ProcessPaymentUseCase::new(transactions, methods, credentials, gateway);
/// let transaction = use_case.sale(request, &cancel).await?;
/// ```
pub struct ProcessPaymentUseCase {
    transactions: Arc<dyn TransactionRepository>,
    payment_methods: Arc<dyn PaymentMethodRepository>,
    credentials: Arc<CredentialResolver>,
    gateway: Arc<dyn CardGateway>,
}

impl ProcessPaymentUseCase {
    pub fn new(
        transactions: Arc<dyn TransactionRepository>,
        payment_methods: Arc<dyn PaymentMethodRepository>,
        credentials: Arc<CredentialResolver>,
        gateway: Arc<dyn CardGateway>,
    ) -> Self {
        Self {
            transactions,
            payment_methods,
            credentials,
            gateway,
        }
    }

    pub async fn authorize(
        &self,
        request: PaymentRequest,
        cancel: &CancellationToken,
    ) -> Result<Transaction, PaymentError> {
        self.execute(TransactionType::AUTHORIZE, request, cancel).await
    }

    pub async fn sale(
        &self,
        request: PaymentRequest,
        cancel: &CancellationToken,
    ) -> Result<Transaction, PaymentError> {
        self.execute(TransactionType::SALE, request, cancel).await
    }

    async fn execute(
        &self,
        tran_type: TransactionType,
        request: PaymentRequest,
        cancel: &CancellationToken,
    ) -> Result<Transaction, PaymentError> {
        // 1. Construir la raíz valida la forma (monto positivo, divisa ISO)
        let mut transaction = Transaction::new_root(
            request.transaction_id,
            request.merchant_id,
            tran_type,
            request.amount_cents,
            &request.currency,
        )?;
        transaction.customer_id = request.customer_id;
        transaction.payment_method_id = Some(request.payment_method_id);
        transaction.subscription_id = request.subscription_id;

        // 2. Gating del método ANTES de cualquier contacto con el gateway:
        // un ACH sin verificar corta acá con InvalidState
        let method = self
            .payment_methods
            .find_by_id(request.payment_method_id)
            .await?
            .ok_or(PaymentError::NotFound(request.payment_method_id))?;
        if method.merchant_id != request.merchant_id {
            return Err(PaymentError::Unauthorized(
                "payment method belongs to another merchant".to_string(),
            ));
        }
        method.ensure_usable()?;

        // 3. Credenciales (cacheadas, singleflight)
        let resolved = self.credentials.get(request.merchant_id).await?;

        // 4. Unidad de trabajo con el lock del grupo (la raíz es este mismo id)
        let mut op = self
            .transactions
            .begin_group_operation(request.transaction_id)
            .await?;

        if let Some(existing) = op.find_existing(request.transaction_id).await? {
            // Replay: misma respuesta confirmada, sin nueva fila ni llamada
            op.commit().await?;
            info!(transaction_id = %existing.id, "idempotent replay");
            return Ok(existing);
        }

        op.insert_pending(&transaction).await?;

        let gateway_request = ServerPostRequest {
            transaction_id: request.transaction_id,
            tran_group: match tran_type {
                TransactionType::SALE => GatewayTranGroup::Sale,
                _ => GatewayTranGroup::Auth,
            },
            amount_cents: request.amount_cents,
            currency: transaction.currency.clone(),
            reuse_token: Some(method.reuse_token.clone()),
            parent_gateway_ref: None,
        };

        let committed = finalize_with_gateway(
            op,
            self.gateway.as_ref(),
            &resolved.credentials,
            &gateway_request,
            cancel,
        )
        .await?;

        info!(
            transaction_id = %committed.id,
            status = ?committed.status,
            "payment processed"
        );
        Ok(committed)
    }
}
