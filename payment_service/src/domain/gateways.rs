use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::error::PaymentError;

/// Credenciales resueltas de un comercio para hablar con el gateway:
/// identificadores de terminal más el MAC secret ya traído del secret store.
#[derive(Debug, Clone)]
pub struct GatewayCredentials {
    pub cust_nbr: String,
    pub merch_nbr: String,
    pub dba_nbr: String,
    pub terminal_nbr: String,
    pub mac_secret: String,
}

/// Grupo de transacción en la nomenclatura del gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayTranGroup {
    Sale,
    Auth,
    Storage,
    Capture,
    Void,
    Refund,
    AchPrenote,
}

impl GatewayTranGroup {
    /// Valor del campo TRAN_GROUP en el wire del gateway.
    pub fn wire_value(&self) -> &'static str {
        match self {
            GatewayTranGroup::Sale => "SALE",
            GatewayTranGroup::Auth => "AUTH",
            GatewayTranGroup::Storage => "STORAGE",
            GatewayTranGroup::Capture => "CAPTURE",
            GatewayTranGroup::Void => "VOID",
            GatewayTranGroup::Refund => "REFUND",
            GatewayTranGroup::AchPrenote => "ACH_PRENOTE",
        }
    }
}

/// Solicitud de key exchange (Browser Post): a cambio entrega el TAC de un solo uso.
#[derive(Debug, Clone)]
pub struct KeyExchangeRequest {
    /// Id elegido por el cliente; viaja como TRAN_NBR y vuelve en el callback.
    pub transaction_id: Uuid,
    pub tran_group: GatewayTranGroup,
    pub amount_cents: i64,
    pub currency: String,
    /// URL del cliente a la que redirigimos el browser al final del flujo.
    pub return_url: String,
    pub customer_echo: Option<String>,
    pub merchant_echo: String,
}

/// TAC emitido por el key exchange, con la URL del formulario a renderizar.
#[derive(Debug, Clone)]
pub struct TacGrant {
    pub tac: String,
    pub post_url: String,
}

/// Llamada Server Post contra el gateway.
#[derive(Debug, Clone)]
pub struct ServerPostRequest {
    /// Clave de idempotencia; idéntica en todos los reintentos (TRAN_NBR).
    pub transaction_id: Uuid,
    pub tran_group: GatewayTranGroup,
    pub amount_cents: i64,
    pub currency: String,
    /// BRIC almacenado, cuando la operación referencia un método guardado.
    pub reuse_token: Option<String>,
    /// AUTH_GUID de la transacción padre, para capture/void/refund.
    pub parent_gateway_ref: Option<String>,
}

/// Respuesta normalizada del gateway. Un decline es un resultado de negocio
/// exitoso de la llamada, no un error.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub approved: bool,
    /// Código crudo del gateway (AUTH_RESP); "00" = aprobado.
    pub response_code: String,
    pub response_text: Option<String>,
    /// Código del emisor cuando la operación fue aprobada.
    pub authorization_code: Option<String>,
    /// Referencia del gateway a esta operación (AUTH_GUID); sirve como BRIC
    /// reutilizable cuando se pidió STORAGE.
    pub gateway_ref: Option<String>,
    pub card_brand: Option<String>,
    pub masked_account: Option<String>,
}

/// Resultado de la consulta del pre-note ACH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrenoteOutcome {
    Pending,
    Verified,
    Failed { reason_code: String },
}

/// Port hacia el gateway de tarjetas (ambos modos de integración).
///
/// Los errores transitorios llegan como `PaymentError::Transient`; la envoltura
/// de resiliencia decide reintentos. `CircuitOpen`/`Overloaded` los produce la
/// envoltura, nunca el cliente crudo.
#[async_trait]
pub trait CardGateway: Send + Sync {
    async fn key_exchange(
        &self,
        credentials: &GatewayCredentials,
        request: &KeyExchangeRequest,
        cancel: &CancellationToken,
    ) -> Result<TacGrant, PaymentError>;

    async fn server_post(
        &self,
        credentials: &GatewayCredentials,
        request: &ServerPostRequest,
        cancel: &CancellationToken,
    ) -> Result<GatewayResponse, PaymentError>;

    async fn prenote_status(
        &self,
        credentials: &GatewayCredentials,
        reuse_token: &str,
        cancel: &CancellationToken,
    ) -> Result<PrenoteOutcome, PaymentError>;
}

/// Port hacia el secret store externo que custodia los MAC secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn fetch_mac_secret(&self, secret_ref: &str) -> Result<String, PaymentError>;
}
