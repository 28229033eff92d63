//! Cliente EPX: key exchange de Browser Post y llamadas Server Post.
//!
//! Este cliente es "crudo": habla el wire del gateway y normaliza la
//! respuesta. No reintenta ni conoce el circuit breaker; eso vive en la
//! envoltura de resiliencia (`resilient.rs`).

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::domain::error::PaymentError;
use crate::domain::gateways::{
    CardGateway, GatewayCredentials, GatewayResponse, GatewayTranGroup, KeyExchangeRequest,
    PrenoteOutcome, ServerPostRequest, TacGrant,
};

type HmacSha256 = Hmac<Sha256>;

/// Código de aprobación del gateway.
pub const APPROVED_CODE: &str = "00";

/// Clasificación de un código de respuesta del gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Approved,
    Declined,
    Transient,
    Rejected,
}

/// Tabla de clasificación de códigos. La lista completa no está documentada
/// por el gateway; los defaults cubren los códigos conocidos y el resto se
/// completa por configuración.
#[derive(Debug, Clone)]
pub struct ResponseCodeMap {
    transient: HashSet<String>,
    rejected: HashSet<String>,
}

impl Default for ResponseCodeMap {
    fn default() -> Self {
        let transient = ["91", "96", "TIMEOUT", "NETWORK ERROR"]
            .into_iter()
            .map(str::to_owned)
            .collect();
        let rejected = ["58", "INVALID", "FORMAT ERROR"]
            .into_iter()
            .map(str::to_owned)
            .collect();
        Self { transient, rejected }
    }
}

impl ResponseCodeMap {
    pub fn with_transient_codes(extra: &[String]) -> Self {
        let mut map = Self::default();
        map.transient.extend(extra.iter().cloned());
        map
    }

    pub fn classify(&self, code: &str) -> ResponseClass {
        let code = code.trim().to_uppercase();
        if code == APPROVED_CODE {
            ResponseClass::Approved
        } else if self.transient.contains(&code) {
            ResponseClass::Transient
        } else if self.rejected.contains(&code) {
            ResponseClass::Rejected
        } else {
            ResponseClass::Declined
        }
    }
}

pub struct EpxGateway {
    http: reqwest::Client,
    browser_post_url: String,
    server_post_url: String,
    timeout: Duration,
    code_map: ResponseCodeMap,
}

impl EpxGateway {
    pub fn new(
        browser_post_url: String,
        server_post_url: String,
        timeout: Duration,
        code_map: ResponseCodeMap,
    ) -> Self {
        // Pool de conexiones propio hacia el host del gateway, separado del
        // pool de webhooks salientes.
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(32)
            .timeout(timeout)
            .build()
            .expect("failed to build gateway HTTP client");
        Self {
            http,
            browser_post_url,
            server_post_url,
            timeout,
            code_map,
        }
    }

    pub fn code_map(&self) -> &ResponseCodeMap {
        &self.code_map
    }

    fn key_exchange_url(&self) -> String {
        format!("{}/keyexchange", self.browser_post_url.trim_end_matches('/'))
    }

    async fn post_form(
        &self,
        url: &str,
        fields: Vec<(String, String)>,
        mac_secret: &str,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, String>, PaymentError> {
        let body = sign_fields(fields, mac_secret)?;

        let request = self
            .http
            .post(url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .timeout(self.timeout)
            .body(body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(PaymentError::Canceled),
            result = request => result.map_err(map_reqwest_error)?,
        };

        let status = response.status();
        if status.is_server_error() {
            return Err(PaymentError::Transient(format!(
                "gateway returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(PaymentError::GatewayRejected(format!(
                "gateway returned {}",
                status
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let raw = response.text().await.map_err(map_reqwest_error)?;
        debug!(url, "gateway response received");

        if content_type.contains("xml") || raw.trim_start().starts_with('<') {
            parse_xml_fields(&raw)
        } else {
            parse_form_fields(&raw)
        }
    }

    fn normalize(&self, fields: &HashMap<String, String>) -> Result<GatewayResponse, PaymentError> {
        let code = fields
            .get("AUTH_RESP")
            .cloned()
            .ok_or_else(|| PaymentError::Transient("gateway response without AUTH_RESP".into()))?;

        match self.code_map.classify(&code) {
            ResponseClass::Transient => {
                return Err(PaymentError::Transient(format!(
                    "gateway transient response {}",
                    code
                )))
            }
            ResponseClass::Rejected => {
                return Err(PaymentError::GatewayRejected(format!(
                    "gateway rejected the request with {}: {}",
                    code,
                    fields.get("AUTH_RESP_TEXT").map(String::as_str).unwrap_or("")
                )))
            }
            ResponseClass::Approved | ResponseClass::Declined => {}
        }

        let approved = self.code_map.classify(&code) == ResponseClass::Approved;
        Ok(GatewayResponse {
            approved,
            response_code: code,
            response_text: fields.get("AUTH_RESP_TEXT").cloned(),
            authorization_code: fields.get("AUTH_CODE").cloned(),
            gateway_ref: fields.get("AUTH_GUID").cloned(),
            card_brand: fields.get("AUTH_CARD_TYPE").cloned(),
            masked_account: fields.get("AUTH_MASKED_ACCOUNT").cloned(),
        })
    }
}

#[async_trait]
impl CardGateway for EpxGateway {
    async fn key_exchange(
        &self,
        credentials: &GatewayCredentials,
        request: &KeyExchangeRequest,
        cancel: &CancellationToken,
    ) -> Result<TacGrant, PaymentError> {
        let mut fields = terminal_fields(credentials);
        fields.push(("TRAN_NBR".into(), request.transaction_id.to_string()));
        fields.push(("TRAN_GROUP".into(), request.tran_group.wire_value().into()));
        fields.push(("AMOUNT".into(), wire_amount(request.amount_cents)));
        fields.push(("CURRENCY_CODE".into(), request.currency.clone()));
        fields.push(("USER_DATA_1".into(), request.return_url.clone()));
        if let Some(customer) = &request.customer_echo {
            fields.push(("USER_DATA_2".into(), customer.clone()));
        }
        fields.push(("USER_DATA_3".into(), request.merchant_echo.clone()));

        let response = self
            .post_form(
                &self.key_exchange_url(),
                fields,
                &credentials.mac_secret,
                cancel,
            )
            .await?;

        let tac = response
            .get("TAC")
            .cloned()
            .ok_or_else(|| PaymentError::Transient("key exchange response without TAC".into()))?;

        Ok(TacGrant {
            tac,
            post_url: self.browser_post_url.clone(),
        })
    }

    async fn server_post(
        &self,
        credentials: &GatewayCredentials,
        request: &ServerPostRequest,
        cancel: &CancellationToken,
    ) -> Result<GatewayResponse, PaymentError> {
        let mut fields = terminal_fields(credentials);
        fields.push(("TRAN_NBR".into(), request.transaction_id.to_string()));
        fields.push(("TRAN_GROUP".into(), request.tran_group.wire_value().into()));
        fields.push(("AMOUNT".into(), wire_amount(request.amount_cents)));
        fields.push(("CURRENCY_CODE".into(), request.currency.clone()));
        if let Some(token) = &request.reuse_token {
            fields.push(("BRIC".into(), token.clone()));
        }
        if let Some(parent_ref) = &request.parent_gateway_ref {
            fields.push(("ORIG_AUTH_GUID".into(), parent_ref.clone()));
        }

        let response = self
            .post_form(
                &self.server_post_url,
                fields,
                &credentials.mac_secret,
                cancel,
            )
            .await?;

        self.normalize(&response)
    }

    async fn prenote_status(
        &self,
        credentials: &GatewayCredentials,
        reuse_token: &str,
        cancel: &CancellationToken,
    ) -> Result<PrenoteOutcome, PaymentError> {
        let mut fields = terminal_fields(credentials);
        fields.push(("TRAN_NBR".into(), Uuid::new_v4().to_string()));
        fields.push((
            "TRAN_GROUP".into(),
            GatewayTranGroup::AchPrenote.wire_value().into(),
        ));
        fields.push(("BRIC".into(), reuse_token.to_string()));

        let response = self
            .post_form(
                &self.server_post_url,
                fields,
                &credentials.mac_secret,
                cancel,
            )
            .await?;

        let code = response
            .get("AUTH_RESP")
            .cloned()
            .ok_or_else(|| PaymentError::Transient("prenote response without AUTH_RESP".into()))?;

        match code.as_str() {
            APPROVED_CODE => Ok(PrenoteOutcome::Verified),
            "PD" => Ok(PrenoteOutcome::Pending),
            other => Ok(PrenoteOutcome::Failed {
                reason_code: other.to_string(),
            }),
        }
    }
}

fn terminal_fields(credentials: &GatewayCredentials) -> Vec<(String, String)> {
    vec![
        ("CUST_NBR".into(), credentials.cust_nbr.clone()),
        ("MERCH_NBR".into(), credentials.merch_nbr.clone()),
        ("DBA_NBR".into(), credentials.dba_nbr.clone()),
        ("TERMINAL_NBR".into(), credentials.terminal_nbr.clone()),
    ]
}

/// Monto en el formato decimal del gateway: centavos -> "29.99".
pub fn wire_amount(amount_cents: i64) -> String {
    Decimal::new(amount_cents, 2).to_string()
}

/// Inverso de `wire_amount`: "29.99" -> 2999. Sin punto flotante en el camino.
pub fn parse_wire_amount(raw: &str) -> Result<i64, PaymentError> {
    use rust_decimal::prelude::ToPrimitive;

    let decimal: Decimal = raw
        .trim()
        .parse()
        .map_err(|_| PaymentError::Validation(format!("unparseable amount {:?}", raw)))?;
    let scaled = decimal * Decimal::new(100, 0);
    if !scaled.fract().is_zero() {
        return Err(PaymentError::Validation(format!(
            "amount {:?} is not a cent value",
            raw
        )));
    }
    scaled
        .to_i64()
        .ok_or_else(|| PaymentError::Validation(format!("amount {:?} out of range", raw)))
}

/// Firma MAC: HMAC-SHA256 sobre la lista de campos ordenada por clave,
/// serializada como K=V unidos por '&'. El resultado viaja en el campo MAC.
pub fn sign_fields(
    mut fields: Vec<(String, String)>,
    mac_secret: &str,
) -> Result<String, PaymentError> {
    fields.sort_by(|a, b| a.0.cmp(&b.0));
    let canonical = fields
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let mut mac = HmacSha256::new_from_slice(mac_secret.as_bytes())
        .map_err(|_| PaymentError::Internal("invalid MAC secret".into()))?;
    mac.update(canonical.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    fields.push(("MAC".into(), signature));
    serde_urlencoded::to_string(&fields)
        .map_err(|e| PaymentError::Internal(format!("failed to encode gateway body: {}", e)))
}

fn parse_form_fields(raw: &str) -> Result<HashMap<String, String>, PaymentError> {
    serde_urlencoded::from_str::<Vec<(String, String)>>(raw)
        .map(|pairs| pairs.into_iter().collect())
        .map_err(|e| PaymentError::Transient(format!("unparseable gateway response: {}", e)))
}

/// Extrae los pares del formato XML del gateway:
/// `<RESPONSE><FIELDS><FIELD KEY="TAC">...</FIELD></FIELDS></RESPONSE>`.
fn parse_xml_fields(raw: &str) -> Result<HashMap<String, String>, PaymentError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_str(raw);
    reader.config_mut().trim_text(true);

    let mut fields = HashMap::new();
    let mut current_key: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"FIELD" => {
                current_key = e
                    .attributes()
                    .flatten()
                    .find(|a| a.key.as_ref() == b"KEY")
                    .and_then(|a| String::from_utf8(a.value.into_owned()).ok());
            }
            Ok(Event::Text(t)) => {
                if let Some(key) = current_key.take() {
                    let value = t
                        .unescape()
                        .map_err(|e| {
                            PaymentError::Transient(format!("bad XML in gateway response: {}", e))
                        })?
                        .into_owned();
                    fields.insert(key, value);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"FIELD" => {
                current_key = None;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(PaymentError::Transient(format!(
                    "bad XML in gateway response: {}",
                    e
                )))
            }
        }
    }

    Ok(fields)
}

fn map_reqwest_error(error: reqwest::Error) -> PaymentError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        PaymentError::Transient(format!("gateway unreachable: {}", error))
    } else {
        PaymentError::GatewayRejected(format!("gateway call failed: {}", error))
    }
}
