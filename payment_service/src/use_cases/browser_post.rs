//! Flujo Browser Post: emisión del form config firmado y completado
//! idempotente del callback asíncrono del gateway.
//!
//! El callback es la fuente de verdad de la transacción creada por este
//! flujo: el gateway lo reintenta ante no-200, así que callbacks duplicados
//! no deben producir filas nuevas. El comercio se resuelve SIEMPRE del campo
//! echo del gateway, nunca de headers del cliente.

use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::entities::{
    PaymentMethod, PaymentMethodKind, Transaction, TransactionStatus, TransactionType,
    VerificationStatus, WebhookEvent,
};
use crate::domain::error::PaymentError;
use crate::domain::gateways::{CardGateway, GatewayTranGroup, KeyExchangeRequest};
use crate::domain::repository::{
    PaymentMethodRepository, TransactionOutcome, TransactionRepository,
};
use crate::infrastructure::credentials::CredentialResolver;
use crate::infrastructure::gateways::epx::{parse_wire_amount, wire_amount, APPROVED_CODE};

#[derive(Debug, Clone)]
pub struct FormConfigRequest {
    /// Id elegido por el cliente; será la clave de idempotencia de la
    /// transacción que el callback complete.
    pub transaction_id: Uuid,
    pub merchant_id: Uuid,
    pub transaction_type: GatewayTranGroup,
    pub amount_cents: i64,
    pub currency: String,
    pub return_url: String,
    pub customer_id: Option<Uuid>,
}

/// Lo que el cliente necesita para renderizar el formulario del gateway.
#[derive(Debug, Clone)]
pub struct FormConfig {
    pub post_url: String,
    pub tac: String,
    pub transaction_id: Uuid,
    /// Campos de identificación que el formulario debe incluir tal cual.
    pub fields: Vec<(String, String)>,
}

/// Campos del callback ya validados.
#[derive(Debug, Clone)]
pub struct CallbackFields {
    pub transaction_id: Uuid,
    /// Echo del comercio (USER_DATA_3): id o slug, según lo que se haya
    /// sembrado en el formulario.
    pub merchant_echo: String,
    pub tran_group: GatewayTranGroup,
    pub response_code: String,
    pub response_text: Option<String>,
    pub authorization_code: Option<String>,
    pub gateway_ref: Option<String>,
    pub card_brand: Option<String>,
    pub masked_account: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub return_url: String,
    pub customer_id: Option<Uuid>,
}

impl CallbackFields {
    /// Valida el cuerpo form-encoded del gateway. Campos requeridos
    /// faltantes rechazan el callback completo.
    pub fn parse(fields: &HashMap<String, String>) -> Result<Self, PaymentError> {
        let require = |key: &str| {
            fields
                .get(key)
                .filter(|v| !v.trim().is_empty())
                .cloned()
                .ok_or_else(|| {
                    PaymentError::Validation(format!("callback missing required field {}", key))
                })
        };

        let transaction_id = require("TRAN_NBR")?
            .parse()
            .map_err(|_| PaymentError::Validation("TRAN_NBR is not a UUID".into()))?;
        let merchant_echo = require("USER_DATA_3")?;
        let tran_group = match require("TRAN_GROUP")?.as_str() {
            "SALE" => GatewayTranGroup::Sale,
            "AUTH" => GatewayTranGroup::Auth,
            "STORAGE" => GatewayTranGroup::Storage,
            other => {
                return Err(PaymentError::Validation(format!(
                    "unexpected TRAN_GROUP {} in callback",
                    other
                )))
            }
        };

        Ok(Self {
            transaction_id,
            merchant_echo,
            tran_group,
            response_code: require("AUTH_RESP")?,
            response_text: fields.get("AUTH_RESP_TEXT").cloned(),
            authorization_code: fields.get("AUTH_CODE").cloned(),
            gateway_ref: fields.get("AUTH_GUID").cloned(),
            card_brand: fields.get("AUTH_CARD_TYPE").cloned(),
            masked_account: fields.get("AUTH_MASKED_ACCOUNT").cloned(),
            amount_cents: parse_wire_amount(&require("AMOUNT")?)?,
            currency: fields
                .get("CURRENCY_CODE")
                .cloned()
                .unwrap_or_else(|| "USD".to_string()),
            return_url: require("USER_DATA_1")?,
            customer_id: fields.get("USER_DATA_2").and_then(|v| v.parse().ok()),
        })
    }

    pub fn approved(&self) -> bool {
        self.response_code == APPROVED_CODE
    }
}

/// Resultado del callback: a dónde redirigir el browser del usuario final.
#[derive(Debug, Clone)]
pub struct CallbackResult {
    pub redirect_url: String,
    pub approved: bool,
    pub transaction_id: Uuid,
}

pub struct BrowserPostUseCase {
    transactions: Arc<dyn TransactionRepository>,
    payment_methods: Arc<dyn PaymentMethodRepository>,
    credentials: Arc<CredentialResolver>,
    gateway: Arc<dyn CardGateway>,
}

impl BrowserPostUseCase {
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

    /// Key exchange contra el gateway: devuelve el TAC de corta vida y los
    /// campos que el formulario del cliente debe incluir.
    pub async fn form_config(
        &self,
        request: FormConfigRequest,
        cancel: &CancellationToken,
    ) -> Result<FormConfig, PaymentError> {
        match request.transaction_type {
            GatewayTranGroup::Sale | GatewayTranGroup::Auth => {
                if request.amount_cents <= 0 {
                    return Err(PaymentError::Validation(
                        "amount_cents must be positive".to_string(),
                    ));
                }
            }
            GatewayTranGroup::Storage => {}
            other => {
                return Err(PaymentError::Validation(format!(
                    "{:?} is not a browser-post transaction type",
                    other
                )))
            }
        }
        if !request.return_url.starts_with("https://")
            && !request.return_url.starts_with("http://")
        {
            return Err(PaymentError::Validation(
                "return_url must be an absolute http(s) URL".to_string(),
            ));
        }

        let resolved = self.credentials.get(request.merchant_id).await?;

        let key_exchange = KeyExchangeRequest {
            transaction_id: request.transaction_id,
            tran_group: request.transaction_type,
            amount_cents: request.amount_cents,
            currency: request.currency.clone(),
            return_url: request.return_url.clone(),
            customer_echo: request.customer_id.map(|id| id.to_string()),
            merchant_echo: request.merchant_id.to_string(),
        };
        let grant = self
            .gateway
            .key_exchange(&resolved.credentials, &key_exchange, cancel)
            .await?;

        let mut fields = vec![
            ("CUST_NBR".to_string(), resolved.credentials.cust_nbr.clone()),
            ("MERCH_NBR".to_string(), resolved.credentials.merch_nbr.clone()),
            ("DBA_NBR".to_string(), resolved.credentials.dba_nbr.clone()),
            (
                "TERMINAL_NBR".to_string(),
                resolved.credentials.terminal_nbr.clone(),
            ),
            ("TRAN_NBR".to_string(), request.transaction_id.to_string()),
            (
                "TRAN_GROUP".to_string(),
                request.transaction_type.wire_value().to_string(),
            ),
            ("AMOUNT".to_string(), wire_amount(request.amount_cents)),
            ("USER_DATA_1".to_string(), request.return_url.clone()),
            ("USER_DATA_3".to_string(), request.merchant_id.to_string()),
            ("TAC".to_string(), grant.tac.clone()),
        ];
        if let Some(customer) = request.customer_id {
            fields.push(("USER_DATA_2".to_string(), customer.to_string()));
        }

        info!(
            transaction_id = %request.transaction_id,
            merchant_id = %request.merchant_id,
            "browser-post form config issued"
        );
        Ok(FormConfig {
            post_url: grant.post_url,
            tac: grant.tac,
            transaction_id: request.transaction_id,
            fields,
        })
    }

    /// Completa la operación que el gateway reporta. Idempotente: el replay
    /// del callback (reintento del gateway) no produce filas nuevas.
    pub async fn handle_callback(
        &self,
        fields: &HashMap<String, String>,
    ) -> Result<CallbackResult, PaymentError> {
        let callback = CallbackFields::parse(fields)?;

        // El comercio sale del echo del gateway, no de ningún header.
        // El echo puede ser el id o el slug; ambos caminos van por el cache.
        let resolved = match callback.merchant_echo.parse::<Uuid>() {
            Ok(merchant_id) => self.credentials.get(merchant_id).await?,
            Err(_) => self.credentials.get_by_slug(&callback.merchant_echo).await?,
        };

        if callback.tran_group == GatewayTranGroup::Storage {
            return self.complete_storage(&callback, resolved.merchant.id).await;
        }

        let mut op = self
            .transactions
            .begin_group_operation(callback.transaction_id)
            .await?;

        if let Some(existing) = op.find_existing(callback.transaction_id).await? {
            op.commit().await?;
            info!(transaction_id = %existing.id, "duplicate browser-post callback");
            return Ok(CallbackResult {
                redirect_url: redirect_url(&callback.return_url, &existing),
                approved: existing.is_approved(),
                transaction_id: existing.id,
            });
        }

        let tran_type = match callback.tran_group {
            GatewayTranGroup::Sale => TransactionType::SALE,
            _ => TransactionType::AUTHORIZE,
        };
        let mut transaction = Transaction::new_root(
            callback.transaction_id,
            resolved.merchant.id,
            tran_type,
            callback.amount_cents,
            &callback.currency,
        )?;
        transaction.customer_id = callback.customer_id;

        op.insert_pending(&transaction).await?;
        let committed = op
            .record_outcome(TransactionOutcome {
                transaction_id: callback.transaction_id,
                status: if callback.approved() {
                    TransactionStatus::APPROVED
                } else {
                    TransactionStatus::DECLINED
                },
                gateway_response_code: Some(callback.response_code.clone()),
                authorization_code: callback.authorization_code.clone(),
                reuse_token: callback.gateway_ref.clone(),
            })
            .await?;
        op.enqueue_event(&WebhookEvent::for_transaction(&committed)).await?;
        op.commit().await?;

        info!(
            transaction_id = %committed.id,
            status = ?committed.status,
            "browser-post callback completed"
        );
        Ok(CallbackResult {
            redirect_url: redirect_url(&callback.return_url, &committed),
            approved: committed.is_approved(),
            transaction_id: committed.id,
        })
    }

    /// STORAGE: tokenización. No crea transacción; persiste el método de
    /// pago con el BRIC del gateway. El id del método es el TRAN_NBR del
    /// flujo, con upsert, así el replay del callback tampoco duplica.
    async fn complete_storage(
        &self,
        callback: &CallbackFields,
        merchant_id: Uuid,
    ) -> Result<CallbackResult, PaymentError> {
        if !callback.approved() {
            warn!(
                transaction_id = %callback.transaction_id,
                code = %callback.response_code,
                "gateway declined the storage request"
            );
            return Ok(CallbackResult {
                redirect_url: format!(
                    "{}{}transaction_id={}&approved=false&code={}",
                    callback.return_url,
                    separator(&callback.return_url),
                    callback.transaction_id,
                    callback.response_code
                ),
                approved: false,
                transaction_id: callback.transaction_id,
            });
        }

        let reuse_token = callback.gateway_ref.clone().ok_or_else(|| {
            PaymentError::Validation("approved STORAGE callback without AUTH_GUID".into())
        })?;

        // Sin marca de tarjeta asumimos cuenta ACH: queda pendiente de
        // verificación por pre-note y no es utilizable hasta promoverse
        let kind = if callback.card_brand.is_some() {
            PaymentMethodKind::CREDIT_CARD
        } else {
            PaymentMethodKind::ACH
        };
        let now = chrono::Utc::now();
        let method = PaymentMethod {
            id: callback.transaction_id,
            merchant_id,
            customer_id: callback.customer_id,
            kind,
            brand: callback.card_brand.clone(),
            last_four: callback
                .masked_account
                .as_ref()
                .map(|masked| last_four(masked)),
            reuse_token,
            verification_status: match kind {
                PaymentMethodKind::CREDIT_CARD => VerificationStatus::VERIFIED,
                PaymentMethodKind::ACH => VerificationStatus::PENDING,
            },
            verification_failure_code: None,
            active: true,
            created_at: now,
            updated_at: now,
        };
        let saved = self.payment_methods.save(method).await?;

        info!(payment_method_id = %saved.id, kind = ?saved.kind, "payment method stored");
        Ok(CallbackResult {
            redirect_url: format!(
                "{}{}payment_method_id={}&approved=true",
                callback.return_url,
                separator(&callback.return_url),
                saved.id
            ),
            approved: true,
            transaction_id: callback.transaction_id,
        })
    }
}

fn separator(url: &str) -> &'static str {
    if url.contains('?') {
        "&"
    } else {
        "?"
    }
}

fn redirect_url(return_url: &str, transaction: &Transaction) -> String {
    format!(
        "{}{}transaction_id={}&approved={}&code={}",
        return_url,
        separator(return_url),
        transaction.id,
        transaction.is_approved(),
        transaction.gateway_response_code.as_deref().unwrap_or("")
    )
}

fn last_four(masked: &str) -> String {
    let digits: String = masked.chars().filter(|c| c.is_ascii_digit()).collect();
    let start = digits.len().saturating_sub(4);
    digits[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::gateways::{
        GatewayCredentials, GatewayResponse, PrenoteOutcome, ServerPostRequest, TacGrant,
    };
    use crate::use_cases::testing::{resolver_for, sample_merchant, MemoryTransactionStore};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use mockall::mock;

    mock! {
        pub CardGatewayImpl {}

        #[async_trait]
        impl CardGateway for CardGatewayImpl {
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
    }

    mock! {
        pub PaymentMethodRepositoryImpl {}

        #[async_trait]
        impl PaymentMethodRepository for PaymentMethodRepositoryImpl {
            async fn save(&self, method: PaymentMethod) -> Result<PaymentMethod, PaymentError>;
            async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentMethod>, PaymentError>;
            async fn find_by_merchant(&self, merchant_id: Uuid) -> Result<Vec<PaymentMethod>, PaymentError>;
            async fn deactivate(&self, id: Uuid, merchant_id: Uuid) -> Result<(), PaymentError>;
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
    }

    fn use_case_with(
        store: MemoryTransactionStore,
        gateway: MockCardGatewayImpl,
        methods: MockPaymentMethodRepositoryImpl,
        merchant: crate::domain::entities::Merchant,
    ) -> BrowserPostUseCase {
        BrowserPostUseCase::new(
            Arc::new(store),
            Arc::new(methods),
            resolver_for(merchant),
            Arc::new(gateway),
        )
    }

    fn sale_callback(merchant_id: Uuid, transaction_id: Uuid) -> HashMap<String, String> {
        HashMap::from([
            ("TRAN_NBR".to_string(), transaction_id.to_string()),
            ("TRAN_GROUP".to_string(), "SALE".to_string()),
            ("AUTH_RESP".to_string(), "00".to_string()),
            ("AUTH_CODE".to_string(), "123456".to_string()),
            ("AUTH_GUID".to_string(), "GUID-BP".to_string()),
            ("AMOUNT".to_string(), "29.99".to_string()),
            ("CURRENCY_CODE".to_string(), "USD".to_string()),
            ("USER_DATA_1".to_string(), "https://shop.test/done".to_string()),
            ("USER_DATA_3".to_string(), merchant_id.to_string()),
        ])
    }

    #[tokio::test]
    async fn form_config_returns_tac_and_merchant_fields() {
        let merchant = sample_merchant();
        let mut gateway = MockCardGatewayImpl::new();
        gateway.expect_key_exchange().times(1).returning(|_, req, _| {
            assert_eq!(req.tran_group, GatewayTranGroup::Sale);
            Ok(TacGrant {
                tac: "TAC-1".to_string(),
                post_url: "https://epx.test/browserpost".to_string(),
            })
        });

        let use_case = use_case_with(
            MemoryTransactionStore::new(),
            gateway,
            MockPaymentMethodRepositoryImpl::new(),
            merchant.clone(),
        );
        let cancel = CancellationToken::new();
        let tran_id = Uuid::new_v4();
        let config = use_case
            .form_config(
                FormConfigRequest {
                    transaction_id: tran_id,
                    merchant_id: merchant.id,
                    transaction_type: GatewayTranGroup::Sale,
                    amount_cents: 2999,
                    currency: "USD".to_string(),
                    return_url: "https://shop.test/done".to_string(),
                    customer_id: None,
                },
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(config.tac, "TAC-1");
        assert_eq!(config.transaction_id, tran_id);
        let keys: Vec<&str> = config.fields.iter().map(|(k, _)| k.as_str()).collect();
        assert!(keys.contains(&"CUST_NBR"));
        assert!(keys.contains(&"TRAN_NBR"));
        assert!(keys.contains(&"TAC"));
    }

    #[tokio::test]
    async fn zero_amount_sale_form_config_is_invalid() {
        let merchant = sample_merchant();
        let mut gateway = MockCardGatewayImpl::new();
        gateway.expect_key_exchange().never();

        let use_case = use_case_with(
            MemoryTransactionStore::new(),
            gateway,
            MockPaymentMethodRepositoryImpl::new(),
            merchant.clone(),
        );
        let cancel = CancellationToken::new();
        let err = use_case
            .form_config(
                FormConfigRequest {
                    transaction_id: Uuid::new_v4(),
                    merchant_id: merchant.id,
                    transaction_type: GatewayTranGroup::Sale,
                    amount_cents: 0,
                    currency: "USD".to_string(),
                    return_url: "https://shop.test/done".to_string(),
                    customer_id: None,
                },
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::Validation(_)));
    }

    #[tokio::test]
    async fn duplicate_callback_creates_exactly_one_row() {
        let merchant = sample_merchant();
        let store = MemoryTransactionStore::new();
        let use_case = use_case_with(
            store.clone(),
            MockCardGatewayImpl::new(),
            MockPaymentMethodRepositoryImpl::new(),
            merchant.clone(),
        );

        let tran_id = Uuid::new_v4();
        let callback = sale_callback(merchant.id, tran_id);

        let first = use_case.handle_callback(&callback).await.unwrap();
        // El gateway reintenta el callback (reintento de red)
        let second = use_case.handle_callback(&callback).await.unwrap();

        assert_eq!(store.row_count(), 1);
        assert!(first.approved);
        assert!(second.approved);
        assert_eq!(first.transaction_id, second.transaction_id);

        let row = store.row(tran_id).unwrap();
        assert_eq!(row.status, TransactionStatus::APPROVED);
        assert_eq!(row.amount_cents, 2999);
        assert_eq!(row.authorization_code.as_deref(), Some("123456"));
    }

    #[tokio::test]
    async fn callback_resolves_the_merchant_by_slug_echo() {
        let merchant = sample_merchant();
        let store = MemoryTransactionStore::new();
        let use_case = use_case_with(
            store.clone(),
            MockCardGatewayImpl::new(),
            MockPaymentMethodRepositoryImpl::new(),
            merchant.clone(),
        );

        let tran_id = Uuid::new_v4();
        let mut callback = sale_callback(merchant.id, tran_id);
        callback.insert("USER_DATA_3".to_string(), merchant.slug.clone());

        let result = use_case.handle_callback(&callback).await.unwrap();
        assert!(result.approved);
        assert_eq!(store.row(tran_id).unwrap().merchant_id, merchant.id);
    }

    #[tokio::test]
    async fn declined_callback_persists_a_declined_row() {
        let merchant = sample_merchant();
        let store = MemoryTransactionStore::new();
        let use_case = use_case_with(
            store.clone(),
            MockCardGatewayImpl::new(),
            MockPaymentMethodRepositoryImpl::new(),
            merchant.clone(),
        );

        let tran_id = Uuid::new_v4();
        let mut callback = sale_callback(merchant.id, tran_id);
        callback.insert("AUTH_RESP".to_string(), "05".to_string());

        let result = use_case.handle_callback(&callback).await.unwrap();
        assert!(!result.approved);
        assert!(result.redirect_url.contains("approved=false"));
        assert_eq!(
            store.row(tran_id).unwrap().status,
            TransactionStatus::DECLINED
        );
    }

    #[tokio::test]
    async fn callback_missing_required_fields_is_rejected() {
        let merchant = sample_merchant();
        let use_case = use_case_with(
            MemoryTransactionStore::new(),
            MockCardGatewayImpl::new(),
            MockPaymentMethodRepositoryImpl::new(),
            merchant.clone(),
        );

        let mut callback = sale_callback(merchant.id, Uuid::new_v4());
        callback.remove("AUTH_RESP");

        let err = use_case.handle_callback(&callback).await.unwrap_err();
        assert!(matches!(err, PaymentError::Validation(_)));
    }

    #[tokio::test]
    async fn storage_callback_saves_a_pending_ach_method() {
        let merchant = sample_merchant();
        let mut methods = MockPaymentMethodRepositoryImpl::new();
        methods.expect_save().times(1).returning(|m| {
            assert_eq!(m.kind, PaymentMethodKind::ACH);
            assert_eq!(m.verification_status, VerificationStatus::PENDING);
            assert_eq!(m.reuse_token, "BRIC-NEW");
            Ok(m)
        });

        let use_case = use_case_with(
            MemoryTransactionStore::new(),
            MockCardGatewayImpl::new(),
            methods,
            merchant.clone(),
        );

        let tran_id = Uuid::new_v4();
        let mut callback = sale_callback(merchant.id, tran_id);
        callback.insert("TRAN_GROUP".to_string(), "STORAGE".to_string());
        callback.insert("AUTH_GUID".to_string(), "BRIC-NEW".to_string());
        callback.insert("AUTH_MASKED_ACCOUNT".to_string(), "****6789".to_string());
        callback.insert("AMOUNT".to_string(), "0.00".to_string());

        let result = use_case.handle_callback(&callback).await.unwrap();
        assert!(result.approved);
        assert!(result.redirect_url.contains("payment_method_id="));
    }
}
