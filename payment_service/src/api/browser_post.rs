//! Endpoints del flujo Browser Post: form config, tokenización y callback.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Html,
    Form, Json,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::http_routes::{bearer, bounded, AppState};
use crate::api::response::ApiResponse;
use crate::domain::error::PaymentError;
use crate::domain::gateways::GatewayTranGroup;
use crate::use_cases::browser_post::{FormConfig, FormConfigRequest};

#[derive(Deserialize, ToSchema)]
pub struct FormConfigBody {
    pub transaction_id: Uuid,
    pub merchant_id: Uuid,
    /// SALE, AUTH o STORAGE.
    pub transaction_type: String,
    #[serde(default)]
    pub amount_cents: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub return_url: String,
    pub customer_id: Option<Uuid>,
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Deserialize, ToSchema)]
pub struct TokenizeBody {
    pub transaction_id: Uuid,
    pub merchant_id: Uuid,
    pub return_url: String,
    pub customer_id: Option<Uuid>,
}

fn form_config_response(config: FormConfig) -> Json<ApiResponse<serde_json::Value>> {
    let fields: HashMap<String, String> = config.fields.into_iter().collect();
    Json(ApiResponse::success(serde_json::json!({
        "post_url": config.post_url,
        "tac": config.tac,
        "transaction_id": config.transaction_id,
        "fields": fields,
    })))
}

// POST /browser-post/form-config
#[utoipa::path(
    post,
    path = "/browser-post/form-config",
    request_body = FormConfigBody,
    responses((status = 200, body = ApiResponse<serde_json::Value>))
)]
pub async fn form_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<FormConfigBody>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    state
        .auth
        .authorize_merchant(bearer(&headers), payload.merchant_id)?;

    let transaction_type = match payload.transaction_type.as_str() {
        "SALE" => GatewayTranGroup::Sale,
        "AUTH" => GatewayTranGroup::Auth,
        "STORAGE" => GatewayTranGroup::Storage,
        other => {
            return Err(PaymentError::Validation(format!(
                "transaction_type must be SALE, AUTH or STORAGE, got {}",
                other
            ))
            .into())
        }
    };

    let cancel = state.shutdown.child_token();
    let config = bounded(
        &cancel,
        state.browser_post.form_config(
            FormConfigRequest {
                transaction_id: payload.transaction_id,
                merchant_id: payload.merchant_id,
                transaction_type,
                amount_cents: payload.amount_cents,
                currency: payload.currency,
                return_url: payload.return_url,
                customer_id: payload.customer_id,
            },
            &cancel,
        ),
    )
    .await?;
    Ok(form_config_response(config))
}

// POST /tokenize — atajo de STORAGE: guarda el medio de pago sin cobrar
pub async fn tokenize(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<TokenizeBody>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    state
        .auth
        .authorize_merchant(bearer(&headers), payload.merchant_id)?;
    let cancel = state.shutdown.child_token();
    let config = bounded(
        &cancel,
        state.browser_post.form_config(
            FormConfigRequest {
                transaction_id: payload.transaction_id,
                merchant_id: payload.merchant_id,
                transaction_type: GatewayTranGroup::Storage,
                amount_cents: 0,
                currency: "USD".to_string(),
                return_url: payload.return_url,
                customer_id: payload.customer_id,
            },
            &cancel,
        ),
    )
    .await?;
    Ok(form_config_response(config))
}

// POST /browser-post/callback — lo invoca el GATEWAY, no el browser.
// Responde 200 con un HTML que redirige al usuario incluso ante un decline:
// un no-200 haría que el gateway reintente el callback.
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Form(fields): Form<HashMap<String, String>>,
) -> Result<(StatusCode, Html<String>), (StatusCode, String)> {
    match state.browser_post.handle_callback(&fields).await {
        Ok(result) => Ok((StatusCode::OK, Html(redirect_page(&result.redirect_url)))),
        Err(PaymentError::Validation(message)) => {
            warn!("malformed browser-post callback: {}", message);
            Err((StatusCode::BAD_REQUEST, message))
        }
        Err(e) => {
            // Falla nuestra (BD, credenciales): dejamos que el gateway
            // reintente el callback
            tracing::error!("browser-post callback failed: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "callback processing failed".to_string(),
            ))
        }
    }
}

fn redirect_page(redirect_url: &str) -> String {
    let escaped = redirect_url.replace('"', "&quot;");
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta http-equiv=\"refresh\" content=\"0;url={escaped}\">\n</head>\n<body>\n<p>Processing complete. <a href=\"{escaped}\">Continue</a></p>\n<script>window.location.replace(\"{escaped}\");</script>\n</body>\n</html>\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_page_embeds_the_url() {
        let page = redirect_page("https://shop.test/done?approved=true");
        assert!(page.contains("https://shop.test/done?approved=true"));
        assert!(page.contains("http-equiv=\"refresh\""));
    }

    #[test]
    fn redirect_page_escapes_quotes() {
        let page = redirect_page("https://shop.test/d\"one");
        assert!(!page.contains("d\"one"));
        assert!(page.contains("d&quot;one"));
    }
}
