use dotenvy::dotenv;
use payment_service::{
    api::http_routes::{routes, AppState},
    api::auth::AuthVerifier,
    config::Config,
    infrastructure::{
        credentials::CredentialResolver,
        gateways::{
            epx::{EpxGateway, ResponseCodeMap},
            resilient::ResilientGateway,
            secret_store::HttpSecretStore,
        },
        persistence::{
            chargeback_repository::PostgresChargebackRepository,
            merchant_repository::PostgresMerchantRepository,
            payment_method_repository::PostgresPaymentMethodRepository,
            subscription_repository::PostgresSubscriptionRepository,
            transaction_repository::PostgresTransactionRepository,
            webhook_repository::PostgresWebhookRepository,
        },
        resilience::{
            backoff::BackoffPolicy,
            bulkhead::{Bulkhead, HostBulkhead},
            circuit_breaker::{BreakerConfig, CircuitBreaker},
        },
        runtime::TaskRegistry,
    },
    jobs::{
        ach_verification::AchVerificationJob, subscription_billing::SubscriptionBillingJob,
        webhook_delivery::WebhookDeliveryJob,
    },
    use_cases::{
        browser_post::BrowserPostUseCase, capture_payment::CapturePaymentUseCase,
        get_transaction::GetTransactionUseCase, payment_methods::PaymentMethodsUseCase,
        process_payment::ProcessPaymentUseCase, refund_payment::RefundPaymentUseCase,
        subscriptions::ManageSubscriptionsUseCase, void_payment::VoidPaymentUseCase,
        webhook_subscriptions::WebhookSubscriptionsUseCase,
    },
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        payment_service::api::http_routes::authorize,
        payment_service::api::http_routes::sale,
        payment_service::api::http_routes::capture,
        payment_service::api::http_routes::refund,
        payment_service::api::http_routes::get_transaction,
        payment_service::api::browser_post::form_config
    ),
    components(schemas(
        payment_service::api::http_routes::InitiatePaymentRequest,
        payment_service::api::http_routes::ChildOperationRequest,
        payment_service::api::browser_post::FormConfigBody,
        payment_service::api::response::ApiResponse<serde_json::Value>
    ))
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Cargar variables de entorno
    dotenv().ok();

    // 2. Configurar Logging/Tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting Payment Service...");
    let config = Config::from_env()?;

    // 3. Configurar Conexión a Base de Datos
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;

    info!("Connected to Database");

    // 4. Instanciar Dependencias (Infraestructura)
    let merchants = Arc::new(PostgresMerchantRepository::new(pool.clone()));
    let transactions = Arc::new(PostgresTransactionRepository::new(pool.clone()));
    let payment_methods = Arc::new(PostgresPaymentMethodRepository::new(pool.clone()));
    let subscriptions = Arc::new(PostgresSubscriptionRepository::new(pool.clone()));
    let webhooks = Arc::new(PostgresWebhookRepository::new(pool.clone()));
    let chargebacks = Arc::new(PostgresChargebackRepository::new(pool.clone()));

    let secret_store = Arc::new(HttpSecretStore::new(config.secret_store_url.clone()));
    let credentials = Arc::new(CredentialResolver::new(
        merchants.clone(),
        secret_store,
        Duration::from_secs(300),
    ));

    // Cliente EPX crudo + envoltura de resiliencia
    let raw_gateway = Arc::new(EpxGateway::new(
        config.gateway_browser_post_url.clone(),
        config.gateway_server_post_url.clone(),
        config.gateway_timeout,
        ResponseCodeMap::with_transient_codes(&config.gateway_transient_codes),
    ));
    let breaker = Arc::new(CircuitBreaker::new(
        "epx",
        BreakerConfig {
            failure_threshold: config.breaker_failure_threshold,
            open_timeout: config.breaker_open_timeout,
            probe_successes: config.breaker_probe_successes,
            ..BreakerConfig::default()
        },
    ));
    let gateway = Arc::new(ResilientGateway::new(
        raw_gateway,
        breaker,
        Bulkhead::new(config.gateway_bulkhead_permits),
        config.gateway_retry_attempts,
        BackoffPolicy::gateway(config.gateway_retry_base),
    ));

    // 5. Instanciar Casos de Uso
    let payments = Arc::new(ProcessPaymentUseCase::new(
        transactions.clone(),
        payment_methods.clone(),
        credentials.clone(),
        gateway.clone(),
    ));
    let browser_post = Arc::new(BrowserPostUseCase::new(
        transactions.clone(),
        payment_methods.clone(),
        credentials.clone(),
        gateway.clone(),
    ));

    // 6. Runtime: registro de tareas + señal de apagado
    let registry = Arc::new(TaskRegistry::new());
    let shutdown_token = registry.cancellation_token();

    // 7. Configurar Estado de la App Axum
    let app_state = Arc::new(AppState {
        auth: AuthVerifier::new(&config.auth_public_key_pem)?,
        payments: payments.clone(),
        captures: CapturePaymentUseCase::new(
            transactions.clone(),
            credentials.clone(),
            gateway.clone(),
        ),
        voids: VoidPaymentUseCase::new(
            transactions.clone(),
            credentials.clone(),
            gateway.clone(),
        ),
        refunds: RefundPaymentUseCase::new(
            transactions.clone(),
            credentials.clone(),
            gateway.clone(),
        ),
        browser_post,
        payment_methods: PaymentMethodsUseCase::new(payment_methods.clone()),
        subscriptions: ManageSubscriptionsUseCase::new(
            subscriptions.clone(),
            payment_methods.clone(),
        ),
        webhook_subscriptions: WebhookSubscriptionsUseCase::new(webhooks.clone()),
        queries: GetTransactionUseCase::new(transactions.clone()),
        chargebacks,
        transactions: transactions.clone(),
        pool: pool.clone(),
        pool_max_connections: config.database_max_connections,
        shutdown: shutdown_token.clone(),
    });

    // 8. Iniciar Background Jobs
    let webhook_job = Arc::new(WebhookDeliveryJob::new(
        webhooks.clone(),
        Arc::new(HostBulkhead::new(
            config.webhook_bulkhead_permits,
            config.webhook_per_host_permits,
        )),
        config.webhook_max_attempts,
    ));
    registry.spawn("webhook-deliverer", {
        let token = registry.cancellation_token();
        let tick = config.webhook_tick;
        async move { webhook_job.run_loop(tick, token).await }
    });

    let billing_job = Arc::new(SubscriptionBillingJob::new(
        subscriptions.clone(),
        webhooks.clone(),
        payments,
        config.billing_failure_threshold,
    ));
    registry.spawn("subscription-billing", {
        let token = registry.cancellation_token();
        let tick = config.billing_tick;
        async move { billing_job.run_loop(tick, token).await }
    });

    let ach_job = Arc::new(AchVerificationJob::new(
        payment_methods.clone(),
        webhooks.clone(),
        credentials.clone(),
        gateway.clone(),
    ));
    registry.spawn("ach-verification", {
        let token = registry.cancellation_token();
        let tick = config.ach_tick;
        async move { ach_job.run_loop(tick, token).await }
    });

    // 9. Configurar Rutas y Servidor
    let app = routes(app_state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    let addr = format!("{}:{}", config.host, config.port);
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    // 10. Apagado ordenado: (1) dejar de aceptar RPCs, (2) frenar sweeps,
    // (3) drenar trabajo en vuelo, (4) cerrar el pool
    {
        let registry = registry.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                registry.trigger_shutdown();
            }
        });
    }

    let serve_token = shutdown_token.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { serve_token.cancelled().await })
        .await?;

    if !registry.shutdown(config.shutdown_budget).await {
        error!("shutdown budget expired with residual background work");
    }
    pool.close().await;
    info!("Payment Service stopped");

    Ok(())
}
