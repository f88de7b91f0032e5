//! # sheetpay: order and payment core for a sheet-music storefront
//!
//! `sheetpay` turns a buyer's cart into a paid order. It creates orders, dispatches them to a
//! payment rail, settles them exactly once no matter how many confirmations arrive, and keeps a
//! per-user credit balance that can itself pay for purchases.
//!
//! ## Overview
//!
//! A purchase is either a **sheet purchase** (one or more products; the buyer is granted access
//! to each on settlement) or a **credit top-up** (no products; the paid amount plus an optional
//! bonus is added to the buyer's balance). Purchases are paid with one of five methods:
//!
//! - `card` and `virtual_account` through the card gateway
//! - `wallet_redirect` through the redirect wallet gateway
//! - `manual_bank_transfer` into a static account, confirmed by an operator
//! - `ledger`, i.e. from the buyer's credit balance, settled synchronously
//!
//! ## Architecture
//!
//! The application is built on [Axum](https://github.com/tokio-rs/axum) for the HTTP layer.
//! Persistence goes through the [`db::store::Store`] trait, backed by PostgreSQL in production
//! and by an in-process store for development and tests. The store exposes single atomic
//! statements only; every multi-step flow is a saga whose unfinished steps are written to a
//! durable outbox first.
//!
//! ### Request Flow
//!
//! 1. `POST /api/v1/purchases` validates the cart and either pays from the ledger immediately
//!    or inserts a pending order and returns the provider's next action (a redirect form or a
//!    deposit account).
//! 2. The buyer returns from the provider (`/api/v1/payments/{provider}/return`), the provider
//!    posts a webhook (`/api/v1/webhooks/{provider}`), or an operator confirms a bank transfer
//!    (`/api/v1/admin/orders/{id}/confirm`). All three funnel into
//!    [`checkout::SettlementReconciler::complete_order`].
//! 3. Settlement applies its effects (balance charge or entitlements) and then flips the order to
//!    paid with a single check-and-set, so concurrent confirmations settle once.
//!
//! ### Background Services
//!
//! - [`checkout::OutboxWorker`] re-drives settlements and ledger rollbacks that did not finish
//! - [`checkout::PendingOrderSweeper`] cancels orders abandoned before payment
//!
//! ## Modules
//!
//! - [`api`]: HTTP handlers and request/response models
//! - [`auth`]: Identity extractors for the headers set by the upstream auth proxy
//! - [`checkout`]: Purchase orchestration, settlement, credit ledger and background workers
//! - [`config`]: Configuration loading from YAML and environment
//! - [`db`]: The storage boundary and its implementations
//! - [`payment_providers`]: One adapter per payment rail
//! - [`telemetry`]: Structured logging setup

pub mod api;
pub mod auth;
pub mod checkout;
pub mod config;
pub mod db;
pub mod errors;
pub mod payment_providers;
pub mod telemetry;
#[cfg(test)]
pub mod test_utils;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    http::{self, HeaderValue},
    routing::{get, post},
};
use bon::Builder;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info, instrument};

use crate::{
    checkout::{
        AccountDetailAwaiter, CancellationService, CreditLedger, DetailNotifier, OutboxWorker, PendingOrderSweeper,
        PurchaseOrchestrator, SettlementReconciler,
    },
    config::DatabaseConfig,
    db::store::{InMemoryStore, PostgresStore, Store},
    payment_providers::ProviderRegistry,
};

pub use config::Config;

/// Application state shared across all request handlers.
///
/// Every service is cheap to clone: they hold `Arc`s to the store and to each other's state.
///
/// # Example
///
/// ```ignore
/// let state = AppState::builder()
///     .store(store)
///     .config(config)
///     .providers(providers)
///     // ...one setter per service
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub config: Config,
    pub providers: ProviderRegistry,
    pub orchestrator: PurchaseOrchestrator,
    pub reconciler: SettlementReconciler,
    pub ledger: CreditLedger,
    pub awaiter: AccountDetailAwaiter,
    pub cancellation: CancellationService,
    pub notifier: DetailNotifier,
}

/// Get the sheetpay database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Connect the configured store. Returns the pool as well for PostgreSQL so it can be closed on
/// shutdown.
async fn setup_store(config: &Config) -> anyhow::Result<(Arc<dyn Store>, Option<PgPool>)> {
    match &config.database {
        DatabaseConfig::Postgres { url, pool: settings } => {
            info!("Using external database");
            let mut options = sqlx::postgres::PgPoolOptions::new()
                .max_connections(settings.max_connections)
                .min_connections(settings.min_connections)
                .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs));
            if settings.idle_timeout_secs > 0 {
                options = options.idle_timeout(Duration::from_secs(settings.idle_timeout_secs));
            }
            let pool = options.connect(url).await?;
            migrator().run(&pool).await?;
            Ok((Arc::new(PostgresStore::new(pool.clone())), Some(pool)))
        }
        DatabaseConfig::InMemory => {
            info!("Using in-memory store: all data will be lost on shutdown");
            Ok((Arc::new(InMemoryStore::new()), None))
        }
    }
}

/// Wire the checkout services together over one store.
pub(crate) fn build_state(config: &Config, store: Arc<dyn Store>) -> anyhow::Result<AppState> {
    let providers = ProviderRegistry::from_config(&config.payment)?;
    let retry_after = config.settlement.outbox.initial_backoff;
    let notifier = DetailNotifier::default();

    let ledger = CreditLedger::new(store.clone(), retry_after);
    let reconciler = SettlementReconciler::new(
        store.clone(),
        ledger.clone(),
        providers.clone(),
        notifier.clone(),
        config.payment.amount_tolerance_bps,
        retry_after,
    );
    let orchestrator = PurchaseOrchestrator::new(
        store.clone(),
        providers.clone(),
        ledger.clone(),
        config.payment.clone(),
    );
    let awaiter = AccountDetailAwaiter::new(store.clone(), notifier.clone());
    let cancellation = CancellationService::new(store.clone(), providers.clone(), ledger.clone());

    Ok(AppState::builder()
        .store(store)
        .config(config.clone())
        .providers(providers)
        .orchestrator(orchestrator)
        .reconciler(reconciler)
        .ledger(ledger)
        .awaiter(awaiter)
        .cancellation(cancellation)
        .notifier(notifier)
        .build())
}

/// Create CORS layer from configuration
fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let allow_origin = if config.cors.allowed_origins.iter().any(|origin| origin == "*") {
        AllowOrigin::any()
    } else {
        let mut origins = Vec::new();
        for origin in &config.cors.allowed_origins {
            origins.push(origin.parse::<HeaderValue>()?);
        }
        AllowOrigin::list(origins)
    };

    let mut cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_credentials(config.cors.allow_credentials)
        .expose_headers(vec![http::header::LOCATION]);

    if let Some(max_age) = config.cors.max_age {
        cors = cors.max_age(Duration::from_secs(max_age));
    }

    Ok(cors)
}

/// Build the application router with all endpoints and middleware.
///
/// Buyer routes identify the caller by `auth.user_header`; admin routes additionally require
/// the shared admin token. Provider returns and webhooks are unauthenticated and verified by
/// the provider adapters instead.
#[instrument(skip_all)]
pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    use api::handlers::{admin, credits, orders, payments, purchases, webhooks};

    let api_routes = Router::new()
        .route("/purchases", post(purchases::start_purchase))
        .route("/orders/{order_id}", get(orders::get_order))
        .route("/orders/{order_id}/account-detail", get(orders::await_order_account_detail))
        .route("/users/current/account-detail", get(orders::poll_account_detail))
        .route("/users/current/credits/balance", get(credits::get_balance))
        .route("/users/current/credits/transactions", get(credits::list_transactions))
        .route(
            "/payments/{provider}/return",
            get(payments::provider_return).post(payments::provider_return_form),
        )
        .route("/webhooks/{provider}", post(webhooks::receive_webhook))
        .route("/admin/orders/{order_id}/confirm", post(admin::confirm_order))
        .route("/admin/orders/{order_id}/cancel", post(admin::cancel_order))
        .route("/admin/users/{user_id}/credits/audit", get(admin::audit_credits));

    let cors = create_cors_layer(&state.config)?;

    let router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .nest("/api/v1", api_routes)
        .with_state(state)
        .layer(cors);

    // Add tracing layer
    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

/// Container for background services and their lifecycle management.
///
/// Holds the outbox worker and the abandoned order sweeper when they are enabled.
///
/// # Graceful Shutdown
///
/// The struct provides a [`shutdown`](BackgroundServices::shutdown) method to gracefully
/// stop all background tasks. When dropped, the `drop_guard` will automatically cancel
/// the shutdown token, signaling all tasks to stop.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<DropGuard>,
}

impl BackgroundServices {
    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        // Signal all background tasks to shutdown
        self.shutdown_token.cancel();

        // Wait for all background tasks to complete
        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }

    pub fn task_count(&self) -> usize {
        self.background_tasks.len()
    }
}

/// Spawn the outbox worker and order sweeper
fn setup_background_services(state: &AppState, config: &Config, shutdown_token: CancellationToken) -> BackgroundServices {
    let drop_guard = shutdown_token.clone().drop_guard();
    let mut background_tasks = Vec::new();

    if config.settlement.outbox.enabled {
        let worker = OutboxWorker::new(
            state.store.clone(),
            state.reconciler.clone(),
            state.ledger.clone(),
            config.settlement.outbox.clone(),
        );
        background_tasks.push(tokio::spawn(worker.run(shutdown_token.clone())));
    } else {
        info!("Outbox worker disabled; unfinished settlements will not be retried by this instance");
    }

    if config.settlement.sweeper.enabled {
        let sweeper = PendingOrderSweeper::new(state.store.clone(), config.settlement.sweeper.clone());
        background_tasks.push(tokio::spawn(sweeper.run(shutdown_token.clone())));
    } else {
        info!("Abandoned order sweeper disabled");
    }

    BackgroundServices {
        background_tasks,
        shutdown_token,
        drop_guard: Some(drop_guard),
    }
}

/// Main application struct that owns all resources and lifecycle.
///
/// # Lifecycle
///
/// 1. **Create**: [`Application::new`] connects the store, runs migrations, wires the
///    checkout services and starts background services
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and starts handling requests
/// 3. **Shutdown**: When the shutdown signal is received, gracefully stops all services
pub struct Application {
    router: Router,
    config: Config,
    pool: Option<PgPool>,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting sheetpay with configuration: {:#?}", config);
        let (store, pool) = setup_store(&config).await?;
        Self::assemble(config, store, pool)
    }

    /// Create an application over an existing store. Migrations are the caller's concern.
    pub async fn new_with_store(config: Config, store: Arc<dyn Store>) -> anyhow::Result<Self> {
        Self::assemble(config, store, None)
    }

    fn assemble(config: Config, store: Arc<dyn Store>, pool: Option<PgPool>) -> anyhow::Result<Self> {
        let app_state = build_state(&config, store)?;

        // Create a shutdown token for coordinating graceful shutdown of background tasks
        let shutdown_token = CancellationToken::new();
        let bg_services = setup_background_services(&app_state, &config, shutdown_token);

        let router = build_router(app_state)?;

        Ok(Self {
            router,
            config,
            pool,
            bg_services,
        })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let service = self.router.into_make_service();
        let server = axum_test::TestServer::new(service).expect("Failed to create test server");
        (server, self.bg_services)
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "sheetpay listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        // Run the server with graceful shutdown
        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        // Shutdown background services and wait for tasks to complete
        info!("Stopping background services...");
        self.bg_services.shutdown().await;

        // Close database connections
        if let Some(pool) = self.pool {
            info!("Closing database connections...");
            pool.close().await;
        }

        Ok(())
    }
}
