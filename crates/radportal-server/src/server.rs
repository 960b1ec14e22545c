use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post, put},
};
use radportal_db_postgres::{
    PgPool, PostgresConsentStorage, PostgresDeliveryLog, PostgresNotificationStorage,
    PostgresPortalDirectory, create_pool, mask_password,
};
use radportal_notifications::{
    Backends, HttpSmsGateway, InMemoryConsentStore, InMemoryDeliveryLog, InMemoryDirectory,
    InMemoryNotificationStore, LoggingGateway, NotificationSystem, SmsGateway, SystemClock,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::{config::AppConfig, handlers};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub system: NotificationSystem,
    /// Present when running on PostgreSQL
    pub pool: Option<PgPool>,
    pub metrics: Option<PrometheusHandle>,
}

pub fn build_app(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        // Provider webhooks
        .route("/webhooks/sms/status", post(handlers::sms_status))
        .route("/webhooks/sms/inbound", post(handlers::sms_inbound))
        // Automation triggers
        .route("/automation/events", post(handlers::automation_event))
        // Consent management
        .route(
            "/patients/{id}/sms-preferences",
            get(handlers::get_preferences).patch(handlers::update_preferences),
        )
        .route(
            "/patients/{id}/sms-preferences/opt-out",
            post(handlers::opt_out),
        )
        .route(
            "/patients/{id}/sms-preferences/resubscribe",
            post(handlers::resubscribe),
        )
        // Notification inspection
        .route("/notifications/stats", get(handlers::notification_stats))
        .route(
            "/notifications/{id}",
            get(handlers::get_notification).delete(handlers::cancel_notification),
        )
        .route("/admin/log-level", put(handlers::set_log_level))
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Build the storage backends and gateway selected by configuration.
///
/// Without a `[postgres]` section every store is in-memory, which loses all
/// state on restart.
pub async fn connect_backends(cfg: &AppConfig) -> anyhow::Result<(Backends, Option<PgPool>)> {
    let gateway: Arc<dyn SmsGateway> = match cfg.notifications.gateway.endpoint {
        Some(ref endpoint) => {
            tracing::info!(endpoint = %endpoint, "Using HTTP SMS gateway");
            Arc::new(HttpSmsGateway::new(&cfg.notifications.gateway)?)
        }
        None => {
            tracing::warn!("No gateway endpoint configured; messages will only be logged");
            Arc::new(LoggingGateway::new())
        }
    };

    let Some(ref pg) = cfg.postgres else {
        tracing::warn!("No [postgres] section configured; using in-memory storage");
        let backends = Backends {
            notifications: Arc::new(InMemoryNotificationStore::new()),
            consent: Arc::new(InMemoryConsentStore::new()),
            log: Arc::new(InMemoryDeliveryLog::new()),
            directory: Arc::new(InMemoryDirectory::new()),
            gateway,
            clock: Arc::new(SystemClock),
        };
        return Ok((backends, None));
    };

    tracing::info!(url = %mask_password(&pg.url), "Connecting to PostgreSQL");
    let pool = create_pool(pg).await?;
    let backends = Backends {
        notifications: Arc::new(PostgresNotificationStorage::new(pool.clone())),
        consent: Arc::new(PostgresConsentStorage::new(pool.clone())),
        log: Arc::new(PostgresDeliveryLog::new(pool.clone())),
        directory: Arc::new(PostgresPortalDirectory::new(pool.clone())),
        gateway,
        clock: Arc::new(SystemClock),
    };
    Ok((backends, Some(pool)))
}

pub struct RadportalServer {
    addr: SocketAddr,
    app: Router,
    processor_shutdown: watch::Sender<bool>,
}

impl RadportalServer {
    /// Wire the engine, start its background processor and build the router.
    pub async fn build(cfg: AppConfig) -> anyhow::Result<Self> {
        let (backends, pool) = connect_backends(&cfg).await?;
        let system = NotificationSystem::build(backends, cfg.notifications.clone())?;
        let processor_shutdown = system.processor().start();

        let state = AppState {
            system,
            pool,
            metrics: crate::metrics::install(),
        };
        let app = build_app(state, cfg.server.body_limit_bytes);
        Ok(Self {
            addr: cfg.addr(),
            app,
            processor_shutdown,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        let _ = self.processor_shutdown.send(true);
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
