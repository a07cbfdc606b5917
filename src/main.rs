use anyhow::Context;
use axum::http::HeaderName;
use payguard_backend::api::{self, AppState, HealthProbe};
use payguard_backend::audit::AuditLogger;
use payguard_backend::clock::{Clock, SystemClock};
use payguard_backend::config::Config;
use payguard_backend::database::repository::{OtpRepository, PayoutRepository};
use payguard_backend::database::{
    self, PgAuditSink, PgOrderLookup, PgOtpRepository, PgPaymentRepository, PgPayoutRepository,
    PgTaskQueue, PgWebhookLog, PoolConfig,
};
use payguard_backend::events::EventBus;
use payguard_backend::lock::{InMemoryJobLock, JobLock};
use payguard_backend::notifications::{HttpNotificationSink, LogNotificationSink, NotificationSink};
use payguard_backend::payments::{OrderCorrelator, OrderLookup, SignatureVerifier, TaskQueue, WebhookGateway};
use payguard_backend::payout::{DeliveryGate, OtpIssuer, PayoutStateMachine, StalePayoutReaper};
use payguard_backend::workers::VerificationWorker;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    init_tracing();

    let config = Config::from_env()?;

    info!("Starting payguard backend");
    info!("Environment: {}", config.server.environment);
    if config.webhook.secret.is_none() {
        warn!(
            allow_unsigned = config.allows_unsigned_webhooks(),
            "WEBHOOK_SECRET not set"
        );
    }

    let pool = database::init_pool(
        &config.database.url,
        Some(PoolConfig {
            max_connections: config.database.max_connections,
            ..PoolConfig::default()
        }),
    )
    .await?;
    database::run_migrations(&pool).await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let audit = AuditLogger::new(Arc::new(PgAuditSink::new(pool.clone())), clock.clone());
    let events = EventBus::default();

    let orders: Arc<dyn OrderLookup> = Arc::new(PgOrderLookup::new(pool.clone()));
    let payouts: Arc<dyn PayoutRepository> = Arc::new(PgPayoutRepository::new(pool.clone()));
    let otps: Arc<dyn OtpRepository> = Arc::new(PgOtpRepository::new(pool.clone()));
    let queue: Arc<dyn TaskQueue> = Arc::new(PgTaskQueue::new(pool.clone()));

    let notifier: Arc<dyn NotificationSink> = match config.notifications.http() {
        Some(http) => Arc::new(HttpNotificationSink::new(http)?),
        None => {
            warn!("NOTIFICATION_GATEWAY_URL not set, delivery codes will only be logged");
            Arc::new(LogNotificationSink)
        }
    };

    #[cfg(feature = "cache")]
    let redis_pool = match &config.redis.url {
        Some(url) => Some(
            payguard_backend::cache::init_cache_pool(payguard_backend::cache::CacheConfig::new(
                url.clone(),
            ))
            .await
            .context("failed to initialize Redis pool")?,
        ),
        None => None,
    };

    #[cfg(feature = "cache")]
    let job_lock: Arc<dyn JobLock> = match &redis_pool {
        Some(pool) => Arc::new(payguard_backend::cache::RedisJobLock::new(pool.clone())),
        None => {
            warn!("REDIS_URL not set, reaper lease is local to this process");
            Arc::new(InMemoryJobLock::new())
        }
    };
    #[cfg(not(feature = "cache"))]
    let job_lock: Arc<dyn JobLock> = Arc::new(InMemoryJobLock::new());

    let machine = PayoutStateMachine::new(payouts.clone(), audit.clone(), clock.clone());
    let issuer = OtpIssuer::new(otps.clone(), notifier, audit.clone(), clock.clone());

    let gateway = WebhookGateway::new(
        config.webhook.source.clone(),
        SignatureVerifier::new(config.webhook.secret.clone(), config.allows_unsigned_webhooks()),
        OrderCorrelator::new(orders.clone()),
        machine.clone(),
        queue.clone(),
        Arc::new(PgWebhookLog::new(pool.clone())),
        audit.clone(),
        events.clone(),
        clock.clone(),
    );
    let delivery = DeliveryGate::new(otps, payouts.clone(), audit.clone(), clock.clone());

    let worker = Arc::new(VerificationWorker::new(
        Arc::new(PgPaymentRepository::new(pool.clone())),
        orders,
        queue,
        machine.clone(),
        issuer,
        audit.clone(),
        events.clone(),
        clock.clone(),
        config.verification.clone(),
    ));
    let reaper = Arc::new(StalePayoutReaper::new(
        machine,
        payouts,
        audit,
        events,
        job_lock,
        clock,
        config.reaper.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = tokio::spawn(worker.run(shutdown_rx.clone()));
    let reaper_handle = tokio::spawn(reaper.run(shutdown_rx));

    let state = AppState {
        gateway,
        delivery,
        signature_header: HeaderName::from_str(&config.webhook.signature_header)?,
        health: HealthProbe {
            environment: config.server.environment.to_string(),
            database: Some(pool.clone()),
            #[cfg(feature = "cache")]
            redis: redis_pool,
        },
    };
    let app = api::router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("HOST and PORT must form a socket address")?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("HTTP server stopped, draining background workers");
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(worker_handle, reaper_handle);
    pool.close().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to listen for SIGTERM"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
