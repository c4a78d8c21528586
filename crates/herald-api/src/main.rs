//! Herald server binary.
//!
//! Components are constructed explicitly in dependency order: store,
//! template cache, policy gate and rate limiter, broker topology,
//! dispatcher and channel workers, scheduler, and finally the HTTP
//! surface. Exit codes: 0 clean, 1 configuration error, 2
//! unrecoverable broker/store error at boot.

use std::sync::Arc;
use std::time::Duration;

use herald_api::{server, state::AppState};
use herald_core::auth::{ApiKeyRegistry, JwtVerifier};
use herald_core::broker::{Broker, Dispatcher, Publisher};
use herald_core::cache::{RateLimiter, RedisPool, TokenBlacklist};
use herald_core::delivery::{DeliveryWorker, ExponentialBackoff, WorkerPool};
use herald_core::dlq::ReplayController;
use herald_core::notification::Channel;
use herald_core::policy::{DigestBuffer, PreferenceGate};
use herald_core::repository::{
    create_pool, DeadLetterStore, NotificationStore, PostgresDeadLetterStore,
    PostgresNotificationStore, PostgresPreferenceStore, PostgresTemplateStore, PreferenceStore,
    TemplateStore,
};
use herald_core::scheduler::Scheduler;
use herald_core::template::TemplateCache;
use herald_core::transport::{HttpGatewayTransport, InAppTransport, SmtpEmailTransport, Transport};
use herald_core::{observability, Config, Error};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    init_tracing(&config);

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, category = e.category(), "Fatal error");
        match e {
            Error::Config(_) | Error::Validation(_) => std::process::exit(1),
            _ => std::process::exit(2),
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG")
            .unwrap_or_else(|_| format!("{},herald=debug", config.logging.level)),
    );

    if config.logging.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn run(config: Config) -> herald_core::Result<()> {
    info!("Starting herald {}", herald_core::VERSION);

    let metrics = observability::install_recorder()?;

    // C1: persistence store
    let db = create_pool(&config.database).await?;
    herald_core::MIGRATOR
        .run(&db)
        .await
        .map_err(|e| Error::Other(format!("Migration failed: {}", e)))?;
    info!("Database ready");

    let store: Arc<dyn NotificationStore> = Arc::new(PostgresNotificationStore::new(db.clone()));
    let preferences: Arc<dyn PreferenceStore> = Arc::new(PostgresPreferenceStore::new(db.clone()));
    let template_store: Arc<dyn TemplateStore> = Arc::new(PostgresTemplateStore::new(db.clone()));
    let dead_letters: Arc<dyn DeadLetterStore> = Arc::new(PostgresDeadLetterStore::new(db.clone()));

    // Shared cache
    let cache = RedisPool::new(config.cache.clone()).await?;

    // C2: template cache & renderer
    let templates = Arc::new(TemplateCache::new(
        template_store.clone(),
        cache.clone(),
        config.cache.template_compiled_ttl_hours,
        config.cache.template_rendered_ttl_hours,
    ));

    // C11 + C3: blacklist, digest buffer, preference gate
    let blacklist = TokenBlacklist::new(cache.clone(), config.security.blacklist_default_ttl_secs);
    let digest = DigestBuffer::new(cache.clone());
    let gate = Arc::new(PreferenceGate::new(
        preferences.clone(),
        blacklist.clone(),
        digest,
    ));

    // C4: rate limiter
    let rate_limiter = RateLimiter::new(cache.clone(), config.rate_limiting.clone());

    // C6: broker topology; unreachable broker at boot is fatal
    let broker = Arc::new(Broker::connect(config.broker.clone()).await?);
    broker.declare_topology().await?;
    let publisher = Publisher::new(broker.create_channel().await?, broker.config());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        gate,
        templates.clone(),
        publisher.clone(),
        dead_letters.clone(),
    ));
    dispatcher.spawn(&broker, shutdown_rx.clone()).await?;
    info!("Dispatcher consuming ingress lanes");

    // C7: channel worker pools
    let backoff = ExponentialBackoff::new(
        Duration::from_secs(config.delivery.backoff_base_secs),
        Duration::from_secs(config.delivery.backoff_cap_secs),
    );

    for channel in Channel::ALL {
        let transport: Arc<dyn Transport> = match channel {
            Channel::Email => Arc::new(SmtpEmailTransport::new(&config.smtp)?),
            Channel::InApp => Arc::new(InAppTransport),
            Channel::Push => Arc::new(HttpGatewayTransport::push(&config.gateways)?),
            Channel::Sms => Arc::new(HttpGatewayTransport::sms(&config.gateways)?),
        };

        let worker = Arc::new(DeliveryWorker::new(
            channel,
            store.clone(),
            templates.clone(),
            transport,
            Publisher::new(broker.create_channel().await?, broker.config()),
            dead_letters.clone(),
            config.delivery.max_retries,
            backoff.clone(),
        ));

        WorkerPool::start(
            &broker,
            worker,
            channel,
            config.delivery.initial_workers,
            shutdown_rx.clone(),
        )
        .await?;
    }
    info!(
        workers_per_channel = config.delivery.initial_workers,
        "Channel workers started"
    );

    // C8: dead-letter administration
    let replay = Arc::new(ReplayController::create(&broker, store.clone(), dead_letters.clone()).await?);

    // C9: scheduler
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        templates.clone(),
        config.retention.clone(),
    ));
    scheduler.start(shutdown_rx.clone());

    // C10: queue depth gauges
    observability::spawn_queue_depth_sampler(broker.clone(), shutdown_rx.clone());

    // Auth decision contract inputs
    let jwt = JwtVerifier::new(
        &config.security.jwt_secret,
        config.security.jwt_issuer.as_deref(),
    );
    let api_keys = ApiKeyRegistry::new(config.security.service_api_keys.clone());

    // C5: the HTTP surface comes last
    let host = config.server.host.clone();
    let port = config.server.port;

    let state = AppState {
        config: Arc::new(config),
        db,
        store,
        preferences,
        template_store,
        templates,
        cache,
        broker,
        publisher,
        rate_limiter,
        blacklist,
        jwt,
        api_keys,
        scheduler,
        replay,
        metrics,
    };

    let router = server::build_router(state);

    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    };

    server::serve(router, &host, port, shutdown).await
}
