use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use common::configuration::Configuration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tollgate::app_state::AppState;
use tollgate::auth::Authenticator;
use tollgate::billing::{
    AccessCache, CounterStore, MemoryAccessCache, MemoryCounters, RedisCounters, Recorder,
    Validator,
};
use tollgate::db::{schema, DbPool};
use tollgate::events::{AccountingHandler, Consumer, Decorator, EventBus, Topic};
use tollgate::handlers::routes::response_cache;
use tollgate::policy::PolicyCache;
use tollgate::server::{serve, Listener};
use tollgate::shutdown::cancel_on_signal;
use tollgate::storage::memory::MemoryStore;
use tollgate::storage::postgres::PostgresStore;
use tollgate::storage::{ConfigStore, EventStore};
use tollgate::utils::metrics::init_metrics;
use tollgate::utils::tracing::init_tracer;
use tracing::{error, info, warn};

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Parser)]
#[command(name = "tollgate", about = "LLM API proxy with virtual keys")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "TOLLGATE_CONFIG")]
    config: PathBuf,
}

// ---------------------------------------------------------------------------
// Configuration loading
// ---------------------------------------------------------------------------

fn load_config(args: &Args) -> Result<Configuration, BoxError> {
    eprintln!("loading configuration from {}", args.config.display());
    Ok(Configuration::load(&args.config)?)
}

// ---------------------------------------------------------------------------
// Storage initialization
// ---------------------------------------------------------------------------

struct Stores {
    config: Arc<dyn ConfigStore>,
    events: Arc<dyn EventStore>,
    pool: Option<DbPool>,
}

async fn init_stores(config: &Configuration) -> Result<Stores, BoxError> {
    let Some(database_url) = &config.database_url else {
        warn!("no database_url configured, policies and events are kept in memory");
        let store = Arc::new(MemoryStore::new());
        return Ok(Stores {
            config: store.clone() as Arc<dyn ConfigStore>,
            events: store,
            pool: None,
        });
    };

    let pool = DbPool::new(database_url)?;
    schema::migrate(&pool)
        .await
        .map_err(|e| format!("failed to prepare database schema: {e}"))?;
    let store = Arc::new(PostgresStore::new(pool.clone()));
    info!(storage_type = "postgres", "initialized storage");
    Ok(Stores {
        config: store.clone() as Arc<dyn ConfigStore>,
        events: store,
        pool: Some(pool),
    })
}

async fn init_counters(
    config: &Configuration,
) -> Result<(Arc<dyn CounterStore>, Arc<dyn AccessCache>), BoxError> {
    match &config.redis_url {
        Some(redis_url) => {
            let redis = Arc::new(
                RedisCounters::connect(redis_url)
                    .await
                    .map_err(|e| format!("failed to connect to redis: {e}"))?,
            );
            info!(counter_store = "redis", "initialized counters");
            let counters: Arc<dyn CounterStore> = redis.clone();
            let access: Arc<dyn AccessCache> = redis;
            Ok((counters, access))
        }
        None => {
            warn!("no redis_url configured, counters are local to this process");
            let counters: Arc<dyn CounterStore> = Arc::new(MemoryCounters::new());
            let access: Arc<dyn AccessCache> = Arc::new(MemoryAccessCache::new());
            Ok((counters, access))
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();
    let config = Arc::new(load_config(&args)?);
    let tracer_provider = init_tracer(config.log_mode)?;

    if let Some(port) = config.metrics_port {
        init_metrics(&config.bind_address, port)?;
        info!(port, "prometheus exporter listening");
    }

    let stores = init_stores(&config).await?;
    let (counters, access) = init_counters(&config).await?;

    let policies = PolicyCache::load(Arc::clone(&stores.config))
        .await
        .map_err(|e| format!("failed to load policies: {e}"))?;
    let token_counter = Arc::new(llmcost::TokenCounter::new()?);
    let decorator = Decorator::new(token_counter);
    let validator = Validator::new(Arc::clone(&counters), Arc::clone(&access));

    // consumers subscribe before anything can publish
    let bus = Arc::new(EventBus::new());
    let consumers_cancel = CancellationToken::new();
    let handler = Arc::new(AccountingHandler::new(
        decorator.clone(),
        Recorder::new(Arc::clone(&stores.events), Arc::clone(&counters)),
        validator.clone(),
        Arc::clone(&access),
        Arc::clone(&policies),
    ));
    let consumers = [Topic::Event, Topic::RequestContent].map(|topic| {
        let rx = bus.subscribe(topic, config.event_bus.capacity);
        Consumer::start(
            topic.as_str(),
            rx,
            handler.clone(),
            config.event_bus.workers,
            consumers_cancel.clone(),
        )
    });

    let http_client = reqwest::Client::builder()
        .timeout(config.upstream_timeout())
        .build()?;

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        config_store: stores.config,
        event_store: stores.events,
        authenticator: Authenticator::new(Arc::clone(&policies)),
        policies: Arc::clone(&policies),
        validator,
        decorator,
        bus: Arc::clone(&bus),
        http_client,
        response_cache: response_cache(),
    });

    let proxy_addr: SocketAddr = format!("{}:{}", config.bind_address, config.proxy_port).parse()?;
    let admin_addr: SocketAddr = format!("{}:{}", config.bind_address, config.admin_port).parse()?;
    let proxy_listener = TcpListener::bind(proxy_addr).await?;
    let admin_listener = TcpListener::bind(admin_addr).await?;

    let refreshers_cancel = CancellationToken::new();
    let refreshers = policies.start_refreshers(config.refresh_interval(), refreshers_cancel.clone());

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone());

    let drain = config.shutdown_timeout();
    tokio::join!(
        serve(
            proxy_listener,
            Listener::Proxy,
            Arc::clone(&state),
            shutdown.clone(),
            drain
        ),
        serve(
            admin_listener,
            Listener::Admin,
            Arc::clone(&state),
            shutdown.clone(),
            drain
        ),
    );

    // listeners are down: drain what the proxy already published
    bus.close();
    let drained = tokio::time::timeout(drain, async {
        for consumer in consumers {
            consumer.join().await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            dropped = bus.dropped(),
            "event consumers did not drain in time, cancelling"
        );
        consumers_cancel.cancel();
    }

    refreshers_cancel.cancel();
    for refresher in refreshers {
        let _ = refresher.await;
    }

    if let Some(pool) = stores.pool {
        pool.close();
    }
    if let Err(e) = tracer_provider.shutdown() {
        error!(error = %e, "failed to flush tracer");
    }
    info!("shutdown complete");
    Ok(())
}
