// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Orbit Finality Tracker
//!
//! ## Architecture
//!
//! ```text
//!  ┌───────────┐  enqueue   ┌────────────────┐  dequeue  ┌──────────────┐
//!  │ Scheduler │──────────▶│ JobCoordinator │──────────▶│  JobWorker   │
//!  └───────────┘ (dedup)    └────────────────┘  (queue)  └──────┬───────┘
//!                                                               │
//!                         ┌────────────────┬────────────────────┤
//!                         ▼                ▼                    ▼
//!                  BatchDiscovery     BatchMonitor    TransactionProcessor
//!                         │                │                    │
//!                         └────────────────┴────────────────────┘
//!                                          ▼
//!                                  FinalityStore (PostgreSQL)
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use orbit_finality_core::parser::BatchParser;
use orbit_finality_core::{Clock, FinalityMetrics, SystemClock};
use orbit_finality_pg_db::{Db, DbArgs};
use orbit_finality_schema::MIGRATIONS;
use orbit_finality_tracker::chains::ChainRegistry;
use orbit_finality_tracker::config::EngineConfig;
use orbit_finality_tracker::coordinator::{
    DedupBackend, JobCoordinator, MemoryDedupBackend, RedisDedupBackend,
};
use orbit_finality_tracker::discovery::BatchDiscovery;
use orbit_finality_tracker::jobs::InMemoryJobQueue;
use orbit_finality_tracker::lookup::{
    MemoryTransactionLookup, PgTransactionLookup, TransactionLookup,
};
use orbit_finality_tracker::monitor::BatchMonitor;
use orbit_finality_tracker::processor::TransactionProcessor;
use orbit_finality_tracker::scheduler::Scheduler;
use orbit_finality_tracker::server;
use orbit_finality_tracker::store::{
    FinalityStore, MemoryStore, ParentLogIndex, PgFinalityStore,
};
use orbit_finality_tracker::validation::ContractValidator;
use orbit_finality_tracker::worker::JobWorker;
use prometheus::Registry;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use url::Url;

const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser)]
#[clap(rename_all = "kebab-case", author, version)]
struct Args {
    #[command(flatten)]
    db_args: DbArgs,
    /// Engine configuration (YAML, `${VAR}` placeholders are substituted)
    #[clap(env = "FINALITY_CONFIG", long)]
    config: Option<PathBuf>,
    #[clap(env, long)]
    database_url: Option<Url>,
    #[clap(env, long, default_value = "0.0.0.0:9184")]
    metrics_address: SocketAddr,
    #[clap(env, long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    /// Overrides `redis_url` from the configuration file
    #[clap(env, long)]
    redis_url: Option<String>,
    #[clap(env, long, value_enum, default_value_t = StoreKind::Postgres)]
    store: StoreKind,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run the scheduler, the worker pool and the metrics server (default)
    Run,
    /// Discover new batches for one chain and exit
    Discover {
        #[clap(long)]
        chain_id: u64,
    },
    /// Advance batch statuses for one chain and exit
    Monitor {
        #[clap(long)]
        chain_id: u64,
    },
    /// Process one tracked transaction and exit
    Process {
        #[clap(long)]
        transaction_id: u64,
    },
    /// Check that a chain's contracts are deployed and callable
    Validate {
        #[clap(long)]
        chain_id: u64,
    },
    /// Apply pending database migrations and exit
    Migrate,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum StoreKind {
    Postgres,
    Memory,
}

// ============================================================================
// Wiring
// ============================================================================

struct Engine {
    store: Arc<dyn FinalityStore>,
    registry: Arc<ChainRegistry>,
    discovery: Arc<BatchDiscovery>,
    monitor: Arc<BatchMonitor>,
    validator: Arc<ContractValidator>,
    processor: Arc<TransactionProcessor>,
    clock: Arc<dyn Clock>,
    metrics: Arc<FinalityMetrics>,
}

struct Storage {
    store: Arc<dyn FinalityStore>,
    log_index: Arc<dyn ParentLogIndex>,
    lookup: Arc<dyn TransactionLookup>,
}

async fn init_database(args: &Args) -> anyhow::Result<Db> {
    let database_url = args
        .database_url
        .clone()
        .context("--database-url is required for the postgres store")?;
    let db = Db::for_write(database_url, args.db_args.clone()).await?;
    db.run_migrations(&MIGRATIONS)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations completed");
    Ok(db)
}

async fn init_storage(args: &Args) -> anyhow::Result<Storage> {
    match args.store {
        StoreKind::Postgres => {
            let db = init_database(args).await?;
            let store = Arc::new(PgFinalityStore::new(db.clone()));
            Ok(Storage {
                store: store.clone(),
                log_index: store,
                lookup: Arc::new(PgTransactionLookup::new(db)),
            })
        }
        StoreKind::Memory => {
            tracing::warn!("[Main] Using the in-memory store, state is lost on exit");
            let store = Arc::new(MemoryStore::new());
            Ok(Storage {
                store: store.clone(),
                log_index: store,
                lookup: Arc::new(MemoryTransactionLookup::new()),
            })
        }
    }
}

async fn init_engine(
    config: &EngineConfig,
    storage: Storage,
    registry: &Registry,
) -> anyhow::Result<Engine> {
    let metrics = Arc::new(FinalityMetrics::new(registry));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let chains = Arc::new(ChainRegistry::with_http_providers(
        storage.store.clone(),
        config.rpc.clone(),
        Some(metrics.clone()),
    ));
    for chain in &config.chains {
        chains
            .update_chain(chain)
            .await
            .with_context(|| format!("Failed to seed chain {}", chain.chain_id))?;
        tracing::info!("[Main] Tracking {} ({})", chain.display_name(), chain.chain_id);
    }

    let parser = BatchParser::new(config.parser.clone(), Some(metrics.clone()));
    let discovery = Arc::new(BatchDiscovery::new(
        chains.clone(),
        storage.log_index,
        parser,
        config.discovery.clone(),
        Some(metrics.clone()),
    ));
    let monitor = Arc::new(BatchMonitor::new(
        chains.clone(),
        clock.clone(),
        config.monitor.clone(),
        Some(metrics.clone()),
    ));
    let validator = Arc::new(ContractValidator::new(config.validation_ttl(), clock.clone()));
    let processor = Arc::new(TransactionProcessor::new(
        chains.clone(),
        storage.lookup,
        discovery.clone(),
        validator.clone(),
        clock.clone(),
        config.processor.clone(),
        Some(metrics.clone()),
    ));

    Ok(Engine {
        store: storage.store,
        registry: chains,
        discovery,
        monitor,
        validator,
        processor,
        clock,
        metrics,
    })
}

async fn init_dedup_backend(
    redis_url: Option<&str>,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Arc<dyn DedupBackend>> {
    match redis_url {
        Some(url) => {
            let backend = RedisDedupBackend::connect(url, REDIS_CONNECT_TIMEOUT)
                .await
                .context("Failed to connect to Redis")?;
            tracing::info!("[Main] Job deduplication backed by Redis");
            Ok(Arc::new(backend))
        }
        None => {
            tracing::info!("[Main] Job deduplication is process-local");
            Ok(Arc::new(MemoryDedupBackend::new(clock)))
        }
    }
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path),
        None => {
            tracing::warn!("[Main] No --config given, using defaults with no chains");
            Ok(EngineConfig::default())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

async fn run_service(
    args: &Args,
    config: &EngineConfig,
    engine: Engine,
    registry: Registry,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let server_handle = server::serve(
        args.metrics_address,
        registry,
        engine.store.clone(),
        cancel.child_token(),
    )
    .await?;

    let redis_url = args.redis_url.as_deref().or(config.redis_url.as_deref());
    let dedup = init_dedup_backend(redis_url, engine.clock.clone()).await?;
    let queue = Arc::new(InMemoryJobQueue::new(
        config.worker.max_attempts,
        engine.clock.clone(),
    ));
    let coordinator = Arc::new(JobCoordinator::new(
        dedup,
        queue.clone(),
        engine.clock.clone(),
        config.coordinator.clone(),
        Some(engine.metrics.clone()),
    ));

    let worker = Arc::new(JobWorker::new(
        queue.clone(),
        coordinator.clone(),
        engine.discovery.clone(),
        engine.monitor.clone(),
        engine.processor.clone(),
        config.worker.clone(),
        Some(engine.metrics.clone()),
    ));
    let scheduler = Scheduler::new(
        engine.store.clone(),
        coordinator,
        queue,
        config.scheduler.clone(),
    );

    let handles = vec![
        tokio::spawn(scheduler.run(cancel.child_token())),
        tokio::spawn(worker.run(cancel.child_token())),
        server_handle,
    ];

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("[Main] Failed to listen for shutdown signal: {:?}", e);
        }
        tracing::info!("[Main] Shutdown requested");
        shutdown.cancel();
    });

    tracing::info!("Waiting for {} tasks to complete", handles.len());
    let _ = futures::future::join_all(handles).await;
    tracing::warn!("All services stopped");
    Ok(())
}

async fn run_command(command: Command, engine: &Engine) -> anyhow::Result<()> {
    match command {
        Command::Discover { chain_id } => {
            print_json(&engine.discovery.discover(chain_id).await?)
        }
        Command::Monitor { chain_id } => print_json(&engine.monitor.monitor(chain_id).await?),
        Command::Process { transaction_id } => {
            print_json(&engine.processor.process(transaction_id).await?)
        }
        Command::Validate { chain_id } => {
            let runtime = engine.registry.runtime(chain_id).await?;
            let report = engine.validator.validate(&runtime).await?;
            print_json(&report)?;
            if !report.is_valid() {
                anyhow::bail!("chain {} failed contract validation", chain_id);
            }
            Ok(())
        }
        Command::Run | Command::Migrate => Ok(()),
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    init_logging(args.log_format);

    let command = args.command.clone().unwrap_or(Command::Run);
    if let Command::Migrate = command {
        init_database(&args).await?;
        return Ok(());
    }

    let config = load_config(args.config.as_ref())?;
    let registry = Registry::new_custom(Some("orbit".into()), None)
        .context("Failed to create Prometheus registry")?;
    let storage = init_storage(&args).await?;
    let engine = init_engine(&config, storage, &registry).await?;

    match command {
        Command::Run => run_service(&args, &config, engine, registry).await,
        other => run_command(other, &engine).await,
    }
}
