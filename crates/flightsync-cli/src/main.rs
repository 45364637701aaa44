use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flightsync_core::{EntityType, ProviderType, ValidationTrigger};
use flightsync_provider::AirtableTransportFactory;
use flightsync_storage::{MemoryStore, PgSyncStore, PoolSettings, SyncStore};
use flightsync_sync::{
    build_job, build_scheduler, build_validator, ConfigService, JobKind, JobRegistry, RunContext,
    SyncConfig, ValidationResult,
};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "flightsync-cli")]
#[command(about = "Flight-ops provider sync command-line interface")]
struct Cli {
    /// YAML settings file; environment variables are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Migrate, then run the scheduler until Ctrl-C.
    Run,
    /// One sync run for a single entity type.
    Sync {
        #[arg(long)]
        entity: String,
    },
    /// One backfill run.
    Backfill,
    Validate {
        #[arg(long)]
        tenant: Uuid,
        #[arg(long)]
        version: i32,
        #[arg(long, default_value = "airtable")]
        provider: String,
    },
    Activate {
        #[arg(long)]
        tenant: Uuid,
        #[arg(long)]
        version: i32,
        #[arg(long, default_value = "airtable")]
        provider: String,
    },
    Deactivate {
        #[arg(long)]
        tenant: Uuid,
        #[arg(long, default_value = "airtable")]
        provider: String,
    },
    /// Validate a config document file against the live provider without touching the database.
    CheckConfig { file: PathBuf },
    Migrate,
    /// Scheduler plus the admin HTTP surface.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SyncConfig::from_yaml_file(path)?,
        None => SyncConfig::from_env(),
    };
    let transports = Arc::new(AirtableTransportFactory::new(config.provider_base_url.clone()));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let store = connect(&config).await?;
            store.migrate().await.context("applying migrations")?;
            let cancel = shutdown_on_ctrl_c();
            let scheduler = build_scheduler(&config, Arc::new(store), transports, cancel.clone());
            info!(jobs = JobKind::ALL.len(), "scheduler started");
            cancel.cancelled().await;
            scheduler.shutdown().await;
        }
        Commands::Sync { entity } => {
            let entity_type = EntityType::parse(&entity)
                .with_context(|| format!("unknown entity type {entity:?}"))?;
            let kind = JobKind::for_entity(entity_type)
                .with_context(|| format!("{entity_type} records are not mirrored"))?;
            run_once(kind, &config, transports).await?;
        }
        Commands::Backfill => run_once(JobKind::Backfill, &config, transports).await?,
        Commands::Validate {
            tenant,
            version,
            provider,
        } => {
            let provider_type = parse_provider(&provider)?;
            let store: Arc<dyn SyncStore> = Arc::new(connect(&config).await?);
            let validator = build_validator(&config, store, transports, CancellationToken::new());
            let result = validator
                .validate(tenant, provider_type, version, ValidationTrigger::Cli)
                .await
                .with_context(|| format!("validating {provider_type} config version {version}"))?;
            report_validation(&result)?;
        }
        Commands::Activate {
            tenant,
            version,
            provider,
        } => {
            let provider_type = parse_provider(&provider)?;
            let service = ConfigService::new(Arc::new(connect(&config).await?));
            let active = service
                .activate(tenant, provider_type, version)
                .await
                .with_context(|| format!("activating {provider_type} config version {version}"))?;
            println!("activated: tenant={} version={}", active.tenant_id, active.version);
        }
        Commands::Deactivate { tenant, provider } => {
            let provider_type = parse_provider(&provider)?;
            let service = ConfigService::new(Arc::new(connect(&config).await?));
            let config = service
                .deactivate(tenant, provider_type)
                .await
                .with_context(|| format!("deactivating {provider_type} config"))?;
            println!("deactivated: tenant={} version={}", config.tenant_id, config.version);
        }
        Commands::CheckConfig { file } => {
            let document = read_document(&file)?;
            let store: Arc<dyn SyncStore> = Arc::new(MemoryStore::new());
            let submitted = ConfigService::new(store.clone())
                .submit(Uuid::new_v4(), ProviderType::Airtable, document, BTreeSet::new())
                .await?;
            let validator = build_validator(&config, store, transports, CancellationToken::new());
            let result = validator
                .validate_config(&submitted, ValidationTrigger::Cli)
                .await
                .with_context(|| format!("checking {}", file.display()))?;
            report_validation(&result)?;
        }
        Commands::Migrate => {
            connect(&config).await?.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => serve(&config, transports).await?,
    }

    Ok(())
}

/// `RUST_LOG` filter (default `info`); `FLIGHTSYNC_LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("FLIGHTSYNC_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
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

async fn connect(config: &SyncConfig) -> Result<PgSyncStore> {
    PgSyncStore::connect(&config.database_url, &PoolSettings::default())
        .await
        .context("connecting to the database")
}

fn parse_provider(value: &str) -> Result<ProviderType> {
    ProviderType::parse(value).with_context(|| format!("unknown provider type {value:?}"))
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        token.cancel();
    });
    cancel
}

async fn run_once(
    kind: JobKind,
    config: &SyncConfig,
    transports: Arc<AirtableTransportFactory>,
) -> Result<()> {
    let store = Arc::new(connect(config).await?);
    let job = build_job(kind, config, store, transports);
    let summary = job
        .run(&RunContext::new(shutdown_on_ctrl_c()))
        .await
        .with_context(|| format!("running {kind}"))?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn serve(config: &SyncConfig, transports: Arc<AirtableTransportFactory>) -> Result<()> {
    let store = connect(config).await?;
    store.migrate().await.context("applying migrations")?;
    let store: Arc<dyn SyncStore> = Arc::new(store);
    let cancel = shutdown_on_ctrl_c();

    let scheduler = config
        .scheduler_enabled
        .then(|| build_scheduler(config, store.clone(), transports.clone(), cancel.clone()));
    let registry = match &scheduler {
        Some(scheduler) => scheduler.registry(),
        None => JobRegistry::new(BTreeMap::new(), store.clone()),
    };
    let validator = build_validator(config, store.clone(), transports, cancel.clone());
    let state = flightsync_web::AppState::new(registry, Arc::new(validator), store);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.web_port));
    let served = flightsync_web::serve(addr, state, cancel.clone()).await;
    cancel.cancel();
    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await;
    }
    served
}

/// Config documents are JSON; YAML is accepted too since it is a superset.
fn read_document(path: &Path) -> Result<JsonValue> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn report_validation(result: &ValidationResult) -> Result<()> {
    let record = &result.record;
    println!(
        "validation {}: version={} phases_completed={} duration_ms={}",
        record.status,
        record.config_version,
        record.phases_completed.len(),
        record.duration_ms
    );
    for error in &record.errors {
        println!("  error   {} {}", error.code, error.message);
    }
    for warning in &record.warnings {
        println!("  warning {} {}", warning.code, warning.message);
    }
    if !result.is_valid() {
        bail!("config version {} is invalid", record.config_version);
    }
    Ok(())
}
