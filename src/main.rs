use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use instrumental_engine::config::{ensure_dirs, AppConfig, CliConfig, FileConfig};
use instrumental_engine::events::EventLog;
use instrumental_engine::locks::{LockError, SingletonLock};
use instrumental_engine::pipeline::Processor;
use instrumental_engine::sync::{ManifestOutcome, SyncRouter};

const EXIT_CONFIG_INVALID: u8 = 2;
const EXIT_ALREADY_RUNNING: u8 = 3;
const EXIT_FILESYSTEM: u8 = 4;
const EXIT_INTERNAL: u8 = 64;

#[derive(Parser, Debug)]
#[command(
    name = "instrumental-engine",
    version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ")"),
    about = "Vocal-separation pipeline engine: queue consumer, processor and sync router"
)]
struct Cli {
    /// Path to a TOML configuration file. File values override CLI values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Incoming root for legacy drop-folder inputs.
    #[arg(long)]
    incoming: Option<PathBuf>,

    /// Working root for claimed bundles and scratch space.
    #[arg(long)]
    working: Option<PathBuf>,

    /// Root for published job outputs and manifests.
    #[arg(long)]
    outputs_dir: Option<PathBuf>,

    /// Archive root for completed and failed bundles.
    #[arg(long)]
    archive_dir: Option<PathBuf>,

    /// Directory for the structured event log.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Path to the engine state database.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Log sync transfers without executing them.
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<EngineCommand>,
}

#[derive(Subcommand, Debug)]
enum EngineCommand {
    /// Start the processor loop (default).
    Run,
    /// Claim and process the single oldest job, then exit.
    RunOnce,
    /// Run the sync router loop.
    SyncDaemon,
    /// Sync the artifacts of one manifest, then exit.
    SyncOnce { manifest: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .init();

    let file_config = match &cli.config {
        Some(path) => match FileConfig::load(path) {
            Ok(config) => Some(config),
            Err(e) => {
                error!("{e:#}");
                return ExitCode::from(EXIT_CONFIG_INVALID);
            }
        },
        None => None,
    };
    let cli_config = CliConfig {
        incoming: cli.incoming.clone(),
        working: cli.working.clone(),
        outputs_dir: cli.outputs_dir.clone(),
        archive_dir: cli.archive_dir.clone(),
        log_dir: cli.log_dir.clone(),
        db_path: cli.db_path.clone(),
        dry_run: cli.dry_run,
    };
    let config = match AppConfig::resolve(&cli_config, file_config) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e:#}");
            return ExitCode::from(EXIT_CONFIG_INVALID);
        }
    };

    if let Err(e) = ensure_dirs(&config) {
        error!("cannot create engine directories: {e}");
        return ExitCode::from(EXIT_FILESYSTEM);
    }
    let events = match EventLog::new(&config.log_dir) {
        Ok(log) => Arc::new(log),
        Err(e) => {
            error!("cannot open event log: {e}");
            return ExitCode::from(EXIT_FILESYSTEM);
        }
    };

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let command = cli.command.unwrap_or(EngineCommand::Run);
    let result = match command {
        EngineCommand::Run => run_processor(&config, events, shutdown, false).await,
        EngineCommand::RunOnce => run_processor(&config, events, shutdown, true).await,
        EngineCommand::SyncDaemon => run_sync_daemon(&config, events, shutdown).await,
        EngineCommand::SyncOnce { manifest } => run_sync_once(&config, events, &manifest).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_INTERNAL)
        }
    }
}

/// Cooperative shutdown on SIGINT/SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    error!("cannot install SIGTERM handler: {e}");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("shutdown requested; finishing in-flight work");
        shutdown.cancel();
    });
}

async fn run_processor(
    config: &AppConfig,
    events: Arc<EventLog>,
    shutdown: CancellationToken,
    once: bool,
) -> anyhow::Result<ExitCode> {
    let _lock = match SingletonLock::acquire(&config.singleton_lock_path()) {
        Ok(lock) => lock,
        Err(LockError::AlreadyRunning { holder }) => {
            error!("another processor holds the singleton lock ({holder})");
            return Ok(ExitCode::from(EXIT_ALREADY_RUNNING));
        }
        Err(LockError::Io(e)) => {
            error!("cannot acquire singleton lock: {e}");
            return Ok(ExitCode::from(EXIT_FILESYSTEM));
        }
        Err(e) => return Err(e.into()),
    };

    let processor = Processor::new(config.clone(), events);
    if once {
        let progressed = processor.process_next(&shutdown).await?;
        if !progressed {
            info!("nothing to process");
        }
    } else {
        processor.run(shutdown).await?;
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_sync_daemon(
    config: &AppConfig,
    events: Arc<EventLog>,
    shutdown: CancellationToken,
) -> anyhow::Result<ExitCode> {
    let router = SyncRouter::new(config, events).context("cannot open sync state store")?;
    router.run(shutdown).await?;
    Ok(ExitCode::SUCCESS)
}

async fn run_sync_once(
    config: &AppConfig,
    events: Arc<EventLog>,
    manifest: &PathBuf,
) -> anyhow::Result<ExitCode> {
    let router = SyncRouter::new(config, events).context("cannot open sync state store")?;
    let outcome = router.sync_manifest(manifest).await?;
    match outcome {
        ManifestOutcome::Completed => Ok(ExitCode::SUCCESS),
        ManifestOutcome::Deferred | ManifestOutcome::Failed => {
            error!("sync did not complete: {outcome:?}");
            Ok(ExitCode::from(EXIT_INTERNAL))
        }
        ManifestOutcome::Invalid => {
            error!("manifest is invalid: {}", manifest.display());
            Ok(ExitCode::from(EXIT_CONFIG_INVALID))
        }
    }
}
