//! xregion-daemon - cross-region transaction coordinator
//!
//! Drives the run, finish and commit phases for one region against a shared
//! transaction store. Several instances (one per region, or several per
//! region) may share the same database file; they coordinate only through
//! conditional updates in the store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use xregion_core::config::CoordinatorConfig;
use xregion_core::store::{NewTransactionInfo, StoreHandle, TransactionStatus};
use xregion_core::{Clock, SystemClock, TransactionStore};
use xregion_daemon::scheduler::{run_once, spawn_phase_loops};
use xregion_daemon::state::{SchedulerState, SharedState};
use xregion_daemon::{status, wiring};

/// xregion daemon - cross-region transaction coordinator
#[derive(Parser, Debug)]
#[command(name = "xregion-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (defaults apply when missing)
    #[arg(short, long, default_value = "xregion.toml")]
    config: PathBuf,

    /// Region this instance runs units for (overrides the config file)
    #[arg(long)]
    region: Option<String>,

    /// Path to the transaction database (overrides the config file)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log file path (logs to stdout if not specified)
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive the three phases until SIGINT/SIGTERM
    Run {
        /// Run one tick of each phase and exit (cron mode)
        #[arg(long)]
        once: bool,

        /// Use an in-memory region when `regional_api.base_url` is unset
        #[arg(long)]
        dry_run: bool,
    },

    /// Create a transaction for every registered region
    Submit {
        #[command(subcommand)]
        kind: SubmitKind,
    },

    /// List transactions with per-region progress
    Status {
        /// Only show transactions in this state (READY, RUNNING, FINISH,
        /// COMMITED, ERROR)
        #[arg(long, value_parser = parse_status)]
        state: Option<TransactionStatus>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SubmitKind {
    /// Delete a user in every region
    DeleteUser {
        /// User to delete
        #[arg(long)]
        user_uid: String,
    },

    /// Merge one account into another in every region
    MergeUser {
        /// Account folded away
        #[arg(long)]
        merge_user_uid: String,

        /// Surviving account
        #[arg(long)]
        user_uid: String,
    },
}

fn parse_status(value: &str) -> Result<TransactionStatus, String> {
    value
        .to_ascii_uppercase()
        .parse()
        .map_err(|e: xregion_core::store::model::UnknownLabel| e.to_string())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let config = load_config(&args)?;
    let handle = StoreHandle::new(&config.coordinator.database);
    let store = handle.get().context("failed to open transaction store")?;

    let result = match args.command {
        Command::Run { once, dry_run } => {
            let mut config = config;
            config.regional_api.dry_run |= dry_run;
            run(&config, store, once).await
        },
        Command::Submit { kind } => submit(&config, &store, kind),
        Command::Status { state, json } => print_status(&store, state, json),
    };

    if let Err(e) = handle.shutdown() {
        warn!(error = %e, "failed to close transaction store");
    }
    result
}

fn load_config(args: &Args) -> Result<CoordinatorConfig> {
    let mut config = CoordinatorConfig::from_file_or_default(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(region) = &args.region {
        config.coordinator.region_uid.clone_from(region);
    }
    if let Some(database) = &args.database {
        config.coordinator.database.clone_from(database);
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn run(config: &CoordinatorConfig, store: TransactionStore, once: bool) -> Result<()> {
    let coordinator = wiring::build_coordinator(config, store, Arc::new(SystemClock))?;
    info!(
        region_uid = %coordinator.region_uid(),
        database = %config.coordinator.database.display(),
        once,
        "xregion coordinator starting"
    );

    if once {
        let report = run_once(&coordinator).await?;
        info!(
            run = ?report.run,
            promoted = report.finish.promoted.len(),
            commit = ?report.commit,
            "single pass complete"
        );
        return Ok(());
    }

    let state: SharedState = Arc::new(SchedulerState::new());

    // Handle Unix signals
    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    let signal_state = Arc::clone(&state);
    let signal_task = tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
        signal_state.request_shutdown();
    });

    let loops = spawn_phase_loops(&coordinator, &config.coordinator, &state);
    for handle in loops {
        if let Err(e) = handle.await {
            error!(error = %e, "phase loop panicked");
            state.request_shutdown();
        }
    }
    signal_task.abort();

    info!(
        started_at = %state.started_at().to_rfc3339(),
        uptime_secs = state.uptime_secs(),
        "xregion coordinator stopped"
    );
    Ok(())
}

fn submit(config: &CoordinatorConfig, store: &TransactionStore, kind: SubmitKind) -> Result<()> {
    let clock = SystemClock;
    store
        .register_region(&config.coordinator.region_uid, clock.now_ms())
        .context("failed to register region")?;
    let regions = wiring::region_registry(config, store)
        .regions()
        .context("failed to read region registry")?;
    if regions.is_empty() {
        bail!("no regions registered");
    }

    let info = match kind {
        SubmitKind::DeleteUser { user_uid } => NewTransactionInfo::DeleteUser { user_uid },
        SubmitKind::MergeUser {
            merge_user_uid,
            user_uid,
        } => {
            if merge_user_uid == user_uid {
                bail!("cannot merge an account into itself");
            }
            NewTransactionInfo::MergeUser {
                merge_user_uid,
                user_uid,
            }
        },
    };
    let transaction_type = info.transaction_type();
    let uid = store
        .create_transaction(&info, &regions, clock.now_ms())
        .context("failed to create transaction")?;
    info!(transaction_uid = %uid, %transaction_type, regions = regions.len(), "transaction submitted");
    println!("{uid}");
    Ok(())
}

fn print_status(store: &TransactionStore, state: Option<TransactionStatus>, json: bool) -> Result<()> {
    let reports = status::collect(store, state)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&reports).context("failed to encode status")?
        );
    } else {
        print!("{}", status::render_text(&reports));
    }
    Ok(())
}
