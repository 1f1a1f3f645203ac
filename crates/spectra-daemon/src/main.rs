//! Headless entrypoint. Exit codes: 0 success, 1 operational failure,
//! 130 user interrupt.
//!
//! The MTProto transport adapter is deliberately not part of this
//! repository; deployments link one and drive [`spectra_daemon::Runtime`]
//! directly. `--offline` wires the scripted in-memory gateway instead so
//! configuration and loops can be rehearsed without a network.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use spectra_core::{SpectraConfig, SystemClock};
use spectra_daemon::{Orchestrator, Runtime};
use spectra_gateway::mock::ScriptedConnector;
use spectra_gateway::GatewayConnector;
use spectra_store::{ChecksumTable, Store};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_INTERRUPT: u8 = 130;

#[derive(Parser)]
#[command(name = "spectra", about = "Multi-account Telegram fleet orchestration")]
struct Args {
    /// Path to spectra.toml (SPECTRA_* env vars override).
    #[arg(long)]
    config: Option<String>,

    /// Use the scripted in-memory gateway instead of a real transport.
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator loops until interrupted.
    Run,
    /// Recompute discovered-group priorities from the stored edge set.
    Refresh,
    /// Print the current top priority targets.
    Targets {
        #[arg(long, default_value_t = 20)]
        count: usize,
        #[arg(long, default_value_t = 0.0)]
        min_priority: f64,
    },
    /// Scan message and media tables for missing checksums.
    Verify,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = match SpectraConfig::load(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "could not load configuration");
            return ExitCode::from(1);
        }
    };

    match dispatch(args, config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "operation failed");
            ExitCode::from(1)
        }
    }
}

async fn dispatch(args: Args, config: SpectraConfig) -> anyhow::Result<ExitCode> {
    match args.command {
        Command::Run => run(config, args.offline).await,
        Command::Refresh => {
            let store = open_store(&config)?;
            let analyzer = spectra_discovery::NetworkAnalyzer::new(store);
            let nodes = analyzer.recompute()?;
            info!(nodes, "priorities refreshed");
            Ok(ExitCode::SUCCESS)
        }
        Command::Targets { count, min_priority } => {
            let store = open_store(&config)?;
            let analyzer = spectra_discovery::NetworkAnalyzer::new(store);
            for group in analyzer.top_priority_targets(count, min_priority)? {
                println!("{:.4}  {}  [{}]", group.priority, group.link, group.status);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Verify => {
            let store = open_store(&config)?;
            let mut issues = store.verify_checksums(ChecksumTable::Messages, None)?;
            issues.extend(store.verify_checksums(ChecksumTable::Media, None)?);
            for issue in &issues {
                println!("{}: {}", issue.id, issue.issue);
            }
            info!(issues = issues.len(), "integrity scan complete");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn open_store(config: &SpectraConfig) -> anyhow::Result<Arc<Store>> {
    Ok(Arc::new(Store::open(
        &config.paths.db_path,
        config.paths.display_timezone.as_deref(),
    )?))
}

async fn run(config: SpectraConfig, offline: bool) -> anyhow::Result<ExitCode> {
    let connector: Arc<dyn GatewayConnector> = if offline {
        info!("offline mode: using the scripted gateway");
        ScriptedConnector::new()
    } else {
        anyhow::bail!(
            "no Telegram transport adapter is linked into this binary; \
             deployments implement spectra_gateway::GatewayConnector and drive \
             spectra_daemon::Runtime, or pass --offline for a rehearsal run"
        );
    };

    let runtime = Arc::new(Runtime::build(config, connector, Arc::new(SystemClock))?);
    let connected = runtime.manager.init_fleet().await?;
    if connected == 0 {
        info!("no account could be connected; loops will idle");
    }

    let orchestrator = Orchestrator::new(runtime.clone());
    let shutdown_rx = runtime.shutdown_rx.clone();
    let loops = tokio::spawn(orchestrator.run(shutdown_rx));

    let interrupted = tokio::signal::ctrl_c().await.is_ok();
    info!("interrupt received, draining");
    let _ = runtime.shutdown_tx.send(true);
    let _ = loops.await;

    if interrupted {
        Ok(ExitCode::from(EXIT_INTERRUPT))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
