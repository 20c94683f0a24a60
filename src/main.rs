//! Ask Continue CLI
//!
//! Runs either side of the ask/answer bridge: a console UI host, or a
//! one-shot requester that asks and prints the outcome.

use anyhow::Context;
use ask_continue::console::{run_console, ConsolePresenter};
use ask_continue::process::SystemProcesses;
use ask_continue::{AskDispatcher, AskKind, BridgeConfig, PortStore, Requester, Sweeper};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Ask Continue - pause a tool and wait for a human answer
#[derive(Parser, Debug)]
#[command(name = "ask-continue")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbose output: debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a console UI host that answers asks
    Host {
        /// Base port for the ask endpoint
        #[arg(short, long)]
        port: Option<u16>,

        /// Skip the stale-process sweep at startup
        #[arg(long)]
        no_sweep: bool,
    },

    /// Ask the running host and print the answer
    Ask {
        /// Host port to ask
        #[arg(short, long, conflicts_with = "discover")]
        port: Option<u16>,

        /// Use the newest live host from the discovery directory
        #[arg(long)]
        discover: bool,

        /// Give up after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Why the tool is pausing
        #[arg(trailing_var_arg = true, required = true)]
        reason: Vec<String>,
    },

    /// List discovery records as JSON lines
    Discover {
        /// Include records whose process is gone
        #[arg(long)]
        all: bool,
    },

    /// Kill stale listeners and prune dead discovery records
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = BridgeConfig::load_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Command::Host { port, no_sweep } => run_host(config, port, no_sweep).await,
        Command::Ask {
            port,
            discover,
            timeout_ms,
            reason,
        } => run_ask(config, port, discover, timeout_ms, reason.join(" ")).await,
        Command::Discover { all } => run_discover(config, all).await,
        Command::Sweep => run_sweep(config).await,
    }
}

async fn run_host(
    mut config: BridgeConfig,
    port: Option<u16>,
    no_sweep: bool,
) -> anyhow::Result<()> {
    if let Some(port) = port {
        config = config.with_host_port(port);
    }
    info!("Starting UI host, discovery dir {:?}", config.discovery_dir);

    if !no_sweep {
        let sweeper = Sweeper::new(&config);
        tokio::spawn(async move {
            sweeper.run().await;
        });
    }

    let presenter = ConsolePresenter::new();
    let mut dispatcher = AskDispatcher::new(config.clone(), Arc::new(presenter.clone()));
    if let Err(e) = dispatcher.start().await {
        // Keep the console up so `:restart` can try again.
        warn!("Ask service unavailable: {}", e);
    }

    run_console(dispatcher, presenter, Sweeper::new(&config)).await
}

async fn run_ask(
    config: BridgeConfig,
    port: Option<u16>,
    discover: bool,
    timeout_ms: Option<u64>,
    reason: String,
) -> anyhow::Result<()> {
    let host_port = match (port, discover) {
        (Some(port), _) => port,
        (None, true) => PortStore::new(config.discovery_dir.clone())
            .newest_live(&SystemProcesses)
            .await?
            .map(|record| record.port)
            .context("No live UI host found in the discovery directory")?,
        (None, false) => config.host_port,
    };

    let mut requester = Requester::start(&config).await?.with_host_port(host_port);
    if let Some(ms) = timeout_ms {
        requester = requester.with_ask_timeout(Duration::from_millis(ms));
    }
    info!(
        "Asking host on port {} (callback port {})",
        host_port,
        requester.callback_port()
    );

    let outcome = requester.ask(reason).await;
    requester.shutdown().await;

    println!("{}", outcome.tool_text(AskKind::Ask));
    if outcome.is_error() {
        anyhow::bail!("Ask did not complete");
    }
    Ok(())
}

async fn run_discover(config: BridgeConfig, all: bool) -> anyhow::Result<()> {
    let store = PortStore::new(config.discovery_dir.clone());
    let records = if all {
        store.records().await?
    } else {
        store.live_records(&SystemProcesses).await?
    };
    for stored in records {
        println!("{}", serde_json::to_string(&stored.record)?);
    }
    Ok(())
}

async fn run_sweep(config: BridgeConfig) -> anyhow::Result<()> {
    let report = Sweeper::new(&config).run().await;
    for killed in &report.terminated {
        println!("killed pid {} on port {}", killed.pid, killed.port);
    }
    for path in &report.pruned {
        println!("pruned {}", path.display());
    }
    Ok(())
}
