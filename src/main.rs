use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use agent_harness::config::Config;
use agent_harness::debug::DebugTracker;
use agent_harness::eventbus::EventBus;
use agent_harness::logging;
use agent_harness::manager::Manager;
use agent_harness::poller::Poller;
use agent_harness::rest::{self, ApiState};
use agent_harness::tmux::{SystemTmuxClient, TmuxClient, TmuxError};
use agent_harness::webhook::WebhookDispatcher;

#[derive(Parser)]
#[command(name = "agent-harness")]
#[command(about = "Supervises coding-agent CLIs inside tmux behind an HTTP/SSE control plane")]
#[command(version)]
struct Cli {
    /// Config file path (defaults: .agent-harness/config.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Boot the HTTP/SSE control plane (projects, agents, events, webhooks)
    Serve {
        /// Port to listen on (overrides config/rest_api.port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Check that a usable tmux is on PATH and exit
    CheckTmux,
}

fn print_tmux_error(err: &TmuxError) {
    eprintln!("Error: {err}");
    eprintln!();
    match err {
        TmuxError::NotInstalled => {
            eprintln!("tmux is required to run agent-harness.");
            eprintln!();
            eprintln!("Install tmux:");
            eprintln!("  macOS:         brew install tmux");
            eprintln!("  Ubuntu/Debian: sudo apt install tmux");
            eprintln!("  Fedora/RHEL:   sudo dnf install tmux");
            eprintln!("  Arch:          sudo pacman -S tmux");
        }
        TmuxError::VersionTooOld(current, required) => {
            eprintln!("Your tmux version ({current}) is older than the minimum required ({required}).");
            eprintln!();
            eprintln!("Please upgrade tmux to continue.");
        }
        _ => {
            eprintln!("Please ensure tmux is properly installed and working.");
        }
    }
}

/// tmux 2.1 is the floor: anything older lacks reliable buffer-based paste
/// (`load-buffer`/`paste-buffer`) semantics the startup handshake depends on.
const MIN_TMUX_MAJOR: u32 = 2;
const MIN_TMUX_MINOR: u32 = 1;

fn check_tmux_available(client: &dyn TmuxClient) -> Result<(), TmuxError> {
    let version = client.check_available()?;
    if !version.meets_minimum(MIN_TMUX_MAJOR, MIN_TMUX_MINOR) {
        return Err(TmuxError::VersionTooOld(version.raw, format!("{MIN_TMUX_MAJOR}.{MIN_TMUX_MINOR}")));
    }
    tracing::debug!(version = %version.raw, "tmux available");
    Ok(())
}

async fn run_check_tmux() -> Result<()> {
    let tmux = SystemTmuxClient::new();
    match check_tmux_available(&tmux) {
        Ok(()) => {
            println!("tmux OK");
            Ok(())
        }
        Err(err) => {
            print_tmux_error(&err);
            std::process::exit(1);
        }
    }
}

async fn run_serve(config: Arc<Config>) -> Result<()> {
    let tmux: Arc<dyn TmuxClient> = Arc::new(SystemTmuxClient::new());
    if let Err(err) = check_tmux_available(tmux.as_ref()) {
        print_tmux_error(&err);
        std::process::exit(1);
    }

    // Construction order per §9: EventBus, then Manager (which owns the
    // store and takes the EventBus by reference), then Poller/Dispatcher.
    let event_bus = Arc::new(EventBus::new(config.poller.max_event_history));
    let manager = Arc::new(
        Manager::new(config.clone(), tmux, event_bus.clone())
            .with_callbacks_persistence(config.callbacks_path()),
    );
    let debug = Arc::new(DebugTracker::new());
    let webhook = WebhookDispatcher::new(manager.clone());
    webhook.install(&event_bus);

    tracing::info!("rehydrating projects and agents from existing tmux state");
    manager.rehydrate_projects_from_tmux().await?;
    manager.rehydrate_agents_from_tmux().await?;

    let poller = Poller::new(manager.clone(), debug.clone());
    let cancel = tokio_util::sync::CancellationToken::new();

    let poller_handle = tokio::spawn(poller.run(cancel.clone()));
    let safety_net_handle = tokio::spawn(webhook.clone().run_safety_net(cancel.clone()));

    let state = ApiState { manager, event_bus, webhook, debug, config: config.clone() };
    let port = config.rest_api.port;

    tokio::select! {
        result = rest::serve(state, port) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    cancel.cancel();
    let _ = poller_handle.await;
    let _ = safety_net_handle.await;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Commands::Serve { port: Some(port) } = cli.command {
        config.rest_api.port = port;
    }
    let config = Arc::new(config);

    let _logging_handle = logging::init_logging(&config, cli.debug)?;

    match cli.command {
        Commands::Serve { .. } => run_serve(config).await,
        Commands::CheckTmux => run_check_tmux().await,
    }
}
