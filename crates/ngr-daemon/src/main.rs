//! nago-runner - host agent for the nago control plane.
//!
//! Default invocation runs the agent service loop: connect the event bus,
//! register the dispatcher, start the telemetry scheduler, and keep the node
//! converged until a termination signal arrives. The `configure` and
//! `install` subcommands are one-shot setup helpers.

use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use ngr_core::settings::Settings;
use ngr_daemon::backup::BackupEngine;
use ngr_daemon::bus::WebsocketBus;
use ngr_daemon::dispatch::{self, DispatchContext, ReconcileGate};
use ngr_daemon::proxy::ProxyReconciler;
use ngr_daemon::reconcile::Reconciler;
use ngr_daemon::setup;
use ngr_daemon::sysmgr::{ServiceManager, Systemctl};
use ngr_daemon::{telemetry, Layout};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// nago runner - keeps this node in sync with the control plane
#[derive(Parser, Debug)]
#[command(name = "nago-runner")]
#[command(version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the control-plane URL and token into the settings file
    Configure {
        /// URL to a nago hub instance
        #[arg(long, default_value = "ws://localhost:3000/api/v1/runner")]
        url: String,

        /// Token authorizing this runner at the hub
        #[arg(long)]
        token: String,
    },

    /// Register and start the agent as a service unit on this host
    Install,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.command {
        Some(Command::Configure { url, token }) => {
            setup::apply_settings(&Settings { url, token }).context("cannot apply settings")
        }
        Some(Command::Install) => {
            let layout = Layout::default();
            setup::install_runner(&layout, &Systemctl).await
        }
        None => run_service().await,
    }
}

async fn run_service() -> anyhow::Result<()> {
    let settings = setup::load_settings().context("cannot load settings")?;
    if settings.url.is_empty() {
        anyhow::bail!("no control plane configured, run `nago-runner configure` first");
    }

    let endpoints = settings.endpoints();
    let layout = Layout::default();
    let svc: Arc<dyn ServiceManager> = Arc::new(Systemctl);

    let bus = Arc::new(WebsocketBus::new(
        endpoints.runner_websocket.clone(),
        settings.token.clone(),
    ));

    let reconciler = Reconciler::new(layout.clone(), settings.clone(), Arc::clone(&svc))?;
    let proxy = ProxyReconciler::new(layout.clone(), Arc::clone(&svc));
    let backup = Arc::new(BackupEngine::new(
        layout.clone(),
        settings.clone(),
        Arc::clone(&svc),
        bus.clone(),
    ));

    let ctx = Arc::new(DispatchContext {
        settings,
        bus: Arc::clone(&bus),
        reconciler,
        proxy,
        backup,
        gate: ReconcileGate::default(),
        http: DispatchContext::configuration_client()?,
    });
    let _subscription = dispatch::register(ctx);

    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                tracing::error!(%err, "failed to register SIGTERM");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(err) => {
                tracing::error!(%err, "failed to register SIGINT");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        signal_cancel.cancel();
    });

    tokio::spawn(telemetry::run_scheduler(
        bus.clone(),
        layout,
        cancel.clone(),
    ));

    info!(url = %endpoints.runner_websocket, "nago runner starting");
    bus.run(cancel).await;
    info!("nago runner stopped");

    Ok(())
}
