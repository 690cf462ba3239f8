//! Inbound event dispatch.
//!
//! One subscriber registered at startup routes every inbound event to its
//! handler and publishes the response. Handlers run inline on the subscriber
//! task, except backup and restore which are accepted immediately and then
//! executed on a detached task; their progress streams follow asynchronously.
//!
//! Configuration changes are coalesced through [`ReconcileGate`]: only one
//! reconcile pass runs at a time, a second request arriving meanwhile is
//! remembered (once) and the pass reruns at the end.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use ngr_core::config::Runner;
use ngr_core::events::{Event, JournalCtlLogResponse, ReadDirResponse, Response, RunnerLaunched};
use ngr_core::settings::Settings;
use tracing::{error, info};

use crate::backup::BackupEngine;
use crate::bus::{Subscription, WebsocketBus};
use crate::journal;
use crate::proxy::ProxyReconciler;
use crate::reconcile::Reconciler;
use crate::remote_fs;

/// Timeout for the configuration fetch.
const CONFIGURATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Single-slot coalescing for reconcile passes.
///
/// The reconciler is not reentrant. While a pass runs, further requests
/// collapse into one pending flag; the running pass picks it up and reruns
/// once at the end.
#[derive(Debug, Default)]
pub struct ReconcileGate {
    state: Mutex<GateState>,
}

#[derive(Debug, Default)]
struct GateState {
    running: bool,
    pending: bool,
}

impl ReconcileGate {
    /// Tries to become the running pass. On `false` the request was queued
    /// into the pending slot instead.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("gate poisoned");
        if state.running {
            state.pending = true;
            false
        } else {
            state.running = true;
            true
        }
    }

    /// Finishes the running pass. Returns `true` when a request was queued
    /// meanwhile; the caller stays the running pass and must run again.
    pub fn release(&self) -> bool {
        let mut state = self.state.lock().expect("gate poisoned");
        if state.pending {
            state.pending = false;
            true
        } else {
            state.running = false;
            false
        }
    }
}

/// Everything the handlers need.
pub struct DispatchContext {
    /// Agent settings.
    pub settings: Settings,
    /// The bus used for outbound events.
    pub bus: Arc<WebsocketBus>,
    /// The service reconciler.
    pub reconciler: Reconciler,
    /// The reverse-proxy reconciler.
    pub proxy: ProxyReconciler,
    /// The backup/restore engine.
    pub backup: Arc<BackupEngine>,
    /// Coalescing for configuration changes.
    pub gate: ReconcileGate,
    /// Client for the configuration fetch.
    pub http: reqwest::Client,
}

impl DispatchContext {
    /// Builds the HTTP client for configuration fetches.
    ///
    /// # Errors
    ///
    /// Returns the builder error of the underlying client.
    pub fn configuration_client() -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .timeout(CONFIGURATION_TIMEOUT)
            .build()
    }

    /// Pulls the current desired runner configuration.
    ///
    /// # Errors
    ///
    /// Returns transport failures, non-200 statuses and decode failures.
    pub async fn query_configuration(&self) -> anyhow::Result<Runner> {
        let url = self.settings.endpoints().runner_configuration;

        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.settings.token)
            .send()
            .await
            .context("cannot query runner configuration")?;
        if resp.status() != reqwest::StatusCode::OK {
            anyhow::bail!("unexpected http status {} for {url}", resp.status());
        }

        resp.json().await.context("cannot decode runner configuration")
    }
}

/// Registers the dispatcher as a bus subscriber.
pub fn register(ctx: Arc<DispatchContext>) -> Subscription {
    let bus = Arc::clone(&ctx.bus);
    bus.subscribe(Arc::new(move |event| {
        let ctx = Arc::clone(&ctx);
        Box::pin(async move {
            dispatch(ctx, event).await;
        })
    }))
}

async fn dispatch(ctx: Arc<DispatchContext>, event: Event) {
    match event {
        Event::ConnectionCreated(_) => {
            let hostname = hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default();
            ctx.bus
                .publish(&Event::RunnerLaunched(RunnerLaunched { hostname }))
                .await;
        }

        Event::RunnerConfigurationChanged(evt) => {
            info!(runner = %evt.runner_id, "runner configuration changed");
            configuration_changed(&ctx).await;
        }

        Event::JournalCtlLogRequest(req) => {
            info!(id = req.request_id, unit = %req.unit, "requested log");
            let entries = match journal::collect_logs(&req).await {
                Ok(entries) => entries,
                Err(err) => {
                    error!(%err, "error collecting logs");
                    Vec::new()
                }
            };

            ctx.bus
                .publish(&Event::JournalCtlLogResponse(JournalCtlLogResponse {
                    request_id: req.request_id,
                    entries,
                }))
                .await;
        }

        Event::DeleteInstanceDataRequested(req) => {
            let result = ctx.backup.delete_instance_data(&req).await;
            if let Err(err) = &result {
                error!(%err, "error deleting instance data");
            }
            ctx.bus
                .publish(&Event::Response(response(req.request_id, result)))
                .await;
        }

        Event::WriteFileRequested(req) => {
            let result = remote_fs::write_file(&req);
            if let Err(err) = &result {
                error!(%err, "error writing file");
            }
            ctx.bus
                .publish(&Event::Response(response(req.request_id, result)))
                .await;
        }

        Event::DeleteFileRequested(req) => {
            let result = remote_fs::delete_file(&req);
            if let Err(err) = &result {
                error!(%err, "error deleting file");
            }
            ctx.bus
                .publish(&Event::Response(response(req.request_id, result)))
                .await;
        }

        Event::ReadFileRequested(req) => match remote_fs::read_file(&req) {
            Ok(resp) => ctx.bus.publish(&Event::ReadFileResponse(resp)).await,
            Err(err) => error!(%err, "error reading file"),
        },

        Event::ReadDirRequested(req) => {
            let resp = match remote_fs::read_dir(&req) {
                Ok(resp) => resp,
                Err(err) => {
                    error!(%err, "error reading dir");
                    ReadDirResponse {
                        request_id: req.request_id,
                        path: req.path,
                        files: Vec::new(),
                    }
                }
            };
            ctx.bus.publish(&Event::ReadDirResponse(resp)).await;
        }

        Event::ExecRequest(req) => {
            let resp = remote_fs::exec(&req).await;
            if !resp.error.is_empty() {
                error!(error = %resp.error, "error exec");
            }
            // always respond
            ctx.bus.publish(&Event::ExecResponse(resp)).await;
        }

        Event::BackupRequest(req) => {
            // accept immediately, run detached; progress follows on the bus
            ctx.bus
                .publish(&Event::Response(response(req.request_id, Ok(()))))
                .await;

            let backup = Arc::clone(&ctx.backup);
            tokio::spawn(async move {
                if let Err(err) = backup.do_backup(&req).await {
                    error!(%err, "error performing async backup");
                }
            });
        }

        Event::RestoreRequest(req) => {
            ctx.bus
                .publish(&Event::Response(response(req.request_id, Ok(()))))
                .await;

            let backup = Arc::clone(&ctx.backup);
            tokio::spawn(async move {
                if let Err(err) = backup.do_restore(&req).await {
                    error!(%err, "error performing async restore");
                }
            });
        }

        // outbound-only variants never arrive here
        _ => {}
    }
}

/// One coalesced configuration-changed round.
async fn configuration_changed(ctx: &DispatchContext) {
    if !ctx.gate.try_acquire() {
        info!("reconcile pass already running, request queued");
        return;
    }

    loop {
        reconcile_once(ctx).await;

        if !ctx.gate.release() {
            break;
        }
        info!("rerunning reconcile for a coalesced request");
    }
}

async fn reconcile_once(ctx: &DispatchContext) {
    let cfg = match ctx.query_configuration().await {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(err = format!("{err:#}"), "cannot load configuration");
            return;
        }
    };

    if let Err(err) = ctx.proxy.apply(&cfg).await {
        error!(err = format!("{err:#}"), "cannot apply caddy configuration");
    }

    if let Err(err) = ctx.reconciler.apply(&cfg).await {
        error!(%err, "cannot apply systemd configuration");
    }
}

fn response(request_id: i64, result: anyhow::Result<()>) -> Response {
    Response {
        request_id,
        error: result.err().map(|err| format!("{err:#}")).unwrap_or_default(),
    }
}
