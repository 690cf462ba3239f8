//! Shared fixtures: an in-process control-plane stub and recording doubles.

// not every test binary uses every fixture
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use ngr_core::events::Event;
use ngr_core::hashio;
use ngr_core::manifest::Manifest;
use ngr_core::settings::Settings;
use ngr_daemon::bus::EventSink;
use ngr_daemon::runcmd::CommandError;
use ngr_daemon::sysmgr::ServiceManager;
use ngr_daemon::Layout;
use tempfile::TempDir;

/// In-memory control plane: blob store, committed manifests, binaries.
#[derive(Default)]
pub struct ControlPlane {
    pub blobs: Mutex<HashMap<String, Vec<u8>>>,
    pub uploads: AtomicUsize,
    pub commits: Mutex<Vec<Manifest>>,
    pub binaries: Mutex<HashMap<String, Vec<u8>>>,
}

impl ControlPlane {
    pub fn seed_blob(&self, content: &[u8]) {
        let hash = hashio::sha3_bytes(content);
        self.blobs
            .lock()
            .unwrap()
            .insert(hash.as_str().to_string(), content.to_vec());
    }

    pub fn seed_binary(&self, name: &str, content: &[u8]) {
        self.binaries
            .lock()
            .unwrap()
            .insert(name.to_string(), content.to_vec());
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn committed(&self) -> Vec<Manifest> {
        self.commits.lock().unwrap().clone()
    }
}

async fn blob_exists(
    State(state): State<Arc<ControlPlane>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let hash = params.get("hash").cloned().unwrap_or_default();
    let exists = state.blobs.lock().unwrap().contains_key(&hash);
    Json(serde_json::json!({ "exists": exists }))
}

async fn blob_upload(
    State(state): State<Arc<ControlPlane>>,
    body: Bytes,
) -> Json<serde_json::Value> {
    state.uploads.fetch_add(1, Ordering::SeqCst);
    let hash = hashio::sha3_bytes(&body);
    let size = body.len();
    state
        .blobs
        .lock()
        .unwrap()
        .insert(hash.as_str().to_string(), body.to_vec());
    Json(serde_json::json!({ "Size": size, "Hash": hash.as_str() }))
}

async fn blob_download(
    State(state): State<Arc<ControlPlane>>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Vec<u8>) {
    let hash = params.get("hash").cloned().unwrap_or_default();
    match state.blobs.lock().unwrap().get(&hash) {
        Some(content) => (StatusCode::OK, content.clone()),
        None => (StatusCode::NOT_FOUND, Vec::new()),
    }
}

async fn backup_create(
    State(state): State<Arc<ControlPlane>>,
    Json(manifest): Json<Manifest>,
) -> StatusCode {
    state.commits.lock().unwrap().push(manifest);
    StatusCode::OK
}

async fn binary(
    State(state): State<Arc<ControlPlane>>,
    UrlPath(name): UrlPath<String>,
) -> (StatusCode, Vec<u8>) {
    match state.binaries.lock().unwrap().get(&name) {
        Some(content) => (StatusCode::OK, content.clone()),
        None => (StatusCode::NOT_FOUND, Vec::new()),
    }
}

/// Serves the control-plane stub on an ephemeral port and returns settings
/// pointing at it.
pub async fn start_control_plane(state: Arc<ControlPlane>) -> Settings {
    let app = Router::new()
        .route("/api/v1/backup/blob/exists", get(blob_exists))
        .route("/api/v1/backup/blob/upload", post(blob_upload))
        .route("/api/v1/backup/blob/download", get(blob_download))
        .route("/api/v1/backup/create", post(backup_create))
        .route("/api/v1/bin/:name", get(binary))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Settings {
        url: format!("ws://{addr}"),
        token: "test-token".into(),
    }
}

/// A layout rooted in a temp directory, with a fast quiesce wait.
pub fn temp_layout(dir: &TempDir) -> Layout {
    let layout = Layout {
        unit_dir: dir.path().join("units"),
        exec_dir: dir.path().join("opt"),
        state_root: dir.path().join("var-lib"),
        caddyfile: dir.path().join("Caddyfile"),
        quiesce_wait: Duration::from_millis(1),
    };
    std::fs::create_dir_all(&layout.unit_dir).unwrap();
    layout
}

/// Records published events.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

/// Records service-manager verbs as `"<verb> <unit>"`.
#[derive(Default)]
pub struct RecordingManager {
    calls: Mutex<Vec<String>>,
}

impl RecordingManager {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, entry: String) {
        self.calls.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl ServiceManager for RecordingManager {
    async fn daemon_reload(&self) -> Result<(), CommandError> {
        self.record("daemon-reload".into());
        Ok(())
    }

    async fn enable(&self, unit: &str) -> Result<(), CommandError> {
        self.record(format!("enable {unit}"));
        Ok(())
    }

    async fn restart(&self, unit: &str) -> Result<(), CommandError> {
        self.record(format!("restart {unit}"));
        Ok(())
    }

    async fn start(&self, unit: &str) -> Result<(), CommandError> {
        self.record(format!("start {unit}"));
        Ok(())
    }

    async fn stop(&self, unit: &str) -> Result<(), CommandError> {
        self.record(format!("stop {unit}"));
        Ok(())
    }

    async fn reload(&self, unit: &str) -> Result<(), CommandError> {
        self.record(format!("reload {unit}"));
        Ok(())
    }
}
