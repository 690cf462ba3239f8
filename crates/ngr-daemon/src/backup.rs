//! Backup and restore of instance data.
//!
//! A backup walks the instance's data tree, records every regular file in the
//! blob store (uploading only what the store is missing), and commits one
//! manifest. A restore stops the service, wipes the data directory and
//! rehydrates it from the manifest entries, then starts the service again.
//!
//! Backup and restore against the same instance are serialized through
//! [`InstanceLocks`]; a restore racing a backup has no sane semantics.
//! In-flight runs are deliberately not cancelled on shutdown, aborting a
//! restore could leave a half-rehydrated tree.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::bail;
use ngr_core::events::{
    BackupRequest, DeleteInstanceDataRequested, Event, ProgressUpdated, RestoreRequest,
};
use ngr_core::manifest::Manifest;
use ngr_core::settings::Settings;
use tracing::{error, info, warn};

use crate::blob::BlobClient;
use crate::bus::EventSink;
use crate::layout::Layout;
use crate::sysmgr::ServiceManager;

/// Per-instance async mutexes keyed by instance id.
#[derive(Default)]
pub struct InstanceLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl InstanceLocks {
    /// Acquires the lock of one instance, creating it on first use.
    pub async fn lock(&self, instance_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock().expect("instance lock map poisoned");
            Arc::clone(
                map.entry(instance_id.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };

        mutex.lock_owned().await
    }
}

/// The backup/restore engine.
pub struct BackupEngine {
    layout: Layout,
    settings: Settings,
    svc: Arc<dyn ServiceManager>,
    sink: Arc<dyn EventSink>,
    locks: InstanceLocks,
}

impl BackupEngine {
    /// An engine operating on `layout`, publishing progress into `sink`.
    #[must_use]
    pub fn new(
        layout: Layout,
        settings: Settings,
        svc: Arc<dyn ServiceManager>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            layout,
            settings,
            svc,
            sink,
            locks: InstanceLocks::default(),
        }
    }

    /// Runs one backup request to completion.
    ///
    /// Individual file failures are recorded but do not abort the run; the
    /// manifest is committed with whatever succeeded. The final progress
    /// notification always carries `finished`.
    ///
    /// # Errors
    ///
    /// Returns an aggregated error carrying the first failure when any file
    /// or the commit failed.
    pub async fn do_backup(&self, req: &BackupRequest) -> anyhow::Result<()> {
        let _guard = self.locks.lock(&req.instance_id).await;
        info!(instance = %req.instance_id, req = req.request_id, "starting backup");

        let client = BlobClient::new(self.settings.clone(), &req.instance_id)?;

        let mut manifest = Manifest {
            instance_id: req.instance_id.clone(),
            ..Manifest::default()
        };
        let mut errors: Vec<anyhow::Error> = Vec::new();

        match client
            .backup_file(&self.layout.exec_dir, &req.instance_id)
            .await
        {
            Ok(entry) => manifest.exec = entry,
            Err(err) => {
                error!(file = %req.instance_id, %err, "failed to backup exec file");
                errors.push(err.into());
            }
        }

        let data_dir = self.layout.data_dir(&req.instance_id);
        if !data_dir.exists() {
            warn!(dir = %data_dir.display(), "data dir does not exist");
        }

        let files = match collect_regular_files(&data_dir) {
            Ok(files) => files,
            Err(err) => {
                error!(dir = %data_dir.display(), %err, "failed to walk data dir");
                errors.push(err.into());
                Vec::new()
            }
        };

        let total = files.len();
        for (done, name) in files.iter().enumerate() {
            match client.backup_file(&data_dir, name).await {
                Ok(entry) => manifest.data.push(entry),
                Err(err) => {
                    error!(file = name, %err, "failed to backup file");
                    errors.push(err.into());
                }
            }

            self.progress(&req.progress_id, percent(done + 1, total), false, "")
                .await;
        }

        if let Err(err) = client.commit(&manifest).await {
            error!(%err, "failed to commit backup");
            errors.push(err.into());
        } else {
            info!(instance = %req.instance_id, errors = errors.len(), "backup completed");
        }

        let first = errors.first().map(ToString::to_string).unwrap_or_default();
        self.progress(&req.progress_id, 100, true, &first).await;

        if !errors.is_empty() {
            bail!(
                "errors ({}) occured during backup: {}",
                errors.len(),
                errors[0]
            );
        }

        Ok(())
    }

    /// Runs one restore request to completion.
    ///
    /// The final progress notification always carries `finished`, with the
    /// error text when the restore failed.
    ///
    /// # Errors
    ///
    /// Returns an error when the executable cannot be restored; individual
    /// data files are logged and skipped.
    pub async fn do_restore(&self, req: &RestoreRequest) -> anyhow::Result<()> {
        let _guard = self.locks.lock(&req.instance_id).await;
        info!(instance = %req.instance_id, req = req.request_id, "starting restore");

        let result = self.restore_locked(req).await;

        match &result {
            Ok(()) => self.progress(&req.progress_id, 100, true, "").await,
            Err(err) => {
                self.progress(&req.progress_id, 100, true, &err.to_string())
                    .await;
            }
        }

        result
    }

    async fn restore_locked(&self, req: &RestoreRequest) -> anyhow::Result<()> {
        let client = BlobClient::new(self.settings.clone(), &req.instance_id)?;

        if self.svc.stop(&req.instance_id).await.is_err() {
            warn!(service = %req.instance_id, "failed to stop service, ignoring");
        }

        info!("awaiting service shutdown");
        tokio::time::sleep(self.layout.quiesce_wait).await;

        let data_dir = self.layout.data_dir(&req.instance_id);
        warn!(path = %data_dir.display(), "deleting service data dir by convention");
        delete_dir(&data_dir);

        let total = req.data.len() + usize::from(!req.exec.hash.is_empty());
        let mut done = 0;

        if !req.exec.hash.is_empty() {
            client
                .download_into(&self.layout.exec_dir, &req.exec)
                .await
                .map_err(|err| anyhow::anyhow!("exec restore download failed: {err}"))?;

            info!(file = %req.exec.name, "restored exec binary");
            done += 1;
            self.progress(&req.progress_id, percent(done, total), false, "")
                .await;
        }

        for entry in &req.data {
            if let Err(err) = client.download_into(&data_dir, entry).await {
                error!(file = %entry.name, %err, "failed to restore download data file");
            }

            done += 1;
            self.progress(&req.progress_id, percent(done, total), false, "")
                .await;
        }

        if self.svc.start(&req.instance_id).await.is_err() {
            warn!(service = %req.instance_id, "failed to start service, ignoring");
        }

        Ok(())
    }

    /// Stops the service, wipes its data directory and starts it again.
    ///
    /// # Errors
    ///
    /// This never fails today; deletion problems are logged and the service
    /// is started again regardless.
    pub async fn delete_instance_data(
        &self,
        req: &DeleteInstanceDataRequested,
    ) -> anyhow::Result<()> {
        let _guard = self.locks.lock(&req.unit).await;

        if self.svc.stop(&req.unit).await.is_err() {
            warn!(service = %req.unit, "failed to stop service, ignoring");
        }

        info!("awaiting service shutdown");
        tokio::time::sleep(self.layout.quiesce_wait).await;

        let data_dir = self.layout.data_dir(&req.unit);
        warn!(path = %data_dir.display(), "deleting service data dir by convention");
        delete_dir(&data_dir);

        if self.svc.start(&req.unit).await.is_err() {
            warn!(service = %req.unit, "failed to start service, ignoring");
        }

        Ok(())
    }

    async fn progress(&self, progress_id: &str, percent: u32, finished: bool, error: &str) {
        self.sink
            .publish(Event::ProgressUpdated(ProgressUpdated {
                progress_id: progress_id.to_string(),
                percent,
                finished,
                error: error.to_string(),
            }))
            .await;
    }
}

/// `round(done / total * 100)`, with an empty tree mapping straight to 100.
#[must_use]
pub fn percent(done: usize, total: usize) -> u32 {
    if total == 0 {
        return 100;
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let pct = ((done as f64) / (total as f64) * 100.0).round() as u32;
    pct
}

/// Deletes a data directory, dereferencing a possible symlink once.
///
/// If `path` is a symlink, the resolved target is deleted as well as the link
/// itself. Symlinks are never recursed into. All failures are logged, none
/// are fatal; the wipe is best effort by contract.
pub fn delete_dir(path: &Path) {
    if let Ok(resolved) = fs::read_link(path) {
        let resolved = if resolved.is_absolute() {
            resolved
        } else {
            path.parent().unwrap_or(Path::new("/")).join(resolved)
        };

        info!(path = %path.display(), resolved = %resolved.display(), "resolved data sym link");
        remove_all(&resolved);
    }

    remove_all(path);
}

fn remove_all(path: &Path) {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return,
        Err(err) => {
            error!(path = %path.display(), %err, "failed to inspect service data dir");
            return;
        }
    };

    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Ok(()) => info!(path = %path.display(), "service data dir deleted"),
        Err(err) => error!(path = %path.display(), %err, "failed to delete service data dir"),
    }
}

/// All regular files below `root` as sorted tree-relative names.
///
/// Directories are descended into, symlinks and other non-regular files are
/// skipped. A missing root yields an empty list.
pub fn collect_regular_files(root: &Path) -> io::Result<Vec<String>> {
    let mut files = Vec::new();
    if root.exists() {
        walk(root, "", &mut files)?;
    }
    files.sort();
    Ok(files)
}

fn walk(dir: &Path, prefix: &str, files: &mut Vec<String>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };

        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(&entry.path(), &rel, files)?;
        } else if file_type.is_file() {
            files.push(rel);
        }
        // symlinks and special files are skipped on purpose
    }

    Ok(())
}
