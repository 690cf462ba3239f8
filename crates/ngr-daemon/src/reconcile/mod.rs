//! The declare → diff → converge loop.
//!
//! [`Reconciler::apply`] turns a desired [`Runner`] into concrete state:
//!
//! 1. **Discover** every `.service` file in the unit directory.
//! 2. **Categorize**: unmanaged files are invisible, managed files without a
//!    matching application are marked for removal.
//! 3. **Purge** the marked services (stop, remove executable, data and unit
//!    file), followed by a single daemon reload.
//! 4. **Converge** each declared application: executable and unit file.
//! 5. **Post-reload** once for all changed services, then enable + restart
//!    each of them.
//!
//! The pass is idempotent: applying the same configuration twice leaves the
//! filesystem untouched and issues no service-manager commands on the second
//! run. Per-application failures are contained; one broken application never
//! stops the others from converging.

mod executable;
mod unit_file;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use ngr_core::config::{Application, Runner};
use ngr_core::settings::Settings;
use ngr_core::unit::{self, Service, UnitError, SERVICE_SUFFIX};
use tracing::{debug, error, info, warn};

use crate::layout::Layout;
use crate::runcmd::CommandError;
use crate::sysmgr::ServiceManager;

/// Timeout for executable downloads.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors aborting or degrading a reconcile pass.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The unit directory could not be inspected.
    #[error("cannot categorize services: {0}")]
    Categorize(#[from] UnitError),

    /// A stale service could not be removed.
    #[error("cannot purge {path}: {source}")]
    Purge {
        /// What failed to be removed.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },

    /// The batched daemon reload failed.
    #[error("error reloading service manager daemon: {0}")]
    Reload(#[from] CommandError),

    /// The HTTP client could not be constructed.
    #[error("cannot build download client: {0}")]
    Client(#[from] reqwest::Error),

    /// Some applications failed to converge; the others were still applied.
    #[error("{failed} application(s) failed to converge, first error: {first}")]
    Converge {
        /// How many applications failed.
        failed: usize,
        /// The first failure, verbatim.
        first: String,
    },
}

/// The service reconciler.
pub struct Reconciler {
    layout: Layout,
    settings: Settings,
    svc: Arc<dyn ServiceManager>,
    http: reqwest::Client,
}

impl Reconciler {
    /// A reconciler operating on `layout` with the given service manager.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Client`] when the download client cannot be
    /// built.
    pub fn new(
        layout: Layout,
        settings: Settings,
        svc: Arc<dyn ServiceManager>,
    ) -> Result<Self, ReconcileError> {
        let http = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()?;

        Ok(Self {
            layout,
            settings,
            svc,
            http,
        })
    }

    /// Runs one full reconcile pass against the desired configuration.
    ///
    /// # Errors
    ///
    /// Hard errors (discovery, purge, daemon reload) abort the pass.
    /// Per-application converge failures are logged, skipped and reported
    /// aggregated as [`ReconcileError::Converge`] after every other
    /// application was still applied.
    pub async fn apply(&self, desired: &Runner) -> Result<(), ReconcileError> {
        let (keep, remove) = self.categorize(desired)?;
        self.purge(remove).await?;

        for service in &keep {
            info!(name = %service.name(), "apply service");
        }

        let mut requires_restart = Vec::new();
        let mut failed = 0_usize;
        let mut first_error = None;

        for app in &desired.applications {
            match self.converge(app).await {
                Ok((service, true)) => requires_restart.push(service),
                Ok((service, false)) => {
                    info!(service = %service.name(), "service is unchanged");
                }
                Err(err) => {
                    error!(app = %app.inst_id, err = format!("{err:#}"),
                           "cannot create or update service");
                    failed += 1;
                    first_error.get_or_insert(format!("{err:#}"));
                }
            }
        }

        // one reload for the whole batch instead of one per service
        if !requires_restart.is_empty() {
            self.svc.daemon_reload().await?;

            for service in &requires_restart {
                let name = service.name();

                info!(service = %name, "enable service");
                if self.svc.enable(&name).await.is_err() {
                    warn!(service = %name, "failed to enable service, ignoring");
                }

                info!(service = %name, "restart service");
                if self.svc.restart(&name).await.is_err() {
                    warn!(service = %name, "failed to restart service, ignoring");
                }
            }
        }

        if failed > 0 {
            return Err(ReconcileError::Converge {
                failed,
                first: first_error.unwrap_or_default(),
            });
        }

        Ok(())
    }

    /// Splits the discovered managed services into keep and remove sets.
    fn categorize(&self, desired: &Runner) -> Result<(Vec<Service>, Vec<Service>), UnitError> {
        let all = unit::find_services(&self.layout.unit_dir)?;

        let mut keep = Vec::new();
        let mut remove = Vec::new();
        for service in all {
            if !service.managed {
                debug!(service = %service.name(), "ignoring service");
                continue;
            }

            let name = service.name();
            let still_available = desired
                .applications
                .iter()
                .any(|app| app.inst_id.eq_ignore_ascii_case(&name));

            if still_available {
                keep.push(service);
            } else {
                remove.push(service);
            }
        }

        Ok((keep, remove))
    }

    /// Stops and deletes stale managed services, then reloads the daemon
    /// once if anything was deleted.
    async fn purge(&self, to_remove: Vec<Service>) -> Result<(), ReconcileError> {
        let mut deleted = 0_usize;

        for service in to_remove {
            let name = service.name();
            warn!(service = %name, "removing undeclared managed service");

            info!(service = %name, "stopping service");
            if self.svc.stop(&name).await.is_err() {
                warn!(service = %name, "failed to stop service, ignoring");
            }

            let paths = service.paths_in(&self.layout.exec_dir, &self.layout.state_root);

            info!(file = %paths.exec_filename.display(), "removing exec");
            remove_path(&paths.exec_filename)?;

            info!(file = %paths.data_directory.display(), "removing data");
            remove_path(&paths.data_directory)?;

            info!(file = %service.unit_filename.display(), "removing service");
            remove_path(&service.unit_filename)?;

            deleted += 1;
        }

        if deleted > 0 {
            warn!(count = deleted, "removed unwanted or stale services");
            self.svc.daemon_reload().await?;
        }

        Ok(())
    }

    /// Converges one application. The returned flag says whether anything on
    /// disk changed and the service needs an enable + restart.
    async fn converge(&self, app: &Application) -> anyhow::Result<(Service, bool)> {
        app.validate()?;

        let exec_updated = self
            .update_executable(app)
            .await
            .context("failed to update executable")?;
        let unit_updated = self
            .update_unit(app)
            .context("failed to update systemd unit")?;

        let unit_path = self
            .layout
            .unit_dir
            .join(format!("{}{SERVICE_SUFFIX}", app.inst_id));
        let service = Service::parse(&unit_path)
            .with_context(|| format!("cannot parse systemd conf file: {}", app.inst_id))?;

        Ok((service, exec_updated || unit_updated))
    }
}

fn remove_path(path: &Path) -> Result<(), ReconcileError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(ReconcileError::Purge {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    result.map_err(|source| ReconcileError::Purge {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use ngr_core::config::Executable;
    use ngr_core::hashio;
    use tempfile::TempDir;

    use super::*;
    use crate::sysmgr::testing::Recording;

    struct Fixture {
        _dir: TempDir,
        layout: Layout,
        svc: Arc<Recording>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let layout = Layout {
            unit_dir: dir.path().join("units"),
            exec_dir: dir.path().join("opt"),
            state_root: dir.path().join("var-lib"),
            caddyfile: dir.path().join("Caddyfile"),
            quiesce_wait: Duration::from_millis(1),
        };
        fs::create_dir_all(&layout.unit_dir).unwrap();

        let svc = Arc::new(Recording::default());
        let settings = Settings {
            url: "ws://localhost:1".into(),
            token: "t".into(),
        };
        let reconciler = Reconciler::new(
            layout.clone(),
            settings,
            Arc::clone(&svc) as Arc<dyn ServiceManager>,
        )
        .unwrap();

        Fixture {
            _dir: dir,
            layout,
            svc,
            reconciler,
        }
    }

    /// An application whose executable is already in place, so converge
    /// never needs the network.
    fn app_with_local_exec(fx: &Fixture, inst_id: &str, content: &[u8]) -> Application {
        hashio::write_file(fx.layout.exec_file(inst_id), content, 0o755).unwrap();

        Application {
            app_id: format!("app-{inst_id}"),
            inst_id: inst_id.into(),
            executable: Executable {
                url: "api/v1/bin/unused".into(),
                size: content.len() as u64,
                hash: hashio::sha3_bytes(content),
            },
            ..Application::default()
        }
    }

    #[tokio::test]
    async fn empty_to_one_creates_unit_and_batches_reload() {
        let fx = fixture();
        let app = app_with_local_exec(&fx, "svc-a", b"binary");
        let desired = Runner {
            applications: vec![app],
        };

        fx.reconciler.apply(&desired).await.unwrap();

        let unit_path = fx.layout.unit_dir.join("svc-a.service");
        let parsed = Service::parse(&unit_path).unwrap();
        assert!(parsed.managed);

        assert_eq!(
            fx.svc.calls(),
            vec!["daemon-reload", "enable svc-a", "restart svc-a"]
        );
    }

    #[tokio::test]
    async fn second_apply_is_a_noop() {
        let fx = fixture();
        let desired = Runner {
            applications: vec![app_with_local_exec(&fx, "svc-a", b"binary")],
        };

        fx.reconciler.apply(&desired).await.unwrap();
        let unit_path = fx.layout.unit_dir.join("svc-a.service");
        let first_bytes = fs::read(&unit_path).unwrap();
        let calls_after_first = fx.svc.calls().len();

        fx.reconciler.apply(&desired).await.unwrap();

        assert_eq!(fs::read(&unit_path).unwrap(), first_bytes);
        assert_eq!(
            fx.svc.calls().len(),
            calls_after_first,
            "no service-manager commands on a no-op pass"
        );
    }

    #[tokio::test]
    async fn removal_purges_exec_data_and_unit() {
        let fx = fixture();
        let desired = Runner {
            applications: vec![app_with_local_exec(&fx, "svc-a", b"binary")],
        };
        fx.reconciler.apply(&desired).await.unwrap();

        let data_dir = fx.layout.data_dir("svc-a");
        fs::create_dir_all(&data_dir).unwrap();
        fs::write(data_dir.join("state.db"), b"d").unwrap();

        fx.reconciler
            .apply(&Runner {
                applications: vec![],
            })
            .await
            .unwrap();

        assert!(!fx.layout.exec_file("svc-a").exists());
        assert!(!data_dir.exists());
        assert!(!fx.layout.unit_dir.join("svc-a.service").exists());
        assert_eq!(fx.svc.count("stop svc-a"), 1);
        assert_eq!(fx.svc.count("daemon-reload"), 2); // once per pass
    }

    #[tokio::test]
    async fn unmanaged_units_are_untouched() {
        let fx = fixture();
        let foreign = fx.layout.unit_dir.join("foo.service");
        let original = "[Unit]\nDescription=hand written\n";
        fs::write(&foreign, original).unwrap();

        fx.reconciler
            .apply(&Runner {
                applications: vec![],
            })
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(&foreign).unwrap(), original);
        assert!(fx.svc.calls().is_empty());
    }

    #[tokio::test]
    async fn invalid_instance_ids_are_contained() {
        let fx = fixture();
        let good = app_with_local_exec(&fx, "svc-ok", b"fine");
        let bad = Application {
            inst_id: "not/a/name".into(),
            ..Application::default()
        };

        let err = fx
            .reconciler
            .apply(&Runner {
                applications: vec![bad, good],
            })
            .await
            .unwrap_err();

        match err {
            ReconcileError::Converge { failed, .. } => assert_eq!(failed, 1),
            other => panic!("unexpected error: {other}"),
        }

        // the healthy application still converged
        assert!(fx.layout.unit_dir.join("svc-ok.service").exists());
        assert_eq!(fx.svc.count("restart svc-ok"), 1);
    }
}
