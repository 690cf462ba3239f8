//! Settings persistence and the install bootstrap.
//!
//! Settings live at `/etc/nago-runner/config.json` with mode 0600. On
//! non-Linux development hosts they live under `~/.nago-runner/config.json`
//! instead. A missing file is not an error; it simply yields empty settings.

use std::fs;
use std::path::PathBuf;

use anyhow::Context as _;
use ngr_core::hashio;
use ngr_core::settings::Settings;
use tracing::info;

use crate::layout::Layout;
use crate::sysmgr::ServiceManager;

/// Unit name and user the agent itself runs under.
const RUNNER_SERVICE_NAME: &str = "nago-runner";

/// Where the install bootstrap expects the agent binary.
const RUNNER_BIN: &str = "/usr/local/bin/nago-runner";

/// The settings file location for this host.
#[must_use]
pub fn settings_path() -> PathBuf {
    if cfg!(target_os = "linux") {
        PathBuf::from("/etc/nago-runner/config.json")
    } else {
        // development convenience on non-linux hosts
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".nago-runner/config.json")
    }
}

/// Loads the settings, yielding defaults when the file does not exist.
///
/// # Errors
///
/// Returns read and parse failures for an existing file.
pub fn load_settings() -> anyhow::Result<Settings> {
    let path = settings_path();
    if !path.exists() {
        return Ok(Settings::default());
    }

    let buf = fs::read(&path)
        .with_context(|| format!("cannot read config file: {}", path.display()))?;
    let settings = serde_json::from_slice(&buf)
        .with_context(|| format!("cannot parse config file: {}", path.display()))?;

    Ok(settings)
}

/// Persists the settings, atomically, with mode 0600.
///
/// # Errors
///
/// Returns the underlying write failure.
pub fn apply_settings(settings: &Settings) -> anyhow::Result<()> {
    hashio::write_json(settings_path(), settings, 0o600).context("could not write settings")
}

/// Installs the agent itself as a service unit and starts it.
///
/// This is a thin bootstrap: it expects the binary at
/// `/usr/local/bin/nago-runner` and a `nago-runner` system user to exist
/// already; package installation and user creation are host provisioning,
/// not agent business.
///
/// # Errors
///
/// Returns write failures and service-manager failures.
pub async fn install_runner(layout: &Layout, svc: &dyn ServiceManager) -> anyhow::Result<()> {
    let unit = format!(
        "[Unit]\n\
         Description=nago runner service\n\
         After=network.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         User={RUNNER_SERVICE_NAME}\n\
         ExecStart={RUNNER_BIN}\n\
         Restart=always\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n"
    );

    let unit_path = layout
        .unit_dir
        .join(format!("{RUNNER_SERVICE_NAME}.service"));
    hashio::write_file(&unit_path, unit.as_bytes(), 0o644)
        .with_context(|| format!("failed to apply service file: {}", unit_path.display()))?;

    svc.daemon_reload()
        .await
        .context("failed to reload systemd")?;
    svc.enable(RUNNER_SERVICE_NAME)
        .await
        .context("failed to enable service")?;
    svc.start(RUNNER_SERVICE_NAME)
        .await
        .context("cannot start nago-runner service")?;

    info!(service = RUNNER_SERVICE_NAME, "runner installed and started");
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::sysmgr::testing::Recording;

    #[tokio::test]
    async fn install_writes_an_unmanaged_unit_and_starts_it() {
        let dir = TempDir::new().unwrap();
        let layout = Layout {
            unit_dir: dir.path().to_path_buf(),
            ..Layout::default()
        };
        let svc = Recording::default();

        install_runner(&layout, &svc).await.unwrap();

        let text = fs::read_to_string(dir.path().join("nago-runner.service")).unwrap();
        assert!(text.starts_with("[Unit]"), "the agent's own unit must stay unmanaged");
        assert!(text.contains("ExecStart=/usr/local/bin/nago-runner"));

        assert_eq!(
            svc.calls(),
            vec![
                "daemon-reload",
                "enable nago-runner",
                "start nago-runner"
            ]
        );
    }
}
