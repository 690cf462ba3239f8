//! Executable convergence.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context as _};
use futures::StreamExt;
use ngr_core::config::Application;
use ngr_core::hashio;
use ngr_core::unit::Service;
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::Reconciler;

impl Reconciler {
    /// Brings the instance executable in line with the declared artifact.
    ///
    /// If the hash of the current file already matches, nothing happens.
    /// Otherwise the artifact is streamed to `<exec>.tmp`, its size and hash
    /// are verified, and only then is it renamed into place and marked
    /// executable. On an integrity mismatch the temp file stays behind and
    /// nothing is promoted.
    pub(crate) async fn update_executable(&self, app: &Application) -> anyhow::Result<bool> {
        let service = Service::new(&self.layout.unit_dir, &app.inst_id);
        let paths = service.paths_in(&self.layout.exec_dir, &self.layout.state_root);

        let current = hashio::sha3_file(&paths.exec_filename)
            .with_context(|| format!("error hashing executable: {}", paths.exec_filename.display()))?;
        if current == app.executable.hash {
            info!(expected = %current, "executable is unchanged");
            return Ok(false);
        }

        info!(expected = %app.executable.hash, got = %current, "executable hash is different");

        let url = if app.executable.url.starts_with("http") {
            app.executable.url.clone()
        } else {
            self.settings.endpoints().http(&app.executable.url)
        };

        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.settings.token)
            .send()
            .await
            .with_context(|| format!("error executing http request for executable: {url}"))?;
        if resp.status() != reqwest::StatusCode::OK {
            bail!(
                "unexpected http response when downloading executable: {}: {url}",
                resp.status()
            );
        }

        if let Some(parent) = paths.exec_filename.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }

        let tmp = tmp_path(&paths.exec_filename);
        let mut open = tokio::fs::OpenOptions::new();
        open.create(true).write(true).truncate(true);
        #[cfg(unix)]
        open.mode(0o600);
        let mut file = open
            .open(&tmp)
            .await
            .with_context(|| format!("error opening tmp file: {}", tmp.display()))?;

        let download_start = Instant::now();
        let mut written: u64 = 0;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("error downloading executable: {url}"))?;
            written += chunk.len() as u64;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("error writing tmp file: {}", tmp.display()))?;
        }

        file.flush()
            .await
            .with_context(|| format!("error committing tmp file: {}", tmp.display()))?;
        drop(file);

        info!(size = written, took = ?download_start.elapsed(), "downloaded executable");

        // integrity guards; the tmp file is left behind for inspection
        if written != app.executable.size {
            bail!(
                "executable size mismatch: got {written}, want {}",
                app.executable.size
            );
        }

        let downloaded = hashio::sha3_file(&tmp)
            .with_context(|| format!("error hashing downloaded executable: {}", tmp.display()))?;
        if downloaded != app.executable.hash {
            bail!(
                "executable hash mismatch for download: got {downloaded}, want {}",
                app.executable.hash
            );
        }

        fs::rename(&tmp, &paths.exec_filename)
            .with_context(|| format!("error renaming executable: {}", tmp.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&paths.exec_filename, fs::Permissions::from_mode(0o755))
                .context("cannot set executable bit")?;
        }

        Ok(true)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    os.into()
}
