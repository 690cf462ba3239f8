//! Content-addressed blob store client.
//!
//! Four operations against the control plane's backup API: existence check,
//! raw upload, raw download and manifest commit. Uploads are deduplicated by
//! hash before any byte leaves the host. The hash the server reports back for
//! an upload is canonical; a mismatch with the locally computed hash means
//! the file changed in transit and is logged as a warning.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use ngr_core::config::Sha3V512;
use ngr_core::hashio;
use ngr_core::manifest::{FileEntry, Manifest};
use ngr_core::settings::Settings;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Timeout for blob uploads and downloads.
const BLOB_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Errors of the blob API.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// Transport-level HTTP failure.
    #[error("blob request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-200 status.
    #[error("unexpected http status {status} for {url}")]
    Status {
        /// The request that failed.
        url: String,
        /// The status the server answered with.
        status: reqwest::StatusCode,
    },

    /// Local file I/O failed.
    #[error("blob io error for {path}: {source}")]
    Io {
        /// The local file involved.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },
}

/// What the server stored for an uploaded blob.
#[derive(Debug, Clone, Deserialize)]
pub struct FileStoreResult {
    /// Stored size in bytes.
    #[serde(rename = "Size")]
    pub size: u64,

    /// Server-computed content hash; canonical.
    #[serde(rename = "Hash")]
    pub hash: Sha3V512,
}

/// Client for one instance's backup traffic.
pub struct BlobClient {
    http: reqwest::Client,
    settings: Settings,
    instance_id: String,
}

impl BlobClient {
    /// A client scoped to `instance_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`BlobError::Http`] when the underlying HTTP client cannot
    /// be constructed.
    pub fn new(settings: Settings, instance_id: impl Into<String>) -> Result<Self, BlobError> {
        let http = reqwest::Client::builder().timeout(BLOB_TIMEOUT).build()?;
        Ok(Self {
            http,
            settings,
            instance_id: instance_id.into(),
        })
    }

    /// Whether the store already holds a blob with this hash.
    ///
    /// # Errors
    ///
    /// Returns transport failures and non-200 statuses.
    pub async fn has_blob(&self, hash: &Sha3V512) -> Result<bool, BlobError> {
        #[derive(Deserialize)]
        struct Exists {
            exists: bool,
        }

        let url = self
            .settings
            .endpoints()
            .http(&format!("api/v1/backup/blob/exists?hash={hash}"));

        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.settings.token)
            .send()
            .await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(BlobError::Status {
                url,
                status: resp.status(),
            });
        }

        let body: Exists = resp.json().await?;
        Ok(body.exists)
    }

    /// Records one regular file in the store, uploading only when the blob is
    /// missing, and returns its manifest entry.
    ///
    /// `name` is the tree-relative name below `root`.
    ///
    /// # Errors
    ///
    /// Returns local I/O failures and blob API failures; the caller decides
    /// whether a single file aborts the whole backup (it should not).
    pub async fn backup_file(&self, root: &Path, name: &str) -> Result<FileEntry, BlobError> {
        info!(filename = name, instance = %self.instance_id, "backup file");

        let full = root.join(name);
        let meta = fs::metadata(&full).map_err(|source| BlobError::Io {
            path: full.clone(),
            source,
        })?;
        let hash = hashio::sha3_file(&full).map_err(|source| BlobError::Io {
            path: full.clone(),
            source,
        })?;

        if self.has_blob(&hash).await? {
            info!(filename = name, %hash, instance = %self.instance_id,
                  "backup file already exists at remote");

            return Ok(FileEntry {
                hash,
                size: meta.len(),
                last_modified: modified_time(&meta),
                uploaded_at: Utc::now(),
                mode: file_mode(&meta),
                name: name.to_string(),
            });
        }

        let stored = self.upload(&full).await?;
        if stored.hash != hash {
            warn!(file = name, local = %hash, server = %stored.hash,
                  "backup file changed while in transit");
        }

        info!(filename = name, hash = %stored.hash, instance = %self.instance_id,
              "backup file successfully uploaded");

        // the manifest records what the server actually stored
        Ok(FileEntry {
            hash: stored.hash,
            size: stored.size,
            last_modified: DateTime::<Utc>::UNIX_EPOCH,
            uploaded_at: Utc::now(),
            mode: file_mode(&meta),
            name: name.to_string(),
        })
    }

    /// Streams one local file into the store.
    ///
    /// # Errors
    ///
    /// Returns local I/O failures, transport failures and non-200 statuses.
    pub async fn upload(&self, path: &Path) -> Result<FileStoreResult, BlobError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|source| BlobError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let url = self.settings.endpoints().http("api/v1/backup/blob/upload");
        let body = reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(file));

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.settings.token)
            .body(body)
            .send()
            .await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(BlobError::Status {
                url,
                status: resp.status(),
            });
        }

        Ok(resp.json().await?)
    }

    /// Commits the manifest, making the backup durable.
    ///
    /// # Errors
    ///
    /// Returns transport failures and non-200 statuses.
    pub async fn commit(&self, manifest: &Manifest) -> Result<(), BlobError> {
        let url = self.settings.endpoints().http("api/v1/backup/create");

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.settings.token)
            .json(manifest)
            .send()
            .await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(BlobError::Status {
                url,
                status: resp.status(),
            });
        }

        Ok(())
    }

    /// Downloads a blob into `<root>/<entry.name>`, restoring the recorded
    /// file mode.
    ///
    /// Parent directories are created with mode 0700; systemd insists on
    /// that for state directories.
    ///
    /// # Errors
    ///
    /// Returns local I/O failures, transport failures and non-200 statuses.
    pub async fn download_into(&self, root: &Path, entry: &FileEntry) -> Result<(), BlobError> {
        let fname = root.join(&entry.name);
        info!(file = %fname.display(), instance = %self.instance_id, "downloading file");

        if let Some(parent) = fname.parent() {
            create_dir_all_mode(parent, 0o700).map_err(|source| BlobError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut open = tokio::fs::OpenOptions::new();
        open.create(true).write(true).truncate(true);
        #[cfg(unix)]
        if entry.mode != 0 {
            open.mode(entry.mode);
        }
        let mut file = open.open(&fname).await.map_err(|source| BlobError::Io {
            path: fname.clone(),
            source,
        })?;

        let url = self
            .settings
            .endpoints()
            .http(&format!("api/v1/backup/blob/download?hash={}", entry.hash));

        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.settings.token)
            .send()
            .await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(BlobError::Status {
                url,
                status: resp.status(),
            });
        }

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|source| BlobError::Io {
                    path: fname.clone(),
                    source,
                })?;
        }

        file.flush().await.map_err(|source| BlobError::Io {
            path: fname.clone(),
            source,
        })?;

        info!(file = %fname.display(), instance = %self.instance_id, "file restore complete");
        Ok(())
    }
}

fn modified_time(meta: &fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> u32 {
    0
}

/// `create_dir_all` that applies `mode` to every directory it creates.
pub(crate) fn create_dir_all_mode(dir: &Path, mode: u32) -> io::Result<()> {
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }
    if let Some(parent) = dir.parent() {
        create_dir_all_mode(parent, mode)?;
    }

    match fs::create_dir(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(()),
        Err(err) => return Err(err),
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[cfg(unix)]
    #[test]
    fn created_parents_use_the_requested_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a/b/c");
        create_dir_all_mode(&target, 0o700).unwrap();

        for sub in ["a", "a/b", "a/b/c"] {
            let mode = fs::metadata(dir.path().join(sub))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o700, "wrong mode for {sub}");
        }
    }

    #[test]
    fn existing_directories_are_left_alone() {
        let dir = TempDir::new().unwrap();
        create_dir_all_mode(dir.path(), 0o700).unwrap();
    }
}
