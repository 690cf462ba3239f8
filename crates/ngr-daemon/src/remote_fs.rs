//! Remote file-system and exec administration.
//!
//! These handlers back the control plane's remote-administration facility:
//! bounded file reads, atomic file writes, guarded deletes, directory
//! listings and ad-hoc command execution with bounded output capture.

use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context as _};
use chrono::{DateTime, Utc};
use ngr_core::events::{
    DeleteFileRequested, ExecRequest, ExecResponse, FileInfo, ReadDirRequested, ReadDirResponse,
    ReadFileRequested, ReadFileResponse, WriteFileRequested,
};
use ngr_core::hashio;
use tracing::{error, info};

/// Default bound for remote file reads.
const DEFAULT_READ_LIMIT: u64 = 1024 * 1024;

/// Writes the requested file atomically, creating missing parents.
///
/// # Errors
///
/// Returns the underlying I/O error.
pub fn write_file(req: &WriteFileRequested) -> anyhow::Result<()> {
    hashio::write_file(Path::new(&req.path), &req.content, req.mode)
        .with_context(|| format!("cannot write {}", req.path))
}

/// Deletes a file or tree. The empty path and `/` are refused.
///
/// # Errors
///
/// Returns an error for refused paths and I/O failures; a path that is
/// already gone is fine.
pub fn delete_file(req: &DeleteFileRequested) -> anyhow::Result<()> {
    if req.path.is_empty() || req.path == "/" {
        bail!("invalid path");
    }

    let path = Path::new(&req.path);
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("cannot inspect {}", req.path)),
    };

    if meta.is_dir() {
        fs::remove_dir_all(path).with_context(|| format!("cannot remove {}", req.path))
    } else {
        fs::remove_file(path).with_context(|| format!("cannot remove {}", req.path))
    }
}

/// Reads a file, bounded by `max_size` (default 1 MiB).
///
/// # Errors
///
/// Returns stat and read failures.
pub fn read_file(req: &ReadFileRequested) -> anyhow::Result<ReadFileResponse> {
    let limit = if req.max_size == 0 {
        DEFAULT_READ_LIMIT
    } else {
        req.max_size
    };

    let meta = fs::metadata(&req.path).with_context(|| format!("cannot stat {}", req.path))?;

    let file = fs::File::open(&req.path).with_context(|| format!("cannot open {}", req.path))?;
    let mut content = Vec::new();
    file.take(limit)
        .read_to_end(&mut content)
        .with_context(|| format!("cannot read {}", req.path))?;

    Ok(ReadFileResponse {
        request_id: req.request_id,
        path: req.path.clone(),
        file: FileInfo {
            name: Path::new(&req.path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            mode: file_mode(&meta),
            mod_time: modified_time(&meta),
            size: meta.len(),
            sha3v512: String::new(),
        },
        content,
    })
}

/// Lists a directory.
///
/// Entries whose metadata cannot be read are reported by name with zero
/// values, the listing itself still succeeds.
///
/// # Errors
///
/// Returns an error when the directory itself cannot be read.
pub fn read_dir(req: &ReadDirRequested) -> anyhow::Result<ReadDirResponse> {
    let entries = fs::read_dir(&req.path).with_context(|| format!("read dir err: {}", req.path))?;

    let mut res = ReadDirResponse {
        request_id: req.request_id,
        path: req.path.clone(),
        files: Vec::new(),
    };

    for entry in entries {
        let entry = entry.with_context(|| format!("read dir err: {}", req.path))?;
        let name = entry.file_name().to_string_lossy().into_owned();

        let mut info = FileInfo {
            name,
            ..FileInfo::default()
        };

        match entry.metadata() {
            Ok(meta) => {
                info.mode = file_mode(&meta);
                info.mod_time = modified_time(&meta);
                info.size = meta.len();
            }
            Err(err) => {
                error!(path = %req.path, file = %info.name, %err, "failed to read file info");
            }
        }

        res.files.push(info);
    }

    Ok(res)
}

/// Executes an ad-hoc command.
///
/// Output streams are captured into the response when requested, otherwise
/// they are inherited by the agent's own stdio. The response always carries
/// the exit code; spawn failures land in its `error` field.
pub async fn exec(req: &ExecRequest) -> ExecResponse {
    info!(cmd = %req.cmd, args = req.args.join(" "), "exec");

    let mut res = ExecResponse {
        request_id: req.request_id,
        cmd: req.cmd.clone(),
        args: req.args.clone(),
        ..ExecResponse::default()
    };

    let mut command = tokio::process::Command::new(&req.cmd);
    command.args(&req.args).stdin(Stdio::null());
    command.stdout(if req.collect_std_out {
        Stdio::piped()
    } else {
        Stdio::inherit()
    });
    command.stderr(if req.collect_err_out {
        Stdio::piped()
    } else {
        Stdio::inherit()
    });

    let child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            res.error = err.to_string();
            return res;
        }
    };

    match child.wait_with_output().await {
        Ok(output) => {
            res.std_out = output.stdout;
            res.err_out = output.stderr;
            res.exit_code = output.status.code().unwrap_or(-1);
            if !output.status.success() {
                res.error = format!("exit status {}", res.exit_code);
            }
        }
        Err(err) => {
            res.error = err.to_string();
        }
    }

    res
}

fn modified_time(meta: &fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> u32 {
    0
}
