//! Journal log collection.
//!
//! Shells out to `journalctl -o json` and parses each output line into a
//! [`JournalCtlEntry`]. Lines that fail to parse are logged and skipped; the
//! journal occasionally emits entries with binary fields that do not decode.

use std::process::Stdio;

use anyhow::{bail, Context as _};
use ngr_core::events::{JournalCtlEntry, JournalCtlLogRequest};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::error;

/// Default entry count when the request carries no bounds at all.
const DEFAULT_LAST_N: u32 = 100;

/// Collects journal entries for one request.
///
/// The window is bounded by `last_n`, `since`, `until` and `unit`; a request
/// without any bound defaults to the last 100 entries.
///
/// # Errors
///
/// Returns spawn failures and a non-zero `journalctl` exit.
pub async fn collect_logs(req: &JournalCtlLogRequest) -> anyhow::Result<Vec<JournalCtlEntry>> {
    let mut last_n = req.last_n;
    if last_n == 0 && req.since.is_empty() && req.until.is_empty() {
        last_n = DEFAULT_LAST_N;
    }

    let mut args: Vec<String> = vec!["--no-pager".into(), "-o".into(), "json".into()];
    if last_n != 0 {
        args.push("-n".into());
        args.push(last_n.to_string());
    }
    if !req.since.is_empty() {
        args.push("-S".into());
        args.push(req.since.clone());
    }
    if !req.until.is_empty() {
        args.push("-U".into());
        args.push(req.until.clone());
    }
    if !req.unit.is_empty() {
        args.push("--unit".into());
        args.push(req.unit.clone());
    }

    let mut child = tokio::process::Command::new("journalctl")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to start journalctl")?;

    let stdout = child.stdout.take().context("journalctl without stdout")?;
    let mut stderr = child.stderr.take().context("journalctl without stderr")?;

    let mut entries = Vec::new();
    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next_line().await.context("failed to scan journalctl")? {
        match serde_json::from_str::<JournalCtlEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                error!(entry = %line, %err, "failed to unmarshal journalctl log entry");
            }
        }
    }

    let status = child.wait().await.context("failed to wait journalctl")?;
    if !status.success() {
        let mut err_text = String::new();
        let _ = stderr.read_to_string(&mut err_text).await;
        error!("{}", err_text.trim());
        bail!("journalctl exited with status {:?}", status.code());
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_entries_decode_from_json_lines() {
        let line = r#"{"__REALTIME_TIMESTAMP":"1714988112000000","_SYSTEMD_UNIT":"svc-a.service",
                       "PRIORITY":"6","MESSAGE":"listening on :8080","_PID":"4242"}"#;
        let entry: JournalCtlEntry = serde_json::from_str(line).unwrap();
        assert_eq!(entry.systemd_unit, "svc-a.service");
        assert_eq!(entry.message, "listening on :8080");
        assert_eq!(entry.pid, "4242");
        assert!(entry.cursor.is_empty());
    }
}
