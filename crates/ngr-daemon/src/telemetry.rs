//! Periodic host statistics.
//!
//! Every 30 seconds the scheduler publishes one [`StatisticsUpdated`]
//! snapshot: CPU count, total memory, a `/proc` scan of all processes with a
//! short CPU sampling window each, and the legacy deployment records found in
//! `ngr-` prefixed unit descriptions. Collection blocks on purpose (the CPU
//! sample sleeps), so it runs on the blocking pool.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ngr_core::events::{Deployment, Event, Process, StatisticsUpdated};
use ngr_core::proc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bus::EventSink;
use crate::layout::Layout;

/// Interval between statistics snapshots.
const STATISTICS_INTERVAL: Duration = Duration::from_secs(30);

/// Per-PID CPU sampling window.
const CPU_SAMPLE_WINDOW: Duration = Duration::from_millis(200);

/// Unit-file prefix of legacy console deployments.
const DEPLOYMENT_UNIT_PREFIX: &str = "ngr-";

/// Publishes a statistics snapshot every 30 seconds until cancelled.
pub async fn run_scheduler(sink: Arc<dyn EventSink>, layout: Layout, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("statistics scheduler stopping");
                return;
            }
            () = tokio::time::sleep(STATISTICS_INTERVAL) => {}
        }

        let unit_dir = layout.unit_dir.clone();
        let snapshot = tokio::task::spawn_blocking(move || statistics(&unit_dir)).await;

        match snapshot {
            Ok(stats) => sink.publish(Event::StatisticsUpdated(stats)).await,
            Err(err) => error!(%err, "statistics collection panicked"),
        }
    }
}

/// Collects one snapshot. Blocking: samples every PID over a 200 ms window.
#[must_use]
pub fn statistics(unit_dir: &Path) -> StatisticsUpdated {
    collect(unit_dir, CPU_SAMPLE_WINDOW)
}

fn collect(unit_dir: &Path, cpu_window: Duration) -> StatisticsUpdated {
    let mut res = StatisticsUpdated {
        cpu_count: std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(0),
        ..StatisticsUpdated::default()
    };

    match proc::memory_total() {
        Ok(total) => res.mem_total = total,
        Err(err) => error!(%err, "error reading /proc/meminfo"),
    }

    let pids = match proc::list_pids() {
        Ok(pids) => pids,
        Err(err) => {
            error!(%err, "error reading /proc");
            return res;
        }
    };

    for pid in pids {
        // processes may vanish mid-scan; skip quietly
        let Ok(uid) = proc::uid(pid) else { continue };

        let cpu = proc::sample_cpu_percent(pid, cpu_window).unwrap_or(0);
        let rss = proc::memory_usage(pid).unwrap_or(0);

        res.processes.push(Process {
            pid,
            uid,
            user: username(uid),
            binary_path: proc::binary_path(pid),
            binary_name: proc::binary_name(pid),
            cpu,
            rss,
        });
    }

    match find_deployments(unit_dir) {
        Ok(deployments) => res.deployments = deployments,
        Err(err) => error!(%err, "error getting deployments"),
    }

    res
}

/// Resolves a UID to a user name, falling back to a `UID n` placeholder.
#[must_use]
pub fn username(uid: u32) -> String {
    users::get_user_by_uid(uid)
        .map(|user| user.name().to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("UID {uid}"))
}

/// Scans the unit directory for legacy `ngr-` deployments.
///
/// Those units carry a JSON [`Deployment`] record in their `Description=`
/// line; anything unreadable is logged and skipped.
///
/// # Errors
///
/// Returns an error when the unit directory itself cannot be read.
pub fn find_deployments(unit_dir: &Path) -> io::Result<Vec<Deployment>> {
    let mut res = Vec::new();

    for entry in fs::read_dir(unit_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(DEPLOYMENT_UNIT_PREFIX) || !name.ends_with(".service") {
            continue;
        }

        let content = match fs::read_to_string(entry.path()) {
            Ok(content) => content,
            Err(err) => {
                error!(file = %name, %err, "cannot read file");
                continue;
            }
        };

        for line in content.lines() {
            let trimmed = line.trim();
            if !trimmed.starts_with("Description") {
                continue;
            }

            let Some((_, json)) = trimmed.split_once('=') else {
                break;
            };

            match serde_json::from_str::<Deployment>(json) {
                Ok(deployment) => res.push(deployment),
                Err(err) => {
                    error!(file = %name, line = %trimmed, %err,
                           "cannot unmarshal deployment from service description");
                }
            }
            break;
        }
    }

    Ok(res)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn deployments_come_from_ngr_prefixed_descriptions() {
        let dir = TempDir::new().unwrap();
        let unit = "[Unit]\nDescription={\"appID\":\"a1\",\"orgSlug\":\"org\",\"appSlug\":\"app\",\"port\":3000}\n";
        fs::write(dir.path().join("ngr-org-app.service"), unit).unwrap();
        fs::write(dir.path().join("other.service"), "[Unit]\nDescription=plain\n").unwrap();
        // an ngr- unit with a non-JSON description is skipped, not fatal
        fs::write(
            dir.path().join("ngr-broken.service"),
            "[Unit]\nDescription=not json\n",
        )
        .unwrap();

        let deployments = find_deployments(dir.path()).unwrap();
        assert_eq!(deployments.len(), 1);
        assert_eq!(deployments[0].app_id, "a1");
        assert_eq!(deployments[0].port, 3000);
    }

    #[test]
    fn unknown_uids_fall_back_to_a_placeholder() {
        assert_eq!(username(u32::MAX - 7), format!("UID {}", u32::MAX - 7));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn snapshot_sees_this_process() {
        let dir = TempDir::new().unwrap();
        // a tiny sampling window keeps the full-proc scan fast in tests
        let stats = collect(dir.path(), Duration::from_micros(100));

        assert!(stats.cpu_count > 0);
        assert!(stats.mem_total > 0);
        let me = std::process::id() as i32;
        assert!(stats.processes.iter().any(|p| p.pid == me));
    }
}
