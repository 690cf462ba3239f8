//! Wire events exchanged with the control plane.
//!
//! Every frame on the runner websocket is one JSON object with a `type` field
//! naming the variant and the variant's own fields inlined next to it. The
//! [`Event`] enum is the single registry of variants; adding one touches only
//! this file.
//!
//! Binary payloads (`content`, `stdOut`, `errOut`) travel base64-encoded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manifest::{unix_epoch, FileEntry};

/// The tagged event envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// Synthesized locally whenever the websocket (re)connects.
    ConnectionCreated(ConnectionCreated),
    /// First-contact handshake answer.
    RunnerLaunched(RunnerLaunched),
    /// Periodic host statistics snapshot.
    StatisticsUpdated(StatisticsUpdated),
    /// The desired runner configuration changed; pull and reconcile.
    RunnerConfigurationChanged(RunnerConfigurationChanged),
    /// Tail the journal of a unit.
    JournalCtlLogRequest(JournalCtlLogRequest),
    /// Journal entries for a prior request.
    JournalCtlLogResponse(JournalCtlLogResponse),
    /// Wipe the data directory of an instance.
    DeleteInstanceDataRequested(DeleteInstanceDataRequested),
    /// Write a file on the host.
    WriteFileRequested(WriteFileRequested),
    /// Delete a file or tree on the host.
    DeleteFileRequested(DeleteFileRequested),
    /// Read a file, bounded.
    ReadFileRequested(ReadFileRequested),
    /// File content answer.
    ReadFileResponse(ReadFileResponse),
    /// List a directory.
    ReadDirRequested(ReadDirRequested),
    /// Directory listing answer.
    ReadDirResponse(ReadDirResponse),
    /// Execute an ad-hoc command.
    ExecRequest(ExecRequest),
    /// Result of an ad-hoc command.
    ExecResponse(ExecResponse),
    /// Generic acknowledgement, possibly carrying an error text.
    Response(Response),
    /// Start a content-addressed backup of an instance.
    BackupRequest(BackupRequest),
    /// Rehydrate an instance from a committed manifest.
    RestoreRequest(RestoreRequest),
    /// Advisory progress notification for a long-running task.
    ProgressUpdated(ProgressUpdated),
}

/// Local marker published by the bus after a successful dial.
///
/// This never travels over the wire towards the control plane; it drives the
/// first-contact `RunnerLaunched` handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCreated {}

/// Announces this runner to the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerLaunched {
    /// The host's name as reported by the kernel.
    pub hostname: String,
}

/// A single sampled OS process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Process {
    /// Process id.
    pub pid: i32,
    /// Resolved user name of the real UID, or a `UID n` placeholder.
    pub user: String,
    /// Real UID.
    pub uid: u32,
    /// Target of the `/proc/<pid>/exe` symlink, or `-`.
    #[serde(rename = "binaryPath")]
    pub binary_path: String,
    /// The `comm` name.
    #[serde(rename = "binaryName")]
    pub binary_name: String,
    /// CPU usage percent over the sampling window.
    pub cpu: i64,
    /// Resident set size in bytes.
    pub rss: u64,
}

/// A deployment advertised through a legacy `ngr-` unit description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Deployment {
    /// Application id.
    #[serde(rename = "appID")]
    pub app_id: String,
    /// Binary id.
    #[serde(rename = "binaryID")]
    pub binary_id: String,
    /// Organization slug.
    #[serde(rename = "orgSlug")]
    pub org_slug: String,
    /// Application slug.
    #[serde(rename = "appSlug")]
    pub app_slug: String,
    /// Legacy SHA-256 of the deployed binary.
    #[serde(rename = "binarySha256")]
    pub binary_sha256: String,
    /// Memory limit in MiB, e.g. 512.
    #[serde(rename = "maxMemory")]
    pub max_memory_mib: i64,
    /// CPU quota in the 1-100 percent range.
    #[serde(rename = "maxCPUQuota")]
    pub max_cpu_quota: i64,
    /// Unit start timeout in seconds.
    #[serde(rename = "timeoutStartSec")]
    pub timeout_start_sec: i64,
    /// Listening port.
    pub port: i64,
}

/// Periodic host statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsUpdated {
    /// Number of logical CPUs.
    #[serde(rename = "cpu-count", skip_serializing_if = "is_zero_usize")]
    pub cpu_count: usize,
    /// Total physical memory in bytes.
    #[serde(rename = "memTotal", skip_serializing_if = "is_zero_u64")]
    pub mem_total: u64,
    /// Sampled processes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub processes: Vec<Process>,
    /// Known legacy deployments.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deployments: Vec<Deployment>,
}

/// The desired configuration for this runner changed at the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfigurationChanged {
    /// Id of the runner whose configuration changed.
    #[serde(rename = "runnerID")]
    pub runner_id: String,
}

/// One journal entry as emitted by `journalctl -o json`.
///
/// All fields are passed through verbatim as strings; absent fields stay
/// empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalCtlEntry {
    /// Wall-clock timestamp in microseconds.
    #[serde(rename = "__REALTIME_TIMESTAMP", skip_serializing_if = "String::is_empty")]
    pub realtime_timestamp: String,
    /// Stream id of stdout transport entries.
    #[serde(rename = "_STREAM_ID", skip_serializing_if = "String::is_empty")]
    pub stream_id: String,
    /// UID of the logging process.
    #[serde(rename = "_UID", skip_serializing_if = "String::is_empty")]
    pub uid: String,
    /// Syslog facility number.
    #[serde(rename = "SYSLOG_FACILITY", skip_serializing_if = "String::is_empty")]
    pub syslog_facility: String,
    /// Transport the entry arrived over.
    #[serde(rename = "_TRANSPORT", skip_serializing_if = "String::is_empty")]
    pub transport: String,
    /// Syslog priority.
    #[serde(rename = "PRIORITY", skip_serializing_if = "String::is_empty")]
    pub priority: String,
    /// PID of the logging process.
    #[serde(rename = "_PID", skip_serializing_if = "String::is_empty")]
    pub pid: String,
    /// Control group of the logging process.
    #[serde(rename = "_SYSTEMD_CGROUP", skip_serializing_if = "String::is_empty")]
    pub systemd_cgroup: String,
    /// Syslog identifier.
    #[serde(rename = "SYSLOG_IDENTIFIER", skip_serializing_if = "String::is_empty")]
    pub syslog_identifier: String,
    /// Monotonic timestamp.
    #[serde(rename = "__MONOTONIC_TIMESTAMP", skip_serializing_if = "String::is_empty")]
    pub monotonic_timestamp: String,
    /// Journal cursor of this entry.
    #[serde(rename = "__CURSOR", skip_serializing_if = "String::is_empty")]
    pub cursor: String,
    /// Invocation id of the unit.
    #[serde(rename = "_SYSTEMD_INVOCATION_ID", skip_serializing_if = "String::is_empty")]
    pub systemd_invocation_id: String,
    /// Executable path.
    #[serde(rename = "_EXE", skip_serializing_if = "String::is_empty")]
    pub exe: String,
    /// Full command line.
    #[serde(rename = "_CMDLINE", skip_serializing_if = "String::is_empty")]
    pub cmdline: String,
    /// Unit the entry belongs to.
    #[serde(rename = "_SYSTEMD_UNIT", skip_serializing_if = "String::is_empty")]
    pub systemd_unit: String,
    /// Boot id.
    #[serde(rename = "_BOOT_ID", skip_serializing_if = "String::is_empty")]
    pub boot_id: String,
    /// Slice the unit runs in.
    #[serde(rename = "_SYSTEMD_SLICE", skip_serializing_if = "String::is_empty")]
    pub systemd_slice: String,
    /// `comm` of the logging process.
    #[serde(rename = "_COMM", skip_serializing_if = "String::is_empty")]
    pub comm: String,
    /// Machine id.
    #[serde(rename = "_MACHINE_ID", skip_serializing_if = "String::is_empty")]
    pub machine_id: String,
    /// GID of the logging process.
    #[serde(rename = "_GID", skip_serializing_if = "String::is_empty")]
    pub gid: String,
    /// Effective capability set.
    #[serde(rename = "_CAP_EFFECTIVE", skip_serializing_if = "String::is_empty")]
    pub cap_effective: String,
    /// Runtime scope.
    #[serde(rename = "_RUNTIME_SCOPE", skip_serializing_if = "String::is_empty")]
    pub runtime_scope: String,
    /// Sequence number id.
    #[serde(rename = "__SEQNUM_ID", skip_serializing_if = "String::is_empty")]
    pub seqnum_id: String,
    /// SELinux context.
    #[serde(rename = "_SELINUX_CONTEXT", skip_serializing_if = "String::is_empty")]
    pub selinux_context: String,
    /// Hostname at log time.
    #[serde(rename = "_HOSTNAME", skip_serializing_if = "String::is_empty")]
    pub host: String,
    /// Sequence number.
    #[serde(rename = "__SEQNUM", skip_serializing_if = "String::is_empty")]
    pub seqnum: String,
    /// The log message itself.
    #[serde(rename = "MESSAGE", skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Journal tail request, bounded by unit and window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalCtlLogRequest {
    /// Request correlation id.
    #[serde(rename = "rid")]
    pub request_id: i64,
    /// Unit to filter on; empty means the whole journal.
    pub unit: String,
    /// Maximum number of entries, newest first.
    #[serde(rename = "lastN")]
    pub last_n: u32,
    /// Lower time bound (`journalctl -S` syntax).
    pub since: String,
    /// Upper time bound (`journalctl -U` syntax).
    pub until: String,
}

/// Journal entries answering a [`JournalCtlLogRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalCtlLogResponse {
    /// Request correlation id.
    #[serde(rename = "rid")]
    pub request_id: i64,
    /// The collected entries.
    pub entries: Vec<JournalCtlEntry>,
}

/// Wipe the data directory of the named unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteInstanceDataRequested {
    /// Request correlation id.
    #[serde(rename = "rid")]
    pub request_id: i64,
    /// Instance/unit name whose data is wiped.
    pub unit: String,
}

/// Write a file on the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteFileRequested {
    /// Request correlation id.
    #[serde(rename = "rid")]
    pub request_id: i64,
    /// Absolute target path.
    pub path: String,
    /// Unix mode bits for the new file.
    pub mode: u32,
    /// File content.
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

/// Delete a file or tree on the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteFileRequested {
    /// Request correlation id.
    #[serde(rename = "rid")]
    pub request_id: i64,
    /// Absolute path. Empty and `/` are refused.
    pub path: String,
}

/// Generic acknowledgement for requests without a richer answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Response {
    /// Request correlation id.
    #[serde(rename = "rid")]
    pub request_id: i64,
    /// Error text; empty on success.
    #[serde(rename = "err")]
    pub error: String,
}

/// Read a file, bounded by `max_size`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadFileRequested {
    /// Request correlation id.
    #[serde(rename = "rid")]
    pub request_id: i64,
    /// Absolute path to read.
    pub path: String,
    /// Read bound in bytes; 0 means the 1 MiB default.
    #[serde(rename = "maxSize")]
    pub max_size: u64,
}

/// Stat-style description of a file on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Base name of the file.
    #[serde(default)]
    pub name: String,
    /// Unix mode bits.
    #[serde(default)]
    pub mode: u32,
    /// Last modification time.
    #[serde(rename = "modTime", default = "unix_epoch")]
    pub mod_time: DateTime<Utc>,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Optional content hash.
    #[serde(rename = "sha512", default, skip_serializing_if = "String::is_empty")]
    pub sha3v512: String,
}

impl Default for FileInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            mode: 0,
            mod_time: unix_epoch(),
            size: 0,
            sha3v512: String::new(),
        }
    }
}

/// File content answering a [`ReadFileRequested`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadFileResponse {
    /// Request correlation id.
    #[serde(rename = "rid")]
    pub request_id: i64,
    /// The path that was read.
    pub path: String,
    /// Stat info of the file.
    pub file: FileInfo,
    /// The (possibly truncated) content.
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

/// List a directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadDirRequested {
    /// Request correlation id.
    #[serde(rename = "rid")]
    pub request_id: i64,
    /// Absolute directory path.
    pub path: String,
}

/// Directory listing answering a [`ReadDirRequested`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadDirResponse {
    /// Request correlation id.
    #[serde(rename = "rid")]
    pub request_id: i64,
    /// The listed directory.
    pub path: String,
    /// Directory entries.
    #[serde(rename = "Files")]
    pub files: Vec<FileInfo>,
}

/// Execute an ad-hoc command on the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecRequest {
    /// Request correlation id.
    #[serde(rename = "rid")]
    pub request_id: i64,
    /// Command to run.
    pub cmd: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Capture stdout into the response instead of streaming to the agent log.
    #[serde(rename = "collectStdOut")]
    pub collect_std_out: bool,
    /// Capture stderr into the response instead of streaming to the agent log.
    #[serde(rename = "collectErrOut")]
    pub collect_err_out: bool,
}

/// Result of an [`ExecRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecResponse {
    /// Request correlation id.
    #[serde(rename = "rid")]
    pub request_id: i64,
    /// Echo of the executed command.
    pub cmd: String,
    /// Echo of the arguments.
    pub args: Vec<String>,
    /// Captured stdout, if requested.
    #[serde(rename = "stdOut", with = "base64_bytes")]
    pub std_out: Vec<u8>,
    /// Captured stderr, if requested.
    #[serde(rename = "errOut", with = "base64_bytes")]
    pub err_out: Vec<u8>,
    /// Exit code of the process; 0 on success.
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
    /// Spawn or wait error, empty on success.
    pub error: String,
}

/// Start a content-addressed backup of an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupRequest {
    /// Request correlation id.
    #[serde(rename = "rid")]
    pub request_id: i64,
    /// Progress stream id for [`ProgressUpdated`] notifications.
    #[serde(rename = "progressId")]
    pub progress_id: String,
    /// Instance to back up.
    #[serde(rename = "instanceID")]
    pub instance_id: String,
}

/// Rehydrate an instance from a committed manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreRequest {
    /// Request correlation id.
    #[serde(rename = "rid")]
    pub request_id: i64,
    /// Instance to restore into.
    #[serde(rename = "instanceID")]
    pub instance_id: String,
    /// Progress stream id for [`ProgressUpdated`] notifications.
    #[serde(rename = "progressId")]
    pub progress_id: String,
    /// The executable blob; skipped when its hash is empty.
    pub exec: FileEntry,
    /// The data tree blobs.
    pub data: Vec<FileEntry>,
}

/// Advisory progress notification.
///
/// Ordering-preserved on the bus but lossy under disconnect; the final
/// `finished` notification is idempotent and may be reissued.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressUpdated {
    /// Progress stream id.
    #[serde(rename = "progressId")]
    pub progress_id: String,
    /// Completion percentage, monotonically non-decreasing per stream.
    pub percent: u32,
    /// True exactly on the terminal notification of a stream.
    #[serde(rename = "done", skip_serializing_if = "is_false")]
    pub finished: bool,
    /// Error text when the task failed.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero_usize(v: &usize) -> bool {
    *v == 0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

mod base64_bytes {
    //! Byte slices travel base64-encoded inside JSON strings.

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        match encoded {
            None => Ok(Vec::new()),
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
        }
    }
}
