//! Declarative runner configuration.
//!
//! A [`Runner`] document describes every application instance a single host
//! has to provision. It is fetched from the control plane and never persisted
//! locally; the unit files written by the reconciler are the durable memory.
//!
//! The [`ServiceUnit`] tree mirrors the systemd unit sections verbatim. See
//! `systemd.exec(5)` and `systemd.resource-control(5)` for the semantics of
//! the individual knobs, and audit the resulting sandbox with
//! `systemd-analyze security`.

use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while validating configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The instance id is not usable as a unit basename.
    #[error("invalid instance id: {0:?}")]
    InvalidInstanceId(String),

    /// A declared path contains a forbidden component.
    #[error("path cannot contain '.': {0:?}")]
    InvalidPath(String),
}

/// All applications which this runner needs to provision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Runner {
    /// The declared application instances.
    pub applications: Vec<Application>,
}

/// A single application instance to materialize as a sandboxed service unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Application {
    /// Application identity, shared between instances of the same app.
    #[serde(rename = "id")]
    pub app_id: String,

    /// Stable per-instance identity. Used as the unit basename and as the
    /// leaf of the executable and data paths, hence restricted to
    /// `[A-Za-z0-9_-]+`.
    #[serde(rename = "instanceId")]
    pub inst_id: String,

    /// The sandbox the instance runs in.
    pub sandbox: Sandbox,

    /// The executable artifact to place at the instance's exec path.
    pub executable: Executable,

    /// Optional reverse-proxy fronting.
    #[serde(rename = "reverseProxy")]
    pub reverse_proxy: ReverseProxy,
}

impl Application {
    /// Validates the parts of the application the reconciler relies on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidInstanceId`] if the instance id cannot
    /// be used as a unit basename.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !valid_unit_name(&self.inst_id) {
            return Err(ConfigError::InvalidInstanceId(self.inst_id.clone()));
        }

        Ok(())
    }
}

/// The executable artifact of an application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Executable {
    /// Download location. May be relative to the control-plane HTTP base.
    pub url: String,

    /// Exact size in bytes. A downloaded artifact of any other size is
    /// rejected.
    pub size: u64,

    /// Content hash the downloaded artifact must match.
    pub hash: Sha3V512,
}

/// Reverse-proxy fronting rules for one application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReverseProxy {
    /// Whether any fronting is requested at all.
    pub enabled: bool,

    /// The individual host rules.
    pub rules: Vec<Rule>,
}

/// One reverse-proxy rule, either a proxy pass or an HTTP redirect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rule {
    /// Public location, like `myapp.example.com`.
    pub location: String,

    /// Upstream host for the proxy pass.
    pub host: String,

    /// Upstream port for the proxy pass.
    pub port: u16,

    /// If true, apply an HTTP redirect instead of proxy-pass rules.
    pub redirect: bool,

    /// Redirect destination, only used with [`Rule::redirect`].
    #[serde(rename = "redirectTarget")]
    pub redirect_target: String,
}

/// The sandbox an application runs in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sandbox {
    /// The declarative systemd service unit.
    #[serde(rename = "systemd")]
    pub unit: ServiceUnit,
}

/// All declarative systemd service sections of one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceUnit {
    /// The `[Unit]` section.
    pub unit: UnitSection,

    /// The `[Install]` section.
    pub install: InstallSection,

    /// The `[Service]` section.
    pub service: ServiceSection,
}

/// The `[Unit]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitSection {
    /// Human readable description.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Ordering dependency, e.g. `network-online.target`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub after: String,
}

/// The `[Install]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallSection {
    /// Install target, e.g. `multi-user.target`.
    #[serde(rename = "wantedBy", skip_serializing_if = "String::is_empty")]
    pub wanted_by: String,
}

/// The `[Service]` section, covering process identity, isolation,
/// resource control and lifecycle.
///
/// Every field maps 1:1 onto the systemd directive of the same name. Only
/// non-zero fields are rendered into the unit file, in a fixed order, so the
/// rendered text is a pure function of this record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    /// `bind(2)` allow rules, e.g. `ipv4:1234`.
    #[serde(rename = "socketBindAllow", skip_serializing_if = "Vec::is_empty")]
    pub socket_bind_allow: Vec<String>,

    /// `bind(2)` deny rules.
    #[serde(rename = "socketBindDeny", skip_serializing_if = "Vec::is_empty")]
    pub socket_bind_deny: Vec<String>,

    /// `hidepid=` style procfs visibility: `noaccess`, `invisible`,
    /// `ptraceable` or `default`.
    #[serde(rename = "protectProc", skip_serializing_if = "String::is_empty")]
    pub protect_proc: String,

    /// Allocate a transient UNIX user/group pair for the unit's lifetime.
    #[serde(rename = "dynamicUser", skip_serializing_if = "is_false")]
    pub dynamic_user: bool,

    /// Remove SysV/POSIX IPC objects owned by the unit's user on stop.
    #[serde(rename = "removeIPC", skip_serializing_if = "is_false")]
    pub remove_ipc: bool,

    /// Private `/tmp` and `/var/tmp` namespace.
    #[serde(rename = "privateTmp", skip_serializing_if = "is_false")]
    pub private_tmp: bool,

    /// Private `/dev` with API pseudo devices only.
    #[serde(rename = "privateDevices", skip_serializing_if = "is_false")]
    pub private_devices: bool,

    /// New network namespace with only a loopback device.
    #[serde(rename = "privateNetwork", skip_serializing_if = "is_false")]
    pub private_network: bool,

    /// New IPC namespace.
    #[serde(rename = "privateIPC", skip_serializing_if = "is_false")]
    pub private_ipc: bool,

    /// New PID namespace; the executed process becomes PID 1.
    #[serde(rename = "privatePIDs", skip_serializing_if = "is_false")]
    pub private_pids: bool,

    /// User namespace mapping: boolean-ish `yes`, `self` or `identity`.
    #[serde(rename = "privateUsers", skip_serializing_if = "String::is_empty")]
    pub private_users: String,

    /// Deny writes to the hardware and system clock.
    #[serde(rename = "protectClock", skip_serializing_if = "is_false")]
    pub protect_clock: bool,

    /// Make kernel tunables under `/proc/sys` and `/sys` read-only.
    #[serde(rename = "protectKernelTunables", skip_serializing_if = "is_false")]
    pub protect_kernel_tunables: bool,

    /// Deny explicit kernel module loading.
    #[serde(rename = "protectKernelModules", skip_serializing_if = "is_false")]
    pub protect_kernel_modules: bool,

    /// Deny access to the kernel log ring buffer.
    #[serde(rename = "protectKernelLogs", skip_serializing_if = "is_false")]
    pub protect_kernel_logs: bool,

    /// New UTS namespace; hostname changes are prevented.
    #[serde(rename = "protectHostname", skip_serializing_if = "is_false")]
    pub protect_hostname: bool,

    /// Control-group hierarchy protection: `yes`, `private` or `strict`.
    #[serde(
        rename = "protectControlGroups",
        skip_serializing_if = "String::is_empty"
    )]
    pub protect_control_groups: String,

    /// Namespace kinds the unit may create, e.g. `~user` or `net`.
    #[serde(rename = "restrictNamespaces", skip_serializing_if = "Vec::is_empty")]
    pub restrict_namespaces: Vec<String>,

    /// Reject writable-and-executable memory mappings.
    #[serde(rename = "memoryDenyWriteExecute", skip_serializing_if = "is_false")]
    pub memory_deny_write_execute: bool,

    /// Refuse realtime scheduling policies.
    #[serde(rename = "restrictRealtime", skip_serializing_if = "is_false")]
    pub restrict_realtime: bool,

    /// Deny setting SUID/SGID bits.
    #[serde(rename = "restrictSUIDSGID", skip_serializing_if = "is_false")]
    pub restrict_suid_sgid: bool,

    /// Private mount namespace with propagation towards the host turned off.
    #[serde(rename = "privateMounts", skip_serializing_if = "is_false")]
    pub private_mounts: bool,

    /// Seccomp allow-list of system call names.
    #[serde(rename = "systemCallFilter", skip_serializing_if = "String::is_empty")]
    pub system_call_filter: String,

    /// Environment variables passed to the process.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<EnvVar>,

    /// System hierarchy protection: `yes`, `full` or `strict`.
    #[serde(rename = "protectSystem", skip_serializing_if = "String::is_empty")]
    pub protect_system: String,

    /// Home directory protection: `yes`, `read-only` or `tmpfs`.
    #[serde(rename = "protectHome", skip_serializing_if = "String::is_empty")]
    pub protect_home: String,

    /// Relative state directory below `/var/lib/`, created by systemd.
    #[serde(rename = "stateDirectory", skip_serializing_if = "String::is_empty")]
    pub state_directory: String,

    /// Paths the unit may execute from.
    #[serde(rename = "execPaths", skip_serializing_if = "String::is_empty")]
    pub exec_paths: String,

    /// Paths made read-only for the unit.
    #[serde(rename = "readOnlyPaths", skip_serializing_if = "String::is_empty")]
    pub read_only_paths: String,

    /// Paths kept writable inside an otherwise read-only view.
    #[serde(rename = "readWritePaths", skip_serializing_if = "String::is_empty")]
    pub read_write_paths: String,

    /// Paths made inaccessible for the unit.
    #[serde(rename = "inaccessiblePaths", skip_serializing_if = "String::is_empty")]
    pub inaccessible_paths: String,

    /// Unit-specific bind mounts (`src[:dst[:opts]]`).
    #[serde(rename = "bindPaths", skip_serializing_if = "String::is_empty")]
    pub bind_paths: String,

    /// Read-only unit-specific bind mounts.
    #[serde(rename = "bindReadOnlyPaths", skip_serializing_if = "String::is_empty")]
    pub bind_read_only_paths: String,

    /// Restart policy: `no`, `on-failure`, `always`, ...
    #[serde(skip_serializing_if = "String::is_empty")]
    pub restart: String,

    /// Service type, e.g. `simple` or `exec`.
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,

    /// Command executed when the service starts.
    #[serde(rename = "execStart", skip_serializing_if = "CommandLine::is_empty")]
    pub exec_start: CommandLine,

    /// Sleep before a restart.
    #[serde(rename = "restartSec", skip_serializing_if = "DurationNanos::is_zero")]
    pub restart_sec: DurationNanos,

    /// What the OOM killer does with the unit: `continue`, `stop` or `kill`.
    #[serde(rename = "OOMPolicy", skip_serializing_if = "String::is_empty")]
    pub oom_policy: String,

    /// OOM score adjustment in `-1000..=1000`.
    #[serde(rename = "OOMScoreAdjust", skip_serializing_if = "is_zero_i64")]
    pub oom_score_adjust: i64,

    /// Static user the service runs as.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,

    /// Static group the service runs as.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub group: String,

    /// Force `$HOME`, `$LOGNAME` and `$SHELL` to be set.
    #[serde(rename = "setLoginEnvironment", skip_serializing_if = "is_false")]
    pub set_login_environment: bool,

    /// Capability bounding set entries, e.g. `~CAP_SYS_ADMIN`.
    #[serde(rename = "capabilityBoundingSet", skip_serializing_if = "Vec::is_empty")]
    pub capability_bounding_set: Vec<String>,

    /// Deny privilege elevation through `execve(2)`.
    #[serde(rename = "noNewPrivileges", skip_serializing_if = "is_false")]
    pub no_new_privileges: bool,

    /// Secure bits, e.g. `noroot-locked`.
    #[serde(rename = "secureBits", skip_serializing_if = "Vec::is_empty")]
    pub secure_bits: Vec<String>,

    /// AppArmor profile to switch to on start.
    #[serde(rename = "appArmorProfile", skip_serializing_if = "String::is_empty")]
    pub app_armor_profile: String,

    /// `memory.high` throttling limit.
    #[serde(rename = "memoryHigh", skip_serializing_if = "Memory::is_empty")]
    pub memory_high: Memory,

    /// `memory.high` during startup and shutdown phases.
    #[serde(rename = "startupMemoryHigh", skip_serializing_if = "Memory::is_empty")]
    pub startup_memory_high: Memory,

    /// `memory.swap.max` absolute swap limit.
    #[serde(rename = "memorySwapMax", skip_serializing_if = "Memory::is_empty")]
    pub memory_swap_max: Memory,

    /// `memory.swap.max` during startup and shutdown phases.
    #[serde(
        rename = "startupMemorySwapMax",
        skip_serializing_if = "Memory::is_empty"
    )]
    pub startup_memory_swap_max: Memory,

    /// `cpu.weight` in `1..=10000`.
    #[serde(rename = "CPUWeight", skip_serializing_if = "is_zero_u32")]
    pub cpu_weight: u32,

    /// CPU quota percentage relative to a single CPU.
    #[serde(rename = "CPUQuota", skip_serializing_if = "is_zero_u32")]
    pub cpu_quota: u32,

    /// Kill strategy on stop: `control-group`, `mixed`, `process`, `none`.
    #[serde(rename = "killMode", skip_serializing_if = "String::is_empty")]
    pub kill_mode: String,

    /// First signal sent when stopping, defaults to `SIGTERM`.
    #[serde(rename = "killSignal", skip_serializing_if = "String::is_empty")]
    pub kill_signal: String,

    /// Grace period between the stop signal and `SIGKILL`.
    #[serde(
        rename = "timeoutStopSec",
        skip_serializing_if = "DurationNanos::is_zero"
    )]
    pub timeout_stop_sec: DurationNanos,
}

/// A single environment variable assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvVar {
    /// Variable name.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub key: String,

    /// Variable value.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub value: String,
}

/// A command with its arguments, as used by `ExecStart=`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandLine {
    /// Absolute path of the binary to start.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cmd: String,

    /// Arguments, joined with single spaces when rendered.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl CommandLine {
    /// True when no command is declared at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cmd.is_empty() && self.args.is_empty()
    }
}

/// A memory size with an optional base-1024 suffix (`K`, `M`, `G`, `T`),
/// a percentage, or `infinity`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Memory(pub String);

impl Memory {
    /// True when no limit is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A hex encoded SHA3-512 hashsum.
///
/// The empty string is the hash of "nothing", used to signal a missing file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sha3V512(pub String);

impl Sha3V512 {
    /// True for the missing-file marker.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The raw hex digits.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sha3V512 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Sha3V512 {
    fn from(hex: String) -> Self {
        Self(hex)
    }
}

/// A file path interpreted inside an instance sandbox, like
/// `/data/mydata.tdb`.
///
/// Any path containing a `.` character is invalid and rejected. This is
/// stricter than ruling out `.`/`..` components, but it is what the control
/// plane expects today.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(pub String);

impl Path {
    /// Validates the path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPath`] when the path contains a `.`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.0.contains('.') {
            return Err(ConfigError::InvalidPath(self.0.clone()));
        }

        Ok(())
    }
}

/// A duration carried as integer nanoseconds on the wire, rendered in
/// human-readable form inside unit files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DurationNanos(pub Duration);

impl DurationNanos {
    /// The zero duration, which is never rendered.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Convenience constructor from whole seconds.
    #[must_use]
    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }
}

impl From<Duration> for DurationNanos {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl Serialize for DurationNanos {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = u64::try_from(self.0.as_nanos()).map_err(serde::ser::Error::custom)?;
        serializer.serialize_u64(nanos)
    }
}

impl<'de> Deserialize<'de> for DurationNanos {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let nanos = u64::deserialize(deserializer)?;
        Ok(Self(Duration::from_nanos(nanos)))
    }
}

/// Whether `name` is acceptable as a unit basename and instance namespace.
///
/// The accepted alphabet is `[A-Za-z0-9_-]+`.
#[must_use]
pub fn valid_unit_name(name: &str) -> bool {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    let re = NAME_RE.get_or_init(|| Regex::new("^[a-zA-Z0-9_-]+$").expect("static pattern"));
    re.is_match(name)
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_names() {
        assert!(valid_unit_name("svc-a"));
        assert!(valid_unit_name("A_b-9"));
        assert!(!valid_unit_name(""));
        assert!(!valid_unit_name("svc a"));
        assert!(!valid_unit_name("svc/a"));
        assert!(!valid_unit_name("svc.a"));
        assert!(!valid_unit_name("../etc"));
    }

    #[test]
    fn application_validate_rejects_bad_instance_id() {
        let app = Application {
            inst_id: "no slashes/here".into(),
            ..Application::default()
        };
        assert!(matches!(
            app.validate(),
            Err(ConfigError::InvalidInstanceId(_))
        ));
    }

    #[test]
    fn path_validation_is_strict_about_dots() {
        assert!(Path("/data/blob".into()).validate().is_ok());
        assert!(Path("/data/x.bin".into()).validate().is_err());
        assert!(Path("..".into()).validate().is_err());
        assert!(Path(".".into()).validate().is_err());
    }

    #[test]
    fn duration_nanos_round_trips_through_json() {
        let d = DurationNanos(Duration::from_millis(1500));
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, "1500000000");
        let back: DurationNanos = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn service_unit_compact_json_omits_defaults() {
        let unit = ServiceUnit::default();
        let json = serde_json::to_string(&unit).unwrap();
        assert_eq!(json, r#"{"unit":{},"install":{},"service":{}}"#);
    }

    #[test]
    fn runner_document_parses_from_control_plane_json() {
        let doc = r#"{
            "applications": [{
                "id": "app-1",
                "instanceId": "svc-a",
                "executable": {"url": "/api/v1/bin/xyz", "size": 1024, "hash": "ab12"},
                "sandbox": {"systemd": {
                    "unit": {"description": "svc a", "after": "network-online.target"},
                    "install": {"wantedBy": "multi-user.target"},
                    "service": {
                        "type": "exec",
                        "dynamicUser": true,
                        "restartSec": 5000000000,
                        "execStart": {"cmd": "/opt/ngr/svc-a", "args": ["--port", "8080"]},
                        "environment": [{"key": "PORT", "value": "8080"}]
                    }
                }},
                "reverseProxy": {"enabled": true, "rules": [
                    {"location": "svc-a.example.com", "host": "127.0.0.1", "port": 8080}
                ]}
            }]
        }"#;

        let runner: Runner = serde_json::from_str(doc).unwrap();
        assert_eq!(runner.applications.len(), 1);
        let app = &runner.applications[0];
        assert_eq!(app.inst_id, "svc-a");
        assert_eq!(app.executable.size, 1024);
        let svc = &app.sandbox.unit.service;
        assert!(svc.dynamic_user);
        assert_eq!(svc.restart_sec, DurationNanos::from_secs(5));
        assert_eq!(svc.exec_start.cmd, "/opt/ngr/svc-a");
        assert_eq!(app.reverse_proxy.rules[0].port, 8080);
    }
}
