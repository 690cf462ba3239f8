//! Systemd unit rendering and parsing.
//!
//! The agent owns a unit file by writing a metadata header as its first line:
//! `# ngr-meta: ` followed by the compact JSON of the [`ServiceUnit`]. The
//! header is the sole ownership marker and the sole thing the parser reads;
//! the rest of an existing file is opaque.
//!
//! Rendering is pure: the same [`ServiceUnit`] always produces byte-identical
//! text, so callers compare content hashes to decide whether a rewrite (and a
//! daemon reload) is due at all.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::error;

use crate::config::ServiceUnit;

/// First-line marker of an agent-managed unit file.
pub const META_PREFIX: &str = "# ngr-meta: ";

/// File name suffix of service units.
pub const SERVICE_SUFFIX: &str = ".service";

/// Default systemd configuration directory.
pub const SYSTEMD_CONF_DIR: &str = "/etc/systemd/system";

/// Default directory for instance executables.
pub const EXEC_PREFIX: &str = "/opt/ngr";

/// Root for instance state directories.
pub const STATE_ROOT: &str = "/var/lib";

/// Errors around unit files on disk.
#[derive(Debug, Error)]
pub enum UnitError {
    /// A unit file could not be read.
    #[error("cannot read systemd conf file {path}: {source}")]
    Read {
        /// The offending file.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },

    /// A unit file is not valid UTF-8.
    #[error("invalid non-utf8 systemd conf file: {0}")]
    NotUtf8(PathBuf),

    /// The unit directory could not be listed.
    #[error("cannot find systemd conf files in {path}: {source}")]
    List {
        /// The directory that failed to list.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },

    /// The metadata header could not be serialized.
    #[error("failed to serialize unit metadata: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Renders a [`ServiceUnit`] to unit-file text.
///
/// The first line is the metadata header, then `[Unit]`, `[Service]` with
/// every non-zero field in a fixed order, and `[Install]`. Booleans render as
/// `yes`, durations in human-readable form, integers raw.
///
/// # Errors
///
/// Returns [`UnitError::Serialize`] when the metadata header cannot be
/// encoded, which would be a bug in the model itself.
pub fn render_unit(unit: &ServiceUnit) -> Result<String, UnitError> {
    let meta = serde_json::to_string(unit)?;

    let mut f = String::with_capacity(1024 + meta.len());
    f.push_str(META_PREFIX);
    f.push_str(&meta);
    f.push_str("\n\n");

    f.push_str("[Unit]\n");
    f.push_str("Description=");
    f.push_str(&unit.unit.description);
    f.push('\n');
    if !unit.unit.after.is_empty() {
        push_kv(&mut f, "After", &unit.unit.after);
    }
    f.push('\n');

    let s = &unit.service;
    f.push_str("[Service]\n");
    if !s.kind.is_empty() {
        push_kv(&mut f, "Type", &s.kind);
    }
    if !s.user.is_empty() {
        push_kv(&mut f, "User", &s.user);
    }
    if !s.group.is_empty() {
        push_kv(&mut f, "Group", &s.group);
    }
    if !s.bind_paths.is_empty() {
        push_kv(&mut f, "BindPaths", &s.bind_paths);
    }
    if !s.bind_read_only_paths.is_empty() {
        push_kv(&mut f, "BindReadOnlyPaths", &s.bind_read_only_paths);
    }
    if !s.read_only_paths.is_empty() {
        push_kv(&mut f, "ReadOnlyPaths", &s.read_only_paths);
    }
    if !s.inaccessible_paths.is_empty() {
        push_kv(&mut f, "InaccessiblePaths", &s.inaccessible_paths);
    }
    if !s.exec_paths.is_empty() {
        push_kv(&mut f, "ExecPaths", &s.exec_paths);
    }
    if !s.app_armor_profile.is_empty() {
        push_kv(&mut f, "AppArmorProfile", &s.app_armor_profile);
    }
    if !s.state_directory.is_empty() {
        push_kv(&mut f, "StateDirectory", &s.state_directory);
    }
    if !s.system_call_filter.is_empty() {
        push_kv(&mut f, "SystemCallFilter", &s.system_call_filter);
    }
    if s.private_tmp {
        f.push_str("PrivateTmp=yes\n");
    }
    if s.memory_deny_write_execute {
        f.push_str("MemoryDenyWriteExecute=yes\n");
    }
    if s.dynamic_user {
        f.push_str("DynamicUser=yes\n");
    }
    if s.no_new_privileges {
        f.push_str("NoNewPrivileges=yes\n");
    }
    if s.private_devices {
        f.push_str("PrivateDevices=yes\n");
    }
    if s.private_ipc {
        f.push_str("PrivateIPC=yes\n");
    }
    if s.private_pids {
        f.push_str("PrivatePIDs=yes\n");
    }
    if s.private_mounts {
        f.push_str("PrivateMounts=yes\n");
    }
    if s.private_network {
        f.push_str("PrivateNetwork=yes\n");
    }
    if !s.private_users.is_empty() {
        push_kv(&mut f, "PrivateUsers", &s.private_users);
    }
    if s.protect_kernel_modules {
        f.push_str("ProtectKernelModules=yes\n");
    }
    if s.protect_kernel_tunables {
        f.push_str("ProtectKernelTunables=yes\n");
    }
    if s.protect_clock {
        f.push_str("ProtectClock=yes\n");
    }
    if s.protect_kernel_logs {
        f.push_str("ProtectKernelLogs=yes\n");
    }
    if s.protect_hostname {
        f.push_str("ProtectHostname=yes\n");
    }
    if s.set_login_environment {
        f.push_str("SetLoginEnvironment=yes\n");
    }
    if s.restrict_suid_sgid {
        f.push_str("RestrictSUIDSGID=yes\n");
    }
    if s.restrict_realtime {
        f.push_str("RestrictRealtime=yes\n");
    }
    for ns in &s.restrict_namespaces {
        push_kv(&mut f, "RestrictNamespaces", ns);
    }
    if !s.protect_home.is_empty() {
        push_kv(&mut f, "ProtectHome", &s.protect_home);
    }
    if !s.protect_system.is_empty() {
        push_kv(&mut f, "ProtectSystem", &s.protect_system);
    }
    if !s.protect_control_groups.is_empty() {
        push_kv(&mut f, "ProtectControlGroups", &s.protect_control_groups);
    }
    if !s.protect_proc.is_empty() {
        push_kv(&mut f, "ProtectProc", &s.protect_proc);
    }
    f.push_str("ExecStart=");
    f.push_str(&s.exec_start.cmd);
    f.push(' ');
    f.push_str(&s.exec_start.args.join(" "));
    f.push('\n');
    for env in &s.environment {
        f.push_str("Environment=");
        f.push_str(&env.key);
        f.push('=');
        f.push_str(&env.value);
        f.push('\n');
    }
    for cap in &s.capability_bounding_set {
        push_kv(&mut f, "CapabilityBoundingSet", cap);
    }
    if !s.restart.is_empty() {
        push_kv(&mut f, "Restart", &s.restart);
    }
    if !s.restart_sec.is_zero() {
        push_kv(&mut f, "RestartSec", &humanize_duration(s.restart_sec.0));
    }
    if !s.memory_high.is_empty() {
        push_kv(&mut f, "MemoryHigh", &s.memory_high.0);
    }
    if !s.memory_swap_max.is_empty() {
        push_kv(&mut f, "MemorySwapMax", &s.memory_swap_max.0);
    }
    if !s.startup_memory_high.is_empty() {
        push_kv(&mut f, "StartupMemoryHigh", &s.startup_memory_high.0);
    }
    if !s.startup_memory_swap_max.is_empty() {
        push_kv(&mut f, "StartupMemorySwapMax", &s.startup_memory_swap_max.0);
    }
    if !s.oom_policy.is_empty() {
        push_kv(&mut f, "OOMPolicy", &s.oom_policy);
    }
    if s.oom_score_adjust != 0 {
        push_kv(&mut f, "OOMScoreAdjust", &s.oom_score_adjust.to_string());
    }
    if s.cpu_weight != 0 {
        push_kv(&mut f, "CPUWeight", &s.cpu_weight.to_string());
    }
    if s.cpu_quota != 0 {
        push_kv(&mut f, "CPUQuota", &s.cpu_quota.to_string());
    }
    for bits in &s.secure_bits {
        push_kv(&mut f, "SecureBits", bits);
    }
    for rule in &s.socket_bind_allow {
        push_kv(&mut f, "SocketBindAllow", rule);
    }
    for rule in &s.socket_bind_deny {
        push_kv(&mut f, "SocketBindDeny", rule);
    }
    if !s.kill_mode.is_empty() {
        push_kv(&mut f, "KillMode", &s.kill_mode);
    }
    if !s.kill_signal.is_empty() {
        push_kv(&mut f, "KillSignal", &s.kill_signal);
    }
    if !s.timeout_stop_sec.is_zero() {
        push_kv(
            &mut f,
            "TimeoutStopSec",
            &humanize_duration(s.timeout_stop_sec.0),
        );
    }

    f.push_str("[Install]\n");
    if !unit.install.wanted_by.is_empty() {
        push_kv(&mut f, "WantedBy", &unit.install.wanted_by);
    }

    Ok(f)
}

fn push_kv(buf: &mut String, key: &str, value: &str) {
    buf.push_str(key);
    buf.push('=');
    buf.push_str(value);
    buf.push('\n');
}

/// Formats a duration the way unit files expect it: `100ms`, `5s`, `1m30s`,
/// `1h0m0s`.
#[must_use]
pub fn humanize_duration(d: Duration) -> String {
    let total = d.as_nanos();
    if total == 0 {
        return "0s".to_string();
    }
    if total < 1_000 {
        return format!("{total}ns");
    }
    if total < 1_000_000 {
        return format!("{}\u{b5}s", with_fraction(total, 1_000, 3));
    }
    if total < 1_000_000_000 {
        return format!("{}ms", with_fraction(total, 1_000_000, 6));
    }

    let secs = total / 1_000_000_000;
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&hours.to_string());
        out.push('h');
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&minutes.to_string());
        out.push('m');
    }
    out.push_str(&with_fraction(total % 60_000_000_000, 1_000_000_000, 9));
    out.push('s');
    out
}

/// `total` in base units scaled down to `unit`, with up to `digits`
/// fractional digits and trailing zeros trimmed.
fn with_fraction(total: u128, unit: u128, digits: usize) -> String {
    let whole = total / unit;
    let frac = total % unit;
    if frac == 0 {
        return whole.to_string();
    }

    let mut frac_str = format!("{frac:0>digits$}");
    while frac_str.ends_with('0') {
        frac_str.pop();
    }
    format!("{whole}.{frac_str}")
}

/// A systemd service unit on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Service {
    /// Absolute path of the unit file.
    pub unit_filename: PathBuf,

    /// The declarative configuration recovered from the metadata header.
    pub configuration: ServiceUnit,

    /// True iff the metadata header is present and valid. Only managed
    /// services are ever mutated or deleted.
    pub managed: bool,
}

/// Derived filesystem locations of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePaths {
    /// Where the instance executable lives.
    pub exec_filename: PathBuf,

    /// Where the instance keeps its state.
    pub data_directory: PathBuf,
}

impl Service {
    /// A managed service handle without a configuration, addressed by name
    /// inside `unit_dir`.
    #[must_use]
    pub fn new(unit_dir: impl AsRef<Path>, name: &str) -> Self {
        Self {
            unit_filename: unit_dir.as_ref().join(format!("{name}{SERVICE_SUFFIX}")),
            configuration: ServiceUnit::default(),
            managed: true,
        }
    }

    /// Inspects a unit file and loads the embedded configuration if the file
    /// is managed.
    ///
    /// A missing or invalid metadata header classifies the file as
    /// unmanaged; only the header line is interpreted at all.
    ///
    /// # Errors
    ///
    /// Returns [`UnitError::Read`] or [`UnitError::NotUtf8`] when the file
    /// cannot be inspected in the first place.
    pub fn parse(filename: impl AsRef<Path>) -> Result<Self, UnitError> {
        let filename = filename.as_ref();
        let buf = fs::read(filename).map_err(|source| UnitError::Read {
            path: filename.to_path_buf(),
            source,
        })?;

        let Ok(text) = String::from_utf8(buf) else {
            return Err(UnitError::NotUtf8(filename.to_path_buf()));
        };

        let mut service = Self {
            unit_filename: filename.to_path_buf(),
            configuration: ServiceUnit::default(),
            managed: false,
        };

        for line in text.lines() {
            if let Some(meta) = line.strip_prefix(META_PREFIX) {
                match serde_json::from_str::<ServiceUnit>(meta) {
                    Ok(configuration) => {
                        service.managed = true;
                        service.configuration = configuration;
                    }
                    Err(err) => {
                        error!(
                            file = %filename.display(), %err,
                            "failed to parse managed systemd conf file"
                        );
                        break;
                    }
                }
            }
        }

        Ok(service)
    }

    /// The unit name: lowercase basename without the `.service` suffix.
    #[must_use]
    pub fn name(&self) -> String {
        let base = self
            .unit_filename
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        base.trim_end_matches(SERVICE_SUFFIX).to_string()
    }

    /// Derived paths using the production roots `/opt/ngr` and `/var/lib`.
    #[must_use]
    pub fn paths(&self) -> ServicePaths {
        self.paths_in(Path::new(EXEC_PREFIX), Path::new(STATE_ROOT))
    }

    /// Derived paths below the given roots.
    ///
    /// The executable defaults to `<exec_dir>/<name>` unless
    /// `Service.ExecStart.Cmd` points elsewhere. The data directory defaults
    /// to `<state_root>/ngr/<name>`; a declared `StateDirectory` must be
    /// relative and is rooted at `<state_root>`.
    #[must_use]
    pub fn paths_in(&self, exec_dir: &Path, state_root: &Path) -> ServicePaths {
        let mut paths = ServicePaths {
            exec_filename: exec_dir.join(self.name()),
            data_directory: state_root.join("ngr").join(self.name()),
        };

        let service = &self.configuration.service;
        if !service.exec_start.cmd.is_empty() {
            paths.exec_filename = PathBuf::from(&service.exec_start.cmd);
        }

        if !service.state_directory.is_empty() {
            let relative = service.state_directory.trim_start_matches('/');
            paths.data_directory = state_root.join(relative);
        }

        paths
    }
}

/// Inspects all service files in `unit_dir`.
///
/// Only regular files with the `.service` suffix are considered.
///
/// # Errors
///
/// Returns [`UnitError::List`] when the directory cannot be read and the
/// per-file errors of [`Service::parse`].
pub fn find_services(unit_dir: impl AsRef<Path>) -> Result<Vec<Service>, UnitError> {
    let unit_dir = unit_dir.as_ref();
    let entries = fs::read_dir(unit_dir).map_err(|source| UnitError::List {
        path: unit_dir.to_path_buf(),
        source,
    })?;

    let mut services = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| UnitError::List {
            path: unit_dir.to_path_buf(),
            source,
        })?;

        let is_regular = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_regular || !name.ends_with(SERVICE_SUFFIX) {
            continue;
        }

        services.push(Service::parse(entry.path())?);
    }

    Ok(services)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::config::{
        CommandLine, DurationNanos, EnvVar, InstallSection, Memory, ServiceSection, UnitSection,
    };

    fn sample_unit() -> ServiceUnit {
        ServiceUnit {
            unit: UnitSection {
                description: "svc a".into(),
                after: "network-online.target".into(),
            },
            install: InstallSection {
                wanted_by: "multi-user.target".into(),
            },
            service: ServiceSection {
                kind: "exec".into(),
                dynamic_user: true,
                private_tmp: true,
                no_new_privileges: true,
                protect_system: "strict".into(),
                protect_home: "yes".into(),
                state_directory: "ngr/svc-a".into(),
                restrict_namespaces: vec!["~user".into(), "net".into()],
                exec_start: CommandLine {
                    cmd: "/opt/ngr/svc-a".into(),
                    args: vec!["--port".into(), "8080".into()],
                },
                environment: vec![EnvVar {
                    key: "PORT".into(),
                    value: "8080".into(),
                }],
                restart: "always".into(),
                restart_sec: DurationNanos::from_secs(5),
                memory_high: Memory("512M".into()),
                cpu_weight: 100,
                kill_mode: "control-group".into(),
                kill_signal: "SIGTERM".into(),
                timeout_stop_sec: DurationNanos::from_secs(90),
                ..ServiceSection::default()
            },
        }
    }

    #[test]
    fn rendering_is_deterministic() {
        let unit = sample_unit();
        assert_eq!(render_unit(&unit).unwrap(), render_unit(&unit).unwrap());
    }

    #[test]
    fn rendered_text_has_the_fixed_shape() {
        let text = render_unit(&sample_unit()).unwrap();

        assert!(text.starts_with(META_PREFIX), "missing meta header");
        let body: Vec<&str> = text.lines().collect();
        assert_eq!(body[1], "");
        assert_eq!(body[2], "[Unit]");
        assert_eq!(body[3], "Description=svc a");
        assert_eq!(body[4], "After=network-online.target");

        assert!(text.contains("\n[Service]\nType=exec\n"));
        assert!(text.contains("ExecStart=/opt/ngr/svc-a --port 8080\n"));
        assert!(text.contains("Environment=PORT=8080\n"));
        assert!(text.contains("RestartSec=5s\n"));
        assert!(text.contains("TimeoutStopSec=1m30s\n"));
        assert!(text.contains("RestrictNamespaces=~user\nRestrictNamespaces=net\n"));
        assert!(text.ends_with("[Install]\nWantedBy=multi-user.target\n"));

        // booleans render as yes, and only when set
        assert!(text.contains("DynamicUser=yes\n"));
        assert!(!text.contains("PrivateNetwork"));
    }

    #[test]
    fn meta_header_round_trips() {
        let unit = sample_unit();
        let text = render_unit(&unit).unwrap();

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("svc-a.service");
        fs::write(&path, &text).unwrap();

        let parsed = Service::parse(&path).unwrap();
        assert!(parsed.managed);
        assert_eq!(parsed.configuration, unit);
        assert_eq!(parsed.name(), "svc-a");
    }

    #[test]
    fn files_without_header_stay_unmanaged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("foo.service");
        fs::write(&path, "[Unit]\nDescription=hand written\n").unwrap();

        let parsed = Service::parse(&path).unwrap();
        assert!(!parsed.managed);
        assert_eq!(parsed.configuration, ServiceUnit::default());
    }

    #[test]
    fn files_with_broken_header_stay_unmanaged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.service");
        fs::write(&path, format!("{META_PREFIX}{{not json]]\n[Unit]\n")).unwrap();

        let parsed = Service::parse(&path).unwrap();
        assert!(!parsed.managed);
    }

    #[test]
    fn default_paths_follow_the_instance_name() {
        let service = Service::new("/etc/systemd/system", "svc-a");
        let paths = service.paths();
        assert_eq!(paths.exec_filename, PathBuf::from("/opt/ngr/svc-a"));
        assert_eq!(paths.data_directory, PathBuf::from("/var/lib/ngr/svc-a"));
    }

    #[test]
    fn exec_start_and_state_directory_override_paths() {
        let mut service = Service::new("/etc/systemd/system", "svc-a");
        service.configuration.service.exec_start.cmd = "/usr/local/bin/custom".into();
        service.configuration.service.state_directory = "custom/state".into();

        let paths = service.paths();
        assert_eq!(paths.exec_filename, PathBuf::from("/usr/local/bin/custom"));
        assert_eq!(paths.data_directory, PathBuf::from("/var/lib/custom/state"));
    }

    #[test]
    fn find_services_skips_non_service_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.service"), "[Unit]\n").unwrap();
        fs::write(dir.path().join("b.timer"), "[Timer]\n").unwrap();
        fs::create_dir(dir.path().join("sub.service")).unwrap();

        let services = find_services(dir.path()).unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name(), "a");
    }

    #[test]
    fn durations_render_in_human_form() {
        assert_eq!(humanize_duration(Duration::ZERO), "0s");
        assert_eq!(humanize_duration(Duration::from_nanos(500)), "500ns");
        assert_eq!(humanize_duration(Duration::from_micros(1500)), "1.5ms");
        assert_eq!(humanize_duration(Duration::from_millis(100)), "100ms");
        assert_eq!(humanize_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(humanize_duration(Duration::from_secs(5)), "5s");
        assert_eq!(humanize_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(humanize_duration(Duration::from_secs(3600)), "1h0m0s");
        assert_eq!(humanize_duration(Duration::from_secs(3725)), "1h2m5s");
    }
}
