//! Filesystem layout the agent operates on.

use std::path::PathBuf;
use std::time::Duration;

use ngr_core::unit;

/// The host directories and timing knobs of one agent instance.
///
/// Production uses [`Layout::default`]; tests point the roots at temporary
/// directories.
#[derive(Debug, Clone)]
pub struct Layout {
    /// Where the service manager expects unit files.
    pub unit_dir: PathBuf,

    /// Where instance executables live.
    pub exec_dir: PathBuf,

    /// Root of instance state directories (`/var/lib`).
    pub state_root: PathBuf,

    /// The reverse-proxy configuration file.
    pub caddyfile: PathBuf,

    /// Grace period after `stop` before touching an instance's data.
    pub quiesce_wait: Duration,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            unit_dir: PathBuf::from(unit::SYSTEMD_CONF_DIR),
            exec_dir: PathBuf::from(unit::EXEC_PREFIX),
            state_root: PathBuf::from(unit::STATE_ROOT),
            caddyfile: PathBuf::from("/etc/caddy/Caddyfile"),
            quiesce_wait: Duration::from_secs(15),
        }
    }
}

impl Layout {
    /// The executable path of an instance.
    #[must_use]
    pub fn exec_file(&self, instance_id: &str) -> PathBuf {
        self.exec_dir.join(instance_id)
    }

    /// The conventional data directory of an instance.
    ///
    /// This is the `/var/lib/ngr/<instance>` convention; services that
    /// override their state directory are resolved through
    /// [`ngr_core::Service::paths_in`] instead.
    #[must_use]
    pub fn data_dir(&self, instance_id: &str) -> PathBuf {
        self.state_root.join("ngr").join(instance_id)
    }
}
