//! Service-manager operations behind a seam.
//!
//! The agent never talks to systemd directly beyond invoking `systemctl`; the
//! [`ServiceManager`] trait is the seam the reconciler, the backup engine and
//! the install bootstrap go through. Production shells out, test doubles
//! record the invocations instead.

use async_trait::async_trait;

use crate::runcmd::{self, CommandError};

/// The service-manager verbs the agent needs.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Reload unit definitions after files changed.
    async fn daemon_reload(&self) -> Result<(), CommandError>;

    /// Enable a unit for boot.
    async fn enable(&self, unit: &str) -> Result<(), CommandError>;

    /// Restart a unit.
    async fn restart(&self, unit: &str) -> Result<(), CommandError>;

    /// Start a unit.
    async fn start(&self, unit: &str) -> Result<(), CommandError>;

    /// Stop a unit.
    async fn stop(&self, unit: &str) -> Result<(), CommandError>;

    /// Ask a unit to reload its own configuration.
    async fn reload(&self, unit: &str) -> Result<(), CommandError>;
}

/// Production [`ServiceManager`] shelling out to `systemctl`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Systemctl;

#[async_trait]
impl ServiceManager for Systemctl {
    async fn daemon_reload(&self) -> Result<(), CommandError> {
        runcmd::command("systemctl", &["daemon-reload"]).await
    }

    async fn enable(&self, unit: &str) -> Result<(), CommandError> {
        runcmd::command("systemctl", &["enable", unit]).await
    }

    async fn restart(&self, unit: &str) -> Result<(), CommandError> {
        runcmd::command("systemctl", &["restart", unit]).await
    }

    async fn start(&self, unit: &str) -> Result<(), CommandError> {
        runcmd::command("systemctl", &["start", unit]).await
    }

    async fn stop(&self, unit: &str) -> Result<(), CommandError> {
        runcmd::command("systemctl", &["stop", unit]).await
    }

    async fn reload(&self, unit: &str) -> Result<(), CommandError> {
        runcmd::command("systemctl", &["reload", unit]).await
    }
}
