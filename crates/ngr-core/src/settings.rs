//! Agent settings and derived control-plane endpoints.
//!
//! The settings file carries just the control-plane URL and the bearer token
//! of this runner. Everything else — websocket endpoint, configuration
//! endpoint, blob API base — is derived from the URL.

use serde::{Deserialize, Serialize};
use tracing::error;

/// Persisted agent settings, usually at `/etc/nago-runner/config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Control-plane URL, e.g. `wss://hub.example.com/api/v1/runner`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,

    /// Bearer token authorizing this runner.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub token: String,
}

impl Settings {
    /// The control-plane endpoints derived from [`Settings::url`].
    ///
    /// An unparsable URL yields empty endpoints and an error log, matching
    /// the "never crash over one bad value" policy for settings.
    #[must_use]
    pub fn endpoints(&self) -> Endpoints {
        let Some((scheme, rest)) = self.url.split_once("://") else {
            error!(url = %self.url, "invalid settings, unable to parse URL");
            return Endpoints::default();
        };

        let authority = rest.split('/').next().unwrap_or_default();
        let (host, port_str) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        };

        let scheme = scheme.to_ascii_lowercase();
        let ssl = scheme == "wss" || scheme == "https";

        let mut port = match port_str {
            None => 0,
            Some(p) => match p.parse::<u16>() {
                Ok(p) => p,
                Err(_) => {
                    error!(url = %self.url, "invalid settings, unable to parse port");
                    0
                }
            },
        };
        if port == 0 {
            port = if ssl { 443 } else { 80 };
        }

        let ws_scheme = if ssl { "wss" } else { "ws" };
        let http_scheme = if ssl { "https" } else { "http" };

        Endpoints {
            ssl,
            host: host.to_string(),
            port,
            runner_websocket: format!("{ws_scheme}://{host}:{port}/api/v1/runner"),
            runner_configuration: format!("{http_scheme}://{host}:{port}/api/v1/configuration/runner"),
        }
    }
}

/// Concrete control-plane endpoints for one settings value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoints {
    /// Whether TLS is in play.
    pub ssl: bool,

    /// Control-plane host.
    pub host: String,

    /// Control-plane port, defaulted to 443 (TLS) or 80.
    pub port: u16,

    /// The persistent runner websocket.
    pub runner_websocket: String,

    /// The runner configuration document.
    pub runner_configuration: String,
}

impl Endpoints {
    /// Resolves a relative path against the control-plane HTTP base.
    #[must_use]
    pub fn http(&self, relative: &str) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!(
            "{scheme}://{}:{}/{}",
            self.host,
            self.port,
            relative.trim_start_matches('/')
        )
    }
}
