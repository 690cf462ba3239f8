//! Reverse-proxy configuration.
//!
//! Renders one Caddyfile from all declared reverse-proxy rules, writes it
//! atomically and asks the proxy to reload only when the file actually
//! changed. The renderer is pure; the reload is the only side effect.

use std::sync::Arc;

use anyhow::Context as _;
use ngr_core::config::Runner;
use ngr_core::hashio;
use tracing::{info, warn};

use crate::layout::Layout;
use crate::runcmd;
use crate::sysmgr::ServiceManager;

/// Converges the reverse-proxy front-end.
pub struct ProxyReconciler {
    layout: Layout,
    svc: Arc<dyn ServiceManager>,
}

impl ProxyReconciler {
    /// A proxy reconciler writing to `layout.caddyfile`.
    #[must_use]
    pub fn new(layout: Layout, svc: Arc<dyn ServiceManager>) -> Self {
        Self { layout, svc }
    }

    /// Renders, writes and (on change) reloads the proxy configuration.
    ///
    /// # Errors
    ///
    /// Returns write failures and reload failures; a missing proxy binary is
    /// only warned about, the configuration is still materialized.
    pub async fn apply(&self, cfg: &Runner) -> anyhow::Result<()> {
        match runcmd::which("caddy").await {
            Ok(Some(_)) => {}
            Ok(None) => warn!("caddy executable not found in $PATH"),
            Err(err) => warn!(%err, "cannot probe for caddy executable"),
        }

        let rendered = render_caddyfile(cfg);

        let current = hashio::sha3_file(&self.layout.caddyfile)
            .with_context(|| format!("failed to hash {}", self.layout.caddyfile.display()))?;
        if current == hashio::sha3_bytes(rendered.as_bytes()) {
            info!("caddy configuration is up to date");
            return Ok(());
        }

        hashio::write_file(&self.layout.caddyfile, rendered.as_bytes(), 0o644)
            .with_context(|| format!("cannot update {}", self.layout.caddyfile.display()))?;

        self.svc
            .reload("caddy")
            .await
            .context("error reloading caddy")?;

        Ok(())
    }
}

/// Renders the full proxy configuration for all applications.
///
/// Pure: the same configuration always yields byte-identical text. Rules
/// appear in declaration order, one site block per rule.
#[must_use]
pub fn render_caddyfile(cfg: &Runner) -> String {
    let mut out = String::from("# Caddyfile generated by nago-runner, do not edit\n");

    for app in &cfg.applications {
        if !app.reverse_proxy.enabled {
            continue;
        }

        for rule in &app.reverse_proxy.rules {
            if rule.location.is_empty() {
                continue;
            }

            out.push('\n');
            out.push_str(&rule.location);
            out.push_str(" {\n");
            if rule.redirect {
                out.push_str(&format!("\tredir {}\n", rule.redirect_target));
            } else {
                out.push_str(&format!("\treverse_proxy {}:{}\n", rule.host, rule.port));
            }
            out.push_str("}\n");
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use std::fs;

    use ngr_core::config::{Application, ReverseProxy, Rule};
    use tempfile::TempDir;

    use super::*;
    use crate::sysmgr::testing::Recording;

    fn runner_with_rules(rules: Vec<Rule>) -> Runner {
        Runner {
            applications: vec![Application {
                inst_id: "svc-a".into(),
                reverse_proxy: ReverseProxy {
                    enabled: true,
                    rules,
                },
                ..Application::default()
            }],
        }
    }

    #[test]
    fn proxy_and_redirect_rules_render() {
        let cfg = runner_with_rules(vec![
            Rule {
                location: "svc-a.example.com".into(),
                host: "127.0.0.1".into(),
                port: 8080,
                ..Rule::default()
            },
            Rule {
                location: "old.example.com".into(),
                redirect: true,
                redirect_target: "https://svc-a.example.com".into(),
                ..Rule::default()
            },
        ]);

        let text = render_caddyfile(&cfg);
        assert!(text.contains("svc-a.example.com {\n\treverse_proxy 127.0.0.1:8080\n}\n"));
        assert!(text.contains("old.example.com {\n\tredir https://svc-a.example.com\n}\n"));
        assert_eq!(text, render_caddyfile(&cfg), "renderer must be pure");
    }

    #[test]
    fn disabled_apps_render_nothing() {
        let mut cfg = runner_with_rules(vec![Rule {
            location: "svc-a.example.com".into(),
            host: "127.0.0.1".into(),
            port: 8080,
            ..Rule::default()
        }]);
        cfg.applications[0].reverse_proxy.enabled = false;

        let text = render_caddyfile(&cfg);
        assert!(!text.contains("svc-a.example.com"));
    }

    #[tokio::test]
    async fn reload_fires_only_on_change() {
        let dir = TempDir::new().unwrap();
        let layout = Layout {
            caddyfile: dir.path().join("Caddyfile"),
            ..Layout::default()
        };
        let svc = Arc::new(Recording::default());
        let proxy = ProxyReconciler::new(layout.clone(), Arc::clone(&svc) as _);

        let cfg = runner_with_rules(vec![Rule {
            location: "svc-a.example.com".into(),
            host: "127.0.0.1".into(),
            port: 8080,
            ..Rule::default()
        }]);

        proxy.apply(&cfg).await.unwrap();
        assert!(fs::read_to_string(&layout.caddyfile)
            .unwrap()
            .contains("reverse_proxy"));
        assert_eq!(svc.count("reload caddy"), 1);

        // unchanged configuration must not reload again
        proxy.apply(&cfg).await.unwrap();
        assert_eq!(svc.count("reload caddy"), 1);
    }
}
