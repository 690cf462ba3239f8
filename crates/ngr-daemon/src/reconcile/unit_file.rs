//! Unit-file convergence.

use anyhow::Context as _;
use ngr_core::config::Application;
use ngr_core::hashio;
use ngr_core::unit::{render_unit, SERVICE_SUFFIX};
use tracing::info;

use super::Reconciler;

impl Reconciler {
    /// Regenerates the unit file of one application and rewrites it only when
    /// the rendered bytes differ from what is on disk.
    ///
    /// This function never issues reload, enable or restart; those are
    /// batched by the surrounding pass.
    pub(crate) fn update_unit(&self, app: &Application) -> anyhow::Result<bool> {
        let rendered = render_unit(&app.sandbox.unit)?;
        let unit_path = self
            .layout
            .unit_dir
            .join(format!("{}{SERVICE_SUFFIX}", app.inst_id));

        let current = hashio::sha3_file(&unit_path)
            .with_context(|| format!("failed to hash {}", unit_path.display()))?;
        let expected = hashio::sha3_bytes(rendered.as_bytes());

        if current == expected {
            info!(expected = %expected, file = %unit_path.display(),
                  "systemd service unit file unchanged");
            return Ok(false);
        }

        info!(expected = %expected, actual = %current,
              "systemd service unit file expected hash does not match the current hash");

        hashio::write_file(&unit_path, rendered.as_bytes(), 0o644)
            .with_context(|| format!("failed to update {}", unit_path.display()))?;

        Ok(true)
    }
}
