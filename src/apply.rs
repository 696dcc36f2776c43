//! Bring the running node in line with a (new) NodeConfig
//!
//! Shared by `meshctl configure`, `meshctl init` and the daemon's reload:
//! render, bounce the daemons whose configs changed, then reconcile.

use crate::config::MeshctlConfig;
use crate::error::{MeshResult, ReconcileError};
use crate::netops::NetOps;
use crate::node_config::NodeConfig;
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::render;
use crate::supervisor::{self, RestartOutcome, RestartPlan, ServiceSupervisor};
use tracing::{info, warn};

#[derive(Debug)]
pub struct ApplyOutcome {
    /// Daemons whose rendered config changed
    pub changed: Vec<String>,
    pub restart: RestartOutcome,
    pub reconcile: Result<ReconcileReport, ReconcileError>,
}

impl ApplyOutcome {
    pub fn succeeded(&self) -> bool {
        self.reconcile.is_ok()
    }
}

/// Render, restart what changed, reconcile
///
/// Render errors return early with nothing touched. Restart failures are
/// warnings. The reconcile result is reported, not propagated, so callers
/// can show restart warnings alongside it.
pub async fn apply_config(
    config: &NodeConfig,
    settings: &MeshctlConfig,
    net: &dyn NetOps,
    supervisor: &dyn ServiceSupervisor,
    reconciler: &Reconciler,
) -> MeshResult<ApplyOutcome> {
    let rendered = render::apply(config, &settings.paths.render_dir)?;

    if rendered.changed.iter().any(|d| d == render::WPA_SUPPLICANT) {
        // the running supplicant holds the old mesh credentials
        let mesh = &config.interfaces.mesh_iface;
        if let Err(e) = net.stop_mesh_supplicant(mesh).await {
            warn!("Failed to stop mesh supplicant on {}: {}", mesh, e);
        }
    }

    let plan = RestartPlan::for_change(&settings.services, config, &rendered.changed);
    let restart = supervisor::execute(&plan, supervisor).await;

    let reconcile = reconciler.reconcile(config).await;
    match &reconcile {
        Ok(report) => info!(
            "Applied configuration: {} file(s) changed, {} unit(s) restarted, {} mutation(s)",
            rendered.changed.len(),
            restart.restarted.len(),
            report.mutations()
        ),
        Err(e) => warn!("Configuration applied but reconcile failed: {}", e),
    }

    Ok(ApplyOutcome {
        changed: rendered.changed,
        restart,
        reconcile,
    })
}
