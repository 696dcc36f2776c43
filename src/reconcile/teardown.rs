//! Reverse of a pass; every step is best-effort

use super::Pass;

/// Re-read `name`, keeping the previous observation if that fails
async fn reobserve(pass: &mut Pass<'_>, name: &str) {
    if let Ok(Ok(observed)) = pass.call("observe", pass.net.interface(name)).await {
        pass.state.update(name, observed);
    }
}

pub(super) async fn run(pass: &mut Pass<'_>) {
    let config = pass.config;
    let net = pass.net;
    let i = &config.interfaces;
    let mesh = i.mesh_iface.as_str();

    if let Some(observed) = pass.iface(mesh).cloned() {
        pass.best_effort("stop mesh supplicant", mesh, net.stop_mesh_supplicant(mesh))
            .await;
        if observed.mesh.is_some() {
            pass.best_effort("leave mesh", mesh, net.mesh_leave(mesh)).await;
        }
        if !observed.addresses.is_empty() {
            pass.best_effort("flush addresses", mesh, net.flush_addresses(mesh))
                .await;
        }
        if observed.master.is_some() {
            pass.best_effort("release mesh", mesh, net.clear_master(mesh)).await;
        }
        if mesh != i.mesh_phy_iface {
            pass.best_effort("delete mesh interface", mesh, net.delete_interface(mesh))
                .await;
        } else if observed.up {
            pass.best_effort("mesh down", mesh, net.set_link(mesh, false)).await;
        }
        reobserve(pass, mesh).await;
    } else {
        pass.converged("delete mesh interface", mesh);
    }

    let bat = i.batman_iface.as_str();
    if pass.iface(bat).is_some() {
        pass.best_effort("delete batman", bat, net.delete_interface(bat)).await;
        reobserve(pass, bat).await;
    } else {
        pass.converged("delete batman", bat);
    }

    let br = i.bridge_name.as_str();
    if pass.iface(br).is_some() {
        for member in pass.state.members_of(br) {
            pass.best_effort("release bridge member", &member, net.clear_master(&member))
                .await;
        }
        pass.best_effort("delete bridge", br, net.delete_interface(br)).await;
    } else {
        pass.converged("delete bridge", br);
    }

    let eth = i.eth_iface.as_str();
    if pass.iface(eth).is_some_and(|o| !o.up) {
        pass.best_effort("uplink up", eth, net.set_link(eth, true)).await;
    }

    for (_, name) in config.interface_bindings() {
        reobserve(pass, name).await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::{MeshPhase, ReconcileTiming, Reconciler, StepOutcome};
    use crate::config::ReconcileSettings;
    use crate::netops::fake::FakeNet;
    use crate::node_config::test_config;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn reconciler(net: Arc<FakeNet>) -> Reconciler {
        Reconciler::new(
            net,
            ReconcileTiming::from(&ReconcileSettings::default()),
            PathBuf::from("/tmp"),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_after_converge_removes_everything() {
        let net = Arc::new(FakeNet::new());
        let reconciler = reconciler(net.clone());
        let config = test_config();
        reconciler.reconcile(&config).await.unwrap();

        let report = reconciler.teardown(&config).await;
        assert_eq!(report.phase, MeshPhase::Absent);
        assert_eq!(report.warnings().count(), 0);
        assert!(net.iface("mesh0").is_none());
        assert!(net.iface("bat0").is_none());
        assert!(net.iface("br0").is_none());

        let eth = net.iface("eth0").unwrap();
        assert!(eth.up);
        assert_eq!(eth.master, None);
        assert!(net.iface("wlan1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_from_scratch_is_a_no_op() {
        let net = Arc::new(FakeNet::new());
        let report = reconciler(net.clone()).teardown(&test_config()).await;

        assert_eq!(report.mutations(), 0);
        assert!(net.calls().is_empty());
        assert!(report
            .steps
            .iter()
            .all(|s| s.outcome == StepOutcome::AlreadyConverged));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_recorded_and_teardown_continues() {
        let net = Arc::new(FakeNet::new());
        let reconciler = reconciler(net.clone());
        let config = test_config();
        reconciler.reconcile(&config).await.unwrap();
        net.state().failing_ops.insert("stop_mesh_supplicant");

        let report = reconciler.teardown(&config).await;
        let warnings: Vec<_> = report.warnings().collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].step, "stop mesh supplicant");
        assert!(net.iface("mesh0").is_none());
        assert!(net.iface("br0").is_none());
    }
}
