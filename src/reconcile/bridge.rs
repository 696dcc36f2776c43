//! LAN bridge, batman-adv layer and LAN addressing

use super::{Pass, StepOutcome};
use crate::batman::BatmanParams;
use crate::error::{ConfigError, ReconcileError};
use crate::state::IfAddr;
use std::net::IpAddr;

/// Bridge exists and is up, with the wired uplink enslaved when present
pub(super) async fn ensure_bridge(pass: &mut Pass<'_>) -> Result<(), ReconcileError> {
    const STEP: &str = "bridge";
    pass.check_deadline(STEP)?;

    let config = pass.config;
    let net = pass.net;
    let br = config.interfaces.bridge_name.as_str();
    let eth = config.interfaces.eth_iface.as_str();

    if pass.iface(br).is_some() {
        pass.converged(STEP, br);
    } else {
        pass.apply(STEP, br, net.create_bridge(br)).await?;
        pass.wait_for_interface(STEP, br).await?;
    }
    pass.ensure_up("bridge up", br).await?;

    if pass.iface(eth).is_none() {
        pass.record(
            "bridge member",
            eth,
            StepOutcome::Informational("not present, bridge has no wired port".to_string()),
        );
        return Ok(());
    }
    pass.ensure_master("bridge member", eth, br).await?;
    pass.ensure_up("uplink up", eth).await
}

/// bat0 exists, carries the mesh interface, has the configured tunables and
/// sits in the bridge
pub(super) async fn ensure_batman(pass: &mut Pass<'_>) -> Result<(), ReconcileError> {
    const STEP: &str = "batman";
    pass.check_deadline(STEP)?;

    let config = pass.config;
    let net = pass.net;
    let bat = config.interfaces.batman_iface.as_str();
    let mesh = config.interfaces.mesh_iface.as_str();
    let br = config.interfaces.bridge_name.as_str();
    let params = BatmanParams::from_node(config)
        .map_err(|e| ReconcileError::Config(ConfigError::from(e)))?;

    if pass.iface(bat).is_some() {
        pass.converged(STEP, bat);
    } else {
        pass.apply(STEP, bat, net.create_batman(bat)).await?;
        pass.wait_for_interface(STEP, bat).await?;
    }
    pass.ensure_master("batman hard interface", mesh, bat).await?;

    for (key, value) in params.tunables() {
        let current = pass
            .call(STEP, net.batman_setting(bat, key))
            .await?
            .ok()
            .flatten();
        if current.as_deref() == Some(value.as_str()) {
            pass.converged("batman setting", key);
            continue;
        }
        // older batctl builds lack some knobs
        pass.best_effort("batman setting", key, net.set_batman_setting(bat, key, &value))
            .await;
    }

    pass.ensure_up("batman up", bat).await?;
    pass.ensure_master("bridge member", bat, br).await
}

/// Gateway, dashboard and management addresses on the bridge
pub(super) async fn ensure_lan_addresses(pass: &mut Pass<'_>) -> Result<(), ReconcileError> {
    const STEP: &str = "lan address";
    let config = pass.config;
    let br = config.interfaces.bridge_name.as_str();
    let to_config = |e| ReconcileError::Config(ConfigError::from(e));

    let gateway = config.lan_gateway().map_err(to_config)?;
    pass.ensure_address(STEP, br, gateway.into()).await?;

    if let Some(ui) = config.ui_cidr() {
        pass.ensure_address("ui address", br, ui.into()).await?;
    }
    if let Some(mgmt) = config.mgmt_cidr().map_err(to_config)? {
        pass.ensure_address("management address", br, mgmt.into()).await?;
    }
    Ok(())
}

/// Drop LAN-side IPv4 addresses left on the wired uplink
///
/// They belong on the bridge; a copy on the enslaved port breaks ARP for
/// the whole LAN.
pub(super) async fn clear_uplink_addresses(pass: &mut Pass<'_>) {
    const STEP: &str = "uplink address";
    let config = pass.config;
    let net = pass.net;
    let eth = config.interfaces.eth_iface.as_str();

    let Ok(subnet) = config.lan_subnet() else {
        return;
    };
    let ui = config.ui_cidr().map(|c| c.addr);
    let mgmt = config.mgmt_cidr().ok().flatten().map(|c| c.addr);

    let stray: Vec<IfAddr> = match pass.iface(eth) {
        Some(iface) => iface
            .ipv4_addresses()
            .filter(|a| match a.addr {
                IpAddr::V4(v4) => subnet.contains(v4) || Some(v4) == ui || Some(v4) == mgmt,
                IpAddr::V6(_) => false,
            })
            .copied()
            .collect(),
        None => return,
    };
    if stray.is_empty() {
        return;
    }

    for addr in &stray {
        pass.best_effort(STEP, eth, net.del_address(eth, addr)).await;
    }
    if let Err(e) = pass.refresh(STEP, eth).await {
        pass.record(STEP, eth, StepOutcome::BestEffortFailed(e.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ReconcileTiming, Reconciler};
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
    async fn bridge_without_wired_port() {
        let net = Arc::new(FakeNet::new());
        net.state().interfaces.remove("eth0");

        let report = reconciler(net.clone()).reconcile(&test_config()).await.unwrap();
        assert!(net.iface("br0").unwrap().up);
        assert!(report
            .steps
            .iter()
            .any(|s| s.target == "eth0" && s.step == "bridge member"));
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_batman_knob_is_a_warning() {
        let net = Arc::new(FakeNet::new());
        net.state().failing_ops.insert("set_batman_setting");

        let report = reconciler(net.clone()).reconcile(&test_config()).await.unwrap();
        assert!(report.warnings().count() > 0);
        assert!(report.warnings().all(|w| w.step == "batman setting"));
        assert_eq!(net.iface("bat0").unwrap().master.as_deref(), Some("br0"));
    }

    #[tokio::test(start_paused = true)]
    async fn drifted_batman_setting_is_restored() {
        let net = Arc::new(FakeNet::new());
        let reconciler = reconciler(net.clone());
        reconciler.reconcile(&test_config()).await.unwrap();

        net.state()
            .batman_settings
            .insert(("bat0".to_string(), "orig_interval".to_string()), "5000".to_string());
        net.clear_calls();
        reconciler.reconcile(&test_config()).await.unwrap();

        assert_eq!(net.calls(), vec!["set_batman_setting bat0 orig_interval 1000"]);
    }

    #[tokio::test(start_paused = true)]
    async fn management_address_lands_on_bridge() {
        let net = Arc::new(FakeNet::new());
        let mut config = test_config();
        config.addressing.mgmt_address = Some("172.16.5.10".parse().unwrap());
        config.addressing.mgmt_prefix = Some(24);

        reconciler(net.clone()).reconcile(&config).await.unwrap();
        assert!(net
            .iface("br0")
            .unwrap()
            .has_address(&"172.16.5.10/24".parse().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn unrelated_uplink_address_is_kept() {
        let net = Arc::new(FakeNet::new());
        net.state()
            .interfaces
            .get_mut("eth0")
            .unwrap()
            .addresses
            .push("203.0.113.7/24".parse().unwrap());

        reconciler(net.clone()).reconcile(&test_config()).await.unwrap();
        assert!(net
            .iface("eth0")
            .unwrap()
            .has_address(&"203.0.113.7/24".parse().unwrap()));
        assert!(!net.calls().iter().any(|c| c.starts_with("del_address")));
    }
}
