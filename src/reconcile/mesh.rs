//! Mesh interface phases: regulatory domain, creation, join, addressing

use super::{Pass, StepOutcome};
use crate::addressing;
use crate::error::{ConfigError, ReconcileError, RenderError};
use crate::node_config::NodeConfig;
use crate::render::MESH_SUPPLICANT_FILE;
use crate::state::IfAddr;
use crate::wifi::MeshJoinParams;
use std::net::IpAddr;
use tracing::warn;

fn config_error(err: RenderError) -> ReconcileError {
    ReconcileError::Config(ConfigError::from(err))
}

/// Join arguments for the configured mesh
pub fn join_params(config: &NodeConfig) -> Result<MeshJoinParams, RenderError> {
    let mesh_id = config
        .mesh
        .ssid
        .clone()
        .ok_or_else(|| RenderError::missing("mesh.ssid"))?;
    Ok(MeshJoinParams {
        mesh_id,
        frequency: config.mesh_frequency()?,
        beacon_interval: config.mesh.beacon_interval,
        forwarding: config.mesh.forwarding,
        root_mode: config.mesh.root_mode,
    })
}

pub(super) async fn ensure_regdomain(pass: &mut Pass<'_>) -> Result<(), ReconcileError> {
    const STEP: &str = "regulatory domain";
    pass.check_deadline(STEP)?;

    let country = pass.config.country_code().map_err(config_error)?;
    if pass.state.regdomain.as_deref() == Some(country.as_str()) {
        pass.converged(STEP, &country);
        return Ok(());
    }

    let net = pass.net;
    // self-managed radios refuse a global domain; the join still works
    pass.best_effort(STEP, &country, net.set_regdomain(&country)).await;
    pass.state.regdomain = pass.call(STEP, net.regdomain()).await?.ok().flatten();
    Ok(())
}

/// PHY to create the mesh interface on
async fn select_phy(pass: &Pass<'_>, step: &str) -> Result<String, ReconcileError> {
    let i = &pass.config.interfaces;
    let phys = pass
        .call(step, pass.net.phys())
        .await?
        .map_err(|e| ReconcileError::fatal(step, format!("cannot list PHYs: {}", e)))?;

    let phy_hosting = |iface: &str| {
        pass.iface(iface)
            .and_then(|o| o.phy.clone())
            .or_else(|| {
                phys.iter()
                    .find(|p| p.interfaces.iter().any(|n| n == iface))
                    .map(|p| p.name.clone())
            })
    };

    if let Some(preferred) = phy_hosting(&i.mesh_phy_iface) {
        if phys.iter().any(|p| p.name == preferred && p.supports_mesh_point) {
            return Ok(preferred);
        }
        warn!("{} does not support mesh point, looking for another PHY", preferred);
    }

    let ap_phy = phy_hosting(&i.ap_iface);
    phys.iter()
        .find(|p| p.supports_mesh_point && Some(&p.name) != ap_phy.as_ref())
        .map(|p| p.name.clone())
        .ok_or_else(|| ReconcileError::fatal(step, "no PHY supporting mesh point"))
}

/// Absent -> Created
pub(super) async fn ensure_created(pass: &mut Pass<'_>) -> Result<(), ReconcileError> {
    const STEP: &str = "create mesh interface";
    pass.check_deadline(STEP)?;

    let config = pass.config;
    let name = config.interfaces.mesh_iface.as_str();
    if pass.iface(name).is_some() {
        pass.converged(STEP, name);
        return Ok(());
    }

    let phy = select_phy(pass, STEP).await?;
    create_on(pass, STEP, &phy, name).await
}

async fn create_on(pass: &mut Pass<'_>, step: &str, phy: &str, name: &str) -> Result<(), ReconcileError> {
    let net = pass.net;
    pass.apply(step, name, net.create_mesh_interface(phy, name)).await?;
    pass.wait_for_interface(step, name).await
}

/// Run one join mutation; failures are recoverable
async fn attempt<F>(pass: &mut Pass<'_>, step: &str, target: &str, op: F) -> Result<(), ReconcileError>
where
    F: std::future::Future<Output = crate::error::MeshResult<()>>,
{
    pass.check_deadline(step)?;
    pass.call(step, op)
        .await?
        .map_err(|e| ReconcileError::recoverable(step, format!("{}: {}", target, e)))?;
    pass.record(step, target, StepOutcome::Applied);
    pass.refresh(step, target).await
}

/// Cleanup, mesh point type, link up, join, then wait until the radio reports it
async fn try_join(pass: &mut Pass<'_>, params: &MeshJoinParams) -> Result<(), ReconcileError> {
    const STEP: &str = "mesh join";
    let config = pass.config;
    let net = pass.net;
    let name = config.interfaces.mesh_iface.as_str();

    pass.best_effort("stop stale supplicant", name, net.stop_mesh_supplicant(name))
        .await;
    pass.best_effort(
        "remove stale control socket",
        name,
        net.remove_supplicant_socket(name),
    )
    .await;
    pass.refresh(STEP, name).await?;

    let Some(iface) = pass.iface(name).cloned() else {
        return Err(ReconcileError::recoverable(STEP, format!("{} vanished", name)));
    };

    if !iface.is_mesh_point() {
        if iface.up {
            attempt(pass, "link down", name, net.set_link(name, false)).await?;
        }
        attempt(pass, "set mesh point type", name, net.set_mesh_point_type(name)).await?;
    }
    if !pass.iface(name).is_some_and(|i| i.up) {
        attempt(pass, "link up", name, net.set_link(name, true)).await?;
    }

    let secured = config
        .mesh_security()
        .map_err(config_error)?
        .requires_passphrase();
    if secured {
        let conf = pass.render_dir.join(MESH_SUPPLICANT_FILE);
        if !conf.exists() {
            return Err(ReconcileError::fatal(
                STEP,
                format!("{} is missing; render the configuration first", conf.display()),
            ));
        }
        attempt(pass, STEP, name, net.mesh_join_secured(name, params, &conf)).await?;
    } else {
        attempt(pass, STEP, name, net.mesh_join(name, params)).await?;
    }

    let (mesh_id, frequency) = (params.mesh_id.as_str(), params.frequency);
    let joined = pass
        .wait_for(STEP, pass.timing.iface_create_timeout, || async move {
            net.interface(name)
                .await
                .ok()
                .flatten()
                .filter(|i| i.joined(mesh_id, frequency))
        })
        .await?;

    let Some(iface) = joined else {
        return Err(ReconcileError::recoverable(
            STEP,
            format!("{} not joined to {} on {} MHz", name, mesh_id, frequency),
        ));
    };
    pass.state.update(name, Some(iface));

    // the supplicant joins without HWMP flags
    if secured && params.root_mode {
        let mode = params.hwmp_root_mode().to_string();
        pass.best_effort(
            "mesh root mode",
            name,
            net.set_mesh_param(name, "mesh_hwmp_rootmode", &mode),
        )
        .await;
    }
    Ok(())
}

/// Remove other virtual interfaces on the mesh PHY and recreate the mesh interface
async fn join_workaround(pass: &mut Pass<'_>) -> Result<(), ReconcileError> {
    const STEP: &str = "mesh join workaround";
    let config = pass.config;
    let net = pass.net;
    let i = &config.interfaces;
    let name = i.mesh_iface.as_str();

    let phy = match pass.iface(name).and_then(|o| o.phy.clone()) {
        Some(phy) => phy,
        None => select_phy(pass, STEP).await?,
    };

    let secondary: Vec<String> = pass
        .call(STEP, net.phys())
        .await?
        .unwrap_or_default()
        .into_iter()
        .filter(|p| p.name == phy)
        .flat_map(|p| p.interfaces)
        .filter(|vif| vif != name && *vif != i.mesh_phy_iface && *vif != i.ap_iface)
        .collect();
    for vif in &secondary {
        pass.best_effort("remove secondary interface", vif, net.delete_interface(vif))
            .await;
        pass.refresh(STEP, vif).await?;
    }

    if i.mesh_phy_iface == name {
        return Ok(());
    }

    if pass.iface(&i.mesh_phy_iface).is_some_and(|o| o.up) {
        pass.best_effort("link down", &i.mesh_phy_iface, net.set_link(&i.mesh_phy_iface, false))
            .await;
        pass.refresh(STEP, &i.mesh_phy_iface).await?;
    }

    if pass.iface(name).is_some() {
        pass.best_effort("delete mesh interface", name, net.delete_interface(name))
            .await;
        pass.refresh(STEP, name).await?;
    }
    if pass.iface(name).is_none() {
        create_on(pass, STEP, &phy, name).await?;
    }
    Ok(())
}

/// Created -> MeshJoined
pub(super) async fn ensure_joined(pass: &mut Pass<'_>) -> Result<(), ReconcileError> {
    const STEP: &str = "mesh join";
    pass.check_deadline(STEP)?;

    let config = pass.config;
    let net = pass.net;
    let name = config.interfaces.mesh_iface.as_str();
    let params = join_params(config).map_err(config_error)?;

    let (joined, other_mesh) = match pass.iface(name) {
        Some(iface) => (
            iface.up && iface.joined(&params.mesh_id, params.frequency),
            iface.mesh.is_some(),
        ),
        None => return Err(ReconcileError::fatal(STEP, format!("{} does not exist", name))),
    };
    if joined {
        pass.converged(STEP, name);
        return Ok(());
    }

    if other_mesh {
        // joined to some other mesh
        pass.best_effort("leave mesh", name, net.mesh_leave(name)).await;
        pass.refresh(STEP, name).await?;
    }

    if let Err(first) = try_join(pass, &params).await {
        if first.is_fatal() {
            return Err(first);
        }
        warn!("{}; retrying once after removing conflicting interfaces", first);
        pass.record(STEP, name, StepOutcome::Informational(format!("retry after: {}", first)));
        join_workaround(pass).await?;
        try_join(pass, &params).await.map_err(|second| {
            ReconcileError::fatal(STEP, format!("join failed after retry: {}", second))
        })?;
    }

    wait_first_peer(pass).await
}

/// Informational only; an empty neighborhood is not an error
async fn wait_first_peer(pass: &mut Pass<'_>) -> Result<(), ReconcileError> {
    const STEP: &str = "first peer";
    let net = pass.net;
    let config = pass.config;
    let name = config.interfaces.mesh_iface.as_str();

    let peers = pass
        .wait_for(STEP, pass.timing.first_peer_timeout, || async move {
            net.mesh_peer_count(name).await.ok().filter(|n| *n > 0)
        })
        .await?;

    let note = match peers {
        Some(n) => format!("{} peer link(s) established", n),
        None => format!(
            "no peer within {} ms",
            pass.timing.first_peer_timeout.as_millis()
        ),
    };
    pass.record(STEP, name, StepOutcome::Informational(note));
    Ok(())
}

/// MeshJoined -> Addressed
pub(super) async fn ensure_addressed(pass: &mut Pass<'_>) -> Result<(), ReconcileError> {
    const STEP: &str = "mesh address";
    const LINK_LOCAL: &str = "mesh link-local";
    let config = pass.config;
    let net = pass.net;
    let name = config.interfaces.mesh_iface.as_str();

    let addr: IfAddr = config.mesh_address().map_err(config_error)?.into();
    pass.ensure_address(STEP, name, addr).await?;

    if pass.iface(name).and_then(|i| i.link_local()).is_some() {
        pass.converged(LINK_LOCAL, name);
        return Ok(());
    }

    let appeared = pass
        .wait_for(LINK_LOCAL, pass.timing.link_local_grace, || async move {
            net.interface(name)
                .await
                .ok()
                .flatten()
                .filter(|i| i.link_local().is_some())
        })
        .await?;
    if let Some(iface) = appeared {
        pass.state.update(name, Some(iface));
        pass.record(
            LINK_LOCAL,
            name,
            StepOutcome::Informational("assigned by the kernel".to_string()),
        );
        return Ok(());
    }

    let mac = pass
        .iface(name)
        .and_then(|i| i.mac.as_deref())
        .and_then(addressing::parse_mac)
        .ok_or_else(|| {
            ReconcileError::fatal(LINK_LOCAL, format!("{} has no MAC to derive a link-local from", name))
        })?;
    let ll = IfAddr::new(IpAddr::V6(addressing::eui64_link_local(&mac)), 64);
    pass.apply(LINK_LOCAL, name, async move { net.add_address(name, &ll).await })
        .await
}

#[cfg(test)]
mod tests {
    use super::super::{ReconcileTiming, Reconciler};
    use super::*;
    use crate::config::ReconcileSettings;
    use crate::netops::fake::FakeNet;
    use crate::node_config::test_config;
    use crate::render;
    use crate::state::ObservedInterface;
    use crate::wifi::PhyInfo;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn reconciler(net: Arc<FakeNet>, render_dir: PathBuf) -> Reconciler {
        Reconciler::new(
            net,
            ReconcileTiming::from(&ReconcileSettings::default()),
            render_dir,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn failed_join_is_retried_once_after_workaround() {
        let net = Arc::new(FakeNet::new());
        {
            let mut state = net.state();
            state.failing_joins = 1;
            let mut mon = ObservedInterface::new("mon0");
            mon.phy = Some("phy1".to_string());
            state.interfaces.insert("mon0".to_string(), mon);
            state.phys[1].interfaces.push("mon0".to_string());
        }

        let report = reconciler(net.clone(), PathBuf::from("/tmp"))
            .reconcile(&test_config())
            .await
            .unwrap();

        let calls = net.calls();
        assert_eq!(calls.iter().filter(|c| c.starts_with("mesh_join ")).count(), 2);
        assert!(calls.contains(&"delete_interface mon0".to_string()));
        assert!(calls.contains(&"delete_interface mesh0".to_string()));
        assert_eq!(
            calls
                .iter()
                .filter(|c| c.starts_with("create_mesh_interface"))
                .count(),
            2
        );
        assert!(net.iface("mon0").is_none());
        assert!(net.iface("wlan1").is_some());
        assert!(net.iface("mesh0").unwrap().joined("orbis-mesh", 2412));
        assert!(report
            .steps
            .iter()
            .any(|s| matches!(&s.outcome, StepOutcome::Informational(n) if n.starts_with("retry"))));
    }

    #[tokio::test(start_paused = true)]
    async fn second_join_failure_is_fatal() {
        let net = Arc::new(FakeNet::new());
        net.state().failing_joins = 2;

        let err = reconciler(net.clone(), PathBuf::from("/tmp"))
            .reconcile(&test_config())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("after retry"));
        // bridge steps never ran
        assert!(net.iface("br0").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn secured_mesh_joins_through_supplicant() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.mesh.security = "wpa3".to_string();
        config.mesh.passphrase = Some("mesh secret 1".to_string());
        render::apply(&config, dir.path()).unwrap();

        let net = Arc::new(FakeNet::new());
        reconciler(net.clone(), dir.path().to_path_buf())
            .reconcile(&config)
            .await
            .unwrap();

        assert!(net.state().supplicants.contains("mesh0"));
        assert!(net
            .calls()
            .iter()
            .any(|c| c.starts_with("mesh_join_secured mesh0")));
    }

    #[tokio::test(start_paused = true)]
    async fn secured_root_node_sets_root_mode_after_join() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.mesh.security = "wpa3".to_string();
        config.mesh.passphrase = Some("mesh secret 1".to_string());
        config.mesh.root_mode = true;
        render::apply(&config, dir.path()).unwrap();

        let net = Arc::new(FakeNet::new());
        let report = reconciler(net.clone(), dir.path().to_path_buf())
            .reconcile(&config)
            .await
            .unwrap();

        let calls = net.calls();
        let pos = |prefix: &str| calls.iter().position(|c| c.starts_with(prefix)).unwrap();
        assert!(pos("mesh_join_secured mesh0") < pos("set_mesh_param mesh0 mesh_hwmp_rootmode 4"));
        assert_eq!(report.warnings().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_join_carries_root_mode_itself() {
        let net = Arc::new(FakeNet::new());
        let mut config = test_config();
        config.mesh.root_mode = true;

        reconciler(net.clone(), PathBuf::from("/tmp"))
            .reconcile(&config)
            .await
            .unwrap();
        assert!(!net.calls().iter().any(|c| c.starts_with("set_mesh_param")));
    }

    #[tokio::test(start_paused = true)]
    async fn secured_mesh_without_rendered_config_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.mesh.security = "wpa2".to_string();
        config.mesh.passphrase = Some("mesh secret 1".to_string());

        let net = Arc::new(FakeNet::new());
        let err = reconciler(net, dir.path().to_path_buf())
            .reconcile(&config)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("render the configuration"));
    }

    #[tokio::test(start_paused = true)]
    async fn mesh_on_other_channel_is_rejoined() {
        let net = Arc::new(FakeNet::new());
        let reconciler = reconciler(net.clone(), PathBuf::from("/tmp"));
        let mut config = test_config();
        reconciler.reconcile(&config).await.unwrap();

        config.mesh.channel = 6;
        net.clear_calls();
        reconciler.reconcile(&config).await.unwrap();

        let calls = net.calls();
        assert!(calls.contains(&"mesh_leave mesh0".to_string()));
        assert!(net.iface("mesh0").unwrap().joined("orbis-mesh", 2437));
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_a_phy_not_used_by_the_ap() {
        let net = Arc::new(FakeNet::new());
        {
            let mut state = net.state();
            state.interfaces.remove("wlan1");
            state.phys = vec![
                PhyInfo {
                    name: "phy0".to_string(),
                    supports_mesh_point: true,
                    interfaces: vec!["wlan0".to_string()],
                    ..Default::default()
                },
                PhyInfo {
                    name: "phy2".to_string(),
                    supports_mesh_point: true,
                    interfaces: vec![],
                    ..Default::default()
                },
            ];
        }

        reconciler(net.clone(), PathBuf::from("/tmp"))
            .reconcile(&test_config())
            .await
            .unwrap();
        assert_eq!(net.iface("mesh0").unwrap().phy.as_deref(), Some("phy2"));
    }

    #[test]
    fn join_params_follow_config() {
        let mut config = test_config();
        config.mesh.root_mode = true;
        let params = join_params(&config).unwrap();
        assert_eq!(params.mesh_id, "orbis-mesh");
        assert_eq!(params.frequency, 2412);
        assert!(params.root_mode);

        config.mesh.ssid = None;
        assert_eq!(join_params(&config).unwrap_err().field(), "mesh.ssid");
    }
}
