//! OS adapter
//!
//! The reconciler, health checker and telemetry collector see the OS only
//! through these traits. [`NetObserver`] reads, [`NetOps`] mutates;
//! [`SystemNetOps`] implements both on top of `ip`, `iw`, `batctl` and the
//! mesh supplicant.

use crate::error::{MeshError, MeshResult};
use crate::interface::InterfaceController;
use crate::state::{IfAddr, MeshJoin, ObservedInterface};
use crate::telemetry::station;
use crate::validation;
use crate::wifi::{MeshJoinParams, PhyInfo, WifiController};
use crate::wpa_supplicant::MeshSupplicant;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Read-only view of network state
#[async_trait]
pub trait NetObserver: Send + Sync {
    /// Current state of one interface; `None` when it does not exist
    async fn interface(&self, name: &str) -> MeshResult<Option<ObservedInterface>>;

    /// Wireless PHYs and the interfaces on each
    async fn phys(&self) -> MeshResult<Vec<PhyInfo>>;

    /// Global regulatory domain
    async fn regdomain(&self) -> MeshResult<Option<String>>;

    /// Peers with an established mesh link on `iface`
    async fn mesh_peer_count(&self, iface: &str) -> MeshResult<usize>;

    /// Current value of a batman-adv setting, normalized to the form it is set with
    async fn batman_setting(&self, batman_iface: &str, key: &str) -> MeshResult<Option<String>>;
}

/// Mutations the reconciler performs
#[async_trait]
pub trait NetOps: NetObserver {
    async fn set_regdomain(&self, country: &str) -> MeshResult<()>;
    async fn create_mesh_interface(&self, phy: &str, name: &str) -> MeshResult<()>;
    async fn delete_interface(&self, name: &str) -> MeshResult<()>;
    async fn set_mesh_point_type(&self, name: &str) -> MeshResult<()>;
    async fn set_link(&self, name: &str, up: bool) -> MeshResult<()>;
    /// Open mesh join
    async fn mesh_join(&self, iface: &str, params: &MeshJoinParams) -> MeshResult<()>;
    /// SAE mesh join through the supplicant with a rendered config
    async fn mesh_join_secured(
        &self,
        iface: &str,
        params: &MeshJoinParams,
        config_path: &Path,
    ) -> MeshResult<()>;
    /// Set one 802.11s parameter on a joined interface
    async fn set_mesh_param(&self, iface: &str, key: &str, value: &str) -> MeshResult<()>;
    async fn mesh_leave(&self, iface: &str) -> MeshResult<()>;
    async fn stop_mesh_supplicant(&self, iface: &str) -> MeshResult<()>;
    /// Returns whether a socket was removed
    async fn remove_supplicant_socket(&self, iface: &str) -> MeshResult<bool>;
    async fn add_address(&self, iface: &str, addr: &IfAddr) -> MeshResult<()>;
    async fn del_address(&self, iface: &str, addr: &IfAddr) -> MeshResult<()>;
    async fn flush_addresses(&self, iface: &str) -> MeshResult<()>;
    async fn create_bridge(&self, name: &str) -> MeshResult<()>;
    async fn create_batman(&self, name: &str) -> MeshResult<()>;
    async fn set_master(&self, iface: &str, master: &str) -> MeshResult<()>;
    async fn clear_master(&self, iface: &str) -> MeshResult<()>;
    async fn set_batman_setting(&self, batman_iface: &str, key: &str, value: &str) -> MeshResult<()>;
}

/// NetOps backed by the real system
pub struct SystemNetOps {
    interfaces: InterfaceController,
    wifi: WifiController,
    supplicant: MeshSupplicant,
    supplicant_timeout: Duration,
}

impl SystemNetOps {
    pub fn new(supplicant: MeshSupplicant, supplicant_timeout: Duration) -> Self {
        Self {
            interfaces: InterfaceController::new(),
            wifi: WifiController::new(),
            supplicant,
            supplicant_timeout,
        }
    }

    async fn run_batctl(&self, args: &[&str]) -> MeshResult<String> {
        debug!("Running batctl {}", args.join(" "));
        let output = Command::new("batctl")
            .kill_on_drop(true)
            .args(args)
            .output()
            .await
            .map_err(|e| MeshError::CommandFailed {
                cmd: format!("batctl {}", args.join(" ")),
                code: None,
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(MeshError::CommandFailed {
                cmd: format!("batctl {}", args.join(" ")),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// batctl prints booleans as enabled/disabled but takes 1/0
pub fn normalize_batctl_value(output: &str) -> Option<String> {
    let value = output.lines().next()?.trim();
    match value {
        "" => None,
        "enabled" => Some("1".to_string()),
        "disabled" => Some("0".to_string()),
        other => Some(other.split_whitespace().next().unwrap_or(other).to_string()),
    }
}

#[async_trait]
impl NetObserver for SystemNetOps {
    async fn interface(&self, name: &str) -> MeshResult<Option<ObservedInterface>> {
        let Some(mut observed) = self.interfaces.observe(name).await? else {
            return Ok(None);
        };

        if let Some(phy) = self.interfaces.phy_of(name).await {
            observed.phy = Some(phy);
            if let Ok(info) = self.wifi.get_dev_info(name).await {
                observed.iftype = info.type_.clone();
                if observed.is_mesh_point() {
                    observed.mesh = info.frequency.map(|frequency| MeshJoin {
                        mesh_id: info.ssid.clone(),
                        frequency,
                    });
                }
            }
        }

        Ok(Some(observed))
    }

    async fn phys(&self) -> MeshResult<Vec<PhyInfo>> {
        self.wifi.phys().await
    }

    async fn regdomain(&self) -> MeshResult<Option<String>> {
        Ok(self.wifi.get_reg_domain().await?.country)
    }

    async fn mesh_peer_count(&self, iface: &str) -> MeshResult<usize> {
        let dump = self.wifi.station_dump(iface).await?;
        Ok(station::parse_station_dump(&dump)
            .iter()
            .filter(|s| s.is_established())
            .count())
    }

    async fn batman_setting(&self, batman_iface: &str, key: &str) -> MeshResult<Option<String>> {
        validation::validate_interface_name(batman_iface)?;
        let output = self.run_batctl(&["meshif", batman_iface, key]).await?;
        Ok(normalize_batctl_value(&output))
    }
}

#[async_trait]
impl NetOps for SystemNetOps {
    async fn set_regdomain(&self, country: &str) -> MeshResult<()> {
        self.wifi.set_reg_domain(country).await
    }

    async fn create_mesh_interface(&self, phy: &str, name: &str) -> MeshResult<()> {
        self.wifi.create_mesh_interface(phy, name).await
    }

    async fn delete_interface(&self, name: &str) -> MeshResult<()> {
        self.interfaces.delete(name).await
    }

    async fn set_mesh_point_type(&self, name: &str) -> MeshResult<()> {
        self.wifi.set_mesh_point_type(name).await
    }

    async fn set_link(&self, name: &str, up: bool) -> MeshResult<()> {
        if up {
            self.interfaces.up(name).await
        } else {
            self.interfaces.down(name).await
        }
    }

    async fn mesh_join(&self, iface: &str, params: &MeshJoinParams) -> MeshResult<()> {
        self.wifi.mesh_join(iface, params).await
    }

    async fn mesh_join_secured(
        &self,
        iface: &str,
        params: &MeshJoinParams,
        config_path: &Path,
    ) -> MeshResult<()> {
        debug!("Joining {} on {} MHz via supplicant", params.mesh_id, params.frequency);
        self.supplicant
            .start(iface, config_path, self.supplicant_timeout)
            .await
    }

    async fn set_mesh_param(&self, iface: &str, key: &str, value: &str) -> MeshResult<()> {
        self.wifi.set_mesh_param(iface, key, value).await
    }

    async fn mesh_leave(&self, iface: &str) -> MeshResult<()> {
        self.wifi.mesh_leave(iface).await
    }

    async fn stop_mesh_supplicant(&self, iface: &str) -> MeshResult<()> {
        self.supplicant.stop(iface).await
    }

    async fn remove_supplicant_socket(&self, iface: &str) -> MeshResult<bool> {
        self.supplicant.remove_stale_socket(iface).await
    }

    async fn add_address(&self, iface: &str, addr: &IfAddr) -> MeshResult<()> {
        self.interfaces.add_address(iface, addr).await
    }

    async fn del_address(&self, iface: &str, addr: &IfAddr) -> MeshResult<()> {
        self.interfaces.del_address(iface, addr).await
    }

    async fn flush_addresses(&self, iface: &str) -> MeshResult<()> {
        self.interfaces.flush_addrs(iface).await
    }

    async fn create_bridge(&self, name: &str) -> MeshResult<()> {
        self.interfaces.create_bridge(name).await
    }

    async fn create_batman(&self, name: &str) -> MeshResult<()> {
        self.interfaces.create_batman(name).await
    }

    async fn set_master(&self, iface: &str, master: &str) -> MeshResult<()> {
        self.interfaces.set_master(iface, master).await
    }

    async fn clear_master(&self, iface: &str) -> MeshResult<()> {
        self.interfaces.clear_master(iface).await
    }

    async fn set_batman_setting(&self, batman_iface: &str, key: &str, value: &str) -> MeshResult<()> {
        validation::validate_interface_name(batman_iface)?;
        validation::sanitize_config_value(key, value)?;
        self.run_batctl(&["meshif", batman_iface, key, value]).await.map(|_| ())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batctl_values_normalize() {
        assert_eq!(normalize_batctl_value("enabled\n"), Some("1".to_string()));
        assert_eq!(normalize_batctl_value("disabled\n"), Some("0".to_string()));
        assert_eq!(normalize_batctl_value("1000\n"), Some("1000".to_string()));
        assert_eq!(normalize_batctl_value("off\n"), Some("off".to_string()));
        assert_eq!(normalize_batctl_value(""), None);
    }

    #[tokio::test]
    async fn fake_records_mutations_only() {
        let net = fake::FakeNet::new();
        assert!(net.interface("mesh0").await.unwrap().is_none());
        assert!(net.calls().is_empty());

        net.create_mesh_interface("phy1", "mesh0").await.unwrap();
        net.set_link("mesh0", true).await.unwrap();
        let mesh = net.interface("mesh0").await.unwrap().unwrap();
        assert!(mesh.up);
        assert!(mesh.link_local().is_some());
        assert_eq!(
            net.calls(),
            vec!["create_mesh_interface phy1 mesh0", "set_link mesh0 up"]
        );
    }
}
