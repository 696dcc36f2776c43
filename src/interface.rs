//! Network interface control
//!
//! Low-level interface management using the ip command and sysfs

use crate::error::{MeshError, MeshResult};
use crate::state::{IfAddr, ObservedInterface};
use crate::validation;
use std::path::PathBuf;
use tokio::fs;
use tokio::process::Command;
use tracing::debug;

/// Interface controller
pub struct InterfaceController {
    sysfs_net: PathBuf,
}

impl InterfaceController {
    pub fn new() -> Self {
        Self {
            sysfs_net: PathBuf::from("/sys/class/net"),
        }
    }

    pub async fn exists(&self, interface: &str) -> bool {
        fs::metadata(self.sysfs_net.join(interface)).await.is_ok()
    }

    /// Link, master and address state of one interface; `None` when absent
    pub async fn observe(&self, interface: &str) -> MeshResult<Option<ObservedInterface>> {
        validation::validate_interface_name(interface)?;

        if !self.exists(interface).await {
            return Ok(None);
        }

        let output = self
            .run_ip_output(&["-json", "-details", "addr", "show", "dev", interface])
            .await;
        let json = match output {
            Ok(json) => json,
            // raced with a delete
            Err(_) if !self.exists(interface).await => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut observed = parse_ip_json(&json)?;
        Ok(observed
            .iter()
            .position(|i| i.name == interface)
            .map(|idx| observed.swap_remove(idx)))
    }

    /// Name of the wiphy backing a wireless interface
    pub async fn phy_of(&self, interface: &str) -> Option<String> {
        let path = self.sysfs_net.join(interface).join("phy80211").join("name");
        fs::read_to_string(path).await.ok().map(|s| s.trim().to_string())
    }

    /// Bring interface up
    pub async fn up(&self, interface: &str) -> MeshResult<()> {
        validation::validate_interface_name(interface)?;
        self.run_ip(&["link", "set", "dev", interface, "up"]).await
    }

    /// Bring interface down
    pub async fn down(&self, interface: &str) -> MeshResult<()> {
        validation::validate_interface_name(interface)?;
        self.run_ip(&["link", "set", "dev", interface, "down"]).await
    }

    pub async fn add_address(&self, interface: &str, addr: &IfAddr) -> MeshResult<()> {
        validation::validate_interface_name(interface)?;
        validation::validate_prefix_len(addr.prefix_len, addr.addr.is_ipv6())?;
        self.run_ip(&["addr", "add", &addr.to_string(), "dev", interface]).await
    }

    pub async fn del_address(&self, interface: &str, addr: &IfAddr) -> MeshResult<()> {
        validation::validate_interface_name(interface)?;
        self.run_ip(&["addr", "del", &addr.to_string(), "dev", interface]).await
    }

    /// Flush all IP addresses
    pub async fn flush_addrs(&self, interface: &str) -> MeshResult<()> {
        validation::validate_interface_name(interface)?;
        self.run_ip(&["addr", "flush", "dev", interface]).await
    }

    /// Delete a virtual interface (bridge, batman, mesh point)
    pub async fn delete(&self, interface: &str) -> MeshResult<()> {
        validation::validate_interface_name(interface)?;

        if !self.exists(interface).await {
            return Err(MeshError::InterfaceNotFound(interface.to_string()));
        }

        self.run_ip(&["link", "delete", "dev", interface]).await
    }

    pub async fn create_bridge(&self, bridge: &str) -> MeshResult<()> {
        validation::validate_interface_name(bridge)?;
        self.run_ip(&["link", "add", "name", bridge, "type", "bridge"]).await
    }

    pub async fn create_batman(&self, batman: &str) -> MeshResult<()> {
        validation::validate_interface_name(batman)?;
        self.run_ip(&["link", "add", "name", batman, "type", "batadv"]).await
    }

    /// Enslave `interface` to a bridge or batman interface
    pub async fn set_master(&self, interface: &str, master: &str) -> MeshResult<()> {
        validation::validate_interface_name(interface)?;
        validation::validate_interface_name(master)?;
        self.run_ip(&["link", "set", "dev", interface, "master", master]).await
    }

    pub async fn clear_master(&self, interface: &str) -> MeshResult<()> {
        validation::validate_interface_name(interface)?;
        self.run_ip(&["link", "set", "dev", interface, "nomaster"]).await
    }

    // === Helper functions ===

    async fn run_ip(&self, args: &[&str]) -> MeshResult<()> {
        self.run_ip_output(args).await.map(|_| ())
    }

    async fn run_ip_output(&self, args: &[&str]) -> MeshResult<String> {
        let cmd_str = format!("ip {}", args.join(" "));
        debug!("Running {}", cmd_str);
        let output = Command::new("ip")
            .kill_on_drop(true)
            .args(args)
            .output()
            .await
            .map_err(|e| MeshError::CommandFailed {
                cmd: cmd_str.clone(),
                code: None,
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8(output.stderr)
                .unwrap_or_else(|e| String::from_utf8_lossy(&e.into_bytes()).to_string());
            return Err(MeshError::CommandFailed {
                cmd: cmd_str,
                code: output.status.code(),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Default for InterfaceController {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `ip -json -details addr show` output
pub fn parse_ip_json(json: &str) -> MeshResult<Vec<ObservedInterface>> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let Some(arr) = value.as_array() else {
        return Err(MeshError::Parse("ip -json output is not an array".to_string()));
    };

    let mut interfaces = Vec::with_capacity(arr.len());
    for iface in arr {
        let Some(name) = iface.get("ifname").and_then(|v| v.as_str()) else {
            continue;
        };
        let mut observed = ObservedInterface::new(name);

        if let Some(flags) = iface.get("flags").and_then(|v| v.as_array()) {
            observed.up = flags.iter().any(|f| f.as_str() == Some("UP"));
        }
        observed.oper_state = iface
            .get("operstate")
            .and_then(|v| v.as_str())
            .map(|s| s.to_lowercase());
        observed.master = iface.get("master").and_then(|v| v.as_str()).map(String::from);
        observed.mac = iface.get("address").and_then(|v| v.as_str()).map(String::from);
        observed.kind = iface
            .get("linkinfo")
            .and_then(|l| l.get("info_kind"))
            .and_then(|v| v.as_str())
            .map(String::from);

        if let Some(addr_info) = iface.get("addr_info").and_then(|v| v.as_array()) {
            for addr in addr_info {
                if let (Some(local), Some(prefixlen)) = (
                    addr.get("local").and_then(|v| v.as_str()),
                    addr.get("prefixlen").and_then(|v| v.as_u64()),
                ) {
                    if let Ok(ip) = local.parse() {
                        observed.addresses.push(IfAddr::new(ip, prefixlen as u8));
                    }
                }
            }
        }

        interfaces.push(observed);
    }

    Ok(interfaces)
}
