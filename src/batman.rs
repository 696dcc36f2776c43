//! batman-adv parameters for the batman routing backend
//!
//! batman-adv is a kernel module, so there is no daemon to hand a config file
//! to. The rendered file records the parameters and the reconciler applies
//! them with `batctl`.

use crate::error::RenderError;
use crate::node_config::NodeConfig;
use crate::validation;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatmanParams {
    pub mesh_iface: String,
    pub batman_iface: String,
    pub bridge: String,
    /// Originator message interval in ms
    pub orig_interval: u32,
    pub hop_penalty: u8,
    pub bridge_loop_avoidance: bool,
    pub distributed_arp_table: bool,
    pub gw_mode: String,
}

impl BatmanParams {
    pub fn from_node(config: &NodeConfig) -> Result<Self, RenderError> {
        let i = &config.interfaces;
        validation::check_interface_field("interfaces.mesh_iface", &i.mesh_iface)?;
        validation::check_interface_field("interfaces.batman_iface", &i.batman_iface)?;
        validation::check_interface_field("interfaces.bridge_name", &i.bridge_name)?;

        Ok(Self {
            mesh_iface: i.mesh_iface.clone(),
            batman_iface: i.batman_iface.clone(),
            bridge: i.bridge_name.clone(),
            orig_interval: 1000,
            hop_penalty: 30,
            bridge_loop_avoidance: true,
            distributed_arp_table: true,
            gw_mode: "off".to_string(),
        })
    }

    /// batman-adv.conf contents
    pub fn render(&self) -> String {
        let mut conf = String::new();
        conf.push_str(&format!("mesh_iface={}\n", self.mesh_iface));
        conf.push_str(&format!("batman_iface={}\n", self.batman_iface));
        conf.push_str(&format!("bridge={}\n", self.bridge));
        for (key, value) in self.tunables() {
            conf.push_str(&format!("{}={}\n", key, value));
        }
        conf
    }

    /// `(batctl setting, value)` pairs applied to the batman interface
    pub fn tunables(&self) -> Vec<(&'static str, String)> {
        vec![
            ("orig_interval", self.orig_interval.to_string()),
            ("hop_penalty", self.hop_penalty.to_string()),
            ("bridge_loop_avoidance", (self.bridge_loop_avoidance as u8).to_string()),
            ("distributed_arp_table", (self.distributed_arp_table as u8).to_string()),
            ("gw_mode", self.gw_mode.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_config::test_config;

    #[test]
    fn renders_bindings_and_tunables() {
        let params = BatmanParams::from_node(&test_config()).unwrap();
        let conf = params.render();
        assert!(conf.starts_with("mesh_iface=mesh0\nbatman_iface=bat0\nbridge=br0\n"));
        assert!(conf.contains("orig_interval=1000\n"));
        assert!(conf.contains("bridge_loop_avoidance=1\n"));
        assert!(conf.ends_with("gw_mode=off\n"));
    }

    #[test]
    fn rejects_bad_batman_interface() {
        let mut config = test_config();
        config.interfaces.batman_iface = "bat0;reboot".to_string();
        assert_eq!(
            BatmanParams::from_node(&config).unwrap_err().field(),
            "interfaces.batman_iface"
        );
    }
}
