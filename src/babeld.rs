//! babeld configuration for the babel routing backend

use crate::addressing::Ipv4Cidr;
use crate::error::RenderError;
use crate::node_config::NodeConfig;
use crate::validation;

/// babeld local control port, also queried by the health checker
pub const CONTROL_PORT: u16 = 33123;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BabeldConfig {
    /// Wireless interfaces babel runs on
    pub interfaces: Vec<String>,
    pub control_port: u16,
    /// Local prefixes announced into the mesh
    pub redistribute: Vec<Ipv4Cidr>,
}

impl BabeldConfig {
    pub fn from_node(config: &NodeConfig) -> Result<Self, RenderError> {
        let mesh_iface = &config.interfaces.mesh_iface;
        validation::check_interface_field("interfaces.mesh_iface", mesh_iface)?;

        // the LAN network, plus the UI host route when the LAN does not cover it
        let lan = config.lan_subnet()?.network_cidr();
        let mut redistribute = vec![lan];
        if let Some(ui) = config.ui_cidr().filter(|ui| !lan.contains(ui.addr)) {
            redistribute.push(ui);
        }

        Ok(Self {
            interfaces: vec![mesh_iface.clone()],
            control_port: CONTROL_PORT,
            redistribute,
        })
    }

    /// babeld.conf contents
    pub fn render(&self) -> String {
        let mut conf = String::new();
        conf.push_str(&format!("local-port {}\n", self.control_port));
        conf.push_str("random-id true\n");

        for iface in &self.interfaces {
            conf.push_str(&format!("interface {} type wireless\n", iface));
        }

        for prefix in &self.redistribute {
            conf.push_str(&format!("redistribute local ip {} allow\n", prefix));
        }
        conf.push_str("redistribute local deny\n");
        conf
    }
}
