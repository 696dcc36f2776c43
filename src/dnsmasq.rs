//! dnsmasq configuration for DHCP and DNS on the LAN bridge

use crate::error::RenderError;
use crate::node_config::NodeConfig;
use crate::validation;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsmasqConfig {
    pub interface: String,
    pub gateway: Ipv4Addr,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub lease_time: String,
    /// Upstream resolvers
    pub dns_servers: Vec<Ipv4Addr>,
    pub domain: Option<String>,
}

fn validate_lease_time(lease: &str) -> Result<String, RenderError> {
    let lease = validation::sanitize_config_value("addressing.dhcp_lease", lease.trim())?;
    if lease == "infinite" {
        return Ok(lease);
    }
    let digits = lease.trim_end_matches(['s', 'm', 'h', 'd']);
    if digits.is_empty()
        || !digits.chars().all(|c| c.is_ascii_digit())
        || lease.len() - digits.len() > 1
    {
        return Err(RenderError::invalid(
            "addressing.dhcp_lease",
            format!("'{}' is not a lease time such as 3600, 45m or 12h", lease),
        ));
    }
    Ok(lease)
}

impl DnsmasqConfig {
    pub fn from_node(config: &NodeConfig) -> Result<Self, RenderError> {
        let bridge = &config.interfaces.bridge_name;
        validation::check_interface_field("interfaces.bridge_name", bridge)?;

        let gateway = config.lan_gateway()?;
        let (range_start, range_end) = config.dhcp_range()?;
        let lease_time = validate_lease_time(&config.addressing.dhcp_lease)?;

        Ok(Self {
            interface: bridge.clone(),
            gateway: gateway.addr,
            range_start,
            range_end,
            netmask: gateway.netmask(),
            lease_time,
            dns_servers: config.addressing.dns_servers.clone(),
            domain: Some("mesh".to_string()),
        })
    }

    /// dnsmasq.conf contents
    pub fn render(&self) -> String {
        let mut conf = String::new();

        conf.push_str(&format!("interface={}\n", self.interface));
        conf.push_str("bind-interfaces\n");
        conf.push_str(&format!("listen-address={}\n", self.gateway));
        conf.push_str("domain-needed\nbogus-priv\n");

        if !self.dns_servers.is_empty() {
            conf.push_str("no-resolv\n");
            for server in &self.dns_servers {
                conf.push_str(&format!("server={}\n", server));
            }
        }

        if let Some(ref domain) = self.domain {
            conf.push_str(&format!("domain={}\nlocal=/{}/\n", domain, domain));
        }

        conf.push_str(&format!(
            "dhcp-range={},{},{},{}\n",
            self.range_start, self.range_end, self.netmask, self.lease_time
        ));
        conf.push_str(&format!("dhcp-option=option:router,{}\n", self.gateway));
        conf.push_str(&format!("dhcp-option=option:dns-server,{}\n", self.gateway));
        conf.push_str("dhcp-authoritative\n");

        conf
    }
}
