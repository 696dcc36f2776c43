//! Observed interface state
//!
//! Derived from the OS on every reconciliation step and health check, never
//! persisted.

use crate::addressing::{self, Ipv4Cidr};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;

/// An address assigned to an interface, IPv4 or IPv6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IfAddr {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl IfAddr {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }

    pub fn is_link_local_v6(&self) -> bool {
        matches!(self.addr, IpAddr::V6(v6) if addressing::is_link_local_v6(&v6))
    }
}

impl From<Ipv4Cidr> for IfAddr {
    fn from(cidr: Ipv4Cidr) -> Self {
        Self {
            addr: IpAddr::V4(cidr.addr),
            prefix_len: cidr.prefix_len,
        }
    }
}

impl fmt::Display for IfAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for IfAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| format!("'{}' is not in address/prefix form", s))?;
        let addr: IpAddr = addr.parse().map_err(|_| format!("invalid address '{}'", addr))?;
        let prefix_len: u8 = len.parse().map_err(|_| format!("invalid prefix '{}'", len))?;
        let max = if addr.is_ipv6() { 128 } else { 32 };
        if prefix_len > max {
            return Err(format!("prefix length {} exceeds {}", prefix_len, max));
        }
        Ok(Self { addr, prefix_len })
    }
}

/// Mesh membership reported by the radio
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshJoin {
    /// Not every driver reports the mesh ID back
    pub mesh_id: Option<String>,
    pub frequency: u32,
}

/// One OS interface as last observed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedInterface {
    pub name: String,
    /// Administratively up (IFF_UP)
    pub up: bool,
    pub oper_state: Option<String>,
    /// Bridge or batman interface this one is enslaved to
    pub master: Option<String>,
    pub mac: Option<String>,
    /// Link kind, e.g. `bridge` or `batadv`
    pub kind: Option<String>,
    pub addresses: Vec<IfAddr>,
    /// Wireless only
    pub phy: Option<String>,
    /// Wireless interface type as `iw` reports it, e.g. `mesh point`
    pub iftype: Option<String>,
    pub mesh: Option<MeshJoin>,
}

impl ObservedInterface {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn has_address(&self, addr: &IfAddr) -> bool {
        self.addresses.contains(addr)
    }

    pub fn ipv4_addresses(&self) -> impl Iterator<Item = &IfAddr> {
        self.addresses.iter().filter(|a| a.addr.is_ipv4())
    }

    pub fn has_ipv4(&self) -> bool {
        self.ipv4_addresses().next().is_some()
    }

    pub fn link_local(&self) -> Option<Ipv6Addr> {
        self.addresses.iter().find_map(|a| match a.addr {
            IpAddr::V6(v6) if addressing::is_link_local_v6(&v6) => Some(v6),
            _ => None,
        })
    }

    pub fn is_mesh_point(&self) -> bool {
        self.iftype.as_deref() == Some("mesh point")
    }

    /// Joined to `mesh_id` on `frequency`
    pub fn joined(&self, mesh_id: &str, frequency: u32) -> bool {
        match &self.mesh {
            Some(join) => {
                self.is_mesh_point()
                    && join.frequency == frequency
                    && join.mesh_id.as_deref().map_or(true, |id| id == mesh_id)
            }
            None => false,
        }
    }
}

/// Observed interfaces by name, plus global radio state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceState {
    pub interfaces: BTreeMap<String, ObservedInterface>,
    pub regdomain: Option<String>,
}

impl InterfaceState {
    pub fn get(&self, name: &str) -> Option<&ObservedInterface> {
        self.interfaces.get(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.interfaces.contains_key(name)
    }

    /// Record a fresh observation of one interface (`None` = absent)
    pub fn update(&mut self, name: &str, observed: Option<ObservedInterface>) {
        match observed {
            Some(iface) => {
                self.interfaces.insert(name.to_string(), iface);
            }
            None => {
                self.interfaces.remove(name);
            }
        }
    }

    /// Interfaces enslaved to `master`
    pub fn members_of(&self, master: &str) -> Vec<String> {
        self.interfaces
            .values()
            .filter(|i| i.master.as_deref() == Some(master))
            .map(|i| i.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joined_requires_mesh_point_and_frequency() {
        let mut iface = ObservedInterface::new("mesh0");
        iface.iftype = Some("mesh point".to_string());
        iface.mesh = Some(MeshJoin {
            mesh_id: None,
            frequency: 2412,
        });
        assert!(iface.joined("orbis-mesh", 2412));
        assert!(!iface.joined("orbis-mesh", 2437));

        iface.mesh = Some(MeshJoin {
            mesh_id: Some("other".to_string()),
            frequency: 2412,
        });
        assert!(!iface.joined("orbis-mesh", 2412));

        iface.iftype = Some("managed".to_string());
        iface.mesh = None;
        assert!(!iface.joined("orbis-mesh", 2412));
    }

    #[test]
    fn ifaddr_parse_and_link_local() {
        let ll: IfAddr = "fe80::211:22ff:fe33:4455/64".parse().unwrap();
        assert!(ll.is_link_local_v6());
        let v4: IfAddr = "10.99.0.1/16".parse().unwrap();
        assert!(!v4.is_link_local_v6());
        assert!("10.99.0.1/33".parse::<IfAddr>().is_err());

        let mut iface = ObservedInterface::new("mesh0");
        iface.addresses = vec![v4, ll];
        assert!(iface.has_ipv4());
        assert_eq!(
            iface.link_local(),
            Some("fe80::211:22ff:fe33:4455".parse().unwrap())
        );
    }

    #[test]
    fn members_follow_master() {
        let mut state = InterfaceState::default();
        let mut eth = ObservedInterface::new("eth0");
        eth.master = Some("br0".to_string());
        state.update("eth0", Some(eth));
        state.update("br0", Some(ObservedInterface::new("br0")));
        assert_eq!(state.members_of("br0"), vec!["eth0".to_string()]);

        state.update("eth0", None);
        assert!(state.members_of("br0").is_empty());
    }
}
