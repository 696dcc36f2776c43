//! Address arithmetic shared by the renderer, reconciler and health checker
//!
//! All functions here are pure.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// An IPv4 address with prefix length, e.g. `192.168.201.1/24`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self, String> {
        if prefix_len > 32 {
            return Err(format!("prefix length {} exceeds 32", prefix_len));
        }
        Ok(Self { addr, prefix_len })
    }

    /// Network address of this prefix (host bits cleared)
    pub fn network(&self) -> Ipv4Addr {
        network_prefix(self.addr, self.prefix_len)
    }

    /// The same prefix with host bits cleared
    pub fn network_cidr(&self) -> Ipv4Cidr {
        Ipv4Cidr {
            addr: self.network(),
            prefix_len: self.prefix_len,
        }
    }

    /// Dotted netmask, e.g. `255.255.255.0`
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(prefix_mask(self.prefix_len))
    }

    /// Address at host offset `host` inside this network
    ///
    /// Returns `None` when the offset does not fit in the host part or hits
    /// the network/broadcast address of a prefix shorter than /31.
    pub fn host(&self, host: u32) -> Option<Ipv4Addr> {
        let host_bits = 32 - self.prefix_len as u32;
        let capacity: u64 = 1u64 << host_bits;
        if host as u64 >= capacity {
            return None;
        }
        if self.prefix_len < 31 && (host == 0 || host as u64 == capacity - 1) {
            return None;
        }
        Some(Ipv4Addr::from(u32::from(self.network()) | host))
    }

    /// Whether `addr` falls inside this prefix
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        network_prefix(addr, self.prefix_len) == self.network()
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("'{}' is not in address/prefix form", s))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| format!("invalid IPv4 address '{}'", addr))?;
        let len: u8 = len
            .parse()
            .map_err(|_| format!("invalid prefix length '{}'", len))?;
        Ipv4Cidr::new(addr, len)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(value: Ipv4Cidr) -> Self {
        value.to_string()
    }
}

fn prefix_mask(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        n if n >= 32 => u32::MAX,
        n => u32::MAX << (32 - n as u32),
    }
}

/// CIDR network address: `network_prefix(192.168.200.10, 24) == 192.168.200.0`
///
/// Routing daemons want the network prefix, never a host address.
pub fn network_prefix(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr) & prefix_mask(prefix_len))
}

/// The node's LAN subnet: `a.b.(offset + node_id).0/24`
///
/// Third octets above 255 are rejected rather than wrapped.
pub fn lan_subnet(octets: [u8; 2], offset: u8, node_id: u16) -> Result<Ipv4Cidr, String> {
    if node_id == 0 {
        return Err("node id must be at least 1".to_string());
    }
    let third = offset as u32 + node_id as u32;
    if third > 255 {
        return Err(format!(
            "node id {} with LAN offset {} gives third octet {} (max 255, so node id must be <= {})",
            node_id,
            offset,
            third,
            255 - offset as u32
        ));
    }
    Ok(Ipv4Cidr {
        addr: Ipv4Addr::new(octets[0], octets[1], third as u8, 0),
        prefix_len: 24,
    })
}

/// Parse `aa:bb:cc:dd:ee:ff` into bytes
pub fn parse_mac(mac: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = mac.trim().split(':');
    for byte in out.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

/// Lower-case colon form of a MAC address
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Modified EUI-64 link-local address for a MAC
///
/// Flips the universal/local bit of the first octet and inserts `ff:fe` in
/// the middle: `00:11:22:33:44:55` → `fe80::211:22ff:fe33:4455`.
pub fn eui64_link_local(mac: &[u8; 6]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets[0] = 0xfe;
    octets[1] = 0x80;
    octets[8] = mac[0] ^ 0x02;
    octets[9] = mac[1];
    octets[10] = mac[2];
    octets[11] = 0xff;
    octets[12] = 0xfe;
    octets[13] = mac[3];
    octets[14] = mac[4];
    octets[15] = mac[5];
    Ipv6Addr::from(octets)
}

/// Inverse of [`eui64_link_local`], for EUI-64 derived link-local addresses
pub fn mac_from_link_local(addr: &Ipv6Addr) -> Option<[u8; 6]> {
    let o = addr.octets();
    if o[0] != 0xfe || (o[1] & 0xc0) != 0x80 || o[11] != 0xff || o[12] != 0xfe {
        return None;
    }
    Some([o[8] ^ 0x02, o[9], o[10], o[13], o[14], o[15]])
}

/// Whether an IPv6 address is in `fe80::/10`
pub fn is_link_local_v6(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}
