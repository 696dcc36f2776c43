//! NodeConfig: the node's declarative network configuration
//!
//! Loaded from and persisted to an owner-only TOML document. The reconciler
//! and telemetry path only ever read it; every change goes through
//! [`reconfigure`].

use crate::addressing::{self, Ipv4Cidr};
use crate::error::{ConfigError, MeshResult, RenderError};
use crate::secure_file::{write_secure, PRIVATE_MODE};
use crate::validation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::{debug, info};

/// Mesh routing layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingBackend {
    Batman,
    Babel,
}

impl RoutingBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingBackend::Batman => "batman",
            RoutingBackend::Babel => "babel",
        }
    }
}

/// Wireless security mode, parsed from the raw config string at render time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    Open,
    Wpa2,
    Wpa3,
    Mixed,
}

impl SecurityMode {
    pub fn parse(field: &str, value: &str) -> Result<Self, RenderError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(SecurityMode::Open),
            "wpa2" => Ok(SecurityMode::Wpa2),
            "wpa3" => Ok(SecurityMode::Wpa3),
            "mixed" => Ok(SecurityMode::Mixed),
            _ => Err(RenderError::UnsupportedMode {
                field: field.to_string(),
                value: value.to_string(),
            }),
        }
    }

    pub fn requires_passphrase(&self) -> bool {
        !matches!(self, SecurityMode::Open)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityMode::Open => "open",
            SecurityMode::Wpa2 => "wpa2",
            SecurityMode::Wpa3 => "wpa3",
            SecurityMode::Mixed => "mixed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Regulatory domain (ISO 3166-1 alpha-2)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default)]
    pub node: NodeIdentity,
    #[serde(default)]
    pub addressing: Addressing,
    #[serde(default)]
    pub ap: ApSettings,
    #[serde(default)]
    pub mesh: MeshSettings,
    #[serde(default)]
    pub interfaces: InterfaceBindings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Addressing {
    /// First two octets of the LAN
    #[serde(default = "default_lan_octets")]
    pub lan_octets: [u8; 2],
    /// Added to the node id to form the LAN third octet
    #[serde(default = "default_lan_offset")]
    pub lan_offset: u8,
    #[serde(default = "default_gateway_host")]
    pub gateway_host: u8,
    #[serde(default = "default_dhcp_start")]
    pub dhcp_start: u8,
    #[serde(default = "default_dhcp_end")]
    pub dhcp_end: u8,
    #[serde(default = "default_dhcp_lease")]
    pub dhcp_lease: String,
    /// Dashboard address, assigned /32 on the bridge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_address: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mgmt_address: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mgmt_prefix: Option<u8>,
    /// The node's mesh address is this network plus the node id
    #[serde(default = "default_mesh_network")]
    pub mesh_network: Ipv4Cidr,
    #[serde(default = "default_dns_servers")]
    pub dns_servers: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    #[serde(default = "default_ap_security")]
    pub security: String,
    #[serde(default = "default_ap_channel")]
    pub channel: u8,
    #[serde(default = "default_band")]
    pub band: String,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshSettings {
    /// 802.11s mesh ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    #[serde(default = "default_mesh_security")]
    pub security: String,
    #[serde(default = "default_mesh_channel")]
    pub channel: u8,
    #[serde(default = "default_band")]
    pub band: String,
    /// Derived from the channel when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<u32>,
    #[serde(default = "default_routing")]
    pub routing: RoutingBackend,
    #[serde(default = "default_beacon_interval")]
    pub beacon_interval: u32,
    /// 802.11s layer-2 forwarding (off when a routing layer forwards)
    #[serde(default)]
    pub forwarding: bool,
    #[serde(default)]
    pub root_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceBindings {
    #[serde(default = "default_ap_iface")]
    pub ap_iface: String,
    /// Radio the mesh interface is created from
    #[serde(default = "default_mesh_phy_iface")]
    pub mesh_phy_iface: String,
    #[serde(default = "default_mesh_iface")]
    pub mesh_iface: String,
    #[serde(default = "default_eth_iface")]
    pub eth_iface: String,
    #[serde(default = "default_bridge_name")]
    pub bridge_name: String,
    #[serde(default = "default_batman_iface")]
    pub batman_iface: String,
}

fn default_lan_octets() -> [u8; 2] {
    [192, 168]
}

fn default_lan_offset() -> u8 {
    200
}

fn default_gateway_host() -> u8 {
    1
}

fn default_dhcp_start() -> u8 {
    100
}

fn default_dhcp_end() -> u8 {
    250
}

fn default_dhcp_lease() -> String {
    "12h".to_string()
}

fn default_mesh_network() -> Ipv4Cidr {
    Ipv4Cidr {
        addr: Ipv4Addr::new(10, 99, 0, 0),
        prefix_len: 16,
    }
}

fn default_dns_servers() -> Vec<Ipv4Addr> {
    vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(9, 9, 9, 9)]
}

fn default_ap_security() -> String {
    "wpa2".to_string()
}

fn default_mesh_security() -> String {
    "open".to_string()
}

fn default_ap_channel() -> u8 {
    6
}

fn default_mesh_channel() -> u8 {
    1
}

fn default_band() -> String {
    "2.4GHz".to_string()
}

fn default_routing() -> RoutingBackend {
    RoutingBackend::Batman
}

fn default_beacon_interval() -> u32 {
    1000
}

fn default_ap_iface() -> String {
    "wlan0".to_string()
}

fn default_mesh_phy_iface() -> String {
    "wlan1".to_string()
}

fn default_mesh_iface() -> String {
    "mesh0".to_string()
}

fn default_eth_iface() -> String {
    "eth0".to_string()
}

fn default_bridge_name() -> String {
    "br0".to_string()
}

fn default_batman_iface() -> String {
    "bat0".to_string()
}

impl Default for Addressing {
    fn default() -> Self {
        Self {
            lan_octets: default_lan_octets(),
            lan_offset: default_lan_offset(),
            gateway_host: default_gateway_host(),
            dhcp_start: default_dhcp_start(),
            dhcp_end: default_dhcp_end(),
            dhcp_lease: default_dhcp_lease(),
            ui_address: None,
            mgmt_address: None,
            mgmt_prefix: None,
            mesh_network: default_mesh_network(),
            dns_servers: default_dns_servers(),
        }
    }
}

impl Default for ApSettings {
    fn default() -> Self {
        Self {
            ssid: None,
            passphrase: None,
            security: default_ap_security(),
            channel: default_ap_channel(),
            band: default_band(),
            hidden: false,
        }
    }
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            ssid: None,
            passphrase: None,
            security: default_mesh_security(),
            channel: default_mesh_channel(),
            band: default_band(),
            frequency: None,
            routing: default_routing(),
            beacon_interval: default_beacon_interval(),
            forwarding: false,
            root_mode: false,
        }
    }
}

impl Default for InterfaceBindings {
    fn default() -> Self {
        Self {
            ap_iface: default_ap_iface(),
            mesh_phy_iface: default_mesh_phy_iface(),
            mesh_iface: default_mesh_iface(),
            eth_iface: default_eth_iface(),
            bridge_name: default_bridge_name(),
            batman_iface: default_batman_iface(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            country: None,
            node: NodeIdentity::default(),
            addressing: Addressing::default(),
            ap: ApSettings::default(),
            mesh: MeshSettings::default(),
            interfaces: InterfaceBindings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FieldKind {
    Text,
    Integer,
    Flag,
    OctetPair,
}

/// Keys accepted by [`NodeConfig::set`]
const SETTABLE_KEYS: &[(&str, FieldKind)] = &[
    ("country", FieldKind::Text),
    ("node.name", FieldKind::Text),
    ("node.id", FieldKind::Integer),
    ("addressing.lan_octets", FieldKind::OctetPair),
    ("addressing.lan_offset", FieldKind::Integer),
    ("addressing.gateway_host", FieldKind::Integer),
    ("addressing.dhcp_start", FieldKind::Integer),
    ("addressing.dhcp_end", FieldKind::Integer),
    ("addressing.dhcp_lease", FieldKind::Text),
    ("addressing.ui_address", FieldKind::Text),
    ("addressing.mgmt_address", FieldKind::Text),
    ("addressing.mgmt_prefix", FieldKind::Integer),
    ("addressing.mesh_network", FieldKind::Text),
    ("ap.ssid", FieldKind::Text),
    ("ap.passphrase", FieldKind::Text),
    ("ap.security", FieldKind::Text),
    ("ap.channel", FieldKind::Integer),
    ("ap.band", FieldKind::Text),
    ("ap.hidden", FieldKind::Flag),
    ("mesh.ssid", FieldKind::Text),
    ("mesh.passphrase", FieldKind::Text),
    ("mesh.security", FieldKind::Text),
    ("mesh.channel", FieldKind::Integer),
    ("mesh.band", FieldKind::Text),
    ("mesh.frequency", FieldKind::Integer),
    ("mesh.routing", FieldKind::Text),
    ("mesh.beacon_interval", FieldKind::Integer),
    ("mesh.forwarding", FieldKind::Flag),
    ("mesh.root_mode", FieldKind::Flag),
    ("interfaces.ap_iface", FieldKind::Text),
    ("interfaces.mesh_phy_iface", FieldKind::Text),
    ("interfaces.mesh_iface", FieldKind::Text),
    ("interfaces.eth_iface", FieldKind::Text),
    ("interfaces.bridge_name", FieldKind::Text),
    ("interfaces.batman_iface", FieldKind::Text),
];

fn parse_field(key: &str, kind: FieldKind, raw: &str) -> Result<toml::Value, ConfigError> {
    match kind {
        FieldKind::Text => Ok(toml::Value::String(raw.to_string())),
        FieldKind::Integer => raw
            .parse::<i64>()
            .map(toml::Value::Integer)
            .map_err(|_| ConfigError::invalid(key, format!("'{}' is not a number", raw))),
        FieldKind::Flag => match raw.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(toml::Value::Boolean(true)),
            "false" | "no" | "off" | "0" => Ok(toml::Value::Boolean(false)),
            _ => Err(ConfigError::invalid(key, format!("'{}' is not a boolean", raw))),
        },
        FieldKind::OctetPair => {
            let octets = raw
                .split('.')
                .map(|part| part.trim().parse::<u8>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| ConfigError::invalid(key, format!("'{}' is not a.b", raw)))?;
            if octets.len() != 2 {
                return Err(ConfigError::invalid(key, format!("'{}' is not a.b", raw)));
            }
            Ok(toml::Value::Array(
                octets
                    .into_iter()
                    .map(|o| toml::Value::Integer(o as i64))
                    .collect(),
            ))
        }
    }
}

impl NodeConfig {
    /// Configuration written by a non-interactive first run
    ///
    /// Open AP and open mesh, so a fresh node is reachable before it has been
    /// given passphrases.
    pub fn first_run(name: &str, id: u16) -> Self {
        let mut config = NodeConfig::default();
        config.country = Some("US".to_string());
        config.node.name = Some(name.to_string());
        config.node.id = Some(id);
        config.ap.ssid = Some(format!("orbis-{}", id));
        config.ap.security = "open".to_string();
        config.mesh.ssid = Some("orbis-mesh".to_string());
        config
    }

    /// Load from a TOML file without validating it
    pub fn load<P: AsRef<Path>>(path: P) -> MeshResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConfigError::Parse(format!(
                "Failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml(&content).map_err(Into::into)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Persist to an owner-only file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> MeshResult<()> {
        let content = self.to_toml()?;
        write_secure(path.as_ref(), &content, PRIVATE_MODE)
    }

    /// Full validation: everything rendering needs plus addressing invariants
    pub fn validate(&self) -> Result<(), ConfigError> {
        crate::render::render(self)?;
        Ok(())
    }

    pub fn node_id(&self) -> Result<u16, RenderError> {
        match self.node.id {
            None => Err(RenderError::missing("node.id")),
            Some(0) => Err(RenderError::invalid("node.id", "node id must be at least 1")),
            Some(id) => Ok(id),
        }
    }

    pub fn country_code(&self) -> Result<String, RenderError> {
        let country = self
            .country
            .as_deref()
            .ok_or_else(|| RenderError::missing("country"))?;
        validation::validate_country_code("country", country)
    }

    pub fn ap_security(&self) -> Result<SecurityMode, RenderError> {
        SecurityMode::parse("ap.security", &self.ap.security)
    }

    pub fn mesh_security(&self) -> Result<SecurityMode, RenderError> {
        SecurityMode::parse("mesh.security", &self.mesh.security)
    }

    /// `a.b.(offset + id).0/24`
    pub fn lan_subnet(&self) -> Result<Ipv4Cidr, RenderError> {
        let id = self.node_id()?;
        addressing::lan_subnet(self.addressing.lan_octets, self.addressing.lan_offset, id)
            .map_err(|reason| RenderError::invalid("node.id", reason))
    }

    /// LAN gateway address with the LAN prefix length, assigned to the bridge
    pub fn lan_gateway(&self) -> Result<Ipv4Cidr, RenderError> {
        let subnet = self.lan_subnet()?;
        let addr = subnet
            .host(self.addressing.gateway_host as u32)
            .ok_or_else(|| {
                RenderError::invalid(
                    "addressing.gateway_host",
                    format!("{} is not a host in {}", self.addressing.gateway_host, subnet),
                )
            })?;
        Ok(Ipv4Cidr {
            addr,
            prefix_len: subnet.prefix_len,
        })
    }

    /// First and last address of the DHCP pool
    pub fn dhcp_range(&self) -> Result<(Ipv4Addr, Ipv4Addr), RenderError> {
        let subnet = self.lan_subnet()?;
        let a = &self.addressing;
        if a.dhcp_start > a.dhcp_end {
            return Err(RenderError::invalid(
                "addressing.dhcp_start",
                format!("pool start {} is after pool end {}", a.dhcp_start, a.dhcp_end),
            ));
        }
        if (a.dhcp_start..=a.dhcp_end).contains(&a.gateway_host) {
            return Err(RenderError::invalid(
                "addressing.dhcp_start",
                "DHCP pool includes the gateway address",
            ));
        }
        let start = subnet
            .host(a.dhcp_start as u32)
            .ok_or_else(|| RenderError::invalid("addressing.dhcp_start", "not a usable host"))?;
        let end = subnet
            .host(a.dhcp_end as u32)
            .ok_or_else(|| RenderError::invalid("addressing.dhcp_end", "not a usable host"))?;
        Ok((start, end))
    }

    /// Mesh network address plus the node id
    pub fn mesh_address(&self) -> Result<Ipv4Cidr, RenderError> {
        let id = self.node_id()?;
        let net = self.addressing.mesh_network;
        let addr = net.host(id as u32).ok_or_else(|| {
            RenderError::invalid(
                "addressing.mesh_network",
                format!("node id {} does not fit in {}", id, net.network_cidr()),
            )
        })?;
        Ok(Ipv4Cidr {
            addr,
            prefix_len: net.prefix_len,
        })
    }

    /// Dashboard address as a host route
    pub fn ui_cidr(&self) -> Option<Ipv4Cidr> {
        self.addressing.ui_address.map(|addr| Ipv4Cidr {
            addr,
            prefix_len: 32,
        })
    }

    pub fn mgmt_cidr(&self) -> Result<Option<Ipv4Cidr>, RenderError> {
        match self.addressing.mgmt_address {
            None => Ok(None),
            Some(addr) => {
                let prefix_len = self.addressing.mgmt_prefix.unwrap_or(24);
                Ipv4Cidr::new(addr, prefix_len)
                    .map(Some)
                    .map_err(|reason| RenderError::invalid("addressing.mgmt_prefix", reason))
            }
        }
    }

    /// Configured mesh frequency, else the channel's center frequency
    ///
    /// An explicit frequency must be the channel's own.
    pub fn mesh_frequency(&self) -> Result<u32, RenderError> {
        let m = &self.mesh;
        match (m.frequency, validation::channel_to_frequency(&m.band, m.channel)) {
            (Some(freq), Some(expected)) if freq != expected => Err(RenderError::invalid(
                "mesh.frequency",
                format!(
                    "{} MHz does not match channel {} on {} ({} MHz)",
                    freq, m.channel, m.band, expected
                ),
            )),
            (Some(freq), _) | (None, Some(freq)) => Ok(freq),
            (None, None) => Err(RenderError::invalid(
                "mesh.channel",
                format!("no frequency for channel {} on {}", m.channel, m.band),
            )),
        }
    }

    /// Address invariants checked before anything is rendered
    pub fn check_addressing(&self) -> Result<(), RenderError> {
        let gateway = self.lan_gateway()?;
        self.dhcp_range()?;
        self.mesh_address()?;

        let mgmt = self.mgmt_cidr()?;
        if let Some(mgmt) = mgmt {
            if mgmt.addr == gateway.addr {
                return Err(RenderError::invalid(
                    "addressing.mgmt_address",
                    format!("{} collides with the LAN gateway address", mgmt.addr),
                ));
            }
            if Some(mgmt.addr) == self.addressing.ui_address {
                return Err(RenderError::invalid(
                    "addressing.mgmt_address",
                    format!("{} collides with the UI address", mgmt.addr),
                ));
            }
        }
        if self.addressing.ui_address == Some(gateway.addr) {
            return Err(RenderError::invalid(
                "addressing.ui_address",
                "collides with the LAN gateway address",
            ));
        }
        Ok(())
    }

    /// Every interface binding, with its field name
    pub fn interface_bindings(&self) -> [(&'static str, &str); 6] {
        let i = &self.interfaces;
        [
            ("interfaces.ap_iface", i.ap_iface.as_str()),
            ("interfaces.mesh_phy_iface", i.mesh_phy_iface.as_str()),
            ("interfaces.mesh_iface", i.mesh_iface.as_str()),
            ("interfaces.eth_iface", i.eth_iface.as_str()),
            ("interfaces.bridge_name", i.bridge_name.as_str()),
            ("interfaces.batman_iface", i.batman_iface.as_str()),
        ]
    }

    /// Set one dotted key, e.g. `mesh.channel=11`; an empty value unsets it
    ///
    /// Only types are checked here; [`NodeConfig::validate`] checks meaning.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let kind = SETTABLE_KEYS
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| ConfigError::invalid(key, "unknown configuration key"))?;

        let mut doc =
            toml::Value::try_from(&*self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let root = doc
            .as_table_mut()
            .ok_or_else(|| ConfigError::Parse("config is not a table".to_string()))?;

        let (target, leaf) = match key.split_once('.') {
            Some((section, leaf)) => {
                let table = root
                    .entry(section)
                    .or_insert(toml::Value::Table(toml::Table::new()))
                    .as_table_mut()
                    .ok_or_else(|| ConfigError::Parse(format!("'{}' is not a table", section)))?;
                (table, leaf)
            }
            None => (root, key),
        };

        let value = value.trim();
        if value.is_empty() {
            target.remove(leaf);
        } else {
            target.insert(leaf.to_string(), parse_field(key, kind, value)?);
        }

        *self = doc
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::invalid(key, e.message().to_string()))?;
        Ok(())
    }

    /// Current value of a settable key, rendered as text
    pub fn get(&self, key: &str) -> Option<String> {
        let doc = toml::Value::try_from(self).ok()?;
        let value = match key.split_once('.') {
            Some((section, leaf)) => doc.get(section)?.get(leaf)?,
            None => doc.get(key)?,
        };
        Some(match value {
            toml::Value::String(s) => s.clone(),
            toml::Value::Array(items) => items
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("."),
            other => other.to_string(),
        })
    }

    /// Apply `key=value` patches in order
    pub fn apply_patches(&mut self, patches: &[(String, String)]) -> Result<(), ConfigError> {
        for (key, value) in patches {
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Overlay a legacy shell-style `KEY=VALUE` file; returns ignored keys
    pub fn import_kv(&mut self, content: &str) -> Result<Vec<String>, ConfigError> {
        let entries = parse_kv(content);
        let mut ignored = Vec::new();

        for (legacy, value) in &entries {
            let patch: Option<(&str, String)> = match legacy.as_str() {
                "NODE_ID" => Some(("node.id", value.clone())),
                "NODE_NAME" => Some(("node.name", value.clone())),
                "COUNTRY" => Some(("country", value.to_uppercase())),
                "MESH_SSID" => Some(("mesh.ssid", value.clone())),
                "MESH_PASSWORD" => Some(("mesh.passphrase", value.clone())),
                // older name for the same secret
                "SAE_PASSWORD" if !entries.contains_key("MESH_PASSWORD") => {
                    Some(("mesh.passphrase", value.clone()))
                }
                "SAE_PASSWORD" => None,
                "MESH_ENCRYPTION" => Some(("mesh.security", legacy_security(value)?)),
                "MESH_CHANNEL" => Some(("mesh.channel", value.clone())),
                "IF" => Some(("interfaces.mesh_phy_iface", value.clone())),
                "NODE_IP" => Some(("addressing.ui_address", strip_prefix_len(value).0)),
                "SSH_IP" => {
                    let (addr, prefix) = strip_prefix_len(value);
                    if let Some(prefix) = prefix {
                        self.set("addressing.mgmt_prefix", &prefix)?;
                    }
                    Some(("addressing.mgmt_address", addr))
                }
                _ => {
                    ignored.push(legacy.clone());
                    None
                }
            };

            if let Some((key, value)) = patch {
                debug!("Importing {} as {}", legacy, key);
                self.set(key, &value)?;
            }
        }

        Ok(ignored)
    }
}

/// `KEY=VALUE` lines with `#` comments, optional `export`, and shell quoting
fn parse_kv(content: &str) -> BTreeMap<String, String> {
    let mut entries = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        entries.insert(key.trim().to_string(), unquote(value.trim()));
    }
    entries
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == b'"' && last == b'"' {
            return value[1..value.len() - 1].replace("\\\"", "\"");
        }
        if first == b'\'' && last == b'\'' {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

fn strip_prefix_len(value: &str) -> (String, Option<String>) {
    match value.split_once('/') {
        Some((addr, prefix)) => (addr.to_string(), Some(prefix.to_string())),
        None => (value.to_string(), None),
    }
}

fn legacy_security(value: &str) -> Result<String, ConfigError> {
    match value.to_ascii_uppercase().as_str() {
        "OPEN" | "NONE" => Ok("open".to_string()),
        "WPA2" => Ok("wpa2".to_string()),
        "SAE" | "WPA3" => Ok("wpa3".to_string()),
        "WPA2_WPA3" => Ok("mixed".to_string()),
        other => Err(ConfigError::invalid(
            "mesh.security",
            format!("unknown legacy encryption '{}'", other),
        )),
    }
}

/// Outcome of a successful [`reconfigure`]
#[derive(Debug, Clone)]
pub struct Reconfigured {
    pub previous: NodeConfig,
    pub config: NodeConfig,
}

impl Reconfigured {
    pub fn changed(&self) -> bool {
        self.previous != self.config
    }
}

/// The single entry point for changing a persisted NodeConfig
///
/// Loads the current document, applies `edit`, validates the result and
/// persists it. Nothing is written when the edit or validation fails.
pub fn reconfigure<F>(path: &Path, edit: F) -> MeshResult<Reconfigured>
where
    F: FnOnce(&mut NodeConfig) -> Result<(), ConfigError>,
{
    let previous = NodeConfig::load(path)?;
    let mut config = previous.clone();
    edit(&mut config)?;
    config.validate()?;

    let result = Reconfigured { previous, config };
    if result.changed() {
        result.config.save(path)?;
        info!("Saved updated node configuration to {:?}", path);
    } else {
        debug!("Node configuration unchanged");
    }
    Ok(result)
}

const SETUP_PROMPTS: &[(&str, &str)] = &[
    ("node.name", "Node name"),
    ("node.id", "Node id"),
    ("country", "Country code"),
    ("ap.ssid", "Access point SSID"),
    ("ap.security", "Access point security (open/wpa2/wpa3/mixed)"),
    ("ap.passphrase", "Access point passphrase"),
    ("mesh.ssid", "Mesh ID"),
    ("mesh.security", "Mesh security (open/wpa2/wpa3/mixed)"),
    ("mesh.passphrase", "Mesh passphrase"),
    ("mesh.channel", "Mesh channel"),
    ("mesh.routing", "Routing backend (batman/babel)"),
];

const SETUP_ATTEMPTS: usize = 3;

fn prompt<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    label: &str,
    current: Option<String>,
    secret: bool,
) -> MeshResult<String> {
    match (&current, secret) {
        (Some(_), true) => write!(output, "{} [********]: ", label)?,
        (Some(value), false) => write!(output, "{} [{}]: ", label, value)?,
        (None, _) => write!(output, "{}: ", label)?,
    }
    output.flush()?;

    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(ConfigError::Parse("setup aborted: input closed".to_string()).into());
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Interactive first-run/reconfiguration dialogue
///
/// An empty answer keeps the shown value. An answer that fails validation on
/// its own field is re-asked.
pub fn interactive_setup<R: BufRead, W: Write>(
    config: &mut NodeConfig,
    input: &mut R,
    output: &mut W,
) -> MeshResult<()> {
    for (key, label) in SETUP_PROMPTS {
        if key.ends_with("passphrase") {
            let mode_key = key.replace("passphrase", "security");
            if config.get(&mode_key).as_deref() == Some("open") {
                continue;
            }
        }
        ask_field(config, input, output, key, label)?;
    }

    for _ in 0..SETUP_ATTEMPTS {
        let err = match config.validate() {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        writeln!(output, "  {}", err)?;
        let Some(field) = err.field().map(str::to_string) else {
            return Err(err.into());
        };
        let label = SETUP_PROMPTS
            .iter()
            .find(|(k, _)| *k == field)
            .map(|(_, l)| *l)
            .unwrap_or(field.as_str());
        ask_field(config, input, output, &field, label)?;
    }

    config.validate().map_err(Into::into)
}

fn ask_field<R: BufRead, W: Write>(
    config: &mut NodeConfig,
    input: &mut R,
    output: &mut W,
    key: &str,
    label: &str,
) -> MeshResult<()> {
    let secret = key.ends_with("passphrase");
    for _ in 0..SETUP_ATTEMPTS {
        let answer = prompt(input, output, label, config.get(key), secret)?;
        if answer.is_empty() {
            return Ok(());
        }
        let mut candidate = config.clone();
        if let Err(e) = candidate.set(key, &answer) {
            writeln!(output, "  {}", e)?;
            continue;
        }
        // other fields may still be incomplete at this point
        match candidate.validate() {
            Err(e) if e.field() == Some(key) => writeln!(output, "  {}", e)?,
            _ => {
                *config = candidate;
                return Ok(());
            }
        }
    }
    Err(ConfigError::invalid(key, "too many invalid answers").into())
}

/// Node 1 with a WPA2 access point and an open batman mesh
#[cfg(test)]
pub(crate) fn test_config() -> NodeConfig {
    let mut config = NodeConfig::first_run("node-a", 1);
    config.ap.security = "wpa2".to_string();
    config.ap.passphrase = Some("correct horse".to_string());
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> NodeConfig {
        test_config()
    }

    #[test]
    fn first_run_defaults_validate() {
        let config = NodeConfig::first_run("node-a", 7);
        config.validate().unwrap();
        assert_eq!(config.lan_subnet().unwrap().to_string(), "192.168.207.0/24");
        assert_eq!(config.lan_gateway().unwrap().to_string(), "192.168.207.1/24");
        assert_eq!(config.mesh_address().unwrap().to_string(), "10.99.0.7/16");
        assert_eq!(config.mesh_frequency().unwrap(), 2412);
    }

    #[test]
    fn explicit_frequency_must_match_channel() {
        let mut config = sample();
        config.mesh.frequency = Some(2412);
        config.validate().unwrap();

        config.mesh.frequency = Some(2437);
        let err = config.validate().unwrap_err();
        assert_eq!(err.field(), Some("mesh.frequency"));
        assert!(err.to_string().contains("channel 1"));

        config.mesh.channel = 6;
        config.validate().unwrap();
        assert_eq!(config.mesh_frequency().unwrap(), 2437);
    }

    #[test]
    fn node_id_overflow_is_rejected_on_node_id() {
        let mut config = sample();
        config.node.id = Some(56);
        let err = config.validate().unwrap_err();
        assert_eq!(err.field(), Some("node.id"));

        config.node.id = Some(55);
        config.validate().unwrap();
    }

    #[test]
    fn missing_id_is_missing_field() {
        let mut config = sample();
        config.node.id = None;
        assert_eq!(
            config.validate().unwrap_err(),
            ConfigError::Missing {
                field: "node.id".to_string()
            }
        );
    }

    #[test]
    fn mgmt_address_may_not_collide() {
        let mut config = sample();
        config.addressing.mgmt_address = Some("192.168.201.1".parse().unwrap());
        let err = config.validate().unwrap_err();
        assert_eq!(err.field(), Some("addressing.mgmt_address"));

        config.addressing.mgmt_address = Some("10.20.0.5".parse().unwrap());
        config.addressing.ui_address = Some("10.20.0.5".parse().unwrap());
        let err = config.validate().unwrap_err();
        assert_eq!(err.field(), Some("addressing.mgmt_address"));

        config.addressing.ui_address = Some("10.20.0.6".parse().unwrap());
        config.validate().unwrap();
    }

    #[test]
    fn set_handles_types_and_unset() {
        let mut config = sample();
        config.set("mesh.channel", "11").unwrap();
        config.set("mesh.routing", "babel").unwrap();
        config.set("ap.hidden", "yes").unwrap();
        config.set("addressing.lan_octets", "172.16").unwrap();
        config.set("mesh.ssid", "1234").unwrap();
        assert_eq!(config.mesh.channel, 11);
        assert_eq!(config.mesh.routing, RoutingBackend::Babel);
        assert!(config.ap.hidden);
        assert_eq!(config.addressing.lan_octets, [172, 16]);
        assert_eq!(config.mesh.ssid.as_deref(), Some("1234"));
        assert_eq!(config.get("addressing.lan_octets").as_deref(), Some("172.16"));

        config.set("ap.passphrase", "").unwrap();
        assert_eq!(config.ap.passphrase, None);

        assert!(config.set("mesh.bogus", "1").is_err());
        assert!(config.set("mesh.channel", "eleven").is_err());
        assert!(config.set("mesh.routing", "olsr").is_err());
        assert_eq!(config.mesh.routing, RoutingBackend::Babel);
    }

    #[test]
    fn save_is_owner_only_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        let config = sample();
        config.save(&path).unwrap();

        assert_eq!(crate::secure_file::file_mode(&path).unwrap(), 0o600);
        assert_eq!(NodeConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn reconfigure_rejects_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        sample().save(&path).unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        let patches = vec![("ap.passphrase".to_string(), "short".to_string())];
        let err = reconfigure(&path, |c| c.apply_patches(&patches)).unwrap_err();
        assert!(err.to_string().contains("ap.passphrase"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);

        let patches = vec![("mesh.channel".to_string(), "6".to_string())];
        let result = reconfigure(&path, |c| c.apply_patches(&patches)).unwrap();
        assert!(result.changed());
        assert_eq!(NodeConfig::load(&path).unwrap().mesh.channel, 6);
    }

    #[test]
    fn import_legacy_kv_file() {
        let legacy = r#"
# orbis node settings
NODE_ID=3
NODE_NAME="Roof \"North\""
MESH_SSID="orbis mesh"
SAE_PASSWORD="old-secret-1"
MESH_PASSWORD='new-secret-1'
MESH_ENCRYPTION=SAE
COUNTRY=de
MESH_CHANNEL=11
export IF=wlx00c0ca
SSH_IP=10.20.0.3/16
FAVOURITE_COLOUR=blue
"#;
        let mut config = sample();
        let ignored = config.import_kv(legacy).unwrap();

        assert_eq!(ignored, vec!["FAVOURITE_COLOUR".to_string()]);
        assert_eq!(config.node.id, Some(3));
        assert_eq!(config.node.name.as_deref(), Some("Roof \"North\""));
        assert_eq!(config.mesh.ssid.as_deref(), Some("orbis mesh"));
        assert_eq!(config.mesh.passphrase.as_deref(), Some("new-secret-1"));
        assert_eq!(config.mesh.security, "wpa3");
        assert_eq!(config.country.as_deref(), Some("DE"));
        assert_eq!(config.mesh.channel, 11);
        assert_eq!(config.interfaces.mesh_phy_iface, "wlx00c0ca");
        assert_eq!(config.mgmt_cidr().unwrap().unwrap().to_string(), "10.20.0.3/16");
        config.validate().unwrap();
    }

    #[test]
    fn interactive_setup_keeps_defaults_and_reasks_invalid() {
        let mut config = NodeConfig::first_run("node-a", 1);
        // name, id, country, ap ssid, ap security, ap passphrase (too short,
        // then valid), mesh id, mesh security, mesh channel, routing
        let answers = "roof\n4\n\n\nwpa2\nshort\nlong enough pass\n\n\n\nbabel\n";
        let mut input = Cursor::new(answers.as_bytes());
        let mut output = Vec::new();

        interactive_setup(&mut config, &mut input, &mut output).unwrap();

        assert_eq!(config.node.name.as_deref(), Some("roof"));
        assert_eq!(config.node.id, Some(4));
        assert_eq!(config.ap.passphrase.as_deref(), Some("long enough pass"));
        assert_eq!(config.mesh.routing, RoutingBackend::Babel);
        let transcript = String::from_utf8(output).unwrap();
        assert!(transcript.contains("Node name [node-a]: "));
        assert!(transcript.contains("ap.passphrase"));
    }

    #[test]
    fn interactive_setup_fails_on_closed_input() {
        let mut config = NodeConfig::first_run("node-a", 1);
        let mut input = Cursor::new(&b"roof\n"[..]);
        let mut output = Vec::new();
        assert!(interactive_setup(&mut config, &mut input, &mut output).is_err());
    }
}
