//! Config Renderer
//!
//! Maps a [`NodeConfig`] to the full set of daemon configuration files.
//! [`render`] is pure; [`RenderedConfigSet::write_to`] and [`apply`] persist.

use crate::babeld::BabeldConfig;
use crate::batman::BatmanParams;
use crate::dnsmasq::DnsmasqConfig;
use crate::error::{MeshResult, RenderError};
use crate::hostapd::HostapdConfig;
use crate::node_config::{NodeConfig, RoutingBackend};
use crate::secure_file::{write_secure, PRIVATE_MODE};
use crate::validation;
use crate::wpa_supplicant::MeshSupplicantConfig;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Side file holding the hash of the last written set
pub const HASH_FILE: &str = ".render-hash";

pub const HOSTAPD: &str = "hostapd";
pub const DNSMASQ: &str = "dnsmasq";
pub const WPA_SUPPLICANT: &str = "wpa_supplicant";
pub const BABELD: &str = "babeld";
pub const BATMAN: &str = "batman";

/// Supplicant config used for secured mesh joins
pub const MESH_SUPPLICANT_FILE: &str = "wpa_supplicant-mesh.conf";
pub const BABELD_FILE: &str = "babeld.conf";
pub const BATMAN_FILE: &str = "batman-adv.conf";

/// Every file a set may contain; the ones a set leaves out are removed
const MANAGED_FILES: [&str; 5] = [
    "hostapd.conf",
    "dnsmasq.conf",
    MESH_SUPPLICANT_FILE,
    BABELD_FILE,
    BATMAN_FILE,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedFile {
    pub filename: String,
    #[serde(skip_serializing)]
    pub content: String,
    /// SHA-256 of `content`, hex
    pub hash: String,
}

/// Generated daemon configs keyed by daemon name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RenderedConfigSet {
    pub files: BTreeMap<String, RenderedFile>,
    /// Hash over every output-affecting input, via the file hashes
    pub config_hash: String,
}

fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

fn validate_identity(config: &NodeConfig) -> Result<(), RenderError> {
    let name = config
        .node
        .name
        .as_deref()
        .ok_or_else(|| RenderError::missing("node.name"))?;
    if name.trim().is_empty() || name.len() > 63 {
        return Err(RenderError::invalid("node.name", "must be 1-63 characters"));
    }
    validation::sanitize_config_value("node.name", name)?;
    Ok(())
}

/// Render every daemon config for `config`
///
/// All validation happens before any text is emitted. Identical inputs give
/// identical output; fields that reach no file (the node name) do not change
/// the hash.
pub fn render(config: &NodeConfig) -> Result<RenderedConfigSet, RenderError> {
    validate_identity(config)?;
    for (field, name) in config.interface_bindings() {
        validation::check_interface_field(field, name)?;
    }
    config.check_addressing()?;

    let hostapd = HostapdConfig::from_node(config)?;
    let dnsmasq = DnsmasqConfig::from_node(config)?;
    let supplicant = MeshSupplicantConfig::from_node(config)?;
    let routing = match config.mesh.routing {
        RoutingBackend::Babel => (BABELD, BABELD_FILE, BabeldConfig::from_node(config)?.render()),
        RoutingBackend::Batman => (BATMAN, BATMAN_FILE, BatmanParams::from_node(config)?.render()),
    };

    let mut set = RenderedConfigSet::default();
    set.insert(HOSTAPD, "hostapd.conf", hostapd.render());
    set.insert(DNSMASQ, "dnsmasq.conf", dnsmasq.render());
    set.insert(WPA_SUPPLICANT, MESH_SUPPLICANT_FILE, supplicant.render());
    set.insert(routing.0, routing.1, routing.2);
    set.config_hash = set.compute_hash();
    Ok(set)
}

impl RenderedConfigSet {
    fn insert(&mut self, daemon: &str, filename: &str, content: String) {
        let hash = sha256_hex(content.as_bytes());
        self.files.insert(
            daemon.to_string(),
            RenderedFile {
                filename: filename.to_string(),
                content,
                hash,
            },
        );
    }

    fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (daemon, file) in &self.files {
            hasher.update(daemon.as_bytes());
            hasher.update(b"\0");
            hasher.update(file.filename.as_bytes());
            hasher.update(b"\0");
            hasher.update(file.hash.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, daemon: &str) -> Option<&RenderedFile> {
        self.files.get(daemon)
    }

    /// Write every file (0600, atomic), drop managed files this set no
    /// longer has, then write the hash side file
    pub fn write_to(&self, dir: &Path) -> MeshResult<()> {
        std::fs::create_dir_all(dir)?;
        for file in self.files.values() {
            write_secure(&dir.join(&file.filename), &file.content, PRIVATE_MODE)?;
        }
        for stale in MANAGED_FILES
            .iter()
            .filter(|name| !self.files.values().any(|f| f.filename == **name))
        {
            match std::fs::remove_file(dir.join(stale)) {
                Ok(()) => info!("Removed {} from {:?}", stale, dir),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        write_secure(&dir.join(HASH_FILE), &format!("{}\n", self.config_hash), PRIVATE_MODE)?;
        debug!("Wrote {} rendered files to {:?}", self.files.len(), dir);
        Ok(())
    }

    /// Whether `dir` already holds exactly this set
    pub fn is_current(&self, dir: &Path) -> bool {
        stored_hash(dir).as_deref() == Some(self.config_hash.as_str())
            && self
                .files
                .values()
                .all(|f| dir.join(&f.filename).exists())
    }

    /// Daemons whose file in `dir` differs from this set
    pub fn changed_daemons(&self, dir: &Path) -> Vec<String> {
        self.files
            .iter()
            .filter(|(_, file)| match std::fs::read(dir.join(&file.filename)) {
                Ok(existing) => sha256_hex(&existing) != file.hash,
                Err(_) => true,
            })
            .map(|(daemon, _)| daemon.clone())
            .collect()
    }
}

/// Hash recorded by the last [`RenderedConfigSet::write_to`]
pub fn stored_hash(dir: &Path) -> Option<String> {
    std::fs::read_to_string(dir.join(HASH_FILE))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Result of [`apply`]
#[derive(Debug, Clone)]
pub struct RenderOutcome {
    pub set: RenderedConfigSet,
    /// Daemons whose config changed and which need a restart
    pub changed: Vec<String>,
}

impl RenderOutcome {
    pub fn is_unchanged(&self) -> bool {
        self.changed.is_empty()
    }
}

/// Render and write when the stored hash differs
pub fn apply(config: &NodeConfig, dir: &Path) -> MeshResult<RenderOutcome> {
    let set = render(config)?;
    if set.is_current(dir) {
        debug!("Rendered configs in {:?} are current", dir);
        return Ok(RenderOutcome {
            set,
            changed: Vec::new(),
        });
    }

    let changed = set.changed_daemons(dir);
    set.write_to(dir)?;
    info!("Rendered configs updated: {}", changed.join(", "));
    Ok(RenderOutcome { set, changed })
}
