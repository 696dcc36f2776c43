//! Runtime configuration for meshctl and meshctld
//!
//! This is the tool's own configuration (paths, timeouts, telemetry range).
//! The node's declarative network configuration lives in [`crate::node_config`].

use crate::error::{ConfigError, MeshResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/meshctl/meshctl.toml";

/// Main meshctl configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshctlConfig {
    #[serde(default)]
    pub paths: ConfigPaths,
    #[serde(default)]
    pub reconcile: ReconcileSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub services: ServiceSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPaths {
    /// NodeConfig document
    #[serde(default = "default_node_config")]
    pub node_config: PathBuf,
    /// Directory receiving rendered daemon configs and the hash side file
    #[serde(default = "default_render_dir")]
    pub render_dir: PathBuf,
    /// Runtime state (pid files, control sockets)
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// wpa_supplicant control socket directory
    #[serde(default = "default_wpa_ctrl_dir")]
    pub wpa_ctrl_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileSettings {
    /// Wait for a freshly created interface to appear
    #[serde(default = "default_iface_create_timeout_ms")]
    pub iface_create_timeout_ms: u64,
    /// Informational wait for the first mesh peer
    #[serde(default = "default_first_peer_timeout_ms")]
    pub first_peer_timeout_ms: u64,
    /// Wait for the kernel to assign an IPv6 link-local before forcing one
    #[serde(default = "default_link_local_grace_ms")]
    pub link_local_grace_ms: u64,
    /// Hard limit on one whole reconciliation pass
    #[serde(default = "default_reconcile_deadline_secs")]
    pub deadline_secs: u64,
    /// Interval between re-reads of OS state while polling
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Limit on any single OS read or mutation within a pass
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Periodic reconcile interval in the daemon
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySettings {
    #[serde(default = "default_telemetry_poll_ms")]
    pub poll_interval_ms: u64,
    /// Neighbors not seen for longer than this are marked inactive
    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,
    /// dBm mapped to 0 %
    #[serde(default = "default_signal_min_dbm")]
    pub signal_min_dbm: i32,
    /// dBm mapped to 100 %
    #[serde(default = "default_signal_max_dbm")]
    pub signal_max_dbm: i32,
    #[serde(default = "default_subquery_timeout_ms")]
    pub subquery_timeout_ms: u64,
    /// Overall latency budget for one collection
    #[serde(default = "default_collect_budget_ms")]
    pub budget_ms: u64,
    #[serde(default = "default_power_supply_dir")]
    pub power_supply_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    /// Per-daemon dry-run timeout
    #[serde(default = "default_dry_run_timeout_ms")]
    pub dry_run_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_api_bind")]
    pub bind: String,
    #[serde(default = "default_uplink_ttl_secs")]
    pub uplink_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Units restarted, in order, after a reconfiguration
    #[serde(default = "default_restart_order")]
    pub restart_order: Vec<String>,
    #[serde(default = "default_hostapd_unit")]
    pub hostapd_unit: String,
    #[serde(default = "default_dnsmasq_unit")]
    pub dnsmasq_unit: String,
    #[serde(default = "default_babeld_unit")]
    pub babeld_unit: String,
}

fn default_node_config() -> PathBuf {
    PathBuf::from("/etc/meshctl/node.toml")
}

fn default_render_dir() -> PathBuf {
    PathBuf::from("/etc/meshctl/rendered")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/run/meshctl")
}

fn default_wpa_ctrl_dir() -> PathBuf {
    PathBuf::from("/run/wpa_supplicant")
}

fn default_iface_create_timeout_ms() -> u64 {
    3000
}

fn default_first_peer_timeout_ms() -> u64 {
    5000
}

fn default_link_local_grace_ms() -> u64 {
    2000
}

fn default_reconcile_deadline_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_command_timeout_ms() -> u64 {
    10_000
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_telemetry_poll_ms() -> u64 {
    1000
}

fn default_node_timeout_secs() -> u64 {
    30
}

fn default_signal_min_dbm() -> i32 {
    -95
}

fn default_signal_max_dbm() -> i32 {
    -35
}

fn default_subquery_timeout_ms() -> u64 {
    500
}

fn default_collect_budget_ms() -> u64 {
    800
}

fn default_power_supply_dir() -> PathBuf {
    PathBuf::from("/sys/class/power_supply")
}

fn default_health_interval_secs() -> u64 {
    300
}

fn default_dry_run_timeout_ms() -> u64 {
    3000
}

fn default_api_bind() -> String {
    "127.0.0.1:8088".to_string()
}

fn default_uplink_ttl_secs() -> u64 {
    5
}

fn default_restart_order() -> Vec<String> {
    ["systemd-networkd", "dnsmasq", "hostapd", "babeld"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_hostapd_unit() -> String {
    "hostapd".to_string()
}

fn default_dnsmasq_unit() -> String {
    "dnsmasq".to_string()
}

fn default_babeld_unit() -> String {
    "babeld".to_string()
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            node_config: default_node_config(),
            render_dir: default_render_dir(),
            state_dir: default_state_dir(),
            wpa_ctrl_dir: default_wpa_ctrl_dir(),
        }
    }
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            iface_create_timeout_ms: default_iface_create_timeout_ms(),
            first_peer_timeout_ms: default_first_peer_timeout_ms(),
            link_local_grace_ms: default_link_local_grace_ms(),
            deadline_secs: default_reconcile_deadline_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            interval_secs: default_reconcile_interval_secs(),
        }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_telemetry_poll_ms(),
            node_timeout_secs: default_node_timeout_secs(),
            signal_min_dbm: default_signal_min_dbm(),
            signal_max_dbm: default_signal_max_dbm(),
            subquery_timeout_ms: default_subquery_timeout_ms(),
            budget_ms: default_collect_budget_ms(),
            power_supply_dir: default_power_supply_dir(),
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            dry_run_timeout_ms: default_dry_run_timeout_ms(),
        }
    }
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            bind: default_api_bind(),
            uplink_ttl_secs: default_uplink_ttl_secs(),
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            restart_order: default_restart_order(),
            hostapd_unit: default_hostapd_unit(),
            dnsmasq_unit: default_dnsmasq_unit(),
            babeld_unit: default_babeld_unit(),
        }
    }
}

impl ReconcileSettings {
    pub fn iface_create_timeout(&self) -> Duration {
        Duration::from_millis(self.iface_create_timeout_ms)
    }

    pub fn first_peer_timeout(&self) -> Duration {
        Duration::from_millis(self.first_peer_timeout_ms)
    }

    pub fn link_local_grace(&self) -> Duration {
        Duration::from_millis(self.link_local_grace_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms.max(1))
    }
}

impl TelemetrySettings {
    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }

    pub fn subquery_timeout(&self) -> Duration {
        Duration::from_millis(self.subquery_timeout_ms)
    }

    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }
}

impl MeshctlConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> MeshResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConfigError::Parse(format!(
                "Failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let config: MeshctlConfig = toml::from_str(&content)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when it exists, defaults otherwise
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> MeshResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> MeshResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Parse(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telemetry.signal_min_dbm >= self.telemetry.signal_max_dbm {
            return Err(ConfigError::invalid(
                "telemetry.signal_min_dbm",
                "must be lower than telemetry.signal_max_dbm",
            ));
        }
        if self.api.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::invalid(
                "api.bind",
                format!("'{}' is not a socket address", self.api.bind),
            ));
        }
        Ok(())
    }

    /// Ensure all directories exist
    pub fn ensure_directories(&self) -> MeshResult<()> {
        for dir in [&self.paths.render_dir, &self.paths.state_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
