//! wpa_supplicant for secured 802.11s meshes
//!
//! Renders the mesh network block and controls the supplicant instance bound
//! to the mesh interface. Open meshes are joined with `iw` instead.

use crate::error::{MeshError, MeshResult, RenderError};
use crate::node_config::{NodeConfig, SecurityMode};
use crate::poll::{poll_until, Deadline};
use crate::validation;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Control interface directory for wpa_supplicant
const CTRL_INTERFACE: &str = "/run/wpa_supplicant";

/// 802.11s mesh network block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshSupplicantConfig {
    pub ctrl_interface: String,
    pub country_code: String,
    pub mesh_id: String,
    pub frequency: u32,
    /// `None` for an open mesh, otherwise the SAE password
    pub sae_password: Option<String>,
    pub beacon_interval: u32,
    pub forwarding: bool,
}

impl MeshSupplicantConfig {
    pub fn from_node(config: &NodeConfig) -> Result<Self, RenderError> {
        validation::check_interface_field("interfaces.mesh_iface", &config.interfaces.mesh_iface)?;

        let mesh_id = config
            .mesh
            .ssid
            .as_deref()
            .ok_or_else(|| RenderError::missing("mesh.ssid"))?;
        validation::validate_ssid("mesh.ssid", mesh_id)?;

        let country_code = config.country_code()?;
        validation::validate_wifi_channel(
            "mesh.channel",
            config.mesh.channel,
            &config.mesh.band,
            &country_code,
        )?;
        let frequency = config.mesh_frequency()?;

        // secured 802.11s is SAE only, whatever WPA class was asked for
        let sae_password = match config.mesh_security()? {
            SecurityMode::Open => None,
            SecurityMode::Wpa2 | SecurityMode::Wpa3 | SecurityMode::Mixed => {
                let passphrase = config
                    .mesh
                    .passphrase
                    .as_deref()
                    .ok_or_else(|| RenderError::missing("mesh.passphrase"))?;
                validation::validate_passphrase("mesh.passphrase", passphrase)?;
                Some(passphrase.to_string())
            }
        };

        if !(10..=10000).contains(&config.mesh.beacon_interval) {
            return Err(RenderError::invalid(
                "mesh.beacon_interval",
                format!("{} TU is outside 10-10000", config.mesh.beacon_interval),
            ));
        }

        Ok(Self {
            ctrl_interface: CTRL_INTERFACE.to_string(),
            country_code,
            mesh_id: mesh_id.to_string(),
            frequency,
            sae_password,
            beacon_interval: config.mesh.beacon_interval,
            forwarding: config.mesh.forwarding,
        })
    }

    pub fn is_secured(&self) -> bool {
        self.sae_password.is_some()
    }

    /// wpa_supplicant-mesh.conf contents
    pub fn render(&self) -> String {
        let mut conf = String::new();
        conf.push_str(&format!("ctrl_interface=DIR={}\n", self.ctrl_interface));
        conf.push_str("update_config=0\n");
        conf.push_str(&format!("country={}\n", self.country_code));
        conf.push_str("user_mpm=1\n\n");

        conf.push_str("network={\n");
        conf.push_str(&format!("    ssid={}\n", quote_ssid(&self.mesh_id)));
        conf.push_str("    mode=5\n");
        conf.push_str(&format!("    frequency={}\n", self.frequency));
        match self.sae_password {
            Some(ref password) => {
                conf.push_str("    key_mgmt=SAE\n");
                conf.push_str(&format!("    sae_password=\"{}\"\n", password));
                conf.push_str("    ieee80211w=1\n");
            }
            None => conf.push_str("    key_mgmt=NONE\n"),
        }
        conf.push_str(&format!("    beacon_int={}\n", self.beacon_interval));
        conf.push_str(&format!("    mesh_fwding={}\n", self.forwarding as u8));
        conf.push_str("}\n");
        conf
    }
}

/// Quoted SSID, or hex when quoting would be ambiguous
fn quote_ssid(ssid: &str) -> String {
    if ssid.is_ascii() && !ssid.contains('"') {
        format!("\"{}\"", ssid)
    } else {
        ssid.bytes().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Controls the supplicant instance on the mesh interface
pub struct MeshSupplicant {
    wpa_bin: PathBuf,
    wpa_cli_bin: PathBuf,
    ctrl_interface: PathBuf,
    pid_dir: PathBuf,
}

impl MeshSupplicant {
    pub fn new(ctrl_interface: PathBuf, pid_dir: PathBuf) -> Self {
        Self {
            wpa_bin: PathBuf::from("/usr/sbin/wpa_supplicant"),
            wpa_cli_bin: PathBuf::from("/usr/sbin/wpa_cli"),
            ctrl_interface,
            pid_dir,
        }
    }

    fn pid_file(&self, interface: &str) -> PathBuf {
        self.pid_dir.join(format!("wpa_supplicant-{}.pid", interface))
    }

    fn process_pattern(interface: &str) -> String {
        format!("wpa_supplicant.*-i\\s*{}( |$)", interface)
    }

    /// Check if a supplicant is running on an interface
    pub async fn is_running(&self, interface: &str) -> bool {
        if validation::validate_interface_name(interface).is_err() {
            return false;
        }

        let output = Command::new("pgrep")
            .kill_on_drop(true)
            .arg("-f")
            .arg(Self::process_pattern(interface))
            .output()
            .await;

        matches!(output, Ok(output) if output.status.success())
    }

    /// Start the supplicant on `interface` with a rendered mesh config
    pub async fn start(&self, interface: &str, config_path: &Path, timeout: Duration) -> MeshResult<()> {
        validation::validate_interface_name(interface)?;

        info!("Starting wpa_supplicant on {} with {:?}", interface, config_path);
        tokio::fs::create_dir_all(&self.pid_dir).await?;

        let output = Command::new(&self.wpa_bin)
            .kill_on_drop(true)
            .arg("-B")
            .arg("-D")
            .arg("nl80211")
            .arg("-i")
            .arg(interface)
            .arg("-c")
            .arg(config_path)
            .arg("-P")
            .arg(self.pid_file(interface))
            .output()
            .await
            .map_err(|e| MeshError::CommandFailed {
                cmd: format!("wpa_supplicant -i {}", interface),
                code: None,
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(MeshError::CommandFailed {
                cmd: format!("wpa_supplicant -i {}", interface),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        let socket = self.ctrl_interface.join(interface);
        let deadline = Deadline::after(timeout);
        poll_until(timeout, Duration::from_millis(200), &deadline, || {
            let socket = socket.clone();
            async move { tokio::fs::metadata(&socket).await.ok().map(|_| ()) }
        })
        .await
        .map_err(|_| {
            MeshError::Service(format!(
                "wpa_supplicant started but control socket not ready on {}",
                interface
            ))
        })?;

        info!("wpa_supplicant started on {}", interface);
        Ok(())
    }

    /// Stop the supplicant on an interface; quiet when none is running
    pub async fn stop(&self, interface: &str) -> MeshResult<()> {
        validation::validate_interface_name(interface)?;

        if !self.is_running(interface).await {
            debug!("wpa_supplicant not running on {}", interface);
            return Ok(());
        }

        info!("Stopping wpa_supplicant on {}", interface);
        let _ = self.wpa_cli(interface, &["terminate"]).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        if self.is_running(interface).await {
            warn!("wpa_supplicant didn't terminate gracefully, forcing kill");
            let output = Command::new("pkill")
                .kill_on_drop(true)
                .arg("-f")
                .arg(Self::process_pattern(interface))
                .output()
                .await?;
            // 1 = nothing matched, which is what we want anyway
            if !matches!(output.status.code(), Some(0) | Some(1)) {
                return Err(MeshError::CommandFailed {
                    cmd: format!("pkill -f {}", Self::process_pattern(interface)),
                    code: output.status.code(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                });
            }
        }

        let _ = tokio::fs::remove_file(self.pid_file(interface)).await;
        Ok(())
    }

    /// Remove a control socket left behind by a dead supplicant
    pub async fn remove_stale_socket(&self, interface: &str) -> MeshResult<bool> {
        validation::validate_interface_name(interface)?;
        let socket = self.ctrl_interface.join(interface);
        match tokio::fs::remove_file(&socket).await {
            Ok(()) => {
                debug!("Removed stale control socket {:?}", socket);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn wpa_cli(&self, interface: &str, args: &[&str]) -> MeshResult<String> {
        let output = Command::new(&self.wpa_cli_bin)
            .kill_on_drop(true)
            .arg("-p")
            .arg(&self.ctrl_interface)
            .arg("-i")
            .arg(interface)
            .args(args)
            .output()
            .await
            .map_err(|e| MeshError::CommandFailed {
                cmd: format!("wpa_cli -i {} {}", interface, args.join(" ")),
                code: None,
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(MeshError::CommandFailed {
                cmd: format!("wpa_cli -i {} {}", interface, args.join(" ")),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
