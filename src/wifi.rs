//! WiFi device control
//!
//! Low-level radio management using the iw command

use crate::error::{MeshError, MeshResult};
use crate::validation;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiDeviceInfo {
    pub interface: String,
    pub type_: Option<String>,
    pub wiphy: Option<u32>,
    pub channel: Option<u32>,
    pub frequency: Option<u32>,
    pub txpower: Option<String>,
    /// SSID for managed/AP interfaces, mesh ID for mesh points
    pub ssid: Option<String>,
}

impl WifiDeviceInfo {
    pub fn phy_name(&self) -> Option<String> {
        self.wiphy.map(|n| format!("phy{}", n))
    }
}

/// A wireless PHY and the interfaces currently on it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhyInfo {
    pub name: String,
    pub supports_mesh_point: bool,
    pub interfaces: Vec<String>,
    /// Every frequency the hardware lists, disabled ones included
    #[serde(default)]
    pub frequencies: Vec<u32>,
}

/// One channel a mesh may be configured on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelOption {
    pub band: &'static str,
    pub channel: u8,
    pub freq_mhz: u32,
}

impl PhyInfo {
    pub fn bands(&self) -> Vec<&'static str> {
        let mut bands = Vec::new();
        if self.frequencies.iter().any(|f| (2400..=2500).contains(f)) {
            bands.push("2.4GHz");
        }
        if self.frequencies.iter().any(|f| (4900..=5900).contains(f)) {
            bands.push("5GHz");
        }
        bands
    }

    /// Channels `country` allows that this radio can tune to, by band then channel
    pub fn channels(&self, country: &str) -> Vec<ChannelOption> {
        self.bands()
            .into_iter()
            .flat_map(|band| {
                validation::allowed_channels(band, country)
                    .into_iter()
                    .filter_map(move |channel| {
                        validation::channel_to_frequency(band, channel).map(|freq_mhz| ChannelOption {
                            band,
                            channel,
                            freq_mhz,
                        })
                    })
            })
            .filter(|c| self.frequencies.contains(&c.freq_mhz))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegDomain {
    pub country: Option<String>,
    pub dfs_region: Option<String>,
}

/// Arguments of an open 802.11s join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshJoinParams {
    pub mesh_id: String,
    pub frequency: u32,
    pub beacon_interval: u32,
    pub forwarding: bool,
    pub root_mode: bool,
}

impl MeshJoinParams {
    /// `mesh_hwmp_rootmode` value: proactive RANN when this node is root
    pub fn hwmp_root_mode(&self) -> u8 {
        if self.root_mode {
            4
        } else {
            0
        }
    }

    fn iw_args(&self, interface: &str) -> Vec<String> {
        vec![
            "dev".to_string(),
            interface.to_string(),
            "mesh".to_string(),
            "join".to_string(),
            self.mesh_id.clone(),
            "freq".to_string(),
            self.frequency.to_string(),
            "HT20".to_string(),
            "beacon-interval".to_string(),
            self.beacon_interval.to_string(),
            format!("mesh_fwding={}", self.forwarding as u8),
            format!("mesh_hwmp_rootmode={}", self.hwmp_root_mode()),
        ]
    }
}

/// WiFi controller
pub struct WifiController {}

impl WifiController {
    pub fn new() -> Self {
        Self {}
    }

    /// Get WiFi device information
    pub async fn get_dev_info(&self, interface: &str) -> MeshResult<WifiDeviceInfo> {
        validation::validate_interface_name(interface)?;
        let output = self.run_iw(&["dev", interface, "info"]).await?;
        Ok(parse_dev_info(interface, &output))
    }

    /// All PHYs with mesh point support and their current interfaces
    pub async fn phys(&self) -> MeshResult<Vec<PhyInfo>> {
        let list = self.run_iw(&["list"]).await?;
        let dev = self.run_iw(&["dev"]).await?;
        let mut phys = parse_iw_list(&list);
        for (phy, interfaces) in parse_iw_dev(&dev) {
            if let Some(info) = phys.iter_mut().find(|p| p.name == phy) {
                info.interfaces = interfaces;
            }
        }
        Ok(phys)
    }

    /// Get regulatory domain
    pub async fn get_reg_domain(&self) -> MeshResult<RegDomain> {
        let output = self.run_iw(&["reg", "get"]).await?;
        Ok(parse_reg_domain(&output))
    }

    /// Set regulatory domain
    pub async fn set_reg_domain(&self, country: &str) -> MeshResult<()> {
        if country.len() != 2 || !country.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(MeshError::InvalidParameter(
                "Country code must be 2 uppercase letters".to_string(),
            ));
        }

        self.run_iw_no_output(&["reg", "set", country]).await
    }

    /// Add a mesh point interface on `phy`
    pub async fn create_mesh_interface(&self, phy: &str, name: &str) -> MeshResult<()> {
        validation::validate_interface_name(name)?;
        self.run_iw_no_output(&["phy", phy, "interface", "add", name, "type", "mp"])
            .await
    }

    /// Switch an existing interface to mesh point mode; it must be down
    pub async fn set_mesh_point_type(&self, interface: &str) -> MeshResult<()> {
        validation::validate_interface_name(interface)?;
        self.run_iw_no_output(&["dev", interface, "set", "type", "mp"]).await
    }

    pub async fn mesh_join(&self, interface: &str, params: &MeshJoinParams) -> MeshResult<()> {
        validation::validate_interface_name(interface)?;
        let args = params.iw_args(interface);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_iw_no_output(&args).await
    }

    /// `iw dev <if> set mesh_param <key> <value>` on a joined interface
    pub async fn set_mesh_param(&self, interface: &str, key: &str, value: &str) -> MeshResult<()> {
        validation::validate_interface_name(interface)?;
        let valid_key = key.starts_with("mesh_")
            && key.chars().all(|c| c.is_ascii_lowercase() || c == '_');
        if !valid_key || value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
            return Err(MeshError::InvalidParameter(format!(
                "invalid mesh parameter {}={}",
                key, value
            )));
        }
        self.run_iw_no_output(&["dev", interface, "set", "mesh_param", key, value])
            .await
    }

    pub async fn mesh_leave(&self, interface: &str) -> MeshResult<()> {
        validation::validate_interface_name(interface)?;
        self.run_iw_no_output(&["dev", interface, "mesh", "leave"]).await
    }

    /// Raw `iw dev <if> station dump` output
    pub async fn station_dump(&self, interface: &str) -> MeshResult<String> {
        validation::validate_interface_name(interface)?;
        self.run_iw(&["dev", interface, "station", "dump"]).await
    }

    // === Helper functions ===

    async fn run_iw(&self, args: &[&str]) -> MeshResult<String> {
        debug!("Running iw {}", args.join(" "));
        let output = Command::new("iw")
            .kill_on_drop(true)
            .args(args)
            .output()
            .await
            .map_err(|e| MeshError::CommandFailed {
                cmd: format!("iw {}", args.join(" ")),
                code: None,
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(MeshError::CommandFailed {
                cmd: format!("iw {}", args.join(" ")),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn run_iw_no_output(&self, args: &[&str]) -> MeshResult<()> {
        self.run_iw(args).await.map(|_| ())
    }
}

impl Default for WifiController {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `iw dev <if> info`
pub fn parse_dev_info(interface: &str, output: &str) -> WifiDeviceInfo {
    let mut info = WifiDeviceInfo {
        interface: interface.to_string(),
        ..Default::default()
    };

    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("wiphy ") {
            info.wiphy = rest.parse().ok();
        } else if let Some(rest) = line.strip_prefix("type ") {
            info.type_ = Some(rest.to_string());
        } else if let Some(parts) = line.strip_prefix("channel ") {
            // "channel 1 (2412 MHz), width: 20 MHz, center1: 2412 MHz"
            info.channel = parts.split_whitespace().next().and_then(|s| s.parse().ok());
            if let (Some(start), Some(end)) = (parts.find('('), parts.find(" MHz")) {
                info.frequency = parts.get(start + 1..end).and_then(|s| s.parse().ok());
            }
        } else if let Some(rest) = line.strip_prefix("txpower ") {
            info.txpower = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("ssid ") {
            info.ssid = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("mesh id ") {
            info.ssid = Some(rest.to_string());
        }
    }

    info
}

/// Parse `iw list` into PHYs and their mesh point capability
pub fn parse_iw_list(output: &str) -> Vec<PhyInfo> {
    let mut phys: Vec<PhyInfo> = Vec::new();

    for line in output.lines() {
        if let Some(name) = line.strip_prefix("Wiphy ") {
            phys.push(PhyInfo {
                name: name.trim().to_string(),
                ..Default::default()
            });
        } else if line.trim() == "* mesh point" {
            if let Some(phy) = phys.last_mut() {
                phy.supports_mesh_point = true;
            }
        } else if let Some(freq) = parse_frequency_line(line) {
            if let Some(phy) = phys.last_mut() {
                if !phy.frequencies.contains(&freq) {
                    phy.frequencies.push(freq);
                }
            }
        }
    }

    phys
}

/// `* 2412.0 MHz [1] (20.0 dBm)` -> 2412
fn parse_frequency_line(line: &str) -> Option<u32> {
    let rest = line.trim().strip_prefix("* ")?;
    let (mhz, tail) = rest.split_once(" MHz")?;
    if !tail.trim_start().starts_with('[') {
        return None;
    }
    mhz.trim().parse::<f64>().ok().map(|f| f as u32)
}

/// Parse `iw dev` into `(phy, interfaces)` pairs
pub fn parse_iw_dev(output: &str) -> Vec<(String, Vec<String>)> {
    let mut phys: Vec<(String, Vec<String>)> = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if let Some(index) = line.strip_prefix("phy#") {
            phys.push((format!("phy{}", index), Vec::new()));
        } else if let Some(name) = line.strip_prefix("Interface ") {
            if let Some((_, ifaces)) = phys.last_mut() {
                ifaces.push(name.to_string());
            }
        }
    }

    phys
}

/// Parse `iw reg get`; the first `country` line is the global domain
pub fn parse_reg_domain(output: &str) -> RegDomain {
    let mut reg = RegDomain {
        country: None,
        dfs_region: None,
    };

    if let Some(line) = output.lines().find(|l| l.starts_with("country ")) {
        if let Some(parts) = line.strip_prefix("country ") {
            reg.country = parts.split(':').next().map(|c| c.trim().to_string());
        }
        if let Some(dfs) = line.split("DFS-").nth(1) {
            reg.dfs_region = dfs.split_whitespace().next().map(|r| format!("DFS-{}", r));
        }
    }

    reg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_info_for_mesh_point() {
        let output = "Interface mesh0\n\
                      \tifindex 9\n\
                      \twdev 0x100000002\n\
                      \taddr 00:c0:ca:aa:bb:cc\n\
                      \ttype mesh point\n\
                      \twiphy 1\n\
                      \tchannel 1 (2412 MHz), width: 20 MHz, center1: 2412 MHz\n\
                      \ttxpower 20.00 dBm\n";
        let info = parse_dev_info("mesh0", output);
        assert_eq!(info.type_.as_deref(), Some("mesh point"));
        assert_eq!(info.phy_name().as_deref(), Some("phy1"));
        assert_eq!(info.channel, Some(1));
        assert_eq!(info.frequency, Some(2412));
        assert_eq!(info.ssid, None);
    }

    #[test]
    fn iw_list_detects_mesh_point_support() {
        let output = "Wiphy phy0\n\
                      \tmax # scan SSIDs: 10\n\
                      \tSupported interface modes:\n\
                      \t\t * managed\n\
                      \t\t * AP\n\
                      Wiphy phy1\n\
                      \tSupported interface modes:\n\
                      \t\t * managed\n\
                      \t\t * AP\n\
                      \t\t * mesh point\n";
        let phys = parse_iw_list(output);
        assert_eq!(phys.len(), 2);
        assert!(!phys[0].supports_mesh_point);
        assert!(phys[1].supports_mesh_point);
    }

    #[test]
    fn iw_list_collects_frequencies() {
        let output = "Wiphy phy1\n\
                      \tBand 1:\n\
                      \t\tFrequencies:\n\
                      \t\t\t* 2412.0 MHz [1] (20.0 dBm)\n\
                      \t\t\t* 2467.0 MHz [12] (disabled)\n\
                      \tBand 2:\n\
                      \t\tFrequencies:\n\
                      \t\t\t* 5180 MHz [36] (23.0 dBm)\n\
                      \t\t\t* 5745 MHz [149] (30.0 dBm)\n\
                      \tSupported interface modes:\n\
                      \t\t * mesh point\n";
        let phys = parse_iw_list(output);
        assert_eq!(phys[0].frequencies, vec![2412, 2467, 5180, 5745]);
        assert_eq!(phys[0].bands(), vec!["2.4GHz", "5GHz"]);
        assert!(phys[0].supports_mesh_point);
    }

    #[test]
    fn channels_follow_country_and_hardware() {
        let phy = PhyInfo {
            name: "phy1".to_string(),
            supports_mesh_point: true,
            interfaces: vec![],
            frequencies: vec![2412, 2437, 2467, 5180, 5745],
        };
        let channels = |country: &str| -> Vec<u8> {
            phy.channels(country).into_iter().map(|c| c.channel).collect()
        };
        assert_eq!(channels("DE"), vec![1, 6, 12, 36]);
        assert_eq!(channels("US"), vec![1, 6, 36, 149]);
        assert_eq!(
            phy.channels("US")[3],
            ChannelOption {
                band: "5GHz",
                channel: 149,
                freq_mhz: 5745,
            }
        );

        let no_radio = PhyInfo::default();
        assert!(no_radio.channels("US").is_empty());
    }

    #[test]
    fn iw_dev_groups_interfaces_by_phy() {
        let output = "phy#1\n\
                      \tInterface mesh0\n\
                      \t\ttype mesh point\n\
                      \tInterface wlan1\n\
                      \t\ttype managed\n\
                      phy#0\n\
                      \tInterface wlan0\n\
                      \t\ttype AP\n";
        let phys = parse_iw_dev(output);
        assert_eq!(
            phys,
            vec![
                ("phy1".to_string(), vec!["mesh0".to_string(), "wlan1".to_string()]),
                ("phy0".to_string(), vec!["wlan0".to_string()]),
            ]
        );
    }

    #[test]
    fn reg_domain_uses_global_entry() {
        let output = "global\ncountry US: DFS-FCC\n\t(2400 - 2472 @ 40), (N/A, 30)\n\n\
                      phy#1 (self-managed)\ncountry 00: DFS-UNSET\n";
        let reg = parse_reg_domain(output);
        assert_eq!(reg.country.as_deref(), Some("US"));
        assert_eq!(reg.dfs_region.as_deref(), Some("DFS-FCC"));
    }

    #[test]
    fn join_arguments() {
        let params = MeshJoinParams {
            mesh_id: "orbis-mesh".to_string(),
            frequency: 2412,
            beacon_interval: 1000,
            forwarding: false,
            root_mode: true,
        };
        assert_eq!(
            params.iw_args("mesh0").join(" "),
            "dev mesh0 mesh join orbis-mesh freq 2412 HT20 beacon-interval 1000 \
             mesh_fwding=0 mesh_hwmp_rootmode=4"
        );
    }

    #[tokio::test]
    async fn mesh_param_rejects_unsafe_input() {
        let wifi = WifiController::new();
        for (key, value) in [
            ("mesh_hwmp_rootmode", "4; reboot"),
            ("mesh_hwmp_rootmode", ""),
            ("txpower", "20"),
            ("mesh_HWMP", "1"),
        ] {
            let err = wifi.set_mesh_param("mesh0", key, value).await.unwrap_err();
            assert!(matches!(err, MeshError::InvalidParameter(_)), "{}={}", key, value);
        }
    }
}
