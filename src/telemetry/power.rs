//! Power supply info from `/sys/class/power_supply`

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerSource {
    Battery,
    External,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerInfo {
    pub battery_present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_pct: Option<u8>,
    pub power_source: PowerSource,
    /// Charging, Discharging, Not charging...
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

async fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .await
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Scan every supply under `dir`; a missing directory yields the default
pub async fn read_power_info(dir: &Path) -> PowerInfo {
    let mut info = PowerInfo::default();
    let mut external = false;

    let Ok(mut entries) = fs::read_dir(dir).await else {
        return info;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let base = entry.path();
        let kind = read_trimmed(&base.join("type")).await.unwrap_or_default();

        if let Some(status) = read_trimmed(&base.join("status")).await {
            info.status = Some(status);
        }

        match kind.to_lowercase().as_str() {
            "battery" => {
                info.battery_present = true;
                if let Some(cap) = read_trimmed(&base.join("capacity")).await {
                    info.battery_pct = cap.parse::<u8>().ok().filter(|c| *c <= 100);
                }
            }
            "mains" | "usb" | "ac" => {
                // no online file means the supply is always on
                let online = read_trimmed(&base.join("online")).await;
                if online.as_deref().map_or(true, |o| o == "1") {
                    external = true;
                }
            }
            _ => {}
        }
    }

    info.power_source = if info.battery_present {
        PowerSource::Battery
    } else if external {
        PowerSource::External
    } else {
        PowerSource::Unknown
    };
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as stdfs;

    fn supply(dir: &Path, name: &str, files: &[(&str, &str)]) {
        let base = dir.join(name);
        stdfs::create_dir(&base).unwrap();
        for (file, content) in files {
            stdfs::write(base.join(file), format!("{}\n", content)).unwrap();
        }
    }

    #[tokio::test]
    async fn battery_wins_over_mains() {
        let dir = tempfile::tempdir().unwrap();
        supply(dir.path(), "AC", &[("type", "Mains"), ("online", "1")]);
        supply(
            dir.path(),
            "BAT0",
            &[("type", "Battery"), ("capacity", "87"), ("status", "Charging")],
        );

        let info = read_power_info(dir.path()).await;
        assert!(info.battery_present);
        assert_eq!(info.battery_pct, Some(87));
        assert_eq!(info.power_source, PowerSource::Battery);
        assert_eq!(info.status.as_deref(), Some("Charging"));
    }

    #[tokio::test]
    async fn offline_usb_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        supply(dir.path(), "usb", &[("type", "USB"), ("online", "0")]);
        let info = read_power_info(dir.path()).await;
        assert_eq!(info.power_source, PowerSource::Unknown);
        assert!(!info.battery_present);
    }

    #[tokio::test]
    async fn missing_directory_is_default() {
        let info = read_power_info(Path::new("/nonexistent/power_supply")).await;
        assert_eq!(info, PowerInfo::default());
    }
}
