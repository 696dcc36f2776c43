//! hostapd configuration for the node's access point

use crate::error::RenderError;
use crate::node_config::{NodeConfig, SecurityMode};
use crate::validation;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostapdConfig {
    /// Interface name
    pub interface: String,
    /// Bridge the AP interface is attached to
    pub bridge: String,
    pub ssid: String,
    /// WPA-class secret; always present unless security is open
    pub passphrase: Option<String>,
    pub security: SecurityMode,
    /// Channel number
    pub channel: u8,
    /// Band: "2.4GHz" or "5GHz"
    pub band: String,
    /// Country code (regulatory domain)
    pub country_code: String,
    /// Hidden SSID
    pub hidden: bool,
    /// Enable WMM/QoS
    pub wmm_enabled: bool,
    /// IEEE 802.11n (HT) support
    pub ieee80211n: bool,
    pub ctrl_interface: String,
}

impl HostapdConfig {
    /// Validate the access point section and build the typed config
    pub fn from_node(config: &NodeConfig) -> Result<Self, RenderError> {
        let iface = &config.interfaces;
        validation::check_interface_field("interfaces.ap_iface", &iface.ap_iface)?;
        validation::check_interface_field("interfaces.bridge_name", &iface.bridge_name)?;

        let ssid = config
            .ap
            .ssid
            .as_deref()
            .ok_or_else(|| RenderError::missing("ap.ssid"))?;
        validation::validate_ssid("ap.ssid", ssid)?;

        let security = config.ap_security()?;
        let passphrase = if security.requires_passphrase() {
            let passphrase = config
                .ap
                .passphrase
                .as_deref()
                .ok_or_else(|| RenderError::missing("ap.passphrase"))?;
            validation::validate_passphrase("ap.passphrase", passphrase)?;
            Some(passphrase.to_string())
        } else {
            None
        };

        let country_code = config.country_code()?;
        validation::validate_wifi_channel("ap.channel", config.ap.channel, &config.ap.band, &country_code)?;

        Ok(Self {
            interface: iface.ap_iface.clone(),
            bridge: iface.bridge_name.clone(),
            ssid: ssid.to_string(),
            passphrase,
            security,
            channel: config.ap.channel,
            band: config.ap.band.clone(),
            country_code,
            hidden: config.ap.hidden,
            wmm_enabled: true,
            ieee80211n: true,
            ctrl_interface: "/run/hostapd".to_string(),
        })
    }

    /// hostapd.conf contents
    pub fn render(&self) -> String {
        let mut conf = String::new();

        conf.push_str(&format!("interface={}\n", self.interface));
        conf.push_str(&format!("bridge={}\n", self.bridge));
        conf.push_str("driver=nl80211\n");
        conf.push_str(&format!("ctrl_interface={}\n", self.ctrl_interface));
        conf.push_str(&format!("ssid={}\n", self.ssid));
        conf.push_str(&format!("country_code={}\n", self.country_code));
        conf.push_str("ieee80211d=1\n");

        let hw_mode = if self.band == "5GHz" { "a" } else { "g" };
        conf.push_str(&format!("hw_mode={}\n", hw_mode));
        conf.push_str(&format!("channel={}\n", self.channel));

        if self.hidden {
            conf.push_str("ignore_broadcast_ssid=1\n");
        }

        if self.wmm_enabled {
            conf.push_str("wmm_enabled=1\n");
        }

        if self.ieee80211n {
            conf.push_str("ieee80211n=1\n");
        }

        conf.push_str("auth_algs=1\nmacaddr_acl=0\n");

        let passphrase = self.passphrase.as_deref().unwrap_or_default();
        match self.security {
            SecurityMode::Open => {}
            SecurityMode::Wpa2 => {
                conf.push_str("wpa=2\n");
                conf.push_str(&format!("wpa_passphrase={}\n", passphrase));
                conf.push_str("wpa_key_mgmt=WPA-PSK\nrsn_pairwise=CCMP\n");
            }
            SecurityMode::Wpa3 => {
                conf.push_str("wpa=2\n");
                conf.push_str(&format!("sae_password={}\n", passphrase));
                conf.push_str("wpa_key_mgmt=SAE\nrsn_pairwise=CCMP\nieee80211w=2\n");
            }
            SecurityMode::Mixed => {
                conf.push_str("wpa=2\n");
                conf.push_str(&format!("wpa_passphrase={}\n", passphrase));
                conf.push_str("wpa_key_mgmt=WPA-PSK SAE\nrsn_pairwise=CCMP\nieee80211w=1\n");
            }
        }

        conf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_config::test_config;

    #[test]
    fn wpa2_access_point() {
        let conf = HostapdConfig::from_node(&test_config()).unwrap().render();
        assert!(conf.contains("interface=wlan0\n"));
        assert!(conf.contains("bridge=br0\n"));
        assert!(conf.contains("ssid=orbis-1\n"));
        assert!(conf.contains("country_code=US\n"));
        assert!(conf.contains("hw_mode=g\nchannel=6\n"));
        assert!(conf.contains("wpa_passphrase=correct horse\n"));
        assert!(conf.contains("wpa_key_mgmt=WPA-PSK\n"));
        assert!(!conf.contains("ieee80211w"));
    }

    #[test]
    fn wpa3_and_mixed_set_pmf() {
        let mut config = test_config();
        config.ap.security = "wpa3".to_string();
        let conf = HostapdConfig::from_node(&config).unwrap().render();
        assert!(conf.contains("sae_password=correct horse\n"));
        assert!(conf.contains("wpa_key_mgmt=SAE\n"));
        assert!(conf.contains("ieee80211w=2\n"));

        config.ap.security = "MIXED".to_string();
        let conf = HostapdConfig::from_node(&config).unwrap().render();
        assert!(conf.contains("wpa_key_mgmt=WPA-PSK SAE\n"));
        assert!(conf.contains("ieee80211w=1\n"));
    }

    #[test]
    fn open_access_point_needs_no_passphrase() {
        let mut config = test_config();
        config.ap.security = "open".to_string();
        config.ap.passphrase = None;
        config.ap.hidden = true;
        let conf = HostapdConfig::from_node(&config).unwrap().render();
        assert!(!conf.contains("wpa="));
        assert!(conf.contains("ignore_broadcast_ssid=1\n"));
    }

    #[test]
    fn rejects_before_rendering() {
        let mut config = test_config();
        config.ap.passphrase = None;
        assert_eq!(
            HostapdConfig::from_node(&config).unwrap_err(),
            RenderError::missing("ap.passphrase")
        );

        let mut config = test_config();
        config.ap.security = "wep".to_string();
        assert!(matches!(
            HostapdConfig::from_node(&config),
            Err(RenderError::UnsupportedMode { .. })
        ));

        let mut config = test_config();
        config.ap.channel = 13;
        assert_eq!(
            HostapdConfig::from_node(&config).unwrap_err().field(),
            "ap.channel"
        );
    }
}
