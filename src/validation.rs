//! Input validation and sanitization
//!
//! Everything that ends up on an `ip`/`iw` command line or inside a generated
//! daemon config passes through here first.

use crate::error::{MeshError, MeshResult, RenderError};

/// Maximum length for interface names (Linux kernel limit is 15)
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Maximum SSID / mesh ID length in bytes (IEEE 802.11)
pub const MAX_SSID_LEN: usize = 32;

/// WPA passphrase bounds (ASCII characters)
pub const MIN_PASSPHRASE_LEN: usize = 8;
pub const MAX_PASSPHRASE_LEN: usize = 63;

/// Maximum length for error messages shown to users
/// ISO 3166-1 alpha-2 codes accepted as regulatory domains
pub const ISO_COUNTRY_CODES: &[&str] = &[
    "AF", "AX", "AL", "DZ", "AS", "AD", "AO", "AI", "AQ", "AG", "AR", "AM", "AW", "AU", "AT",
    "AZ", "BS", "BH", "BD", "BB", "BY", "BE", "BZ", "BJ", "BM", "BT", "BO", "BQ", "BA", "BW",
    "BV", "BR", "IO", "BN", "BG", "BF", "BI", "CV", "KH", "CM", "CA", "KY", "CF", "TD", "CL",
    "CN", "CX", "CC", "CO", "KM", "CG", "CD", "CK", "CR", "CI", "HR", "CU", "CW", "CY", "CZ",
    "DK", "DJ", "DM", "DO", "EC", "EG", "SV", "GQ", "ER", "EE", "SZ", "ET", "FK", "FO", "FJ",
    "FI", "FR", "GF", "PF", "TF", "GA", "GM", "GE", "DE", "GH", "GI", "GR", "GL", "GD", "GP",
    "GU", "GT", "GG", "GN", "GW", "GY", "HT", "HM", "VA", "HN", "HK", "HU", "IS", "IN", "ID",
    "IR", "IQ", "IE", "IM", "IL", "IT", "JM", "JP", "JE", "JO", "KZ", "KE", "KI", "KP", "KR",
    "KW", "KG", "LA", "LV", "LB", "LS", "LR", "LY", "LI", "LT", "LU", "MO", "MG", "MW", "MY",
    "MV", "ML", "MT", "MH", "MQ", "MR", "MU", "YT", "MX", "FM", "MD", "MC", "MN", "ME", "MS",
    "MA", "MZ", "MM", "NA", "NR", "NP", "NL", "NC", "NZ", "NI", "NE", "NG", "NU", "NF", "MK",
    "MP", "NO", "OM", "PK", "PW", "PS", "PA", "PG", "PY", "PE", "PH", "PN", "PL", "PT", "PR",
    "QA", "RE", "RO", "RU", "RW", "BL", "SH", "KN", "LC", "MF", "PM", "VC", "WS", "SM", "ST",
    "SA", "SN", "RS", "SC", "SL", "SG", "SX", "SK", "SI", "SB", "SO", "ZA", "GS", "SS", "ES",
    "LK", "SD", "SR", "SJ", "SE", "CH", "SY", "TW", "TJ", "TZ", "TH", "TL", "TG", "TK", "TO",
    "TT", "TN", "TR", "TM", "TC", "TV", "UG", "UA", "AE", "GB", "US", "UM", "UY", "UZ", "VU",
    "VE", "VN", "VG", "VI", "WF", "EH", "YE", "ZM", "ZW",
];

const UNII_1: &[u8] = &[36, 40, 44, 48];
const UNII_2: &[u8] = &[52, 56, 60, 64];
const UNII_2E: &[u8] = &[100, 104, 108, 112, 116, 120, 124, 128, 132, 136, 140, 144];
const UNII_3: &[u8] = &[149, 153, 157, 161, 165];

/// Validate interface name to prevent command injection
///
/// Interface names must be alphanumeric with optional dashes, dots and
/// underscores, and no longer than 15 characters (Linux kernel limit)
pub fn validate_interface_name(name: &str) -> MeshResult<()> {
    if name.is_empty() {
        return Err(MeshError::InvalidParameter(
            "Interface name cannot be empty".to_string(),
        ));
    }

    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(MeshError::InvalidParameter(format!(
            "Interface name too long (max {} characters)",
            MAX_INTERFACE_NAME_LEN
        )));
    }

    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' && c != '.' {
            return Err(MeshError::InvalidParameter(format!(
                "Invalid interface name '{}': contains invalid character '{}'",
                name, c
            )));
        }
    }

    // Don't allow names starting with dash (could be interpreted as option)
    if name.starts_with('-') {
        return Err(MeshError::InvalidParameter(
            "Interface name cannot start with dash".to_string(),
        ));
    }

    Ok(())
}

/// Same rules as [`validate_interface_name`], reported against a config field
pub fn check_interface_field(field: &str, name: &str) -> Result<(), RenderError> {
    validate_interface_name(name).map_err(|e| RenderError::invalid(field, e.to_string()))
}

/// Validate MAC address format
///
/// Accepts standard MAC format: XX:XX:XX:XX:XX:XX (hex digits)
pub fn validate_mac_address(mac: &str) -> MeshResult<()> {
    if mac.len() != 17 {
        return Err(MeshError::InvalidParameter(
            "MAC address must be in format XX:XX:XX:XX:XX:XX".to_string(),
        ));
    }

    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return Err(MeshError::InvalidParameter(
            "MAC address must have 6 octets separated by colons".to_string(),
        ));
    }

    for part in parts {
        if part.len() != 2 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(MeshError::InvalidParameter(format!(
                "Invalid octet in MAC address: {}",
                part
            )));
        }
    }

    Ok(())
}

/// Validate prefix length for IPv4 or IPv6
pub fn validate_prefix_len(prefix: u8, is_ipv6: bool) -> MeshResult<()> {
    let max = if is_ipv6 { 128 } else { 32 };
    if prefix > max {
        return Err(MeshError::InvalidParameter(format!(
            "Prefix length {} exceeds maximum {}",
            prefix, max
        )));
    }
    Ok(())
}

/// Validate an SSID or mesh ID
///
/// 1..=32 bytes, no control characters, no leading/trailing whitespace.
pub fn validate_ssid(field: &str, ssid: &str) -> Result<(), RenderError> {
    if ssid.is_empty() {
        return Err(RenderError::invalid(field, "SSID cannot be empty"));
    }

    if ssid.len() > MAX_SSID_LEN {
        return Err(RenderError::invalid(
            field,
            format!("SSID is {} bytes (max {})", ssid.len(), MAX_SSID_LEN),
        ));
    }

    if ssid.chars().any(|c| c.is_control()) {
        return Err(RenderError::invalid(field, "SSID contains control characters"));
    }

    if ssid.trim() != ssid {
        return Err(RenderError::invalid(
            field,
            "SSID has leading or trailing whitespace",
        ));
    }

    Ok(())
}

/// Validate a WPA-class passphrase: 8..=63 printable ASCII characters
pub fn validate_passphrase(field: &str, passphrase: &str) -> Result<(), RenderError> {
    if !passphrase.is_ascii() {
        return Err(RenderError::invalid(
            field,
            "passphrase must contain only ASCII characters",
        ));
    }

    let len = passphrase.len();
    if !(MIN_PASSPHRASE_LEN..=MAX_PASSPHRASE_LEN).contains(&len) {
        return Err(RenderError::invalid(
            field,
            format!(
                "passphrase is {} characters (must be {}-{})",
                len, MIN_PASSPHRASE_LEN, MAX_PASSPHRASE_LEN
            ),
        ));
    }

    if passphrase.chars().any(|c| c.is_control()) {
        return Err(RenderError::invalid(
            field,
            "passphrase contains control characters",
        ));
    }

    Ok(())
}

/// Validate country code (ISO 3166-1 alpha-2), returning it upper-cased
pub fn validate_country_code(field: &str, code: &str) -> Result<String, RenderError> {
    let code_upper = code.trim().to_uppercase();

    if code_upper.len() != 2 || !code_upper.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(RenderError::invalid(
            field,
            "country code must be 2 letters",
        ));
    }

    if !ISO_COUNTRY_CODES.contains(&code_upper.as_str()) {
        return Err(RenderError::invalid(
            field,
            format!("unknown country code: {}", code),
        ));
    }

    Ok(code_upper)
}

/// Conservative 2.4 GHz channel limit by country
pub fn max_channel_24ghz(country: &str) -> u8 {
    match country.to_uppercase().as_str() {
        "JP" => 14,
        "US" | "CA" | "MX" => 11,
        _ => 13,
    }
}

/// Channels allowed for a band in a given regulatory domain
///
/// 5 GHz is intentionally conservative: UNII-3 only where it is commonly
/// permitted (US/CA/MX).
pub fn allowed_channels(band: &str, country: &str) -> Vec<u8> {
    match band {
        "2.4GHz" => (1..=max_channel_24ghz(country)).collect(),
        "5GHz" => {
            let mut channels: Vec<u8> = UNII_1
                .iter()
                .chain(UNII_2)
                .chain(UNII_2E)
                .copied()
                .collect();
            if matches!(country.to_uppercase().as_str(), "US" | "CA" | "MX") {
                channels.extend_from_slice(UNII_3);
            }
            channels
        }
        _ => Vec::new(),
    }
}

/// Validate WiFi channel for a given band and country
pub fn validate_wifi_channel(
    field: &str,
    channel: u8,
    band: &str,
    country: &str,
) -> Result<(), RenderError> {
    if band != "2.4GHz" && band != "5GHz" {
        return Err(RenderError::invalid(
            field,
            format!("invalid band '{}' (expected 2.4GHz or 5GHz)", band),
        ));
    }

    if !allowed_channels(band, country).contains(&channel) {
        return Err(RenderError::invalid(
            field,
            format!(
                "channel {} not allowed for band {} in {}",
                channel, band, country
            ),
        ));
    }

    Ok(())
}

/// Center frequency in MHz for a channel number
pub fn channel_to_frequency(band: &str, channel: u8) -> Option<u32> {
    match (band, channel) {
        ("2.4GHz", 14) => Some(2484),
        ("2.4GHz", 1..=13) => Some(2407 + 5 * channel as u32),
        ("5GHz", 32..=177) => Some(5000 + 5 * channel as u32),
        _ => None,
    }
}

/// Reject values that would break a line-oriented config file
pub fn sanitize_config_value(field: &str, value: &str) -> Result<String, RenderError> {
    if value.chars().any(|c| c.is_control() && c != '\t') {
        return Err(RenderError::invalid(
            field,
            "value contains control characters",
        ));
    }
    Ok(value.to_string())
}
