//! `iw dev <if> station dump` parsing

use crate::validation;
use serde::{Deserialize, Serialize};

/// Radio-layer statistics for one peer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StationStats {
    pub mac: String,
    pub interface: Option<String>,
    pub signal_dbm: Option<f64>,
    pub inactive_ms: Option<u64>,
    pub rx_packets: Option<u64>,
    pub rx_drop_misc: Option<u64>,
    pub tx_packets: Option<u64>,
    pub tx_retries: Option<u64>,
    pub tx_failed: Option<u64>,
    pub tx_bitrate_mbps: Option<f64>,
    pub rx_bitrate_mbps: Option<f64>,
    /// Mesh peer link state, e.g. `ESTAB`; absent on non-mesh interfaces
    pub plink: Option<String>,
}

impl StationStats {
    pub fn is_established(&self) -> bool {
        self.plink.as_deref().map_or(true, |s| s == "ESTAB")
    }
}

fn leading_number(value: &str) -> Option<f64> {
    value.split_whitespace().next()?.parse().ok()
}

fn leading_count(value: &str) -> Option<u64> {
    value.split_whitespace().next()?.parse().ok()
}

/// "65.0 MBit/s MCS 7" -> 65.0
fn bitrate_mbps(value: &str) -> Option<f64> {
    let mut parts = value.split_whitespace();
    let rate: f64 = parts.next()?.parse().ok()?;
    match parts.next()? {
        unit if unit.eq_ignore_ascii_case("MBit/s") || unit.eq_ignore_ascii_case("Mb/s") => Some(rate),
        _ => None,
    }
}

/// Parse every station block; MACs are lowercased
pub fn parse_station_dump(output: &str) -> Vec<StationStats> {
    let mut stations = Vec::new();
    let mut current: Option<StationStats> = None;

    for line in output.lines() {
        let line = line.trim();

        if let Some(rest) = line.strip_prefix("Station ") {
            if let Some(done) = current.take() {
                stations.push(done);
            }
            let mut parts = rest.split_whitespace();
            let mac = parts.next().unwrap_or_default().to_lowercase();
            if validation::validate_mac_address(&mac).is_err() {
                continue;
            }
            let interface = rest
                .split("(on ")
                .nth(1)
                .map(|s| s.trim_end_matches(')').to_string());
            current = Some(StationStats {
                mac,
                interface,
                ..Default::default()
            });
            continue;
        }

        let Some(station) = current.as_mut() else {
            continue;
        };
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim() {
            "signal" => station.signal_dbm = leading_number(value),
            "signal avg" if station.signal_dbm.is_none() => {
                station.signal_dbm = leading_number(value)
            }
            "inactive time" => station.inactive_ms = leading_count(value),
            "rx packets" => station.rx_packets = leading_count(value),
            "rx drop misc" => station.rx_drop_misc = leading_count(value),
            "tx packets" => station.tx_packets = leading_count(value),
            "tx retries" => station.tx_retries = leading_count(value),
            "tx failed" => station.tx_failed = leading_count(value),
            "tx bitrate" => station.tx_bitrate_mbps = bitrate_mbps(value),
            "rx bitrate" => station.rx_bitrate_mbps = bitrate_mbps(value),
            "mesh plink" => station.plink = Some(value.to_string()),
            _ => {}
        }
    }

    if let Some(done) = current {
        stations.push(done);
    }

    stations
}
