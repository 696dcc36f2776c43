//! Routing-layer neighbor data
//!
//! batman-adv originators from `batctl o`, babeld neighbours from the local
//! control socket's `dump`. Both reduce to [`RouteEntry`] keyed by MAC.

use crate::addressing;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv6Addr;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Originator (batman) or neighbour (babel) MAC, lowercase
    pub mac: String,
    /// Seconds since the originator was last heard
    pub last_seen_secs: Option<f64>,
    /// TQ for B.A.T.M.A.N. IV, Mbit/s for B.A.T.M.A.N. V
    pub throughput: Option<f64>,
    pub next_hop: Option<String>,
    /// Babel link cost
    pub metric: Option<u32>,
    /// Installed routes through this neighbour (babel)
    pub routes: Option<u32>,
}

fn is_mac(token: &str) -> bool {
    token.len() == 17 && addressing::parse_mac(token).is_some()
}

/// Parse `batctl o`, keeping only best routes (`*`) and skipping `local_mac`
pub fn parse_batctl_originators(output: &str, local_mac: Option<&str>) -> Vec<RouteEntry> {
    let mut entries = Vec::new();

    for line in output.lines() {
        let Some(rest) = line.trim_start().strip_prefix("* ") else {
            continue;
        };

        let Some(mac) = rest.split_whitespace().next().filter(|t| is_mac(t)) else {
            continue;
        };
        let mac = mac.to_lowercase();
        if local_mac.is_some_and(|local| local.eq_ignore_ascii_case(&mac)) {
            continue;
        }

        let last_seen_secs = rest
            .split_whitespace()
            .nth(1)
            .and_then(|t| t.strip_suffix('s'))
            .and_then(|t| t.parse().ok());

        let (throughput, after) = match (rest.find('('), rest.find(')')) {
            (Some(open), Some(close)) if open < close => (
                rest[open + 1..close].trim().parse().ok(),
                &rest[close + 1..],
            ),
            _ => (None, ""),
        };

        let next_hop = after
            .split_whitespace()
            .find(|t| is_mac(t))
            .map(|t| t.to_lowercase());

        entries.push(RouteEntry {
            mac,
            last_seen_secs,
            throughput,
            next_hop,
            ..Default::default()
        });
    }

    entries
}

/// `key value` pairs following the fixed prefix of a babel dump line
fn babel_fields(tokens: &[&str]) -> BTreeMap<String, String> {
    tokens
        .chunks(2)
        .filter(|pair| pair.len() == 2)
        .map(|pair| (pair[0].to_string(), pair[1].to_string()))
        .collect()
}

fn link_local_mac(addr: &str) -> Option<String> {
    let addr: Ipv6Addr = addr.parse().ok()?;
    addressing::mac_from_link_local(&addr).map(|mac| addressing::format_mac(&mac))
}

/// Parse a babeld `dump` into one entry per neighbour
///
/// Neighbour addresses are EUI-64 link-locals, so the MAC is recovered from
/// the address. Neighbours with non-EUI-64 addresses are skipped.
pub fn parse_babel_dump(output: &str) -> Vec<RouteEntry> {
    let mut neighbours: BTreeMap<String, RouteEntry> = BTreeMap::new();
    let mut via_counts: BTreeMap<String, u32> = BTreeMap::new();

    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["add" | "change", "neighbour", _id, rest @ ..] => {
                let fields = babel_fields(rest);
                let Some(mac) = fields.get("address").and_then(|a| link_local_mac(a)) else {
                    continue;
                };
                neighbours.insert(
                    mac.clone(),
                    RouteEntry {
                        mac: mac.clone(),
                        next_hop: Some(mac),
                        metric: fields.get("cost").and_then(|c| c.parse().ok()),
                        ..Default::default()
                    },
                );
            }
            ["add" | "change", "route", _id, rest @ ..] => {
                let fields = babel_fields(rest);
                if fields.get("installed").map(String::as_str) != Some("yes") {
                    continue;
                }
                if let Some(mac) = fields.get("via").and_then(|v| link_local_mac(v)) {
                    *via_counts.entry(mac).or_default() += 1;
                }
            }
            _ => {}
        }
    }

    neighbours
        .into_values()
        .map(|mut entry| {
            entry.routes = Some(via_counts.get(&entry.mac).copied().unwrap_or(0));
            entry
        })
        .collect()
}
