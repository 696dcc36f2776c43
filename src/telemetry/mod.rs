//! Telemetry Collector
//!
//! Merges radio-layer station statistics with routing-layer neighbor data
//! into a [`NeighborTable`] that survives across polls. Every sub-query runs
//! under its own timeout, cut short by what is left of the collection's
//! latency budget. A failed or late sub-query is logged and contributes
//! nothing; the others still count.

pub mod power;
pub mod routing;
pub mod signal;
pub mod station;

use crate::babeld;
use crate::config::TelemetrySettings;
use crate::error::{MeshError, MeshResult, TelemetryError};
use crate::node_config::{NodeConfig, RoutingBackend};
use crate::validation;
use crate::wifi::WifiController;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use power::PowerInfo;
use routing::RouteEntry;
use serde::{Deserialize, Serialize};
use signal::SignalRange;
use station::StationStats;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::net::{Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// Raw data sources the collector queries
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// `iw dev <iface> station dump`
    async fn station_dump(&self, iface: &str) -> MeshResult<String>;

    /// `batctl meshif <iface> o`
    async fn batman_originators(&self, batman_iface: &str) -> MeshResult<String>;

    /// babeld `dump` over the local control port
    async fn babel_dump(&self, port: u16) -> MeshResult<String>;

    async fn interface_mac(&self, iface: &str) -> Option<String>;
}

/// TelemetrySource backed by `iw`, `batctl`, babeld and sysfs
pub struct SystemTelemetrySource {
    wifi: WifiController,
    sysfs_net: PathBuf,
}

impl SystemTelemetrySource {
    pub fn new() -> Self {
        Self {
            wifi: WifiController::new(),
            sysfs_net: PathBuf::from("/sys/class/net"),
        }
    }
}

impl Default for SystemTelemetrySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetrySource for SystemTelemetrySource {
    async fn station_dump(&self, iface: &str) -> MeshResult<String> {
        self.wifi.station_dump(iface).await
    }

    async fn batman_originators(&self, batman_iface: &str) -> MeshResult<String> {
        validation::validate_interface_name(batman_iface)?;
        let args = ["meshif", batman_iface, "o"];
        let output = Command::new("batctl")
            .kill_on_drop(true)
            .args(args)
            .output()
            .await
            .map_err(|e| MeshError::CommandFailed {
                cmd: format!("batctl {}", args.join(" ")),
                code: None,
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(MeshError::CommandFailed {
                cmd: format!("batctl {}", args.join(" ")),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn babel_dump(&self, port: u16) -> MeshResult<String> {
        let addr = SocketAddr::from((Ipv6Addr::LOCALHOST, port));
        let stream = TcpStream::connect(addr).await?;
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        // greeting ends with "ok"
        read_babel_reply(&mut lines).await?;
        write.write_all(b"dump\n").await?;
        let dump = read_babel_reply(&mut lines).await?;
        let _ = write.write_all(b"quit\n").await;
        Ok(dump)
    }

    async fn interface_mac(&self, iface: &str) -> Option<String> {
        validation::validate_interface_name(iface).ok()?;
        tokio::fs::read_to_string(self.sysfs_net.join(iface).join("address"))
            .await
            .ok()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| validation::validate_mac_address(s).is_ok() && s != "00:00:00:00:00:00")
    }
}

async fn read_babel_reply<R>(lines: &mut tokio::io::Lines<R>) -> MeshResult<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut reply = String::new();
    while let Some(line) = lines.next_line().await? {
        match line.as_str() {
            "ok" => return Ok(reply),
            "bad" | "no" => {
                return Err(MeshError::Service(format!("babeld replied '{}'", line)));
            }
            _ => {
                reply.push_str(&line);
                reply.push('\n');
            }
        }
    }
    Err(MeshError::Service("babeld closed the control connection".to_string()))
}

/// One mesh peer as shown on the dashboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborRecord {
    pub mac: String,
    pub interface: Option<String>,
    pub signal_dbm: Option<f64>,
    pub signal_pct: Option<u8>,
    /// Seconds since the peer was last heard
    pub last_seen: f64,
    pub throughput: Option<f64>,
    pub next_hop: Option<String>,
    pub metric: Option<u32>,
    pub rx_packets: Option<u64>,
    pub rx_drop_misc: Option<u64>,
    pub tx_packets: Option<u64>,
    pub tx_retries: Option<u64>,
    pub tx_failed: Option<u64>,
    pub tx_bitrate_mbps: Option<f64>,
    pub rx_bitrate_mbps: Option<f64>,
    pub active: bool,
    pub first_seen: DateTime<Utc>,
}

impl NeighborRecord {
    fn new(mac: &str) -> Self {
        Self {
            mac: mac.to_string(),
            interface: None,
            signal_dbm: None,
            signal_pct: None,
            last_seen: 0.0,
            throughput: None,
            next_hop: None,
            metric: None,
            rx_packets: None,
            rx_drop_misc: None,
            tx_packets: None,
            tx_retries: None,
            tx_failed: None,
            tx_bitrate_mbps: None,
            rx_bitrate_mbps: None,
            active: true,
            first_seen: Utc::now(),
        }
    }

    fn apply(&mut self, obs: &Observation, signal: &SignalRange) {
        fn keep<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                slot.clone_from(value);
            }
        }

        if let Some(st) = &obs.station {
            keep(&mut self.interface, &st.interface);
            keep(&mut self.signal_dbm, &st.signal_dbm);
            keep(&mut self.rx_packets, &st.rx_packets);
            keep(&mut self.rx_drop_misc, &st.rx_drop_misc);
            keep(&mut self.tx_packets, &st.tx_packets);
            keep(&mut self.tx_retries, &st.tx_retries);
            keep(&mut self.tx_failed, &st.tx_failed);
            keep(&mut self.tx_bitrate_mbps, &st.tx_bitrate_mbps);
            keep(&mut self.rx_bitrate_mbps, &st.rx_bitrate_mbps);
            self.signal_pct = self.signal_dbm.map(|dbm| signal.percent(dbm));
        }
        if let Some(route) = &obs.route {
            keep(&mut self.throughput, &route.throughput);
            keep(&mut self.next_hop, &route.next_hop);
            keep(&mut self.metric, &route.metric);
        }
    }
}

/// A peer seen in one poll, radio and routing data merged
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub mac: String,
    pub station: Option<StationStats>,
    pub route: Option<RouteEntry>,
}

impl Observation {
    /// How long ago the peer was heard, as reported by its sources
    fn age(&self) -> Duration {
        let route_age = self
            .route
            .as_ref()
            .and_then(|r| r.last_seen_secs)
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(Duration::from_secs_f64);
        let station_age = self
            .station
            .as_ref()
            .and_then(|s| s.inactive_ms)
            .map(Duration::from_millis);
        route_age.or(station_age).unwrap_or_default()
    }
}

/// Join station and routing entries by originator MAC or next-hop MAC
///
/// Stations with no routing entry of their own are still reported; MACs in
/// `local_macs` never are.
pub fn merge(
    stations: Vec<StationStats>,
    routes: Vec<RouteEntry>,
    local_macs: &BTreeSet<String>,
) -> Vec<Observation> {
    let mut by_mac: BTreeMap<String, StationStats> = BTreeMap::new();
    for st in stations {
        by_mac.entry(st.mac.clone()).or_insert(st);
    }

    let route_macs: BTreeSet<String> = routes.iter().map(|r| r.mac.clone()).collect();
    let mut merged = Vec::new();

    for route in routes {
        if local_macs.contains(&route.mac) {
            continue;
        }
        let station = by_mac.get(&route.mac).or_else(|| {
            route
                .next_hop
                .as_ref()
                .and_then(|nh| by_mac.get(nh))
        });
        merged.push(Observation {
            mac: route.mac.clone(),
            station: station.cloned(),
            route: Some(route),
        });
    }

    for (mac, st) in by_mac {
        if !route_macs.contains(&mac) && !local_macs.contains(&mac) {
            merged.push(Observation {
                mac,
                station: Some(st),
                route: None,
            });
        }
    }

    merged
}

struct TrackedNeighbor {
    record: NeighborRecord,
    heard_at: Instant,
}

/// Neighbor records across polls; expired peers stay, marked inactive
#[derive(Default)]
pub struct NeighborTable {
    entries: BTreeMap<String, TrackedNeighbor>,
}

impl NeighborTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Create or update a record per observation
    pub fn observe(&mut self, now: Instant, observations: &[Observation], signal: &SignalRange) {
        for obs in observations {
            let heard_at = now.checked_sub(obs.age()).unwrap_or(now);
            let tracked = self
                .entries
                .entry(obs.mac.clone())
                .or_insert_with(|| TrackedNeighbor {
                    record: NeighborRecord::new(&obs.mac),
                    heard_at,
                });
            tracked.record.apply(obs, signal);
            tracked.heard_at = tracked.heard_at.max(heard_at);
        }
    }

    /// Records with ages as of `now`; active while age <= `node_timeout`
    pub fn records(&self, now: Instant, node_timeout: Duration) -> BTreeMap<String, NeighborRecord> {
        self.entries
            .iter()
            .map(|(mac, tracked)| {
                let age = now.saturating_duration_since(tracked.heard_at);
                let mut record = tracked.record.clone();
                record.last_seen = (age.as_secs_f64() * 10.0).round() / 10.0;
                record.active = age <= node_timeout;
                (mac.clone(), record)
            })
            .collect()
    }
}

/// The node itself
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalNode {
    pub mac: Option<String>,
    #[serde(flatten)]
    pub power: PowerInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborSnapshot {
    pub timestamp: DateTime<Utc>,
    pub local: LocalNode,
    pub nodes: BTreeMap<String, NeighborRecord>,
}

impl NeighborSnapshot {
    pub fn active_count(&self) -> usize {
        self.nodes.values().filter(|n| n.active).count()
    }
}

/// What the collector queries, derived from the node configuration
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub station_interfaces: Vec<String>,
    /// Interfaces whose MACs identify this node
    pub local_interfaces: Vec<String>,
    pub backend: RoutingBackend,
    pub batman_iface: String,
    pub babel_port: u16,
    pub node_timeout: Duration,
    pub subquery_timeout: Duration,
    pub budget: Duration,
    pub signal: SignalRange,
    pub power_supply_dir: PathBuf,
}

impl CollectorSettings {
    pub fn new(config: &NodeConfig, telemetry: &TelemetrySettings) -> Self {
        let i = &config.interfaces;
        let mut station_interfaces = vec![i.mesh_iface.clone()];
        if i.mesh_phy_iface != i.mesh_iface {
            station_interfaces.push(i.mesh_phy_iface.clone());
        }

        Self {
            station_interfaces,
            local_interfaces: vec![
                i.mesh_iface.clone(),
                i.batman_iface.clone(),
                i.mesh_phy_iface.clone(),
            ],
            backend: config.mesh.routing,
            batman_iface: i.batman_iface.clone(),
            babel_port: babeld::CONTROL_PORT,
            node_timeout: telemetry.node_timeout(),
            subquery_timeout: telemetry.subquery_timeout(),
            budget: telemetry.budget(),
            signal: SignalRange::new(telemetry.signal_min_dbm, telemetry.signal_max_dbm),
            power_supply_dir: telemetry.power_supply_dir.clone(),
        }
    }
}

struct Gathered {
    stations: Vec<StationStats>,
    routes: Vec<RouteEntry>,
    local_macs: Vec<String>,
    power: PowerInfo,
}

pub struct Collector {
    source: Box<dyn TelemetrySource>,
    settings: CollectorSettings,
    table: Mutex<NeighborTable>,
}

impl Collector {
    pub fn new(source: Box<dyn TelemetrySource>, settings: CollectorSettings) -> Self {
        Self {
            source,
            settings,
            table: Mutex::new(NeighborTable::new()),
        }
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    /// Run `query` under the sub-query timeout, ending no later than `end`;
    /// failures log and yield `None`
    async fn bounded<T, F>(&self, source_name: &str, end: Instant, query: F) -> Option<T>
    where
        F: Future<Output = MeshResult<T>>,
    {
        let start = Instant::now();
        let limit = (start + self.settings.subquery_timeout).min(end);
        let err = match timeout_at(limit, query).await {
            Ok(Ok(value)) => return Some(value),
            Ok(Err(e)) => TelemetryError::Query {
                source_name: source_name.to_string(),
                reason: e.to_string(),
            },
            Err(_) => TelemetryError::Timeout {
                source_name: source_name.to_string(),
                millis: limit.saturating_duration_since(start).as_millis() as u64,
            },
        };
        warn!("{}", err);
        None
    }

    async fn gather(&self, end: Instant) -> Gathered {
        let s = &self.settings;

        let stations = join_all(s.station_interfaces.iter().map(|iface| async move {
            let name = format!("station dump on {}", iface);
            self.bounded(&name, end, self.source.station_dump(iface)).await
        }));

        let routes = async {
            match s.backend {
                RoutingBackend::Batman => self
                    .bounded("batctl originators", end, self.source.batman_originators(&s.batman_iface))
                    .await
                    .map(|out| routing::parse_batctl_originators(&out, None)),
                RoutingBackend::Babel => self
                    .bounded("babeld dump", end, self.source.babel_dump(s.babel_port))
                    .await
                    .map(|out| routing::parse_babel_dump(&out)),
            }
        };

        let local_macs = join_all(s.local_interfaces.iter().map(|iface| async move {
            timeout_at(end, self.source.interface_mac(iface))
                .await
                .ok()
                .flatten()
        }));

        let power = async {
            timeout_at(end, power::read_power_info(&s.power_supply_dir))
                .await
                .unwrap_or_default()
        };

        let (stations, routes, local_macs, power) = tokio::join!(stations, routes, local_macs, power);

        Gathered {
            stations: stations
                .into_iter()
                .flatten()
                .flat_map(|dump| station::parse_station_dump(&dump))
                .collect(),
            routes: routes.unwrap_or_default(),
            local_macs: local_macs.into_iter().flatten().collect(),
            power,
        }
    }

    /// One poll: query sources, update the table, return a snapshot
    pub async fn collect(&self) -> NeighborSnapshot {
        let end = Instant::now() + self.settings.budget;
        let gathered = self.gather(end).await;
        if Instant::now() >= end {
            warn!(
                "Telemetry collection used its whole {} ms budget",
                self.settings.budget.as_millis()
            );
        }

        let local: BTreeSet<String> = gathered.local_macs.iter().cloned().collect();
        let observations = merge(gathered.stations, gathered.routes, &local);
        debug!("Telemetry poll observed {} neighbors", observations.len());

        let now = Instant::now();
        let nodes = match self.table.lock() {
            Ok(mut table) => {
                table.observe(now, &observations, &self.settings.signal);
                table.records(now, self.settings.node_timeout)
            }
            Err(poisoned) => {
                let mut table = poisoned.into_inner();
                table.observe(now, &observations, &self.settings.signal);
                table.records(now, self.settings.node_timeout)
            }
        };

        NeighborSnapshot {
            timestamp: Utc::now(),
            local: LocalNode {
                mac: gathered.local_macs.first().cloned(),
                power: gathered.power,
            },
            nodes,
        }
    }
}
