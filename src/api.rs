//! Dashboard API
//!
//! Read-only JSON endpoints for the local web dashboard. Handlers only read
//! what the daemon's loops published plus cheap live checks; they never wait
//! on a reconciliation pass.

use crate::config::{MeshctlConfig, ServiceSettings};
use crate::error::{MeshError, MeshResult};
use crate::health::HealthReport;
use crate::netops::NetObserver;
use crate::node_config::{NodeConfig, RoutingBackend};
use crate::reconcile::Reconciler;
use crate::supervisor::ServiceSupervisor;
use crate::telemetry::{LocalNode, NeighborRecord, NeighborSnapshot};
use crate::uplink::UplinkCheck;
use crate::validation;
use crate::wifi::{ChannelOption, PhyInfo};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Units and interfaces the dashboard reports on, derived from the node config
#[derive(Debug, Clone)]
pub struct Watched {
    /// `(label, systemd unit)`
    pub units: Vec<(String, String)>,
    pub interfaces: Vec<String>,
    pub mesh_mac_iface: String,
    /// Interface whose PHY carries the mesh
    pub mesh_phy_iface: String,
    pub country: Option<String>,
    pub mesh_frequency: Option<u32>,
}

impl Watched {
    pub fn new(config: &NodeConfig, services: &ServiceSettings) -> Self {
        let mut units = vec![
            ("hostapd".to_string(), services.hostapd_unit.clone()),
            ("dnsmasq".to_string(), services.dnsmasq_unit.clone()),
        ];
        if config.mesh.routing == RoutingBackend::Babel {
            units.push(("babeld".to_string(), services.babeld_unit.clone()));
        }

        let i = &config.interfaces;
        let mut interfaces = vec![i.bridge_name.clone(), i.mesh_iface.clone(), i.eth_iface.clone()];
        if config.mesh.routing == RoutingBackend::Batman {
            interfaces.push(i.batman_iface.clone());
        }

        Self {
            units,
            interfaces,
            mesh_mac_iface: i.mesh_iface.clone(),
            mesh_phy_iface: i.mesh_phy_iface.clone(),
            country: config.country_code().ok(),
            mesh_frequency: config.mesh_frequency().ok(),
        }
    }
}

/// State shared between the daemon loops and the handlers
pub struct Dashboard {
    hostname: String,
    watched: RwLock<Watched>,
    node_timeout: Duration,
    net: Arc<dyn NetObserver>,
    supervisor: Arc<dyn ServiceSupervisor>,
    reconciler: Arc<Reconciler>,
    uplink: UplinkCheck,
    snapshot: RwLock<Option<NeighborSnapshot>>,
    health: RwLock<Option<HealthReport>>,
}

impl Dashboard {
    pub fn new(
        hostname: String,
        watched: Watched,
        node_timeout: Duration,
        net: Arc<dyn NetObserver>,
        supervisor: Arc<dyn ServiceSupervisor>,
        reconciler: Arc<Reconciler>,
        uplink: UplinkCheck,
    ) -> Self {
        Self {
            hostname,
            watched: RwLock::new(watched),
            node_timeout,
            net,
            supervisor,
            reconciler,
            uplink,
            snapshot: RwLock::new(None),
            health: RwLock::new(None),
        }
    }

    pub fn publish_snapshot(&self, snapshot: NeighborSnapshot) {
        if let Ok(mut slot) = self.snapshot.write() {
            *slot = Some(snapshot);
        }
    }

    pub fn publish_health(&self, report: HealthReport) {
        if let Ok(mut slot) = self.health.write() {
            *slot = Some(report);
        }
    }

    /// After a reload changed the node configuration
    pub fn set_watched(&self, watched: Watched) {
        if let Ok(mut slot) = self.watched.write() {
            *slot = watched;
        }
    }

    pub fn snapshot(&self) -> Option<NeighborSnapshot> {
        self.snapshot.read().ok().and_then(|s| s.clone())
    }

    pub fn health(&self) -> Option<HealthReport> {
        self.health.read().ok().and_then(|h| h.clone())
    }

    fn watched(&self) -> Option<Watched> {
        self.watched.read().ok().map(|w| w.clone())
    }

    /// `is-active` of every watched unit, concurrently
    async fn unit_states(&self, watched: &Watched) -> BTreeMap<String, Option<bool>> {
        let states = join_all(
            watched
                .units
                .iter()
                .map(|(_, unit)| self.supervisor.is_active(unit)),
        )
        .await;
        watched
            .units
            .iter()
            .map(|(label, _)| label.clone())
            .zip(states)
            .collect()
    }
}

/// Kernel hostname, if readable
pub fn system_hostname() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Operational state as a tri-state: up, down, or unknown
fn oper_flag(oper_state: Option<&str>) -> Option<bool> {
    match oper_state.map(|s| s.to_ascii_lowercase()) {
        Some(s) if s == "up" => Some(true),
        Some(s) if s == "down" || s == "lowerlayerdown" => Some(false),
        _ => None,
    }
}

fn service_health(active: Option<bool>) -> &'static str {
    match active {
        Some(true) => "ok",
        Some(false) => "bad",
        None => "unknown",
    }
}

#[derive(Debug, Serialize)]
pub struct LocalNodeResponse {
    pub hostname: String,
    pub mesh_mac: Option<String>,
    pub services: BTreeMap<String, Option<bool>>,
    pub interfaces: BTreeMap<String, Option<bool>>,
    pub uplink: bool,
    pub reconciling: bool,
}

#[derive(Debug, Serialize)]
pub struct MeshNodesResponse {
    pub hostname: String,
    pub timestamp: chrono::DateTime<Utc>,
    pub local: LocalNode,
    pub local_mac: Option<String>,
    pub nodes: BTreeMap<String, NeighborRecord>,
    /// Same records as `nodes`, for older dashboards
    pub node_status: BTreeMap<String, NeighborRecord>,
    /// Seconds after which a neighbor counts as inactive
    pub node_timeout: u64,
    pub health: BTreeMap<String, &'static str>,
}

#[derive(Debug, Serialize)]
pub struct MeshAdapter {
    pub phy: String,
    pub interfaces: Vec<String>,
    pub mesh_supported: bool,
    pub bands: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct MeshAdaptersResponse {
    pub adapters: Vec<MeshAdapter>,
    /// PHY the mesh is configured on
    pub current: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MeshChannelsQuery {
    pub phy: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MeshChannelsResponse {
    pub phy: Option<String>,
    pub country: Option<String>,
    pub bands: Vec<&'static str>,
    pub channels: Vec<ChannelOption>,
    pub current_frequency: Option<u32>,
}

struct ApiError(MeshError);

impl From<MeshError> for ApiError {
    fn from(err: MeshError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            MeshError::Service(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

async fn liveness() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "meshctld",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn local_node(State(state): State<Arc<Dashboard>>) -> Result<Json<LocalNodeResponse>, ApiError> {
    let watched = state
        .watched()
        .ok_or_else(|| MeshError::Service("dashboard state unavailable".to_string()))?;

    let (services, uplink) = futures::join!(state.unit_states(&watched), state.uplink.is_up());

    let mut interfaces = BTreeMap::new();
    let mut mesh_mac = None;
    for name in &watched.interfaces {
        let observed = state.net.interface(name).await.ok().flatten();
        if *name == watched.mesh_mac_iface {
            mesh_mac = observed.as_ref().and_then(|i| i.mac.clone());
        }
        interfaces.insert(
            name.clone(),
            observed.and_then(|i| oper_flag(i.oper_state.as_deref())),
        );
    }

    Ok(Json(LocalNodeResponse {
        hostname: state.hostname.clone(),
        mesh_mac,
        services,
        interfaces,
        uplink,
        reconciling: state.reconciler.is_busy(),
    }))
}

async fn mesh_nodes(State(state): State<Arc<Dashboard>>) -> Result<Json<MeshNodesResponse>, ApiError> {
    let watched = state
        .watched()
        .ok_or_else(|| MeshError::Service("dashboard state unavailable".to_string()))?;
    let health = state
        .unit_states(&watched)
        .await
        .into_iter()
        .map(|(label, active)| (label, service_health(active)))
        .collect();

    let snapshot = state.snapshot().unwrap_or_else(|| NeighborSnapshot {
        timestamp: Utc::now(),
        local: LocalNode::default(),
        nodes: BTreeMap::new(),
    });

    Ok(Json(MeshNodesResponse {
        hostname: state.hostname.clone(),
        timestamp: snapshot.timestamp,
        local_mac: snapshot.local.mac.clone(),
        local: snapshot.local,
        node_status: snapshot.nodes.clone(),
        nodes: snapshot.nodes,
        node_timeout: state.node_timeout.as_secs(),
        health,
    }))
}

fn phy_hosting<'a>(phys: &'a [PhyInfo], iface: &str) -> Option<&'a PhyInfo> {
    phys.iter().find(|p| p.interfaces.iter().any(|i| i == iface))
}

async fn mesh_adapters(State(state): State<Arc<Dashboard>>) -> Result<Json<MeshAdaptersResponse>, ApiError> {
    let watched = state
        .watched()
        .ok_or_else(|| MeshError::Service("dashboard state unavailable".to_string()))?;
    let phys = state.net.phys().await?;

    Ok(Json(MeshAdaptersResponse {
        current: phy_hosting(&phys, &watched.mesh_phy_iface).map(|p| p.name.clone()),
        adapters: phys
            .iter()
            .map(|p| MeshAdapter {
                phy: p.name.clone(),
                interfaces: p.interfaces.clone(),
                mesh_supported: p.supports_mesh_point,
                bands: p.bands(),
            })
            .collect(),
    }))
}

/// Channels for `phy` (default: the mesh PHY) under `country` (default: the
/// configured one); empty for an unknown or non-mesh PHY
async fn mesh_channels(
    State(state): State<Arc<Dashboard>>,
    Query(query): Query<MeshChannelsQuery>,
) -> Result<Json<MeshChannelsResponse>, ApiError> {
    let watched = state
        .watched()
        .ok_or_else(|| MeshError::Service("dashboard state unavailable".to_string()))?;
    let phys = state.net.phys().await?;

    let phy = match query.phy.as_deref() {
        Some(name) => phys.iter().find(|p| p.name == name),
        None => phy_hosting(&phys, &watched.mesh_phy_iface),
    };
    let country = query
        .country
        .as_deref()
        .and_then(|c| validation::validate_country_code("country", c).ok())
        .or_else(|| watched.country.clone());

    let (bands, channels) = match (phy, country.as_deref()) {
        (Some(p), Some(cc)) if p.supports_mesh_point => (p.bands(), p.channels(cc)),
        _ => (Vec::new(), Vec::new()),
    };

    Ok(Json(MeshChannelsResponse {
        phy: phy.map(|p| p.name.clone()),
        country,
        bands,
        channels,
        current_frequency: watched.mesh_frequency,
    }))
}

async fn health_report(State(state): State<Arc<Dashboard>>) -> Result<Json<HealthReport>, ApiError> {
    state
        .health()
        .map(Json)
        .ok_or_else(|| ApiError(MeshError::Service("no health check has run yet".to_string())))
}

pub fn router(state: Arc<Dashboard>) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/api/local-node", get(local_node))
        .route("/api/mesh-nodes", get(mesh_nodes))
        .route("/api/health", get(health_report))
        .route("/api/mesh-adapters", get(mesh_adapters))
        .route("/api/mesh-channels", get(mesh_channels))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the dashboard until `shutdown` resolves
pub async fn serve<F>(config: &MeshctlConfig, state: Arc<Dashboard>, shutdown: F) -> MeshResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(&config.api.bind).await?;
    info!("Dashboard API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconcileSettings;
    use crate::health::{CheckResult, CheckStatus};
    use crate::netops::fake::FakeNet;
    use crate::node_config::test_config;
    use crate::reconcile::ReconcileTiming;
    use crate::supervisor::MockServiceSupervisor;
    use std::path::PathBuf;

    fn dashboard(net: Arc<FakeNet>, supervisor: MockServiceSupervisor) -> Arc<Dashboard> {
        let config = test_config();
        let reconciler = Arc::new(Reconciler::new(
            net.clone(),
            ReconcileTiming::from(&ReconcileSettings::default()),
            PathBuf::from("/tmp"),
        ));
        Arc::new(Dashboard::new(
            "node-a".to_string(),
            Watched::new(&config, &ServiceSettings::default()),
            Duration::from_secs(30),
            net,
            Arc::new(supervisor),
            reconciler,
            // discard port, closed on test hosts
            UplinkCheck::with_targets(vec!["127.0.0.1:9".parse().unwrap()], Duration::from_secs(5)),
        ))
    }

    fn supervisor() -> MockServiceSupervisor {
        let mut mock = MockServiceSupervisor::new();
        mock.expect_is_active().returning(|unit| match unit {
            "hostapd" => Some(true),
            "dnsmasq" => Some(false),
            _ => None,
        });
        mock
    }

    #[test]
    fn watched_follows_backend() {
        let mut config = test_config();
        let watched = Watched::new(&config, &ServiceSettings::default());
        assert!(watched.units.iter().all(|(label, _)| label != "babeld"));
        assert!(watched.interfaces.contains(&"bat0".to_string()));

        config.mesh.routing = RoutingBackend::Babel;
        let watched = Watched::new(&config, &ServiceSettings::default());
        assert!(watched.units.iter().any(|(label, _)| label == "babeld"));
        assert!(!watched.interfaces.contains(&"bat0".to_string()));
    }

    #[test]
    fn oper_state_flags() {
        assert_eq!(oper_flag(Some("UP")), Some(true));
        assert_eq!(oper_flag(Some("DOWN")), Some(false));
        assert_eq!(oper_flag(Some("UNKNOWN")), None);
        assert_eq!(oper_flag(None), None);
    }

    #[tokio::test]
    async fn local_node_reports_tri_states() {
        let net = Arc::new(FakeNet::new());
        {
            let mut state = net.state();
            let eth = state.interfaces.get_mut("eth0").unwrap();
            eth.oper_state = Some("UP".to_string());
        }
        let state = dashboard(net, supervisor());

        let Json(body) = local_node(State(state)).await.ok().unwrap();
        assert_eq!(body.hostname, "node-a");
        assert_eq!(body.services.get("hostapd"), Some(&Some(true)));
        assert_eq!(body.services.get("dnsmasq"), Some(&Some(false)));
        assert_eq!(body.interfaces.get("eth0"), Some(&Some(true)));
        assert_eq!(body.interfaces.get("br0"), Some(&None));
        assert_eq!(body.mesh_mac, None);
        assert!(!body.uplink);
        assert!(!body.reconciling);
    }

    #[tokio::test]
    async fn mesh_nodes_without_snapshot_is_empty() {
        let state = dashboard(Arc::new(FakeNet::new()), supervisor());

        let Json(body) = mesh_nodes(State(state)).await.ok().unwrap();
        assert!(body.nodes.is_empty());
        assert_eq!(body.node_timeout, 30);
        assert_eq!(body.health.get("hostapd"), Some(&"ok"));
        assert_eq!(body.health.get("dnsmasq"), Some(&"bad"));

        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("node_status").is_some());
        assert!(json["local"].get("power_source").is_some());
    }

    #[tokio::test]
    async fn mesh_nodes_serves_published_snapshot() {
        let state = dashboard(Arc::new(FakeNet::new()), supervisor());
        state.publish_snapshot(NeighborSnapshot {
            timestamp: Utc::now(),
            local: LocalNode {
                mac: Some("02:00:00:00:01:01".to_string()),
                ..Default::default()
            },
            nodes: BTreeMap::new(),
        });

        let Json(body) = mesh_nodes(State(state)).await.ok().unwrap();
        assert_eq!(body.local_mac.as_deref(), Some("02:00:00:00:01:01"));
    }

    #[tokio::test]
    async fn mesh_adapters_lists_phys_with_bands() {
        let state = dashboard(Arc::new(FakeNet::new()), MockServiceSupervisor::new());

        let Json(body) = mesh_adapters(State(state)).await.ok().unwrap();
        assert_eq!(body.adapters.len(), 2);
        assert_eq!(body.current.as_deref(), Some("phy1"));
        let phy1 = &body.adapters[1];
        assert_eq!(phy1.interfaces, vec!["wlan1"]);
        assert!(phy1.mesh_supported);
        assert_eq!(phy1.bands, vec!["2.4GHz", "5GHz"]);
        assert_eq!(body.adapters[0].bands, vec!["2.4GHz"]);
    }

    #[tokio::test]
    async fn mesh_channels_default_to_mesh_phy_and_country() {
        let state = dashboard(Arc::new(FakeNet::new()), MockServiceSupervisor::new());

        let Json(body) = mesh_channels(State(state), Query(MeshChannelsQuery::default()))
            .await
            .ok()
            .unwrap();
        assert_eq!(body.phy.as_deref(), Some("phy1"));
        assert_eq!(body.country.as_deref(), Some("US"));
        assert_eq!(body.current_frequency, Some(2412));
        let channels: Vec<u8> = body.channels.iter().map(|c| c.channel).collect();
        assert_eq!(channels, vec![1, 6, 11, 36, 40, 149]);
    }

    #[tokio::test]
    async fn mesh_channels_follow_the_requested_country() {
        let state = dashboard(Arc::new(FakeNet::new()), MockServiceSupervisor::new());
        let query = MeshChannelsQuery {
            phy: Some("phy0".to_string()),
            country: Some("de".to_string()),
        };

        let Json(body) = mesh_channels(State(state.clone()), Query(query)).await.ok().unwrap();
        assert_eq!(body.country.as_deref(), Some("DE"));
        assert_eq!(body.channels.len(), 13);

        let unknown = MeshChannelsQuery {
            phy: Some("phy9".to_string()),
            country: Some("not-a-country".to_string()),
        };
        let Json(body) = mesh_channels(State(state), Query(unknown)).await.ok().unwrap();
        assert_eq!(body.phy, None);
        assert_eq!(body.country.as_deref(), Some("US"));
        assert!(body.channels.is_empty());
    }

    #[tokio::test]
    async fn health_endpoint_needs_a_report() {
        let state = dashboard(Arc::new(FakeNet::new()), MockServiceSupervisor::new());
        let response = health_report(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.publish_health(HealthReport::from_checks(vec![CheckResult {
            name: "babeld".to_string(),
            status: CheckStatus::Fail,
            detail: "not listening".to_string(),
        }]));
        let Json(report) = health_report(State(state)).await.ok().unwrap();
        assert_eq!(report.status, CheckStatus::Fail);
    }
}
