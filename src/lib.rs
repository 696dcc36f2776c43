//! meshctl - Mesh Node Supervisor Library
//!
//! Async library behind the `meshctl` CLI and the `meshctld` daemon:
//! - Node configuration store and validation
//! - Deterministic rendering of hostapd, dnsmasq, wpa_supplicant and babeld /
//!   batman-adv configs
//! - Interface reconciliation (802.11s mesh point, bridge, batman-adv)
//! - Neighbor telemetry from station dumps and the routing layer
//! - Health checks, service supervision and the local dashboard API

pub mod error;
pub mod validation;
pub mod addressing;
pub mod secure_file;
pub mod config;
pub mod node_config;

pub mod hostapd;
pub mod dnsmasq;
pub mod wpa_supplicant;
pub mod babeld;
pub mod batman;
pub mod render;

pub mod state;
pub mod poll;
pub mod interface;
pub mod wifi;
pub mod netops;
pub mod reconcile;

pub mod supervisor;
pub mod telemetry;
pub mod health;
pub mod uplink;
pub mod api;
pub mod apply;

// Re-export commonly used types
pub use error::{ConfigError, MeshError, MeshResult, ReconcileError, RenderError, TelemetryError};
pub use config::MeshctlConfig;
pub use node_config::{NodeConfig, RoutingBackend, SecurityMode};
pub use render::{RenderedConfigSet, RenderOutcome};
pub use state::{InterfaceState, ObservedInterface};
pub use netops::{NetObserver, NetOps, SystemNetOps};
pub use reconcile::{MeshPhase, ReconcileReport, ReconcileTiming, Reconciler, StepOutcome};
pub use supervisor::{RestartPlan, ServiceSupervisor, SystemdSupervisor};
pub use telemetry::{Collector, CollectorSettings, NeighborRecord, NeighborSnapshot, SystemTelemetrySource};
pub use health::{CheckStatus, HealthChecker, HealthReport, HostInspector};
pub use api::{Dashboard, Watched};
pub use apply::{apply_config, ApplyOutcome};
