//! Interface Reconciler
//!
//! Drives the OS toward the interfaces a [`NodeConfig`] describes: mesh
//! point created, joined and addressed, LAN bridge with its members and
//! addresses, and for the batman backend the `bat0` layer in between.
//!
//! A pass is a fixed sequence of steps. Each step compares observed state
//! with the desired state, mutates only on a difference, and re-reads the
//! interface afterwards. A converged system therefore sees no mutations.
//! Structural failures abort the pass with [`ReconcileError::Fatal`];
//! cleanup failures are recorded and never abort. Completed steps stay in
//! place.

mod bridge;
mod mesh;
mod teardown;

use crate::config::ReconcileSettings;
use crate::error::{MeshError, MeshResult, ReconcileError};
use crate::netops::NetOps;
use crate::node_config::{NodeConfig, RoutingBackend};
use crate::poll::{poll_until, Deadline, PollExpired};
use crate::state::{InterfaceState, ObservedInterface};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub use mesh::join_params;

/// Convergence of the logical mesh interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MeshPhase {
    Absent,
    Created,
    MeshJoined,
    Addressed,
}

impl MeshPhase {
    /// Phase of the mesh interface in `state` for `config`
    pub fn observe(config: &NodeConfig, state: &InterfaceState) -> Self {
        let Some(iface) = state.get(&config.interfaces.mesh_iface) else {
            return MeshPhase::Absent;
        };
        let (Some(mesh_id), Ok(freq)) = (config.mesh.ssid.as_deref(), config.mesh_frequency()) else {
            return MeshPhase::Created;
        };
        if !iface.up || !iface.joined(mesh_id, freq) {
            return MeshPhase::Created;
        }
        let addressed = config
            .mesh_address()
            .map(|addr| iface.has_address(&addr.into()))
            .unwrap_or(false);
        if addressed && iface.link_local().is_some() {
            MeshPhase::Addressed
        } else {
            MeshPhase::MeshJoined
        }
    }
}

impl std::fmt::Display for MeshPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MeshPhase::Absent => "absent",
            MeshPhase::Created => "created",
            MeshPhase::MeshJoined => "mesh-joined",
            MeshPhase::Addressed => "addressed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum StepOutcome {
    Applied,
    AlreadyConverged,
    BestEffortFailed(String),
    Informational(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub step: String,
    pub target: String,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub phase: MeshPhase,
    pub steps: Vec<StepRecord>,
}

impl ReconcileReport {
    /// Steps that changed the system
    pub fn mutations(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.outcome == StepOutcome::Applied)
            .count()
    }

    pub fn warnings(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::BestEffortFailed(_)))
    }
}

/// Timeouts for one pass
#[derive(Debug, Clone)]
pub struct ReconcileTiming {
    pub iface_create_timeout: Duration,
    pub first_peer_timeout: Duration,
    pub link_local_grace: Duration,
    pub deadline: Duration,
    pub poll_interval: Duration,
    pub command_timeout: Duration,
}

impl From<&ReconcileSettings> for ReconcileTiming {
    fn from(s: &ReconcileSettings) -> Self {
        Self {
            iface_create_timeout: s.iface_create_timeout(),
            first_peer_timeout: s.first_peer_timeout(),
            link_local_grace: s.link_local_grace(),
            deadline: s.deadline(),
            poll_interval: s.poll_interval(),
            command_timeout: s.command_timeout(),
        }
    }
}

/// State of one reconciliation pass
pub(crate) struct Pass<'a> {
    pub(crate) net: &'a dyn NetOps,
    pub(crate) config: &'a NodeConfig,
    pub(crate) timing: &'a ReconcileTiming,
    pub(crate) render_dir: &'a Path,
    pub(crate) deadline: Deadline,
    pub(crate) state: InterfaceState,
    pub(crate) steps: Vec<StepRecord>,
}

impl<'a> Pass<'a> {
    pub(crate) fn check_deadline(&self, step: &str) -> Result<(), ReconcileError> {
        if self.deadline.expired() {
            return Err(ReconcileError::fatal(step, "pass deadline exceeded"));
        }
        Ok(())
    }

    pub(crate) fn iface(&self, name: &str) -> Option<&ObservedInterface> {
        self.state.get(name)
    }

    /// Limit for the next OS call
    fn call_limit(&self) -> Duration {
        self.timing.command_timeout.min(self.deadline.remaining())
    }

    /// Run one OS read or mutation under the command timeout and the pass
    /// deadline; running out of either is fatal
    pub(crate) async fn call<T, F>(&self, step: &str, op: F) -> Result<MeshResult<T>, ReconcileError>
    where
        F: Future<Output = MeshResult<T>>,
    {
        let limit = self.call_limit();
        tokio::time::timeout(limit, op).await.map_err(|_| {
            ReconcileError::fatal(step, format!("timed out after {} ms", limit.as_millis()))
        })
    }

    /// Re-read one interface into the pass state
    pub(crate) async fn refresh(&mut self, step: &str, name: &str) -> Result<(), ReconcileError> {
        let observed = self
            .call(step, self.net.interface(name))
            .await?
            .map_err(|e| ReconcileError::fatal(step, format!("cannot observe {}: {}", name, e)))?;
        self.state.update(name, observed);
        Ok(())
    }

    pub(crate) fn record(&mut self, step: &str, target: &str, outcome: StepOutcome) {
        match &outcome {
            StepOutcome::Applied => info!("{} {}: applied", step, target),
            StepOutcome::AlreadyConverged => debug!("{} {}: converged", step, target),
            StepOutcome::BestEffortFailed(reason) => warn!("{} {}: {}", step, target, reason),
            StepOutcome::Informational(note) => info!("{} {}: {}", step, target, note),
        }
        self.steps.push(StepRecord {
            step: step.to_string(),
            target: target.to_string(),
            outcome,
        });
    }

    pub(crate) fn converged(&mut self, step: &str, target: &str) {
        self.record(step, target, StepOutcome::AlreadyConverged);
    }

    /// Run a required mutation on interface `target`, then re-read it
    pub(crate) async fn apply<F>(&mut self, step: &str, target: &str, op: F) -> Result<(), ReconcileError>
    where
        F: Future<Output = MeshResult<()>>,
    {
        self.check_deadline(step)?;
        self.call(step, op)
            .await?
            .map_err(|e| ReconcileError::fatal(step, format!("{}: {}", target, e)))?;
        self.record(step, target, StepOutcome::Applied);
        self.refresh(step, target).await
    }

    /// Run a cleanup mutation; failure is recorded, never returned
    pub(crate) async fn best_effort<T, F>(&mut self, step: &str, target: &str, op: F)
    where
        F: Future<Output = MeshResult<T>>,
    {
        let limit = self.call_limit();
        let outcome = match tokio::time::timeout(limit, op).await {
            Ok(Ok(_)) => StepOutcome::Applied,
            Ok(Err(e)) => StepOutcome::BestEffortFailed(e.to_string()),
            Err(_) => StepOutcome::BestEffortFailed(format!("timed out after {} ms", limit.as_millis())),
        };
        self.record(step, target, outcome);
    }

    /// Poll `check` under `timeout` and the pass deadline
    ///
    /// `Ok(None)` when the step timeout elapsed; running into the pass
    /// deadline is fatal.
    pub(crate) async fn wait_for<T, F, Fut>(
        &self,
        step: &str,
        timeout: Duration,
        check: F,
    ) -> Result<Option<T>, ReconcileError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        match poll_until(timeout, self.timing.poll_interval, &self.deadline, check).await {
            Ok(value) => Ok(Some(value)),
            Err(PollExpired::Step) => Ok(None),
            Err(PollExpired::Deadline) => Err(ReconcileError::fatal(step, "pass deadline exceeded")),
        }
    }

    /// Wait until interface `name` exists; fatal after `iface_create_timeout`
    pub(crate) async fn wait_for_interface(&mut self, step: &str, name: &str) -> Result<(), ReconcileError> {
        let net = self.net;
        let appeared = self
            .wait_for(step, self.timing.iface_create_timeout, || async move {
                net.interface(name).await.ok().flatten()
            })
            .await?;

        match appeared {
            Some(iface) => {
                self.state.update(name, Some(iface));
                Ok(())
            }
            None => Err(ReconcileError::fatal(
                step,
                format!(
                    "{} did not appear within {} ms",
                    name,
                    self.timing.iface_create_timeout.as_millis()
                ),
            )),
        }
    }

    /// Ensure `name` is administratively up
    pub(crate) async fn ensure_up(&mut self, step: &str, name: &str) -> Result<(), ReconcileError> {
        if self.iface(name).is_some_and(|i| i.up) {
            self.converged(step, name);
            return Ok(());
        }
        let net = self.net;
        self.apply(step, name, net.set_link(name, true)).await
    }

    /// Ensure `name` is enslaved to `master`
    pub(crate) async fn ensure_master(
        &mut self,
        step: &str,
        name: &str,
        master: &str,
    ) -> Result<(), ReconcileError> {
        if self.iface(name).and_then(|i| i.master.as_deref()) == Some(master) {
            self.converged(step, name);
            return Ok(());
        }
        let net = self.net;
        self.apply(step, name, net.set_master(name, master)).await
    }

    /// Ensure `name` carries `addr`
    pub(crate) async fn ensure_address(
        &mut self,
        step: &str,
        name: &str,
        addr: crate::state::IfAddr,
    ) -> Result<(), ReconcileError> {
        match self.iface(name) {
            None => Err(ReconcileError::fatal(step, format!("{} does not exist", name))),
            Some(iface) if iface.has_address(&addr) => {
                self.converged(step, name);
                Ok(())
            }
            Some(_) => {
                let net = self.net;
                self.apply(step, name, async move { net.add_address(name, &addr).await })
                    .await
            }
        }
    }
}

/// Runs reconciliation passes, one at a time
pub struct Reconciler {
    net: Arc<dyn NetOps>,
    timing: ReconcileTiming,
    render_dir: PathBuf,
    lock: tokio::sync::Mutex<()>,
    last_report: Mutex<Option<ReconcileReport>>,
}

impl Reconciler {
    pub fn new(net: Arc<dyn NetOps>, timing: ReconcileTiming, render_dir: PathBuf) -> Self {
        Self {
            net,
            timing,
            render_dir,
            lock: tokio::sync::Mutex::new(()),
            last_report: Mutex::new(None),
        }
    }

    /// Whether a pass is running; never waits
    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    pub fn last_report(&self) -> Option<ReconcileReport> {
        self.last_report.lock().ok().and_then(|r| r.clone())
    }

    fn store_report(&self, report: &ReconcileReport) {
        if let Ok(mut last) = self.last_report.lock() {
            *last = Some(report.clone());
        }
    }

    async fn bounded<T>(&self, what: &str, op: impl Future<Output = MeshResult<T>>) -> MeshResult<T> {
        let limit = self.timing.command_timeout;
        tokio::time::timeout(limit, op).await.map_err(|_| {
            MeshError::Timeout(format!("{} did not answer within {} ms", what, limit.as_millis()))
        })?
    }

    /// Observe every interface the configuration binds
    pub async fn observe(&self, config: &NodeConfig) -> MeshResult<InterfaceState> {
        let mut state = InterfaceState::default();
        for (_, name) in config.interface_bindings() {
            if !state.exists(name) {
                let observed = self.bounded(name, self.net.interface(name)).await?;
                state.update(name, observed);
            }
        }
        state.regdomain = self
            .bounded("regdomain", self.net.regdomain())
            .await
            .ok()
            .flatten();
        Ok(state)
    }

    /// Validate, observe, then converge
    pub async fn reconcile(&self, config: &NodeConfig) -> Result<ReconcileReport, ReconcileError> {
        config.validate()?;
        let _guard = self.lock.lock().await;
        let state = self
            .observe(config)
            .await
            .map_err(|e| ReconcileError::fatal("observe", e.to_string()))?;
        self.run_pass(config, state).await
    }

    /// Converge starting from an already observed state
    pub async fn reconcile_from(
        &self,
        config: &NodeConfig,
        state: InterfaceState,
    ) -> Result<ReconcileReport, ReconcileError> {
        config.validate()?;
        let _guard = self.lock.lock().await;
        self.run_pass(config, state).await
    }

    async fn run_pass(
        &self,
        config: &NodeConfig,
        state: InterfaceState,
    ) -> Result<ReconcileReport, ReconcileError> {
        let started_at = Utc::now();
        let started = tokio::time::Instant::now();
        let mut pass = Pass {
            net: &*self.net,
            config,
            timing: &self.timing,
            render_dir: &self.render_dir,
            deadline: Deadline::after(self.timing.deadline),
            state,
            steps: Vec::new(),
        };

        info!(
            "Reconciling {} (phase {})",
            config.interfaces.mesh_iface,
            MeshPhase::observe(config, &pass.state)
        );

        match converge(&mut pass).await {
            Ok(()) => {
                let report = ReconcileReport {
                    started_at,
                    duration_ms: started.elapsed().as_millis() as u64,
                    phase: MeshPhase::observe(config, &pass.state),
                    steps: pass.steps,
                };
                info!(
                    "Reconcile pass finished: phase {}, {} mutation(s)",
                    report.phase,
                    report.mutations()
                );
                self.store_report(&report);
                Ok(report)
            }
            Err(e) => {
                error!("Reconcile pass aborted: {}", e);
                error!("Last known interface state: {:?}", pass.state);
                Err(e)
            }
        }
    }

    /// Take everything down; safe from any state
    pub async fn teardown(&self, config: &NodeConfig) -> ReconcileReport {
        let _guard = self.lock.lock().await;
        let started_at = Utc::now();
        let started = tokio::time::Instant::now();
        let state = match self.observe(config).await {
            Ok(state) => state,
            Err(e) => {
                warn!("Observing before teardown failed: {}", e);
                InterfaceState::default()
            }
        };
        let mut pass = Pass {
            net: &*self.net,
            config,
            timing: &self.timing,
            render_dir: &self.render_dir,
            deadline: Deadline::after(self.timing.deadline),
            state,
            steps: Vec::new(),
        };

        teardown::run(&mut pass).await;

        let report = ReconcileReport {
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            phase: MeshPhase::observe(config, &pass.state),
            steps: pass.steps,
        };
        self.store_report(&report);
        report
    }
}

/// The ordered steps of a pass
async fn converge(pass: &mut Pass<'_>) -> Result<(), ReconcileError> {
    mesh::ensure_regdomain(pass).await?;
    mesh::ensure_created(pass).await?;
    mesh::ensure_joined(pass).await?;
    mesh::ensure_addressed(pass).await?;

    bridge::ensure_bridge(pass).await?;
    if pass.config.mesh.routing == RoutingBackend::Batman {
        bridge::ensure_batman(pass).await?;
    }
    bridge::ensure_lan_addresses(pass).await?;
    bridge::clear_uplink_addresses(pass).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing;
    use crate::netops::fake::FakeNet;
    use crate::node_config::test_config;

    fn timing() -> ReconcileTiming {
        ReconcileTiming::from(&ReconcileSettings::default())
    }

    fn reconciler(net: Arc<FakeNet>) -> Reconciler {
        Reconciler::new(net, timing(), PathBuf::from("/run/meshctl/rendered"))
    }

    #[tokio::test(start_paused = true)]
    async fn converges_from_scratch() {
        let net = Arc::new(FakeNet::new());
        net.state().peers = 1;
        let config = test_config();

        let report = reconciler(net.clone()).reconcile(&config).await.unwrap();
        assert_eq!(report.phase, MeshPhase::Addressed);

        let mesh = net.iface("mesh0").unwrap();
        assert!(mesh.up);
        assert!(mesh.joined("orbis-mesh", 2412));
        assert!(mesh.has_address(&"10.99.0.1/16".parse().unwrap()));
        assert_eq!(mesh.master.as_deref(), Some("bat0"));

        let br = net.iface("br0").unwrap();
        assert!(br.up);
        assert!(br.has_address(&"192.168.201.1/24".parse().unwrap()));
        assert_eq!(net.iface("eth0").unwrap().master.as_deref(), Some("br0"));
        assert_eq!(net.iface("bat0").unwrap().master.as_deref(), Some("br0"));
        assert_eq!(net.state().regdomain.as_deref(), Some("US"));
        assert_eq!(
            net.state()
                .batman_settings
                .get(&("bat0".to_string(), "orig_interval".to_string()))
                .map(String::as_str),
            Some("1000")
        );

        let calls = net.calls();
        let pos = |prefix: &str| calls.iter().position(|c| c.starts_with(prefix)).unwrap();
        assert!(pos("set_regdomain") < pos("create_mesh_interface phy1 mesh0"));
        assert!(pos("create_mesh_interface") < pos("mesh_join"));
        assert!(pos("set_link mesh0 up") < pos("mesh_join"));
        assert!(pos("mesh_join") < pos("add_address mesh0"));
        assert!(pos("create_bridge") < pos("set_master eth0 br0"));
    }

    #[tokio::test(start_paused = true)]
    async fn second_pass_issues_no_mutations() {
        let net = Arc::new(FakeNet::new());
        let config = test_config();
        let reconciler = reconciler(net.clone());

        reconciler.reconcile(&config).await.unwrap();
        net.clear_calls();

        let report = reconciler.reconcile(&config).await.unwrap();
        assert_eq!(net.calls(), Vec::<String>::new());
        assert_eq!(report.mutations(), 0);
        assert_eq!(report.phase, MeshPhase::Addressed);
    }

    #[tokio::test(start_paused = true)]
    async fn babel_backend_is_idempotent_too() {
        let net = Arc::new(FakeNet::new());
        let mut config = test_config();
        config.mesh.routing = RoutingBackend::Babel;
        config.addressing.ui_address = Some("192.168.201.250".parse().unwrap());
        let reconciler = reconciler(net.clone());

        reconciler.reconcile(&config).await.unwrap();
        assert!(net.iface("bat0").is_none());
        assert!(net
            .iface("br0")
            .unwrap()
            .has_address(&"192.168.201.250/32".parse().unwrap()));

        net.clear_calls();
        reconciler.reconcile(&config).await.unwrap();
        assert!(net.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn no_mesh_capable_phy_is_fatal() {
        let net = Arc::new(FakeNet::new());
        for phy in net.state().phys.iter_mut() {
            phy.supports_mesh_point = false;
        }

        let err = reconciler(net.clone()).reconcile(&test_config()).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("mesh point"));
        assert!(net.iface("mesh0").is_none());
        assert!(net.iface("br0").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_config_mutates_nothing() {
        let net = Arc::new(FakeNet::new());
        let mut config = test_config();
        config.ap.passphrase = Some("short".to_string());

        let err = reconciler(net.clone()).reconcile(&config).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Config(_)));
        assert!(net.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn interface_that_never_appears_times_out() {
        let net = Arc::new(FakeNet::new());
        net.state().create_invisible = true;
        let start = tokio::time::Instant::now();

        let err = reconciler(net.clone()).reconcile(&test_config()).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("did not appear"));
        assert_eq!(start.elapsed(), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn pass_deadline_is_fatal() {
        let net = Arc::new(FakeNet::new());
        net.state().create_invisible = true;
        let mut timing = timing();
        timing.deadline = Duration::from_secs(1);
        let reconciler = Reconciler::new(net, timing, PathBuf::from("/tmp"));

        let err = reconciler.reconcile(&test_config()).await.unwrap_err();
        assert!(err.to_string().contains("deadline"));
    }

    #[tokio::test(start_paused = true)]
    async fn link_local_is_forced_after_grace() {
        let net = Arc::new(FakeNet::new());
        net.state().auto_link_local = false;

        reconciler(net.clone()).reconcile(&test_config()).await.unwrap();

        let mesh = net.iface("mesh0").unwrap();
        let mac = addressing::parse_mac(mesh.mac.as_deref().unwrap()).unwrap();
        assert_eq!(mesh.link_local(), Some(addressing::eui64_link_local(&mac)));
        assert!(net
            .calls()
            .iter()
            .any(|c| c.starts_with("add_address mesh0 fe80::")));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_while_a_pass_holds_the_lock() {
        let net = Arc::new(FakeNet::new());
        let reconciler = Arc::new(reconciler(net));
        assert!(!reconciler.is_busy());

        let guard = reconciler.lock.lock().await;
        assert!(reconciler.is_busy());
        drop(guard);
        assert!(!reconciler.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn stray_lan_address_moves_off_the_uplink() {
        let net = Arc::new(FakeNet::new());
        net.state()
            .interfaces
            .get_mut("eth0")
            .unwrap()
            .addresses
            .push("192.168.201.1/24".parse().unwrap());

        reconciler(net.clone()).reconcile(&test_config()).await.unwrap();
        assert!(!net.iface("eth0").unwrap().has_ipv4());
        assert!(net
            .iface("br0")
            .unwrap()
            .has_address(&"192.168.201.1/24".parse().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_from_converged_state_mutates_nothing() {
        let net = Arc::new(FakeNet::new());
        let config = test_config();
        let reconciler = reconciler(net.clone());
        reconciler.reconcile(&config).await.unwrap();

        let observed = reconciler.observe(&config).await.unwrap();
        net.clear_calls();
        let report = reconciler.reconcile_from(&config, observed).await.unwrap();
        assert!(net.calls().is_empty());
        assert_eq!(report.mutations(), 0);
        assert_eq!(report.phase, MeshPhase::Addressed);
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_from_partial_state_repairs_only_what_is_missing() {
        let net = Arc::new(FakeNet::new());
        let config = test_config();
        let reconciler = reconciler(net.clone());
        reconciler.reconcile(&config).await.unwrap();

        let mut observed = reconciler.observe(&config).await.unwrap();
        net.state().interfaces.remove("br0");
        for iface in net.state().interfaces.values_mut() {
            if iface.master.as_deref() == Some("br0") {
                iface.master = None;
            }
        }
        observed.update("br0", None);
        for name in ["eth0", "bat0"] {
            let mut released = observed.get(name).cloned().unwrap();
            released.master = None;
            observed.update(name, Some(released));
        }
        net.clear_calls();

        let report = reconciler.reconcile_from(&config, observed).await.unwrap();
        let calls = net.calls();
        assert!(calls.contains(&"create_bridge br0".to_string()));
        assert!(calls.contains(&"set_master eth0 br0".to_string()));
        assert!(calls.contains(&"set_master bat0 br0".to_string()));
        assert!(calls.iter().all(|c| c.contains("br0")), "{:?}", calls);
        assert_eq!(report.mutations(), calls.len());
        assert_eq!(report.phase, MeshPhase::Addressed);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_command_is_fatal_after_command_timeout() {
        let net = Arc::new(FakeNet::new());
        net.state().hanging_ops.insert("create_mesh_interface");
        let mut timing = timing();
        timing.command_timeout = Duration::from_secs(2);
        let reconciler = Reconciler::new(net.clone(), timing, PathBuf::from("/tmp"));
        let start = tokio::time::Instant::now();

        let err = reconciler.reconcile(&test_config()).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("timed out after 2000 ms"));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert!(!reconciler.is_busy());
        assert!(net.iface("br0").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_command_ends_the_pass_at_its_deadline() {
        let net = Arc::new(FakeNet::new());
        net.state().hanging_ops.insert("mesh_join");
        let mut timing = timing();
        timing.deadline = Duration::from_secs(1);
        let reconciler = Reconciler::new(net, timing, PathBuf::from("/tmp"));
        let start = tokio::time::Instant::now();

        let err = reconciler.reconcile(&test_config()).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("timed out"));
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_observation_fails_the_pass() {
        let net = Arc::new(FakeNet::new());
        net.state().hanging_ops.insert("interface");
        let start = tokio::time::Instant::now();

        let err = reconciler(net.clone()).reconcile(&test_config()).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("did not answer"));
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert!(net.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_cleanup_is_recorded_not_raised() {
        let net = Arc::new(FakeNet::new());
        let config = test_config();
        let reconciler = reconciler(net.clone());
        reconciler.reconcile(&config).await.unwrap();
        net.state().hanging_ops.insert("delete_interface");

        let report = reconciler.teardown(&config).await;
        let timed_out: Vec<&str> = report
            .warnings()
            .filter(|w| w.outcome == StepOutcome::BestEffortFailed("timed out after 10000 ms".to_string()))
            .map(|w| w.step.as_str())
            .collect();
        assert!(timed_out.contains(&"delete bridge"));
        assert!(net.iface("br0").is_some());
    }

    #[test]
    fn phase_from_state() {
        let config = test_config();
        let mut state = InterfaceState::default();
        assert_eq!(MeshPhase::observe(&config, &state), MeshPhase::Absent);

        let mut mesh = ObservedInterface::new("mesh0");
        mesh.iftype = Some("mesh point".to_string());
        state.update("mesh0", Some(mesh.clone()));
        assert_eq!(MeshPhase::observe(&config, &state), MeshPhase::Created);

        mesh.up = true;
        mesh.mesh = Some(crate::state::MeshJoin {
            mesh_id: Some("orbis-mesh".to_string()),
            frequency: 2412,
        });
        state.update("mesh0", Some(mesh.clone()));
        assert_eq!(MeshPhase::observe(&config, &state), MeshPhase::MeshJoined);

        mesh.addresses = vec![
            "10.99.0.1/16".parse().unwrap(),
            "fe80::1/64".parse().unwrap(),
        ];
        state.update("mesh0", Some(mesh));
        assert_eq!(MeshPhase::observe(&config, &state), MeshPhase::Addressed);
    }
}
