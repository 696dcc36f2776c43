//! Health Checker
//!
//! Read-only diagnostic pass over the node: interfaces, mesh addressing,
//! routing daemon, generated configs. Nothing here mutates interfaces or
//! services; dry runs use their own pid files, ports and routing tables.

use crate::babeld;
use crate::error::{MeshError, MeshResult};
use crate::netops::NetObserver;
use crate::node_config::{NodeConfig, RoutingBackend};
use crate::render;
use crate::secure_file::write_secure;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Control port of the isolated babeld started for a dry run
const DRY_RUN_BABEL_CONTROL_PORT: u16 = 43123;
/// Protocol port of the isolated babeld
const DRY_RUN_BABEL_PROTOCOL_PORT: u16 = 16696;
/// Kernel table the isolated babeld imports from and exports to
const DRY_RUN_BABEL_TABLE: u8 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Ok,
    Warn,
    Fail,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Fail => "FAIL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckResult {
    fn new(name: impl Into<String>, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            detail: detail.into(),
        }
    }

    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Ok, detail)
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Warn, detail)
    }

    fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Fail, detail)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub status: CheckStatus,
    pub checks: Vec<CheckResult>,
}

impl HealthReport {
    /// FAIL if any check failed, else WARN if any warned, else OK
    pub fn from_checks(checks: Vec<CheckResult>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(CheckStatus::Ok);
        Self {
            checked_at: Utc::now(),
            status,
            checks,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| c.status == CheckStatus::Fail)
    }

    /// Process exit code for the CLI: 1 on FAIL, 0 otherwise
    pub fn exit_code(&self) -> i32 {
        match self.status {
            CheckStatus::Fail => 1,
            _ => 0,
        }
    }
}

/// How a dry-run process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DryRunOutcome {
    Exited { success: bool, output: String },
    /// Still running at the timeout and killed; the config was accepted
    StillRunning,
}

/// Read-only inspection of the host beyond interface state
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SystemInspector: Send + Sync {
    /// TCP sockets listening on `port`
    async fn listener_count(&self, port: u16) -> MeshResult<usize>;

    /// Run `program` with `args`, killing it after `timeout`
    async fn dry_run(&self, program: &str, args: Vec<String>, timeout: Duration) -> MeshResult<DryRunOutcome>;
}

/// SystemInspector backed by `ss` and child processes
pub struct HostInspector;

/// Count listening sockets on `port` in `ss -Hltn` output
pub fn parse_listener_count(output: &str, port: u16) -> usize {
    let suffix = format!(":{}", port);
    output
        .lines()
        .filter_map(|line| line.split_whitespace().find(|field| field.contains(':')))
        .filter(|local| local.ends_with(&suffix))
        .count()
}

#[async_trait]
impl SystemInspector for HostInspector {
    async fn listener_count(&self, port: u16) -> MeshResult<usize> {
        let output = Command::new("ss")
            .kill_on_drop(true)
            .args(["-Hltn"])
            .output()
            .await
            .map_err(|e| MeshError::CommandFailed {
                cmd: "ss -Hltn".to_string(),
                code: None,
                stderr: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(MeshError::CommandFailed {
                cmd: "ss -Hltn".to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(parse_listener_count(&String::from_utf8_lossy(&output.stdout), port))
    }

    async fn dry_run(&self, program: &str, args: Vec<String>, timeout: Duration) -> MeshResult<DryRunOutcome> {
        debug!("Dry run: {} {}", program, args.join(" "));
        let child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                let mut text = String::from_utf8_lossy(&output.stdout).to_string();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                Ok(DryRunOutcome::Exited {
                    success: output.status.success(),
                    output: text.trim().to_string(),
                })
            }
            // dropping the wait future kills the child
            Err(_) => Ok(DryRunOutcome::StillRunning),
        }
    }
}

/// Listener count to check result for the routing daemon
pub fn listener_check(name: &str, count: usize) -> CheckResult {
    match count {
        0 => CheckResult::fail(name, "not listening"),
        1 => CheckResult::ok(name, "one listener"),
        n => CheckResult::fail(name, format!("duplicate instance ({} listeners)", n)),
    }
}

/// babeld.conf with the control port moved off the live instance's
pub fn isolated_babeld_config(content: &str, control_port: u16) -> String {
    let mut isolated = String::with_capacity(content.len());
    for line in content.lines() {
        if line.trim_start().starts_with("local-port") {
            isolated.push_str(&format!("local-port {}\n", control_port));
        } else {
            isolated.push_str(line);
            isolated.push('\n');
        }
    }
    isolated
}

pub struct HealthChecker {
    net: Arc<dyn NetObserver>,
    inspector: Arc<dyn SystemInspector>,
    render_dir: PathBuf,
    /// Scratch space for dry-run pid files and configs
    state_dir: PathBuf,
    dry_run_timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        net: Arc<dyn NetObserver>,
        inspector: Arc<dyn SystemInspector>,
        render_dir: PathBuf,
        state_dir: PathBuf,
        dry_run_timeout: Duration,
    ) -> Self {
        Self {
            net,
            inspector,
            render_dir,
            state_dir,
            dry_run_timeout,
        }
    }

    /// Run every check for `config`
    pub async fn check(&self, config: &NodeConfig) -> HealthReport {
        let mut checks = Vec::new();
        checks.extend(self.check_interfaces(config).await);
        checks.push(self.check_mesh_addresses(config).await);
        checks.push(self.check_routing(config).await);
        checks.extend(self.check_dry_runs(config).await);
        checks.push(self.check_render_current(config));

        let report = HealthReport::from_checks(checks);
        for c in report.checks.iter().filter(|c| c.status != CheckStatus::Ok) {
            warn!("Health check {}: {} ({})", c.name, c.status, c.detail);
        }
        info!("Health: {}", report.status);
        report
    }

    async fn check_interfaces(&self, config: &NodeConfig) -> Vec<CheckResult> {
        let i = &config.interfaces;
        let mut required = vec![i.ap_iface.as_str(), i.mesh_iface.as_str(), i.bridge_name.as_str()];
        if config.mesh.routing == RoutingBackend::Batman {
            required.push(i.batman_iface.as_str());
        }

        let mut results = Vec::new();
        for name in required {
            let check = format!("interface {}", name);
            results.push(match self.net.interface(name).await {
                Ok(Some(iface)) if iface.up => CheckResult::ok(check, "present and up"),
                Ok(Some(_)) => CheckResult::fail(check, "present but down"),
                Ok(None) => CheckResult::fail(check, "missing"),
                Err(e) => CheckResult::fail(check, format!("cannot observe: {}", e)),
            });
        }

        // the wired uplink is optional
        let check = format!("interface {}", i.eth_iface);
        results.push(match self.net.interface(&i.eth_iface).await {
            Ok(Some(iface)) if iface.master.as_deref() == Some(i.bridge_name.as_str()) => {
                CheckResult::ok(check, format!("in {}", i.bridge_name))
            }
            Ok(Some(_)) => CheckResult::warn(check, format!("not in {}", i.bridge_name)),
            Ok(None) => CheckResult::warn(check, "missing"),
            Err(e) => CheckResult::warn(check, format!("cannot observe: {}", e)),
        });
        results
    }

    async fn check_mesh_addresses(&self, config: &NodeConfig) -> CheckResult {
        const NAME: &str = "mesh addresses";
        let name = &config.interfaces.mesh_iface;
        let iface = match self.net.interface(name).await {
            Ok(Some(iface)) => iface,
            Ok(None) => return CheckResult::fail(NAME, format!("{} missing", name)),
            Err(e) => return CheckResult::fail(NAME, format!("cannot observe {}: {}", name, e)),
        };

        let mut missing = Vec::new();
        match config.mesh_address() {
            Ok(addr) if iface.has_address(&addr.into()) => {}
            Ok(addr) => missing.push(format!("IPv4 {}", addr)),
            Err(e) => missing.push(format!("IPv4 ({})", e)),
        }
        if iface.link_local().is_none() {
            missing.push("IPv6 link-local".to_string());
        }

        if missing.is_empty() {
            CheckResult::ok(NAME, format!("{} has IPv4 and link-local", name))
        } else {
            CheckResult::fail(NAME, format!("{} lacks {}", name, missing.join(", ")))
        }
    }

    async fn check_routing(&self, config: &NodeConfig) -> CheckResult {
        match config.mesh.routing {
            RoutingBackend::Babel => {
                const NAME: &str = "babeld";
                match self.inspector.listener_count(babeld::CONTROL_PORT).await {
                    Ok(count) => listener_check(NAME, count),
                    Err(e) => CheckResult::fail(NAME, format!("cannot count listeners: {}", e)),
                }
            }
            RoutingBackend::Batman => {
                const NAME: &str = "batman-adv";
                let bat = &config.interfaces.batman_iface;
                let mesh = &config.interfaces.mesh_iface;
                match self.net.interface(mesh).await {
                    Ok(Some(iface)) if iface.master.as_deref() == Some(bat.as_str()) => {
                        CheckResult::ok(NAME, format!("{} carries {}", bat, mesh))
                    }
                    Ok(Some(_)) => CheckResult::fail(NAME, format!("{} is not attached to {}", mesh, bat)),
                    Ok(None) => CheckResult::fail(NAME, format!("{} missing", mesh)),
                    Err(e) => CheckResult::fail(NAME, format!("cannot observe {}: {}", mesh, e)),
                }
            }
        }
    }

    async fn check_dry_runs(&self, config: &NodeConfig) -> Vec<CheckResult> {
        let mut results = Vec::new();
        let file = |daemon: &str, name: &str| (daemon.to_string(), self.render_dir.join(name));

        let mut files = vec![
            file(render::DNSMASQ, "dnsmasq.conf"),
            file(render::HOSTAPD, "hostapd.conf"),
            file(render::WPA_SUPPLICANT, render::MESH_SUPPLICANT_FILE),
        ];
        if config.mesh.routing == RoutingBackend::Babel {
            files.push(file(render::BABELD, render::BABELD_FILE));
        }

        for (daemon, path) in files {
            let check = format!("{} config", daemon);
            if !path.exists() {
                results.push(CheckResult::fail(check, format!("{} not rendered", path.display())));
                continue;
            }
            results.push(match daemon.as_str() {
                render::DNSMASQ => self.dry_run_dnsmasq(&check, &path).await,
                render::BABELD => self.dry_run_babeld(&check, &path).await,
                _ => CheckResult::ok(check, "rendered; no isolated dry-run available"),
            });
        }
        results
    }

    async fn dry_run_dnsmasq(&self, check: &str, path: &Path) -> CheckResult {
        let args = vec!["--test".to_string(), format!("--conf-file={}", path.display())];
        match self.inspector.dry_run("dnsmasq", args, self.dry_run_timeout).await {
            Ok(DryRunOutcome::Exited { success: true, .. }) => CheckResult::ok(check, "syntax check OK"),
            Ok(DryRunOutcome::Exited { output, .. }) => CheckResult::fail(check, output),
            Ok(DryRunOutcome::StillRunning) => CheckResult::warn(check, "dry run did not finish"),
            Err(e) => CheckResult::warn(check, format!("dry run unavailable: {}", e)),
        }
    }

    async fn dry_run_babeld(&self, check: &str, path: &Path) -> CheckResult {
        let scratch = self.state_dir.join("dry-run");
        let conf = scratch.join("babeld.conf");
        let prepared = tokio::fs::read_to_string(path)
            .await
            .map_err(MeshError::from)
            .and_then(|content| {
                std::fs::create_dir_all(&scratch)?;
                write_secure(&conf, &isolated_babeld_config(&content, DRY_RUN_BABEL_CONTROL_PORT), 0o600)
            });
        if let Err(e) = prepared {
            return CheckResult::warn(check, format!("cannot prepare dry run: {}", e));
        }

        let table = DRY_RUN_BABEL_TABLE.to_string();
        let args = vec![
            "-c".to_string(),
            conf.display().to_string(),
            "-I".to_string(),
            scratch.join("babeld.pid").display().to_string(),
            "-S".to_string(),
            scratch.join("babel-state").display().to_string(),
            "-p".to_string(),
            DRY_RUN_BABEL_PROTOCOL_PORT.to_string(),
            "-t".to_string(),
            table.clone(),
            "-T".to_string(),
            table,
        ];
        match self.inspector.dry_run("babeld", args, self.dry_run_timeout).await {
            Ok(DryRunOutcome::StillRunning) => CheckResult::ok(check, "accepted by isolated instance"),
            Ok(DryRunOutcome::Exited { success: true, .. }) => CheckResult::ok(check, "accepted"),
            Ok(DryRunOutcome::Exited { output, .. }) => CheckResult::fail(check, output),
            Err(e) => CheckResult::warn(check, format!("dry run unavailable: {}", e)),
        }
    }

    fn check_render_current(&self, config: &NodeConfig) -> CheckResult {
        const NAME: &str = "rendered config";
        let set = match render::render(config) {
            Ok(set) => set,
            Err(e) => return CheckResult::fail(NAME, format!("configuration does not render: {}", e)),
        };
        match render::stored_hash(&self.render_dir) {
            Some(hash) if hash == set.config_hash => CheckResult::ok(NAME, "current"),
            Some(_) => CheckResult::warn(NAME, "stale; run meshctl render"),
            None => CheckResult::warn(NAME, "never rendered"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconcileSettings;
    use crate::netops::fake::FakeNet;
    use crate::node_config::test_config;
    use crate::reconcile::{ReconcileTiming, Reconciler};
    use mockall::predicate::eq;

    fn passing_dry_runs(inspector: &mut MockSystemInspector) {
        inspector.expect_dry_run().returning(|program, _, _| {
            Ok(match program {
                "babeld" => DryRunOutcome::StillRunning,
                _ => DryRunOutcome::Exited {
                    success: true,
                    output: "dnsmasq: syntax check OK.".to_string(),
                },
            })
        });
    }

    async fn converged(config: &NodeConfig, render_dir: &Path) -> Arc<FakeNet> {
        let net = Arc::new(FakeNet::new());
        net.state().interfaces.get_mut("wlan0").unwrap().up = true;
        render::apply(config, render_dir).unwrap();
        Reconciler::new(
            net.clone(),
            ReconcileTiming::from(&ReconcileSettings::default()),
            render_dir.to_path_buf(),
        )
        .reconcile(config)
        .await
        .unwrap();
        net
    }

    fn checker(net: Arc<FakeNet>, inspector: MockSystemInspector, dir: &Path) -> HealthChecker {
        HealthChecker::new(
            net,
            Arc::new(inspector),
            dir.join("rendered"),
            dir.join("state"),
            Duration::from_millis(500),
        )
    }

    fn find<'a>(report: &'a HealthReport, name: &str) -> &'a CheckResult {
        report.checks.iter().find(|c| c.name == name).unwrap()
    }

    #[test]
    fn listener_counts() {
        assert_eq!(listener_check("babeld", 1).status, CheckStatus::Ok);

        let none = listener_check("babeld", 0);
        assert_eq!(none.status, CheckStatus::Fail);
        assert_eq!(none.detail, "not listening");

        let two = listener_check("babeld", 2);
        assert_eq!(two.status, CheckStatus::Fail);
        assert!(two.detail.starts_with("duplicate instance"));
    }

    #[test]
    fn overall_is_worst_check() {
        let report = HealthReport::from_checks(vec![
            CheckResult::ok("a", ""),
            CheckResult::warn("b", ""),
        ]);
        assert_eq!(report.status, CheckStatus::Warn);
        assert_eq!(report.exit_code(), 0);

        let report = HealthReport::from_checks(vec![
            CheckResult::warn("b", ""),
            CheckResult::fail("c", ""),
            CheckResult::ok("a", ""),
        ]);
        assert_eq!(report.status, CheckStatus::Fail);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.failures().count(), 1);

        assert_eq!(HealthReport::from_checks(vec![]).status, CheckStatus::Ok);
    }

    #[test]
    fn ss_output_is_counted_per_port() {
        let output = "\
LISTEN 0      5          [::1]:33123        [::]:*
LISTEN 0      4096   127.0.0.1:8088      0.0.0.0:*
LISTEN 0      5      127.0.0.1:33123     0.0.0.0:*
LISTEN 0      128      0.0.0.0:133123    0.0.0.0:*
";
        assert_eq!(parse_listener_count(output, 33123), 2);
        assert_eq!(parse_listener_count(output, 8088), 1);
        assert_eq!(parse_listener_count("", 33123), 0);
    }

    #[test]
    fn isolated_babeld_uses_other_control_port() {
        let conf = "local-port 33123\nrandom-id true\ninterface mesh0 type wireless\n";
        let isolated = isolated_babeld_config(conf, 43123);
        assert!(isolated.starts_with("local-port 43123\n"));
        assert!(isolated.contains("interface mesh0 type wireless\n"));
        assert!(!isolated.contains("33123"));
    }

    #[tokio::test(start_paused = true)]
    async fn converged_babel_node_is_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.mesh.routing = RoutingBackend::Babel;
        let net = converged(&config, &dir.path().join("rendered")).await;

        let mut inspector = MockSystemInspector::new();
        inspector
            .expect_listener_count()
            .with(eq(babeld::CONTROL_PORT))
            .times(1)
            .returning(|_| Ok(1));
        passing_dry_runs(&mut inspector);

        let report = checker(net, inspector, dir.path()).check(&config).await;
        assert_eq!(report.status, CheckStatus::Ok, "{:#?}", report.checks);
        assert!(dir.path().join("state/dry-run/babeld.conf").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_babeld_listener_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.mesh.routing = RoutingBackend::Babel;
        let net = converged(&config, &dir.path().join("rendered")).await;

        let mut inspector = MockSystemInspector::new();
        inspector.expect_listener_count().returning(|_| Ok(0));
        inspector.expect_dry_run().returning(|_, _, _| Ok(DryRunOutcome::StillRunning));

        let report = checker(net, inspector, dir.path()).check(&config).await;
        assert_eq!(report.status, CheckStatus::Fail);
        assert_eq!(find(&report, "babeld").detail, "not listening");
    }

    #[tokio::test(start_paused = true)]
    async fn batman_node_checks_bat0_not_listener() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config();
        let net = converged(&config, &dir.path().join("rendered")).await;

        let mut inspector = MockSystemInspector::new();
        inspector.expect_listener_count().never();
        passing_dry_runs(&mut inspector);

        let report = checker(net.clone(), inspector, dir.path()).check(&config).await;
        assert_eq!(find(&report, "batman-adv").status, CheckStatus::Ok);
        assert_eq!(report.status, CheckStatus::Ok, "{:#?}", report.checks);

        net.state().interfaces.get_mut("mesh0").unwrap().master = None;
        let mut inspector = MockSystemInspector::new();
        passing_dry_runs(&mut inspector);
        let report = checker(net, inspector, dir.path()).check(&config).await;
        assert_eq!(find(&report, "batman-adv").status, CheckStatus::Fail);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_render_warns_and_bad_dnsmasq_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config();
        let net = converged(&config, &dir.path().join("rendered")).await;

        let mut edited = config.clone();
        edited.ap.channel = 6;

        let mut inspector = MockSystemInspector::new();
        inspector.expect_dry_run().returning(|_, _, _| {
            Ok(DryRunOutcome::Exited {
                success: false,
                output: "dnsmasq: bad option at line 3".to_string(),
            })
        });

        let report = checker(net, inspector, dir.path()).check(&edited).await;
        assert_eq!(find(&report, "rendered config").status, CheckStatus::Warn);
        let dnsmasq = find(&report, "dnsmasq config");
        assert_eq!(dnsmasq.status, CheckStatus::Fail);
        assert!(dnsmasq.detail.contains("line 3"));
        assert_eq!(
            find(&report, "hostapd config").status,
            CheckStatus::Ok,
            "hostapd has no dry run"
        );
    }

    #[tokio::test]
    async fn missing_interfaces_fail_before_anything_exists() {
        let dir = tempfile::tempdir().unwrap();
        let net = Arc::new(FakeNet::new());
        let mut inspector = MockSystemInspector::new();
        inspector.expect_listener_count().never();
        inspector.expect_dry_run().never();

        let report = checker(net, inspector, dir.path()).check(&test_config()).await;
        assert_eq!(report.status, CheckStatus::Fail);
        assert_eq!(find(&report, "interface mesh0").detail, "missing");
        assert_eq!(find(&report, "interface wlan0").detail, "present but down");
        assert_eq!(find(&report, "rendered config").detail, "never rendered");
        assert!(find(&report, "dnsmasq config").detail.ends_with("not rendered"));
    }
}
