//! Service Supervisor Adapter
//!
//! Thin wrapper over `systemctl`, plus the ordered restart plan run after a
//! reconfiguration. Unit lifecycle beyond start/stop/restart/is-active
//! belongs to systemd.

use crate::config::ServiceSettings;
use crate::error::{MeshError, MeshResult};
use crate::node_config::{NodeConfig, RoutingBackend};
use crate::render;
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceSupervisor: Send + Sync {
    async fn start(&self, unit: &str) -> MeshResult<()>;
    async fn stop(&self, unit: &str) -> MeshResult<()>;
    async fn restart(&self, unit: &str) -> MeshResult<()>;
    /// `Some(true)` active, `Some(false)` inactive or failed, `None` unknown
    async fn is_active(&self, unit: &str) -> Option<bool>;
}

/// ServiceSupervisor backed by systemctl
pub struct SystemdSupervisor {
    systemctl: PathBuf,
}

impl SystemdSupervisor {
    pub fn new() -> Self {
        Self {
            systemctl: PathBuf::from("systemctl"),
        }
    }

    fn check_unit(unit: &str) -> MeshResult<()> {
        let valid = !unit.is_empty()
            && !unit.starts_with('-')
            && unit
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-_.@:".contains(c));
        if valid {
            Ok(())
        } else {
            Err(MeshError::InvalidParameter(format!("invalid unit name '{}'", unit)))
        }
    }

    async fn run_systemctl(&self, args: &[&str]) -> MeshResult<()> {
        debug!("Running systemctl {}", args.join(" "));
        let output = Command::new(&self.systemctl)
            .kill_on_drop(true)
            .args(args)
            .output()
            .await
            .map_err(|e| MeshError::CommandFailed {
                cmd: format!("systemctl {}", args.join(" ")),
                code: None,
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(MeshError::CommandFailed {
                cmd: format!("systemctl {}", args.join(" ")),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }
}

impl Default for SystemdSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Map `systemctl is-active` output to a tri-state
pub fn parse_is_active(stdout: &str) -> Option<bool> {
    match stdout.trim() {
        "active" => Some(true),
        "inactive" | "failed" => Some(false),
        _ => None,
    }
}

#[async_trait]
impl ServiceSupervisor for SystemdSupervisor {
    async fn start(&self, unit: &str) -> MeshResult<()> {
        Self::check_unit(unit)?;
        self.run_systemctl(&["start", unit]).await
    }

    async fn stop(&self, unit: &str) -> MeshResult<()> {
        Self::check_unit(unit)?;
        self.run_systemctl(&["stop", unit]).await
    }

    async fn restart(&self, unit: &str) -> MeshResult<()> {
        Self::check_unit(unit)?;
        self.run_systemctl(&["restart", unit]).await
    }

    async fn is_active(&self, unit: &str) -> Option<bool> {
        Self::check_unit(unit).ok()?;
        // non-zero exit for inactive units, so only stdout matters
        let output = Command::new(&self.systemctl)
            .kill_on_drop(true)
            .args(["is-active", unit])
            .output()
            .await
            .ok()?;
        parse_is_active(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Units to bounce after rendered configs changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestartPlan {
    /// Units of the unused routing backend
    pub stop: Vec<String>,
    /// In configured order
    pub restart: Vec<String>,
}

impl RestartPlan {
    /// Plan for a render that changed the files of `changed` daemons
    ///
    /// Nothing changed means nothing restarts. Otherwise every unit in the
    /// configured order restarts, except babeld on a batman node, which is
    /// stopped instead.
    pub fn for_change(settings: &ServiceSettings, config: &NodeConfig, changed: &[String]) -> Self {
        if changed.is_empty() {
            return Self::default();
        }

        let mut plan = Self::default();
        for name in &settings.restart_order {
            let unit = match name.as_str() {
                render::HOSTAPD => settings.hostapd_unit.clone(),
                render::DNSMASQ => settings.dnsmasq_unit.clone(),
                render::BABELD => settings.babeld_unit.clone(),
                other => other.to_string(),
            };

            if name == render::BABELD && config.mesh.routing == RoutingBackend::Batman {
                plan.stop.push(unit);
            } else if !plan.restart.contains(&unit) {
                plan.restart.push(unit);
            }
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.stop.is_empty() && self.restart.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestartOutcome {
    pub stopped: Vec<String>,
    pub restarted: Vec<String>,
    /// One line per failed unit; a failure never stops the plan
    pub warnings: Vec<String>,
}

/// Execute `plan` in order, collecting failures as warnings
pub async fn execute(plan: &RestartPlan, supervisor: &dyn ServiceSupervisor) -> RestartOutcome {
    let mut outcome = RestartOutcome::default();

    for unit in &plan.stop {
        match supervisor.stop(unit).await {
            Ok(()) => outcome.stopped.push(unit.clone()),
            Err(e) => {
                warn!("Failed to stop {}: {}", unit, e);
                outcome.warnings.push(format!("{}: {}", unit, e));
            }
        }
    }

    for unit in &plan.restart {
        match supervisor.restart(unit).await {
            Ok(()) => {
                info!("Restarted {}", unit);
                outcome.restarted.push(unit.clone());
            }
            Err(e) => {
                warn!("Failed to restart {}: {}", unit, e);
                outcome.warnings.push(format!("{}: {}", unit, e));
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_config::test_config;
    use mockall::predicate::eq;
    use mockall::Sequence;

    fn changed() -> Vec<String> {
        vec![render::HOSTAPD.to_string()]
    }

    #[test]
    fn batman_node_stops_babeld() {
        let plan = RestartPlan::for_change(&ServiceSettings::default(), &test_config(), &changed());
        assert_eq!(plan.restart, vec!["systemd-networkd", "dnsmasq", "hostapd"]);
        assert_eq!(plan.stop, vec!["babeld"]);
    }

    #[test]
    fn babel_node_restarts_babeld_last() {
        let mut config = test_config();
        config.mesh.routing = RoutingBackend::Babel;
        let plan = RestartPlan::for_change(&ServiceSettings::default(), &config, &changed());
        assert_eq!(plan.restart.last().map(String::as_str), Some("babeld"));
        assert!(plan.stop.is_empty());
    }

    #[test]
    fn unchanged_render_restarts_nothing() {
        let plan = RestartPlan::for_change(&ServiceSettings::default(), &test_config(), &[]);
        assert!(plan.is_empty());
    }

    #[test]
    fn is_active_output() {
        assert_eq!(parse_is_active("active\n"), Some(true));
        assert_eq!(parse_is_active("failed\n"), Some(false));
        assert_eq!(parse_is_active("inactive"), Some(false));
        assert_eq!(parse_is_active("activating\n"), None);
        assert_eq!(parse_is_active(""), None);
    }

    #[test]
    fn unit_names_are_checked() {
        assert!(SystemdSupervisor::check_unit("hostapd").is_ok());
        assert!(SystemdSupervisor::check_unit("wpa_supplicant@mesh0.service").is_ok());
        assert!(SystemdSupervisor::check_unit("--now").is_err());
        assert!(SystemdSupervisor::check_unit("a b").is_err());
    }

    #[tokio::test]
    async fn failures_become_warnings_and_order_holds() {
        let mut mock = MockServiceSupervisor::new();
        let mut seq = Sequence::new();

        mock.expect_stop()
            .with(eq("babeld"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_restart()
            .with(eq("systemd-networkd"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_restart()
            .with(eq("dnsmasq"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|unit| Err(MeshError::Service(format!("{} failed to start", unit))));
        mock.expect_restart()
            .with(eq("hostapd"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let plan = RestartPlan::for_change(&ServiceSettings::default(), &test_config(), &changed());
        let outcome = execute(&plan, &mock).await;

        assert_eq!(outcome.stopped, vec!["babeld"]);
        assert_eq!(outcome.restarted, vec!["systemd-networkd", "hostapd"]);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].starts_with("dnsmasq:"));
    }

    /// Whether `pid` is still a live process
    #[cfg(target_os = "linux")]
    fn running(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => !matches!(
                stat.rsplit(')').next().and_then(|rest| rest.trim_start().chars().next()),
                Some('Z') | Some('X')
            ),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn abandoned_systemctl_is_killed() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("pid");
        let script = dir.path().join("systemctl");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho $$ > {}\nexec sleep 30\n", pid_file.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let supervisor = SystemdSupervisor { systemctl: script };

        let result = tokio::time::timeout(Duration::from_secs(2), supervisor.restart("hostapd.service")).await;
        assert!(result.is_err());

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        let mut alive = running(&pid);
        for _ in 0..50 {
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            alive = running(&pid);
        }
        assert!(!alive, "systemctl stand-in {} outlived its caller", pid);
    }
}
