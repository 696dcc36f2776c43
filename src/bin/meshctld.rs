//! Mesh Node Daemon (meshctld)
//!
//! Keeps the node converged and observable:
//! - renders and reconciles at startup
//! - collects neighbor telemetry every telemetry poll interval
//! - runs health checks and a reconcile pass periodically
//! - reloads the node configuration on SIGHUP
//! - serves the local dashboard API
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (requires root/sudo)
//! sudo meshctld
//!
//! # Reload after editing /etc/meshctl/node.toml by hand
//! sudo systemctl reload meshctld
//! ```

use clap::Parser;
use libmeshctl::api::{self, system_hostname};
use libmeshctl::config::DEFAULT_CONFIG_PATH;
use libmeshctl::error::{MeshError, MeshResult};
use libmeshctl::uplink::UplinkCheck;
use libmeshctl::wpa_supplicant::MeshSupplicant;
use libmeshctl::*;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Mesh Node Daemon
#[derive(Parser, Debug)]
#[command(name = "meshctld")]
#[command(version)]
#[command(about = "Mesh node daemon - reconciles the node and serves the local dashboard", long_about = None)]
struct Args {
    /// meshctl runtime configuration
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Do not serve the dashboard API
    #[arg(long)]
    no_api: bool,
}

/// Everything the loops share
struct Daemon {
    settings: MeshctlConfig,
    node: RwLock<NodeConfig>,
    collector: RwLock<Arc<Collector>>,
    net: Arc<SystemNetOps>,
    supervisor: Arc<SystemdSupervisor>,
    reconciler: Arc<Reconciler>,
    health: HealthChecker,
    dashboard: Arc<Dashboard>,
}

impl Daemon {
    fn new(settings: MeshctlConfig, node: NodeConfig) -> Self {
        let supplicant = MeshSupplicant::new(
            settings.paths.wpa_ctrl_dir.clone(),
            settings.paths.state_dir.clone(),
        );
        let net = Arc::new(SystemNetOps::new(
            supplicant,
            settings.reconcile.iface_create_timeout(),
        ));
        let supervisor = Arc::new(SystemdSupervisor::new());
        let reconciler = Arc::new(Reconciler::new(
            net.clone(),
            ReconcileTiming::from(&settings.reconcile),
            settings.paths.render_dir.clone(),
        ));
        let health = HealthChecker::new(
            net.clone(),
            Arc::new(HostInspector),
            settings.paths.render_dir.clone(),
            settings.paths.state_dir.clone(),
            Duration::from_millis(settings.health.dry_run_timeout_ms),
        );
        let hostname = system_hostname()
            .or_else(|| node.node.name.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let dashboard = Arc::new(Dashboard::new(
            hostname,
            Watched::new(&node, &settings.services),
            settings.telemetry.node_timeout(),
            net.clone(),
            supervisor.clone(),
            reconciler.clone(),
            UplinkCheck::new(Duration::from_secs(settings.api.uplink_ttl_secs)),
        ));
        let collector = Arc::new(collector_for(&node, &settings));

        Self {
            settings,
            node: RwLock::new(node),
            collector: RwLock::new(collector),
            net,
            supervisor,
            reconciler,
            health,
            dashboard,
        }
    }

    /// Render, restart what changed and reconcile against the current config
    async fn apply(&self) {
        let config = self.node.read().await.clone();
        match apply_config(
            &config,
            &self.settings,
            &*self.net,
            &*self.supervisor,
            &self.reconciler,
        )
        .await
        {
            Ok(outcome) => {
                for warning in &outcome.restart.warnings {
                    warn!("{}", warning);
                }
                if let Ok(report) = &outcome.reconcile {
                    info!(
                        "Node converged to phase {} ({} change(s) rendered)",
                        report.phase,
                        outcome.changed.len()
                    );
                }
            }
            Err(e) => error!("Failed to apply node configuration: {}", e),
        }
    }

    /// Re-read the node configuration and apply it
    async fn reload(&self) {
        let path = &self.settings.paths.node_config;
        let config = match NodeConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Reload failed, keeping current configuration: {}", e);
                return;
            }
        };
        if let Err(e) = config.validate() {
            error!("Reload rejected, keeping current configuration: {}", e);
            return;
        }

        {
            let mut current = self.node.write().await;
            if *current == config {
                info!("Node configuration unchanged; re-applying");
            }
            *current = config.clone();
        }
        *self.collector.write().await = Arc::new(collector_for(&config, &self.settings));
        self.dashboard
            .set_watched(Watched::new(&config, &self.settings.services));

        self.apply().await;
    }

    async fn collect_once(&self) {
        let collector = self.collector.read().await.clone();
        let snapshot = collector.collect().await;
        debug!(
            "Telemetry: {} active of {} neighbors",
            snapshot.active_count(),
            snapshot.nodes.len()
        );
        self.dashboard.publish_snapshot(snapshot);
    }

    async fn check_once(&self) {
        let config = self.node.read().await.clone();
        let report = self.health.check(&config).await;
        for check in report.failures() {
            warn!("Health check {} failed: {}", check.name, check.detail);
        }
        info!("Health: {}", report.status);
        self.dashboard.publish_health(report);
    }

    async fn reconcile_once(&self) {
        if self.reconciler.is_busy() {
            debug!("Reconcile already in progress; skipping periodic pass");
            return;
        }
        let config = self.node.read().await.clone();
        match self.reconciler.reconcile(&config).await {
            Ok(report) if report.mutations() > 0 => {
                info!("Periodic reconcile repaired {} item(s)", report.mutations())
            }
            Ok(_) => debug!("Periodic reconcile: nothing to do"),
            Err(e) => warn!("Periodic reconcile failed: {}", e),
        }
    }
}

fn collector_for(node: &NodeConfig, settings: &MeshctlConfig) -> Collector {
    Collector::new(
        Box::new(SystemTelemetrySource::new()),
        CollectorSettings::new(node, &settings.telemetry),
    )
}

#[tokio::main]
async fn main() -> MeshResult<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Mesh Node Daemon (meshctld)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    #[cfg(target_os = "linux")]
    {
        let uid = unsafe { libc::getuid() };
        if uid != 0 {
            warn!("Not running as root - interface changes will fail");
        }
    }

    let settings = MeshctlConfig::load_or_default(&args.config)?;
    settings.validate()?;
    settings.ensure_directories()?;

    let node = NodeConfig::load(&settings.paths.node_config).map_err(|e| {
        error!(
            "Cannot load node configuration {}: {}",
            settings.paths.node_config.display(),
            e
        );
        error!("  Run `meshctl init` to create one");
        e
    })?;
    node.validate()?;

    let daemon = Arc::new(Daemon::new(settings, node));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (reload_tx, mut reload_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        if let Err(e) = handle_signals(shutdown_tx, reload_tx).await {
            error!("Signal handler error: {}", e);
        }
    });

    let api_task = if args.no_api {
        info!("Dashboard API disabled (--no-api)");
        None
    } else {
        let daemon = daemon.clone();
        let shutdown = wait_for(shutdown_rx.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = api::serve(&daemon.settings, daemon.dashboard.clone(), shutdown).await {
                error!("Dashboard API stopped: {}", e);
            }
        }))
    };

    info!("Running initial render and reconcile...");
    daemon.apply().await;

    let telemetry_task = spawn_loop(
        daemon.clone(),
        shutdown_rx.clone(),
        Duration::from_millis(daemon.settings.telemetry.poll_interval_ms.max(100)),
        false,
        |d| async move { d.collect_once().await },
    );
    let health_task = spawn_loop(
        daemon.clone(),
        shutdown_rx.clone(),
        Duration::from_secs(daemon.settings.health.interval_secs.max(1)),
        false,
        |d| async move { d.check_once().await },
    );
    let reconcile_task = spawn_loop(
        daemon.clone(),
        shutdown_rx.clone(),
        Duration::from_secs(daemon.settings.reconcile.interval_secs.max(1)),
        true,
        |d| async move { d.reconcile_once().await },
    );

    info!("Mesh Node Daemon is ready");

    let mut shutdown = shutdown_rx.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            Some(()) = reload_rx.recv() => daemon.reload().await,
        }
    }

    info!("Shutting down Mesh Node Daemon...");
    for task in [telemetry_task, health_task, reconcile_task] {
        if let Err(e) = task.await {
            warn!("Loop ended abnormally: {}", e);
        }
    }
    if let Some(task) = api_task {
        if let Err(e) = task.await {
            warn!("API task ended abnormally: {}", e);
        }
    }

    info!("Mesh Node Daemon stopped");
    Ok(())
}

/// Run `tick` every `period` until shutdown
fn spawn_loop<F, Fut>(
    daemon: Arc<Daemon>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
    skip_first: bool,
    tick: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(Arc<Daemon>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        if skip_first {
            ticker.tick().await;
        }
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => tick(daemon.clone()).await,
            }
        }
    })
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

/// Initialize logging based on command-line arguments
fn init_logging(args: &Args) {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "meshctld={},libmeshctl={},tower_http=warn",
            log_level, log_level
        ))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .init();
}

/// Handle Unix signals: SIGTERM/SIGINT stop, SIGHUP reloads
async fn handle_signals(shutdown: watch::Sender<bool>, reload: mpsc::Sender<()>) -> MeshResult<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| MeshError::Service(format!("Failed to register SIGTERM handler: {}", e)))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| MeshError::Service(format!("Failed to register SIGINT handler: {}", e)))?;
    let mut sighup = signal(SignalKind::hangup())
        .map_err(|e| MeshError::Service(format!("Failed to register SIGHUP handler: {}", e)))?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading node configuration");
                // a reload already queued covers this one
                let _ = reload.try_send(());
            }
        }
    }

    let _ = shutdown.send(true);
    Ok(())
}
