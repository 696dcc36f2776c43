//! meshctl - Mesh Node Control CLI
//!
//! First-run setup, reconfiguration, rendering, reconciliation and
//! diagnostics for a single mesh node. Runs alongside meshctld; passes are
//! serialized per process, so avoid running `reconcile` while the daemon is
//! mid-pass.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use libmeshctl::api::system_hostname;
use libmeshctl::config::DEFAULT_CONFIG_PATH;
use libmeshctl::health::CheckStatus;
use libmeshctl::node_config::{self, NodeConfig};
use libmeshctl::render;
use libmeshctl::wpa_supplicant::MeshSupplicant;
use libmeshctl::*;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "meshctl")]
#[command(version)]
#[command(about = "Mesh node control - configure, render, reconcile and inspect an 802.11s node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// meshctl runtime configuration
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Node configuration file (overrides paths.node_config)
    #[arg(long)]
    node_config: Option<PathBuf>,

    /// Rendered config directory (overrides paths.render_dir)
    #[arg(long)]
    render_dir: Option<PathBuf>,

    /// Output format: text, json
    #[arg(short = 'o', long, default_value = "text")]
    output: String,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a first-run node configuration
    Init {
        /// Node name (defaults to the hostname)
        #[arg(long)]
        name: Option<String>,
        /// Node id, selects the LAN subnet and mesh address
        #[arg(long, default_value_t = 1)]
        id: u16,
        /// Ask for every setting
        #[arg(short, long)]
        interactive: bool,
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
        /// Only write the configuration, do not render or reconcile
        #[arg(long)]
        no_apply: bool,
    },
    /// Change the node configuration, then render, restart and reconcile
    Configure {
        /// Set one field, e.g. --set mesh.channel=6 (repeatable)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
        /// Import a legacy KEY=VALUE configuration file
        #[arg(long, value_name = "FILE")]
        import: Option<PathBuf>,
        /// Walk through the settings interactively
        #[arg(short, long)]
        interactive: bool,
        /// Only save the configuration
        #[arg(long)]
        no_apply: bool,
    },
    /// Render daemon configs from the node configuration
    Render,
    /// Validate the node configuration without touching anything
    Validate,
    /// Converge interfaces to the node configuration
    Reconcile,
    /// Remove the mesh, batman and bridge interfaces
    Teardown,
    /// Run the health checks
    Health,
    /// Show mesh neighbors
    Neighbors,
    /// Show mesh phase and render state
    Status,
}

struct Ctx {
    settings: MeshctlConfig,
    node_path: PathBuf,
    json: bool,
}

impl Ctx {
    fn load_node(&self) -> Result<NodeConfig> {
        NodeConfig::load(&self.node_path)
            .with_context(|| format!("cannot load node configuration {}", self.node_path.display()))
    }

    fn net(&self) -> Arc<SystemNetOps> {
        let supplicant = MeshSupplicant::new(
            self.settings.paths.wpa_ctrl_dir.clone(),
            self.settings.paths.state_dir.clone(),
        );
        Arc::new(SystemNetOps::new(
            supplicant,
            self.settings.reconcile.iface_create_timeout(),
        ))
    }

    fn reconciler(&self, net: Arc<SystemNetOps>) -> Reconciler {
        Reconciler::new(
            net,
            ReconcileTiming::from(&self.settings.reconcile),
            self.settings.paths.render_dir.clone(),
        )
    }

    fn print_json<T: serde::Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("meshctl={},libmeshctl={}", level, level)));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

fn warn_if_not_root() {
    #[cfg(target_os = "linux")]
    {
        let uid = unsafe { libc::getuid() };
        if uid != 0 {
            eprintln!("Warning: not running as root - interface changes will likely fail");
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let mut settings = MeshctlConfig::load_or_default(&cli.config)
        .with_context(|| format!("cannot load {}", cli.config.display()))?;
    if let Some(dir) = cli.render_dir {
        settings.paths.render_dir = dir;
    }
    let node_path = cli
        .node_config
        .unwrap_or_else(|| settings.paths.node_config.clone());
    let ctx = Ctx {
        settings,
        node_path,
        json: cli.output == "json",
    };

    match cli.command {
        Commands::Init {
            name,
            id,
            interactive,
            force,
            no_apply,
        } => handle_init(&ctx, name, id, interactive, force, no_apply).await,
        Commands::Configure {
            set,
            import,
            interactive,
            no_apply,
        } => handle_configure(&ctx, &set, import.as_deref(), interactive, no_apply).await,
        Commands::Render => handle_render(&ctx),
        Commands::Validate => handle_validate(&ctx),
        Commands::Reconcile => handle_reconcile(&ctx).await,
        Commands::Teardown => handle_teardown(&ctx).await,
        Commands::Health => handle_health(&ctx).await,
        Commands::Neighbors => handle_neighbors(&ctx).await,
        Commands::Status => handle_status(&ctx).await,
    }
}

fn parse_patch(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => bail!("'{}' is not KEY=VALUE", raw),
    }
}

async fn handle_init(
    ctx: &Ctx,
    name: Option<String>,
    id: u16,
    interactive: bool,
    force: bool,
    no_apply: bool,
) -> Result<i32> {
    if ctx.node_path.exists() && !force {
        bail!(
            "{} already exists; use `meshctl configure` or pass --force",
            ctx.node_path.display()
        );
    }

    let name = name
        .or_else(system_hostname)
        .unwrap_or_else(|| "orbis-node".to_string());
    let mut config = NodeConfig::first_run(&name, id);
    if interactive {
        let stdin = io::stdin();
        node_config::interactive_setup(&mut config, &mut stdin.lock(), &mut io::stdout())?;
    }
    config.validate()?;

    if let Some(parent) = ctx.node_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    config.save(&ctx.node_path)?;
    println!("Wrote {}", ctx.node_path.display());

    if no_apply {
        return Ok(0);
    }
    apply(ctx, &config).await
}

async fn handle_configure(
    ctx: &Ctx,
    set: &[String],
    import: Option<&Path>,
    interactive: bool,
    no_apply: bool,
) -> Result<i32> {
    if set.is_empty() && import.is_none() && !interactive {
        bail!("nothing to change; pass --set, --import or --interactive");
    }

    let patches = set
        .iter()
        .map(|raw| parse_patch(raw))
        .collect::<Result<Vec<_>>>()?;
    let legacy = match import {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path.display()))?,
        ),
        None => None,
    };

    // the dialogue runs before the edit so it can see the imported values
    let mut edited = ctx.load_node()?;
    let mut ignored = Vec::new();
    if let Some(content) = &legacy {
        ignored = edited.import_kv(content)?;
    }
    edited.apply_patches(&patches)?;
    if interactive {
        let stdin = io::stdin();
        node_config::interactive_setup(&mut edited, &mut stdin.lock(), &mut io::stdout())?;
    }

    for key in &ignored {
        eprintln!("Ignored legacy key {}", key);
    }

    let result = node_config::reconfigure(&ctx.node_path, move |config| {
        *config = edited;
        Ok(())
    })?;

    if !result.changed() {
        println!("Configuration unchanged");
        return Ok(0);
    }
    println!("Saved {}", ctx.node_path.display());

    if no_apply {
        return Ok(0);
    }
    apply(ctx, &result.config).await
}

async fn apply(ctx: &Ctx, config: &NodeConfig) -> Result<i32> {
    warn_if_not_root();
    let net = ctx.net();
    let reconciler = ctx.reconciler(net.clone());
    let supervisor = SystemdSupervisor::new();

    let outcome = apply_config(config, &ctx.settings, &*net, &supervisor, &reconciler).await?;

    if outcome.changed.is_empty() {
        println!("Rendered configs already current");
    } else {
        println!("Rendered: {}", outcome.changed.join(", "));
    }
    for unit in &outcome.restart.stopped {
        println!("Stopped {}", unit);
    }
    for unit in &outcome.restart.restarted {
        println!("Restarted {}", unit);
    }
    for warning in &outcome.restart.warnings {
        eprintln!("Warning: {}", warning);
    }

    match outcome.reconcile {
        Ok(report) => {
            print_report(ctx, &report)?;
            Ok(0)
        }
        Err(e) => {
            eprintln!("Reconcile failed: {}", e);
            Ok(1)
        }
    }
}

fn handle_render(ctx: &Ctx) -> Result<i32> {
    let config = ctx.load_node()?;
    config.validate()?;
    let outcome = render::apply(&config, &ctx.settings.paths.render_dir)?;

    if ctx.json {
        ctx.print_json(&serde_json::json!({
            "dir": ctx.settings.paths.render_dir,
            "config_hash": outcome.set.config_hash,
            "files": outcome.set.files,
            "changed": outcome.changed,
        }))?;
    } else if outcome.is_unchanged() {
        println!("Up to date ({})", outcome.set.config_hash);
    } else {
        for daemon in &outcome.changed {
            if let Some(file) = outcome.set.get(daemon) {
                println!(
                    "Wrote {}",
                    ctx.settings.paths.render_dir.join(&file.filename).display()
                );
            }
        }
        println!("Config hash {}", outcome.set.config_hash);
    }
    Ok(0)
}

fn handle_validate(ctx: &Ctx) -> Result<i32> {
    let config = ctx.load_node()?;
    match config.validate() {
        Ok(()) => {
            if ctx.json {
                ctx.print_json(&serde_json::json!({ "valid": true }))?;
            } else {
                println!("Configuration is valid");
            }
            Ok(0)
        }
        Err(e) => {
            if ctx.json {
                ctx.print_json(&serde_json::json!({
                    "valid": false,
                    "field": e.field(),
                    "error": e.to_string(),
                }))?;
            } else {
                eprintln!("Invalid: {}", e);
            }
            Ok(1)
        }
    }
}

fn print_report(ctx: &Ctx, report: &ReconcileReport) -> Result<()> {
    if ctx.json {
        return ctx.print_json(report);
    }
    for step in &report.steps {
        let outcome = match &step.outcome {
            StepOutcome::Applied => "applied".to_string(),
            StepOutcome::AlreadyConverged => continue,
            StepOutcome::BestEffortFailed(reason) => format!("FAILED (ignored): {}", reason),
            StepOutcome::Informational(note) => note.clone(),
        };
        println!("{:<24} {:<10} {}", step.step, step.target, outcome);
    }
    println!(
        "Phase {} after {} mutation(s) in {} ms",
        report.phase,
        report.mutations(),
        report.duration_ms
    );
    Ok(())
}

async fn handle_reconcile(ctx: &Ctx) -> Result<i32> {
    let config = ctx.load_node()?;
    warn_if_not_root();
    let reconciler = ctx.reconciler(ctx.net());

    match reconciler.reconcile(&config).await {
        Ok(report) => {
            print_report(ctx, &report)?;
            Ok(0)
        }
        Err(e) => {
            eprintln!("Reconcile failed: {}", e);
            Ok(1)
        }
    }
}

async fn handle_teardown(ctx: &Ctx) -> Result<i32> {
    let config = ctx.load_node()?;
    warn_if_not_root();
    let report = ctx.reconciler(ctx.net()).teardown(&config).await;
    print_report(ctx, &report)?;
    Ok(0)
}

async fn handle_health(ctx: &Ctx) -> Result<i32> {
    let config = ctx.load_node()?;
    let checker = HealthChecker::new(
        ctx.net(),
        Arc::new(HostInspector),
        ctx.settings.paths.render_dir.clone(),
        ctx.settings.paths.state_dir.clone(),
        std::time::Duration::from_millis(ctx.settings.health.dry_run_timeout_ms),
    );
    let report = checker.check(&config).await;

    if ctx.json {
        ctx.print_json(&report)?;
    } else {
        for check in &report.checks {
            let line = format!("[{:<4}] {:<24} {}", check.status, check.name, check.detail);
            if check.status == CheckStatus::Fail {
                eprintln!("{}", line);
            } else {
                println!("{}", line);
            }
        }
        println!("Overall: {}", report.status);
    }
    Ok(report.exit_code())
}

fn opt<T: std::fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".to_string())
}

async fn handle_neighbors(ctx: &Ctx) -> Result<i32> {
    let config = ctx.load_node()?;
    let settings = CollectorSettings::new(&config, &ctx.settings.telemetry);
    let collector = Collector::new(Box::new(SystemTelemetrySource::new()), settings);
    let snapshot = collector.collect().await;

    if ctx.json {
        ctx.print_json(&snapshot)?;
        return Ok(0);
    }

    println!("Local MAC: {}", opt(&snapshot.local.mac));
    if snapshot.nodes.is_empty() {
        println!("No neighbors");
        return Ok(0);
    }
    println!(
        "{:<17} {:<8} {:>6} {:>4} {:>8} {:>9} {:<17} {}",
        "MAC", "IFACE", "dBm", "%", "SEEN(s)", "TPUT", "NEXT HOP", "ACTIVE"
    );
    for node in snapshot.nodes.values() {
        println!(
            "{:<17} {:<8} {:>6} {:>4} {:>8.1} {:>9} {:<17} {}",
            node.mac,
            opt(&node.interface),
            opt(&node.signal_dbm),
            opt(&node.signal_pct),
            node.last_seen,
            opt(&node.throughput),
            opt(&node.next_hop),
            if node.active { "yes" } else { "no" }
        );
    }
    println!("{} active of {}", snapshot.active_count(), snapshot.nodes.len());
    Ok(0)
}

async fn handle_status(ctx: &Ctx) -> Result<i32> {
    let config = ctx.load_node()?;
    let valid = config.validate();
    let net = ctx.net();
    let reconciler = ctx.reconciler(net.clone());
    let state = reconciler.observe(&config).await?;
    let phase = MeshPhase::observe(&config, &state);
    let render_dir = &ctx.settings.paths.render_dir;
    let rendered_current = render::render(&config)
        .map(|set| set.is_current(render_dir))
        .unwrap_or(false);
    let peers = net
        .mesh_peer_count(&config.interfaces.mesh_iface)
        .await
        .ok();

    if ctx.json {
        ctx.print_json(&serde_json::json!({
            "node": config.node.name,
            "valid": valid.is_ok(),
            "phase": phase,
            "rendered_current": rendered_current,
            "stored_hash": render::stored_hash(render_dir),
            "regdomain": state.regdomain,
            "mesh_peers": peers,
            "interfaces": state.interfaces,
        }))?;
        return Ok(0);
    }

    let mut out = io::stdout().lock();
    writeln!(out, "Node:        {}", opt(&config.node.name))?;
    match &valid {
        Ok(()) => writeln!(out, "Config:      valid")?,
        Err(e) => writeln!(out, "Config:      INVALID ({})", e)?,
    }
    writeln!(out, "Mesh phase:  {}", phase)?;
    writeln!(
        out,
        "Rendered:    {}",
        if rendered_current { "current" } else { "stale" }
    )?;
    writeln!(out, "Regdomain:   {}", opt(&state.regdomain))?;
    writeln!(out, "Mesh peers:  {}", opt(&peers))?;
    for (_, name) in config.interface_bindings() {
        let line = match state.get(name) {
            Some(iface) => format!(
                "{} master={} addrs={}",
                if iface.up { "up" } else { "down" },
                opt(&iface.master),
                iface
                    .addresses
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            ),
            None => "absent".to_string(),
        };
        writeln!(out, "  {:<10} {}", name, line)?;
    }
    Ok(0)
}
