use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gatekeep_core::{GateConfig, ScanMode};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "gatekeepd",
    about = "Gatekeepd — licensing gate daemon",
    version
)]
struct Cli {
    /// Data directory holding gatekeep.db and gatekeep.key (default: $GATEKEEP_DATA_DIR or the platform data dir)
    #[arg(long, global = true, env = "GATEKEEP_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Directory of *.module.json manifests (default: <data dir>/modules)
    #[arg(long, global = true, env = "GATEKEEP_MODULES_DIR")]
    modules_dir: Option<PathBuf>,
    /// Log level: error, warn, info, debug, verbose (default: $GATEKEEP_LOG_LEVEL or warn)
    #[arg(long, global = true, env = "GATEKEEP_LOG_LEVEL")]
    log_level: Option<String>,
    /// Per-request timeout for the authorization service
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    request_timeout: Option<Duration>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gate: boot-time checks, periodic re-validation and the operator API
    Serve {
        /// Port to listen on (default: $GATEKEEP_PORT or 39990)
        #[arg(long, env = "GATEKEEP_PORT", default_value = "39990")]
        port: u16,
        /// Host to bind (default: $GATEKEEP_HOST or 127.0.0.1)
        #[arg(long, env = "GATEKEEP_HOST", default_value = "127.0.0.1")]
        host: String,
        /// How long a positive entitlement verdict is trusted, e.g. "5m"
        #[arg(long, value_parser = humantime::parse_duration)]
        validation_ttl: Option<Duration>,
        /// Interval between periodic re-validations, e.g. "5m"
        #[arg(long, value_parser = humantime::parse_duration)]
        validation_period: Option<Duration>,
    },
    /// Link this installation using a token issued by the authorization service
    Link {
        token: String,
    },
    /// Forget the link locally (the service is not contacted)
    Unlink,
    /// Print the current link state as JSON
    Status,
    /// Rebuild the module table, check every dependent and list the verdicts
    Modules,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let raw = cli.log_level.clone().unwrap_or_else(|| "warn".into());
    let effective_log_level = if raw.eq_ignore_ascii_case("verbose") {
        "debug".to_owned()
    } else {
        raw
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&effective_log_level))
        .init();

    let mut cfg = GateConfig {
        data_dir: cli.data_dir,
        modules_dir: cli.modules_dir,
        ..Default::default()
    };
    if let Some(timeout) = cli.request_timeout {
        cfg.request_timeout = timeout;
    }

    match cli.command {
        Commands::Serve {
            port,
            host,
            validation_ttl,
            validation_period,
        } => {
            cfg.host = host;
            cfg.port = port;
            cfg.validation_ttl = validation_ttl;
            if let Some(period) = validation_period {
                cfg.validation_period = period;
            }
            cmd_serve(cfg)
        }
        Commands::Link { token } => cmd_link(cfg, &token),
        Commands::Unlink => cmd_unlink(cfg),
        Commands::Status => cmd_status(cfg),
        Commands::Modules => cmd_modules(cfg),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")
}

// ── Command implementations ───────────────────────────────────────────────────

fn cmd_serve(cfg: GateConfig) -> Result<()> {
    let (gate, main_loop) = gatekeep_core::build(&cfg)?;

    // Startup-phase modules are checked with blocking calls before any
    // runtime exists, as the host would during its own load.
    gate.on_load();

    let rt = runtime()?;
    rt.block_on(async {
        gate.on_enable();

        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "could not listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        };

        let result = tokio::select! {
            res = gatekeep_core::run(&cfg, Arc::clone(&gate), shutdown) => res,
            () = main_loop.run() => {
                warn!("main context closed");
                Ok(())
            }
        };

        gate.on_disable();
        result
    })
}

fn cmd_link(cfg: GateConfig, token: &str) -> Result<()> {
    let (gate, mut main_loop) = gatekeep_core::build(&cfg)?;
    let outcome = runtime()?.block_on(gate.link(token))?;
    main_loop.run_pending();

    if !outcome.ok() {
        anyhow::bail!("linking failed: {}", outcome.message);
    }
    println!("linked: {}", outcome.message);
    if let Some(id) = gate.engine().installation_id() {
        println!("installation id: {id}");
    }
    Ok(())
}

fn cmd_unlink(cfg: GateConfig) -> Result<()> {
    let (gate, _main_loop) = gatekeep_core::build(&cfg)?;
    if !gate.is_server_linked() {
        println!("installation is not linked");
        return Ok(());
    }
    gate.unlink()?;
    println!("unlinked; modules requiring the gate will be denied until relinked");
    Ok(())
}

fn cmd_status(cfg: GateConfig) -> Result<()> {
    let (gate, _main_loop) = gatekeep_core::build(&cfg)?;
    let state = gate.engine().get_current_link_state();
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

fn cmd_modules(cfg: GateConfig) -> Result<()> {
    let (gate, mut main_loop) = gatekeep_core::build(&cfg)?;
    let rt = runtime()?;
    let summary = if gate.is_server_linked() {
        rt.block_on(gate.reload_modules())
    } else {
        gate.tracker().scan(ScanMode::Rebuild);
        eprintln!("installation is not linked; no module can be authorized");
        Default::default()
    };
    main_loop.run_pending();
    let modules = rt.block_on(gate.module_status());

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "summary": summary,
            "modules": modules,
        }))?
    );
    Ok(())
}
