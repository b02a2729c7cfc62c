//! fdtdcoord - distributed FDTD time-stepping coordinator
//!
//! CLI entry point for running, launching and inspecting simulations.

use std::fmt::Display;
use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use clap::{CommandFactory, FromArgMatches};
use colored::*;
use eyre::{Context, Result};
use tracing::{debug, info, warn};

use fdtdcoord::cli::{Cli, Command, EngineType, RunArgs, generate_after_help, get_log_path};
use fdtdcoord::config::Config;
use fdtdcoord::error::CoordError;
use fdtdcoord::lifecycle::{AbortSignal, Coordinator, RunSummary};
use fdtdcoord::processing::ProcessingArray;
use fdtdcoord::slab::SlabEngine;
use fdtdcoord::transport::{RankIdentity, SoloTransport, TcpTransport};

fn setup_logging(log_file: &Path, cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    if let Some(log_dir) = log_file.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let file = fs::File::create(log_file).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

/// Report a configuration error with usage and exit with status 2
fn exit_usage(message: impl Display) -> ! {
    eprintln!("{} {}", "error:".red().bold(), message);
    eprintln!();
    eprintln!("{}", Cli::command().render_usage());
    eprintln!();
    eprintln!("For more information, try '--help'.");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = Cli::command().after_help(generate_after_help());
    let cli = Cli::from_arg_matches(&cmd.get_matches())?;

    let (log_rank, config_path) = match &cli.command {
        Command::Run(args) => (Some(args.log_rank()), Some(&args.config)),
        Command::Launch { config, .. } => (None, Some(config)),
        Command::ShowConfig { config } => (None, config.as_ref()),
    };

    let config_log_level = Config::load_log_level(config_path);
    setup_logging(
        &get_log_path(log_rank),
        cli.log_level.as_deref(),
        config_log_level.as_deref(),
    )
    .context("Failed to setup logging")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Run(args) => cmd_run(args, cli.show_probe_discretization).await,
        Command::Launch { config, ranks } => {
            cmd_launch(&config, ranks, cli.log_level.as_deref(), cli.show_probe_discretization).await
        }
        Command::ShowConfig { config } => cmd_show_config(config.as_ref()),
    }
}

/// Load and validate a config, exiting with usage on bad input
fn load_config(path: &PathBuf, args: Option<&RunArgs>) -> Config {
    let mut config = match Config::load(Some(path)) {
        Ok(config) => config,
        Err(e) => exit_usage(format!("{:#}", e)),
    };
    if let Some(args) = args {
        args.apply(&mut config);
    }
    if let Err(e) = config.validate() {
        exit_usage(e);
    }
    config
}

/// Run one rank to completion
async fn cmd_run(args: RunArgs, show_probe_discretization: bool) -> Result<()> {
    let config = load_config(&args.config, Some(&args));
    let identity = match args.identity() {
        Ok(identity) => identity,
        Err(e) => exit_usage(e),
    };
    info!(%identity, engine = ?args.engine, "Starting rank");

    let abort = AbortSignal::new().with_sentinel(config.abort_path());
    spawn_signal_watch(abort.clone());

    if identity.is_leader() {
        println!(
            "{} fdtdcoord {} | engine: {} | ranks: {} | timesteps: {} | end criteria: -{} dB",
            "▶".green(),
            env!("CARGO_PKG_VERSION"),
            format!("{:?}", args.engine).to_lowercase().cyan(),
            identity.size,
            config.simulation.num_timesteps,
            config.simulation.end_criteria_db
        );
        println!("Started at {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
    }

    let engine_type = args.engine;
    let result = tokio::task::spawn_blocking(move || {
        run_rank(&config, identity, engine_type, abort, show_probe_discretization)
    })
    .await
    .context("Coordinator thread panicked")?;

    match result {
        Ok(summary) => {
            if summary.identity.is_leader() {
                println!(
                    "{} Stopped: {} (energy ~{:.2e}, -{:.2} dB)",
                    "✓".green(),
                    summary.stop_reason,
                    summary.energy.current(),
                    summary.energy.decay_db().abs()
                );
            }
            Ok(())
        }
        Err(e) if !e.is_fatal() => exit_usage(e),
        Err(e) => {
            tracing::error!(error = %e, %identity, "Run failed");
            eprintln!("{} rank {}: {}", "fatal:".red().bold(), identity, e);
            Err(e).context("Run aborted")
        }
    }
}

fn run_rank(
    config: &Config,
    identity: RankIdentity,
    engine_type: EngineType,
    abort: AbortSignal,
    show_probe_discretization: bool,
) -> Result<RunSummary, CoordError> {
    let mut engine = SlabEngine::new(&config.grid);
    let mut pipeline = ProcessingArray::new(config.simulation.max_burst, config.simulation.energy_sample_interval)
        .show_probe_discretization(show_probe_discretization && identity.is_leader());
    if let Some(dir) = &config.energy_trace_dir {
        pipeline = pipeline.with_trace(&dir.join(format!("energy-rank{}.jsonl", identity.rank)))?;
    }

    match engine_type {
        EngineType::Basic => Coordinator::new(SoloTransport, config)
            .with_abort(abort)
            .run(&mut engine, &mut pipeline),
        EngineType::Mpi => {
            let transport =
                TcpTransport::establish(identity, &config.transport.leader_addr, config.transport.tcp_options())?;
            Coordinator::new(transport, config)
                .with_abort(abort)
                .run(&mut engine, &mut pipeline)
        }
    }
}

/// Turn SIGINT/SIGTERM into an abort request; a second signal exits at once
fn spawn_signal_watch(abort: AbortSignal) {
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(name) => {
                warn!("{} received, requesting abort", name);
                abort.request();
            }
            Err(e) => {
                warn!(error = %e, "Failed to install signal handlers");
                return;
            }
        }
        if let Ok(name) = wait_for_shutdown_signal().await {
            warn!("{} received again, exiting", name);
            std::process::exit(130);
        }
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => Ok("SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl+C")
}

/// Spawn `ranks` local processes of `fc run --engine=MPI` and wait for all
async fn cmd_launch(
    config_path: &PathBuf,
    ranks: usize,
    log_level: Option<&str>,
    show_probe_discretization: bool,
) -> Result<()> {
    if ranks == 0 {
        exit_usage("--ranks must be at least 1");
    }
    load_config(config_path, None);

    let leader = free_loopback_addr().context("Failed to find a free port for the leader")?;
    let exe = std::env::current_exe().context("Failed to locate fc executable")?;
    info!(ranks, %leader, "Launching local ranks");

    let mut children = Vec::with_capacity(ranks);
    for rank in 0..ranks {
        let mut cmd = tokio::process::Command::new(&exe);
        cmd.arg("run")
            .arg(config_path)
            .arg("--engine=MPI")
            .arg("--rank")
            .arg(rank.to_string())
            .arg("--size")
            .arg(ranks.to_string())
            .arg("--leader")
            .arg(&leader);
        if let Some(level) = log_level {
            cmd.arg("--log-level").arg(level);
        }
        if show_probe_discretization {
            cmd.arg("--show-probe-discretization");
        }
        let child = cmd.spawn().context(format!("Failed to spawn rank {}", rank))?;
        debug!(rank, pid = ?child.id(), "cmd_launch: spawned rank");
        children.push((rank, child));
    }

    let mut failed = Vec::new();
    for (rank, mut child) in children {
        let status = child.wait().await.context(format!("Failed to wait for rank {}", rank))?;
        debug!(rank, ?status, "cmd_launch: rank exited");
        if !status.success() {
            failed.push(rank);
        }
    }

    if !failed.is_empty() {
        eyre::bail!("{} of {} ranks failed: {:?}", failed.len(), ranks, failed);
    }
    println!("{} All {} ranks completed", "✓".green(), ranks);
    Ok(())
}

fn free_loopback_addr() -> std::io::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.to_string())
}

/// Print the effective configuration as YAML
fn cmd_show_config(config_path: Option<&PathBuf>) -> Result<()> {
    let config = Config::load(config_path).context("Failed to load configuration")?;
    if let Err(e) = config.validate() {
        warn!(error = %e, "Configuration does not validate");
        eprintln!("{} {}", "warning:".yellow().bold(), e);
    }
    let yaml = serde_yaml::to_string(&config).context("Failed to serialize configuration")?;
    print!("{}", yaml);
    Ok(())
}
