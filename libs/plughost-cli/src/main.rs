// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! plughost CLI
//!
//! Supervises a single worker end to end: launch, hand it a shared-memory
//! region, watch the worker write into it, take the region back, shut down.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use plughost::config::{default_config_path, plughost_home};
use plughost::{HostEvent, HostId, PlughostConfig, Supervisor};
use tracing_appender::non_blocking::WorkerGuard;

/// The worker is done with the region once byte 0 reaches this value.
const TARGET_COUNT: u8 = 16;

#[derive(Parser)]
#[command(name = "plughost")]
#[command(author, version, about = "Out-of-process plugin host", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a worker and supervise it until it exits
    Run(RunArgs),

    /// Parse a config file and print the effective values
    CheckConfig {
        /// Path to a plughost.toml
        file: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Worker executable (overrides the config file)
    #[arg(long, value_name = "PATH")]
    launcher: Option<PathBuf>,

    /// Plugin file sent to the worker in the load request
    #[arg(long, value_name = "FILE")]
    plugin: Option<String>,

    /// Config file (defaults to $PLUGHOST_HOME/plughost.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Size of the shared-memory region handed to the worker
    #[arg(long, default_value_t = 65536)]
    shm_size: usize,

    /// Pump sockets on a dedicated read thread
    #[arg(long)]
    read_thread: bool,

    /// Log file (defaults to $PLUGHOST_HOME/logs/plughost.log)
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Give up on the region after this many seconds
    #[arg(long, default_value_t = 30.0)]
    max_secs: f64,

    /// Extra worker arguments, after the port
    #[arg(last = true)]
    worker_args: Vec<String>,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

fn setup_logging(log_file: Option<&Path>) -> Result<WorkerGuard> {
    use tracing_subscriber::prelude::*;

    let log_file = match log_file {
        Some(path) => path.to_path_buf(),
        None => plughost_home().join("logs").join("plughost.log"),
    };
    let logs_dir = log_file
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("Failed to create log directory {}", logs_dir.display()))?;
    let file_name = log_file
        .file_name()
        .ok_or_else(|| anyhow!("Log file path has no file name: {}", log_file.display()))?;

    let file_appender = tracing_appender::rolling::never(logs_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn load_config(args: &RunArgs) -> Result<PlughostConfig> {
    let mut config = match &args.config {
        Some(path) => PlughostConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PlughostConfig::load_or_default(&default_config_path()),
    };

    if let Some(launcher) = &args.launcher {
        config.host.launcher = launcher.clone();
    }
    if let Some(plugin) = &args.plugin {
        config.host.plugin_file = plugin.clone();
    }
    if !args.worker_args.is_empty() {
        config.host.args = args.worker_args.clone();
    }
    if args.read_thread {
        config.reactor.use_read_thread = true;
    }

    if config.host.launcher.as_os_str().is_empty() {
        return Err(anyhow!(
            "No worker executable: pass --launcher or set host.launcher in the config"
        ));
    }
    Ok(config)
}

/// Where the demo region is in its lifecycle.
enum RegionPhase {
    NotAdded,
    Watching { name: String, last: Option<u8> },
    Removing { name: String },
    Released,
}

fn run(args: RunArgs) -> Result<ExitCode> {
    let config = load_config(&args)?;
    let max_wait = Duration::try_from_secs_f64(args.max_secs.max(0.0))
        .context("--max-secs is out of range")?;

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
        })
        .context("Failed to install Ctrl+C handler")?;
    }

    let mut supervisor = Supervisor::with_std_launcher(&config.reactor)
        .context("Failed to start the reactor")?;
    let id = supervisor
        .launch(config.host.clone())
        .context("Failed to create the host")?;

    let mut phase = RegionPhase::NotAdded;
    let mut watch_started: Option<Instant> = None;
    let mut shutdown_sent = false;
    let mut failed = false;

    while !supervisor.is_empty() {
        for (_, event) in supervisor.step()? {
            match event {
                HostEvent::Message(message) => {
                    tracing::info!("Worker says {}:{}", message.class(), message.name());
                }
                HostEvent::StateChanged { .. } => {}
                HostEvent::LaunchFailed { reason } => {
                    tracing::error!("Launch failed: {}", reason);
                    failed = true;
                }
                HostEvent::ProcessDied { reason } => {
                    tracing::error!("Worker died: {}", reason);
                    failed = true;
                }
                HostEvent::Exited => tracing::info!("Worker exited"),
            }
        }

        if interrupted.swap(false, Ordering::SeqCst) && !shutdown_sent {
            tracing::info!("Interrupted, shutting down");
            supervisor.request_shutdown_all();
            shutdown_sent = true;
        }
        if shutdown_sent {
            continue;
        }

        let next = advance_region(&mut supervisor, id, phase, args.shm_size, &mut watch_started, max_wait)?;
        phase = next;
        if matches!(phase, RegionPhase::Released) {
            supervisor.request_shutdown_all();
            shutdown_sent = true;
        }
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn advance_region(
    supervisor: &mut Supervisor,
    id: HostId,
    phase: RegionPhase,
    size: usize,
    watch_started: &mut Option<Instant>,
    max_wait: Duration,
) -> Result<RegionPhase> {
    let Some(host) = supervisor.host_mut(id) else {
        return Ok(phase);
    };
    if !host.is_running() {
        return Ok(phase);
    }

    Ok(match phase {
        RegionPhase::NotAdded => {
            let name = host
                .add_shared_memory(size)
                .context("Failed to add shared memory")?;
            tracing::info!("Shared memory '{}' ({} bytes) offered to worker", name, size);
            *watch_started = Some(Instant::now());
            RegionPhase::Watching { name, last: None }
        }
        RegionPhase::Watching { name, last } => {
            let value = host
                .shared_memory(&name)
                .map(|region| region.read_byte(0))
                .transpose()?;
            if value != last {
                if let Some(value) = value {
                    tracing::info!("Region '{}' byte 0 = {}", name, value);
                }
            }

            let reached = value.is_some_and(|v| v >= TARGET_COUNT);
            let expired = watch_started.is_some_and(|t| t.elapsed() >= max_wait);
            if reached || expired {
                if expired && !reached {
                    tracing::warn!("Gave up waiting on region '{}' after {:?}", name, max_wait);
                }
                host.remove_shared_memory(&name)
                    .context("Failed to remove shared memory")?;
                RegionPhase::Removing { name }
            } else {
                RegionPhase::Watching { name, last: value }
            }
        }
        RegionPhase::Removing { name } => {
            if host.shared_memory_size(&name) == 0 {
                tracing::info!("Worker released region '{}'", name);
                RegionPhase::Released
            } else {
                RegionPhase::Removing { name }
            }
        }
        RegionPhase::Released => RegionPhase::Released,
    })
}

fn check_config(file: &Path) -> Result<ExitCode> {
    let config = PlughostConfig::load(file)
        .with_context(|| format!("Failed to load config {}", file.display()))?;
    let valid = config.host.validate();

    println!("# {}", file.display());
    print!("{}", config.to_toml()?);
    println!();
    println!("# label           = {}", config.host.effective_label());
    println!("# launch timeout  = {:?}", config.host.launch_timeout());
    println!("# lockup timeout  = {:?}", config.host.lockup_timeout());
    println!("# blocked timeout = {:?}", config.host.blocked_timeout());
    println!("# exit timeout    = {:?}", config.host.exit_timeout());
    println!("# poll ceiling    = {:?}", config.reactor.max_poll_timeout());

    match valid {
        Ok(()) => {
            println!("# OK");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("invalid config: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let _guard = setup_logging(args.log_file.as_deref())?;
            tracing::info!("plughost {}", plughost::VERSION);
            run(args)
        }
        Commands::CheckConfig { file } => check_config(&file),
    }
}
