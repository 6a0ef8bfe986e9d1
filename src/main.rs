// src/main.rs
//
// =============================================================================
// DROIDFLOW: COMMANDER & ENTRY POINT
// =============================================================================
//
// The wiring center of the engine.
//
// Modes:
// 1. DISCOVER: Scan windows, adb binaries and ports; print the fleet.
// 2. VALIDATE: Load workflow files and report structural problems.
// 3. RUN:      Execute one or more workflow files (serial or parallel).
//
// Key Features:
// - Graceful Ctrl-C handling (stop fan-out + pool shutdown).
// - Config file for execution mode and window bindings.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use droidflow::bridge::{BridgeEvent, ChannelObserver};
use droidflow::core::{EngineConfig, RunMode};
use droidflow::locator::AdbLocator;
use droidflow::managers::VendorManagers;
use droidflow::manager::TaskManager;
use droidflow::pool::AdbPool;
use droidflow::ports::PortDiscoverer;
use droidflow::registry::EmulatorRegistry;
use droidflow::tasks::TaskRegistry;
use droidflow::workflow::store;

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(
    name = "droidflow",
    version,
    about = "Android emulator fleet automation engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover emulators, adb binaries and live device ports.
    Discover,

    /// Load workflow files and report structural problems.
    Validate {
        /// Workflow JSON files.
        files: Vec<PathBuf>,
    },

    /// Execute workflow files.
    Run {
        /// Workflow JSON files, one task per file.
        files: Vec<PathBuf>,

        /// Serial or parallel execution across workflows.
        #[arg(long, value_enum)]
        mode: Option<Mode>,

        /// Engine config file (JSON).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Skip device discovery (workflows that don't touch adb).
        #[arg(long)]
        no_devices: bool,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Mode {
    Sync,
    Async,
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Discover => run_discover().await,
        Commands::Validate { files } => run_validate(files),
        Commands::Run {
            files,
            mode,
            config,
            no_devices,
        } => run_workflows(files, mode, config, no_devices).await,
    }
}

// ============================================================================
// 3. DISCOVER
// ============================================================================

async fn run_discover() -> Result<()> {
    let locator = AdbLocator::new();
    let adb_paths = locator.discover().await;
    if adb_paths.is_empty() {
        log::warn!("no adb binary found on this host");
    }

    let registry = Arc::new(EmulatorRegistry::with_process_scan());
    let windows = registry.discover_windows(&adb_paths);
    for w in &windows {
        println!(
            "window: {:<12} {} (vm {:?})",
            w.kind.to_string(),
            w.title,
            w.vm_index
        );
    }

    let managers = VendorManagers::detect(&adb_paths);
    let discovery = PortDiscoverer::new(managers.clone()).discover(&adb_paths).await;
    let running = registry.running_kinds(&adb_paths);
    let device_ids = discovery.device_list(&running);

    let pool = AdbPool::global();
    pool.attach(adb_paths, managers, Some(registry));
    let devices = pool.create_devices_from_list(&device_ids).await;

    println!("\n{} device(s):", devices.len());
    for d in pool.healthy_devices().await {
        println!(
            "  {:<20} {:?} / {:?}  ({})",
            d.device_id, d.status, d.health, d.kind
        );
    }

    pool.shutdown().await;
    Ok(())
}

// ============================================================================
// 4. VALIDATE
// ============================================================================

fn run_validate(files: Vec<PathBuf>) -> Result<()> {
    anyhow::ensure!(!files.is_empty(), "no workflow files given");

    let mut failures = 0usize;
    for file in &files {
        match store::load(file) {
            Ok(wf) => {
                let problems = wf.validate();
                let executable = wf.ensure_executable();
                if problems.is_empty() && executable.is_ok() {
                    let reachable = wf.sequence_numbers().len();
                    println!(
                        "OK      {} ({} cards, {} reachable)",
                        file.display(),
                        wf.card_count(),
                        reachable
                    );
                } else {
                    failures += 1;
                    println!("FAIL    {}", file.display());
                    if let Err(e) = executable {
                        println!("        {e}");
                    }
                    for p in problems {
                        println!("        {p}");
                    }
                }
            }
            Err(e) => {
                failures += 1;
                println!("ERROR   {}: {e:#}", file.display());
            }
        }
    }

    anyhow::ensure!(failures == 0, "{failures} workflow file(s) failed validation");
    Ok(())
}

// ============================================================================
// 5. RUN
// ============================================================================

async fn run_workflows(
    files: Vec<PathBuf>,
    mode: Option<Mode>,
    config: Option<PathBuf>,
    no_devices: bool,
) -> Result<()> {
    anyhow::ensure!(!files.is_empty(), "no workflow files given");

    let mut cfg = match &config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(mode) = mode {
        cfg.task_execution_mode = match mode {
            Mode::Sync => RunMode::Sync,
            Mode::Async => RunMode::Async,
        };
    }

    // A. FLEET BRING-UP
    let pool = AdbPool::global();
    if !no_devices {
        let locator = AdbLocator::new();
        let adb_paths = locator.discover().await;
        let registry = Arc::new(EmulatorRegistry::with_process_scan());
        let managers = VendorManagers::detect(&adb_paths);

        let discovery = PortDiscoverer::new(managers.clone()).discover(&adb_paths).await;
        let running = registry.running_kinds(&adb_paths);
        let device_ids = discovery.device_list(&running);

        pool.attach(adb_paths, managers, Some(registry));
        let devices = pool.create_devices_from_list(&device_ids).await;
        log::info!("fleet ready: {} device(s)", devices.len());
    }

    // B. LOAD TASKS
    let (observer, mut events) = ChannelObserver::new();
    let registry = TaskRegistry::with_builtins();
    let mut manager = TaskManager::new(registry, observer, cfg);

    for file in &files {
        let wf = store::load(file)?;
        let name = wf.name.clone();
        manager.add_task(name, file.clone(), wf);
    }

    // C. SIGNAL HANDLING
    let abort = manager.abort_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        log::warn!("interrupt received, stopping");
        abort.request_stop();
    });

    // D. EVENT PUMP (progress to the operator)
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                BridgeEvent::TaskProgress { task_id, message } => {
                    log::info!("[task {task_id}] {message}");
                }
                BridgeEvent::ExecutionFinished {
                    task_id,
                    success,
                    message,
                    reason,
                } => {
                    log::info!(
                        "[task {task_id}] finished: success={success} reason={} ({message})",
                        reason.as_str()
                    );
                }
                _ => {}
            }
        }
    });

    // E. EXECUTE
    let overall = manager.execute_all().await;
    pool.shutdown().await;

    anyhow::ensure!(overall, "one or more workflows failed");
    Ok(())
}
