//! Background daemon
//!
//! A single long-running process per workspace that keeps the index and the
//! JSONL in sync:
//!
//! * file-system changes on `*.jsonl` → debounced import-only cycle
//! * mutations arriving over RPC → export-only cycle
//! * a periodic timer → full sync cycle
//!
//! One scheduler thread runs all cycles, so cycles for the same directory
//! never overlap. Signal handlers set a drain flag; the in-flight cycle
//! finishes before the process exits. Failures are logged and feed the
//! engine's backoff state.

#[cfg(unix)]
pub mod rpc;

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Subcommand;
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;

use crate::storage::{Workspace, ENV_NO_DAEMON};
use crate::sync::lock::is_process_running;
use crate::sync::{CycleOutcome, SyncEngine, SyncError};

/// Maximum log file size before rotation (1MB)
const MAX_LOG_SIZE: u64 = 1024 * 1024;

/// Number of rotated log files to keep
const LOG_ROTATION_COUNT: usize = 7;

/// Events the scheduler reacts to
#[derive(Debug)]
pub enum DaemonEvent {
    /// A watched JSONL changed on disk
    FileChanged(PathBuf),
    /// An RPC mutation landed in the index
    Mutated,
    /// Periodic full-sync tick
    Tick,
    Shutdown,
}

#[derive(Subcommand)]
pub enum DaemonCommands {
    /// Start the background daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(long)]
        foreground: bool,

        /// Suppress startup message
        #[arg(long)]
        quiet: bool,
    },

    /// Stop the background daemon
    Stop,

    /// Show daemon status
    Status,

    /// View daemon logs
    Logs {
        /// Number of lines to show (default: 50)
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,

        /// Follow log output (like tail -f)
        #[arg(short = 'F', long)]
        follow: bool,
    },
}

pub fn run(cmd: DaemonCommands) -> Result<()> {
    match cmd {
        DaemonCommands::Start { foreground, quiet } => start_daemon(foreground, quiet),
        DaemonCommands::Stop => stop_daemon(),
        DaemonCommands::Status => show_status(),
        DaemonCommands::Logs { lines, follow } => show_logs(lines, follow),
    }
}

// --- PID file ---

fn read_pid(ws: &Workspace) -> Result<Option<u32>> {
    let pid_path = ws.pid_path();
    if !pid_path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&pid_path).context("Failed to read PID file")?;
    let pid: u32 = content.trim().parse().context("Invalid PID in file")?;
    Ok(Some(pid))
}

fn write_pid(ws: &Workspace, pid: u32) -> Result<()> {
    fs::write(ws.pid_path(), pid.to_string()).context("Failed to write PID file")
}

fn remove_pid(ws: &Workspace) -> Result<()> {
    let pid_path = ws.pid_path();
    if pid_path.exists() {
        fs::remove_file(&pid_path).context("Failed to remove PID file")?;
    }
    Ok(())
}

// --- Logging ---

/// Appends a timestamped line to the rolling daemon log
pub fn log_message(ws: &Workspace, message: &str) -> Result<()> {
    let log_path = ws.log_path();
    rotate_logs_if_needed(&log_path)?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open log file")?;

    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    writeln!(file, "[{}] {}", timestamp, message)?;
    Ok(())
}

fn rotate_logs_if_needed(log_path: &Path) -> Result<()> {
    if !log_path.exists() {
        return Ok(());
    }

    let metadata = fs::metadata(log_path)?;
    if metadata.len() < MAX_LOG_SIZE {
        return Ok(());
    }

    for i in (1..LOG_ROTATION_COUNT).rev() {
        let old_path = log_path.with_extension(format!("log.{}", i));
        let new_path = log_path.with_extension(format!("log.{}", i + 1));
        if old_path.exists() {
            if i + 1 >= LOG_ROTATION_COUNT {
                fs::remove_file(&old_path)?;
            } else {
                fs::rename(&old_path, &new_path)?;
            }
        }
    }

    fs::rename(log_path, log_path.with_extension("log.1"))?;
    Ok(())
}

// --- Lifecycle commands ---

fn start_daemon(foreground: bool, quiet: bool) -> Result<()> {
    let ws = Workspace::open_current()?;
    let config = crate::storage::Config::load(&ws.config_path())?;

    if std::env::var(ENV_NO_DAEMON).is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true")) {
        eprintln!("Daemon disabled by {}", ENV_NO_DAEMON);
        return Ok(());
    }
    if !config.daemon.enabled {
        eprintln!("Daemon is disabled in config. Set daemon.enabled: true in .braid/config.yaml");
        return Ok(());
    }

    if let Some(pid) = read_pid(&ws)? {
        if is_process_running(pid) {
            eprintln!("Daemon already running for this workspace (PID: {})", pid);
            return Ok(());
        }
        // Stale PID file, remove it
        remove_pid(&ws)?;
    }

    if foreground {
        let pid = std::process::id();
        write_pid(&ws, pid)?;
        log_message(&ws, &format!("Daemon starting in foreground (PID: {})", pid))?;

        if !quiet {
            println!("Daemon started in foreground (PID: {})", pid);
        }

        let result = run_daemon_loop(&ws, &config);

        remove_pid(&ws)?;
        log_message(&ws, "Daemon stopped")?;
        result
    } else {
        let exe = std::env::current_exe()?;
        let mut cmd = Command::new(&exe);
        cmd.args(["daemon", "start", "--foreground", "--quiet"])
            .current_dir(ws.root())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const DETACHED_PROCESS: u32 = 0x00000008;
            cmd.creation_flags(DETACHED_PROCESS);
        }

        let child = cmd.spawn().context("Failed to spawn daemon process")?;
        if !quiet {
            println!("Daemon started (PID: {})", child.id());
        }
        Ok(())
    }
}

fn stop_daemon() -> Result<()> {
    let ws = Workspace::open_current()?;

    let pid = match read_pid(&ws)? {
        Some(pid) => pid,
        None => {
            println!("Daemon is not running for this workspace");
            return Ok(());
        }
    };

    if !is_process_running(pid) {
        remove_pid(&ws)?;
        println!("Daemon is not running (cleaned up stale PID file)");
        return Ok(());
    }

    #[cfg(unix)]
    {
        Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .status()
            .context("Failed to send TERM signal")?;
    }

    #[cfg(windows)]
    {
        Command::new("taskkill")
            .args(["/PID", &pid.to_string()])
            .status()
            .context("Failed to terminate process")?;
    }

    // Give the drain a moment before escalating
    let start = Instant::now();
    while is_process_running(pid) && start.elapsed() < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_millis(100));
    }

    if is_process_running(pid) {
        #[cfg(unix)]
        {
            Command::new("kill").args(["-9", &pid.to_string()]).status()?;
        }

        #[cfg(windows)]
        {
            Command::new("taskkill")
                .args(["/F", "/PID", &pid.to_string()])
                .status()?;
        }
    }

    remove_pid(&ws)?;
    log_message(&ws, "Daemon stopped by user")?;
    println!("Daemon stopped (PID: {})", pid);
    Ok(())
}

fn show_status() -> Result<()> {
    let ws = Workspace::open_current()?;
    let config = crate::storage::Config::load(&ws.config_path())?;

    let running = match read_pid(&ws)? {
        Some(pid) if is_process_running(pid) => Some(pid),
        Some(_stale) => {
            remove_pid(&ws)?;
            None
        }
        None => None,
    };

    println!("Workspace: {}", ws.root().display());
    match running {
        Some(pid) => println!("Daemon status: RUNNING (PID: {})", pid),
        None => println!("Daemon status: STOPPED"),
    }

    println!();
    println!("Configuration:");
    println!("  Enabled: {}", config.daemon.enabled);
    println!("  Auto-commit: {}", config.sync.auto_commit);
    println!("  Auto-push: {}", config.sync.auto_push);
    println!("  Sync interval: {}s", config.sync.interval_seconds);
    println!("  Debounce: {}s", config.sync.debounce_seconds);
    Ok(())
}

fn show_logs(lines: usize, follow: bool) -> Result<()> {
    let ws = Workspace::open_current()?;
    let log_path = ws.log_path();

    if !log_path.exists() {
        println!("No daemon logs found for this workspace");
        return Ok(());
    }

    if follow {
        let file = File::open(&log_path)?;
        let mut reader = BufReader::new(file);

        // Seek to end minus some bytes for initial context
        let metadata = fs::metadata(&log_path)?;
        let start_pos = metadata.len().saturating_sub(4096);
        reader.seek(SeekFrom::Start(start_pos))?;

        if start_pos > 0 {
            let mut partial = String::new();
            reader.read_line(&mut partial)?;
        }

        for line in reader.by_ref().lines() {
            println!("{}", line?);
        }

        loop {
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) => std::thread::sleep(Duration::from_millis(100)),
                Ok(_) => print!("{}", line),
                Err(e) => {
                    eprintln!("Error reading log: {}", e);
                    break;
                }
            }
        }
        Ok(())
    } else {
        let content = fs::read_to_string(&log_path)?;
        let all_lines: Vec<&str> = content.lines().collect();
        let start = all_lines.len().saturating_sub(lines);
        for line in &all_lines[start..] {
            println!("{}", line);
        }
        Ok(())
    }
}

// --- Event loop ---

/// Runs watcher, RPC server, timer and scheduler until shutdown
fn run_daemon_loop(ws: &Workspace, config: &crate::storage::Config) -> Result<()> {
    let engine = SyncEngine::open(ws.clone())?;
    let engine = Arc::new(Mutex::new(engine));

    let (tx, rx) = mpsc::channel::<DaemonEvent>();
    let shutdown = Arc::new(AtomicBool::new(false));

    // Signal handlers: set the drain flag and wake the scheduler
    {
        let tx = tx.clone();
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
            let _ = tx.send(DaemonEvent::Shutdown);
        })
        .context("Failed to install signal handler")?;
    }

    // Debounced file watcher on the .braid directory
    let debounce = Duration::from_secs(config.sync.debounce_seconds.max(1));
    let debouncer = {
        let tx = tx.clone();
        let mut debouncer = new_debouncer(debounce, move |events: notify_debouncer_mini::DebounceEventResult| {
            if let Ok(events) = events {
                for event in events {
                    if is_watched_jsonl(&event.path) {
                        let _ = tx.send(DaemonEvent::FileChanged(event.path.clone()));
                    }
                }
            }
        })?;
        debouncer
            .watcher()
            .watch(ws.braid_dir(), RecursiveMode::NonRecursive)?;
        debouncer
    };

    // RPC server
    #[cfg(unix)]
    let rpc_handle = {
        let engine = Arc::clone(&engine);
        let tx = tx.clone();
        let shutdown = Arc::clone(&shutdown);
        let socket_path = ws.socket_path();
        std::thread::spawn(move || {
            if let Err(e) = rpc::serve(&socket_path, engine, tx, shutdown) {
                eprintln!("rpc server error: {:#}", e);
            }
        })
    };

    // Periodic full-sync timer
    let timer_handle = {
        let tx = tx.clone();
        let shutdown = Arc::clone(&shutdown);
        let interval = Duration::from_secs(config.sync.interval_seconds.max(1));
        std::thread::spawn(move || {
            let mut last = Instant::now();
            while !shutdown.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(200));
                if last.elapsed() >= interval {
                    last = Instant::now();
                    if tx.send(DaemonEvent::Tick).is_err() {
                        break;
                    }
                }
            }
        })
    };

    log_message(
        ws,
        &format!(
            "Daemon ready (interval: {}s, debounce: {}s, auto_commit: {}, auto_push: {})",
            config.sync.interval_seconds,
            config.sync.debounce_seconds,
            config.sync.auto_commit,
            config.sync.auto_push
        ),
    )?;
    for path in ws.jsonl_paths()? {
        log_message(ws, &format!("Watching {}", path.display()))?;
    }

    // Scheduler: one thread runs every cycle, so cycles never overlap
    let mut fatal = false;
    while let Ok(event) = rx.recv() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let outcome = match event {
            DaemonEvent::FileChanged(path) => {
                log_message(ws, &format!("Change detected: {}", path.display()))?;
                run_cycle(ws, &engine, |e| e.import_only(&path, false))
            }
            DaemonEvent::Mutated => run_cycle(ws, &engine, |e| e.export_only()),
            DaemonEvent::Tick => run_cycle(ws, &engine, |e| e.full_sync()),
            DaemonEvent::Shutdown => break,
        };

        if let Err(ref e) = outcome {
            if e.is_fatal() {
                log_message(ws, &format!("FATAL: {}; daemon halting for operator action", e))?;
                fatal = true;
                break;
            }
        }
    }

    shutdown.store(true, Ordering::SeqCst);
    drop(debouncer);
    let _ = timer_handle.join();
    #[cfg(unix)]
    let _ = rpc_handle.join();

    if fatal {
        anyhow::bail!("daemon halted on a fatal sync error; see daemon.log");
    }
    Ok(())
}

/// Runs one cycle under the engine lock and logs its outcome
fn run_cycle<F>(
    ws: &Workspace,
    engine: &Arc<Mutex<SyncEngine>>,
    cycle: F,
) -> Result<CycleOutcome, SyncError>
where
    F: FnOnce(&mut SyncEngine) -> Result<CycleOutcome, SyncError>,
{
    let mut guard = match engine.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };

    let result = cycle(&mut guard);
    let line = match &result {
        Ok(CycleOutcome::Completed(report)) => format!(
            "Cycle complete: exported {}, committed {}, pushed {}, imported {:?}, pruned {}, conflicts {}",
            report.exported,
            report.committed,
            report.pushed,
            report.imported.as_ref().map(|i| i.applied()),
            report.pruned,
            report.conflicts.len()
        ),
        Ok(CycleOutcome::SkippedUnchanged) => "Cycle skipped: JSONL unchanged".to_string(),
        Ok(CycleOutcome::SkippedBackoff { until }) => {
            format!("Cycle skipped: backoff until {}", until.to_rfc3339())
        }
        Err(e) => format!("Cycle failed: {}", e),
    };
    let _ = log_message(ws, &line);
    result
}

/// Only plain `*.jsonl` files trigger imports; snapshots, temp files and
/// daemon state are ignored
fn is_watched_jsonl(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "jsonl")
}
