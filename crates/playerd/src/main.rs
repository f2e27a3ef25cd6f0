//! playerd: a background WAV/AU player controlled through a named pipe.
//!
//! ## Modes
//! - `ctl` (default): start the daemon if it is not running, then relay commands typed at
//!   the `Player>` prompt.
//! - `daemon`: hold the instance lock and serve the control FIFO in this process.
//! - `send <words…>`: write one command line and exit.
//! - `list-devices`: print output devices.

use std::io::{IsTerminal, Write};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use playerd::channel::{open_writer, try_open_writer};
use playerd::cli::{Args, Command};
use playerd::client::{self, ClientEnd};
use playerd::config::DaemonConfig;
use playerd::daemon;
use playerd::lifecycle::{self, LifecycleError, ShutdownToken};

/// How long a client waits for the daemon to open its end of the FIFO.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit status when another daemon holds the lock.
const EXIT_ALREADY_RUNNING: u8 = 2;

fn main() -> ExitCode {
    let args = Args::parse();
    let cmd = args.command();
    let default_filter = match cmd {
        Command::Daemon | Command::ListDevices => "info,playerd=info,pcm_player=info",
        Command::Ctl | Command::Send { .. } => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .init();

    match run(&args, cmd) {
        Ok(code) => code,
        Err(err) => {
            if let Some(LifecycleError::AlreadyRunning(lock)) = err.downcast_ref::<LifecycleError>() {
                tracing::warn!(lock = %lock.display(), "daemon already running");
                return ExitCode::from(EXIT_ALREADY_RUNNING);
            }
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args, cmd: Command) -> Result<ExitCode> {
    let cfg = DaemonConfig::from_args(args)?;
    match cmd {
        Command::Daemon => run_daemon(&cfg),
        Command::Ctl => run_ctl(args, &cfg),
        Command::Send { words } => {
            let mut fifo = open_writer(&cfg.fifo, CONNECT_TIMEOUT)
                .with_context(|| format!("connect to daemon via {:?}", cfg.fifo))?;
            writeln!(fifo, "{}", words.join(" ")).context("send command")?;
            Ok(ExitCode::SUCCESS)
        }
        Command::ListDevices => {
            pcm_player::device::list_devices()?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_daemon(cfg: &DaemonConfig) -> Result<ExitCode> {
    std::fs::create_dir_all(&cfg.dir).with_context(|| format!("create dir {:?}", cfg.dir))?;
    let shutdown = ShutdownToken::with_fifo(&cfg.fifo);
    let on_signal = shutdown.clone();
    ctrlc::set_handler(move || on_signal.request()).context("install signal handler")?;
    daemon::run(cfg, &shutdown)?;
    Ok(ExitCode::SUCCESS)
}

fn run_ctl(args: &Args, cfg: &DaemonConfig) -> Result<ExitCode> {
    let connected = try_open_writer(&cfg.fifo)
        .with_context(|| format!("connect to daemon via {:?}", cfg.fifo))?;
    let fifo = match connected {
        Some(fifo) => fifo,
        None => {
            // If a daemon is still starting, this one loses the lock race and exits.
            std::fs::create_dir_all(&cfg.dir)
                .with_context(|| format!("create dir {:?}", cfg.dir))?;
            let dir = std::path::absolute(&cfg.dir).context("resolve working dir")?;
            let exe = std::env::current_exe().context("locate executable")?;
            lifecycle::spawn_detached(&exe, &args.daemon_args(&dir), &dir, &cfg.log_file)?;
            open_writer(&cfg.fifo, CONNECT_TIMEOUT)
                .with_context(|| format!("connect to daemon via {:?}", cfg.fifo))?
        }
    };

    ctrlc::set_handler(|| std::process::exit(130)).context("install signal handler")?;
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    match client::relay(stdin.lock(), stdout.lock(), fifo, cfg.max_line_len) {
        Ok(ClientEnd::DaemonExit | ClientEnd::Detached | ClientEnd::InputClosed) => {
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            tracing::error!(error = %err, "lost connection to daemon");
            Ok(ExitCode::FAILURE)
        }
    }
}
