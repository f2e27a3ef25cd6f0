use std::ffi::OsString;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use crate::config::OutputKind;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("PLAYERD_REVISION"),
    ", ",
    env!("PLAYERD_BUILT"),
    ")"
);

#[derive(Parser, Debug, Default)]
#[command(name = "playerd", version = VERSION)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// Working directory holding the FIFO, lock, pid and log files
    #[arg(long, global = true)]
    pub dir: Option<PathBuf>,

    /// TOML config file; command-line flags take precedence
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Use a specific output device by substring match
    #[arg(long, global = true)]
    pub device: Option<String>,

    /// Output backend
    #[arg(long, value_enum, global = true)]
    pub output: Option<OutputKind>,

    /// Audio moved per read/write step, in milliseconds (default 40)
    #[arg(long, global = true)]
    pub buffer_ms: Option<u32>,

    /// Device-side queue length in milliseconds (default 250)
    #[arg(long, global = true)]
    pub queue_ms: Option<u32>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start the daemon if needed, then relay commands typed at the prompt (default)
    Ctl,

    /// Run the daemon in this process
    Daemon,

    /// Send one command line to a running daemon
    Send {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        words: Vec<String>,
    },

    /// List output devices and exit
    ListDevices,
}

impl Args {
    pub fn command(&self) -> Command {
        self.cmd.clone().unwrap_or(Command::Ctl)
    }

    /// Arguments for a detached `daemon` child that sees the same settings as this process.
    pub fn daemon_args(&self, dir: &Path) -> Vec<OsString> {
        let mut out: Vec<OsString> = vec!["--dir".into(), dir.into()];
        if let Some(config) = &self.config {
            out.push("--config".into());
            out.push(std::path::absolute(config).unwrap_or_else(|_| config.clone()).into());
        }
        if let Some(device) = &self.device {
            out.push("--device".into());
            out.push(device.into());
        }
        if let Some(output) = self.output {
            out.push("--output".into());
            out.push(output.as_str().into());
        }
        if let Some(ms) = self.buffer_ms {
            out.push("--buffer-ms".into());
            out.push(ms.to_string().into());
        }
        if let Some(ms) = self.queue_ms {
            out.push("--queue-ms".into());
            out.push(ms.to_string().into());
        }
        out.push("daemon".into());
        out
    }
}
