//! Configuration loading and resolution.
//!
//! Settings come from an optional TOML file and the command line; flags win. Relative file
//! paths resolve against the working directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use pcm_player::PlaybackConfig;
use pcm_player::device::CpalBackend;
use pcm_player::sink::{DeviceBackend, NullBackend};

use crate::cli::Args;

pub const DEFAULT_FIFO: &str = "daemon.fifo";
pub const DEFAULT_LOCK_FILE: &str = "daemon.lock";
pub const DEFAULT_PID_FILE: &str = "daemon.pid";
pub const DEFAULT_LOG_FILE: &str = "daemon.log";
pub const DEFAULT_QUEUE_MS: u32 = 250;
/// Longest accepted control line, terminator included.
pub const DEFAULT_MAX_LINE_LEN: usize = 1024;

/// Output backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// System audio through CPAL.
    #[default]
    Cpal,
    /// Discard audio, paced to real time.
    Null,
}

impl OutputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputKind::Cpal => "cpal",
            OutputKind::Null => "null",
        }
    }
}

/// Daemon configuration as written in TOML. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Working directory.
    pub dir: Option<PathBuf>,
    /// Control FIFO path.
    pub fifo: Option<PathBuf>,
    pub lock_file: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    /// Where a detached daemon's stdout and stderr go.
    pub log_file: Option<PathBuf>,
    /// Output device substring.
    pub device: Option<String>,
    pub output: Option<OutputKind>,
    pub buffer_ms: Option<u32>,
    pub queue_ms: Option<u32>,
    pub max_line_len: Option<usize>,
}

impl FileConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::parse(&raw).with_context(|| format!("parse config {:?}", path))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str::<FileConfig>(raw)?)
    }
}

/// Fully resolved settings shared by the daemon and its clients.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub dir: PathBuf,
    pub fifo: PathBuf,
    pub lock_file: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub device: Option<String>,
    pub output: OutputKind,
    pub playback: PlaybackConfig,
    pub queue_ms: u32,
    pub max_line_len: usize,
}

impl DaemonConfig {
    /// Load the config file named by `--config`, if any, and merge the flags over it.
    pub fn from_args(args: &Args) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Ok(Self::resolve(args, file))
    }

    pub fn resolve(args: &Args, file: FileConfig) -> Self {
        let dir = args
            .dir
            .clone()
            .or(file.dir)
            .unwrap_or_else(|| PathBuf::from("."));
        let in_dir = |p: Option<PathBuf>, default: &str| dir.join(p.unwrap_or_else(|| default.into()));
        Self {
            fifo: in_dir(file.fifo, DEFAULT_FIFO),
            lock_file: in_dir(file.lock_file, DEFAULT_LOCK_FILE),
            pid_file: in_dir(file.pid_file, DEFAULT_PID_FILE),
            log_file: in_dir(file.log_file, DEFAULT_LOG_FILE),
            device: args.device.clone().or(file.device),
            output: args.output.or(file.output).unwrap_or_default(),
            playback: PlaybackConfig {
                buffer_ms: args
                    .buffer_ms
                    .or(file.buffer_ms)
                    .unwrap_or(PlaybackConfig::DEFAULT_BUFFER_MS)
                    .max(1),
            },
            queue_ms: args.queue_ms.or(file.queue_ms).unwrap_or(DEFAULT_QUEUE_MS),
            // Room for at least one content byte plus the terminator.
            max_line_len: file.max_line_len.unwrap_or(DEFAULT_MAX_LINE_LEN).max(2),
            dir,
        }
    }

    /// Construct the configured output backend.
    pub fn backend(&self) -> Arc<dyn DeviceBackend> {
        match self.output {
            OutputKind::Cpal => Arc::new(CpalBackend::new(self.device.clone(), self.queue_ms)),
            OutputKind::Null => Arc::new(NullBackend::new(true)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_live_in_working_dir() {
        let cfg = DaemonConfig::resolve(&Args::default(), FileConfig::default());
        assert_eq!(cfg.fifo, Path::new(".").join("daemon.fifo"));
        assert_eq!(cfg.lock_file, Path::new(".").join("daemon.lock"));
        assert_eq!(cfg.pid_file, Path::new(".").join("daemon.pid"));
        assert_eq!(cfg.log_file, Path::new(".").join("daemon.log"));
        assert_eq!(cfg.output, OutputKind::Cpal);
        assert_eq!(cfg.playback.buffer_ms, 40);
        assert_eq!(cfg.queue_ms, 250);
        assert_eq!(cfg.max_line_len, 1024);
    }

    #[test]
    fn toml_fields_parse() {
        let file = FileConfig::parse(
            r#"
            dir = "/var/run/player"
            fifo = "/tmp/ctl.fifo"
            output = "null"
            buffer_ms = 20
            max_line_len = 256
            "#,
        )
        .unwrap();
        let cfg = DaemonConfig::resolve(&Args::default(), file);
        assert_eq!(cfg.dir, PathBuf::from("/var/run/player"));
        assert_eq!(cfg.fifo, PathBuf::from("/tmp/ctl.fifo"));
        assert_eq!(cfg.pid_file, PathBuf::from("/var/run/player/daemon.pid"));
        assert_eq!(cfg.output, OutputKind::Null);
        assert_eq!(cfg.playback.buffer_ms, 20);
        assert_eq!(cfg.max_line_len, 256);
    }

    #[test]
    fn flags_override_file() {
        let file = FileConfig::parse("device = \"hdmi\"\nbuffer_ms = 20\n").unwrap();
        let args = Args {
            device: Some("usb".to_string()),
            buffer_ms: Some(80),
            dir: Some(PathBuf::from("/srv")),
            ..Args::default()
        };
        let cfg = DaemonConfig::resolve(&args, file);
        assert_eq!(cfg.device.as_deref(), Some("usb"));
        assert_eq!(cfg.playback.buffer_ms, 80);
        assert_eq!(cfg.fifo, PathBuf::from("/srv/daemon.fifo"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(FileConfig::parse("volume = 3").is_err());
    }
}
