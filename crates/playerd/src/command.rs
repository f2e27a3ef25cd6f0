//! Control-line parsing and dispatch onto the playback engine.
//!
//! The protocol is one-way: results and failures only reach the daemon log.

use std::path::PathBuf;

use pcm_player::{EngineState, PlaybackEngine};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Exit,
    /// Replace the current session with this file.
    Play(PathBuf),
    /// Bare `play` or `resume`.
    Resume,
    Pause,
    Stop,
    Status,
}

impl Command {
    /// Parse one control line. The first token is case-insensitive; `None` means ignore.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let word = word.to_ascii_lowercase();
        let cmd = match (word.as_str(), rest.is_empty()) {
            ("exit", _) => Command::Exit,
            ("play", false) => Command::Play(PathBuf::from(rest)),
            ("play", true) | ("resume", _) => Command::Resume,
            ("pause", _) => Command::Pause,
            ("stop", _) => Command::Stop,
            ("status", _) => Command::Status,
            _ => return None,
        };
        Some(cmd)
    }
}

/// Whether the daemon loop should keep reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct CommandDispatcher {
    engine: PlaybackEngine,
}

impl CommandDispatcher {
    pub fn new(engine: PlaybackEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &PlaybackEngine {
        &self.engine
    }

    pub fn dispatch(&mut self, line: &str) -> Flow {
        match Command::parse(line) {
            Some(cmd) => self.execute(cmd),
            None => {
                tracing::debug!(line, "ignoring unrecognised command");
                Flow::Continue
            }
        }
    }

    pub fn execute(&mut self, cmd: Command) -> Flow {
        tracing::debug!(command = ?cmd, "dispatch");
        match cmd {
            Command::Exit => {
                self.engine.stop();
                return Flow::Exit;
            }
            Command::Play(path) => {
                self.engine.stop();
                if let Err(err) = self.engine.start(&path) {
                    tracing::warn!(path = %path.display(), error = %err, "play failed");
                }
            }
            Command::Resume => self.engine.resume(),
            Command::Pause => self.engine.pause(),
            Command::Stop => self.engine.stop(),
            Command::Status => {
                let snapshot = self.engine.snapshot();
                let session = snapshot.session.as_ref();
                tracing::info!(
                    state = %snapshot.state,
                    path = ?session.map(|s| &s.path),
                    bytes_played = session.map(|s| s.bytes_played),
                    total_bytes = session.and_then(|s| s.total_bytes),
                    "status: {snapshot}"
                );
            }
        }
        Flow::Continue
    }

    /// Stop any session before the daemon exits.
    pub fn shutdown(&mut self) {
        if self.engine.state() != EngineState::Idle {
            tracing::info!("stopping playback for shutdown");
        }
        self.engine.stop();
    }
}
