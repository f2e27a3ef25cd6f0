//! Point-in-time view of the playback engine, for logging and status requests.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::EngineState;

/// Engine state plus details of the current session, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSnapshot {
    pub state: EngineState,
    pub session: Option<SessionSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub path: PathBuf,
    /// Container name, `WAV` or `AU`.
    pub container: &'static str,
    pub bytes_played: u64,
    /// Declared data size; `None` when playing until end of file.
    pub total_bytes: Option<u64>,
    pub duration: Option<Duration>,
}

impl SessionSnapshot {
    /// Fraction of the declared data already written, when the size is known.
    pub fn progress(&self) -> Option<f64> {
        let total = self.total_bytes.filter(|t| *t > 0)?;
        Some((self.bytes_played as f64 / total as f64).min(1.0))
    }
}

impl fmt::Display for EngineSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state)?;
        if let Some(s) = &self.session {
            write!(f, " {} ({}, {} bytes", s.path.display(), s.container, s.bytes_played)?;
            if let Some(p) = s.progress() {
                write!(f, ", {:.0}%", p * 100.0)?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}
