//! PCM file playback: WAV/AU header parsing, exclusive device output, and a
//! pause/resume/stop playback engine.

pub mod buffer;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod header;
pub mod queue;
pub mod sink;
pub mod status;

pub use config::PlaybackConfig;
pub use engine::{EngineState, PlaybackEngine};
pub use error::{DeviceError, EngineError, ParseError, PlaybackError};
pub use sink::{DeviceBackend, NullBackend};
