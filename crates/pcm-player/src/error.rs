//! Error taxonomy for header parsing, device negotiation, and playback.
//!
//! Each failure class maps to a distinct recovery policy:
//! - [`ParseError`] aborts the requested play only; no session is ever created.
//! - [`DeviceError`] aborts the current session; the engine returns to idle.
//! - [`PlaybackError`] ends a running session from the worker thread.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Failure while sniffing or decoding a WAV/AU header.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The first four bytes are neither `RIFF` nor `.snd`.
    #[error("unsupported file format (magic 0x{magic:08x})")]
    UnsupportedFormat { magic: u32 },

    /// A RIFF sub-chunk magic did not match.
    #[error("malformed header: expected {expected:?} chunk, found 0x{found:08x}")]
    MissingChunk { expected: &'static str, found: u32 },

    /// Encoding tag is not uncompressed PCM (WAV) or signed 8/16-bit linear (AU).
    #[error("unsupported encoding {0}")]
    UnsupportedEncoding(u32),

    /// WAV bits-per-sample other than 8 or 16.
    #[error("unsupported bit depth {0}")]
    UnsupportedBitDepth(u16),

    /// Header fields contradict each other or the stream itself.
    #[error("inconsistent header: {0}")]
    HeaderInconsistent(String),

    /// The stream ended inside the header.
    #[error("truncated header")]
    Truncated,

    #[error("header read failed: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for ParseError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            ParseError::Truncated
        } else {
            ParseError::Io(err)
        }
    }
}

/// Stream parameter negotiated with the output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceParameter {
    Channels,
    SampleFormat,
    SampleRate,
}

impl fmt::Display for DeviceParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceParameter::Channels => "channel count",
            DeviceParameter::SampleFormat => "sample format",
            DeviceParameter::SampleRate => "sample rate",
        };
        f.write_str(name)
    }
}

/// Failure opening or configuring the output device.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Another sink already holds the device.
    #[error("output device busy")]
    Busy,

    #[error("failed to open output device: {0}")]
    Open(String),

    /// The device echoed back a different value than requested.
    #[error("output device does not support the requested {0}")]
    Unsupported(DeviceParameter),

    #[error("output device error: {0}")]
    Backend(String),
}

/// Failure during a read/write step of a running session.
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("reading audio data failed: {0}")]
    Read(#[source] io::Error),

    /// The source ended before the declared data size was reached.
    #[error("audio data truncated: expected {expected} bytes, got {read}")]
    Truncated { expected: u64, read: u64 },

    #[error("short write to output device: {written} of {expected} bytes")]
    ShortWrite { expected: usize, written: usize },

    #[error("writing to output device failed: {0}")]
    Write(#[source] io::Error),
}

impl PlaybackError {
    /// Whether this failure came from the device side of the step.
    ///
    /// A concurrent stop resets the device, which surfaces as one of these.
    pub fn is_write(&self) -> bool {
        matches!(self, PlaybackError::ShortWrite { .. } | PlaybackError::Write(_))
    }
}

/// Failure of a [`crate::engine::PlaybackEngine`] operation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Start was requested while a session is active.
    #[error("already playing")]
    AlreadyPlaying,

    #[error("cannot open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("failed to spawn playback thread: {0}")]
    Spawn(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unexpected_eof_maps_to_truncated() {
        let err: ParseError = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert!(matches!(err, ParseError::Truncated));
        let err: ParseError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(matches!(err, ParseError::Io(_)));
    }

    #[test]
    fn write_failures_are_classified() {
        assert!(PlaybackError::ShortWrite { expected: 4, written: 2 }.is_write());
        assert!(PlaybackError::Write(io::Error::other("reset")).is_write());
        assert!(!PlaybackError::Read(io::Error::other("eio")).is_write());
        assert!(!PlaybackError::Truncated { expected: 8, read: 4 }.is_write());
    }

    #[test]
    fn device_parameter_display_names() {
        let err = DeviceError::Unsupported(DeviceParameter::SampleRate);
        assert_eq!(
            err.to_string(),
            "output device does not support the requested sample rate"
        );
    }
}
