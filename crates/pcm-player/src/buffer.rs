//! One playback session's data path: parsed file in, device sink out.
//!
//! Each [`PlaybackBuffer::step`] reads one buffer of sample data and writes it to the
//! device in a single blocking write. The buffer holds `buffer_ms` of audio, rounded down
//! to whole frames.

use std::fs::File;
use std::io::{BufReader, Read, Take};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::PlaybackConfig;
use crate::error::{EngineError, PlaybackError};
use crate::header::{AudioHeader, StreamDescriptor, detect_and_parse};
use crate::sink::{DeviceBackend, DeviceSink, DeviceSlot, ResetHandle};

/// Outcome of one read/write step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// This many bytes were read and written.
    Played(usize),
    /// The data section is exhausted.
    Finished,
}

/// Exclusive owner of an open file, its parsed header, and the configured device.
pub struct PlaybackBuffer {
    path: PathBuf,
    header: AudioHeader,
    source: Take<BufReader<File>>,
    sink: DeviceSink,
    buf: Vec<u8>,
    expected: Option<u64>,
    played: Arc<AtomicU64>,
}

/// Bytes moved per step for `buffer_ms` of audio, rounded down to whole frames.
pub fn buffer_len(descriptor: &StreamDescriptor, buffer_ms: u32) -> usize {
    let frame = descriptor.block_align().max(1) as u64;
    let raw = descriptor.bytes_per_second() * u64::from(buffer_ms) / 1000;
    let frames = (raw / frame).max(1);
    usize::try_from(frames * frame).unwrap_or(usize::MAX)
}

impl PlaybackBuffer {
    /// Open `path`, parse its header and open the device configured to match.
    ///
    /// Any failure releases what was acquired so far: the file on a parse error, the file
    /// and device on a negotiation error.
    pub fn open(
        path: &Path,
        backend: &dyn DeviceBackend,
        slot: &DeviceSlot,
        config: &PlaybackConfig,
    ) -> Result<Self, EngineError> {
        let file = File::open(path).map_err(|source| EngineError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed = detect_and_parse(BufReader::new(file))?;
        let descriptor = *parsed.header.descriptor();
        let sink = DeviceSink::open(backend, slot, &descriptor)?;

        let expected = descriptor.data_len();
        let source = parsed.reader.take(expected.unwrap_or(u64::MAX));
        Ok(Self {
            path: path.to_path_buf(),
            header: parsed.header,
            source,
            sink,
            buf: vec![0; buffer_len(&descriptor, config.buffer_ms)],
            expected,
            played: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &AudioHeader {
        &self.header
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        self.header.descriptor()
    }

    pub fn buffer_len(&self) -> usize {
        self.buf.len()
    }

    /// Counter of bytes written to the device, shareable with status readers.
    pub fn played_counter(&self) -> Arc<AtomicU64> {
        self.played.clone()
    }

    pub fn reset_handle(&self) -> ResetHandle {
        self.sink.reset_handle()
    }

    /// Read up to one buffer and write it to the device.
    pub fn step(&mut self) -> Result<Step, PlaybackError> {
        let n = fill(&mut self.source, &mut self.buf).map_err(PlaybackError::Read)?;
        if n == 0 {
            return match self.expected {
                Some(expected) if self.source.limit() > 0 => Err(PlaybackError::Truncated {
                    expected,
                    read: expected - self.source.limit(),
                }),
                _ => Ok(Step::Finished),
            };
        }
        let written = self.sink.write(&self.buf[..n]).map_err(PlaybackError::Write)?;
        self.played.fetch_add(written as u64, Ordering::Relaxed);
        if written != n {
            return Err(PlaybackError::ShortWrite {
                expected: n,
                written,
            });
        }
        Ok(Step::Played(n))
    }
}

/// Read until `buf` is full or the source is exhausted.
fn fill(src: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
