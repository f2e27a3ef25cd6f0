//! WAV/AU header parsing.
//!
//! [`detect_and_parse`] sniffs the big-endian magic in the first four bytes and decodes the
//! matching header into a [`StreamDescriptor`]. On success the returned reader is positioned
//! at the first byte of sample data. On failure the stream is dropped, so no partially
//! parsed descriptor or open handle ever escapes.

use std::io::{Read, Seek, SeekFrom};
use std::time::Duration;

use crate::error::ParseError;

const MAGIC_RIFF: u32 = u32::from_be_bytes(*b"RIFF");
const MAGIC_AU: u32 = u32::from_be_bytes(*b".snd");
const MAGIC_WAVE: u32 = u32::from_be_bytes(*b"WAVE");
const MAGIC_FMT: u32 = u32::from_be_bytes(*b"fmt ");
const MAGIC_DATA: u32 = u32::from_be_bytes(*b"data");

const WAVE_FORMAT_PCM: u16 = 1;
const WAVE_FMT_MIN_SIZE: u32 = 16;

const AU_ENCODING_LINEAR_8: u32 = 2;
const AU_ENCODING_LINEAR_16: u32 = 3;
/// Magic + five fixed fields.
const AU_FIXED_HEADER_SIZE: u32 = 24;

/// Upper bounds on the stream shape. Anything beyond is a corrupt header, not audio.
const MAX_CHANNELS: u32 = 32;
const MAX_SAMPLE_RATE: u32 = 768_000;

/// Declared data size meaning "unknown, read to end of file".
const UNKNOWN_DATA_SIZE: u32 = u32::MAX;

/// PCM sample layout understood by the output sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Unsigned 8-bit (WAV).
    U8,
    /// Signed 8-bit (AU).
    S8,
    /// Signed 16-bit little-endian (WAV).
    S16Le,
    /// Signed 16-bit big-endian (AU).
    S16Be,
}

impl SampleFormat {
    pub fn bits_per_sample(self) -> u16 {
        match self {
            SampleFormat::U8 | SampleFormat::S8 => 8,
            SampleFormat::S16Le | SampleFormat::S16Be => 16,
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        usize::from(self.bits_per_sample() / 8)
    }
}

/// Immutable description of a PCM stream, produced by the header parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub format: SampleFormat,
    pub channels: u16,
    pub sample_rate: u32,
    /// Declared size of the sample data in bytes.
    pub total_data_bytes: u32,
}

impl StreamDescriptor {
    /// Bytes per interleaved frame.
    pub fn block_align(&self) -> usize {
        usize::from(self.channels) * self.format.bytes_per_sample()
    }

    /// `channels * bits_per_sample / 8 * sample_rate`.
    pub fn bytes_per_second(&self) -> u64 {
        self.block_align() as u64 * u64::from(self.sample_rate)
    }

    /// Number of data bytes to play, or `None` to play until end of file.
    ///
    /// A declared size of `0` or `0xFFFFFFFF` is what streaming writers emit when the final
    /// length was unknown at header time.
    pub fn data_len(&self) -> Option<u64> {
        match self.total_data_bytes {
            0 | UNKNOWN_DATA_SIZE => None,
            n => Some(u64::from(n)),
        }
    }

    /// Playing time implied by the declared data size.
    pub fn duration(&self) -> Option<Duration> {
        let bytes = self.data_len()?;
        let rate = self.bytes_per_second();
        if rate == 0 {
            return None;
        }
        Some(Duration::from_secs_f64(bytes as f64 / rate as f64))
    }
}

/// Fields specific to a RIFF/WAVE header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaveHeader {
    pub descriptor: StreamDescriptor,
    /// RIFF size field plus the eight bytes of the RIFF chunk header.
    pub file_size: u64,
    pub fmt_chunk_size: u32,
    pub byte_rate: u32,
    pub block_align: u16,
}

/// Fields specific to a Sun/NeXT AU header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuHeader {
    pub descriptor: StreamDescriptor,
    /// Absolute offset of the first data byte.
    pub data_offset: u32,
    pub encoding: u32,
}

/// Result of format detection: one variant per supported container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioHeader {
    Wave(WaveHeader),
    Au(AuHeader),
}

impl AudioHeader {
    pub fn descriptor(&self) -> &StreamDescriptor {
        match self {
            AudioHeader::Wave(h) => &h.descriptor,
            AudioHeader::Au(h) => &h.descriptor,
        }
    }

    pub fn container(&self) -> &'static str {
        match self {
            AudioHeader::Wave(_) => "WAV",
            AudioHeader::Au(_) => "AU",
        }
    }
}

/// A successfully parsed stream, positioned at its first data byte.
#[derive(Debug)]
pub struct ParsedStream<R> {
    pub header: AudioHeader,
    pub reader: R,
}

/// Detect the container from the leading magic and parse its header.
///
/// Takes ownership of `stream` so that every failure path releases it.
pub fn detect_and_parse<R: Read + Seek>(mut stream: R) -> Result<ParsedStream<R>, ParseError> {
    let magic = read_u32_be(&mut stream)?;
    let header = match magic {
        MAGIC_RIFF => AudioHeader::Wave(parse_wave(&mut stream)?),
        MAGIC_AU => AudioHeader::Au(parse_au(&mut stream)?),
        other => return Err(ParseError::UnsupportedFormat { magic: other }),
    };
    Ok(ParsedStream {
        header,
        reader: stream,
    })
}

/// Parse the remainder of a RIFF/WAVE header (after the `RIFF` magic).
///
/// Apart from the chunk magics, every RIFF field is little-endian.
fn parse_wave<R: Read>(r: &mut R) -> Result<WaveHeader, ParseError> {
    let riff_size = read_u32_le(r)?;
    expect_chunk(r, MAGIC_WAVE, "WAVE")?;
    expect_chunk(r, MAGIC_FMT, "fmt ")?;

    let fmt_chunk_size = read_u32_le(r)?;
    if fmt_chunk_size < WAVE_FMT_MIN_SIZE {
        return Err(ParseError::HeaderInconsistent(format!(
            "fmt chunk of {fmt_chunk_size} bytes is shorter than {WAVE_FMT_MIN_SIZE}"
        )));
    }

    let encoding = read_u16_le(r)?;
    if encoding != WAVE_FORMAT_PCM {
        return Err(ParseError::UnsupportedEncoding(u32::from(encoding)));
    }
    let channels = read_u16_le(r)?;
    let sample_rate = read_u32_le(r)?;
    let byte_rate = read_u32_le(r)?;
    let block_align = read_u16_le(r)?;
    let bits_per_sample = read_u16_le(r)?;

    let format = match bits_per_sample {
        8 => SampleFormat::U8,
        16 => SampleFormat::S16Le,
        other => return Err(ParseError::UnsupportedBitDepth(other)),
    };

    let expected_align = u32::from(channels) * u32::from(bits_per_sample) / 8;
    if u32::from(block_align) != expected_align {
        return Err(ParseError::HeaderInconsistent(format!(
            "block align {block_align} != {channels} channels * {bits_per_sample} bits / 8"
        )));
    }
    if u64::from(block_align) * u64::from(sample_rate) != u64::from(byte_rate) {
        return Err(ParseError::HeaderInconsistent(format!(
            "byte rate {byte_rate} != block align {block_align} * sample rate {sample_rate}"
        )));
    }
    check_stream_shape(u32::from(channels), sample_rate)?;

    // WAVE_FORMAT_PCM with a cbSize extension, padded to an even length like any chunk.
    let fmt_rest = fmt_chunk_size - WAVE_FMT_MIN_SIZE;
    skip(r, u64::from(fmt_rest) + u64::from(fmt_chunk_size & 1))?;
    let data_size = seek_data_chunk(r)?;

    let header = WaveHeader {
        descriptor: StreamDescriptor {
            format,
            channels,
            sample_rate,
            total_data_bytes: data_size,
        },
        file_size: u64::from(riff_size) + 8,
        fmt_chunk_size,
        byte_rate,
        block_align,
    };
    tracing::debug!(
        file_size = header.file_size,
        fmt_chunk_size,
        encoding,
        channels,
        sample_rate,
        byte_rate,
        block_align,
        bits_per_sample,
        data_size,
        "parsed WAV header"
    );
    Ok(header)
}

/// Read chunk headers until `data`, skipping well-formed chunks such as `LIST` on the way.
fn seek_data_chunk<R: Read>(r: &mut R) -> Result<u32, ParseError> {
    loop {
        let id = read_u32_be(r)?;
        let size = read_u32_le(r)?;
        if id == MAGIC_DATA {
            return Ok(size);
        }
        if !id.to_be_bytes().iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            return Err(ParseError::MissingChunk {
                expected: "data",
                found: id,
            });
        }
        tracing::debug!(chunk = %String::from_utf8_lossy(&id.to_be_bytes()), size, "skipping WAV chunk");
        // Chunks are padded to an even length.
        skip(r, u64::from(size) + u64::from(size & 1))?;
    }
}

/// Parse the remainder of an AU header (after the `.snd` magic). All fields are big-endian.
fn parse_au<R: Read + Seek>(r: &mut R) -> Result<AuHeader, ParseError> {
    let data_offset = read_u32_be(r)?;
    let data_size = read_u32_be(r)?;
    let encoding = read_u32_be(r)?;
    let format = match encoding {
        AU_ENCODING_LINEAR_8 => SampleFormat::S8,
        AU_ENCODING_LINEAR_16 => SampleFormat::S16Be,
        other => return Err(ParseError::UnsupportedEncoding(other)),
    };
    let sample_rate = read_u32_be(r)?;
    let channels = read_u32_be(r)?;
    check_stream_shape(channels, sample_rate)?;
    let channels = u16::try_from(channels).map_err(|_| {
        ParseError::HeaderInconsistent(format!("{channels} channels is out of range"))
    })?;

    // The annotation block between the fixed fields and the data has variable length,
    // so position by absolute offset, after checking it lies inside the stream.
    let stream_len = r.seek(SeekFrom::End(0))?;
    if data_offset < AU_FIXED_HEADER_SIZE || u64::from(data_offset) > stream_len {
        return Err(ParseError::HeaderInconsistent(format!(
            "data offset {data_offset} outside {AU_FIXED_HEADER_SIZE}..={stream_len}"
        )));
    }
    r.seek(SeekFrom::Start(u64::from(data_offset)))?;

    let header = AuHeader {
        descriptor: StreamDescriptor {
            format,
            channels,
            sample_rate,
            total_data_bytes: data_size,
        },
        data_offset,
        encoding,
    };
    tracing::debug!(
        data_offset,
        data_size,
        encoding,
        sample_rate,
        channels,
        "parsed AU header"
    );
    Ok(header)
}

fn check_stream_shape(channels: u32, sample_rate: u32) -> Result<(), ParseError> {
    if channels == 0 {
        return Err(ParseError::HeaderInconsistent("zero channels".to_string()));
    }
    if sample_rate == 0 {
        return Err(ParseError::HeaderInconsistent("zero sample rate".to_string()));
    }
    if channels > MAX_CHANNELS {
        return Err(ParseError::HeaderInconsistent(format!(
            "{channels} channels exceeds {MAX_CHANNELS}"
        )));
    }
    if sample_rate > MAX_SAMPLE_RATE {
        return Err(ParseError::HeaderInconsistent(format!(
            "sample rate {sample_rate} exceeds {MAX_SAMPLE_RATE}"
        )));
    }
    Ok(())
}

fn expect_chunk<R: Read>(r: &mut R, expected: u32, name: &'static str) -> Result<(), ParseError> {
    let found = read_u32_be(r)?;
    if found != expected {
        return Err(ParseError::MissingChunk {
            expected: name,
            found,
        });
    }
    Ok(())
}

fn skip<R: Read>(r: &mut R, len: u64) -> Result<(), ParseError> {
    let skipped = std::io::copy(&mut r.take(len), &mut std::io::sink())?;
    if skipped != len {
        return Err(ParseError::Truncated);
    }
    Ok(())
}

fn read_u32_be<R: Read>(r: &mut R) -> Result<u32, ParseError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u32_le<R: Read>(r: &mut R) -> Result<u32, ParseError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u16_le<R: Read>(r: &mut R) -> Result<u16, ParseError> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}
