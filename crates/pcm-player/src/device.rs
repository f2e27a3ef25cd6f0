//! CPAL output backend.
//!
//! Presents a CPAL output stream as a blocking byte sink:
//! - `write` converts PCM bytes to `f32` and pushes them into a bounded [`SampleQueue`],
//!   blocking while it is full
//! - a dedicated thread owns the `cpal::Stream`, whose callback drains the queue without
//!   blocking and fills underruns with silence
//! - a reset discards the queue, which unblocks a pending `write` with a short count
//!
//! Device negotiation checks the supported config ranges instead of resampling or
//! remapping channels: the stream plays at exactly the source rate and channel count.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use crate::error::{DeviceError, DeviceParameter};
use crate::header::SampleFormat;
use crate::queue::{SampleQueue, capacity_for};
use crate::sink::{DeviceBackend, DeviceReset, OutputDevice, ResetHandle};

/// Max frames pulled from the queue per callback refill.
const REFILL_MAX_FRAMES: usize = 1024;

/// Opens the default (or substring-matched) CPAL output device.
#[derive(Debug, Clone)]
pub struct CpalBackend {
    device: Option<String>,
    queue_ms: u32,
}

impl CpalBackend {
    /// `device` selects by case-insensitive substring; `queue_ms` sizes the device-side buffer.
    pub fn new(device: Option<String>, queue_ms: u32) -> Self {
        Self {
            device: device.filter(|d| !d.trim().is_empty()),
            queue_ms,
        }
    }
}

impl DeviceBackend for CpalBackend {
    fn open(&self) -> Result<Box<dyn OutputDevice>, DeviceError> {
        let host = cpal::default_host();
        let device = pick_device(&host, self.device.as_deref())?;
        let ranges: Vec<cpal::SupportedStreamConfigRange> = device
            .supported_output_configs()
            .map_err(|e| DeviceError::Open(e.to_string()))?
            .collect();
        if ranges.is_empty() {
            return Err(DeviceError::Open("no supported output configs".to_string()));
        }
        if let Ok(desc) = device.description() {
            tracing::debug!(device = %desc, ranges = ranges.len(), "output device opened");
        }
        Ok(Box::new(CpalDevice {
            device,
            ranges,
            queue_ms: self.queue_ms,
            channels: None,
            source_format: None,
            output_format: None,
            rate_hz: None,
            output: None,
            reset: Arc::new(CpalReset::default()),
            carry: Vec::new(),
            scratch: Vec::new(),
        }))
    }
}

/// Pick a CPAL output device.
///
/// - If `needle` is `Some`, chooses the first output device whose name contains the substring
///   (case-insensitive).
/// - Otherwise, returns the host default output device.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device, DeviceError> {
    if let Some(needle) = needle {
        let devices = host
            .output_devices()
            .map_err(|e| DeviceError::Open(e.to_string()))?;
        for d in devices {
            let matched = d
                .description()
                .map(|desc| matches_device_name(&desc.name(), needle))
                .unwrap_or(false);
            if matched {
                return Ok(d);
            }
        }
        return Err(DeviceError::Open(format!("no output device matched: {needle}")));
    }

    host.default_output_device()
        .ok_or_else(|| DeviceError::Open("no default output device".to_string()))
}

/// Print available output devices to stdout.
pub fn list_devices() -> Result<(), DeviceError> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| DeviceError::Backend(e.to_string()))?;
    for (i, d) in devices.enumerate() {
        match d.description() {
            Ok(desc) => println!("#{i}: {desc}"),
            Err(e) => println!("#{i}: <{e}>"),
        }
    }
    Ok(())
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

/// Preference among device sample formats able to carry `source` without loss.
fn output_format_rank(output: cpal::SampleFormat, source: SampleFormat) -> Option<u8> {
    let rank = match output {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        cpal::SampleFormat::I8 if source.bits_per_sample() == 8 => 4,
        cpal::SampleFormat::U8 if source.bits_per_sample() == 8 => 5,
        _ => return None,
    };
    Some(rank)
}

/// Clamp `target` into `[min, max]`; the value a device would fall back to.
fn clamp_rate(min: u32, max: u32, target: u32) -> u32 {
    target.clamp(min, max.max(min))
}

struct CpalDevice {
    device: cpal::Device,
    ranges: Vec<cpal::SupportedStreamConfigRange>,
    queue_ms: u32,
    channels: Option<u16>,
    source_format: Option<SampleFormat>,
    output_format: Option<cpal::SampleFormat>,
    rate_hz: Option<u32>,
    output: Option<OutputThread>,
    reset: Arc<CpalReset>,
    /// Trailing bytes of an incomplete frame from the previous write.
    carry: Vec<u8>,
    scratch: Vec<f32>,
}

impl CpalDevice {
    fn matching_ranges(&self) -> impl Iterator<Item = &cpal::SupportedStreamConfigRange> {
        self.ranges.iter().filter(move |r| {
            Some(r.channels()) == self.channels
                && self.output_format.is_none_or(|f| r.sample_format() == f)
        })
    }

    fn start_output(&mut self) -> io::Result<()> {
        let (Some(channels), Some(rate_hz), Some(output_format)) =
            (self.channels, self.rate_hz, self.output_format)
        else {
            return Err(io::Error::other("output device written before configuration"));
        };
        let queue = Arc::new(SampleQueue::new(
            usize::from(channels),
            capacity_for(rate_hz, usize::from(channels), self.queue_ms),
        ));
        *self.reset.queue.lock().unwrap_or_else(|e| e.into_inner()) = Some(queue.clone());
        if self.reset.requested.load(Ordering::Acquire) {
            queue.discard();
        }
        let config = cpal::StreamConfig {
            channels,
            sample_rate: rate_hz,
            buffer_size: cpal::BufferSize::Default,
        };
        self.output = Some(OutputThread::spawn(
            self.device.clone(),
            config,
            output_format,
            queue,
            self.reset.clone(),
        )?);
        tracing::info!(
            channels,
            rate_hz,
            sample_format = ?output_format,
            queue_ms = self.queue_ms,
            "output stream started"
        );
        Ok(())
    }
}

impl OutputDevice for CpalDevice {
    fn set_channels(&mut self, channels: u16) -> Result<u16, DeviceError> {
        if self.ranges.iter().any(|r| r.channels() == channels) {
            self.channels = Some(channels);
            return Ok(channels);
        }
        let nearest = self
            .ranges
            .iter()
            .map(|r| r.channels())
            .min_by_key(|c| c.abs_diff(channels))
            .unwrap_or(0);
        Ok(nearest)
    }

    fn set_sample_format(&mut self, format: SampleFormat) -> Result<SampleFormat, DeviceError> {
        let best = self
            .matching_ranges()
            .filter_map(|r| output_format_rank(r.sample_format(), format).map(|k| (k, r.sample_format())))
            .min_by_key(|(k, _)| *k);
        let Some((_, output)) = best else {
            return Err(DeviceError::Unsupported(DeviceParameter::SampleFormat));
        };
        self.source_format = Some(format);
        self.output_format = Some(output);
        Ok(format)
    }

    fn set_sample_rate(&mut self, rate_hz: u32) -> Result<u32, DeviceError> {
        let supported = self
            .matching_ranges()
            .any(|r| (r.min_sample_rate()..=r.max_sample_rate()).contains(&rate_hz));
        if supported {
            self.rate_hz = Some(rate_hz);
            return Ok(rate_hz);
        }
        self.matching_ranges()
            .next()
            .map(|r| clamp_rate(r.min_sample_rate(), r.max_sample_rate(), rate_hz))
            .ok_or(DeviceError::Unsupported(DeviceParameter::SampleRate))
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let Some(format) = self.source_format else {
            return Err(io::Error::other("output device written before configuration"));
        };
        if self.output.is_none() {
            self.start_output()?;
        }
        let Some(output) = self.output.as_ref() else {
            return Err(io::Error::other("output stream not running"));
        };
        if let Ok(msg) = output.errors.try_recv() {
            return Err(io::Error::other(msg));
        }

        let frame = usize::from(self.channels.unwrap_or(1)) * format.bytes_per_sample();
        let carried = self.carry.len();
        let mut pending = std::mem::take(&mut self.carry);
        pending.extend_from_slice(bytes);
        let whole = pending.len() / frame * frame;

        self.scratch.clear();
        pcm_to_f32(format, &pending[..whole], &mut self.scratch);
        let pushed = output.queue.push_blocking(&self.scratch);
        if pushed < self.scratch.len() {
            let consumed = (pushed * format.bytes_per_sample()).saturating_sub(carried);
            return Ok(consumed.min(bytes.len()));
        }
        self.carry = pending[whole..].to_vec();
        Ok(bytes.len())
    }

    fn reset_handle(&self) -> ResetHandle {
        ResetHandle::new(self.reset.clone())
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        let Some(output) = self.output.take() else {
            return;
        };
        // Let the tail play out unless the session was reset.
        output.queue.close();
        let drained = output.queue.wait_drained_or_cancel(&self.reset.requested);
        tracing::debug!(drained, "output stream closing");
        output.shutdown();
    }
}

#[derive(Default)]
struct CpalReset {
    requested: AtomicBool,
    queue: Mutex<Option<Arc<SampleQueue>>>,
}

impl DeviceReset for CpalReset {
    fn reset(&self) {
        self.requested.store(true, Ordering::Release);
        if let Some(q) = self.queue.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            q.discard();
        }
    }
}

/// Thread owning the `cpal::Stream`, which may not be `Send` on every host.
struct OutputThread {
    queue: Arc<SampleQueue>,
    errors: Receiver<String>,
    stop_tx: Sender<()>,
    join: JoinHandle<()>,
}

impl OutputThread {
    fn spawn(
        device: cpal::Device,
        config: cpal::StreamConfig,
        sample_format: cpal::SampleFormat,
        queue: Arc<SampleQueue>,
        reset: Arc<CpalReset>,
    ) -> io::Result<Self> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), String>>(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let (err_tx, errors) = crossbeam_channel::bounded::<String>(4);
        let queue_cb = queue.clone();

        let join = std::thread::Builder::new()
            .name("cpal-output".to_string())
            .spawn(move || {
                let stream =
                    match build_output_stream(&device, &config, sample_format, queue_cb, reset, err_tx) {
                        Ok(s) => s,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                // Disconnects when the owning device drops its sender.
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                queue,
                errors,
                stop_tx,
                join,
            }),
            Ok(Err(msg)) => {
                let _ = join.join();
                Err(io::Error::other(msg))
            }
            Err(_) => {
                let _ = join.join();
                Err(io::Error::other("output thread exited during startup"))
            }
        }
    }

    fn shutdown(self) {
        drop(self.stop_tx);
        if self.join.join().is_err() {
            tracing::warn!("output thread panicked");
        }
    }
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    queue: Arc<SampleQueue>,
    reset: Arc<CpalReset>,
    err_tx: Sender<String>,
) -> Result<cpal::Stream, String> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, queue, reset, err_tx),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, queue, reset, err_tx),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, queue, reset, err_tx),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, queue, reset, err_tx),
        cpal::SampleFormat::I8 => build_stream::<i8>(device, config, queue, reset, err_tx),
        cpal::SampleFormat::U8 => build_stream::<u8>(device, config, queue, reset, err_tx),
        other => Err(format!("unsupported sample format: {other:?}")),
    }
}

/// Callback drains `queue` in bursts and converts `f32` to the device sample type.
///
/// Never blocks beyond the queue mutex; underruns and resets output silence.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: Arc<SampleQueue>,
    reset: Arc<CpalReset>,
    err_tx: Sender<String>,
) -> Result<cpal::Stream, String>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let mut pending: Vec<f32> = Vec::new();
    let mut pos = 0usize;
    let reset_for_err = reset.clone();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);
                if reset.requested.load(Ordering::Relaxed) {
                    data.fill(silence);
                    return;
                }
                for (i, slot) in data.iter_mut().enumerate() {
                    if pos >= pending.len() {
                        pos = 0;
                        match queue.pop_frames(REFILL_MAX_FRAMES) {
                            Some(v) => pending = v,
                            None => {
                                pending.clear();
                                for rest in &mut data[i..] {
                                    *rest = silence;
                                }
                                return;
                            }
                        }
                    }
                    *slot = <T as cpal::Sample>::from_sample::<f32>(pending[pos]);
                    pos += 1;
                }
            },
            move |err| {
                tracing::warn!("output stream error: {err}");
                // Stop waiting on a stream that no longer drains.
                reset_for_err.reset();
                let _ = err_tx.try_send(err.to_string());
            },
            None,
        )
        .map_err(|e| e.to_string())
}

/// Convert whole samples of `format` to normalised `f32`, appending to `out`.
pub fn pcm_to_f32(format: SampleFormat, bytes: &[u8], out: &mut Vec<f32>) {
    match format {
        SampleFormat::U8 => out.extend(bytes.iter().map(|&b| (f32::from(b) - 128.0) / 128.0)),
        SampleFormat::S8 => out.extend(bytes.iter().map(|&b| f32::from(b as i8) / 128.0)),
        SampleFormat::S16Le => out.extend(
            bytes
                .chunks_exact(2)
                .map(|c| f32::from(i16::from_le_bytes([c[0], c[1]])) / 32768.0),
        ),
        SampleFormat::S16Be => out.extend(
            bytes
                .chunks_exact(2)
                .map(|c| f32::from(i16::from_be_bytes([c[0], c[1]])) / 32768.0),
        ),
    }
}
