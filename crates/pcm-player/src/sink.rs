//! Exclusive output sink.
//!
//! A [`DeviceSink`] wraps one open [`OutputDevice`] configured to match a
//! [`StreamDescriptor`]. Opening claims the process-wide [`DeviceSlot`], so at most one sink
//! exists at a time; dropping the sink closes the device and releases the slot.
//!
//! Negotiation follows the sound-device model: channel count, sample format and sample
//! rate are each requested and the value the device actually applied is read back. Any
//! difference is a hard failure because the device is left in an indeterminate state.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::{DeviceError, DeviceParameter};
use crate::header::{SampleFormat, StreamDescriptor};

/// One open output device.
///
/// Each `set_*` call returns the value the device actually applied.
pub trait OutputDevice: Send {
    fn set_channels(&mut self, channels: u16) -> Result<u16, DeviceError>;
    fn set_sample_format(&mut self, format: SampleFormat) -> Result<SampleFormat, DeviceError>;
    fn set_sample_rate(&mut self, rate_hz: u32) -> Result<u32, DeviceError>;

    /// Blocking write of raw PCM bytes in the negotiated format.
    ///
    /// Returns the number of bytes accepted, which may be short after a reset.
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;

    /// Handle that can reset the device from another thread.
    fn reset_handle(&self) -> ResetHandle;
}

/// Factory for [`OutputDevice`]s.
pub trait DeviceBackend: Send + Sync {
    fn open(&self) -> Result<Box<dyn OutputDevice>, DeviceError>;
}

/// Something that can abort in-flight output, unblocking a pending write.
pub trait DeviceReset: Send + Sync {
    fn reset(&self);
}

/// Shareable handle to a device reset.
#[derive(Clone)]
pub struct ResetHandle(Arc<dyn DeviceReset>);

impl ResetHandle {
    pub fn new(reset: Arc<dyn DeviceReset>) -> Self {
        Self(reset)
    }

    /// Best-effort reset; never fails.
    pub fn reset(&self) {
        self.0.reset();
    }
}

impl std::fmt::Debug for ResetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResetHandle")
    }
}

/// Exclusive claim on the output device; one per process.
#[derive(Clone, Default)]
pub struct DeviceSlot {
    held: Arc<AtomicBool>,
}

impl DeviceSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    fn claim(&self) -> Result<SlotClaim, DeviceError> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| DeviceError::Busy)?;
        Ok(SlotClaim {
            held: self.held.clone(),
        })
    }
}

struct SlotClaim {
    held: Arc<AtomicBool>,
}

impl Drop for SlotClaim {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}

/// An open, configured output device.
pub struct DeviceSink {
    // Field order matters: the device closes before the slot is released.
    device: Box<dyn OutputDevice>,
    reset: ResetHandle,
    _claim: SlotClaim,
}

impl DeviceSink {
    /// Open the device and configure it for `descriptor`.
    ///
    /// On any failure the device (if opened) is closed and the slot released.
    pub fn open(
        backend: &dyn DeviceBackend,
        slot: &DeviceSlot,
        descriptor: &StreamDescriptor,
    ) -> Result<Self, DeviceError> {
        let claim = slot.claim()?;
        let mut device = backend.open()?;
        negotiate(device.as_mut(), descriptor)?;
        let reset = device.reset_handle();
        tracing::debug!(
            channels = descriptor.channels,
            format = ?descriptor.format,
            rate_hz = descriptor.sample_rate,
            "output device configured"
        );
        Ok(Self {
            device,
            reset,
            _claim: claim,
        })
    }

    pub fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.device.write(bytes)
    }

    pub fn reset_handle(&self) -> ResetHandle {
        self.reset.clone()
    }
}

/// Three independent set-then-read-back round trips.
fn negotiate(device: &mut dyn OutputDevice, d: &StreamDescriptor) -> Result<(), DeviceError> {
    let channels = device.set_channels(d.channels)?;
    if channels != d.channels {
        tracing::warn!(requested = d.channels, applied = channels, "channel count rejected");
        return Err(DeviceError::Unsupported(DeviceParameter::Channels));
    }
    let format = device.set_sample_format(d.format)?;
    if format != d.format {
        tracing::warn!(requested = ?d.format, applied = ?format, "sample format rejected");
        return Err(DeviceError::Unsupported(DeviceParameter::SampleFormat));
    }
    let rate = device.set_sample_rate(d.sample_rate)?;
    if rate != d.sample_rate {
        tracing::warn!(requested = d.sample_rate, applied = rate, "sample rate rejected");
        return Err(DeviceError::Unsupported(DeviceParameter::SampleRate));
    }
    Ok(())
}

/// Backend that accepts any configuration and discards the audio.
///
/// With `realtime` set, writes sleep for the playing time of the bytes written so a
/// session lasts as long as it would on hardware.
#[derive(Debug, Clone, Default)]
pub struct NullBackend {
    pub realtime: bool,
    written: Arc<AtomicU64>,
}

impl NullBackend {
    pub fn new(realtime: bool) -> Self {
        Self {
            realtime,
            written: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Total bytes accepted across every device opened from this backend.
    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

impl DeviceBackend for NullBackend {
    fn open(&self) -> Result<Box<dyn OutputDevice>, DeviceError> {
        Ok(Box::new(NullDevice {
            realtime: self.realtime,
            written: self.written.clone(),
            bytes_per_second: 0,
            channels: 0,
            format: None,
            reset: Arc::new(NullReset::default()),
        }))
    }
}

struct NullDevice {
    realtime: bool,
    written: Arc<AtomicU64>,
    bytes_per_second: u64,
    channels: u16,
    format: Option<SampleFormat>,
    reset: Arc<NullReset>,
}

#[derive(Default)]
struct NullReset {
    pending: AtomicBool,
}

impl DeviceReset for NullReset {
    fn reset(&self) {
        self.pending.store(true, Ordering::Release);
    }
}

impl OutputDevice for NullDevice {
    fn set_channels(&mut self, channels: u16) -> Result<u16, DeviceError> {
        self.channels = channels;
        Ok(channels)
    }

    fn set_sample_format(&mut self, format: SampleFormat) -> Result<SampleFormat, DeviceError> {
        self.format = Some(format);
        Ok(format)
    }

    fn set_sample_rate(&mut self, rate_hz: u32) -> Result<u32, DeviceError> {
        let frame = u64::from(self.channels)
            * self.format.map_or(1, |f| f.bytes_per_sample() as u64);
        self.bytes_per_second = frame * u64::from(rate_hz);
        Ok(rate_hz)
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        if self.realtime && self.bytes_per_second > 0 {
            let target = Duration::from_secs_f64(bytes.len() as f64 / self.bytes_per_second as f64);
            let started = Instant::now();
            // Sleep in slices so a reset takes effect quickly.
            while started.elapsed() < target {
                if self.reset.pending.swap(false, Ordering::AcqRel) {
                    return Ok(0);
                }
                std::thread::sleep((target - started.elapsed()).min(Duration::from_millis(5)));
            }
        }
        self.written.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(bytes.len())
    }

    fn reset_handle(&self) -> ResetHandle {
        ResetHandle::new(self.reset.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Device that records every write and echoes configuration per the given overrides.
    #[derive(Clone, Default)]
    pub(crate) struct FakeBackend {
        pub(crate) written: Arc<Mutex<Vec<u8>>>,
        pub(crate) opened: Arc<AtomicU64>,
        pub(crate) closed: Arc<AtomicU64>,
        pub(crate) echo_rate: Option<u32>,
        pub(crate) fail_open: bool,
        /// Per-write delay, to keep a session alive across commands.
        pub(crate) write_delay: Option<Duration>,
        /// Accept at most this many bytes per write.
        pub(crate) max_write: Option<usize>,
    }

    pub(crate) struct FakeDevice {
        backend: FakeBackend,
        reset: Arc<NullReset>,
    }

    impl DeviceBackend for FakeBackend {
        fn open(&self) -> Result<Box<dyn OutputDevice>, DeviceError> {
            if self.fail_open {
                return Err(DeviceError::Open("no such device".to_string()));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeDevice {
                backend: self.clone(),
                reset: Arc::new(NullReset::default()),
            }))
        }
    }

    impl Drop for FakeDevice {
        fn drop(&mut self) {
            self.backend.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl OutputDevice for FakeDevice {
        fn set_channels(&mut self, channels: u16) -> Result<u16, DeviceError> {
            Ok(channels)
        }

        fn set_sample_format(&mut self, format: SampleFormat) -> Result<SampleFormat, DeviceError> {
            Ok(format)
        }

        fn set_sample_rate(&mut self, rate_hz: u32) -> Result<u32, DeviceError> {
            Ok(self.backend.echo_rate.unwrap_or(rate_hz))
        }

        fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
            if let Some(delay) = self.backend.write_delay {
                let started = Instant::now();
                while started.elapsed() < delay {
                    if self.reset.pending.swap(false, Ordering::AcqRel) {
                        return Ok(0);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            let n = self.backend.max_write.map_or(bytes.len(), |m| m.min(bytes.len()));
            self.backend
                .written
                .lock()
                .unwrap()
                .extend_from_slice(&bytes[..n]);
            Ok(n)
        }

        fn reset_handle(&self) -> ResetHandle {
            ResetHandle::new(self.reset.clone())
        }
    }

    pub(crate) fn descriptor(rate: u32) -> StreamDescriptor {
        StreamDescriptor {
            format: SampleFormat::S16Le,
            channels: 2,
            sample_rate: rate,
            total_data_bytes: 0,
        }
    }

    #[test]
    fn second_open_is_busy_until_first_drops() {
        let backend = FakeBackend::default();
        let slot = DeviceSlot::new();
        let first = DeviceSink::open(&backend, &slot, &descriptor(44_100)).unwrap();
        assert!(slot.is_held());
        let err = DeviceSink::open(&backend, &slot, &descriptor(44_100)).err().unwrap();
        assert!(matches!(err, DeviceError::Busy));
        drop(first);
        assert!(!slot.is_held());
        assert!(DeviceSink::open(&backend, &slot, &descriptor(44_100)).is_ok());
    }

    #[test]
    fn rejected_rate_closes_device_and_releases_slot() {
        let backend = FakeBackend {
            echo_rate: Some(48_000),
            ..FakeBackend::default()
        };
        let slot = DeviceSlot::new();
        let err = DeviceSink::open(&backend, &slot, &descriptor(44_100)).err().unwrap();
        assert!(matches!(err, DeviceError::Unsupported(DeviceParameter::SampleRate)));
        assert_eq!(backend.opened.load(Ordering::SeqCst), 1);
        assert_eq!(backend.closed.load(Ordering::SeqCst), 1);
        assert!(!slot.is_held());
    }

    #[test]
    fn open_failure_releases_slot() {
        let backend = FakeBackend {
            fail_open: true,
            ..FakeBackend::default()
        };
        let slot = DeviceSlot::new();
        let err = DeviceSink::open(&backend, &slot, &descriptor(8_000)).err().unwrap();
        assert!(matches!(err, DeviceError::Open(_)));
        assert!(!slot.is_held());
    }

    #[test]
    fn null_backend_counts_bytes() {
        let backend = NullBackend::new(false);
        let slot = DeviceSlot::new();
        let mut sink = DeviceSink::open(&backend, &slot, &descriptor(8_000)).unwrap();
        assert_eq!(sink.write(&[0; 32]).unwrap(), 32);
        assert_eq!(backend.bytes_written(), 32);
    }

    #[test]
    fn null_backend_reset_cuts_realtime_write_short() {
        let backend = NullBackend::new(true);
        let slot = DeviceSlot::new();
        let mut sink = DeviceSink::open(&backend, &slot, &descriptor(8_000)).unwrap();
        let reset = sink.reset_handle();
        let resetter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            reset.reset();
        });
        // One second of audio; the reset arrives long before that.
        let started = Instant::now();
        let n = sink.write(&vec![0; 32_000]).unwrap();
        resetter.join().unwrap();
        assert_eq!(n, 0);
        assert!(started.elapsed() < Duration::from_millis(900));
    }
}
