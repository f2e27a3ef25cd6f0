//! Playback engine: a monitor owning the session state machine and its worker thread.
//!
//! ```text
//! Idle --start--> Playing --pause--> Paused --resume--> Playing
//! {Playing, Paused} --stop--> Stopping --join--> Idle
//! ```
//!
//! The state lives under one mutex; a condition variable parks a paused worker and wakes
//! waiters when a session ends. The worker owns the [`PlaybackBuffer`] exclusively, so the
//! lock is never held across a file read or a device write.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::buffer::{PlaybackBuffer, Step};
use crate::config::PlaybackConfig;
use crate::error::EngineError;
use crate::sink::{DeviceBackend, DeviceSlot, ResetHandle};
use crate::status::{EngineSnapshot, SessionSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Playing,
    Paused,
    Stopping,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::Playing => "playing",
            EngineState::Paused => "paused",
            EngineState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// How a session's worker thread ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// All data was written.
    Finished,
    /// A stop request ended the session.
    Stopped,
    /// A read or write failed.
    Failed,
}

struct Shared {
    state: Mutex<EngineState>,
    cv: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, state: EngineState) {
        *self.lock() = state;
        self.cv.notify_all();
    }
}

/// Handle to the running worker plus what status readers need about its session.
struct Worker {
    join: JoinHandle<SessionEnd>,
    reset: ResetHandle,
    path: PathBuf,
    container: &'static str,
    played: Arc<AtomicU64>,
    total_bytes: Option<u64>,
    duration: Option<Duration>,
}

/// Owns at most one playback session at a time.
pub struct PlaybackEngine {
    shared: Arc<Shared>,
    worker: Option<Worker>,
    backend: Arc<dyn DeviceBackend>,
    slot: DeviceSlot,
    config: PlaybackConfig,
}

impl PlaybackEngine {
    pub fn new(backend: Arc<dyn DeviceBackend>, config: PlaybackConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState::Idle),
                cv: Condvar::new(),
            }),
            worker: None,
            backend,
            slot: DeviceSlot::new(),
            config,
        }
    }

    pub fn state(&self) -> EngineState {
        *self.shared.lock()
    }

    /// Open `path`, configure the device and start a worker playing it.
    ///
    /// Fails with [`EngineError::AlreadyPlaying`] unless the engine is idle. On any other
    /// failure the engine stays idle with the file and device released.
    pub fn start(&mut self, path: &Path) -> Result<(), EngineError> {
        if *self.shared.lock() != EngineState::Idle {
            return Err(EngineError::AlreadyPlaying);
        }
        // A session that ended on its own leaves a finished thread behind.
        self.reap();

        let buffer = PlaybackBuffer::open(path, self.backend.as_ref(), &self.slot, &self.config)?;
        let descriptor = *buffer.descriptor();
        let container = buffer.header().container();
        let reset = buffer.reset_handle();
        let played = buffer.played_counter();

        *self.shared.lock() = EngineState::Playing;
        let shared = self.shared.clone();
        let join = match thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || run_session(shared, buffer))
        {
            Ok(join) => join,
            Err(err) => {
                self.shared.set(EngineState::Idle);
                return Err(EngineError::Spawn(err));
            }
        };

        let duration = descriptor.duration();
        tracing::info!(
            path = %path.display(),
            container,
            channels = descriptor.channels,
            rate_hz = descriptor.sample_rate,
            format = ?descriptor.format,
            duration_secs = duration.map(|d| d.as_secs_f64()),
            "playback started"
        );
        self.worker = Some(Worker {
            join,
            reset,
            path: path.to_path_buf(),
            container,
            played,
            total_bytes: descriptor.data_len(),
            duration,
        });
        Ok(())
    }

    /// End the current session, if any, and wait for its worker to exit.
    ///
    /// Always leaves the engine idle.
    pub fn stop(&mut self) {
        {
            let mut state = self.shared.lock();
            if *state == EngineState::Idle {
                drop(state);
                self.reap();
                return;
            }
            *state = EngineState::Stopping;
        }
        self.shared.cv.notify_all();

        if let Some(worker) = self.worker.take() {
            // Unstick a write blocked on the device before joining.
            worker.reset.reset();
            match worker.join.join() {
                Ok(end) => {
                    tracing::info!(path = %worker.path.display(), end = ?end, "playback stopped")
                }
                Err(_) => tracing::error!(path = %worker.path.display(), "playback thread panicked"),
            }
        }
        self.shared.set(EngineState::Idle);
    }

    /// Pause a playing session. No-op in any other state.
    pub fn pause(&self) {
        let mut state = self.shared.lock();
        if *state == EngineState::Playing {
            *state = EngineState::Paused;
            drop(state);
            self.shared.cv.notify_all();
            tracing::info!("playback paused");
        }
    }

    /// Resume a paused session. No-op in any other state.
    pub fn resume(&self) {
        let mut state = self.shared.lock();
        if *state == EngineState::Paused {
            *state = EngineState::Playing;
            drop(state);
            self.shared.cv.notify_all();
            tracing::info!("playback resumed");
        }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let state = self.state();
        let session = match state {
            EngineState::Idle => None,
            _ => self.worker.as_ref().map(|w| SessionSnapshot {
                path: w.path.clone(),
                container: w.container,
                bytes_played: w.played.load(Ordering::Relaxed),
                total_bytes: w.total_bytes,
                duration: w.duration,
            }),
        };
        EngineSnapshot { state, session }
    }

    /// Block until the engine is idle or `timeout` passes. Returns whether it is idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        while *state != EngineState::Idle {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .cv
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        true
    }

    /// Join a worker whose session already ended.
    fn reap(&mut self) {
        if let Some(worker) = self.worker.take() {
            match worker.join.join() {
                Ok(end) => tracing::debug!(path = %worker.path.display(), end = ?end, "session reaped"),
                Err(_) => tracing::error!(path = %worker.path.display(), "playback thread panicked"),
            }
        }
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker body: step the buffer while playing, park while paused.
fn run_session(shared: Arc<Shared>, mut buffer: PlaybackBuffer) -> SessionEnd {
    let end = loop {
        {
            let mut state = shared.lock();
            while *state == EngineState::Paused {
                state = shared.cv.wait(state).unwrap_or_else(|e| e.into_inner());
            }
            if *state != EngineState::Playing {
                break SessionEnd::Stopped;
            }
        }
        match buffer.step() {
            Ok(Step::Played(_)) => {}
            Ok(Step::Finished) => {
                tracing::info!(path = %buffer.path().display(), "playback finished");
                break SessionEnd::Finished;
            }
            Err(err) if err.is_write() && *shared.lock() == EngineState::Stopping => {
                tracing::debug!(error = %err, "write interrupted by stop");
                break SessionEnd::Stopped;
            }
            Err(err) => {
                tracing::warn!(path = %buffer.path().display(), error = %err, "playback failed");
                break SessionEnd::Failed;
            }
        }
    };

    // Release the file and device before anyone can observe Idle.
    drop(buffer);
    let mut state = shared.lock();
    if *state != EngineState::Stopping {
        *state = EngineState::Idle;
    }
    drop(state);
    shared.cv.notify_all();
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeviceError, DeviceParameter, ParseError};
    use crate::header::tests::pcm16_wav;
    use crate::sink::tests::FakeBackend;
    use std::io::Write;

    const WAIT: Duration = Duration::from_secs(10);

    fn wav_file(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&pcm16_wav(2, 8_000, data)).unwrap();
        path
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn engine(backend: &FakeBackend) -> PlaybackEngine {
        PlaybackEngine::new(Arc::new(backend.clone()), PlaybackConfig::default())
    }

    fn slow() -> FakeBackend {
        FakeBackend {
            write_delay: Some(Duration::from_millis(20)),
            ..FakeBackend::default()
        }
    }

    #[test]
    fn plays_to_end_and_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let data = pattern(6_000);
        let path = wav_file(&dir, "a.wav", &data);
        let backend = FakeBackend::default();
        let mut engine = engine(&backend);

        engine.start(&path).unwrap();
        assert!(engine.wait_idle(WAIT));
        assert_eq!(*backend.written.lock().unwrap(), data);
        assert_eq!(backend.closed.load(Ordering::SeqCst), 1);
        assert!(engine.snapshot().session.is_none());
    }

    #[test]
    fn start_while_active_is_already_playing() {
        let dir = tempfile::tempdir().unwrap();
        let path = wav_file(&dir, "a.wav", &pattern(64_000));
        let backend = slow();
        let mut engine = engine(&backend);

        engine.start(&path).unwrap();
        assert!(matches!(engine.start(&path), Err(EngineError::AlreadyPlaying)));
        engine.pause();
        assert_eq!(engine.state(), EngineState::Paused);
        assert!(matches!(engine.start(&path), Err(EngineError::AlreadyPlaying)));
        engine.stop();
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn stop_from_every_state_ends_idle() {
        let dir = tempfile::tempdir().unwrap();
        let path = wav_file(&dir, "a.wav", &pattern(64_000));
        let backend = slow();
        let mut engine = engine(&backend);

        engine.stop();
        assert_eq!(engine.state(), EngineState::Idle);

        engine.start(&path).unwrap();
        engine.stop();
        assert_eq!(engine.state(), EngineState::Idle);

        engine.start(&path).unwrap();
        engine.pause();
        engine.stop();
        assert_eq!(engine.state(), EngineState::Idle);
        engine.stop();
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(
            backend.opened.load(Ordering::SeqCst),
            backend.closed.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn pause_and_resume_lose_no_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let data = pattern(12_800);
        let path = wav_file(&dir, "a.wav", &data);
        let backend = FakeBackend {
            write_delay: Some(Duration::from_millis(10)),
            ..FakeBackend::default()
        };
        let mut engine = engine(&backend);

        engine.start(&path).unwrap();
        thread::sleep(Duration::from_millis(35));
        engine.pause();
        assert_eq!(engine.state(), EngineState::Paused);
        // Let an in-flight write land, then confirm nothing more is written while paused.
        thread::sleep(Duration::from_millis(40));
        let at_pause = backend.written.lock().unwrap().len();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(backend.written.lock().unwrap().len(), at_pause);
        assert!(at_pause < data.len());

        engine.resume();
        assert!(engine.wait_idle(WAIT));
        assert_eq!(*backend.written.lock().unwrap(), data);
    }

    #[test]
    fn start_immediately_after_stop_is_never_busy() {
        let dir = tempfile::tempdir().unwrap();
        let path = wav_file(&dir, "a.wav", &pattern(64_000));
        let backend = FakeBackend {
            write_delay: Some(Duration::from_millis(200)),
            ..FakeBackend::default()
        };
        let mut engine = engine(&backend);

        for _ in 0..5 {
            engine.start(&path).unwrap();
            engine.stop();
        }
        engine.start(&path).unwrap();
        assert_eq!(engine.state(), EngineState::Playing);
        engine.stop();
        assert_eq!(backend.opened.load(Ordering::SeqCst), 6);
        assert_eq!(backend.closed.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn parse_failure_leaves_engine_idle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.wav");
        let mut bytes = pcm16_wav(2, 8_000, &[0; 16]);
        bytes[8..12].copy_from_slice(b"WAVX");
        std::fs::write(&path, bytes).unwrap();
        let backend = FakeBackend::default();
        let mut engine = engine(&backend);

        let err = engine.start(&path).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Parse(ParseError::MissingChunk { expected: "WAVE", .. })
        ));
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(backend.opened.load(Ordering::SeqCst), 0);

        let good = wav_file(&dir, "good.wav", &pattern(400));
        engine.start(&good).unwrap();
        assert!(engine.wait_idle(WAIT));
    }

    #[test]
    fn unsupported_device_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = wav_file(&dir, "a.wav", &pattern(400));
        let backend = FakeBackend {
            echo_rate: Some(48_000),
            ..FakeBackend::default()
        };
        let mut engine = engine(&backend);

        let err = engine.start(&path).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Device(DeviceError::Unsupported(DeviceParameter::SampleRate))
        ));
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(backend.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn short_write_fails_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = wav_file(&dir, "a.wav", &pattern(4_000));
        let backend = FakeBackend {
            max_write: Some(10),
            ..FakeBackend::default()
        };
        let mut engine = engine(&backend);

        engine.start(&path).unwrap();
        assert!(engine.wait_idle(WAIT));
        assert_eq!(backend.written.lock().unwrap().len(), 10);
        // The failed session is reaped by the next start.
        engine.start(&path).unwrap();
        engine.stop();
    }

    #[test]
    fn snapshot_reports_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = wav_file(&dir, "a.wav", &pattern(64_000));
        let backend = slow();
        let mut engine = engine(&backend);

        engine.start(&path).unwrap();
        engine.pause();
        let snap = engine.snapshot();
        assert_eq!(snap.state, EngineState::Paused);
        let session = snap.session.unwrap();
        assert_eq!(session.path, path);
        assert_eq!(session.container, "WAV");
        assert_eq!(session.total_bytes, Some(64_000));
        assert_eq!(session.duration, Some(Duration::from_secs(2)));
        engine.stop();
    }

    #[test]
    fn pause_and_resume_are_no_ops_when_idle() {
        let backend = FakeBackend::default();
        let engine = engine(&backend);
        engine.pause();
        assert_eq!(engine.state(), EngineState::Idle);
        engine.resume();
        assert_eq!(engine.state(), EngineState::Idle);
    }
}
