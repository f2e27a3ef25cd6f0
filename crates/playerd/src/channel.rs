//! Control channel: a named FIFO carrying one command per line.
//!
//! The daemon holds the read end. Clients open write ends one after another; when the last
//! writer closes, the reader sees end-of-file and reopens the FIFO for the next client.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::lifecycle::ShutdownToken;
use crate::line::LineReader;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("cannot create fifo {path:?}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0:?} exists and is not a fifo")]
    NotAFifo(PathBuf),

    #[error("cannot open fifo {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("reading fifo failed: {0}")]
    Read(#[source] io::Error),
}

#[derive(Debug)]
pub struct ControlChannel {
    path: PathBuf,
    max_line_len: usize,
}

impl ControlChannel {
    /// Create the FIFO with owner-only permissions. An existing FIFO is reused.
    pub fn create(path: &Path, max_line_len: usize) -> Result<Self, ChannelError> {
        let create_err = |source| ChannelError::Create {
            path: path.to_path_buf(),
            source,
        };
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| create_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        // SAFETY: `c_path` is a valid NUL-terminated string for the duration of the call.
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::AlreadyExists {
                return Err(create_err(err));
            }
            let meta = std::fs::metadata(path).map_err(create_err)?;
            if !meta.file_type().is_fifo() {
                return Err(ChannelError::NotAFifo(path.to_path_buf()));
            }
            tracing::debug!(path = %path.display(), "reusing existing fifo");
        }
        Ok(Self {
            path: path.to_path_buf(),
            max_line_len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines from successive writers until `shutdown` is requested.
    pub fn lines(&self, shutdown: &ShutdownToken) -> Lines<'_> {
        Lines {
            channel: self,
            shutdown: shutdown.clone(),
            reader: None,
            exhausted: false,
        }
    }
}

/// Restartable line sequence over the FIFO. Opening blocks until a writer appears.
pub struct Lines<'a> {
    channel: &'a ControlChannel,
    shutdown: ShutdownToken,
    reader: Option<LineReader<File>>,
    /// The current writer has gone; reopen before reading again.
    exhausted: bool,
}

impl Iterator for Lines<'_> {
    type Item = Result<String, ChannelError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.shutdown.is_requested() {
                return None;
            }
            if self.reader.is_none() || self.exhausted {
                // The previous read end stays open until this returns, so a writer that
                // connects in between does not lose what it wrote.
                let file = match File::open(&self.channel.path) {
                    Ok(file) => file,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(source) => {
                        return Some(Err(ChannelError::Open {
                            path: self.channel.path.clone(),
                            source,
                        }));
                    }
                };
                tracing::debug!(path = %self.channel.path.display(), "writer connected");
                self.reader = Some(
                    LineReader::new(file, self.channel.max_line_len)
                        .with_cancel(self.shutdown.clone()),
                );
                self.exhausted = false;
            }
            let Some(reader) = self.reader.as_mut() else {
                continue;
            };
            match reader.next_line() {
                Ok(Some(line)) => return Some(Ok(line)),
                Ok(None) => {
                    tracing::debug!("writer closed; reopening fifo");
                    self.exhausted = true;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Some(Err(ChannelError::Read(e))),
            }
        }
    }
}

/// Open the write end of a FIFO, retrying until a reader is present or `timeout` passes.
pub fn open_writer(path: &Path, timeout: Duration) -> io::Result<File> {
    let deadline = Instant::now() + timeout;
    loop {
        match try_open_writer(path) {
            Ok(Some(file)) => return Ok(file),
            Ok(None) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Ok(None) => return Err(io::Error::from_raw_os_error(libc::ENXIO)),
            Err(e) => return Err(e),
        }
    }
}

/// One attempt at the write end. `None` when no daemon is reading the FIFO yet.
///
/// Uses a non-blocking open so a missing daemon is reported instead of hanging, then
/// switches the descriptor back to blocking writes.
pub fn try_open_writer(path: &Path) -> io::Result<Option<File>> {
    match OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
    {
        Ok(file) => {
            set_blocking(&file)?;
            Ok(Some(file))
        }
        // ENXIO: no reader yet. NotFound: fifo not created yet.
        Err(e) if e.raw_os_error() == Some(libc::ENXIO) || e.kind() == io::ErrorKind::NotFound => {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn set_blocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: `fd` is owned by `file`, which outlives both calls.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::thread;

    #[test]
    fn create_is_idempotent_and_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.fifo");
        ControlChannel::create(&path, 1024).unwrap();
        ControlChannel::create(&path, 1024).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert!(meta.file_type().is_fifo());
        assert_eq!(meta.permissions().mode() & 0o077, 0);
    }

    #[test]
    fn regular_file_is_not_a_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.fifo");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(
            ControlChannel::create(&path, 1024),
            Err(ChannelError::NotAFifo(_))
        ));
    }

    #[test]
    fn reopens_after_writer_disconnects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.fifo");
        let channel = ControlChannel::create(&path, 1024).unwrap();

        let writer = {
            let path = path.clone();
            thread::spawn(move || {
                for batch in ["play a.wav\n", "stop\n", "exit\n"] {
                    let mut f = open_writer(&path, Duration::from_secs(10)).unwrap();
                    f.write_all(batch.as_bytes()).unwrap();
                }
            })
        };

        let token = ShutdownToken::new();
        let got: Vec<String> = channel
            .lines(&token)
            .map(|l| l.unwrap())
            .take_while(|l| l != "exit")
            .collect();
        writer.join().unwrap();
        assert_eq!(got, ["play a.wav", "stop"]);
    }

    #[test]
    fn shutdown_wakes_a_blocked_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.fifo");
        let channel = ControlChannel::create(&path, 1024).unwrap();
        let token = ShutdownToken::with_fifo(&path);

        let reader = {
            let token = token.clone();
            thread::spawn(move || channel.lines(&token).count())
        };
        while !reader.is_finished() {
            token.request();
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(reader.join().unwrap(), 0);
    }

    #[test]
    fn single_attempt_reports_missing_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.fifo");
        assert!(try_open_writer(&path).unwrap().is_none());
        ControlChannel::create(&path, 1024).unwrap();
        assert!(try_open_writer(&path).unwrap().is_none());

        let reader = {
            let path = path.clone();
            thread::spawn(move || std::fs::read_to_string(path).unwrap())
        };
        let mut f = open_writer(&path, Duration::from_secs(10)).unwrap();
        f.write_all(b"status\n").unwrap();
        drop(f);
        assert_eq!(reader.join().unwrap(), "status\n");
    }

    #[test]
    fn writer_times_out_without_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.fifo");
        ControlChannel::create(&path, 1024).unwrap();
        let err = open_writer(&path, Duration::from_millis(50)).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENXIO));
    }
}
