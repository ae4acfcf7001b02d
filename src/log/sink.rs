//! The write half of a logical log.
//!
//! A sink hides physical-file rotation and optional write buffering
//! behind a single append-only byte stream. Two offsets are exposed:
//!
//! - the *logical* offset, which only ever increases and survives
//!   rotation; it is the address recorded in index entries, and
//! - the *physical* offset within the current file, which restarts at
//!   zero after each rotation.
//!
//! Sinks are shared between the data and index write paths, so the
//! handle is reference counted; the interior state is dropped (and the
//! file closed) when the last clone goes away. The first close outcome
//! is sticky and remains observable through [`LogSink::status`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::env::buffered::BufferedAppender;
use crate::env::measured::{IoStats, MeasuredAppender};
use crate::env::{Appender, FsAppender, OpenOptions};
use crate::error::Result;
use crate::Error;

/// Options for opening a [`LogSink`].
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Max write buffering in bytes. Zero disables buffering and every
    /// append becomes a physical write.
    pub max_buf: usize,

    /// Permit [`LogSink::rotate`]. Rotation is controlled by external
    /// caller code; the sink never rotates on its own.
    pub rotation: bool,

    /// Open physical files with O_DIRECT (linux only).
    pub direct_io: bool,

    /// Record appended bytes and operations.
    pub stats: Option<Arc<IoStats>>,
}

struct SinkState {
    /// `None` once the sink has been closed.
    file: Option<Box<dyn Appender>>,
    filename: PathBuf,
    /// Logical write offset, monotonically increasing.
    off: u64,
    /// Logical offset at which the current physical file began.
    prev_off: u64,
    finish_status: Result<()>,
}

pub struct LogSink {
    opts: LogOptions,
    prefix: PathBuf,
    state: Mutex<SinkState>,
}

impl LogSink {
    /// Opens (creating if missing) the first physical file of the log.
    pub fn open(opts: LogOptions, prefix: &Path) -> Result<Arc<Self>> {
        let filename = super::log_file_name(prefix, None);
        let file = open_appender(&opts, &filename)?;
        Ok(Arc::new(Self {
            opts,
            prefix: prefix.to_path_buf(),
            state: Mutex::new(SinkState {
                file: Some(file),
                filename,
                off: 0,
                prev_off: 0,
                finish_status: Ok(()),
            }),
        }))
    }

    /// Builds a sink over a caller-supplied appender. Used by tests to
    /// inject failing storage.
    #[cfg(test)]
    pub(crate) fn with_appender(opts: LogOptions, file: Box<dyn Appender>) -> Arc<Self> {
        Arc::new(Self {
            opts,
            prefix: PathBuf::new(),
            state: Mutex::new(SinkState {
                file: Some(file),
                filename: PathBuf::new(),
                off: 0,
                prev_off: 0,
                finish_status: Ok(()),
            }),
        })
    }

    /// Appends data to the log and advances the logical offset. The data
    /// may be buffered and is not durable until [`LogSink::sync`].
    pub fn append(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;
        match state.file.as_mut() {
            None => Err(disconnected(&state.filename)),
            Some(file) => {
                file.append(data)?;
                state.off += data.len() as u64;
                Ok(())
            }
        }
    }

    /// Forces buffered data down to the file and then to storage.
    pub fn sync(&self) -> Result<()> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;
        match state.file.as_mut() {
            None => Err(disconnected(&state.filename)),
            Some(file) => file.sync(),
        }
    }

    /// Closes the current physical file and redirects subsequent appends
    /// to `<prefix>.dat.<index>`. The logical offset is unaffected.
    pub fn rotate(&self, index: usize, sync: bool) -> Result<()> {
        if !self.opts.rotation {
            return crate::errinput!("log rotation not enabled");
        }
        let mut state = self.state.lock()?;
        let mut file = match state.file.take() {
            None => return Err(disconnected(&state.filename)),
            Some(file) => file,
        };
        if sync {
            file.sync()?;
        }
        file.close()?;

        let filename = super::log_file_name(&self.prefix, Some(index));
        tracing::info!(file = %filename.display(), "Rotating log");
        state.file = Some(open_appender(&self.opts, &filename)?);
        state.filename = filename;
        state.prev_off = state.off;
        Ok(())
    }

    /// Transitions the sink to a disconnected state. Idempotent; the
    /// outcome of the first close is sticky.
    pub fn close(&self, sync: bool) -> Result<()> {
        let mut state = self.state.lock()?;
        let mut file = match state.file.take() {
            None => return state.finish_status.clone(),
            Some(file) => file,
        };
        let mut status = Ok(());
        if sync {
            status = file.sync();
        }
        let closed = file.close();
        if status.is_ok() {
            status = closed;
        }
        state.finish_status = status.clone();
        status
    }

    /// The stable logical write offset used in index entries.
    pub fn tell_logical(&self) -> u64 {
        self.state.lock().unwrap().off
    }

    /// The write offset within the current physical file.
    pub fn tell_physical(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state.off - state.prev_off
    }

    /// Outcome of the close, once one has happened.
    pub fn status(&self) -> Result<()> {
        self.state.lock().unwrap().finish_status.clone()
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        let _ = self.close(false);
    }
}

fn disconnected(filename: &Path) -> Error {
    Error::Disconnected(format!("log already closed: {}", filename.display()))
}

fn open_appender(opts: &LogOptions, path: &Path) -> Result<Box<dyn Appender>> {
    let base = FsAppender::create(
        path,
        OpenOptions {
            direct_io: opts.direct_io,
        },
    )?;
    let buffered: Box<dyn Appender> = if opts.max_buf > 0 {
        Box::new(BufferedAppender::new(base, opts.max_buf))
    } else {
        Box::new(base)
    };
    Ok(match &opts.stats {
        Some(stats) => Box::new(MeasuredAppender::new(buffered, stats.clone())),
        None => buffered,
    })
}
