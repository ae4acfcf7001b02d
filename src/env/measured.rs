//! I/O stats decorators. Counters are atomic so a snapshot can be taken
//! while a writer or reader is live on another thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{Appender, ReaderAt};
use crate::error::Result;

/// Accumulated bytes and operations for one side of the I/O.
#[derive(Debug, Default)]
pub struct IoStats {
    bytes: AtomicU64,
    ops: AtomicU64,
}

impl IoStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn accept(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
        self.ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn total_ops(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }
}

/// Counts bytes and operations that reach the wrapped appender.
pub struct MeasuredAppender<A: Appender> {
    inner: A,
    stats: Arc<IoStats>,
}

impl<A: Appender> MeasuredAppender<A> {
    pub fn new(inner: A, stats: Arc<IoStats>) -> Self {
        Self { inner, stats }
    }
}

impl<A: Appender> Appender for MeasuredAppender<A> {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.inner.append(data)?;
        self.stats.accept(data.len() as u64);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    fn sync(&mut self) -> Result<()> {
        self.inner.sync()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

/// Counts bytes and operations served by the wrapped reader.
pub struct MeasuredReaderAt<R: ReaderAt> {
    inner: R,
    stats: Arc<IoStats>,
}

impl<R: ReaderAt> MeasuredReaderAt<R> {
    pub fn new(inner: R, stats: Arc<IoStats>) -> Self {
        Self { inner, stats }
    }
}

impl<R: ReaderAt> ReaderAt for MeasuredReaderAt<R> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let n = self.inner.read_at(offset, buf)?;
        self.stats.accept(n as u64);
        Ok(n)
    }

    fn size(&self) -> Result<u64> {
        self.inner.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{FsAppender, FsReaderAt, OpenOptions};
    use tempfile::TempDir;

    #[test]
    fn test_measured_appender_counts() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("out.dat");
        let stats = IoStats::new();

        let inner = FsAppender::create(&path, OpenOptions::default())
            .expect("Failed to create appender");
        let mut measured = MeasuredAppender::new(inner, stats.clone());
        measured.append(b"12345").expect("Failed to append");
        measured.append(b"678").expect("Failed to append");
        measured.close().expect("Failed to close");

        assert_eq!(stats.total_bytes(), 8);
        assert_eq!(stats.total_ops(), 2);
    }

    #[test]
    fn test_measured_reader_counts() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("out.dat");
        let mut appender = FsAppender::create(&path, OpenOptions::default())
            .expect("Failed to create appender");
        appender.append(b"0123456789").expect("Failed to append");
        appender.close().expect("Failed to close");

        let stats = IoStats::new();
        let reader = MeasuredReaderAt::new(
            FsReaderAt::open(&path).expect("Failed to open reader"),
            stats.clone(),
        );
        let mut buf = [0u8; 4];
        reader.read_at(0, &mut buf).expect("Failed to read");
        reader.read_at(4, &mut buf).expect("Failed to read");

        assert_eq!(stats.total_bytes(), 8);
        assert_eq!(stats.total_ops(), 2);
    }
}
