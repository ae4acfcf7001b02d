//! Narrow storage abstraction consumed by the engine: an append-only
//! writer capability and a positional reader capability, each with a
//! filesystem-backed implementation and optional decorators (write
//! buffering, I/O stats). Decorator chains are never more than two deep.

pub mod buffered;
pub mod measured;
pub mod pool;

use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::error::Result;
use crate::Error;

/// Append-only writer over one physical object.
pub trait Appender: Send {
    /// Appends bytes at the current end. May buffer; the data is not
    /// durable until `sync`.
    fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Pushes buffered bytes down to the underlying object.
    fn flush(&mut self) -> Result<()>;

    /// Flushes, then forces the data to storage.
    fn sync(&mut self) -> Result<()>;

    /// Flushes and releases the underlying object. Appends after close
    /// fail with `Disconnected`.
    fn close(&mut self) -> Result<()>;
}

impl Appender for Box<dyn Appender> {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        (**self).append(data)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn sync(&mut self) -> Result<()> {
        (**self).sync()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Positional reader over one physical object.
pub trait ReaderAt: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`. Returns the number of
    /// bytes read; zero means end of object.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Size of the object in bytes.
    fn size(&self) -> Result<u64>;
}

impl ReaderAt for Box<dyn ReaderAt> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        (**self).read_at(offset, buf)
    }

    fn size(&self) -> Result<u64> {
        (**self).size()
    }
}

/// Options for opening a filesystem appender.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    /// Open with O_DIRECT, bypassing the page cache (linux only).
    pub direct_io: bool,
}

/// Filesystem-backed [`Appender`]. Created files are truncated.
pub struct FsAppender {
    file: Option<File>,
}

impl FsAppender {
    pub fn create(path: &Path, opts: OpenOptions) -> Result<Self> {
        let mut open_opts = File::options();
        open_opts.create(true).write(true).truncate(true);

        #[cfg(target_os = "linux")]
        if opts.direct_io {
            use std::os::unix::fs::OpenOptionsExt;
            open_opts.custom_flags(libc::O_DIRECT);
        }
        #[cfg(not(target_os = "linux"))]
        let _ = opts;

        let file = open_opts
            .open(path)
            .map_err(|e| Error::Io(format!("create {}: {e}", path.display())))?;
        Ok(Self { file: Some(file) })
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::Disconnected("file already closed".to_string()))
    }
}

impl Appender for FsAppender {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.file()?.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file()?.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        let file = self.file()?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Filesystem-backed [`ReaderAt`].
pub struct FsReaderAt {
    file: File,
}

impl FsReaderAt {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::Io(format!("open {}: {e}", path.display())))?;
        Ok(Self { file })
    }
}

impl ReaderAt for FsReaderAt {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        Ok(self.file.read_at(buf, offset)?)
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fs_appender_roundtrip() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("out.dat");

        let mut appender =
            FsAppender::create(&path, OpenOptions::default()).expect("Failed to create appender");
        appender.append(b"hello ").expect("Failed to append");
        appender.append(b"world").expect("Failed to append");
        appender.sync().expect("Failed to sync");
        appender.close().expect("Failed to close");

        assert!(matches!(
            appender.append(b"late"),
            Err(Error::Disconnected(_))
        ));

        let reader = FsReaderAt::open(&path).expect("Failed to open reader");
        assert_eq!(reader.size().unwrap(), 11);
        let mut buf = [0u8; 5];
        let n = reader.read_at(6, &mut buf).expect("Failed to read");
        assert_eq!(&buf[..n], b"world");
    }

    #[test]
    fn test_fs_reader_short_read_at_end() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("out.dat");
        let mut appender =
            FsAppender::create(&path, OpenOptions::default()).expect("Failed to create appender");
        appender.append(b"abc").expect("Failed to append");
        appender.close().expect("Failed to close");

        let reader = FsReaderAt::open(&path).expect("Failed to open reader");
        let mut buf = [0u8; 8];
        assert_eq!(reader.read_at(1, &mut buf).unwrap(), 2);
        assert_eq!(reader.read_at(3, &mut buf).unwrap(), 0);
    }
}
