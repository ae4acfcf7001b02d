//! The read half of a logical log.
//!
//! A source enumerates the physical pieces of one logical log (the base
//! file plus any rotations) and serves positional reads either against a
//! single piece or against the logical offset space that spans them all.

use std::path::Path;
use std::sync::Arc;

use crate::env::measured::{IoStats, MeasuredReaderAt};
use crate::env::{FsReaderAt, ReaderAt};
use crate::error::Result;
use crate::Error;

/// Options for opening a [`LogSource`].
#[derive(Debug, Clone, Default)]
pub struct SourceOptions {
    /// Highest rotation index performed on the log, or `None` when the
    /// log was never rotated.
    pub num_rotas: Option<usize>,

    /// Record read bytes and operations.
    pub stats: Option<Arc<IoStats>>,
}

struct Piece {
    reader: Box<dyn ReaderAt>,
    size: u64,
}

pub struct LogSource {
    pieces: Vec<Piece>,
}

impl LogSource {
    /// Opens every existing physical piece of the log in write order:
    /// the base file first, then rotations in index order. Missing
    /// rotation indexes are skipped.
    pub fn open(opts: SourceOptions, prefix: &Path) -> Result<Arc<Self>> {
        let mut pieces = Vec::new();
        let mut names = vec![super::log_file_name(prefix, None)];
        if let Some(num_rotas) = opts.num_rotas {
            for index in 0..=num_rotas {
                names.push(super::log_file_name(prefix, Some(index)));
            }
        }

        for name in names {
            if !name.exists() {
                continue;
            }
            let reader = FsReaderAt::open(&name)?;
            let size = reader.size()?;
            let reader: Box<dyn ReaderAt> = match &opts.stats {
                Some(stats) => Box::new(MeasuredReaderAt::new(reader, stats.clone())),
                None => Box::new(reader),
            };
            pieces.push(Piece { reader, size });
        }

        if pieces.is_empty() {
            return Err(Error::Io(format!(
                "no log pieces found for {}",
                prefix.display()
            )));
        }
        Ok(Arc::new(Self { pieces }))
    }

    /// Reads up to `buf.len()` bytes at `offset` within piece `index`.
    /// Out-of-range indexes read as empty.
    pub fn read(&self, index: usize, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match self.pieces.get(index) {
            None => Ok(0),
            Some(piece) => piece.reader.read_at(offset, buf),
        }
    }

    /// Fills `buf` from the logical offset space spanning all pieces.
    /// Fails with `Io` if the log ends before the buffer is full.
    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut remaining: &mut [u8] = buf;
        let mut offset = offset;
        let mut piece_start = 0u64;

        for piece in &self.pieces {
            if remaining.is_empty() {
                break;
            }
            let piece_end = piece_start + piece.size;
            if offset < piece_end {
                let local = offset - piece_start;
                let want = ((piece_end - offset) as usize).min(remaining.len());
                let (head, rest) = std::mem::take(&mut remaining).split_at_mut(want);
                let mut filled = 0;
                while filled < want {
                    let n = piece.reader.read_at(local + filled as u64, &mut head[filled..])?;
                    if n == 0 {
                        return Err(Error::Io("read returned partial data".to_string()));
                    }
                    filled += n;
                }
                remaining = rest;
                offset += want as u64;
            }
            piece_start = piece_end;
        }

        if remaining.is_empty() {
            Ok(())
        } else {
            Err(Error::Io("read past the end of the log".to_string()))
        }
    }

    /// Size of the piece at `index`, or zero when out of range.
    pub fn size(&self, index: usize) -> u64 {
        self.pieces.get(index).map_or(0, |piece| piece.size)
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn last_index(&self) -> Option<usize> {
        self.pieces.len().checked_sub(1)
    }

    /// Accumulated size of all pieces, which equals the sink's final
    /// logical offset.
    pub fn total_size(&self) -> u64 {
        self.pieces.iter().map(|piece| piece.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LogOptions, LogSink};
    use tempfile::TempDir;

    #[test]
    fn test_enumerates_rotations_and_reads_across_them() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let prefix = dir.path().join("part-0");

        let sink = LogSink::open(
            LogOptions {
                rotation: true,
                ..Default::default()
            },
            &prefix,
        )
        .expect("Failed to open sink");
        sink.append(b"alpha").expect("Failed to append");
        sink.rotate(0, false).expect("Failed to rotate");
        sink.append(b"beta").expect("Failed to append");
        sink.rotate(7, false).expect("Failed to rotate");
        sink.append(b"gamma").expect("Failed to append");
        let total = sink.tell_logical();
        sink.close(true).expect("Failed to close");

        let source = LogSource::open(
            SourceOptions {
                num_rotas: Some(7),
                ..Default::default()
            },
            &prefix,
        )
        .expect("Failed to open source");

        assert_eq!(source.num_pieces(), 3);
        assert_eq!(source.total_size(), total);
        assert_eq!(source.size(0), 5);
        assert_eq!(source.size(1), 4);
        assert_eq!(source.size(2), 5);
        assert_eq!(source.size(9), 0);

        // A read that spans all three pieces.
        let mut buf = vec![0u8; total as usize];
        source
            .read_exact_at(0, &mut buf)
            .expect("Failed to read across pieces");
        assert_eq!(buf, b"alphabetagamma");

        // A read that starts inside the middle piece.
        let mut buf = vec![0u8; 6];
        source
            .read_exact_at(7, &mut buf)
            .expect("Failed to read across boundary");
        assert_eq!(&buf, b"tagamm");
    }

    #[test]
    fn test_read_past_end_fails() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let prefix = dir.path().join("part-0");
        let sink =
            LogSink::open(LogOptions::default(), &prefix).expect("Failed to open sink");
        sink.append(b"tiny").expect("Failed to append");
        sink.close(true).expect("Failed to close");

        let source = LogSource::open(SourceOptions::default(), &prefix)
            .expect("Failed to open source");
        let mut buf = [0u8; 8];
        assert!(source.read_exact_at(0, &mut buf).is_err());
    }

    #[test]
    fn test_missing_log_is_an_error() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        assert!(LogSource::open(SourceOptions::default(), &dir.path().join("absent")).is_err());
    }

    #[test]
    fn test_per_piece_reads() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let prefix = dir.path().join("part-0");
        let sink = LogSink::open(LogOptions::default(), &prefix).expect("Failed to open sink");
        sink.append(b"0123456789").expect("Failed to append");
        sink.close(true).expect("Failed to close");

        let source = LogSource::open(SourceOptions::default(), &prefix)
            .expect("Failed to open source");
        let mut buf = [0u8; 4];
        let n = source.read(0, 2, &mut buf).expect("Failed to read");
        assert_eq!(&buf[..n], b"2345");
        assert_eq!(source.read(5, 0, &mut buf).unwrap(), 0);
    }
}
