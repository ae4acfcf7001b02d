//! Append-only log storage. Data is written into a [`sink::LogSink`] and
//! read back through a [`source::LogSource`]. A logical log may span
//! several physical files when rotation is enabled; the sink's logical
//! write offset is stable across rotations and is the address space used
//! by index entries.

pub mod sink;
pub mod source;

pub use sink::{LogOptions, LogSink};
pub use source::{LogSource, SourceOptions};

use std::path::{Path, PathBuf};

/// Name of the physical log file for a rotation index. `None` is the
/// initial, never-rotated file.
pub(crate) fn log_file_name(prefix: &Path, rotation: Option<usize>) -> PathBuf {
    match rotation {
        None => PathBuf::from(format!("{}.dat", prefix.display())),
        Some(index) => PathBuf::from(format!("{}.dat.{index}", prefix.display())),
    }
}
