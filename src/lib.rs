pub mod block;
pub mod config;
pub mod encoding;
pub mod env;
pub mod error;
pub mod filter;
pub mod log;
pub mod reader;
pub mod writer;

pub use config::{Compression, DirOptions, FilterKind};
pub use error::{Error, Result};
pub use log::{LogSink, LogSource};
pub use reader::BlockLogReader;
pub use writer::BlockLogWriter;
