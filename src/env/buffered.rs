//! Write-coalescing decorator for appenders.
//!
//! Small appends are staged in an internal buffer and written to the
//! wrapped appender in larger chunks. Appends larger than the buffer
//! capacity bypass the buffer entirely after draining it, so data always
//! reaches the wrapped appender in order.

use super::Appender;
use crate::error::Result;

pub struct BufferedAppender<A: Appender> {
    inner: A,
    buf: Vec<u8>,
    capacity: usize,
}

impl<A: Appender> BufferedAppender<A> {
    pub fn new(inner: A, capacity: usize) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Bytes currently staged and not yet pushed down.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn drain(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.inner.append(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }
}

impl<A: Appender> Appender for BufferedAppender<A> {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        if self.buf.len() + data.len() <= self.capacity {
            self.buf.extend_from_slice(data);
            return Ok(());
        }

        self.drain()?;

        if data.len() >= self.capacity {
            return self.inner.append(data);
        }

        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.drain()?;
        self.inner.flush()
    }

    fn sync(&mut self) -> Result<()> {
        self.drain()?;
        self.inner.sync()
    }

    fn close(&mut self) -> Result<()> {
        self.drain()?;
        self.inner.close()
    }
}
