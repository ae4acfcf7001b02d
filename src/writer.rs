//! The double-buffered write path.
//!
//! Records accumulate in an active in-memory buffer while background
//! compactions drain previously filled buffers: each compaction
//! serializes one buffer into a block, builds the block's filter stripe,
//! and appends the block to the data sink. A monotonically increasing
//! ticket is assigned to every buffer as it becomes immutable, and an
//! in-order commit barrier guarantees blocks reach the sink in ticket
//! order no matter which compaction finishes first.
//!
//! One mutex and one condition variable coordinate everything: callers
//! block in `rotate_buffer` when every buffer is busy (back-pressure),
//! in `sync`/`wait`/`finish` while compactions are outstanding, and
//! background workers block at the commit barrier until their ticket is
//! next. Background errors are latched and surfaced to the next
//! foreground call; the writer never retries.

use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use crate::block::{Block, BlockBuilder, BlockFormat, BlockHandle, Footer};
use crate::config::DirOptions;
use crate::encoding::put_fixed64;
use crate::error::Result;
use crate::filter::FilterPolicy;
use crate::log::LogSink;
use crate::Error;

struct WriterState {
    active: BlockBuilder,
    free: Vec<BlockBuilder>,
    /// Ticket of the most recently rotated buffer.
    next_ticket: u32,
    /// Highest ticket whose append has finished.
    committed: u32,
    num_bg_compactions: usize,
    /// First background failure; sticky.
    bg_status: Option<Error>,
    /// In-memory index stripe: one `(filter_end, data_end)` pair per
    /// block, plus a final sentinel pair written by finish().
    indexes: Vec<u8>,
    /// Concatenation of all filter stripes.
    filters: Vec<u8>,
    /// Outcome of finish(), once it ran.
    done: Option<Result<()>>,
}

struct WriterShared {
    options: DirOptions,
    sink: Arc<LogSink>,
    buf_threshold: usize,
    state: Mutex<WriterState>,
    bg_cv: Condvar,
}

/// Multi-producer writer over one data sink.
pub struct BlockLogWriter {
    shared: Arc<WriterShared>,
}

impl BlockLogWriter {
    /// Creates a writer with `memtable_parts` buffers (at least two)
    /// splitting the memtable budget.
    pub fn new(options: DirOptions, sink: Arc<LogSink>) -> Self {
        let parts = options.memtable_parts.max(2);
        let per_buf = (options.total_memtable_budget / parts).max(1);
        let buf_threshold = ((per_buf as f64) * options.memtable_util) as usize;

        let mut buffers: Vec<BlockBuilder> = (0..parts)
            .map(|_| {
                let mut builder = BlockBuilder::new(BlockFormat::Unordered, &options);
                builder.reserve(per_buf + 64);
                builder
            })
            .collect();
        let active = buffers.pop().unwrap();

        Self {
            shared: Arc::new(WriterShared {
                options,
                sink,
                buf_threshold: buf_threshold.max(1),
                state: Mutex::new(WriterState {
                    active,
                    free: buffers,
                    next_ticket: 0,
                    committed: 0,
                    num_bg_compactions: 0,
                    bg_status: None,
                    indexes: Vec::new(),
                    filters: Vec::new(),
                    done: None,
                }),
                bg_cv: Condvar::new(),
            }),
        }
    }

    /// Inserts one record. Rotates the active buffer first when the
    /// record would push it past its threshold, which may block until a
    /// buffer is free.
    pub fn add(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut state = self.shared.state.lock()?;
        check_foreground(&state)?;

        let entry_overhead = key.len() + value.len() + 8;
        if !state.active.is_empty()
            && state.active.estimated_size() + entry_overhead > self.shared.buf_threshold
        {
            let (next, status) = WriterShared::rotate_buffer(&self.shared, state);
            state = next;
            status?;
        }
        state.active.add(key, value)
    }

    /// Forces a compaction of the active buffer without waiting for it
    /// to complete.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.shared.state.lock()?;
        check_foreground(&state)?;
        if !state.active.is_empty() {
            let (next, status) = WriterShared::rotate_buffer(&self.shared, state);
            state = next;
            status?;
        }
        drop(state);
        Ok(())
    }

    /// Epoch boundaries force a compaction but carry no additional
    /// semantics; rotation of the underlying log stays an explicit
    /// [`LogSink::rotate`] call.
    pub fn epoch_flush(&self) -> Result<()> {
        self.flush()
    }

    /// Flushes, waits for all compactions to clear, and forces the sink
    /// to storage. The only point where device-level sync happens before
    /// finish().
    pub fn sync(&self) -> Result<()> {
        let mut state = self.shared.state.lock()?;
        check_foreground(&state)?;
        if !state.active.is_empty() {
            let (next, status) = WriterShared::rotate_buffer(&self.shared, state);
            state = next;
            status?;
        }
        while state.num_bg_compactions > 0 {
            state = self.shared.bg_cv.wait(state)?;
        }
        if let Some(e) = &state.bg_status {
            return Err(e.clone());
        }
        self.shared.sink.sync()
    }

    /// Waits until no compaction is outstanding and reports the sticky
    /// background status.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.shared.state.lock()?;
        while state.num_bg_compactions > 0 {
            state = self.shared.bg_cv.wait(state)?;
        }
        match &state.bg_status {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Terminal operation: drains all buffers, writes the filter stream,
    /// the index stream, and the footer, then syncs and closes the sink.
    /// Every step is attempted and the first error is returned.
    /// Idempotent; later calls return the first outcome.
    pub fn finish(&self) -> Result<()> {
        let mut state = self.shared.state.lock()?;
        if let Some(result) = &state.done {
            return result.clone();
        }

        let mut status = Ok(());
        if !state.active.is_empty() && state.bg_status.is_none() {
            let (next, rotate_status) = WriterShared::rotate_buffer(&self.shared, state);
            state = next;
            if let Err(e) = rotate_status {
                status = Err(e);
            }
        }
        while state.num_bg_compactions > 0 {
            state = self.shared.bg_cv.wait(state)?;
        }
        if status.is_ok() {
            if let Some(e) = &state.bg_status {
                status = Err(e.clone());
            }
        }

        let dumped = self.shared.dump_indexes_and_filters(&mut state);
        if status.is_ok() {
            status = dumped;
        }
        let synced = self.shared.sink.sync();
        if status.is_ok() {
            status = synced;
        }
        let closed = self.shared.sink.close(false);
        if status.is_ok() {
            status = closed;
        }

        state.done = Some(status.clone());
        status
    }
}

impl Drop for BlockLogWriter {
    // Destruction waits for outstanding compactions to drain; there is
    // no mid-operation cancellation.
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            while state.num_bg_compactions > 0 {
                state = match self.shared.bg_cv.wait(state) {
                    Ok(state) => state,
                    Err(_) => return,
                };
            }
        }
    }
}

fn check_foreground(state: &WriterState) -> Result<()> {
    if state.done.is_some() {
        return Err(Error::Disconnected("writer already finished".to_string()));
    }
    if let Some(e) = &state.bg_status {
        return Err(e.clone());
    }
    Ok(())
}

impl WriterShared {
    /// Hands the active buffer to a compaction and installs a free one.
    /// Blocks while every buffer is busy, unless a background error has
    /// already been latched.
    fn rotate_buffer<'a>(
        shared: &'a Arc<WriterShared>,
        mut state: MutexGuard<'a, WriterState>,
    ) -> (MutexGuard<'a, WriterState>, Result<()>) {
        loop {
            if let Some(e) = state.bg_status.clone() {
                return (state, Err(e));
            }
            if !state.free.is_empty() {
                break;
            }
            state = match shared.bg_cv.wait(state) {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
        }

        let replacement = state.free.pop().unwrap();
        let immutable = mem::replace(&mut state.active, replacement);
        state.next_ticket += 1;
        let ticket = state.next_ticket;
        state.num_bg_compactions += 1;

        Self::schedule_compaction(shared, state, ticket, immutable)
    }

    fn schedule_compaction<'a>(
        shared: &'a Arc<WriterShared>,
        state: MutexGuard<'a, WriterState>,
        ticket: u32,
        buf: BlockBuilder,
    ) -> (MutexGuard<'a, WriterState>, Result<()>) {
        if let Some(pool) = &shared.options.compaction_pool {
            let task_shared = Arc::clone(shared);
            pool.schedule(move || WriterShared::compact(&task_shared, ticket, buf));
            (state, Ok(()))
        } else if shared.options.allow_env_threads {
            let task_shared = Arc::clone(shared);
            thread::spawn(move || WriterShared::compact(&task_shared, ticket, buf));
            (state, Ok(()))
        } else {
            // Single-threaded cooperative mode: run on the caller.
            drop(state);
            WriterShared::compact(shared, ticket, buf);
            match shared.state.lock() {
                Ok(state) => (state, Ok(())),
                Err(poisoned) => (poisoned.into_inner(), Ok(())),
            }
        }
    }

    /// Compaction task body. Serializes the buffer and builds its filter
    /// without the lock, waits for its turn at the commit barrier,
    /// appends in ticket order, and returns the buffer to the free set.
    fn compact(shared: &WriterShared, ticket: u32, mut buf: BlockBuilder) {
        let mut status: Result<()> = Ok(());
        let empty = buf.is_empty();
        let mut filter_bytes = Vec::new();

        if !empty {
            status = buf.finish(shared.options.compression).map(|_| ());
            if status.is_ok() {
                let mut policy = FilterPolicy::new(&shared.options);
                if policy.is_enabled() {
                    status = build_filter(&mut policy, &buf, &mut filter_bytes);
                }
            }
        }

        // All appends are serialized through the ticket order.
        let mut state = shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while state.committed + 1 != ticket {
            state = shared
                .bg_cv
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }

        if status.is_ok() && !empty {
            let filter_offset = state.filters.len() as u64;
            put_fixed64(&mut state.indexes, filter_offset);
            state.filters.extend_from_slice(&filter_bytes);
            put_fixed64(&mut state.indexes, shared.sink.tell_logical());

            // The barrier makes this task the only appender; release the
            // lock around the write itself.
            drop(state);
            let appended = shared.sink.append(buf.finished_data());
            state = shared
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            status = appended;
        }

        state.committed = ticket;
        buf.reset();
        state.free.push(buf);
        state.num_bg_compactions -= 1;
        if let Err(e) = &status {
            tracing::error!(ticket, error = %e, "Background compaction failed");
            if state.bg_status.is_none() {
                state.bg_status = Some(e.clone());
            }
        }
        drop(state);
        shared.bg_cv.notify_all();
    }

    /// Appends the final index sentinel, the filter stream, the index
    /// stream, and the footer. Requires no outstanding compactions.
    fn dump_indexes_and_filters(&self, state: &mut WriterState) -> Result<()> {
        debug_assert_eq!(state.num_bg_compactions, 0);

        let filter_end = state.filters.len() as u64;
        put_fixed64(&mut state.indexes, filter_end);
        put_fixed64(&mut state.indexes, self.sink.tell_logical());

        let filter_handle = BlockHandle::new(self.sink.tell_logical(), state.filters.len() as u64);
        if !state.filters.is_empty() {
            self.sink.append(&state.filters)?;
        }

        let index_handle = BlockHandle::new(self.sink.tell_logical(), state.indexes.len() as u64);
        self.sink.append(&state.indexes)?;

        let footer = Footer {
            filter: filter_handle,
            index: index_handle,
        };
        self.sink.append(&footer.encode())?;

        if self.options.tail_padding && self.options.block_size > 0 {
            let physical = self.sink.tell_physical() as usize;
            let pad = (self.options.block_size - physical % self.options.block_size)
                % self.options.block_size;
            if pad > 0 {
                self.sink.append(&vec![0u8; pad])?;
            }
        }
        Ok(())
    }
}

fn build_filter(
    policy: &mut FilterPolicy,
    buf: &BlockBuilder,
    filter_bytes: &mut Vec<u8>,
) -> Result<()> {
    policy.reset(buf.num_entries());
    let block = Block::new(buf.finished_data(), BlockFormat::Unordered)?;
    for entry in block.iter() {
        let (key, _) = entry?;
        policy.add_key(&key);
    }
    *filter_bytes = policy.finish();
    Ok(())
}
