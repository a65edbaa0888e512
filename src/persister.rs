//! The background thread that drains filled blocks into the destination file.
//!
//! Grounded on `original_source/code/mmapBuffer.cpp`'s `persist()` loop, with the redesign flag
//! from spec.md §9 applied: the thread is owned (joined from `Buffer::drop`) rather than
//! detached, and `tracing` events replace the original's `printf`s.

use std::sync::{atomic::Ordering, Arc};

use snafu::{ensure, ResultExt};

use crate::{
    buffer::Buffer,
    error::{PersistError, ShortWriteSnafu, WriteSnafu},
};

/// Runs until `buffer`'s shutdown flag is observed while idle, or until a destination write
/// fails outright (spec.md §7: a partial/failed write is fatal, and halts the persister rather
/// than risking silent data loss).
pub(crate) fn run(buffer: &Arc<Buffer>) {
    let inner = buffer.inner();

    loop {
        let mut state = inner.persist_state.lock();
        let persist_id = state.persist_cur;
        let block = inner.ring.lock().get(persist_id);

        if block.is_empty() {
            state.buffer_empty = true;
            // Nothing outstanding to force; an armed force-flush request has been vacuously
            // satisfied, so don't let it fire against whatever gets appended next.
            state.force_persist = false;
            drop(state);
            inner.buffer_is_empty_cv.notify_all();
            inner.block_persist_done_cv.notify_all();

            if inner.shutdown.load(Ordering::Acquire) {
                tracing::debug!(buffer = %buffer.name(), "persister shutting down (idle)");
                return;
            }
            let mut state = inner.persist_state.lock();
            inner.block_full_cv.wait_for(&mut state, inner.config.persist_timeout);
            continue;
        }

        if block.free_space() > 0 {
            // The ring only ever has one partially-filled block at a time, and it's always the
            // one the writer is currently targeting. `write_cur` is read under its own mutex
            // here rather than cached in an atomic hint: a hint updated only after rotation
            // completes can lag the synchronous `used == capacity` transition inside
            // `Block::append` by an arbitrary amount of wall-clock time (file I/O on the grow
            // path, or a cap-bound wait), which would let this check — and the one below that
            // decides whether to advance `persist_cur` — observe a block as still "current"
            // after the writer has already moved on.
            debug_assert_eq!(persist_id, *inner.write_cur.lock());
            inner.block_full_cv.wait_for(&mut state, inner.config.persist_timeout);
        }

        if block.free_space() == 0 {
            let write_len = inner.config.block_size;
            let actual_len = block.used_space();
            if let Err(error) = drain(buffer, &block, write_len, actual_len) {
                tracing::error!(buffer = %buffer.name(), %error, "halting persister");
                halt(buffer, error);
                return;
            }
            block.clear();

            // Authoritative: take `write_cur`'s mutex directly rather than relying on a hint
            // that can lag the rotation it's meant to observe (see the comment above). Safe to
            // take here even while holding `persist_state`'s lock: `rotate_write_cursor` never
            // holds `write_cur` across a blocking wait, so there is no cycle back to this
            // thread.
            if persist_id != *inner.write_cur.lock() {
                state.persist_cur = inner.ring.lock().next(persist_id);
            }
            inner.block_persist_done_cv.notify_one();
        } else if state.force_persist && block.used_space() > 0 {
            let write_len = block.used_pages(inner.config.page_size) * inner.config.page_size;
            let actual_len = block.used_space();
            tracing::debug!(buffer = %buffer.name(), write_len, actual_len, "force-persisting partial block");
            if let Err(error) = drain(buffer, &block, write_len, actual_len) {
                tracing::error!(buffer = %buffer.name(), %error, "halting persister");
                halt(buffer, error);
                return;
            }
            block.clear();
            state.force_persist = false;
            inner.block_persist_done_cv.notify_one();
        }
    }
}

/// Drains `write_len` bytes of `block` to the destination file, advancing the shared offset
/// counters. Returns the constructed [`PersistError`] (the buffer is not yet marked halted; the
/// caller does that via `halt`) if the write failed or was short, per the fatal-error policy in
/// spec.md §7.
fn drain(
    buffer: &Arc<Buffer>,
    block: &crate::block::Block,
    write_len: usize,
    actual_len: usize,
) -> Result<(), PersistError> {
    let inner = buffer.inner();
    let offset = inner.dest_offset.load(Ordering::Relaxed);
    let dest = inner.dest_file.lock();
    let written = block.write_out(&dest, offset, write_len).context(WriteSnafu)?;
    drop(dest);
    ensure!(
        written == write_len,
        ShortWriteSnafu {
            written,
            requested: write_len,
        }
    );
    inner.dest_offset.fetch_add(write_len as u64, Ordering::Relaxed);
    inner.actual_data_len.fetch_add(actual_len as u64, Ordering::Relaxed);
    Ok(())
}

fn halt(buffer: &Arc<Buffer>, error: PersistError) {
    let inner = buffer.inner();
    *inner.halt_reason.lock() = Some(error);
    inner.halted.store(true, Ordering::Release);
    let mut state = inner.persist_state.lock();
    state.buffer_empty = true;
    drop(state);
    inner.buffer_is_empty_cv.notify_all();
    inner.block_persist_done_cv.notify_all();
}

#[cfg(test)]
mod tests {
    use snafu::ResultExt;

    use super::*;
    use crate::block::Block;

    #[test]
    fn write_failure_converts_into_a_persist_error() {
        let dir = tempfile::tempdir().unwrap();
        let block = Block::new(dir.path().join("block0"), 4096).unwrap();
        block.append(&[0x41; 4096]);

        let readonly_dest = std::fs::File::open(dir.path().join("block0")).unwrap();
        let result = block.write_out(&readonly_dest, 0, 4096).context(WriteSnafu);

        let error = result.expect_err("writing through a read-only fd must fail");
        assert!(error.to_string().contains("write to destination file failed"));
    }

    #[test]
    fn halt_records_the_error_surfaced_by_drain() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::BufferConfig::builder(dir.path().join("dest"), dir.path().join("scratch"))
            .max_block_count(1)
            .initial_block_count(1)
            .block_size(64)
            .page_size(64)
            .build()
            .unwrap();
        let buffer = Buffer::new_uninit("persister-halt-reason");
        buffer.init(config).unwrap();
        assert!(!buffer.is_halted());
        assert_eq!(buffer.halt_reason(), None);

        halt(
            &buffer,
            ShortWriteSnafu {
                written: 10_usize,
                requested: 64_usize,
            }
            .build(),
        );

        assert!(buffer.is_halted());
        let reason = buffer.halt_reason().expect("halt_reason must be set after halt()");
        assert!(reason.contains("short write"));
    }
}
