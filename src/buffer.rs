//! The ring of blocks plus the persistence coordination machinery.
//!
//! Grounded on `original_source/code/mmapBuffer.{h,cpp}` for the algorithm (append protocol,
//! rotation policy, persister hand-off) and on
//! `vector_buffers::variants::disk_v2::common::DiskBufferConfig`/`ledger::Ledger` for the Rust
//! shape: a validated config, atomics for counters the persister alone advances, and
//! `tracing` events at the points the original used `printf`.

use std::{
    ffi::OsString,
    fs::{File, OpenOptions},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, OnceLock,
    },
    thread::JoinHandle,
};

use parking_lot::{Condvar, Mutex};
use snafu::ResultExt;

use crate::{
    block::Block,
    config::BufferConfig,
    error::{BufferInitError, InitialBlockSnafu, OpenDestinationFileSnafu, PersistError},
    ring::{BlockId, Ring},
};

#[cfg(unix)]
fn open_dest_file(path: &std::path::Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o644)
        .open(path)
}

#[cfg(not(unix))]
fn open_dest_file(path: &std::path::Path) -> std::io::Result<File> {
    OpenOptions::new().read(true).write(true).create(true).open(path)
}

/// The fields the persister and `waitForBufferPersist`/`changePersistFile` coordinate over.
///
/// Bundled behind one lock because DESIGN NOTES §9 flags that the original toggled
/// `bufferEmpty`/`forcePersist` with no happens-before relationship between the two; keeping
/// them, plus the persistence cursor, under a single mutex closes that gap.
pub(crate) struct PersistState {
    pub(crate) persist_cur: BlockId,
    pub(crate) buffer_empty: bool,
    pub(crate) force_persist: bool,
    pub(crate) enable_write: bool,
}

pub(crate) struct Inner {
    pub(crate) config: BufferConfig,
    pub(crate) ring: Mutex<Ring>,
    pub(crate) write_cur: Mutex<BlockId>,
    pub(crate) persist_state: Mutex<PersistState>,
    pub(crate) dest_file: Mutex<File>,
    pub(crate) dest_offset: AtomicU64,
    pub(crate) actual_data_len: AtomicU64,
    pub(crate) halted: AtomicBool,
    pub(crate) halt_reason: Mutex<Option<PersistError>>,
    pub(crate) shutdown: AtomicBool,
    pub(crate) block_full_cv: Condvar,
    pub(crate) block_persist_done_cv: Condvar,
    pub(crate) buffer_is_empty_cv: Condvar,
    pub(crate) write_flag_changed_cv: Condvar,
    pub(crate) write_cur_cv: Condvar,
    pub(crate) persister: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn new(config: BufferConfig) -> Result<Inner, BufferInitError> {
        let dest_file = open_dest_file(&config.dest_path).context(OpenDestinationFileSnafu {
            path: config.dest_path.clone(),
        })?;

        let mut blocks = Vec::with_capacity(config.initial_block_count);
        for i in 0..config.initial_block_count {
            let path = scratch_path(&config.scratch_base_path, i);
            blocks.push(Block::new(path, config.block_size).context(InitialBlockSnafu)?);
        }
        let ring = Ring::new(blocks, config.max_block_count);
        let head = ring.head();

        Ok(Inner {
            config,
            ring: Mutex::new(ring),
            write_cur: Mutex::new(head),
            persist_state: Mutex::new(PersistState {
                persist_cur: head,
                buffer_empty: false,
                force_persist: false,
                enable_write: true,
            }),
            dest_file: Mutex::new(dest_file),
            dest_offset: AtomicU64::new(0),
            actual_data_len: AtomicU64::new(0),
            halted: AtomicBool::new(false),
            halt_reason: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            block_full_cv: Condvar::new(),
            block_persist_done_cv: Condvar::new(),
            buffer_is_empty_cv: Condvar::new(),
            write_flag_changed_cv: Condvar::new(),
            write_cur_cv: Condvar::new(),
            persister: Mutex::new(None),
        })
    }
}

fn scratch_path(base: &std::path::Path, index: usize) -> PathBuf {
    let mut joined: OsString = base.as_os_str().to_owned();
    joined.push(index.to_string());
    PathBuf::from(joined)
}

/// A named, ring-structured staging buffer plus its persister.
///
/// Two-phase construction mirrors `mmapBuffer::getBufferInstance`/`initBuffer`: a bare `Buffer`
/// can be looked up or created by name before it has any blocks, and [`Buffer::init`]
/// configures it exactly once. Everything past that point lives in `Inner`, behind a
/// [`OnceLock`] so every other method can assume it is present.
pub struct Buffer {
    name: String,
    inner: OnceLock<Inner>,
}

impl Buffer {
    pub(crate) fn new_uninit(name: impl Into<String>) -> Arc<Buffer> {
        Arc::new(Buffer {
            name: name.into(),
            inner: OnceLock::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn inner(&self) -> &Inner {
        self.inner
            .get()
            .expect("buffer used before init (try_append/flush/etc. called before Buffer::init)")
    }

    /// Idempotent: only the first call configures the buffer and spawns its persister.
    pub fn init(self: &Arc<Buffer>, config: BufferConfig) -> Result<(), BufferInitError> {
        if self.inner.get().is_some() {
            return Ok(());
        }
        let inner = Inner::new(config)?;
        if self.inner.set(inner).is_err() {
            // Lost a race with a concurrent `init` call; the other call wins, ours is a no-op.
            return Ok(());
        }

        let buffer = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("mmap-persist-{}", buffer.name))
            .spawn(move || crate::persister::run(&buffer))
            .expect("failed to spawn persister thread");
        *self.inner().persister.lock() = Some(handle);

        Ok(())
    }

    /// Stages `data`, appending it contiguously into the current write block (rotating and
    /// growing the ring as needed). Never partial from the caller's point of view: either all
    /// of `data` lands, or (when `no_lose` is false and no block is free) none of it does.
    pub fn try_append(&self, data: &[u8], no_lose: bool) -> bool {
        let inner = self.inner();
        debug_assert!(
            data.len() <= inner.config.block_size,
            "try_append called with len > block_size"
        );

        {
            let mut state = inner.persist_state.lock();
            while !state.enable_write {
                inner.write_flag_changed_cv.wait(&mut state);
            }
            state.buffer_empty = false;
        }

        let mut remaining = data;
        loop {
            let write_id = *inner.write_cur.lock();
            let block = inner.ring.lock().get(write_id);
            let result = block.append(remaining);

            if result.written == 0 {
                if !no_lose && !self.free_block_available(write_id) {
                    tracing::trace!(buffer = %self.name, "dropping append: no free block and no_lose is false");
                    return false;
                }
                self.wait_for_block_space(write_id);
                continue;
            }

            if result.became_full {
                self.rotate_write_cursor(write_id);
                inner.block_full_cv.notify_one();
                inner.write_cur_cv.notify_all();
            }

            remaining = &remaining[result.written..];
            if remaining.is_empty() {
                return true;
            }
        }
    }

    fn free_block_available(&self, write_id: BlockId) -> bool {
        let ring = self.inner().ring.lock();
        let next_id = ring.next(write_id);
        ring.get(next_id).is_empty() || !ring.is_at_cap()
    }

    fn wait_for_block_space(&self, _stalled_at: BlockId) {
        let inner = self.inner();
        let mut guard = inner.write_cur.lock();
        loop {
            let block = inner.ring.lock().get(*guard);
            if block.free_space() > 0 {
                break;
            }
            inner.write_cur_cv.wait(&mut guard);
        }
        drop(guard);
        inner.write_cur_cv.notify_all();
    }

    /// Advances the write cursor after `full_id` filled: reuse the next block if it is already
    /// empty, grow the ring if there is headroom, or wait for the persister to free the next
    /// block if the ring is already at `max_block_count`.
    ///
    /// Deliberately does *not* hold `write_cur`'s mutex across the (potentially long) cap-wait
    /// branch below: only one thread ever calls this for a given `full_id` (`Block::append`
    /// hands back `became_full = true` to exactly one caller per fill), so nothing else can
    /// race to rotate the same block out from under us, and holding `write_cur` across the wait
    /// would deadlock against the persister, which needs to read `write_cur` to decide whether
    /// to advance `persist_cur` past the very block this wait is blocked on draining (see
    /// `persister::run`). The mutex is taken only for the brief, non-blocking read-check-write
    /// at the end.
    fn rotate_write_cursor(&self, full_id: BlockId) {
        let inner = self.inner();

        let next_id = inner.ring.lock().next(full_id);
        let reused_or_grown = {
            let ring = inner.ring.lock();
            if ring.get(next_id).is_empty() {
                Some(next_id)
            } else if !ring.is_at_cap() {
                let index = ring.block_count();
                drop(ring);
                let path = scratch_path(&inner.config.scratch_base_path, index);
                let new_block = Block::new(path, inner.config.block_size)
                    .unwrap_or_else(|err| panic!("failed to grow buffer ring: {err}"));
                let mut ring = inner.ring.lock();
                Some(ring.insert_after(full_id, new_block))
            } else {
                None
            }
        };

        let new_cur = match reused_or_grown {
            Some(id) => id,
            None => {
                tracing::debug!(buffer = %self.name, "ring at cap, waiting for persister to free a block");
                let mut state = inner.persist_state.lock();
                while !inner.ring.lock().get(next_id).is_empty() {
                    inner.block_persist_done_cv.wait(&mut state);
                }
                next_id
            }
        };

        let mut write_guard = inner.write_cur.lock();
        debug_assert_eq!(*write_guard, full_id);
        *write_guard = new_cur;
        drop(write_guard);
    }

    /// Blocks until every staged byte has been drained to the destination file.
    ///
    /// Disables writes for the duration (waking any producer parked in `try_append`'s
    /// enable-write gate once it returns), forces the persister to flush a partially-filled
    /// block immediately, and waits for the persister to report the buffer empty.
    pub fn flush(&self) {
        let inner = self.inner();
        let mut state = inner.persist_state.lock();
        state.enable_write = false;
        state.force_persist = true;
        drop(state);
        inner.block_full_cv.notify_all();

        let mut state = inner.persist_state.lock();
        while !state.buffer_empty {
            inner.buffer_is_empty_cv.wait(&mut state);
        }
        state.enable_write = true;
        drop(state);
        inner.write_flag_changed_cv.notify_all();
    }

    /// Flushes, then closes the current destination file and opens `new_path` in its place,
    /// resetting both counters to zero.
    pub fn change_persist_file(&self, new_path: impl Into<PathBuf>) -> Result<(), BufferInitError> {
        self.flush();
        let inner = self.inner();
        let new_path = new_path.into();
        let file = open_dest_file(&new_path).context(OpenDestinationFileSnafu {
            path: new_path.clone(),
        })?;
        *inner.dest_file.lock() = file;
        inner.dest_offset.store(0, Ordering::Relaxed);
        inner.actual_data_len.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Advisory, unsynchronized snapshot of how many bytes have been written to the
    /// destination file so far, including page-alignment padding.
    pub fn persistence_file_len(&self) -> u64 {
        self.inner().dest_offset.load(Ordering::Relaxed)
    }

    /// Advisory, unsynchronized snapshot of how many logical (padding-excluded) bytes have been
    /// drained so far.
    pub fn actual_data_len(&self) -> u64 {
        self.inner().actual_data_len.load(Ordering::Relaxed)
    }

    /// True if the persister has halted after an unrecoverable destination-file write error.
    pub fn is_halted(&self) -> bool {
        self.inner().halted.load(Ordering::Acquire)
    }

    /// The error that halted the persister, formatted via its `Display` impl, if any.
    ///
    /// `PersistError` wraps `io::Error`, which isn't `Clone`, so this hands back a rendered
    /// string rather than the error value itself; `is_halted` is the cheap check, this is for
    /// diagnostics once that's true.
    pub fn halt_reason(&self) -> Option<String> {
        self.inner().halt_reason.lock().as_ref().map(ToString::to_string)
    }

    pub(crate) fn block_count(&self) -> usize {
        self.inner().ring.lock().block_count()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let Some(inner) = self.inner.get() else {
            return;
        };
        inner.shutdown.store(true, Ordering::Release);
        self.flush();
        if let Some(handle) = inner.persister.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> BufferConfig {
        BufferConfig::builder(dir.join("dest"), dir.join("scratch"))
            .max_block_count(2)
            .initial_block_count(1)
            .block_size(4096)
            .page_size(4096)
            .persist_timeout(std::time::Duration::from_millis(5))
            .build()
            .unwrap()
    }

    #[test]
    fn scenario_single_thread_fill() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Buffer::new_uninit("scenario1");
        buffer.init(test_config(dir.path())).unwrap();

        assert!(buffer.try_append(&[0x41; 4095], false));
        assert!(buffer.try_append(&[0x42; 1], false));
        buffer.flush();

        let contents = std::fs::read(dir.path().join("dest")).unwrap();
        assert_eq!(contents.len(), 4096);
        assert!(contents[..4095].iter().all(|&b| b == 0x41));
        assert_eq!(contents[4095], 0x42);
        assert_eq!(buffer.actual_data_len(), 4096);
        assert_eq!(buffer.block_count(), 1);
    }

    #[test]
    fn scenario_rotation_without_growth() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Buffer::new_uninit("scenario2");
        buffer.init(test_config(dir.path())).unwrap();

        assert!(buffer.try_append(&[0x41; 4096], false));
        assert!(buffer.try_append(&[0x42; 4096], false));
        buffer.flush();

        let contents = std::fs::read(dir.path().join("dest")).unwrap();
        assert_eq!(contents.len(), 8192);
        assert!(contents[..4096].iter().all(|&b| b == 0x41));
        assert!(contents[4096..].iter().all(|&b| b == 0x42));
    }

    #[test]
    fn scenario_drop_path_when_full_and_no_lose_false() {
        let dir = tempfile::tempdir().unwrap();
        let config = BufferConfig::builder(dir.path().join("dest"), dir.path().join("scratch"))
            .max_block_count(1)
            .initial_block_count(1)
            .block_size(100)
            .page_size(100)
            .persist_timeout(std::time::Duration::from_secs(3600))
            .build()
            .unwrap();
        let buffer = Buffer::new_uninit("scenario4");
        buffer.init(config).unwrap();

        assert!(buffer.try_append(&[0x41; 100], false));
        assert!(!buffer.try_append(&[0x42; 1], false));

        buffer.flush();
        let contents = std::fs::read(dir.path().join("dest")).unwrap();
        assert_eq!(contents.len(), 100);
        assert!(contents.iter().all(|&b| b == 0x41));
    }

    #[test]
    fn scenario_force_flush_with_partial_block() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Buffer::new_uninit("scenario5");
        buffer.init(test_config(dir.path())).unwrap();

        assert!(buffer.try_append(&[0x7a; 7], false));
        buffer.flush();

        let contents = std::fs::read(dir.path().join("dest")).unwrap();
        assert_eq!(contents.len(), 4096);
        assert_eq!(buffer.actual_data_len(), 7);
        assert!(contents[..7].iter().all(|&b| b == 0x7a));
    }

    #[test]
    fn init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Buffer::new_uninit("scenario-idempotent");
        buffer.init(test_config(dir.path())).unwrap();
        let count_before = buffer.block_count();
        // A second init with different parameters must be a no-op.
        let other_config = BufferConfig::builder(dir.path().join("dest2"), dir.path().join("scratch2"))
            .max_block_count(10)
            .build()
            .unwrap();
        buffer.init(other_config).unwrap();
        assert_eq!(buffer.block_count(), count_before);
    }

    #[test]
    fn flush_on_empty_buffer_returns_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Buffer::new_uninit("scenario-empty-flush");
        buffer.init(test_config(dir.path())).unwrap();
        buffer.flush();
        buffer.flush();
        assert_eq!(buffer.actual_data_len(), 0);
    }
}
