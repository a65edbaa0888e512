//! A fixed-capacity, mmap-backed staging region.
//!
//! Grounded on `original_source/code/mmapBlock.{h,cpp}`, generalized to the concurrent append
//! protocol from spec.md §4.1 and expressed in the idiom of
//! `vector_buffers::variants::disk_v2::io` (memory-mapped regions, explicit `Result`-returning
//! construction) plus `vector_buffers::variants::disk_v2::ledger` (atomics for cross-thread
//! counters).

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crossbeam_utils::Backoff;
use memmap2::MmapMut;
use parking_lot::RwLock;
use snafu::ResultExt;

use crate::error::{AllocateScratchFileSnafu, BlockInitError, MapScratchFileSnafu, OpenScratchFileSnafu};

#[cfg(unix)]
fn open_scratch_file(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    // O_DIRECT is opportunistic: some filesystems (tmpfs, many CI overlays) reject it outright,
    // and spec.md §6 asks us to fall back silently rather than fail the block.
    let mut opts = OpenOptions::new();
    opts.read(true).write(true).create(true).mode(0o644);

    #[cfg(target_os = "linux")]
    {
        let direct = opts.clone().custom_flags(libc::O_DIRECT).open(path);
        if let Ok(file) = direct {
            return Ok(file);
        }
    }

    opts.open(path)
}

#[cfg(not(unix))]
fn open_scratch_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().read(true).write(true).create(true).open(path)
}

fn preallocate(file: &File, capacity: usize) -> std::io::Result<()> {
    file.set_len(capacity as u64)
}

/// Result of a single [`Block::append`] call.
pub struct AppendResult {
    /// Number of bytes actually copied into the block; may be less than requested, or zero.
    pub written: usize,
    /// Whether this reservation drove `used` to `capacity`.
    pub became_full: bool,
}

/// A fixed-size byte region backed by a private mmap over a scratch file.
///
/// Ring membership (`prev`/`next`) is owned by [`crate::ring::Ring`], which stores blocks in an
/// arena and links them by index rather than by pointer — see DESIGN.md.
pub struct Block {
    capacity: usize,
    used: AtomicUsize,
    mmap: MmapMut,
    // Guards the reservation bump in `append`. Contention is nanoseconds-scale (one atomic
    // compare-exchange and an arithmetic update), so a spin loop beats parking a real mutex.
    reservation_lock: AtomicBool,
    // Excludes `write_out`/`clear` (exclusive) from concurrent `append` copies (shared).
    // Producers never block each other here; only the drain step does.
    drain_lock: RwLock<()>,
    file: File,
    path: PathBuf,
}

impl Block {
    /// Opens or creates the scratch file at `path`, preallocates `capacity` bytes, and maps it
    /// shared read/write.
    pub fn new(path: impl Into<PathBuf>, capacity: usize) -> Result<Block, BlockInitError> {
        let path = path.into();
        let file = open_scratch_file(&path).context(OpenScratchFileSnafu { path: path.clone() })?;
        preallocate(&file, capacity).context(AllocateScratchFileSnafu {
            path: path.clone(),
            capacity,
        })?;
        // SAFETY: the scratch file is exclusive to this block for its entire lifetime (it was
        // just created/truncated above), so no other process or mapping can observe torn writes.
        let mmap = unsafe { MmapMut::map_mut(&file) }.context(MapScratchFileSnafu { path: path.clone() })?;

        Ok(Block {
            capacity,
            used: AtomicUsize::new(0),
            mmap,
            reservation_lock: AtomicBool::new(false),
            drain_lock: RwLock::new(()),
            file,
            path,
        })
    }

    /// Immutable block capacity, in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes written so far.
    pub fn used_space(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Remaining free space, in bytes.
    pub fn free_space(&self) -> usize {
        self.capacity - self.used_space()
    }

    /// Number of system pages `used_space()` bytes occupy, rounding up.
    pub fn used_pages(&self, page_size: usize) -> usize {
        let used = self.used_space();
        if used % page_size == 0 {
            used / page_size
        } else {
            used / page_size + 1
        }
    }

    /// True once no bytes have ever been written since the last `clear`.
    pub fn is_empty(&self) -> bool {
        self.used_space() == 0
    }

    /// True once the block cannot accept any more bytes.
    pub fn is_full(&self) -> bool {
        self.used_space() == self.capacity
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reserves up to `src.len()` bytes of free space and copies `src` in.
    ///
    /// Implements spec.md §4.1's append protocol: a fast-fail on an already-full block, then a
    /// shared drain-lock (excluding only `write_out`/`clear`, not other producers), a spin-only
    /// reservation step, and finally the memcpy outside the spin lock but still under the shared
    /// drain lock.
    pub fn append(&self, src: &[u8]) -> AppendResult {
        if self.is_full() {
            return AppendResult {
                written: 0,
                became_full: true,
            };
        }

        let _shared = self.drain_lock.read();

        let backoff = Backoff::new();
        while self
            .reservation_lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.spin();
        }

        let used = self.used.load(Ordering::Relaxed);
        let remaining = self.capacity - used;
        let (write_pos, write_len, became_full) = if remaining <= src.len() {
            (used, remaining, true)
        } else {
            (used, src.len(), false)
        };
        self.used.store(used + write_len, Ordering::Release);

        self.reservation_lock.store(false, Ordering::Release);

        if write_len > 0 {
            // SAFETY: [write_pos, write_pos + write_len) was just reserved exclusively by this
            // call; no other producer's reservation can overlap it, and the drain lock excludes
            // `write_out`/`clear` for the duration of this borrow.
            let dst = unsafe {
                std::slice::from_raw_parts_mut(self.mmap.as_ptr().add(write_pos) as *mut u8, write_len)
            };
            dst.copy_from_slice(&src[..write_len]);
        }

        AppendResult {
            written: write_len,
            became_full,
        }
    }

    /// Drains `len` bytes (or the full `capacity`, if `len == 0`) into `dest` at `offset`.
    ///
    /// Takes the exclusive side of the drain lock, so it waits out any append currently
    /// mid-memcpy and blocks any append that arrives afterward until it returns.
    pub fn write_out(&self, dest: &File, offset: u64, len: usize) -> std::io::Result<usize> {
        use std::os::unix::fs::FileExt;

        let _exclusive = self.drain_lock.write();
        let len = if len == 0 { self.capacity } else { len };
        dest.write_at(&self.mmap[..len], offset)?;
        Ok(len)
    }

    /// Resets `used` to zero.
    ///
    /// Caller must guarantee no concurrent producer holds a reservation, which in practice means
    /// this is only called by the persister immediately after `write_out`, under the same
    /// persistence-cursor mutex that serializes drains.
    pub fn clear(&self) {
        self.used.store(0, Ordering::Release);
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_block(capacity: usize) -> (tempfile::TempDir, Block) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block0");
        let block = Block::new(path, capacity).unwrap();
        (dir, block)
    }

    #[test]
    fn append_within_capacity_does_not_fill() {
        let (_dir, block) = temp_block(4096);
        let result = block.append(&[0x41; 100]);
        assert_eq!(result.written, 100);
        assert!(!result.became_full);
        assert_eq!(block.used_space(), 100);
    }

    #[test]
    fn append_exactly_filling_reports_full() {
        let (_dir, block) = temp_block(4096);
        let result = block.append(&[0x41; 4096]);
        assert_eq!(result.written, 4096);
        assert!(result.became_full);
        assert!(block.is_full());
    }

    #[test]
    fn append_overflowing_returns_partial() {
        let (_dir, block) = temp_block(4096);
        block.append(&[0x41; 4095]);
        let result = block.append(&[0x42; 2]);
        assert_eq!(result.written, 1);
        assert!(result.became_full);
    }

    #[test]
    fn append_to_full_block_returns_zero() {
        let (_dir, block) = temp_block(10);
        block.append(&[0x41; 10]);
        let result = block.append(&[0x42; 1]);
        assert_eq!(result.written, 0);
        assert!(result.became_full);
    }

    #[test]
    fn append_zero_length_is_a_no_op() {
        let (_dir, block) = temp_block(10);
        let result = block.append(&[]);
        assert_eq!(result.written, 0);
        assert!(!result.became_full);
    }

    #[test]
    fn clear_resets_used_space() {
        let (_dir, block) = temp_block(4096);
        block.append(&[0x41; 4096]);
        block.clear();
        assert_eq!(block.used_space(), 0);
        assert!(!block.is_full());
    }

    #[test]
    fn write_out_drains_mapped_bytes() {
        let (_dir, block) = temp_block(4096);
        block.append(&[0x41; 4095]);
        block.append(&[0x42; 1]);

        let dest_dir = tempfile::tempdir().unwrap();
        let dest_path = dest_dir.path().join("dest");
        let dest = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&dest_path)
            .unwrap();
        let written = block.write_out(&dest, 0, 0).unwrap();
        assert_eq!(written, 4096);

        let contents = std::fs::read(&dest_path).unwrap();
        assert_eq!(contents.len(), 4096);
        assert!(contents[..4095].iter().all(|&b| b == 0x41));
        assert_eq!(contents[4095], 0x42);
    }

    #[test]
    fn scratch_file_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block0");
        {
            let _block = Block::new(&path, 4096).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
