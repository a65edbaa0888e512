//! A high-throughput, crash-resilient write buffer for append-only byte streams.
//!
//! Producer threads hand arbitrary byte spans to a named [`Buffer`]; a dedicated background
//! persister copies those bytes, in arrival order, into a destination file on disk. The
//! buffer's staging area is itself backed by memory-mapped scratch files, so a crash before
//! persistence completes leaves the staged bytes intact on disk at a small reconstruction cost,
//! without paying a per-append `fsync`.
//!
//! The core covered here is the concurrent staging ring and its persister: [`block`] is the
//! fixed-size mmap-backed region producers append into, [`buffer`] is the ring of blocks plus
//! the rotation/growth/back-pressure policy and persistence coordination, and [`persister`] is
//! the background task that drains filled blocks into the destination file. [`registry`] layers
//! a process-wide name → buffer lookup on top, matching `getBufferInstance`/`removeBufferInstance`
//! from the original.
//!
//! Out of scope (external collaborators, not implemented here): log-line formatting, any
//! CLI/bench harness driving producer threads, and read-side or retention policy on the
//! destination file.

mod block;
mod buffer;
mod config;
mod error;
mod persister;
mod registry;
mod ring;

pub use block::AppendResult;
pub use buffer::Buffer;
pub use config::{
    BufferConfig, BufferConfigBuilder, BufferConfigSettings, DEFAULT_BLOCK_SIZE, DEFAULT_INITIAL_BLOCK_COUNT,
    DEFAULT_MAX_BLOCK_COUNT, DEFAULT_PAGE_SIZE, DEFAULT_PERSIST_TIMEOUT,
};
pub use error::{BlockInitError, BufferInitError, BuildError, PersistError};
pub use registry::{get_buffer_instance, remove_buffer_instance};
