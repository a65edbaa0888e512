//! Error types for buffer construction and runtime operation.
//!
//! Mirrors the shape of `vector_buffers::variants::disk_v2::common::BuildError`: one
//! `snafu`-derived enum per fallible boundary, rather than the asserts and `-1`/`nullptr`
//! sentinels the original C++ used.

use std::{io, path::PathBuf};

use snafu::Snafu;

/// Error returned when a [`Block`](crate::block::Block) fails to come up.
///
/// A block that fails to initialize is never inserted into the ring; the caller gets this
/// error instead of having to remember to check an `is_valid()` flag.
#[derive(Debug, Snafu)]
pub enum BlockInitError {
    /// Opening (or creating) the scratch file failed.
    #[snafu(display("failed to open scratch file {}: {}", path.display(), source))]
    OpenScratchFile { path: PathBuf, source: io::Error },

    /// Pre-allocating `capacity` bytes in the scratch file failed.
    #[snafu(display("failed to preallocate {} bytes for scratch file {}: {}", capacity, path.display(), source))]
    AllocateScratchFile {
        path: PathBuf,
        capacity: usize,
        source: io::Error,
    },

    /// Memory-mapping the scratch file failed.
    #[snafu(display("failed to mmap scratch file {}: {}", path.display(), source))]
    MapScratchFile { path: PathBuf, source: io::Error },
}

/// Error returned by [`BufferConfigBuilder::build`](crate::config::BufferConfigBuilder::build).
#[derive(Debug, Snafu)]
pub enum BuildError {
    /// A configuration parameter was out of range or otherwise nonsensical.
    #[snafu(display("parameter '{}' was invalid: {}", param_name, reason))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Error returned when a [`Buffer`](crate::buffer::Buffer) fails to initialize.
#[derive(Debug, Snafu)]
pub enum BufferInitError {
    /// The destination file could not be opened.
    #[snafu(display("failed to open destination file {}: {}", path.display(), source))]
    OpenDestinationFile { path: PathBuf, source: io::Error },

    /// One of the initial scratch blocks failed to come up.
    #[snafu(display("failed to create initial block: {}", source))]
    InitialBlock { source: BlockInitError },

    /// The supplied configuration was invalid.
    #[snafu(display("invalid buffer configuration: {}", source))]
    Config { source: BuildError },
}

/// Error surfaced by the persister when a drain write cannot be completed.
///
/// Per the design's propagation policy, a partial or failed destination write is treated as
/// fatal: there is no silent data loss path, so the persister halts rather than guessing at a
/// retry strategy.
#[derive(Debug, Snafu)]
pub enum PersistError {
    /// The positional write to the destination file failed outright.
    #[snafu(display("write to destination file failed: {}", source))]
    Write { source: io::Error },

    /// The positional write returned fewer bytes than requested.
    #[snafu(display("short write to destination file: wrote {} of {} bytes", written, requested))]
    ShortWrite { written: usize, requested: usize },
}
