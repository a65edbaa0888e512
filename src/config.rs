//! Buffer configuration.
//!
//! Modeled on `vector_buffers::variants::disk_v2::common::DiskBufferConfigBuilder`: a plain
//! struct holding validated, immutable parameters, built through a `Builder` that applies
//! defaults and rejects nonsensical combinations at `build()` time rather than asserting deep
//! inside `init`.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::error::{BuildError, InvalidParameterSnafu};

/// Ring grows by one block at a time until this many blocks exist.
pub const DEFAULT_MAX_BLOCK_COUNT: usize = 50;

/// Number of blocks created eagerly at `init` time.
pub const DEFAULT_INITIAL_BLOCK_COUNT: usize = 2;

/// Per-block capacity, in bytes: `4096 * 100_000` (~400 MiB).
pub const DEFAULT_BLOCK_SIZE: usize = 4096 * 100_000;

/// How long the persister waits for a block to fill before re-checking the force-flush flag.
pub const DEFAULT_PERSIST_TIMEOUT: Duration = Duration::from_millis(10);

/// Alignment granularity for drain writes.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// The deserializable, on-the-wire form of a [`BufferConfig`].
///
/// `std::time::Duration` has no `serde` impl under this crate's `default-features = false`
/// feature set (mirroring the teacher workspace's own `serde` feature selection — see
/// DESIGN.md), so the timeout travels as plain milliseconds here and is converted once, at
/// [`BufferConfigSettings::into_builder`] time. Modeled on
/// `vector_buffers::config::BufferType`'s split between an on-disk representation and the
/// validated runtime type it's converted into.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BufferConfigSettings {
    pub dest_path: PathBuf,
    pub scratch_base_path: PathBuf,
    #[serde(default)]
    pub max_block_count: Option<usize>,
    #[serde(default)]
    pub initial_block_count: Option<usize>,
    #[serde(default)]
    pub block_size: Option<usize>,
    #[serde(default)]
    pub persist_timeout_ms: Option<u64>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

impl BufferConfigSettings {
    /// Converts these settings into a [`BufferConfigBuilder`], applying defaults for any field
    /// left unset exactly as [`BufferConfigBuilder::build`] would.
    pub fn into_builder(self) -> BufferConfigBuilder {
        let mut builder = BufferConfig::builder(self.dest_path, self.scratch_base_path);
        if let Some(amount) = self.max_block_count {
            builder = builder.max_block_count(amount);
        }
        if let Some(amount) = self.initial_block_count {
            builder = builder.initial_block_count(amount);
        }
        if let Some(amount) = self.block_size {
            builder = builder.block_size(amount);
        }
        if let Some(ms) = self.persist_timeout_ms {
            builder = builder.persist_timeout(Duration::from_millis(ms));
        }
        if let Some(amount) = self.page_size {
            builder = builder.page_size(amount);
        }
        builder
    }
}

/// Validated configuration for a [`Buffer`](crate::buffer::Buffer).
#[derive(Clone, Debug)]
pub struct BufferConfig {
    pub(crate) dest_path: PathBuf,
    pub(crate) scratch_base_path: PathBuf,
    pub(crate) max_block_count: usize,
    pub(crate) initial_block_count: usize,
    pub(crate) block_size: usize,
    pub(crate) persist_timeout: Duration,
    pub(crate) page_size: usize,
}

impl BufferConfig {
    /// Starts a [`BufferConfigBuilder`] for a buffer that persists into `dest_path` and stages
    /// scratch blocks at `scratch_base_path` + an increasing integer suffix.
    pub fn builder<P1, P2>(dest_path: P1, scratch_base_path: P2) -> BufferConfigBuilder
    where
        P1: Into<PathBuf>,
        P2: Into<PathBuf>,
    {
        BufferConfigBuilder {
            dest_path: dest_path.into(),
            scratch_base_path: scratch_base_path.into(),
            max_block_count: None,
            initial_block_count: None,
            block_size: None,
            persist_timeout: None,
            page_size: None,
        }
    }

    pub fn dest_path(&self) -> &std::path::Path {
        &self.dest_path
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn max_block_count(&self) -> usize {
        self.max_block_count
    }
}

/// Builder for [`BufferConfig`].
///
/// Mirrors `DiskBufferConfigBuilder`'s "every setter is optional, defaults applied at `build`"
/// shape.
#[derive(Clone, Debug)]
pub struct BufferConfigBuilder {
    dest_path: PathBuf,
    scratch_base_path: PathBuf,
    max_block_count: Option<usize>,
    initial_block_count: Option<usize>,
    block_size: Option<usize>,
    persist_timeout: Option<Duration>,
    page_size: Option<usize>,
}

impl BufferConfigBuilder {
    /// Sets the hard cap on the number of blocks the ring may grow to.
    ///
    /// Defaults to 50.
    pub fn max_block_count(mut self, amount: usize) -> Self {
        self.max_block_count = Some(amount);
        self
    }

    /// Sets the number of blocks created eagerly at `init` time.
    ///
    /// Defaults to 2.
    pub fn initial_block_count(mut self, amount: usize) -> Self {
        self.initial_block_count = Some(amount);
        self
    }

    /// Sets the per-block capacity, in bytes.
    ///
    /// Defaults to 400 MiB (`4096 * 100_000`).
    pub fn block_size(mut self, amount: usize) -> Self {
        self.block_size = Some(amount);
        self
    }

    /// Sets the persister's bounded wait for a block to fill before re-checking the
    /// force-flush flag.
    ///
    /// Defaults to 10ms.
    pub fn persist_timeout(mut self, timeout: Duration) -> Self {
        self.persist_timeout = Some(timeout);
        self
    }

    /// Sets the alignment granularity used for drain writes.
    ///
    /// Defaults to 4096. `block_size` must be an exact multiple of this value: the non-forced
    /// drain path assumes a full block is already page-aligned.
    pub fn page_size(mut self, amount: usize) -> Self {
        self.page_size = Some(amount);
        self
    }

    /// Consumes this builder and constructs a [`BufferConfig`].
    pub fn build(self) -> Result<BufferConfig, BuildError> {
        let max_block_count = self.max_block_count.unwrap_or(DEFAULT_MAX_BLOCK_COUNT);
        let initial_block_count = self
            .initial_block_count
            .unwrap_or(DEFAULT_INITIAL_BLOCK_COUNT);
        let block_size = self.block_size.unwrap_or(DEFAULT_BLOCK_SIZE);
        let persist_timeout = self.persist_timeout.unwrap_or(DEFAULT_PERSIST_TIMEOUT);
        let page_size = self.page_size.unwrap_or(DEFAULT_PAGE_SIZE);

        ensure!(
            max_block_count > 0,
            InvalidParameterSnafu {
                param_name: "max_block_count",
                reason: "cannot be zero".to_string(),
            }
        );
        ensure!(
            initial_block_count > 0 && initial_block_count <= max_block_count,
            InvalidParameterSnafu {
                param_name: "initial_block_count",
                reason: format!("must be in 1..={}", max_block_count),
            }
        );
        ensure!(
            block_size > 0,
            InvalidParameterSnafu {
                param_name: "block_size",
                reason: "cannot be zero".to_string(),
            }
        );
        ensure!(
            page_size > 0,
            InvalidParameterSnafu {
                param_name: "page_size",
                reason: "cannot be zero".to_string(),
            }
        );
        ensure!(
            block_size % page_size == 0,
            InvalidParameterSnafu {
                param_name: "block_size",
                reason: format!("must be an exact multiple of page_size ({})", page_size),
            }
        );

        Ok(BufferConfig {
            dest_path: self.dest_path,
            scratch_base_path: self.scratch_base_path,
            max_block_count,
            initial_block_count,
            block_size,
            persist_timeout,
            page_size,
        })
    }
}
