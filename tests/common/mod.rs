//! Shared test helpers, mirroring `vector_buffers`' `test::helpers` module (a `tracing`
//! subscriber installer used across its own multi-threaded buffer tests).

/// Installs a best-effort `tracing` subscriber so `RUST_LOG`-gated output from the persister
/// thread is visible when a concurrency test is run with `-- --nocapture`. Safe to call from
/// every test: only the first call in the process actually installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
