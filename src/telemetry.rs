//! Thin `tracing` setup helper.
//!
//! Library code never installs a global subscriber itself; this exists for
//! the `demos/` binary and for callers that want a quick default. Tests
//! should prefer `tracing_subscriber::fmt().with_test_writer().try_init()`.

use tracing_subscriber::EnvFilter;

/// Installs a `tracing_subscriber::fmt` subscriber reading `RUST_LOG`
/// (falling back to `info`). Safe to call more than once; subsequent calls
/// are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
