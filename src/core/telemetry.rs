//! Structured logging setup for the `cairn` binary.
//!
//! Library code only emits `tracing` events; installing a subscriber is left to binaries and
//! tests.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, e.g. `CAIRN_LOG=cairn=debug`.
pub const LOG_ENV: &str = "CAIRN_LOG";
pub const DEFAULT_FILTER: &str = "warn";

/// Filter from `CAIRN_LOG`, raised to `debug` for `cairn` when `verbose`.
pub fn env_filter(verbose: bool) -> EnvFilter {
    let base = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if verbose {
        match "cairn=debug".parse() {
            Ok(directive) => base.add_directive(directive),
            Err(_) => base,
        }
    } else {
        base
    }
}

/// Install a stderr subscriber. A second call is a no-op.
pub fn init(verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
