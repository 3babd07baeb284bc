//! Process-wide tracing initialization.

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// The filter comes from the `HAWSER_LOG` environment variable when set,
/// falling back to `default_filter` (for example `"info"` or
/// `"info,hawser_server=debug"`). Calling this more than once is harmless;
/// later calls are no-ops.
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_env("HAWSER_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
