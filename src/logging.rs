// 📝 Logging - tracing subscriber for the binaries
//
// RUST_LOG wins over the configured level. Library code only emits events.

use tracing_subscriber::EnvFilter;

/// Filter from RUST_LOG, else `level` for this crate and `warn` elsewhere
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,erp_sync={level},erp_sync_server={level}")))
}

/// Install the global subscriber; a second call is a no-op
pub fn init_logging(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(false)
        .try_init();
}
