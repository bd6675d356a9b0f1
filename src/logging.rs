//! Structured logging setup shared by the library, the CLI, and tests.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs a `tracing_subscriber` formatter driven by `HEARTWOOD_LOG` (falling
/// back to `RUST_LOG`, then `info`). Safe to call more than once; only the
/// first call takes effect.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("HEARTWOOD_LOG")
            .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}
