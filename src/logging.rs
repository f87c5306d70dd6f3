//! Tracing subscriber bootstrap.

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `directive` follows `RUST_LOG` syntax (e.g. `"info"` or
/// `"nearfield_scanner=debug"`); an explicit `RUST_LOG` in the environment
/// wins. Calling this twice is harmless; the second install is ignored.
pub fn init(directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directive.to_string()));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
