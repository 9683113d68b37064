//! Logging setup for rustnn-lower
//!
//! Library code only emits `tracing` events. Binaries call [`init_tracing`] once
//! to install a formatter. `RUSTNN_LOG` takes an EnvFilter directive; when it is
//! unset, RUSTNN_DEBUG=1 or RUSTNN_DEBUG=true turns on debug output.

use std::env;
use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

static DEBUG_ENABLED: OnceLock<bool> = OnceLock::new();

/// Check if debug mode is enabled via RUSTNN_DEBUG environment variable
#[inline]
pub fn debug_enabled() -> bool {
    *DEBUG_ENABLED.get_or_init(|| {
        env::var("RUSTNN_DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    })
}

fn default_directive() -> &'static str {
    if debug_enabled() {
        "rustnn_lower=debug"
    } else {
        "warn"
    }
}

/// Install a stderr fmt subscriber. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("RUSTNN_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_directive()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
