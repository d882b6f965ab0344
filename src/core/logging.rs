//! Tracing subscriber setup
//!
//! The library only emits `tracing` events. Binaries and test harnesses call
//! [`init`] once to route them to stdout; `RUST_LOG` takes precedence over the
//! configured level.

use crate::core::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber described by `config`.
///
/// Returns `false` when a subscriber was already installed, which is the
/// normal case for the second engine in a process.
pub fn init(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pmem_mmio={}", config.level)));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match config.format.as_str() {
        "json" => builder.json().try_init(),
        "compact" => builder.compact().try_init(),
        _ => builder.pretty().try_init(),
    };
    installed.is_ok()
}
