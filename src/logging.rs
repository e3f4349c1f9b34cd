//! Process-wide log setup.
//!
//! The crate itself only emits `tracing` events; call [`init`] once at
//! startup to get timestamped, leveled output on stderr.

use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber: UTC RFC 3339 timestamps, source location,
/// `RUST_LOG` filtering (default `info`).
///
/// Returns `false` if a global subscriber was already installed; calling it
/// twice is harmless.
pub fn init() -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoUtc::rfc_3339())
        .with_file(true)
        .with_line_number(true)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}
