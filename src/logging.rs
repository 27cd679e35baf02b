//! Diagnostic logging setup.
//!
//! Library code logs through `tracing` macros only; the binary installs the
//! subscriber once at startup. Diagnostics go to stderr so they never mix
//! with the progress bar and tables on stdout.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "warn,trapsort=debug"
    } else {
        "warn,trapsort=info"
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the default filter.
///
/// Calling this twice is harmless; the second call leaves the first
/// subscriber in place.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
