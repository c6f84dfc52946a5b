//! Tracing setup for the binary.
//!
//! `RUST_LOG` takes precedence over the configured level so individual
//! modules can be turned up without editing the config file, e.g.
//! `RUST_LOG=rust_scope::messaging=trace`.

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Calling this more than once is harmless; later calls are ignored.
pub fn init(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(true);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
