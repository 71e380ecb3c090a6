//! Tracing subscriber setup for the gateway binary.
//!
//! `RUST_LOG` wins over the supplied default filter. JSON output is meant for
//! log shippers; the plain format is for terminals.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

/// Build the env filter, falling back to `default_filter` when `RUST_LOG`
/// is unset or unparsable.
fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install the global tracing subscriber.
///
/// * `default_filter` -- directive used when `RUST_LOG` is not set
///   (e.g. `"pusher_gateway=info"`).
/// * `log_json` -- emit one JSON object per event instead of text lines.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(default_filter: &str, log_json: bool) -> Result<()> {
    let registry = tracing_subscriber::registry().with(env_filter(default_filter));
    let installed = if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };
    installed.map_err(|e| Error::Config(format!("tracing already initialised: {e}")))
}
