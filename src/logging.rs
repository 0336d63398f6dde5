//! Logging initialisation for the `vsforge` binary.
//!
//! The filter comes from `VSFORGE_LOG`, then `RUST_LOG`, then defaults to
//! `info`. Output goes to stderr, as JSON lines when requested. Records from
//! the `log` facade (the vSphere crate logs that way) are bridged into the
//! same subscriber.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_ENV: &str = "VSFORGE_LOG";

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialise the global subscriber. Call once from `main`.
pub fn init(json: bool) {
    let json = json || cfg!(feature = "logs-json");
    let registry = tracing_subscriber::registry().with(filter());
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
