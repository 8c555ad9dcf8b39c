//! Tracing setup for the dealer.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::DealbookConfig;

/// Install the global subscriber. Logs go to stderr; stdout carries the
/// output stream.
///
/// `RUST_LOG` wins over the configured filter when it is set.
pub fn init(config: &DealbookConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let json = config
        .log_json
        .then(|| fmt::layer().json().with_writer(std::io::stderr));
    let plain = (!config.log_json).then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .init();
}
