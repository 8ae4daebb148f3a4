//! Centralised tracing initialisation for Mender binaries.
//!
//! Call [`init_tracing`] once at program start to configure the global
//! subscriber with an `EnvFilter` and optional JSON formatting. Later calls
//! are silently ignored (the global subscriber can only be set once).

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Initialise the global tracing subscriber from the `logging` section.
///
/// `RUST_LOG` takes precedence over `config.level`. An unparseable level
/// falls back to `info`.
pub fn init_tracing(config: &LoggingConfig) {
    init_tracing_with(config.json, &config.level);
}

/// Initialise with explicit settings; used by the CLI flags.
pub fn init_tracing_with(json: bool, level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing(&LoggingConfig::default());
        init_tracing_with(true, "not a level ((");
    }
}
