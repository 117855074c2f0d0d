//! Tracing initialization for Strata processes.
//!
//! Installs a `tracing_subscriber` registry with an `EnvFilter` and a fmt
//! layer. `RUST_LOG` wins over the configured filter when it is set.

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::TelemetryConfig;

/// Build the filter for `config`, preferring `RUST_LOG` when present.
pub fn env_filter(config: &TelemetryConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.log_filter)
            .with_context(|| format!("Invalid log filter '{}'", config.log_filter)),
    }
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed, which is the
/// normal case inside test binaries that initialise more than once.
pub fn init_tracing(config: &TelemetryConfig) -> Result<bool> {
    let filter = env_filter(config)?;
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .is_ok();
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_rejected() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = TelemetryConfig {
            log_filter: "strata=notalevel".to_string(),
        };
        assert!(env_filter(&config).is_err());
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let config = TelemetryConfig::default();
        assert!(init_tracing(&config).is_ok());
        assert!(!init_tracing(&config).unwrap());
    }
}
