//! Tracing subscriber bootstrap

use shardlet_core::{ClusterError, ClusterResult, LoggingConfig};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber described by `config`
///
/// `RUST_LOG` overrides the configured level. Returns `Ok(false)` when a
/// global subscriber is already installed, so calling this twice, or from a
/// host application that set up its own, is harmless.
pub fn init_tracing(config: &LoggingConfig) -> ClusterResult<bool> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.level.to_lowercase()))
        .map_err(|e| ClusterError::Config(format!("invalid log level {}: {}", config.level, e)))?;

    let writer = match &config.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(false)
        .with_ansi(config.file.is_none());

    let installed = match config.format.as_str() {
        "compact" => builder.compact().try_init().is_ok(),
        "text" | "" => builder.try_init().is_ok(),
        other => {
            return Err(ClusterError::Config(format!(
                "unknown log format: {}",
                other
            )))
        }
    };
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            ..LoggingConfig::default()
        };
        // The first call may lose to another test installing a subscriber
        init_tracing(&config).unwrap();
        assert!(!init_tracing(&config).unwrap());
    }

    #[test]
    fn test_unknown_format_rejected() {
        let config = LoggingConfig {
            format: "xml".to_string(),
            ..LoggingConfig::default()
        };
        assert!(matches!(init_tracing(&config), Err(ClusterError::Config(_))));
    }
}
