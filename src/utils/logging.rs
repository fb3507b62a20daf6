//! Structured logging setup.
//!
//! Installs a `tracing-subscriber` registry driven by [`LoggingConfig`]:
//! an `EnvFilter` seeded from the configured level (overridable via `RUST_LOG`),
//! plus console and/or file fmt layers, optionally JSON formatted.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Install the global subscriber.
///
/// Returns `Ok(false)` when a global subscriber was already installed, which
/// leaves the existing one in place.
pub fn init_logging(config: &LoggingConfig) -> Result<bool> {
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.log_to_console {
        layers.push(if config.json_format {
            fmt::layer().json().boxed()
        } else {
            fmt::layer().with_target(false).boxed()
        });
    }

    if config.log_to_file {
        let path = config.log_file_path.as_deref().ok_or_else(|| {
            ProtocolError::ConfigError("log_file_path must be set when log_to_file is true".into())
        })?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let writer = Mutex::new(file);
        layers.push(if config.json_format {
            fmt::layer().json().with_writer(writer).boxed()
        } else {
            fmt::layer().with_ansi(false).with_writer(writer).boxed()
        });
    }

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.log_level).into())
        .from_env_lossy();

    let installed = tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .is_ok();

    if installed {
        info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    }
    Ok(installed)
}
