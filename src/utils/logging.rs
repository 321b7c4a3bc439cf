//! Structured logging setup.
//!
//! The engine itself only emits `tracing` events; embedding applications that
//! do not install their own subscriber can call [`init_logging`].

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{NetworkError, Result};

/// Install a global fmt subscriber described by `config`.
///
/// `RUST_LOG` takes precedence over `config.log_level`. Returns an error if a
/// global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string().to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(true);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| NetworkError::Initialization(format!("logging: {e}")))?;
    tracing::info!(app = %config.app_name, "Logging initialized");
    Ok(())
}

/// Like [`init_logging`], but a pre-existing subscriber is not an error.
pub fn try_init_logging(config: &LoggingConfig) -> bool {
    init_logging(config).is_ok()
}
