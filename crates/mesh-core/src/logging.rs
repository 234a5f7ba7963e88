//! Tracing subscriber setup for binaries and tests embedding the mesh.

use tracing_subscriber::{
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Filter used when `RUST_LOG` is unset or unparsable: warnings from dependencies,
/// `level` from the mesh crates.
fn default_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(format!("warn,mesh_core={level},tests={level}"))
        .unwrap_or_else(|_| EnvFilter::new("warn,mesh_core=info,tests=info"))
}

/// Installs the global subscriber: `RUST_LOG` wins over the configured level, and the
/// format is JSON or pretty.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    if config.format.as_str() == "json" {
        let fmt_layer = tracing_subscriber::fmt::layer().json();
        registry.with(fmt_layer).try_init()
    } else {
        // "pretty" and any other format default to pretty logging
        let fmt_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(false);
        registry.with(fmt_layer).try_init()
    }
}
