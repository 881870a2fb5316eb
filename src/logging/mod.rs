//! Structured logging setup built on the tracing crate.

use std::error::Error;

use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

/// Initializes the global tracing subscriber.
///
/// Log level defaults to `info` and can be overridden through
/// `RUST_LOG`. Output goes to stdout for container deployments.
pub fn init_subscriber() -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    Registry::default()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| Box::new(e) as Box<dyn Error>)?;

    Ok(())
}
