//! wardgate/src/logging.rs
//! Logging initialization.

use std::sync::Once;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter::EnvFilter, fmt};

static LOG_INIT: Once = Once::new();

// Initialize logging once; RUST_LOG overrides the default filter.
pub fn init(default: &str) {
    LOG_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer());
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
