//! Tracing initialisation.

use std::sync::Once;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: Once = Once::new();

/// Configure the tracing subscriber: compact stdout output, filtered by
/// `RUST_LOG` (default `info`). Safe to call more than once.
pub fn init_tracing() {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let stdout_layer = fmt::layer().with_target(false).compact();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stdout_layer)
            .init();
    });
}
