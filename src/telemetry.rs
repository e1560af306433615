//! Logging setup for the binary.

use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber once. `RUST_LOG` wins over `verbose`.
pub fn init_logging(verbose: bool) {
    INIT.get_or_init(|| {
        let default_level = if verbose { "debug" } else { "info" };
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        let installed = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_thread_names(true))
            .try_init();
        if let Err(err) = installed {
            eprintln!("logging already initialised elsewhere: {err}");
        }
    });
}
