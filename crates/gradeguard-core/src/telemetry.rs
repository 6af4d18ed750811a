//! Tracing initialisation for GradeGuard binaries.
//!
//! Filtering honours `GRADEGUARD_LOG`, then `RUST_LOG`, then the level passed
//! by the caller. Only the first call in a process installs a subscriber.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable with GradeGuard-specific filter directives.
pub const LOG_ENV: &str = "GRADEGUARD_LOG";

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Install the global subscriber, writing to stderr so stdout stays
/// machine-readable. `json` switches to newline-delimited JSON lines.
///
/// Returns `false` if a subscriber was already installed.
pub fn init_tracing(json: bool, level: Level) -> bool {
    let registry = tracing_subscriber::registry().with(env_filter(level));
    let installed = if json {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).json())
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init()
    };
    installed.is_ok()
}
