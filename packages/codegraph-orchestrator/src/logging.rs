//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Filter priority:
//! 1. `CODEGRAPH_LOG` environment variable (`EnvFilter` syntax, e.g.
//!    `codegraph_orchestrator=debug`)
//! 2. the caller's default directive

use tracing_subscriber::EnvFilter;

pub const ENV_LOG: &str = "CODEGRAPH_LOG";

/// Filter from `CODEGRAPH_LOG`, falling back to `default_directive`
pub fn env_filter(default_directive: &str) -> EnvFilter {
    std::env::var(ENV_LOG)
        .ok()
        .and_then(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directive))
}

/// Install the global subscriber (stderr).
///
/// Returns an error if a global subscriber is already set.
pub fn init_logging(default_directive: &str) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_directive))
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))
}
