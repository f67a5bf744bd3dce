//! `tracing` subscriber setup shared by the C ABI and the CLI.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "PLAYAUDIO_LOG";

const DEFAULT_FILTER: &str = "playaudio=info,compskyplayaudio=info";

/// Build the filter from `PLAYAUDIO_LOG`, then `RUST_LOG`, then the default.
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| DEFAULT_FILTER.into())
}

/// Install a stderr subscriber unless the process already has one.
///
/// Returns true if this call installed it.
pub fn init() -> bool {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_noop() {
        init();
        assert!(!init());
    }
}
