//! Logging setup shared by the `portfwd` binary and anything embedding the engine.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogSettings;

/// Crates whose events are enabled by [`default_filter`].
const LOG_TARGETS: &[&str] = &["portfwd", "portfwd_engine", "portfwd_core"];

/// Build the default filter directive for a level, e.g. `"portfwd_engine=debug,..."`.
pub fn default_filter(level: &str) -> String {
    LOG_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level when set. Returns `false` when a
/// global subscriber was already installed (tests, embedding applications).
pub fn init_tracing(settings: &LogSettings) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(&settings.level)));

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if settings.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_thread_names(true))
            .try_init()
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_covers_every_crate() {
        assert_eq!(
            default_filter("debug"),
            "portfwd=debug,portfwd_engine=debug,portfwd_core=debug"
        );
    }
}
