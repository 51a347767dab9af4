//! Shared tracing/logging initialization.
//!
//! The pool installs this default subscriber when its `log` config toggle is
//! set; library consumers with their own subscriber call nothing and the
//! engine's spans flow into it instead.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"shellpool=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
///
/// Returns `false` when a global subscriber was already installed; safe to
/// call more than once.
pub fn init_tracing(default_filter: &str, log_json: bool) -> bool {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .is_ok()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::init_tracing;

    #[test]
    fn repeated_init_is_harmless() {
        // Whichever call wins the race to install the subscriber, the second
        // must report `false` rather than panic.
        let first = init_tracing("shellpool=info", false);
        let second = init_tracing("shellpool=debug", true);
        assert!(!(first && second));
    }
}
