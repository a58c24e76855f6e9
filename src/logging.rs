//! Structured logging setup.
//!
//! Events are JSON lines on stderr. `RUST_LOG`, when set to a valid filter,
//! replaces the built-in level selection entirely.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize structured logging on stderr.
///
/// Emits warnings and errors by default, debug events when `verbose` is
/// true. Calling this twice is a no-op.
pub fn init_logging(verbose: bool) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(false)
                .with_span_list(false),
        )
        .with(filter(verbose, rust_log.as_deref()))
        .try_init();
}

fn filter(verbose: bool, rust_log: Option<&str>) -> EnvFilter {
    if let Some(directives) = rust_log.filter(|value| !value.trim().is_empty()) {
        match EnvFilter::try_new(directives) {
            Ok(filter) => return filter,
            Err(e) => eprintln!("ignoring invalid RUST_LOG: {e}"),
        }
    }
    EnvFilter::new(if verbose { "taskdeck=debug" } else { "taskdeck=warn" })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice_does_not_panic() {
        init_logging(false);
        init_logging(true);
    }

    #[test]
    fn test_filter_directive() {
        assert_eq!(filter(true, None).to_string(), "taskdeck=debug");
        assert_eq!(filter(false, None).to_string(), "taskdeck=warn");
    }

    #[test]
    fn test_rust_log_replaces_default_directive() {
        let filter = filter(false, Some("taskdeck=trace")).to_string();
        assert!(filter.contains("taskdeck=trace"));
        assert!(!filter.contains("taskdeck=warn"));
    }

    #[test]
    fn test_blank_or_invalid_rust_log_falls_back() {
        assert_eq!(filter(true, Some("  ")).to_string(), "taskdeck=debug");
        assert_eq!(filter(false, Some("taskdeck=loud")).to_string(), "taskdeck=warn");
    }
}
