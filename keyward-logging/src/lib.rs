//! Structured logging setup for Keyward services

use tracing::Span;
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// `RUST_LOG` if set and valid, otherwise `default_level`
fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize JSON logging for a Keyward service.
///
/// Every line carries the enclosing span's fields, so running the service
/// inside [`service_span`] tags all of its output with the service name and
/// version.
pub fn init_logging(service_name: &str, default_level: &str) {
    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_current_span(true)
                .with_span_list(false),
        )
        .init();

    tracing::info!(
        service = service_name,
        format = "json",
        "Logging initialized"
    );
}

/// Console logging for running a service by hand
pub fn init_console_logging(service_name: &str, default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_target(true)
        .init();

    tracing::info!(
        service = service_name,
        format = "console",
        "Logging initialized"
    );
}

/// Root span for everything a service logs
pub fn service_span(service_name: &str, version: &str) -> Span {
    tracing::info_span!("service", service = service_name, version = version)
}

/// Console logging for tests; safe to call from every test
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter("warn"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_test_init_is_harmless() {
        init_test_logging();
        init_test_logging();
    }
}
