//! Integration tests for logging system

use core_runtime::logging::{init_logging, redact_url, LogFormat, LogLevel, LoggingConfig};
use core_runtime::Error;

#[test]
fn test_logging_initializes_once() {
    // A process can install only one global subscriber, so both calls live here.
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Debug)
        .with_spans(false);

    assert!(init_logging(config.clone()).is_ok());
    tracing::info!(url = %redact_url("https://cdn.example.com/a.flac?sig=1"), "stream opened");

    let second = init_logging(config);
    assert!(matches!(second, Err(Error::Config(_))));
}

#[test]
fn test_invalid_custom_filter_is_rejected_before_install() {
    let config = LoggingConfig::default().with_filter("core_playback=loud");
    assert!(matches!(init_logging(config), Err(Error::Config(_))));
}
