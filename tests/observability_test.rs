#[cfg(test)]
mod test {
    use resilient_pool::observability::{init_tracing, LogFormat, LOG_FORMAT_ENV};

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
        tracing::info!(event = "test", "subscriber installed once");
    }

    #[test]
    fn test_log_format_from_env_defaults_to_compact() {
        if std::env::var(LOG_FORMAT_ENV).is_err() {
            assert_eq!(LogFormat::from_env(), LogFormat::Compact);
        }
    }
}
