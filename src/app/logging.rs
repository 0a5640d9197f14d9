use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid LOG_LEVEL {0:?}, expected TRACE, DEBUG, INFO, WARN or ERROR")]
    InvalidLevel(String),
    #[error("invalid RUST_LOG filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("logger already installed: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Case-insensitive `LOG_LEVEL` value.
pub fn parse_level(raw: &str) -> Result<LevelFilter, LoggingError> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "TRACE" => Ok(LevelFilter::TRACE),
        "DEBUG" => Ok(LevelFilter::DEBUG),
        "INFO" => Ok(LevelFilter::INFO),
        "WARN" | "WARNING" => Ok(LevelFilter::WARN),
        "ERROR" => Ok(LevelFilter::ERROR),
        _ => Err(LoggingError::InvalidLevel(raw.to_string())),
    }
}

/// JSON lines on stdout. `RUST_LOG`, when set, replaces the level filter.
pub fn init_logging(log_level: &str) -> Result<(), LoggingError> {
    let level = parse_level(log_level)?;
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives)?,
        _ => EnvFilter::default().add_directive(level.into()),
    };

    let stdout_layer = fmt::layer()
        .json()
        .with_writer(std::io::stdout)
        .with_target(true)
        .with_current_span(false)
        .flatten_event(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_case_insensitive() {
        assert_eq!(parse_level("info").unwrap(), LevelFilter::INFO);
        assert_eq!(parse_level("DEBUG").unwrap(), LevelFilter::DEBUG);
        assert_eq!(parse_level(" Warn ").unwrap(), LevelFilter::WARN);
        assert_eq!(parse_level("error").unwrap(), LevelFilter::ERROR);
        assert_eq!(parse_level("trace").unwrap(), LevelFilter::TRACE);
    }

    #[test]
    fn unknown_level_is_rejected() {
        assert!(matches!(parse_level("loud"), Err(LoggingError::InvalidLevel(_))));
    }
}
