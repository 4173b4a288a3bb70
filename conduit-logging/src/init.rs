use anyhow::Result;
use conduit_config::domains::logging::LogFormat;
use conduit_config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Initialize logging from configuration
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_logging_from_config(config: &LoggingConfig) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(config))
        .with_target(config.include_target)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Text => builder.try_init(),
    };

    // Use try_init to avoid panic if global subscriber already set
    if installed.is_err() {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Initialize simple tracing for basic console output
pub fn init_simple_tracing(log_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Filter for the configured level and directives
///
/// Falls back to `RUST_LOG`, then to `info`, when the configured
/// expression does not parse.
pub fn build_env_filter(config: &LoggingConfig) -> EnvFilter {
    let expression = config.filter_expression();

    EnvFilter::try_new(&expression)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
