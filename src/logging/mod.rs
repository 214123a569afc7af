use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

/// Level resolution order: explicit override, then the configured level.
/// An empty override falls back to the config.
fn effective_level<'a>(config: &'a LoggingConfig, override_level: Option<&'a str>) -> &'a str {
    match override_level {
        Some(level) if !level.is_empty() => level,
        _ => &config.level,
    }
}

/// Install the global subscriber. `RUST_LOG`, when set, wins over both the
/// configured level and the override.
pub fn init_logging(config: &LoggingConfig, override_level: Option<&str>) {
    let level = effective_level(config, override_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &config.format {
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(filter)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().json())
                .with(filter)
                .init();
        }
        LogFormat::Compact => {
            tracing_subscriber::fmt()
                .compact()
                .with_env_filter(filter)
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(level: &str) -> LoggingConfig {
        LoggingConfig {
            level: level.to_string(),
            format: LogFormat::Compact,
        }
    }

    #[test]
    fn configured_level_applies_without_override() {
        assert_eq!(effective_level(&config("debug"), None), "debug");
    }

    #[test]
    fn override_beats_configured_level() {
        assert_eq!(effective_level(&config("debug"), Some("trace")), "trace");
    }

    #[test]
    fn empty_override_falls_back_to_config() {
        assert_eq!(effective_level(&config("warn"), Some("")), "warn");
    }
}
