use tracing_subscriber::EnvFilter;

/// Output format of the fmt subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    /// Parse `"json"` / `"pretty"` (case-insensitive); anything else is pretty.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

const DEFAULT_FILTER: &str = "info,sqlx=warn";

/// Initialise the global `tracing` subscriber with a pretty fmt layer.
///
/// Respects `RUST_LOG`, falling back to `info,sqlx=warn`.
/// Call this once, at the very start of `main`.
pub fn init_tracing() {
    init_tracing_with(LogFormat::Pretty);
}

/// Initialise the global subscriber with the given output format.
///
/// A second call is ignored rather than panicking, so tests and embedding
/// applications may both call it.
pub fn init_tracing_with(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let result = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_log_format() {
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("unknown"), LogFormat::Pretty);
    }

    #[test]
    fn init_is_idempotent() {
        init_tracing();
        init_tracing_with(LogFormat::Json);
    }
}
