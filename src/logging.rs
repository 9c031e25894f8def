//! Tracing subscriber setup for the binary.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::helpers::normalize_variant;
use crate::error::ConfigError;

/// Format for log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-line output.
    Pretty,
    /// One JSON object per event.
    Json,
    /// Single-line output with levels only.
    Compact,
}

impl LogFormat {
    pub(crate) fn parse(value: &str, key: &str) -> Result<Self, ConfigError> {
        match normalize_variant(value).as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            "compact" | "minimal" => Ok(Self::Compact),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected 'pretty', 'json', or 'compact', got '{value}'"),
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
            Self::Compact => "compact",
        }
    }
}

const QUIET_DEPENDENCIES: &[&str] = &["hyper", "hyper_util", "reqwest", "h2", "rustls"];

fn build_filter() -> EnvFilter {
    let base = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    QUIET_DEPENDENCIES
        .iter()
        .filter_map(|target| format!("{target}=warn").parse().ok())
        .fold(base, |filter, directive| filter.add_directive(directive))
}

/// Install the global subscriber. `RUST_LOG` wins over the `info` default;
/// HTTP plumbing crates are held at `warn`.
///
/// Calling this twice is harmless: the second install is ignored.
pub fn init(format: LogFormat) {
    let base = tracing_subscriber::registry().with(build_filter());

    let result = match format {
        LogFormat::Pretty => base
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(false)
                    .with_thread_names(false),
            )
            .try_init(),
        LogFormat::Json => base.with(fmt::layer().json()).try_init(),
        LogFormat::Compact => base
            .with(fmt::layer().with_target(false).with_level(true).compact())
            .try_init(),
    };

    if let Err(e) = result {
        tracing::debug!("tracing subscriber already installed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_formats() {
        assert_eq!(LogFormat::parse("JSON", "K").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::parse("minimal", "K").unwrap(), LogFormat::Compact);
        assert_eq!(LogFormat::parse(" pretty ", "K").unwrap(), LogFormat::Pretty);
        assert!(LogFormat::parse("xml", "K").is_err());
    }

    #[test]
    fn init_twice_does_not_panic() {
        init(LogFormat::Compact);
        init(LogFormat::Json);
    }
}
