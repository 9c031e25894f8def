use std::str::FromStr;

use crate::error::ConfigError;

/// Read an env var, treating unset and blank values alike.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => {
            let value = normalize_env_value(&raw);
            if value.is_empty() {
                Ok(None)
            } else {
                Ok(Some(value))
            }
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "value is not valid UTF-8".to_string(),
        }),
    }
}

/// Parse an optional env var into `T`, falling back to `default`.
pub(crate) fn parse_env_or<T>(key: &str, default: T, expected: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| s.parse::<T>())
        .transpose()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be {expected}: {e}"),
        })
        .map(|parsed| parsed.unwrap_or(default))
}

pub(crate) fn normalize_variant(value: &str) -> String {
    value.trim().to_ascii_lowercase().replace(['-', ' '], "_")
}

fn normalize_env_value(raw: &str) -> String {
    let trimmed = raw.trim();
    let maybe_unquoted = trimmed
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .or_else(|| {
            trimmed
                .strip_prefix('\'')
                .and_then(|inner| inner.strip_suffix('\''))
        })
        .unwrap_or(trimmed);
    maybe_unquoted.trim().to_string()
}

const LOCAL_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1"];

/// Endpoints must be https, except plain http to a loopback host, and may
/// not carry userinfo. Returns the URL without a trailing slash.
pub(crate) fn validate_endpoint(key: &str, endpoint_url: &str) -> Result<String, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: key.to_string(),
        message,
    };

    let parsed =
        url::Url::parse(endpoint_url).map_err(|e| invalid(format!("URL parse failed: {e}")))?;

    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(invalid(
            "URL contains userinfo (@), which is not allowed".to_string(),
        ));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| invalid("URL is missing host".to_string()))?
        .trim_matches(['[', ']'])
        .to_ascii_lowercase();

    match parsed.scheme() {
        "https" => {}
        "http" if LOCAL_HOSTS.contains(&host.as_str()) => {}
        other => {
            return Err(invalid(format!(
                "scheme '{other}' is not allowed for host '{host}' (https required)"
            )));
        }
    }

    Ok(endpoint_url.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_quoted_values() {
        assert_eq!(normalize_env_value("  \"abc\" "), "abc");
        assert_eq!(normalize_env_value("'x y'"), "x y");
        assert_eq!(normalize_env_value("plain"), "plain");
    }

    #[test]
    fn normalizes_variants() {
        assert_eq!(normalize_variant(" Pretty-JSON "), "pretty_json");
    }

    #[test]
    fn endpoint_validation_rules() {
        assert_eq!(
            validate_endpoint("K", "https://api.peanut.me/").unwrap(),
            "https://api.peanut.me"
        );
        assert!(validate_endpoint("K", "http://localhost:8080").is_ok());
        assert!(validate_endpoint("K", "http://127.0.0.1:5000/api").is_ok());
        assert!(validate_endpoint("K", "http://api.peanut.me").is_err());
        assert!(validate_endpoint("K", "https://user:pw@api.peanut.me").is_err());
        assert!(validate_endpoint("K", "ftp://api.peanut.me").is_err());
        assert!(validate_endpoint("K", "not a url").is_err());
    }
}
