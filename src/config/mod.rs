//! Configuration for peanut-flows.
//!
//! Settings are loaded with priority: env var > TOML file > default.
//! `.env` in the working directory is loaded via dotenvy first, so its
//! values count as env vars.

pub(crate) mod helpers;

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::logging::LogFormat;
use crate::payments::types::{ChainId, EvmAddress};
use crate::settings::Settings;

/// Resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub api: ApiConfig,
    pub squid: SquidConfig,
    pub wallet: WalletConfig,
    pub route: RouteConfig,
    pub log_format: LogFormat,
}

/// Peanut backend client settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl ApiConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let base_url = helpers::validate_endpoint(
            "PEANUT_API_URL",
            &helpers::optional_env("PEANUT_API_URL")?
                .unwrap_or_else(|| settings.api.base_url.clone()),
        )?;

        let timeout_ms = helpers::parse_env_or(
            "PEANUT_API_TIMEOUT_MS",
            settings.api.timeout_ms,
            "a positive integer",
        )?;
        if timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PEANUT_API_TIMEOUT_MS".to_string(),
                message: "must be > 0".to_string(),
            });
        }

        let max_retries = helpers::parse_env_or(
            "PEANUT_API_MAX_RETRIES",
            settings.api.max_retries,
            "a non-negative integer",
        )?;

        let retry_backoff_ms = helpers::parse_env_or(
            "PEANUT_API_RETRY_BACKOFF_MS",
            settings.api.retry_backoff_ms,
            "a non-negative integer",
        )?;

        Ok(Self {
            base_url,
            api_key: helpers::optional_env("PEANUT_API_KEY")?.map(SecretString::from),
            timeout: Duration::from_millis(timeout_ms),
            max_retries,
            retry_backoff: Duration::from_millis(retry_backoff_ms),
        })
    }
}

/// Squid route API settings.
#[derive(Debug, Clone)]
pub struct SquidConfig {
    pub base_url: String,
    pub integrator_id: Option<String>,
}

impl SquidConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let base_url = helpers::validate_endpoint(
            "SQUID_API_URL",
            &helpers::optional_env("SQUID_API_URL")?
                .unwrap_or_else(|| settings.squid.base_url.clone()),
        )?;

        Ok(Self {
            base_url,
            integrator_id: helpers::optional_env("SQUID_INTEGRATOR_ID")?
                .or_else(|| settings.squid.integrator_id.clone()),
        })
    }
}

/// The wallet's home chain and token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletConfig {
    pub chain_id: ChainId,
    pub token_address: EvmAddress,
    pub token_symbol: String,
    pub token_decimals: u32,
}

impl WalletConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let chain_id = helpers::parse_env_or(
            "PEANUT_WALLET_CHAIN_ID",
            settings.wallet.chain_id,
            "a positive integer chain id",
        )?;
        if chain_id == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PEANUT_WALLET_CHAIN_ID".to_string(),
                message: "must be > 0".to_string(),
            });
        }

        let raw_token = helpers::optional_env("PEANUT_WALLET_TOKEN")?
            .unwrap_or_else(|| settings.wallet.token_address.clone());
        let token_address =
            EvmAddress::parse(&raw_token).map_err(|e| ConfigError::InvalidValue {
                key: "PEANUT_WALLET_TOKEN".to_string(),
                message: e.to_string(),
            })?;

        let token_decimals = helpers::parse_env_or(
            "PEANUT_WALLET_TOKEN_DECIMALS",
            settings.wallet.token_decimals,
            "an integer between 0 and 18",
        )?;
        if token_decimals > 18 {
            return Err(ConfigError::InvalidValue {
                key: "PEANUT_WALLET_TOKEN_DECIMALS".to_string(),
                message: "must be <= 18".to_string(),
            });
        }

        Ok(Self {
            chain_id: ChainId::new(chain_id),
            token_address,
            token_symbol: helpers::optional_env("PEANUT_WALLET_TOKEN_SYMBOL")?
                .unwrap_or_else(|| settings.wallet.token_symbol.clone()),
            token_decimals,
        })
    }
}

impl Default for WalletConfig {
    fn default() -> Self {
        let defaults = Settings::default().wallet;
        Self {
            chain_id: ChainId::new(defaults.chain_id),
            token_address: EvmAddress::parse(&defaults.token_address)
                .unwrap_or_else(|_| unreachable!("default wallet token is a valid address")),
            token_symbol: defaults.token_symbol,
            token_decimals: defaults.token_decimals,
        }
    }
}

/// Route quoting policy and expiry timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    pub near_expiry_threshold: Duration,
    pub tick_interval: Duration,
    pub default_slippage_bps: u32,
    pub max_slippage_bps: u32,
}

impl Default for RouteConfig {
    fn default() -> Self {
        let defaults = Settings::default().route;
        Self {
            near_expiry_threshold: Duration::from_millis(defaults.near_expiry_ms),
            tick_interval: Duration::from_millis(defaults.tick_ms),
            default_slippage_bps: defaults.default_slippage_bps,
            max_slippage_bps: defaults.max_slippage_bps,
        }
    }
}

impl RouteConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let near_expiry_ms = helpers::parse_env_or(
            "ROUTE_NEAR_EXPIRY_MS",
            settings.route.near_expiry_ms,
            "a non-negative integer",
        )?;

        let tick_ms =
            helpers::parse_env_or("ROUTE_TICK_MS", settings.route.tick_ms, "a positive integer")?;
        if tick_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ROUTE_TICK_MS".to_string(),
                message: "must be > 0".to_string(),
            });
        }

        let max_slippage_bps = helpers::parse_env_or(
            "ROUTE_MAX_SLIPPAGE_BPS",
            settings.route.max_slippage_bps,
            "an integer number of basis points",
        )?;
        if max_slippage_bps > 10_000 {
            return Err(ConfigError::InvalidValue {
                key: "ROUTE_MAX_SLIPPAGE_BPS".to_string(),
                message: "must be <= 10000".to_string(),
            });
        }

        let default_slippage_bps = helpers::parse_env_or(
            "ROUTE_DEFAULT_SLIPPAGE_BPS",
            settings.route.default_slippage_bps,
            "an integer number of basis points",
        )?;
        if default_slippage_bps > max_slippage_bps {
            return Err(ConfigError::InvalidValue {
                key: "ROUTE_DEFAULT_SLIPPAGE_BPS".to_string(),
                message: format!("must not exceed ROUTE_MAX_SLIPPAGE_BPS ({max_slippage_bps})"),
            });
        }

        Ok(Self {
            near_expiry_threshold: Duration::from_millis(near_expiry_ms),
            tick_interval: Duration::from_millis(tick_ms),
            default_slippage_bps,
            max_slippage_bps,
        })
    }
}

impl Config {
    /// Load configuration from env vars and the default TOML file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_toml(None)
    }

    /// Load from env with an optional TOML config file overlay.
    pub fn from_env_with_toml(toml_path: Option<&Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let mut settings = Settings::default();
        Self::apply_toml_overlay(&mut settings, toml_path)?;
        Self::build(&settings)
    }

    /// Load and merge a TOML config file into settings.
    ///
    /// If `explicit_path` is `Some`, loads from that path (errors are fatal).
    /// If `None`, tries `~/.peanut/config.toml` (missing file is ignored).
    fn apply_toml_overlay(
        settings: &mut Settings,
        explicit_path: Option<&Path>,
    ) -> Result<(), ConfigError> {
        let path = explicit_path
            .map(Path::to_path_buf)
            .unwrap_or_else(Settings::default_toml_path);

        match Settings::load_toml(&path) {
            Ok(Some(toml_settings)) => {
                settings.merge_from(&toml_settings);
                tracing::debug!("Loaded TOML config from {}", path.display());
            }
            Ok(None) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
            }
            Err(e) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(format!(
                        "Failed to load config file {}: {}",
                        path.display(),
                        e
                    )));
                }
                tracing::warn!("Failed to load default config file: {}", e);
            }
        }
        Ok(())
    }

    /// Resolve every section from settings plus env overrides.
    pub fn build(settings: &Settings) -> Result<Self, ConfigError> {
        let log_format = LogFormat::parse(
            &helpers::optional_env("PEANUT_LOG_FORMAT")?
                .unwrap_or_else(|| settings.logging.format.clone()),
            "PEANUT_LOG_FORMAT",
        )?;

        Ok(Self {
            api: ApiConfig::resolve(settings)?,
            squid: SquidConfig::resolve(settings)?,
            wallet: WalletConfig::resolve(settings)?,
            route: RouteConfig::resolve(settings)?,
            log_format,
        })
    }

    /// Key/value view with secrets redacted, for `peanut-flows config`.
    pub fn redacted_summary(&self) -> Vec<(&'static str, String)> {
        let secret_state = |set: bool| if set { "[set]" } else { "[unset]" }.to_string();
        vec![
            ("api.base_url", self.api.base_url.clone()),
            ("api.api_key", secret_state(self.api.api_key.is_some())),
            (
                "api.timeout_ms",
                self.api.timeout.as_millis().to_string(),
            ),
            ("api.max_retries", self.api.max_retries.to_string()),
            (
                "api.retry_backoff_ms",
                self.api.retry_backoff.as_millis().to_string(),
            ),
            ("squid.base_url", self.squid.base_url.clone()),
            (
                "squid.integrator_id",
                secret_state(self.squid.integrator_id.is_some()),
            ),
            ("wallet.chain_id", self.wallet.chain_id.to_string()),
            ("wallet.token_address", self.wallet.token_address.to_string()),
            ("wallet.token_symbol", self.wallet.token_symbol.clone()),
            (
                "wallet.token_decimals",
                self.wallet.token_decimals.to_string(),
            ),
            (
                "route.near_expiry_ms",
                self.route.near_expiry_threshold.as_millis().to_string(),
            ),
            (
                "route.tick_ms",
                self.route.tick_interval.as_millis().to_string(),
            ),
            (
                "route.default_slippage_bps",
                self.route.default_slippage_bps.to_string(),
            ),
            (
                "route.max_slippage_bps",
                self.route.max_slippage_bps.to_string(),
            ),
            ("logging.format", self.log_format.as_str().to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const KEYS: &[&str] = &[
        "PEANUT_API_URL",
        "PEANUT_API_KEY",
        "PEANUT_API_TIMEOUT_MS",
        "PEANUT_API_MAX_RETRIES",
        "PEANUT_API_RETRY_BACKOFF_MS",
        "SQUID_API_URL",
        "SQUID_INTEGRATOR_ID",
        "PEANUT_WALLET_CHAIN_ID",
        "PEANUT_WALLET_TOKEN",
        "PEANUT_WALLET_TOKEN_SYMBOL",
        "PEANUT_WALLET_TOKEN_DECIMALS",
        "ROUTE_NEAR_EXPIRY_MS",
        "ROUTE_TICK_MS",
        "ROUTE_DEFAULT_SLIPPAGE_BPS",
        "ROUTE_MAX_SLIPPAGE_BPS",
        "PEANUT_LOG_FORMAT",
    ];

    fn clear_env() {
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            for key in KEYS {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn resolves_safe_defaults() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        let config = Config::build(&Settings::default()).expect("default config");
        assert_eq!(config.api.base_url, "https://api.peanut.me");
        assert!(config.api.api_key.is_none());
        assert_eq!(config.api.timeout, Duration::from_secs(15));
        assert_eq!(config.wallet, WalletConfig::default());
        assert_eq!(config.route, RouteConfig::default());
        assert_eq!(config.route.near_expiry_threshold, Duration::from_secs(5));
        assert_eq!(config.route.tick_interval, Duration::from_secs(1));
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn env_overrides_toml_which_overrides_defaults() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[route]\ntick_ms = 250\nmax_slippage_bps = 200\n\n[api]\nmax_retries = 7\n",
        )
        .unwrap();

        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("ROUTE_TICK_MS", "100");
            std::env::set_var("PEANUT_API_KEY", "sk-test");
            std::env::set_var("PEANUT_LOG_FORMAT", "json");
        }

        let config = Config::from_env_with_toml(Some(&path)).expect("config");
        assert_eq!(config.route.tick_interval, Duration::from_millis(100));
        assert_eq!(config.route.max_slippage_bps, 200);
        assert_eq!(config.api.max_retries, 7);
        assert!(config.api.api_key.is_some());
        assert_eq!(config.log_format, LogFormat::Json);

        let summary = config.redacted_summary();
        assert!(summary.iter().all(|(_, v)| !v.contains("sk-test")));

        clear_env();
    }

    #[test]
    fn rejects_invalid_values() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        let cases = [
            ("PEANUT_API_URL", "http://api.peanut.me"),
            ("PEANUT_API_TIMEOUT_MS", "0"),
            ("PEANUT_WALLET_TOKEN", "0x1234"),
            ("ROUTE_TICK_MS", "soon"),
            ("ROUTE_DEFAULT_SLIPPAGE_BPS", "5000"),
            ("PEANUT_LOG_FORMAT", "xml"),
        ];

        for (key, value) in cases {
            // SAFETY: Guarded by ENV_MUTEX in tests.
            unsafe {
                std::env::set_var(key, value);
            }
            match Config::build(&Settings::default()) {
                Err(ConfigError::InvalidValue { key: got, .. }) => assert_eq!(got, key),
                other => panic!("expected InvalidValue for {key}, got {other:?}"),
            }
            clear_env();
        }
    }

    #[test]
    fn explicit_missing_toml_is_fatal() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        let err = Config::from_env_with_toml(Some(Path::new("/tmp/peanut-missing.toml")))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}
