//! User settings persisted as TOML.
//!
//! Settings are the file layer of configuration: `~/.peanut/config.toml`
//! overrides the defaults here, and env vars override both (see
//! [`crate::config`]). Secrets such as the backend API key never live in
//! this file.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// File-backed settings. Every field has a default so partial files work.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default)]
    pub api: ApiSettings,

    #[serde(default)]
    pub squid: SquidSettings,

    #[serde(default)]
    pub wallet: WalletSettings,

    #[serde(default)]
    pub route: RouteSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Peanut backend API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiSettings {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,

    /// Request timeout in milliseconds.
    #[serde(default = "default_api_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum retry attempts for transport errors, 5xx and 429.
    #[serde(default = "default_api_max_retries")]
    pub max_retries: u32,

    /// Linear backoff step between retries in milliseconds.
    #[serde(default = "default_api_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            timeout_ms: default_api_timeout_ms(),
            max_retries: default_api_max_retries(),
            retry_backoff_ms: default_api_retry_backoff_ms(),
        }
    }
}

fn default_api_base_url() -> String {
    "https://api.peanut.me".to_string()
}

fn default_api_timeout_ms() -> u64 {
    15_000
}

fn default_api_max_retries() -> u32 {
    2
}

fn default_api_retry_backoff_ms() -> u64 {
    300
}

/// Squid route API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SquidSettings {
    #[serde(default = "default_squid_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub integrator_id: Option<String>,
}

impl Default for SquidSettings {
    fn default() -> Self {
        Self {
            base_url: default_squid_base_url(),
            integrator_id: None,
        }
    }
}

fn default_squid_base_url() -> String {
    "https://apiplus.squidrouter.com".to_string()
}

/// The token the smart wallet holds and the chain it lives on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalletSettings {
    #[serde(default = "default_wallet_chain_id")]
    pub chain_id: u64,

    #[serde(default = "default_wallet_token")]
    pub token_address: String,

    #[serde(default = "default_wallet_token_symbol")]
    pub token_symbol: String,

    #[serde(default = "default_wallet_token_decimals")]
    pub token_decimals: u32,
}

impl Default for WalletSettings {
    fn default() -> Self {
        Self {
            chain_id: default_wallet_chain_id(),
            token_address: default_wallet_token(),
            token_symbol: default_wallet_token_symbol(),
            token_decimals: default_wallet_token_decimals(),
        }
    }
}

fn default_wallet_chain_id() -> u64 {
    42161
}

fn default_wallet_token() -> String {
    "0xaf88d065e77c8cC2239327C5EDb3A432268e5831".to_string()
}

fn default_wallet_token_symbol() -> String {
    "USDC".to_string()
}

fn default_wallet_token_decimals() -> u32 {
    6
}

/// Route quoting and expiry timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteSettings {
    /// Refetch a route this many milliseconds before it expires.
    #[serde(default = "default_near_expiry_ms")]
    pub near_expiry_ms: u64,

    /// Expiry watch tick in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Slippage assumed when a quote carries no minimum received amount.
    #[serde(default = "default_slippage_bps")]
    pub default_slippage_bps: u32,

    /// Quotes above this slippage are rejected.
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: u32,
}

impl Default for RouteSettings {
    fn default() -> Self {
        Self {
            near_expiry_ms: default_near_expiry_ms(),
            tick_ms: default_tick_ms(),
            default_slippage_bps: default_slippage_bps(),
            max_slippage_bps: default_max_slippage_bps(),
        }
    }
}

fn default_near_expiry_ms() -> u64 {
    5_000
}

fn default_tick_ms() -> u64 {
    1_000
}

fn default_slippage_bps() -> u32 {
    100
}

fn default_max_slippage_bps() -> u32 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingSettings {
    /// "pretty", "json", or "compact".
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            format: default_log_format(),
        }
    }
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Settings {
    /// Default TOML config file path (~/.peanut/config.toml).
    pub fn default_toml_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".peanut")
            .join("config.toml")
    }

    /// Load settings from a TOML file.
    ///
    /// Returns `None` if the file doesn't exist. Returns an error only
    /// if the file exists but can't be parsed.
    pub fn load_toml(path: &std::path::Path) -> Result<Option<Self>, String> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("failed to read {}: {}", path.display(), e)),
        };

        let settings: Self = toml::from_str(&data)
            .map_err(|e| format!("invalid TOML in {}: {}", path.display(), e))?;
        Ok(Some(settings))
    }

    /// Write the settings as a commented TOML file.
    pub fn save_toml(&self, path: &std::path::Path) -> Result<(), String> {
        let raw = toml::to_string_pretty(self)
            .map_err(|e| format!("failed to serialize settings: {}", e))?;

        let content = format!(
            "# peanut-flows configuration file.\n\
             #\n\
             # Priority: env var > this file > defaults.\n\
             # PEANUT_API_KEY is read from the environment only.\n\
             \n\
             {raw}"
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create {}: {}", parent.display(), e))?;
        }

        std::fs::write(path, content)
            .map_err(|e| format!("failed to write {}: {}", path.display(), e))
    }

    /// Merge values from `other` into `self`, preferring `other` for
    /// fields that differ from the default.
    pub fn merge_from(&mut self, other: &Self) {
        let default_json = match serde_json::to_value(Self::default()) {
            Ok(v) => v,
            Err(_) => return,
        };
        let other_json = match serde_json::to_value(other) {
            Ok(v) => v,
            Err(_) => return,
        };
        let mut self_json = match serde_json::to_value(&*self) {
            Ok(v) => v,
            Err(_) => return,
        };

        merge_non_default(&mut self_json, &other_json, &default_json);

        if let Ok(merged) = serde_json::from_value(self_json) {
            *self = merged;
        }
    }

    /// Flattened `(dotted.path, value)` pairs for display.
    pub fn list(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if let Ok(json) = serde_json::to_value(self) {
            collect_leaves(&json, String::new(), &mut out);
        }
        out
    }
}

fn collect_leaves(value: &serde_json::Value, prefix: String, out: &mut Vec<(String, String)>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                collect_leaves(child, path, out);
            }
        }
        serde_json::Value::String(s) => out.push((prefix, s.clone())),
        serde_json::Value::Null => out.push((prefix, "null".to_string())),
        other => out.push((prefix, other.to_string())),
    }
}

fn merge_non_default(
    target: &mut serde_json::Value,
    other: &serde_json::Value,
    defaults: &serde_json::Value,
) {
    match (target, other, defaults) {
        (
            serde_json::Value::Object(t),
            serde_json::Value::Object(o),
            serde_json::Value::Object(d),
        ) => {
            for (key, other_val) in o {
                let default_val = d.get(key).cloned().unwrap_or(serde_json::Value::Null);
                if let Some(target_val) = t.get_mut(key) {
                    merge_non_default(target_val, other_val, &default_val);
                } else if other_val != &default_val {
                    t.insert(key.clone(), other_val.clone());
                }
            }
        }
        (target, other, defaults) => {
            if other != defaults {
                *target = other.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut settings = Settings::default();
        settings.api.max_retries = 5;
        settings.route.max_slippage_bps = 150;
        settings.squid.integrator_id = Some("peanut-cli".to_string());

        settings.save_toml(&path).unwrap();
        let loaded = Settings::load_toml(&path).unwrap().unwrap();

        assert_eq!(loaded, settings);
    }

    #[test]
    fn toml_missing_file_returns_none() {
        let result = Settings::load_toml(std::path::Path::new("/tmp/nonexistent_peanut.toml"));
        assert!(result.unwrap().is_none());
    }

    #[test]
    fn toml_invalid_content_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not valid toml [[[").unwrap();

        assert!(Settings::load_toml(&path).is_err());
    }

    #[test]
    fn toml_partial_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "[route]\ntick_ms = 250\n").unwrap();

        let loaded = Settings::load_toml(&path).unwrap().unwrap();
        assert_eq!(loaded.route.tick_ms, 250);
        assert_eq!(loaded.route.near_expiry_ms, 5_000);
        assert_eq!(loaded.wallet.chain_id, 42161);
        assert_eq!(loaded.logging.format, "pretty");
    }

    #[test]
    fn merge_only_applies_non_default_fields() {
        let mut base = Settings::default();
        base.api.base_url = "https://staging.peanut.me".to_string();
        base.route.tick_ms = 500;

        let mut overlay = Settings::default();
        overlay.route.tick_ms = 2_000;

        base.merge_from(&overlay);

        assert_eq!(base.api.base_url, "https://staging.peanut.me");
        assert_eq!(base.route.tick_ms, 2_000);
    }

    #[test]
    fn list_flattens_dotted_paths() {
        let listed = Settings::default().list();
        assert!(
            listed
                .iter()
                .any(|(k, v)| k == "wallet.token_symbol" && v == "USDC")
        );
        assert!(
            listed
                .iter()
                .any(|(k, v)| k == "squid.integrator_id" && v == "null")
        );
    }
}
