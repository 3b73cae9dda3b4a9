//! Application configuration.
//!
//! Loaded from process environment (plus an optional `.env` file). Every
//! section has serde defaults, so only credentials are strictly required.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dispatcher::DispatchConfig;
use crate::media::MediaConfig;
use crate::notification::TelegramConfig;
use crate::registry::{DestinationCredential, RegistryConfig};
use crate::transfer::{MIB, TunerConfig};
use crate::utils::graph::GraphConfig;
use crate::{Error, Result};

/// Logging section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub destinations: Vec<DestinationCredential>,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub tuner: TunerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load from the process environment, reading `.env` first when present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut config = Self::default();

        config.telegram.bot_token = get("TELEGRAM_BOT_TOKEN")
            .ok_or_else(|| Error::config("TELEGRAM_BOT_TOKEN is not set"))?;
        config.telegram.default_chat_id = get("TELEGRAM_CHAT_ID");

        config.destinations = destinations_from(&get);

        if let Some(path) = get("FFMPEG_PATH") {
            config.media.ffmpeg_path = path;
        }
        if let Some(path) = get("FFPROBE_PATH") {
            config.media.ffprobe_path = path;
        }
        if let Some(mb) = parse_var::<u64>(&get, "UPLOAD_COMPRESSION_THRESHOLD_MB")? {
            config.media.compression_threshold_bytes =
                scaled(mb, MIB, "UPLOAD_COMPRESSION_THRESHOLD_MB")?;
        }
        if let Some(secs) = parse_var::<u64>(&get, "RETRY_DELAY_SECS")? {
            config.dispatch.retry_delay_ms = scaled(secs, 1000, "RETRY_DELAY_SECS")?;
        }
        if let Some(secs) = parse_var::<u64>(&get, "JOB_COOLDOWN_SECS")? {
            config.dispatch.job_cooldown_ms = scaled(secs, 1000, "JOB_COOLDOWN_SECS")?;
        }
        if let Some(dir) = get("LOG_PATH") {
            config.logging.log_dir = dir;
        }

        Ok(config)
    }
}

/// Collect `FACEBOOK_PAGE_TOKEN_{i}` credentials until the first gap.
fn destinations_from<F>(get: &F) -> Vec<DestinationCredential>
where
    F: Fn(&str) -> Option<String>,
{
    (1u32..)
        .map_while(|i| {
            let access_token = get(&format!("FACEBOOK_PAGE_TOKEN_{i}"))?;
            Some(DestinationCredential {
                index: i,
                access_token,
                credential_group: get(&format!("FACEBOOK_APP_ID_{i}"))
                    .unwrap_or_else(|| format!("app{i}")),
                fallback_remote_id: get(&format!("FACEBOOK_PAGE_ID_{i}")),
                fallback_name: get(&format!("FACEBOOK_PAGE_NAME_{i}")),
            })
        })
        .collect()
}

fn parse_var<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| Error::config(format!("Invalid value for {key}: {e}")))
        })
        .transpose()
}

/// Convert a configured value to base units, rejecting overflow.
fn scaled(value: u64, factor: u64, key: &str) -> Result<u64> {
    value
        .checked_mul(factor)
        .ok_or_else(|| Error::config(format!("Value for {key} is too large: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_bot_token() {
        let err = AppConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(lookup(&[("TELEGRAM_BOT_TOKEN", "t")])).unwrap();
        assert!(config.destinations.is_empty());
        assert_eq!(config.telegram.default_chat_id, None);
        assert_eq!(config.dispatch.retry_count, 1);
        assert_eq!(config.dispatch.retry_delay_ms, 5_000);
        assert_eq!(config.dispatch.job_cooldown_ms, 2_000);
        assert_eq!(config.media.compression_threshold_bytes, 50 * MIB);
        assert_eq!(config.media.ffmpeg_path, "ffmpeg");
        assert_eq!(config.tuner.window_size, 10);
        assert_eq!(config.registry.resolve_delay_ms, 100);
        assert_eq!(config.logging.log_dir, "./logs");
    }

    #[test]
    fn test_destinations_stop_at_first_gap() {
        let config = AppConfig::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("FACEBOOK_PAGE_TOKEN_1", "tok1"),
            ("FACEBOOK_APP_ID_1", "appA"),
            ("FACEBOOK_PAGE_TOKEN_2", "tok2"),
            ("FACEBOOK_PAGE_ID_2", "222"),
            ("FACEBOOK_PAGE_NAME_2", "Second"),
            ("FACEBOOK_PAGE_TOKEN_3", " "),
            ("FACEBOOK_PAGE_TOKEN_4", "tok4"),
        ]))
        .unwrap();

        assert_eq!(config.destinations.len(), 2);
        let first = &config.destinations[0];
        assert_eq!(first.index, 1);
        assert_eq!(first.credential_group, "appA");
        assert_eq!(first.fallback_remote_id, None);

        let second = &config.destinations[1];
        assert_eq!(second.index, 2);
        assert_eq!(second.access_token, "tok2");
        assert_eq!(second.credential_group, "app2");
        assert_eq!(second.fallback_remote_id.as_deref(), Some("222"));
        assert_eq!(second.fallback_name.as_deref(), Some("Second"));
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("TELEGRAM_CHAT_ID", "42"),
            ("FFMPEG_PATH", "/opt/ffmpeg"),
            ("UPLOAD_COMPRESSION_THRESHOLD_MB", "20"),
            ("RETRY_DELAY_SECS", "1"),
            ("JOB_COOLDOWN_SECS", "0"),
            ("LOG_PATH", "/var/log/relay"),
        ]))
        .unwrap();

        assert_eq!(config.telegram.default_chat_id.as_deref(), Some("42"));
        assert_eq!(config.media.ffmpeg_path, "/opt/ffmpeg");
        assert_eq!(config.media.compression_threshold_bytes, 20 * MIB);
        assert_eq!(config.dispatch.retry_delay_ms, 1_000);
        assert_eq!(config.dispatch.job_cooldown_ms, 0);
        assert_eq!(config.logging.log_dir, "/var/log/relay");
    }

    #[test]
    fn test_malformed_number() {
        let err = AppConfig::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("RETRY_DELAY_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("RETRY_DELAY_SECS"));
    }

    #[test]
    fn test_out_of_range_numbers() {
        for key in [
            "UPLOAD_COMPRESSION_THRESHOLD_MB",
            "RETRY_DELAY_SECS",
            "JOB_COOLDOWN_SECS",
        ] {
            let err = AppConfig::from_lookup(lookup(&[
                ("TELEGRAM_BOT_TOKEN", "t"),
                (key, "18446744073709551615"),
            ]))
            .unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{key}");
            assert!(err.to_string().contains(key));
        }
    }

    #[test]
    fn test_debug_hides_credentials() {
        let config = AppConfig::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "BOTSECRET"),
            ("FACEBOOK_PAGE_TOKEN_1", "PAGESECRET"),
        ]))
        .unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("BOTSECRET"));
        assert!(!debug.contains("PAGESECRET"));
    }
}
