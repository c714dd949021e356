//! On-disk JSON configuration (§6), deserialized and validated once at
//! startup. A direct `serde_json::from_reader` is sufficient here — no
//! layering beyond the single file — but every field is typed, matching
//! the rest of the core.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::catalog::Mode;
use crate::error::ConfigError;
use crate::feed::gtfs_rt::ApiKeyMethod;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GtfsConfig {
    pub refresh_interval_days: i64,
    pub archives_prefix: String,
    pub archives_filename: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GtfsRtConfig {
    pub feed_url: String,
    pub api_key: Option<String>,
    pub api_key_method: ApiKeyMethod,
    #[serde(default = "default_api_key_param_name")]
    pub api_key_param_name: String,
    #[serde(default = "default_polling_interval")]
    pub polling_interval: u64,
}

fn default_api_key_param_name() -> String {
    "X-API-KEY".to_string()
}

fn default_polling_interval() -> u64 {
    10
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SseConfig {
    pub url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_param_name")]
    pub api_key_header: String,
}

fn default_file_retention_days() -> u32 {
    180
}

fn default_modes() -> Vec<Mode> {
    vec![Mode::Rapid, Mode::Cr, Mode::Bus]
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AppConfig {
    pub agency: String,
    #[serde(default = "default_modes")]
    pub modes: Vec<Mode>,
    pub gtfs: GtfsConfig,
    pub use_gtfs_rt: bool,
    pub gtfs_rt: Option<GtfsRtConfig>,
    pub sse: Option<SseConfig>,
    #[serde(default = "default_file_retention_days")]
    pub file_retention_days: u32,
    #[serde(default)]
    pub datadog_trace_enabled: bool,
    pub data_root: PathBuf,
}

/// Thin marker wrapping [`ConfigError`] so the CLI's exit-code mapper can
/// distinguish "bad config" (exit 1) from any other fatal runtime error
/// (exit 2) after both have been flattened into an `anyhow::Error` chain.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct AppConfigLoadError(pub ConfigError);

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path)?;
        let config: AppConfig = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the cross-field requirements spec.md §6 states as "required
    /// keys when": `use_gtfs_rt` selects which of `gtfs_rt`/`sse` is
    /// mandatory, and a non-`none` auth method needs an API key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agency.trim().is_empty() {
            return Err(ConfigError::MissingKey("agency".to_string()));
        }

        if self.use_gtfs_rt {
            let gtfs_rt = self
                .gtfs_rt
                .as_ref()
                .ok_or_else(|| ConfigError::MissingKey("gtfs_rt".to_string()))?;
            if gtfs_rt.api_key_method != ApiKeyMethod::None && gtfs_rt.api_key.is_none() {
                return Err(ConfigError::InvalidValue {
                    key: "gtfs_rt.api_key".to_string(),
                    reason: "required when gtfs_rt.api_key_method is not \"none\"".to_string(),
                });
            }
        } else if self.sse.is_none() {
            return Err(ConfigError::MissingKey("sse".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json(use_gtfs_rt: bool) -> String {
        let transport = if use_gtfs_rt {
            r#""use_gtfs_rt": true, "gtfs_rt": {"feed_url": "https://example.com/feed", "api_key": null, "api_key_method": "none"}"#
        } else {
            r#""use_gtfs_rt": false, "sse": {"url": "https://example.com/sse", "api_key": null}"#
        };
        format!(
            r#"{{
                "agency": "mbta",
                "modes": ["rapid"],
                "gtfs": {{"refresh_interval_days": 30, "archives_prefix": "https://cdn.example.com", "archives_filename": "archived_feeds.txt"}},
                {transport},
                "data_root": "/var/lib/gobbler"
            }}"#
        )
    }

    #[test]
    fn deserializes_and_validates_a_gtfs_rt_config() {
        let config: AppConfig = serde_json::from_str(&minimal_json(true)).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.file_retention_days, 180);
    }

    #[test]
    fn deserializes_and_validates_an_sse_config() {
        let config: AppConfig = serde_json::from_str(&minimal_json(false)).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn gtfs_rt_selected_without_section_fails_validation() {
        let json = r#"{
            "agency": "mbta",
            "gtfs": {"refresh_interval_days": 30, "archives_prefix": "x", "archives_filename": "y"},
            "use_gtfs_rt": true,
            "data_root": "/tmp"
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::MissingKey(_))));
    }

    #[test]
    fn non_none_auth_method_without_api_key_fails_validation() {
        let json = r#"{
            "agency": "mbta",
            "gtfs": {"refresh_interval_days": 30, "archives_prefix": "x", "archives_filename": "y"},
            "use_gtfs_rt": true,
            "gtfs_rt": {"feed_url": "https://example.com", "api_key": null, "api_key_method": "bearer"},
            "data_root": "/tmp"
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));
    }
}
