//! Configuration loader and validator for the lead finder.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::usage::UsageLimits;

/// Environment variable that overrides `places.api_key`.
pub const API_KEY_ENV: &str = "PLACES_API_KEY";
/// Environment variable that overrides `store.database_url`.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub places: Places,
    pub store: Store,
    #[serde(default)]
    pub usage: UsageLimits,
    #[serde(default)]
    pub contact: Contact,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Places search API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Places {
    /// May be left empty; searching then fails with a configuration error.
    #[serde(default)]
    pub api_key: String,
    pub endpoint: String,
    pub language: String,
    pub max_results: u32,
}

/// Document store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Store {
    pub database_url: String,
}

/// Outbound contact settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    #[serde(default)]
    pub message: Option<String>,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// API key with the environment override applied.
    pub fn places_api_key(&self) -> String {
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .unwrap_or_else(|| self.places.api_key.clone())
    }

    /// Store URL with the environment override applied.
    pub fn database_url(&self) -> String {
        std::env::var(DATABASE_URL_ENV).unwrap_or_else(|_| self.store.database_url.clone())
    }

    /// Location of the local key/value file.
    pub fn local_storage_path(&self) -> PathBuf {
        Path::new(&self.app.data_dir).join(crate::local::LOCAL_STORAGE_FILE)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Like `load`, but a missing file is `Ok(None)`.
pub fn load_optional(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    load(Some(path)).map(Some)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if reqwest::Url::parse(cfg.places.endpoint.trim()).is_err() {
        return Err(ConfigError::Invalid("places.endpoint must be a valid URL"));
    }
    if cfg.places.language.trim().is_empty() {
        return Err(ConfigError::Invalid("places.language must be non-empty"));
    }
    if cfg.places.max_results == 0 || cfg.places.max_results > crate::places::MAX_RESULT_COUNT {
        return Err(ConfigError::Invalid("places.max_results must be between 1 and 20"));
    }

    if cfg.store.database_url.trim().is_empty() {
        return Err(ConfigError::Invalid("store.database_url must be non-empty"));
    }

    let usage = &cfg.usage;
    if usage.free_tier_limit == 0 {
        return Err(ConfigError::Invalid("usage.free_tier_limit must be > 0"));
    }
    if usage.credit_limit <= usage.free_tier_limit {
        return Err(ConfigError::Invalid("usage.credit_limit must exceed usage.free_tier_limit"));
    }
    if !(usage.cost_per_search_usd >= 0.0) || !(usage.credit_usd >= 0.0) {
        return Err(ConfigError::Invalid("usage costs must be non-negative"));
    }

    if let Some(message) = &cfg.contact.message {
        if message.trim().is_empty() {
            return Err(ConfigError::Invalid("contact.message must be non-empty when set"));
        }
    }

    Ok(())
}

/// Returns the example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

places:
  api_key: "YOUR_GOOGLE_PLACES_API_KEY"
  endpoint: "https://places.googleapis.com/v1/places:searchText"
  language: "en"
  max_results: 20

store:
  database_url: "sqlite://./data/leads.db"

usage:
  free_tier_limit: 5000
  credit_limit: 6250
  cost_per_search_usd: 0.032
  credit_usd: 200.0
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.usage, UsageLimits::default());
        assert!(cfg.contact.message.is_none());
    }

    #[test]
    fn usage_and_contact_sections_are_optional() {
        let yaml = r#"app:
  data_dir: "./data"
places:
  endpoint: "https://places.googleapis.com/v1/places:searchText"
  language: "es"
  max_results: 10
store:
  database_url: "sqlite::memory:"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.places.api_key, "");
        assert_eq!(cfg.usage.free_tier_limit, 5000);
    }

    #[test]
    fn invalid_data_dir() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = " ".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("app.data_dir")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_places_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.places.endpoint = "not a url".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("places.endpoint")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.places.max_results = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.places.max_results = 21;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.places.language = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn empty_api_key_is_not_a_config_error() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.places.api_key = "".into();
        validate(&cfg).unwrap();
    }

    #[test]
    fn invalid_usage_limits() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.usage.credit_limit = cfg.usage.free_tier_limit;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("credit_limit")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.usage.cost_per_search_usd = -1.0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn blank_contact_message_rejected() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.contact.message = Some("  ".into());
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
        assert_eq!(
            cfg.local_storage_path(),
            data_path.join(crate::local::LOCAL_STORAGE_FILE)
        );
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.places.max_results, 20);
        assert_eq!(cfg.store.database_url, "sqlite://./data/leads.db");
    }

    #[test]
    fn optional_load_reads_contact_message() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        assert!(load_optional(&p).unwrap().is_none());

        let yaml = format!("{}contact:\n  message: \"Hola!\"\n", example());
        fs::write(&p, yaml).unwrap();
        let cfg = load_optional(&p).unwrap().unwrap();
        assert_eq!(cfg.contact.message.as_deref(), Some("Hola!"));

        fs::write(&p, "app: [").unwrap();
        assert!(matches!(load_optional(&p), Err(ConfigError::Parse(_))));
    }
}
