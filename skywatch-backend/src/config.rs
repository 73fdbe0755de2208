use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use crate::model::sat::{FetchPolicy, RefreshSettings};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_elements_url")]
    pub elements_url: String,

    /// OMM XML with names, designators and epochs; skipped when unset
    #[serde(default = "default_metadata_url")]
    pub metadata_url: Option<String>,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub retry_delay_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_elements_url() -> String {
    "https://celestrak.org/NORAD/elements/gp.php?GROUP=active&FORMAT=tle".to_string()
}

fn default_metadata_url() -> Option<String> {
    Some("https://celestrak.org/NORAD/elements/gp.php?GROUP=active&FORMAT=xml".to_string())
}

fn default_max_attempts() -> u32 {
    5
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            elements_url: default_elements_url(),
            metadata_url: default_metadata_url(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: 0,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl CatalogConfig {
    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            max_attempts: self.max_attempts.max(1),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn refresh_settings(&self) -> RefreshSettings {
        RefreshSettings {
            elements_url: self.elements_url.clone(),
            metadata_url: self.metadata_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_ttl_hours() -> i64 {
    24
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            ttl_hours: default_ttl_hours(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.ttl_hours)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// How often the TTL is rechecked
    #[serde(default = "default_interval_secs")]
    pub refresh_check_interval_secs: u64,

    /// How often positions are recomputed for the current filter
    #[serde(default = "default_interval_secs")]
    pub position_update_interval_secs: u64,

    #[serde(default = "default_perform_initial_update")]
    pub perform_initial_update: bool,
}

fn default_interval_secs() -> u64 {
    15
}

fn default_perform_initial_update() -> bool {
    true
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            refresh_check_interval_secs: default_interval_secs(),
            position_update_interval_secs: default_interval_secs(),
            perform_initial_update: default_perform_initial_update(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropagationConfig {
    /// Skip objects whose elements are older than this many days
    #[serde(default)]
    pub max_element_age_days: Option<i64>,
}

impl PropagationConfig {
    pub fn max_element_age(&self) -> Option<chrono::Duration> {
        self.max_element_age_days.map(chrono::Duration::days)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkywatchConfig {
    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub propagation: PropagationConfig,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl Default for SkywatchConfig {
    fn default() -> Self {
        Self {
            catalog: CatalogConfig::default(),
            cache: CacheConfig::default(),
            schedule: ScheduleConfig::default(),
            propagation: PropagationConfig::default(),
            log_level: default_log_level(),
            log_dir: default_log_dir(),
        }
    }
}

impl SkywatchConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: SkywatchConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }
}

pub static CONFIG: OnceLock<SkywatchConfig> = OnceLock::new();

/// Load `path` into [`CONFIG`], falling back to defaults when the file does
/// not exist. A file that exists but does not parse is an error.
pub fn read_config<P: AsRef<Path>>(path: P) -> anyhow::Result<&'static SkywatchConfig> {
    let path = path.as_ref();
    let config = if path.exists() {
        SkywatchConfig::from_file(path)?
    } else {
        SkywatchConfig::default()
    };

    if CONFIG.set(config).is_err() {
        anyhow::bail!("Configuration has already been loaded");
    }
    CONFIG.get().context("Configuration missing after load")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: SkywatchConfig = toml::from_str("").unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_dir, "logs");
        assert_eq!(config.cache.data_dir, "data");
        assert_eq!(config.cache.ttl(), chrono::Duration::hours(24));
        assert_eq!(config.catalog.max_attempts, 5);
        assert_eq!(config.catalog.retry_delay_ms, 0);
        assert!(config.catalog.metadata_url.is_some());
        assert_eq!(config.schedule.refresh_check_interval_secs, 15);
        assert_eq!(config.schedule.position_update_interval_secs, 15);
        assert!(config.schedule.perform_initial_update);
        assert_eq!(config.propagation.max_element_age(), None);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config: SkywatchConfig = toml::from_str(
            r#"
            log_level = "debug"

            [catalog]
            elements_url = "http://localhost/tle"
            max_attempts = 2
            retry_delay_ms = 250

            [propagation]
            max_element_age_days = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.catalog.elements_url, "http://localhost/tle");
        assert_eq!(config.catalog.request_timeout_secs, 60);

        let policy = config.catalog.fetch_policy();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.retry_delay, Duration::from_millis(250));
        assert_eq!(
            config.propagation.max_element_age(),
            Some(chrono::Duration::days(30))
        );
        assert_eq!(config.cache.ttl_hours, 24);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[cache]\nttl_hours = 6\ndata_dir = \"/var/lib/skywatch\"").unwrap();

        let config = SkywatchConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cache.ttl_hours, 6);
        assert_eq!(config.cache.data_dir, "/var/lib/skywatch");

        assert!(SkywatchConfig::from_file("/nonexistent/skywatch.toml").is_err());
    }
}
