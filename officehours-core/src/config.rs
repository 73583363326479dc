// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Engine policy (multi-queue, auto-clear, periodic updates), storage, and metrics settings
use crate::paths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Whether one student may wait in several queues at once
    #[serde(default = "default_true")]
    pub allow_multi_queue: bool,
    /// Interval between periodic queue updates sent to extensions
    #[serde(default = "default_periodic_update_secs")]
    pub periodic_update_secs: u64,
    /// Auto-clear timeout applied to newly created queues
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_auto_clear_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            allow_multi_queue: true,
            periodic_update_secs: default_periodic_update_secs(),
            default_auto_clear_secs: None,
        }
    }
}

impl EngineConfig {
    pub fn periodic_update_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_update_secs)
    }

    pub fn default_auto_clear(&self) -> Option<Duration> {
        self.default_auto_clear_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Address for the Prometheus scrape endpoint, e.g. "127.0.0.1:9000"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_addr: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_periodic_update_secs() -> u64 {
    900 // 15 minutes
}

fn default_db_path() -> String {
    paths::database_file().to_string_lossy().to_string()
}

/// Expand tilde (~) to home directory in paths
fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(base_dirs) = directories::BaseDirs::new() {
            return base_dirs
                .home_dir()
                .join(stripped)
                .to_string_lossy()
                .to_string();
        }
        tracing::warn!(
            path = %path,
            "Failed to expand tilde in path: could not determine home directory"
        );
    }
    path.to_string()
}

fn parse_bool(name: &str, val: &str) -> Result<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("{} must be a boolean, got: {}", name, val),
    }
}

impl Config {
    /// Find the config file, checking in order:
    /// 1. OFFICEHOURS_CONFIG_PATH env var (if set)
    /// 2. ./config.toml
    /// 3. ~/.config/officehours/config.toml
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("OFFICEHOURS_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
        }

        let local_config = PathBuf::from("config.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let xdg_config = paths::config_file();
        if xdg_config.exists() {
            return Some(xdg_config);
        }

        None
    }

    /// Load configuration from the first config file found, then apply
    /// environment overrides and validate
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_config_file() {
            Some(path) => {
                tracing::info!(path = %path.display(), "Loading configuration from file");
                Self::from_file(&path)?
            }
            None => {
                tracing::info!("No config file found, using environment variables and defaults");
                Config::default()
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.storage.db_path = expand_tilde(&config.storage.db_path);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str::<Config>(content)?)
    }

    /// Apply overrides from an environment lookup function
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("OFFICEHOURS_ALLOW_MULTI_QUEUE") {
            self.engine.allow_multi_queue = parse_bool("OFFICEHOURS_ALLOW_MULTI_QUEUE", &val)?;
        }
        if let Some(val) = lookup("OFFICEHOURS_PERIODIC_UPDATE_SECS") {
            self.engine.periodic_update_secs = val.parse().with_context(|| {
                format!(
                    "OFFICEHOURS_PERIODIC_UPDATE_SECS must be a valid number, got: {}",
                    val
                )
            })?;
        }
        if let Some(val) = lookup("OFFICEHOURS_AUTO_CLEAR_SECS") {
            self.engine.default_auto_clear_secs = if val.trim().is_empty() {
                None
            } else {
                Some(val.parse().with_context(|| {
                    format!("OFFICEHOURS_AUTO_CLEAR_SECS must be a valid number, got: {}", val)
                })?)
            };
        }
        if let Some(val) = lookup("OFFICEHOURS_DB_PATH") {
            self.storage.db_path = val;
        }
        if let Some(val) = lookup("OFFICEHOURS_METRICS_ADDR") {
            self.metrics.listen_addr = Some(val);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.periodic_update_secs == 0 {
            anyhow::bail!("engine.periodic_update_secs must be greater than zero");
        }
        if self.engine.default_auto_clear_secs == Some(0) {
            anyhow::bail!("engine.default_auto_clear_secs must be greater than zero when set");
        }
        if self.storage.db_path.trim().is_empty() {
            anyhow::bail!("storage.db_path must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert!(config.engine.allow_multi_queue);
        assert_eq!(config.engine.periodic_update_secs, 900);
        assert!(config.engine.default_auto_clear_secs.is_none());
        assert!(config.storage.db_path.ends_with("officehours.db"));
        assert!(config.metrics.listen_addr.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_full_config_deserialize() {
        let toml = r#"
            [engine]
            allow_multi_queue = false
            periodic_update_secs = 60
            default_auto_clear_secs = 3600

            [storage]
            db_path = "/tmp/oh.db"

            [metrics]
            listen_addr = "127.0.0.1:9000"
        "#;
        let config = Config::from_toml_str(toml).unwrap();
        assert!(!config.engine.allow_multi_queue);
        assert_eq!(
            config.engine.periodic_update_interval(),
            Duration::from_secs(60)
        );
        assert_eq!(
            config.engine.default_auto_clear(),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(config.storage.db_path, "/tmp/oh.db");
        assert_eq!(config.metrics.listen_addr.as_deref(), Some("127.0.0.1:9000"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env_overrides(env(&[
                ("OFFICEHOURS_ALLOW_MULTI_QUEUE", "false"),
                ("OFFICEHOURS_PERIODIC_UPDATE_SECS", "30"),
                ("OFFICEHOURS_AUTO_CLEAR_SECS", "120"),
                ("OFFICEHOURS_DB_PATH", "/data/oh.db"),
            ]))
            .unwrap();
        assert!(!config.engine.allow_multi_queue);
        assert_eq!(config.engine.periodic_update_secs, 30);
        assert_eq!(config.engine.default_auto_clear_secs, Some(120));
        assert_eq!(config.storage.db_path, "/data/oh.db");
    }

    #[test]
    fn test_env_override_empty_auto_clear_disables() {
        let mut config = Config::default();
        config.engine.default_auto_clear_secs = Some(10);
        config
            .apply_env_overrides(env(&[("OFFICEHOURS_AUTO_CLEAR_SECS", "")]))
            .unwrap();
        assert!(config.engine.default_auto_clear_secs.is_none());
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = Config::default();
        let err = config
            .apply_env_overrides(env(&[("OFFICEHOURS_PERIODIC_UPDATE_SECS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("OFFICEHOURS_PERIODIC_UPDATE_SECS"));

        let err = config
            .apply_env_overrides(env(&[("OFFICEHOURS_ALLOW_MULTI_QUEUE", "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains("boolean"));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = Config::default();
        config.engine.periodic_update_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.engine.default_auto_clear_secs = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[engine]\nperiodic_update_secs = 5\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.engine.periodic_update_secs, 5);

        let missing = dir.path().join("missing.toml");
        assert!(Config::from_file(&missing).is_err());
    }

    #[test]
    fn test_expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde("/var/lib/oh.db"), "/var/lib/oh.db");
    }
}
