//! Layered configuration loading.
//!
//! Values are resolved from the type's defaults, then `<dir>/<name>.json`,
//! then environment variables named `<PREFIX>_<NAME>_<FIELD>`. Environment
//! values are parsed as JSON and fall back to plain strings.

use crate::{Result, WalletError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Where a configuration layer came from, lowest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigSource {
    Default = 0,
    File = 1,
    Environment = 2,
}

pub struct ConfigManager {
    config_dir: PathBuf,
    environment_prefix: String,
    loaded_configs: HashMap<String, serde_json::Value>,
}

impl ConfigManager {
    pub fn new(config_dir: impl Into<PathBuf>, environment_prefix: &str) -> Self {
        Self {
            config_dir: config_dir.into(),
            environment_prefix: environment_prefix.to_uppercase(),
            loaded_configs: HashMap::new(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    fn file_path(&self, config_name: &str) -> PathBuf {
        self.config_dir.join(format!("{}.json", config_name))
    }

    pub fn load_config<T>(&mut self, config_name: &str) -> Result<T>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        let mut value = serde_json::to_value(T::default())?;

        let file = self.file_path(config_name);
        if file.exists() {
            let layer = self.load_from_file(&file)?;
            merge(&mut value, layer, ConfigSource::File);
        }
        let layer = self.load_from_environment(config_name);
        merge(&mut value, layer, ConfigSource::Environment);

        let config: T = serde_json::from_value(value.clone()).map_err(|e| {
            WalletError::Configuration(format!("Failed to deserialize config '{}': {}", config_name, e))
        })?;
        self.loaded_configs.insert(config_name.to_string(), value);
        Ok(config)
    }

    /// Last resolved value of a config, as JSON.
    pub fn loaded(&self, config_name: &str) -> Option<&serde_json::Value> {
        self.loaded_configs.get(config_name)
    }

    pub fn save_config<T: Serialize>(&self, config_name: &str, config: &T) -> Result<()> {
        fs::create_dir_all(&self.config_dir)?;
        let path = self.file_path(config_name);
        fs::write(&path, serde_json::to_string_pretty(config)?)?;
        log::info!("Configuration '{}' saved to {:?}", config_name, path);
        Ok(())
    }

    pub fn config_exists(&self, config_name: &str) -> bool {
        self.file_path(config_name).exists()
    }

    pub fn delete_config(&self, config_name: &str) -> Result<()> {
        let path = self.file_path(config_name);
        if path.exists() {
            fs::remove_file(&path)?;
            log::info!("Configuration '{}' deleted", config_name);
        }
        Ok(())
    }

    fn load_from_file(&self, path: &Path) -> Result<serde_json::Value> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| WalletError::Configuration(format!("Failed to parse config file {:?}: {}", path, e)))
    }

    fn load_from_environment(&self, config_name: &str) -> serde_json::Value {
        let prefix = format!("{}_{}_", self.environment_prefix, config_name.to_uppercase());
        let layer: serde_json::Map<String, serde_json::Value> = env::vars()
            .filter_map(|(key, value)| {
                let field = key.strip_prefix(&prefix)?.to_lowercase();
                let parsed = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
                Some((field, parsed))
            })
            .collect();
        serde_json::Value::Object(layer)
    }
}

fn merge(base: &mut serde_json::Value, overlay: serde_json::Value, source: ConfigSource) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                log::trace!("Config field {} set from {:?}", key, source);
                base_map.insert(key, value);
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Network;
    use crate::types::{EngineConfig, WitnessType};
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_sources() {
        let dir = TempDir::new().unwrap();
        let mut manager = ConfigManager::new(dir.path(), "HDWTEST_NONE");
        let config: EngineConfig = manager.load_config("engine").unwrap();
        assert_eq!(config.scan_gap_limit, 5);
        assert_eq!(config.default_network, Network::Bitcoin);
        assert!(manager.loaded("engine").is_some());
    }

    #[test]
    fn test_file_then_environment_precedence() {
        let dir = TempDir::new().unwrap();
        let mut manager = ConfigManager::new(dir.path(), "HDWTEST_LAYERS");
        let mut saved = EngineConfig::default();
        saved.scan_gap_limit = 9;
        saved.min_confirms = 3;
        manager.save_config("engine", &saved).unwrap();
        assert!(manager.config_exists("engine"));

        env::set_var("HDWTEST_LAYERS_ENGINE_MIN_CONFIRMS", "6");
        env::set_var("HDWTEST_LAYERS_ENGINE_DEFAULT_WITNESS_TYPE", "segwit");
        let config: EngineConfig = manager.load_config("engine").unwrap();
        env::remove_var("HDWTEST_LAYERS_ENGINE_MIN_CONFIRMS");
        env::remove_var("HDWTEST_LAYERS_ENGINE_DEFAULT_WITNESS_TYPE");

        assert_eq!(config.scan_gap_limit, 9);
        assert_eq!(config.min_confirms, 6);
        assert_eq!(config.default_witness_type, WitnessType::Segwit);
    }

    #[test]
    fn test_invalid_file_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("engine.json"), "{ not json").unwrap();
        let mut manager = ConfigManager::new(dir.path(), "HDWTEST_BAD");
        let result: Result<EngineConfig> = manager.load_config("engine");
        assert!(matches!(result, Err(WalletError::Configuration(_))));

        manager.delete_config("engine").unwrap();
        assert!(!manager.config_exists("engine"));
    }
}
