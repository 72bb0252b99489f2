use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use blake3::Hasher as Blake3;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{CardConfig, Environment};
use crate::errors::{CardError, CardResult};

const CONFIG_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigEnvelope {
    version: u16,
    checksum: [u8; 32],
    payload: CardConfig,
    modified_at: DateTime<Utc>,
}

/// Handles persistence of card configuration with integrity checks.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Load the stored configuration, writing defaults for `environment` on first use.
    pub fn load_or_default(&self, environment: Environment) -> CardResult<CardConfig> {
        if !self.path.exists() {
            let config = CardConfig::new(environment);
            self.save(&config)?;
            return Ok(config);
        }

        let bytes = fs::read(&self.path)?;
        let envelope: ConfigEnvelope = serde_json::from_slice(&bytes)?;
        if envelope.version != CONFIG_VERSION {
            return Err(CardError::ConfigError(format!(
                "Unsupported config version {}",
                envelope.version
            )));
        }

        if checksum(&envelope.payload)? != envelope.checksum {
            return Err(CardError::ConfigError(
                "Config integrity verification failed".to_string(),
            ));
        }

        envelope.payload.validate()?;
        Ok(envelope.payload)
    }

    /// Load the stored configuration and apply `ZEREANS_*` overrides from
    /// `lookup` on top. Overrides are not written back to the file.
    pub fn load_with_overrides<F>(&self, environment: Environment, lookup: F) -> CardResult<CardConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = self.load_or_default(environment)?;
        config.apply_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, config: &CardConfig) -> CardResult<()> {
        config.validate()?;

        let envelope = ConfigEnvelope {
            version: CONFIG_VERSION,
            checksum: checksum(config)?,
            payload: config.clone(),
            modified_at: Utc::now(),
        };

        let serialized = serde_json::to_vec_pretty(&envelope)?;
        let tmp_path = self.path.with_extension("new");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&serialized)?;
            file.sync_all()?;
        }
        fs::rename(tmp_path, &self.path)?;
        log::debug!("Card configuration written to {}", self.path.display());
        Ok(())
    }

    pub fn update<F>(&self, environment: Environment, updater: F) -> CardResult<CardConfig>
    where
        F: FnOnce(&mut CardConfig) -> CardResult<()>,
    {
        let mut config = self.load_or_default(environment)?;
        updater(&mut config)?;
        self.save(&config)?;
        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn checksum(config: &CardConfig) -> CardResult<[u8; 32]> {
    let encoded = serde_json::to_vec(config)?;
    let mut hasher = Blake3::new();
    hasher.update(&encoded);
    Ok(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn save_and_load_config_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::new(temp.path().join("card.config"));

        let mut config = CardConfig::new(Environment::Test);
        config.starting_balance = 500;
        store.save(&config).unwrap();

        let loaded = store.load_or_default(Environment::Test).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn first_load_writes_defaults() {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::new(temp.path().join("nested").join("card.config"));

        let config = store.load_or_default(Environment::Production).unwrap();
        assert_eq!(config, CardConfig::new(Environment::Production));
        assert!(store.path().exists());
    }

    #[test]
    fn tampered_config_detected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("card.config");
        let store = ConfigStore::new(&path);
        store.save(&CardConfig::new(Environment::Test)).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let tampered = text.replacen("\"starting_balance\": 1000", "\"starting_balance\": 9000", 1);
        assert_ne!(text, tampered);
        fs::write(&path, tampered).unwrap();

        let result = store.load_or_default(Environment::Test);
        assert!(matches!(result, Err(CardError::ConfigError(_))));
    }

    #[test]
    fn update_persists_changes() {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::new(temp.path().join("card.config"));

        store
            .update(Environment::Test, |config| {
                config.journal_capacity = 4;
                Ok(())
            })
            .unwrap();
        let loaded = store.load_or_default(Environment::Test).unwrap();
        assert_eq!(loaded.journal_capacity, 4);
    }

    #[test]
    fn environment_overrides_win_over_stored_file() {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::new(temp.path().join("card.config"));
        let mut stored = CardConfig::new(Environment::Test);
        stored.starting_balance = 500;
        store.save(&stored).unwrap();

        let config = store
            .load_with_overrides(Environment::Test, |name| match name {
                "ZEREANS_STARTING_BALANCE" => Some("750".to_string()),
                "ZEREANS_LOG_LEVEL" => Some("debug".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.starting_balance, 750);
        assert_eq!(config.log_level, "DEBUG");
        assert_eq!(config.journal_capacity, stored.journal_capacity);

        assert_eq!(store.load_or_default(Environment::Test).unwrap(), stored);

        let rejected = store.load_with_overrides(Environment::Test, |name| {
            (name == "ZEREANS_JOURNAL_CAPACITY").then(|| "0".to_string())
        });
        assert!(matches!(rejected, Err(CardError::ConfigError(_))));
    }

    #[test]
    fn invalid_config_is_not_saved() {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::new(temp.path().join("card.config"));
        let mut config = CardConfig::default();
        config.journal_capacity = 0;
        assert!(store.save(&config).is_err());
        assert!(!store.path().exists());
    }
}
