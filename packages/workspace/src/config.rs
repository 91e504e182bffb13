use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::repository::{default_seed_titles, DocumentRepository};
use crate::service::FaultInjector;

pub const DEFAULT_CONFIG_NAME: &str = "sketchpad.config.json";

/// Sketchpad server configuration file format
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Backing file of the document store, relative to the working directory
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Titles of the sample documents written to a fresh store
    #[serde(default = "default_seed_titles")]
    pub seed_titles: Vec<String>,

    #[serde(default)]
    pub fault_injection: FaultInjectionConfig,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".document-store.json")
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3030
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultInjectionConfig {
    /// Fail every Nth save with a transient error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_every_nth_save: Option<u64>,
}

impl Config {
    /// Load config from a directory, falling back to defaults
    pub fn load(cwd: &Path) -> anyhow::Result<Self> {
        let config_path = cwd.join(DEFAULT_CONFIG_NAME);

        if config_path.exists() {
            Self::from_file(&config_path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load an explicitly named config file, which must exist
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Absolute path to the backing file
    pub fn get_store_path(&self, cwd: &Path) -> PathBuf {
        cwd.join(&self.store_path)
    }

    pub fn repository(&self, cwd: &Path) -> DocumentRepository {
        DocumentRepository::new(self.get_store_path(cwd)).with_seed_titles(self.seed_titles.clone())
    }

    pub fn fault_injector(&self) -> FaultInjector {
        match self.fault_injection.fail_every_nth_save {
            Some(n) => FaultInjector::every_nth(n),
            None => FaultInjector::disabled(),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            host: default_host(),
            port: default_port(),
            seed_titles: default_seed_titles(),
            fault_injection: FaultInjectionConfig::default(),
        }
    }
}
