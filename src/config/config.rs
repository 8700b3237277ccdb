use std::collections::HashSet;
use std::path::Path;

use dimse::{DimseConfig, RemoteNode, StaticDirectory};
use serde::Deserialize;
use thiserror::Error;

use crate::config::{LoggingConfig, NodeConfig};
use crate::storage::StorageConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("node id must not be empty")]
    InvalidNodeId,
    #[error("logging.file must not be empty")]
    EmptyLogFile,
    #[error("remote '{0}' is listed more than once")]
    DuplicateRemote(String),
    #[error(transparent)]
    Dimse(#[from] dimse::DimseError),
}

/// Top-level configuration file
#[derive(Debug, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub dimse: DimseConfig,
    /// Peers known by AE title, used as C-MOVE destinations
    #[serde(default, rename = "remote")]
    pub remotes: Vec<RemoteNode>,
}

impl Config {
    /// Reads and validates a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.id.trim().is_empty() {
            return Err(ConfigError::InvalidNodeId);
        }
        if self.logging.file.as_ref().is_some_and(|f| f.as_os_str().is_empty()) {
            return Err(ConfigError::EmptyLogFile);
        }
        self.dimse.validate()?;

        let mut seen = HashSet::new();
        for remote in &self.remotes {
            remote.validate()?;
            if !seen.insert(remote.ae_title.as_str()) {
                return Err(ConfigError::DuplicateRemote(remote.ae_title.clone()));
            }
        }
        Ok(())
    }

    /// AE title directory built from the `[[remote]]` entries
    pub fn directory(&self) -> StaticDirectory {
        StaticDirectory::from_nodes(self.remotes.iter().cloned())
    }
}
