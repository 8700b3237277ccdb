use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod filesystem;
pub mod query;

pub use filesystem::FilesystemStorage;

/// Error type for storage operations
#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    Path(String),
    Config(String),
    Sidecar(serde_json::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "IO error: {}", e),
            StorageError::Path(e) => write!(f, "Path error: {}", e),
            StorageError::Config(e) => write!(f, "Configuration error: {}", e),
            StorageError::Sidecar(e) => write!(f, "Sidecar error: {}", e),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Sidecar(err)
    }
}

impl From<StorageError> for dimse::DimseError {
    fn from(err: StorageError) -> Self {
        dimse::DimseError::storage(err.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Sidecar written next to every stored data set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub transfer_syntax: String,
    pub calling_ae_title: String,
    pub received_at: DateTime<Utc>,
    pub size_bytes: u64,
    /// Matching keys by DICOM keyword
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
}

/// Configuration for the instance store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { root: default_root() }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("./data")
}
