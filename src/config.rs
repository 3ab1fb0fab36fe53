//! WIREDKV - Store Configuration
//! Defines tunable parameters for the segment store.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::engine::envelope::EncryptionKey;
use crate::error::{Result, WiredError};

/// Configuration for a WiredKV segment store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding one `<key>.seg` file per segment.
    pub data_dir: PathBuf,

    /// Whether to sync each appended record to disk immediately (fsync).
    pub sync_writes: bool,

    /// Key for the authenticated envelope. `None` stores payloads as-is.
    pub encryption_key: Option<EncryptionKey>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            sync_writes: true,
            encryption_key: None,
        }
    }
}

/// On-disk shape of a JSON configuration file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    data_dir: Option<PathBuf>,
    sync_writes: Option<bool>,
    /// Base64-encoded 32-byte key.
    secret: Option<String>,
}

impl Config {
    /// Create a new Config with a custom data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Toggle fsync after every appended record.
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Enable at-rest encryption with `key`.
    pub fn with_encryption_key(mut self, key: EncryptionKey) -> Self {
        self.encryption_key = Some(key);
        self
    }

    /// Load a config from a JSON file; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| WiredError::Config(format!("cannot read {:?}: {}", path, e)))?;
        Self::from_json(&raw)
    }

    /// Parse a config from a JSON document.
    pub fn from_json(raw: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(raw)
            .map_err(|e| WiredError::Config(format!("invalid config: {}", e)))?;

        let mut config = Config::default();
        if let Some(dir) = file.data_dir {
            config.data_dir = dir;
        }
        if let Some(sync) = file.sync_writes {
            config.sync_writes = sync;
        }
        if let Some(secret) = file.secret {
            config.encryption_key = Some(EncryptionKey::from_base64(&secret)?);
        }
        Ok(config)
    }

    /// Ensure the data directory exists.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }
}
