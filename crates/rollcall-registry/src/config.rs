//! Configuration for the registry

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{RegistryError, Result, UserId};

/// Configuration for the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Root of the durable store
    pub data_dir: PathBuf,

    /// Parent directory of provisioned per-identity trees.
    ///
    /// `None` means `<data_dir>/user`.
    pub base_user_path: Option<PathBuf>,

    /// Maximum number of identities, primary included
    pub max_users: usize,

    /// Lowest id the allocator hands out. Ids below it are reserved.
    pub min_user_id: UserId,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            base_user_path: None,
            max_users: 4,
            min_user_id: 10,
        }
    }
}

impl RegistryConfig {
    /// Create a new configuration with the specified data directory
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Load a configuration from a JSON file.
    ///
    /// Missing fields take their default values.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RegistryError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| RegistryError::Config(format!("invalid config {}: {e}", path.display())))
    }

    /// Set the data directory
    #[must_use]
    pub fn with_data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.data_dir = path.as_ref().to_path_buf();
        self
    }

    /// Set the parent directory of provisioned trees
    #[must_use]
    pub fn with_base_user_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.base_user_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the maximum number of identities
    #[must_use]
    pub const fn with_max_users(mut self, max_users: usize) -> Self {
        self.max_users = max_users;
        self
    }

    /// Set the allocator floor
    #[must_use]
    pub const fn with_min_user_id(mut self, min_user_id: UserId) -> Self {
        self.min_user_id = min_user_id;
        self
    }

    /// Resolved parent directory of provisioned trees.
    pub fn user_data_path(&self) -> PathBuf {
        self.base_user_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(crate::USER_DATA_DIR))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_users == 0 {
            return Err(RegistryError::Config(
                "max_users must be greater than 0".to_string(),
            ));
        }

        if self.min_user_id <= crate::PRIMARY_USER_ID {
            return Err(RegistryError::Config(format!(
                "min_user_id must be greater than {}",
                crate::PRIMARY_USER_ID
            )));
        }

        if self.data_dir.as_os_str().is_empty() {
            return Err(RegistryError::Config(
                "data_dir must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
