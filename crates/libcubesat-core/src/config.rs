use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::CubeError;
use crate::snapshot::ContentId;
use crate::types::ids::{generate_replica_id, id_to_hex, parse_replica_id, ReplicaId};

/// File name of a replica's configuration inside its directory
pub const CONFIG_FILE: &str = "config.toml";

/// Replica configuration stored in `<dir>/config.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Name the replica was created under
    pub name: String,
    /// The replica's 128-bit ID (hex string in TOML)
    pub replica_id: String,
    /// Optional human-friendly label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Unix timestamp (ms) when the replica was created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_ts: Option<u64>,
    /// Content id of the most recently published log (`b2-...`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_content_id: Option<String>,
    /// Ancestor fetch policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch: Option<FetchConfig>,
}

/// Bounds on resolving missing ancestors through the object store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Maximum entries fetched by one join or load; unbounded if unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<u64>,
}

impl ReplicaConfig {
    /// Create a config with a freshly generated replica id
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_replica_id(name, generate_replica_id())
    }

    pub fn with_replica_id(name: impl Into<String>, replica_id: ReplicaId) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .ok();

        Self {
            name: name.into(),
            replica_id: id_to_hex(&replica_id),
            label: None,
            created_ts: now,
            last_content_id: None,
            fetch: None,
        }
    }

    /// Parse the replica id from its hex form
    pub fn replica_id_bytes(&self) -> Result<ReplicaId, CubeError> {
        Ok(parse_replica_id(&self.replica_id)?)
    }

    /// Parse the last published content id, if any
    pub fn last_content_id(&self) -> Result<Option<ContentId>, CubeError> {
        self.last_content_id
            .as_deref()
            .map(|s| s.parse::<ContentId>().map_err(CubeError::from))
            .transpose()
    }

    pub fn set_last_content_id(&mut self, id: &ContentId) {
        self.last_content_id = Some(id.to_string());
    }

    /// Fetch limit as applied to an [`OperationLog`](crate::log::OperationLog)
    pub fn fetch_limit(&self) -> Option<usize> {
        self.fetch
            .as_ref()
            .and_then(|f| f.max_entries)
            .map(|n| n as usize)
    }
}

/// Path of the config file for a replica directory
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Load a replica config from `<dir>/config.toml`
pub fn load_replica_config(dir: &Path) -> Result<Option<ReplicaConfig>, CubeError> {
    let path = config_path(dir);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    let config: ReplicaConfig = toml::from_str(&content)?;
    config.replica_id_bytes()?;
    Ok(Some(config))
}

/// Save a replica config to `<dir>/config.toml`
pub fn save_replica_config(dir: &Path, config: &ReplicaConfig) -> Result<(), CubeError> {
    std::fs::create_dir_all(dir)?;
    let content = toml::to_string_pretty(config)?;
    std::fs::write(config_path(dir), content)?;
    Ok(())
}
