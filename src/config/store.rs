//! Endpoint persistence.
//!
//! The state file keeps endpoint definitions with their generated ids so that
//! ids, probe-negotiated ports and operator toggles survive a restart.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bridge::registry::Endpoint;
use crate::common::error::ConfigError;
use crate::config::types::EndpointConfig;

/// Key-value store of endpoint definitions.
pub trait EndpointStore: Send + Sync {
    fn load(&self) -> Result<Vec<Endpoint>, ConfigError>;
    fn save(&self, endpoints: &[Endpoint]) -> Result<(), ConfigError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    endpoints: Vec<Endpoint>,
}

const STATE_VERSION: u32 = 1;

/// JSON file store. Writes go to a sibling temp file and are renamed into place.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn store_error(&self, message: impl ToString) -> ConfigError {
        ConfigError::StoreError {
            path: self.path.display().to_string(),
            message: message.to_string(),
        }
    }
}

impl EndpointStore for JsonFileStore {
    fn load(&self) -> Result<Vec<Endpoint>, ConfigError> {
        if !self.path.exists() {
            debug!("No state file at {} yet", self.path.display());
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path).map_err(|source| ConfigError::IoError {
            path: self.path.display().to_string(),
            source,
        })?;
        let state: StateFile = serde_json::from_str(&content).map_err(|e| self.store_error(e))?;
        Ok(state.endpoints)
    }

    fn save(&self, endpoints: &[Endpoint]) -> Result<(), ConfigError> {
        let state = StateFile {
            version: STATE_VERSION,
            endpoints: endpoints.to_vec(),
        };
        let json = serde_json::to_string_pretty(&state).map_err(|e| self.store_error(e))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| self.store_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.store_error(e))?;

        debug!("Wrote {} endpoint(s) to {}", endpoints.len(), self.path.display());
        Ok(())
    }
}

/// Merge configured endpoints with stored ones by display name.
///
/// A stored match keeps its id, port and enabled flag; everything else comes
/// from configuration. Configured endpoints without a match get fresh ids.
/// Stored endpoints no longer configured are dropped.
pub fn merge_endpoints(configured: &[EndpointConfig], stored: &[Endpoint]) -> Vec<Endpoint> {
    configured
        .iter()
        .filter_map(|config| {
            let mut endpoint = Endpoint::from_config(config)?;
            if let Some(previous) = stored
                .iter()
                .find(|s| s.name.eq_ignore_ascii_case(&config.name))
            {
                endpoint.id = previous.id.clone();
                endpoint.address = endpoint.address.with_port(previous.port());
                endpoint.enabled = previous.enabled;
            } else {
                info!("New endpoint {} [{}]", endpoint.name, endpoint.id);
            }
            Some(endpoint)
        })
        .collect()
}
