//! Datasource implementations
//!
//! Datasources provide the instance id, metadata, user data and vendor data
//! for a boot. User and vendor data are handed over as raw bytes; turning
//! them into configuration fragments is the job of [`crate::userdata`].

pub mod mock;
pub mod nocloud;

use crate::config::{ConfigValue, empty_config};
use crate::state::CloudPaths;
use crate::CloudInitError;
use async_trait::async_trait;

/// Instance metadata retrieved from a datasource
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceMetadata {
    pub instance_id: Option<String>,
    pub local_hostname: Option<String>,
    pub cloud_name: Option<String>,
    /// Everything the datasource reported, as a mapping
    pub raw: ConfigValue,
}

impl Default for InstanceMetadata {
    fn default() -> Self {
        Self {
            instance_id: None,
            local_hostname: None,
            cloud_name: None,
            raw: empty_config(),
        }
    }
}

impl InstanceMetadata {
    /// Build from a `meta-data` style mapping (`instance-id`, `local-hostname`)
    pub fn from_value(raw: ConfigValue) -> Self {
        let field = |key: &str| {
            raw.get(key)
                .or_else(|| raw.get(key.replace('-', "_").as_str()))
                .and_then(ConfigValue::as_str)
                .map(str::to_string)
        };
        Self {
            instance_id: field("instance-id"),
            local_hostname: field("local-hostname"),
            cloud_name: field("cloud-name"),
            raw: match raw {
                ConfigValue::Mapping(_) => raw,
                _ => empty_config(),
            },
        }
    }

    /// The instance id, required to resolve identity
    pub fn require_instance_id(&self) -> Result<&str, CloudInitError> {
        self.instance_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CloudInitError::Datasource("metadata has no instance-id".to_string()))
    }
}

/// Trait for metadata datasources
#[async_trait]
pub trait Datasource: Send + Sync {
    /// Name of this datasource (e.g., "NoCloud")
    fn name(&self) -> &'static str;

    /// Check if this datasource is available
    ///
    /// This should be a quick check (e.g., checking for magic files).
    async fn is_available(&self) -> bool;

    /// Fetch instance metadata from this datasource
    async fn get_metadata(&self) -> Result<InstanceMetadata, CloudInitError>;

    /// Fetch raw user data, if any
    async fn get_userdata(&self) -> Result<Option<Vec<u8>>, CloudInitError>;

    /// Fetch raw vendor data, if any
    async fn get_vendordata(&self) -> Result<Option<Vec<u8>>, CloudInitError> {
        Ok(None)
    }
}

/// Datasources tried in order when none is supplied
pub fn default_datasources(paths: &CloudPaths) -> Vec<Box<dyn Datasource>> {
    vec![Box::new(nocloud::NoCloud::with_paths(paths))]
}

/// Return the first available datasource
pub async fn detect_datasource(
    candidates: &[Box<dyn Datasource>],
) -> Result<&dyn Datasource, CloudInitError> {
    for ds in candidates {
        if ds.is_available().await {
            tracing::info!("Detected datasource: {}", ds.name());
            return Ok(ds.as_ref());
        }
        tracing::debug!("Datasource {} not available", ds.name());
    }

    Err(CloudInitError::NoDatasource)
}
