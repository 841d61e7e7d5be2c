//! Mock datasource for testing
//!
//! Provides a configurable mock datasource that can be used in unit and
//! integration tests.

use async_trait::async_trait;

use super::{Datasource, InstanceMetadata};
use crate::CloudInitError;

/// Mock datasource for testing
///
/// # Example
/// ```
/// use cloud_init_core::datasources::mock::MockDatasource;
///
/// let mock = MockDatasource::new()
///     .with_instance_id("test-123")
///     .with_userdata("#cloud-config\nruncmd: [ls]\n");
/// ```
#[derive(Debug, Clone)]
pub struct MockDatasource {
    name: &'static str,
    available: bool,
    metadata: InstanceMetadata,
    userdata: Option<Vec<u8>>,
    vendordata: Option<Vec<u8>>,
    metadata_error: Option<String>,
    userdata_error: Option<String>,
}

impl MockDatasource {
    /// Create a new mock datasource with default values
    pub fn new() -> Self {
        Self {
            name: "Mock",
            available: true,
            metadata: InstanceMetadata::default(),
            userdata: None,
            vendordata: None,
            metadata_error: None,
            userdata_error: None,
        }
    }

    /// Set the datasource name
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Set whether the datasource is available
    pub fn with_available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    /// Set the metadata to return
    pub fn with_metadata(mut self, metadata: InstanceMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set only the instance id
    pub fn with_instance_id(mut self, instance_id: &str) -> Self {
        self.metadata.instance_id = Some(instance_id.to_string());
        self
    }

    /// Set the raw user data to return
    pub fn with_userdata(mut self, userdata: impl Into<Vec<u8>>) -> Self {
        self.userdata = Some(userdata.into());
        self
    }

    /// Set the raw vendor data to return
    pub fn with_vendordata(mut self, vendordata: impl Into<Vec<u8>>) -> Self {
        self.vendordata = Some(vendordata.into());
        self
    }

    /// Configure to return an error for metadata
    pub fn with_metadata_error(mut self, error: &str) -> Self {
        self.metadata_error = Some(error.to_string());
        self
    }

    /// Configure to return an error for userdata
    pub fn with_userdata_error(mut self, error: &str) -> Self {
        self.userdata_error = Some(error.to_string());
        self
    }
}

impl Default for MockDatasource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Datasource for MockDatasource {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn get_metadata(&self) -> Result<InstanceMetadata, CloudInitError> {
        if let Some(error) = &self.metadata_error {
            return Err(CloudInitError::Datasource(error.clone()));
        }
        Ok(self.metadata.clone())
    }

    async fn get_userdata(&self) -> Result<Option<Vec<u8>>, CloudInitError> {
        if let Some(error) = &self.userdata_error {
            return Err(CloudInitError::Datasource(error.clone()));
        }
        Ok(self.userdata.clone())
    }

    async fn get_vendordata(&self) -> Result<Option<Vec<u8>>, CloudInitError> {
        Ok(self.vendordata.clone())
    }
}
