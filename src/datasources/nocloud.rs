//! NoCloud datasource
//!
//! Reads metadata and user data from local seed directories:
//! - <cloud>/seed/nocloud/
//! - <cloud>/seed/nocloud-net/
//!
//! A directory counts as a seed when it holds a `meta-data` file.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::{Datasource, InstanceMetadata};
use crate::CloudInitError;
use crate::config::ConfigValue;
use crate::state::CloudPaths;

/// NoCloud datasource for local file-based configuration
pub struct NoCloud {
    seed_dirs: Vec<PathBuf>,
}

impl NoCloud {
    pub fn new() -> Self {
        Self::with_paths(&CloudPaths::new())
    }

    /// Seed directories under `paths.seed_dir()`
    pub fn with_paths(paths: &CloudPaths) -> Self {
        let seed = paths.seed_dir();
        Self {
            seed_dirs: vec![seed.join("nocloud"), seed.join("nocloud-net")],
        }
    }

    /// Find the seed directory containing meta-data
    async fn find_seed_dir(&self) -> Option<&Path> {
        for dir in &self.seed_dirs {
            if let Ok(metadata) = fs::metadata(dir.join("meta-data")).await {
                if metadata.is_file() {
                    return Some(dir.as_path());
                }
            }
        }
        None
    }

    async fn seed_dir(&self) -> Result<&Path, CloudInitError> {
        self.find_seed_dir()
            .await
            .ok_or_else(|| CloudInitError::Datasource("NoCloud seed directory not found".into()))
    }

    async fn read_file(seed_dir: &Path, filename: &str) -> Result<Option<Vec<u8>>, CloudInitError> {
        match fs::read(seed_dir.join(filename)).await {
            Ok(content) if content.iter().all(u8::is_ascii_whitespace) => Ok(None),
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Default for NoCloud {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Datasource for NoCloud {
    fn name(&self) -> &'static str {
        "NoCloud"
    }

    async fn is_available(&self) -> bool {
        self.find_seed_dir().await.is_some()
    }

    async fn get_metadata(&self) -> Result<InstanceMetadata, CloudInitError> {
        let seed_dir = self.seed_dir().await?;
        debug!("Reading NoCloud metadata from {:?}", seed_dir);

        let raw = match Self::read_file(seed_dir, "meta-data").await? {
            Some(content) => serde_yaml::from_slice::<ConfigValue>(&content).map_err(|e| {
                CloudInitError::Datasource(format!("invalid NoCloud meta-data: {e}"))
            })?,
            None => ConfigValue::Null,
        };

        let mut metadata = InstanceMetadata::from_value(raw);
        metadata.cloud_name.get_or_insert_with(|| "nocloud".to_string());
        Ok(metadata)
    }

    async fn get_userdata(&self) -> Result<Option<Vec<u8>>, CloudInitError> {
        let seed_dir = self.seed_dir().await?;
        debug!("Reading NoCloud user-data from {:?}", seed_dir);
        Self::read_file(seed_dir, "user-data").await
    }

    async fn get_vendordata(&self) -> Result<Option<Vec<u8>>, CloudInitError> {
        let seed_dir = self.seed_dir().await?;
        Self::read_file(seed_dir, "vendor-data").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn seed(temp: &TempDir, dir: &str, files: &[(&str, &str)]) -> CloudPaths {
        let paths = CloudPaths::with_base(temp.path());
        let seed = paths.seed_dir().join(dir);
        fs::create_dir_all(&seed).await.unwrap();
        for (name, content) in files {
            fs::write(seed.join(name), content).await.unwrap();
        }
        paths
    }

    #[tokio::test]
    async fn test_unavailable_without_meta_data() {
        let temp = TempDir::new().unwrap();
        let paths = seed(&temp, "nocloud", &[("user-data", "#cloud-config\n")]).await;
        let ds = NoCloud::with_paths(&paths);
        assert!(!ds.is_available().await);
        assert!(ds.get_metadata().await.is_err());
    }

    #[tokio::test]
    async fn test_reads_seed() {
        let temp = TempDir::new().unwrap();
        let paths = seed(
            &temp,
            "nocloud-net",
            &[
                ("meta-data", "instance-id: iid-local01\nlocal-hostname: cloudimg\n"),
                ("user-data", "#cloud-config\nruncmd: [ls]\n"),
                ("vendor-data", "  \n"),
            ],
        )
        .await;
        let ds = NoCloud::with_paths(&paths);

        assert!(ds.is_available().await);
        let metadata = ds.get_metadata().await.unwrap();
        assert_eq!(metadata.instance_id.as_deref(), Some("iid-local01"));
        assert_eq!(metadata.local_hostname.as_deref(), Some("cloudimg"));
        assert_eq!(metadata.cloud_name.as_deref(), Some("nocloud"));

        let userdata = ds.get_userdata().await.unwrap().unwrap();
        assert!(userdata.starts_with(b"#cloud-config"));
        assert!(ds.get_vendordata().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_meta_data() {
        let temp = TempDir::new().unwrap();
        let paths = seed(&temp, "nocloud", &[("meta-data", "instance-id: [oops")]).await;
        let ds = NoCloud::with_paths(&paths);
        assert!(ds.is_available().await);
        assert!(ds.get_metadata().await.is_err());
    }
}
