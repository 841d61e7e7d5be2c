//! Instance state management for cloud-init
//!
//! Manages the /var/lib/cloud directory structure including:
//! - Instance tracking (current vs previous)
//! - Semaphore records for module execution control
//! - The merged cloud-config snapshot, cached data and status

pub mod atomic;
pub mod identity;
pub mod paths;
pub mod semaphore;

pub use identity::{BootKind, CacheMode, IdentityResolver, InstanceIdentity, Resolution};
pub use paths::CloudPaths;
pub use semaphore::{
    FileSemaphoreStore, Frequency, MemorySemaphoreStore, Scope, SemaphoreKey, SemaphoreRecord,
    SemaphoreState, SemaphoreStore,
};

use crate::CloudInitError;
use crate::config::ConfigValue;
use atomic::{read_trimmed, write_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

/// Log files removed by `clean --logs`
const LOG_FILES: [&str; 2] = ["/var/log/cloud-init.log", "/var/log/cloud-init-output.log"];

/// Outcome of one module within a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleStatus {
    pub name: String,
    pub outcome: String,
}

/// Status of one stage invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStatus {
    pub start: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    /// Recoverable errors, `module: message`
    #[serde(default)]
    pub errors: Vec<String>,
    /// The stage aborted on a fatal module error
    #[serde(default)]
    pub fatal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
    #[serde(default)]
    pub modules: Vec<ModuleStatus>,
}

/// Contents of status.json
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootStatus {
    pub datasource: Option<String>,
    pub instance_id: Option<String>,
    #[serde(default)]
    pub boot_kind: BootKind,
    #[serde(default)]
    pub stages: BTreeMap<String, StageStatus>,
    #[serde(default)]
    pub degraded: bool,
}

impl BootStatus {
    /// Record a stage result and recompute the degraded flag
    pub fn record_stage(&mut self, stage: impl Into<String>, status: StageStatus) {
        self.stages.insert(stage.into(), status);
        self.degraded = self.stages.values().any(|s| !s.errors.is_empty());
    }

    /// Whether any stage aborted
    pub fn crashed(&self) -> bool {
        self.stages.values().any(|s| s.fatal)
    }

    /// Every recoverable and fatal error across stages
    pub fn all_errors(&self) -> Vec<String> {
        self.stages
            .iter()
            .flat_map(|(stage, s)| {
                s.errors
                    .iter()
                    .chain(s.fatal_error.iter())
                    .map(move |e| format!("{stage}: {e}"))
            })
            .collect()
    }
}

/// Contents of result.json, written after the final stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootResult {
    pub datasource: Option<String>,
    pub errors: Vec<String>,
}

/// Instance state manager
#[derive(Debug, Clone)]
pub struct InstanceState {
    paths: CloudPaths,
}

impl Default for InstanceState {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceState {
    /// Create a new instance state manager with default paths
    pub fn new() -> Self {
        Self::with_paths(CloudPaths::new())
    }

    /// Create with custom paths (useful for testing)
    pub fn with_paths(paths: CloudPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &CloudPaths {
        &self.paths
    }

    /// Initialize the cloud-init directory structure
    pub async fn initialize(&self) -> Result<(), CloudInitError> {
        info!("Initializing cloud-init state directories");

        for dir in [
            self.paths.data_dir(),
            self.paths.instances_dir(),
            self.paths.scripts_per_boot(),
            self.paths.scripts_per_instance(),
            self.paths.scripts_per_once(),
            self.paths.seed_dir(),
        ] {
            fs::create_dir_all(dir).await?;
        }

        debug!(
            "Created cloud-init directories under {}",
            self.paths.base.display()
        );
        Ok(())
    }

    /// Instance id recorded by the last identity resolution
    pub async fn current_instance_id(&self) -> Result<Option<String>, CloudInitError> {
        read_trimmed(&self.paths.cached_instance_id()).await
    }

    /// Save the merged cloud-config used for this instance
    pub async fn save_snapshot(
        &self,
        instance_id: &str,
        config: &ConfigValue,
    ) -> Result<(), CloudInitError> {
        let path = self.paths.cloud_config(instance_id);
        let yaml = serde_yaml::to_string(config)?;
        write_atomic(&path, format!("#cloud-config\n{yaml}")).await?;
        debug!("Saved cloud-config snapshot to {}", path.display());
        Ok(())
    }

    /// Load the merged cloud-config snapshot of an instance
    pub async fn load_snapshot(&self, instance_id: &str) -> Result<Option<ConfigValue>, CloudInitError> {
        let path = self.paths.cloud_config(instance_id);
        match fs::read_to_string(&path).await {
            Ok(text) => crate::config::parse_cloud_config(&text)
                .map(Some)
                .map_err(|e| CloudInitError::Config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Snapshot of the current instance, if identity has been resolved
    pub async fn load_current_snapshot(&self) -> Result<Option<ConfigValue>, CloudInitError> {
        match self.current_instance_id().await? {
            Some(id) => self.load_snapshot(&id).await,
            None => Ok(None),
        }
    }

    /// Save raw user-data to the instance directory
    pub async fn save_userdata(&self, instance_id: &str, data: &[u8]) -> Result<(), CloudInitError> {
        write_atomic(&self.paths.user_data(instance_id), data).await
    }

    /// Save raw vendor-data to the instance directory
    pub async fn save_vendordata(
        &self,
        instance_id: &str,
        data: &[u8],
    ) -> Result<(), CloudInitError> {
        write_atomic(&self.paths.vendor_data(instance_id), data).await
    }

    /// Save datasource identifier
    pub async fn save_datasource(
        &self,
        instance_id: &str,
        datasource: &str,
    ) -> Result<(), CloudInitError> {
        write_atomic(&self.paths.datasource_file(instance_id), datasource).await?;
        debug!("Saved datasource identifier: {}", datasource);
        Ok(())
    }

    /// Datasource recorded for an instance
    pub async fn load_datasource(&self, instance_id: &str) -> Result<Option<String>, CloudInitError> {
        read_trimmed(&self.paths.datasource_file(instance_id)).await
    }

    /// Save datasource metadata
    pub async fn save_metadata(
        &self,
        instance_id: &str,
        metadata: &ConfigValue,
    ) -> Result<(), CloudInitError> {
        let yaml = serde_yaml::to_string(metadata)?;
        write_atomic(&self.paths.metadata_file(instance_id), yaml).await
    }

    /// Load datasource metadata; missing metadata is an empty mapping
    pub async fn load_metadata(&self, instance_id: &str) -> Result<ConfigValue, CloudInitError> {
        match fs::read_to_string(self.paths.metadata_file(instance_id)).await {
            Ok(text) => Ok(serde_yaml::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(crate::config::empty_config()),
            Err(e) => Err(e.into()),
        }
    }

    /// Mark boot as finished
    pub async fn mark_boot_finished(&self, instance_id: &str) -> Result<(), CloudInitError> {
        let path = self.paths.boot_finished(instance_id);
        write_atomic(&path, Utc::now().to_rfc3339()).await?;
        info!("Boot finished marker created");
        Ok(())
    }

    /// Check if boot has finished
    pub fn is_boot_finished(&self, instance_id: &str) -> bool {
        self.paths.boot_finished(instance_id).exists()
    }

    /// Write status.json
    pub async fn update_status(&self, status: &BootStatus) -> Result<(), CloudInitError> {
        let json = serde_json::to_string_pretty(status)?;
        write_atomic(&self.paths.status_file(), json).await
    }

    /// Read status.json; a missing file (no stage has run this boot) is an
    /// empty status
    pub async fn read_status(&self) -> Result<BootStatus, CloudInitError> {
        let path = self.paths.status_file();
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BootStatus::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write result.json
    pub async fn write_result(&self, result: &BootResult) -> Result<(), CloudInitError> {
        let json = serde_json::to_string_pretty(result)?;
        write_atomic(&self.paths.result_file(), json).await
    }

    /// Clean all cloud-init state
    ///
    /// Semaphores go through the store first so the clean follows the same
    /// invalidation path as an instance change.
    pub async fn clean(
        &self,
        store: &dyn SemaphoreStore,
        include_logs: bool,
    ) -> Result<(), CloudInitError> {
        info!("Cleaning cloud-init state");

        if let Some(id) = self.current_instance_id().await? {
            store.invalidate(&Scope::Instance(id)).await?;
        }
        store.invalidate(&Scope::Once).await?;

        if self.paths.instances_dir().exists() {
            fs::remove_dir_all(self.paths.instances_dir()).await?;
        }

        let link = self.paths.instance_link();
        if link.is_symlink() || link.exists() {
            fs::remove_file(&link).await?;
        }

        if self.paths.data_dir().exists() {
            fs::remove_dir_all(self.paths.data_dir()).await?;
        }

        for file in [self.paths.status_file(), self.paths.result_file()] {
            if file.exists() {
                fs::remove_file(&file).await?;
            }
        }

        if include_logs {
            for log in LOG_FILES {
                let path = Path::new(log);
                if path.exists() {
                    fs::remove_file(path).await?;
                }
            }
        }

        info!("Cloud-init state cleaned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_cloud_config;
    use tempfile::TempDir;

    fn create_test_state() -> (InstanceState, TempDir) {
        let temp = TempDir::new().unwrap();
        let state = InstanceState::with_paths(CloudPaths::with_base(temp.path()));
        (state, temp)
    }

    fn stage(errors: &[&str], fatal: bool) -> StageStatus {
        StageStatus {
            start: Utc::now(),
            finished: Some(Utc::now()),
            errors: errors.iter().map(|e| e.to_string()).collect(),
            fatal,
            fatal_error: fatal.then(|| "runcmd: boom".to_string()),
            modules: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_initialize() {
        let (state, temp) = create_test_state();
        state.initialize().await.unwrap();

        assert!(temp.path().join("data").exists());
        assert!(temp.path().join("instances").exists());
        assert!(temp.path().join("scripts/per-boot").exists());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_through_current_id() {
        let (state, _temp) = create_test_state();
        let config = parse_cloud_config("runcmd: [ls]\nhostname: test\n").unwrap();

        assert!(state.load_current_snapshot().await.unwrap().is_none());

        write_atomic(&state.paths().cached_instance_id(), "i-test")
            .await
            .unwrap();
        state.save_snapshot("i-test", &config).await.unwrap();

        let text = fs::read_to_string(state.paths().cloud_config("i-test"))
            .await
            .unwrap();
        assert!(text.starts_with("#cloud-config"));
        assert_eq!(state.load_current_snapshot().await.unwrap(), Some(config));
    }

    #[tokio::test]
    async fn test_datasource_and_metadata() {
        let (state, _temp) = create_test_state();
        assert!(state.load_datasource("i-test").await.unwrap().is_none());
        assert_eq!(
            state.load_metadata("i-test").await.unwrap(),
            crate::config::empty_config()
        );

        let metadata = parse_cloud_config("instance-id: i-test
local-hostname: box
").unwrap();
        state.save_datasource("i-test", "NoCloud").await.unwrap();
        state.save_metadata("i-test", &metadata).await.unwrap();

        assert_eq!(
            state.load_datasource("i-test").await.unwrap().as_deref(),
            Some("NoCloud")
        );
        assert_eq!(state.load_metadata("i-test").await.unwrap(), metadata);
    }

    #[tokio::test]
    async fn test_save_userdata() {
        let (state, temp) = create_test_state();
        state
            .save_userdata("i-test", b"#cloud-config\nhostname: test")
            .await
            .unwrap();

        let content = fs::read_to_string(temp.path().join("instances/i-test/user-data.txt"))
            .await
            .unwrap();
        assert!(content.contains("hostname: test"));
    }

    #[tokio::test]
    async fn test_boot_finished() {
        let (state, _temp) = create_test_state();
        assert!(!state.is_boot_finished("i-test"));
        state.mark_boot_finished("i-test").await.unwrap();
        assert!(state.is_boot_finished("i-test"));
    }

    #[tokio::test]
    async fn test_status_round_trip() {
        let (state, _temp) = create_test_state();
        assert_eq!(state.read_status().await.unwrap(), BootStatus::default());

        let mut status = BootStatus {
            datasource: Some("NoCloud".to_string()),
            instance_id: Some("i-test".to_string()),
            boot_kind: BootKind::FirstBoot,
            ..Default::default()
        };
        status.record_stage("config", stage(&[], false));
        assert!(!status.degraded);
        status.record_stage("final", stage(&["runcmd: exit 1"], false));
        assert!(status.degraded);
        assert!(!status.crashed());
        assert_eq!(status.all_errors(), vec!["final: runcmd: exit 1".to_string()]);

        status.record_stage("network", stage(&[], true));
        assert!(status.crashed());
        assert_eq!(status.all_errors().len(), 2);

        state.update_status(&status).await.unwrap();
        assert_eq!(state.read_status().await.unwrap(), status);
    }

    #[tokio::test]
    async fn test_write_result() {
        let (state, temp) = create_test_state();
        let result = BootResult {
            datasource: Some("NoCloud".to_string()),
            errors: vec!["boom".to_string()],
        };
        state.write_result(&result).await.unwrap();

        let json: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(temp.path().join("run/result.json"))
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(json["errors"][0], "boom");
    }

    #[tokio::test]
    async fn test_clean() {
        let (state, temp) = create_test_state();
        state.initialize().await.unwrap();
        let store = FileSemaphoreStore::new(state.paths().clone());

        write_atomic(&state.paths().cached_instance_id(), "i-test")
            .await
            .unwrap();
        let key = SemaphoreKey::new("runcmd", Frequency::PerInstance, "i-test").unwrap();
        store.record(&key).await.unwrap();
        let once = SemaphoreKey::new("seed", Frequency::PerOnce, "i-test").unwrap();
        store.record(&once).await.unwrap();

        state.clean(&store, false).await.unwrap();

        assert!(!temp.path().join("instances").exists());
        assert!(!temp.path().join("data").exists());
        assert!(!temp.path().join("sem").exists());
        assert_eq!(store.lookup(&key).await.unwrap(), SemaphoreState::Absent);
    }
}
