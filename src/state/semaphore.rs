//! Semaphore file handling for cloud-init
//!
//! Semaphores record that a module has completed at a given frequency:
//! - once-per-instance: keyed by module and instance id
//! - once: keyed by module only, survives instance changes
//! - always: never recorded
//!
//! Records are only ever created or invalidated, never edited in place.

use super::CloudPaths;
use super::atomic::{archive, write_atomic};
use crate::CloudInitError;
use crate::config::CorruptSemaphorePolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use tokio::fs;
use tracing::{debug, info, warn};

/// Scope key used for `once` semaphores
pub const ONCE_SCOPE: &str = "once";

const SEM_PREFIX: &str = "config_";

/// Semaphore frequency - how often a module should run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Frequency {
    /// Run every boot (no semaphore)
    #[serde(rename = "always", alias = "per-boot")]
    Always,
    /// Run once per instance ID
    #[default]
    #[serde(rename = "once-per-instance", alias = "instance", alias = "per-instance")]
    PerInstance,
    /// Run once ever (even across instance changes)
    #[serde(rename = "once", alias = "per-once")]
    PerOnce,
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Always => write!(f, "always"),
            Self::PerInstance => write!(f, "once-per-instance"),
            Self::PerOnce => write!(f, "once"),
        }
    }
}

impl FromStr for Frequency {
    type Err = CloudInitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "always" | "per-boot" => Ok(Self::Always),
            "once-per-instance" | "instance" | "per-instance" => Ok(Self::PerInstance),
            "once" | "per-once" => Ok(Self::PerOnce),
            other => Err(CloudInitError::Config(format!(
                "unknown frequency '{other}'"
            ))),
        }
    }
}

/// What a semaphore is bound to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Bound to one instance id
    Instance(String),
    /// Not bound to any instance
    Once,
}

impl Scope {
    /// Persisted scope key
    pub fn key(&self) -> &str {
        match self {
            Scope::Instance(id) => id,
            Scope::Once => ONCE_SCOPE,
        }
    }
}

/// Canonical module name used for semaphore files (`cc_foo-bar` → `foo_bar`)
pub fn canonical_name(module: &str) -> String {
    let name = module.trim().replace('-', "_");
    name.strip_prefix("cc_").map(str::to_string).unwrap_or(name)
}

/// Identifies one semaphore
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SemaphoreKey {
    module: String,
    frequency: Frequency,
    scope: Scope,
}

impl SemaphoreKey {
    /// Key for `module` at `frequency`; `None` for `always`, which is never recorded
    pub fn new(module: &str, frequency: Frequency, instance_id: &str) -> Option<Self> {
        let scope = match frequency {
            Frequency::Always => return None,
            Frequency::PerInstance => Scope::Instance(instance_id.to_string()),
            Frequency::PerOnce => Scope::Once,
        };
        Some(Self {
            module: canonical_name(module),
            frequency,
            scope,
        })
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn frequency(&self) -> Frequency {
        self.frequency
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

/// Persisted body of a semaphore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemaphoreRecord {
    pub module: String,
    pub frequency: Frequency,
    pub scope: String,
    pub completed_at: DateTime<Utc>,
}

impl SemaphoreRecord {
    fn for_key(key: &SemaphoreKey) -> Self {
        Self {
            module: key.module.clone(),
            frequency: key.frequency,
            scope: key.scope.key().to_string(),
            completed_at: Utc::now(),
        }
    }
}

/// Result of looking a semaphore up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SemaphoreState {
    Absent,
    Present(SemaphoreRecord),
    /// Exists but could not be read back
    Corrupt(String),
}

/// Storage for "module has run" markers
#[async_trait]
pub trait SemaphoreStore: Send + Sync {
    /// Look a semaphore up
    async fn lookup(&self, key: &SemaphoreKey) -> Result<SemaphoreState, CloudInitError>;

    /// Durably create a semaphore
    async fn record(&self, key: &SemaphoreKey) -> Result<SemaphoreRecord, CloudInitError>;

    /// Remove every semaphore in `scope`, returning how many were removed
    async fn invalidate(&self, scope: &Scope) -> Result<usize, CloudInitError>;

    /// Readable semaphores in `scope`
    async fn list(&self, scope: &Scope) -> Result<Vec<SemaphoreRecord>, CloudInitError>;

    /// Whether the semaphore counts as present, resolving corruption by `policy`
    async fn exists(
        &self,
        key: &SemaphoreKey,
        policy: CorruptSemaphorePolicy,
    ) -> Result<bool, CloudInitError> {
        match self.lookup(key).await? {
            SemaphoreState::Absent => Ok(false),
            SemaphoreState::Present(_) => Ok(true),
            SemaphoreState::Corrupt(reason) => {
                warn!(
                    "Semaphore for {} ({}) is unreadable: {}; policy {:?}",
                    key.module, key.frequency, reason, policy
                );
                Ok(policy == CorruptSemaphorePolicy::Skip)
            }
        }
    }
}

/// Semaphores stored as one JSON file per key
#[derive(Debug, Clone)]
pub struct FileSemaphoreStore {
    paths: CloudPaths,
}

impl FileSemaphoreStore {
    pub fn new(paths: CloudPaths) -> Self {
        Self { paths }
    }

    fn scope_dir(&self, scope: &Scope) -> PathBuf {
        match scope {
            Scope::Instance(id) => self.paths.sem_dir(id),
            Scope::Once => self.paths.once_sem_dir(),
        }
    }

    /// File backing `key`
    pub fn sem_path(&self, key: &SemaphoreKey) -> PathBuf {
        let dir = self.scope_dir(&key.scope);
        match key.scope {
            Scope::Instance(_) => dir.join(format!("{SEM_PREFIX}{}", key.module)),
            Scope::Once => dir.join(format!("{SEM_PREFIX}{}.{}", key.module, key.frequency)),
        }
    }

    async fn semaphore_files(&self, scope: &Scope) -> Result<Vec<PathBuf>, CloudInitError> {
        let dir = self.scope_dir(scope);
        let mut files = Vec::new();
        if !dir.exists() {
            return Ok(files);
        }

        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with(SEM_PREFIX) {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    async fn read_record(path: &std::path::Path) -> SemaphoreState {
        match fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice::<SemaphoreRecord>(&bytes) {
                Ok(record) => SemaphoreState::Present(record),
                Err(e) => SemaphoreState::Corrupt(e.to_string()),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SemaphoreState::Absent,
            Err(e) => SemaphoreState::Corrupt(e.to_string()),
        }
    }
}

#[async_trait]
impl SemaphoreStore for FileSemaphoreStore {
    async fn lookup(&self, key: &SemaphoreKey) -> Result<SemaphoreState, CloudInitError> {
        let path = self.sem_path(key);
        let state = Self::read_record(&path).await;
        debug!(
            "Semaphore check for {} ({}): {} -> {}",
            key.module,
            key.frequency,
            path.display(),
            match &state {
                SemaphoreState::Absent => "absent",
                SemaphoreState::Present(_) => "present",
                SemaphoreState::Corrupt(_) => "corrupt",
            }
        );
        Ok(state)
    }

    async fn record(&self, key: &SemaphoreKey) -> Result<SemaphoreRecord, CloudInitError> {
        let record = SemaphoreRecord::for_key(key);
        let path = self.sem_path(key);
        let body = serde_json::to_vec(&record)?;
        write_atomic(&path, body)
            .await
            .map_err(|e| CloudInitError::semaphore(&key.module, e.to_string()))?;
        debug!("Created semaphore: {}", path.display());
        Ok(record)
    }

    async fn invalidate(&self, scope: &Scope) -> Result<usize, CloudInitError> {
        let dir = self.scope_dir(scope);
        let count = self.semaphore_files(scope).await?.len();
        if !dir.exists() {
            return Ok(0);
        }

        let label = match scope {
            Scope::Instance(id) => format!("sem-{id}"),
            Scope::Once => "sem-once".to_string(),
        };
        let target = archive(&dir, &self.paths.archive_dir(), &label).await?;

        info!(
            "Invalidated {} semaphores ({}), archived to {}",
            count,
            scope.key(),
            target.display()
        );
        Ok(count)
    }

    async fn list(&self, scope: &Scope) -> Result<Vec<SemaphoreRecord>, CloudInitError> {
        let mut records = Vec::new();
        for path in self.semaphore_files(scope).await? {
            match Self::read_record(&path).await {
                SemaphoreState::Present(record) => records.push(record),
                SemaphoreState::Corrupt(reason) => {
                    warn!("Skipping unreadable semaphore {}: {}", path.display(), reason)
                }
                SemaphoreState::Absent => {}
            }
        }
        Ok(records)
    }
}

/// In-memory store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemorySemaphoreStore {
    // `None` marks a corrupt entry
    records: Mutex<HashMap<SemaphoreKey, Option<SemaphoreRecord>>>,
}

impl MemorySemaphoreStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plant an unreadable semaphore
    pub fn insert_corrupt(&self, key: SemaphoreKey) {
        self.lock().insert(key, None);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SemaphoreKey, Option<SemaphoreRecord>>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SemaphoreStore for MemorySemaphoreStore {
    async fn lookup(&self, key: &SemaphoreKey) -> Result<SemaphoreState, CloudInitError> {
        Ok(match self.lock().get(key) {
            None => SemaphoreState::Absent,
            Some(Some(record)) => SemaphoreState::Present(record.clone()),
            Some(None) => SemaphoreState::Corrupt("corrupt entry".to_string()),
        })
    }

    async fn record(&self, key: &SemaphoreKey) -> Result<SemaphoreRecord, CloudInitError> {
        let record = SemaphoreRecord::for_key(key);
        self.lock().insert(key.clone(), Some(record.clone()));
        Ok(record)
    }

    async fn invalidate(&self, scope: &Scope) -> Result<usize, CloudInitError> {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|key, _| &key.scope != scope);
        Ok(before - records.len())
    }

    async fn list(&self, scope: &Scope) -> Result<Vec<SemaphoreRecord>, CloudInitError> {
        let mut records: Vec<SemaphoreRecord> = self
            .lock()
            .iter()
            .filter(|(key, _)| &key.scope == scope)
            .filter_map(|(_, record)| record.clone())
            .collect();
        records.sort_by(|a, b| a.module.cmp(&b.module));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(module: &str, frequency: Frequency, instance: &str) -> SemaphoreKey {
        SemaphoreKey::new(module, frequency, instance).unwrap()
    }

    #[test]
    fn test_always_has_no_key() {
        assert!(SemaphoreKey::new("bootcmd", Frequency::Always, "i-1").is_none());
    }

    #[test]
    fn test_canonical_name() {
        assert_eq!(canonical_name("cc_scripts-user"), "scripts_user");
        assert_eq!(canonical_name("runcmd"), "runcmd");
    }

    #[test]
    fn test_once_key_ignores_instance() {
        assert_eq!(
            key("seed", Frequency::PerOnce, "i-1"),
            key("seed", Frequency::PerOnce, "i-2")
        );
        assert_ne!(
            key("seed", Frequency::PerInstance, "i-1"),
            key("seed", Frequency::PerInstance, "i-2")
        );
    }

    #[test]
    fn test_frequency_display_and_parse() {
        assert_eq!(Frequency::Always.to_string(), "always");
        assert_eq!(Frequency::PerInstance.to_string(), "once-per-instance");
        assert_eq!(Frequency::PerOnce.to_string(), "once");

        assert_eq!("instance".parse::<Frequency>().unwrap(), Frequency::PerInstance);
        assert_eq!("ONCE".parse::<Frequency>().unwrap(), Frequency::PerOnce);
        assert_eq!("per-boot".parse::<Frequency>().unwrap(), Frequency::Always);
        assert!("weekly".parse::<Frequency>().is_err());
    }

    #[test]
    fn test_frequency_serde_aliases() {
        let freq: Frequency = serde_yaml::from_str("per-instance").unwrap();
        assert_eq!(freq, Frequency::PerInstance);
        assert_eq!(serde_json::to_string(&Frequency::PerOnce).unwrap(), "\"once\"");
    }

    #[tokio::test]
    async fn test_file_store_record_and_lookup() {
        let temp = TempDir::new().unwrap();
        let store = FileSemaphoreStore::new(CloudPaths::with_base(temp.path()));
        let k = key("test_module", Frequency::PerInstance, "i-1");

        assert_eq!(store.lookup(&k).await.unwrap(), SemaphoreState::Absent);

        let record = store.record(&k).await.unwrap();
        assert_eq!(record.scope, "i-1");
        assert!(temp.path().join("instances/i-1/sem/config_test_module").exists());

        match store.lookup(&k).await.unwrap() {
            SemaphoreState::Present(found) => assert_eq!(found, record),
            other => panic!("expected present semaphore, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_file_store_once_layout() {
        let temp = TempDir::new().unwrap();
        let store = FileSemaphoreStore::new(CloudPaths::with_base(temp.path()));

        store.record(&key("seed", Frequency::PerOnce, "i-1")).await.unwrap();
        assert!(temp.path().join("sem/config_seed.once").exists());
        assert!(
            store
                .exists(&key("seed", Frequency::PerOnce, "i-2"), CorruptSemaphorePolicy::Skip)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_file_store_corrupt_policy() {
        let temp = TempDir::new().unwrap();
        let store = FileSemaphoreStore::new(CloudPaths::with_base(temp.path()));
        let k = key("torn", Frequency::PerInstance, "i-1");

        let path = store.sem_path(&k);
        fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        fs::write(&path, "{\"module\": \"to").await.unwrap();

        assert!(matches!(
            store.lookup(&k).await.unwrap(),
            SemaphoreState::Corrupt(_)
        ));
        assert!(store.exists(&k, CorruptSemaphorePolicy::Skip).await.unwrap());
        assert!(!store.exists(&k, CorruptSemaphorePolicy::Rerun).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_store_invalidate_archives() {
        let temp = TempDir::new().unwrap();
        let store = FileSemaphoreStore::new(CloudPaths::with_base(temp.path()));

        store.record(&key("a", Frequency::PerInstance, "i-1")).await.unwrap();
        store.record(&key("b", Frequency::PerInstance, "i-1")).await.unwrap();
        store.record(&key("c", Frequency::PerOnce, "i-1")).await.unwrap();

        let removed = store
            .invalidate(&Scope::Instance("i-1".to_string()))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(!temp.path().join("instances/i-1/sem").exists());
        assert!(temp.path().join("archive").exists());

        // Once-scoped records are untouched
        assert_eq!(store.list(&Scope::Once).await.unwrap().len(), 1);
        assert_eq!(
            store
                .invalidate(&Scope::Instance("i-404".to_string()))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_file_store_list() {
        let temp = TempDir::new().unwrap();
        let store = FileSemaphoreStore::new(CloudPaths::with_base(temp.path()));
        let scope = Scope::Instance("i-1".to_string());

        store.record(&key("module_b", Frequency::PerInstance, "i-1")).await.unwrap();
        store.record(&key("module_a", Frequency::PerInstance, "i-1")).await.unwrap();

        let list = store.list(&scope).await.unwrap();
        let names: Vec<&str> = list.iter().map(|r| r.module.as_str()).collect();
        assert_eq!(names, vec!["module_a", "module_b"]);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySemaphoreStore::new();
        let k = key("a", Frequency::PerInstance, "i-1");

        assert!(!store.exists(&k, CorruptSemaphorePolicy::Skip).await.unwrap());
        store.record(&k).await.unwrap();
        assert!(store.exists(&k, CorruptSemaphorePolicy::Skip).await.unwrap());

        let corrupt = key("b", Frequency::PerInstance, "i-1");
        store.insert_corrupt(corrupt.clone());
        assert!(!store.exists(&corrupt, CorruptSemaphorePolicy::Rerun).await.unwrap());

        let removed = store
            .invalidate(&Scope::Instance("i-1".to_string()))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(!store.exists(&k, CorruptSemaphorePolicy::Skip).await.unwrap());
    }
}
