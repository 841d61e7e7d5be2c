//! Instance identity resolution
//!
//! Decides whether this boot is the first boot of an instance or a repeat
//! boot, and keeps the persisted identity (cached id, previous id, instance
//! directory and `instance` link) in step with that decision.

use super::CloudPaths;
use super::atomic::{archive, read_trimmed, replace_symlink, write_atomic};
use super::semaphore::{Scope, SemaphoreStore};
use crate::CloudInitError;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

/// How much the cached instance id is trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Compare the datasource id against the cache
    #[default]
    Check,
    /// The cache is authoritative (`manual_cache_clean: true`)
    Trust,
}

impl CacheMode {
    pub fn from_manual_cache_clean(manual_cache_clean: bool) -> Self {
        if manual_cache_clean {
            CacheMode::Trust
        } else {
            CacheMode::Check
        }
    }
}

/// Classification of the current boot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootKind {
    #[default]
    Unknown,
    FirstBoot,
    RepeatBoot,
}

impl std::fmt::Display for BootKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootKind::Unknown => write!(f, "unknown"),
            BootKind::FirstBoot => write!(f, "first-boot"),
            BootKind::RepeatBoot => write!(f, "repeat-boot"),
        }
    }
}

/// Inputs to the boot classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub current_id: String,
    pub cached_id: Option<String>,
    pub mode: CacheMode,
}

impl InstanceIdentity {
    pub fn new(current_id: impl Into<String>, cached_id: Option<String>, mode: CacheMode) -> Self {
        Self {
            current_id: current_id.into(),
            cached_id,
            mode,
        }
    }

    /// Classify the boot; the flag is true when per-instance state must be
    /// invalidated
    pub fn classify(&self) -> (BootKind, bool) {
        match (&self.cached_id, self.mode) {
            (None, _) => (BootKind::FirstBoot, false),
            (Some(_), CacheMode::Trust) => (BootKind::RepeatBoot, false),
            (Some(cached), CacheMode::Check) if *cached == self.current_id => {
                (BootKind::RepeatBoot, false)
            }
            (Some(_), CacheMode::Check) => (BootKind::FirstBoot, true),
        }
    }

    /// Id every later step keys its state on
    pub fn effective_id(&self) -> &str {
        match (&self.cached_id, self.mode) {
            (Some(cached), CacheMode::Trust) => cached,
            _ => &self.current_id,
        }
    }
}

/// Instance ids name directories: path separators become `_`, and ids that
/// would resolve to an existing directory are refused
pub fn path_safe_id(id: &str) -> Result<String, CloudInitError> {
    let id = id.trim();
    match id {
        "" => Err(CloudInitError::Datasource(
            "datasource returned an empty instance id".to_string(),
        )),
        "." | ".." => Err(CloudInitError::Datasource(format!(
            "instance id '{id}' cannot name an instance directory"
        ))),
        _ => Ok(id.replace(['/', '\\', '\0'], "_")),
    }
}

/// Outcome of resolving identity for this boot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub instance_id: String,
    pub boot_kind: BootKind,
    pub previous_id: Option<String>,
    /// Number of semaphores invalidated
    pub invalidated: Option<usize>,
}

/// Resolves and persists instance identity
pub struct IdentityResolver<'a> {
    paths: &'a CloudPaths,
    store: &'a dyn SemaphoreStore,
    mode: CacheMode,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(paths: &'a CloudPaths, store: &'a dyn SemaphoreStore, mode: CacheMode) -> Self {
        Self { paths, store, mode }
    }

    /// Id recorded by an earlier boot, if any
    pub async fn cached_id(&self) -> Result<Option<String>, CloudInitError> {
        read_trimmed(&self.paths.cached_instance_id()).await
    }

    /// Classify this boot against `current_id` and bring persisted state in line
    pub async fn resolve(&self, current_id: &str) -> Result<Resolution, CloudInitError> {
        let current_id = path_safe_id(current_id)?;
        let identity =
            InstanceIdentity::new(current_id.as_str(), self.cached_id().await?, self.mode);
        let (boot_kind, invalidate) = identity.classify();
        let instance_id = identity.effective_id().to_string();

        info!(
            "Instance {} (datasource id {}, cached {:?}, mode {:?}): {}",
            instance_id, current_id, identity.cached_id, self.mode, boot_kind
        );

        let mut previous_id = None;
        let mut invalidated = None;

        if boot_kind == BootKind::FirstBoot {
            // Records left under this id predate the instance; the cached id is
            // written last so an interrupted first boot is classified again
            invalidated = Some(self.store.invalidate(&Scope::Instance(instance_id.clone())).await?);
            self.archive_instance_dir(&instance_id).await?;

            if invalidate {
                let cached = identity.cached_id.clone().unwrap_or_default();
                warn!("Instance id changed from {} to {}", cached, current_id);
                self.archive_instance_dir(&cached).await?;
                write_atomic(&self.paths.previous_instance_id(), &cached).await?;
                previous_id = Some(cached);
            }

            write_atomic(&self.paths.cached_instance_id(), &instance_id).await?;
        }

        let instance_dir = self.paths.instance_dir(&instance_id);
        fs::create_dir_all(&instance_dir).await?;
        replace_symlink(&instance_dir, &self.paths.instance_link()).await?;
        debug!(
            "Instance link {} -> {}",
            self.paths.instance_link().display(),
            instance_dir.display()
        );

        Ok(Resolution {
            instance_id,
            boot_kind,
            previous_id,
            invalidated,
        })
    }

    async fn archive_instance_dir(&self, instance_id: &str) -> Result<(), CloudInitError> {
        if instance_id.is_empty() {
            return Ok(());
        }
        let dir = self.paths.instance_dir(instance_id);
        if !dir.exists() {
            return Ok(());
        }
        archive(&dir, &self.paths.archive_dir(), &format!("instance-{instance_id}")).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::semaphore::{Frequency, MemorySemaphoreStore, SemaphoreKey};
    use crate::config::CorruptSemaphorePolicy;
    use tempfile::TempDir;

    fn identity(current: &str, cached: Option<&str>, mode: CacheMode) -> InstanceIdentity {
        InstanceIdentity::new(current, cached.map(str::to_string), mode)
    }

    #[test]
    fn test_classify_no_cache() {
        assert_eq!(
            identity("i-1", None, CacheMode::Check).classify(),
            (BootKind::FirstBoot, false)
        );
        assert_eq!(
            identity("i-1", None, CacheMode::Trust).classify(),
            (BootKind::FirstBoot, false)
        );
    }

    #[test]
    fn test_classify_same_id() {
        assert_eq!(
            identity("i-1", Some("i-1"), CacheMode::Check).classify(),
            (BootKind::RepeatBoot, false)
        );
    }

    #[test]
    fn test_classify_changed_id_check() {
        assert_eq!(
            identity("i-2", Some("i-1"), CacheMode::Check).classify(),
            (BootKind::FirstBoot, true)
        );
    }

    #[test]
    fn test_classify_changed_id_trust() {
        let id = identity("i-2", Some("i-1"), CacheMode::Trust);
        assert_eq!(id.classify(), (BootKind::RepeatBoot, false));
        assert_eq!(id.effective_id(), "i-1");
    }

    #[tokio::test]
    async fn test_resolve_first_boot() {
        let temp = TempDir::new().unwrap();
        let paths = CloudPaths::with_base(temp.path());
        let store = MemorySemaphoreStore::new();
        let resolver = IdentityResolver::new(&paths, &store, CacheMode::Check);

        let resolution = resolver.resolve("i-1").await.unwrap();
        assert_eq!(resolution.boot_kind, BootKind::FirstBoot);
        assert_eq!(resolution.instance_id, "i-1");
        assert!(resolution.previous_id.is_none());

        assert_eq!(resolver.cached_id().await.unwrap().as_deref(), Some("i-1"));
        assert!(paths.instance_dir("i-1").is_dir());
        assert_eq!(
            fs::read_link(paths.instance_link()).await.unwrap(),
            paths.instance_dir("i-1")
        );

        let again = resolver.resolve("i-1").await.unwrap();
        assert_eq!(again.boot_kind, BootKind::RepeatBoot);
    }

    #[tokio::test]
    async fn test_resolve_changed_instance_archives() {
        let temp = TempDir::new().unwrap();
        let paths = CloudPaths::with_base(temp.path());
        let store = MemorySemaphoreStore::new();
        let resolver = IdentityResolver::new(&paths, &store, CacheMode::Check);

        resolver.resolve("i-1").await.unwrap();
        fs::write(paths.cloud_config("i-1"), "a: 1").await.unwrap();

        // Leftover state for the new id from an earlier life
        fs::create_dir_all(paths.instance_dir("i-2")).await.unwrap();
        let stale = SemaphoreKey::new("runcmd", Frequency::PerInstance, "i-2").unwrap();
        store.record(&stale).await.unwrap();

        let resolution = resolver.resolve("i-2").await.unwrap();
        assert_eq!(resolution.boot_kind, BootKind::FirstBoot);
        assert_eq!(resolution.previous_id.as_deref(), Some("i-1"));
        assert_eq!(resolution.invalidated, Some(1));
        assert!(
            !store
                .exists(&stale, CorruptSemaphorePolicy::Skip)
                .await
                .unwrap()
        );

        assert!(!paths.cloud_config("i-1").exists());
        assert!(paths.archive_dir().is_dir());
        assert!(paths.instance_dir("i-2").is_dir());
        assert_eq!(
            read_trimmed(&paths.previous_instance_id()).await.unwrap().as_deref(),
            Some("i-1")
        );
        assert_eq!(resolver.cached_id().await.unwrap().as_deref(), Some("i-2"));
    }

    #[tokio::test]
    async fn test_resolve_trust_keeps_cached_id() {
        let temp = TempDir::new().unwrap();
        let paths = CloudPaths::with_base(temp.path());
        let store = MemorySemaphoreStore::new();

        IdentityResolver::new(&paths, &store, CacheMode::Check)
            .resolve("i-1")
            .await
            .unwrap();

        let resolution = IdentityResolver::new(&paths, &store, CacheMode::Trust)
            .resolve("i-2")
            .await
            .unwrap();
        assert_eq!(resolution.boot_kind, BootKind::RepeatBoot);
        assert_eq!(resolution.instance_id, "i-1");
        assert!(resolution.invalidated.is_none());
        assert!(!paths.previous_instance_id().exists());
    }

    #[tokio::test]
    async fn test_resolve_rejects_empty_id() {
        let temp = TempDir::new().unwrap();
        let paths = CloudPaths::with_base(temp.path());
        let store = MemorySemaphoreStore::new();
        let resolver = IdentityResolver::new(&paths, &store, CacheMode::Check);
        assert!(resolver.resolve("  ").await.is_err());
        assert!(resolver.resolve("..").await.is_err());
        assert!(resolver.resolve(".").await.is_err());
    }

    #[test]
    fn test_path_safe_id() {
        assert_eq!(path_safe_id(" i-0abc \n").unwrap(), "i-0abc");
        assert_eq!(path_safe_id("/var/lib/x").unwrap(), "_var_lib_x");
        assert_eq!(path_safe_id("a\\b").unwrap(), "a_b");
        assert_eq!(path_safe_id("../etc").unwrap(), ".._etc");
    }

    #[tokio::test]
    async fn test_resolve_keeps_slashed_ids_inside_instances() {
        let temp = TempDir::new().unwrap();
        let paths = CloudPaths::with_base(temp.path());
        let store = MemorySemaphoreStore::new();
        let resolver = IdentityResolver::new(&paths, &store, CacheMode::Check);

        let outside = temp.path().join("victim");
        let resolution = resolver.resolve(&outside.display().to_string()).await.unwrap();
        assert!(!resolution.instance_id.contains('/'));
        assert_eq!(
            paths.instance_dir(&resolution.instance_id).parent(),
            Some(paths.instances_dir().as_path())
        );
        assert!(!outside.exists());

        // A later id change archives the sanitised directory cleanly
        let next = resolver.resolve("i-2").await.unwrap();
        assert_eq!(next.boot_kind, BootKind::FirstBoot);
        assert_eq!(next.previous_id, Some(resolution.instance_id));
    }

    #[tokio::test]
    async fn test_first_boot_drops_leftover_records_without_cache() {
        let temp = TempDir::new().unwrap();
        let paths = CloudPaths::with_base(temp.path());
        let store = MemorySemaphoreStore::new();
        let leftover = SemaphoreKey::new("keys", Frequency::PerInstance, "i-1").unwrap();
        store.record(&leftover).await.unwrap();

        let resolver = IdentityResolver::new(&paths, &store, CacheMode::Check);
        let resolution = resolver.resolve("i-1").await.unwrap();
        assert_eq!(resolution.boot_kind, BootKind::FirstBoot);
        assert_eq!(resolution.invalidated, Some(1));
        assert!(resolution.previous_id.is_none());
        assert!(
            !store
                .exists(&leftover, CorruptSemaphorePolicy::Skip)
                .await
                .unwrap()
        );

        // The second resolution of the same boot is a repeat and keeps records
        store.record(&leftover).await.unwrap();
        let again = resolver.resolve("i-1").await.unwrap();
        assert_eq!(again.boot_kind, BootKind::RepeatBoot);
        assert!(again.invalidated.is_none());
        assert!(
            store
                .exists(&leftover, CorruptSemaphorePolicy::Skip)
                .await
                .unwrap()
        );
    }
}
