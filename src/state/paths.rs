//! Standard cloud-init paths
//!
//! Defines the directory structure used for persisted state.

use std::path::{Path, PathBuf};

/// Base directory for cloud-init state
pub const CLOUD_DIR: &str = "/var/lib/cloud";

/// Cloud configuration directory
pub const CONFIG_DIR: &str = "/etc/cloud";

/// Runtime directory (tmpfs, cleared every boot)
pub const RUN_DIR: &str = "/run/cloud-init";

/// Standard cloud-init paths
#[derive(Debug, Clone)]
pub struct CloudPaths {
    /// Base cloud directory (default: /var/lib/cloud)
    pub base: PathBuf,
    /// Config directory (default: /etc/cloud)
    pub config: PathBuf,
    /// Runtime directory (default: /run/cloud-init)
    pub run: PathBuf,
}

impl Default for CloudPaths {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudPaths {
    /// Create with default paths
    pub fn new() -> Self {
        Self {
            base: PathBuf::from(CLOUD_DIR),
            config: PathBuf::from(CONFIG_DIR),
            run: PathBuf::from(RUN_DIR),
        }
    }

    /// Create with custom base directory (useful for testing)
    ///
    /// The runtime directory is placed under the base so tests never touch /run.
    pub fn with_base(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref().to_path_buf();
        Self {
            run: base.join("run"),
            base,
            config: PathBuf::from(CONFIG_DIR),
        }
    }

    /// Create with custom base and config directories
    pub fn with_dirs(base: impl AsRef<Path>, config: impl AsRef<Path>) -> Self {
        Self {
            config: config.as_ref().to_path_buf(),
            ..Self::with_base(base)
        }
    }

    /// Override the runtime directory
    pub fn with_run_dir(mut self, run: impl AsRef<Path>) -> Self {
        self.run = run.as_ref().to_path_buf();
        self
    }

    // ==================== Base Directories ====================

    /// /var/lib/cloud/data - Cached data directory
    pub fn data_dir(&self) -> PathBuf {
        self.base.join("data")
    }

    /// /var/lib/cloud/instances - All instances directory
    pub fn instances_dir(&self) -> PathBuf {
        self.base.join("instances")
    }

    /// /var/lib/cloud/instance - Symlink to current instance
    pub fn instance_link(&self) -> PathBuf {
        self.base.join("instance")
    }

    /// /var/lib/cloud/sem - Semaphores not tied to an instance
    pub fn once_sem_dir(&self) -> PathBuf {
        self.base.join("sem")
    }

    /// /var/lib/cloud/archive - Invalidated instance state kept for inspection
    pub fn archive_dir(&self) -> PathBuf {
        self.base.join("archive")
    }

    /// /var/lib/cloud/scripts - Scripts directory
    pub fn scripts_dir(&self) -> PathBuf {
        self.base.join("scripts")
    }

    /// /var/lib/cloud/seed - NoCloud seed directory
    pub fn seed_dir(&self) -> PathBuf {
        self.base.join("seed")
    }

    // ==================== Instance-specific Paths ====================

    /// /var/lib/cloud/instances/<id> - Instance directory
    pub fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.instances_dir().join(instance_id)
    }

    /// /var/lib/cloud/instances/<id>/sem - Semaphore directory
    pub fn sem_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("sem")
    }

    /// /var/lib/cloud/instances/<id>/boot-finished - Boot completion marker
    pub fn boot_finished(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("boot-finished")
    }

    /// /var/lib/cloud/instances/<id>/cloud-config.txt - Merged cloud-config snapshot
    pub fn cloud_config(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("cloud-config.txt")
    }

    /// /var/lib/cloud/instances/<id>/user-data.txt - Raw user-data
    pub fn user_data(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("user-data.txt")
    }

    /// /var/lib/cloud/instances/<id>/vendor-data.txt - Raw vendor-data
    pub fn vendor_data(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("vendor-data.txt")
    }

    /// /var/lib/cloud/instances/<id>/meta-data.yaml - Datasource metadata
    pub fn metadata_file(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("meta-data.yaml")
    }

    /// /var/lib/cloud/instances/<id>/datasource - Datasource identifier
    pub fn datasource_file(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("datasource")
    }

    // ==================== Scripts Directories ====================

    /// /var/lib/cloud/scripts/per-boot - Scripts run every boot
    pub fn scripts_per_boot(&self) -> PathBuf {
        self.scripts_dir().join("per-boot")
    }

    /// /var/lib/cloud/scripts/per-instance - Scripts run once per instance
    pub fn scripts_per_instance(&self) -> PathBuf {
        self.scripts_dir().join("per-instance")
    }

    /// /var/lib/cloud/scripts/per-once - Scripts run once ever
    pub fn scripts_per_once(&self) -> PathBuf {
        self.scripts_dir().join("per-once")
    }

    // ==================== Config Paths ====================

    /// /etc/cloud/cloud.cfg - Main config file
    pub fn main_config(&self) -> PathBuf {
        self.config.join("cloud.cfg")
    }

    /// /etc/cloud/cloud.cfg.d - Config drop-in directory
    pub fn config_d(&self) -> PathBuf {
        self.config.join("cloud.cfg.d")
    }

    // ==================== Data Paths ====================

    /// /var/lib/cloud/data/instance-id - Cached instance ID
    pub fn cached_instance_id(&self) -> PathBuf {
        self.data_dir().join("instance-id")
    }

    /// /var/lib/cloud/data/previous-instance-id - Previous instance ID
    pub fn previous_instance_id(&self) -> PathBuf {
        self.data_dir().join("previous-instance-id")
    }

    /// /run/cloud-init/result.json - Result of the last final stage
    pub fn result_file(&self) -> PathBuf {
        self.run.join("result.json")
    }

    /// /run/cloud-init/status.json - Status of the current boot
    pub fn status_file(&self) -> PathBuf {
        self.run.join("status.json")
    }
}
