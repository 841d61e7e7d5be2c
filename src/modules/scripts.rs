//! Script directory modules
//!
//! Run every executable file under one of the `scripts/per-*` directories,
//! in lexical order. The directory decides the frequency.

use super::{Module, ModuleContext, ModuleError};
use crate::config::ConfigValue;
use crate::state::{CloudPaths, Frequency};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Runs the scripts of one directory
#[derive(Debug, Clone, Copy)]
pub struct ScriptsModule {
    name: &'static str,
    frequency: Frequency,
    dir: fn(&CloudPaths) -> PathBuf,
}

impl ScriptsModule {
    pub fn per_boot() -> Self {
        Self {
            name: "scripts_per_boot",
            frequency: Frequency::Always,
            dir: CloudPaths::scripts_per_boot,
        }
    }

    pub fn per_instance() -> Self {
        Self {
            name: "scripts_per_instance",
            frequency: Frequency::PerInstance,
            dir: CloudPaths::scripts_per_instance,
        }
    }

    pub fn per_once() -> Self {
        Self {
            name: "scripts_per_once",
            frequency: Frequency::PerOnce,
            dir: CloudPaths::scripts_per_once,
        }
    }
}

#[async_trait]
impl Module for ScriptsModule {
    fn name(&self) -> &'static str {
        self.name
    }

    fn frequency(&self) -> Frequency {
        self.frequency
    }

    async fn handle(
        &self,
        _section: Option<&ConfigValue>,
        ctx: &ModuleContext,
    ) -> Result<(), ModuleError> {
        let dir = (self.dir)(&ctx.paths);
        let scripts = list_scripts(&dir)
            .await
            .map_err(|e| ModuleError::recoverable(format!("{}: {}", dir.display(), e)))?;

        if scripts.is_empty() {
            debug!("No scripts in {}", dir.display());
            return Ok(());
        }

        info!("Running {} scripts from {}", scripts.len(), dir.display());
        let mut failures = Vec::new();
        for script in &scripts {
            if let Err(e) = run_script(script).await {
                warn!("Script {} failed: {}", script.display(), e);
                failures.push(format!("{}: {}", script.display(), e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ModuleError::Recoverable(failures.join("; ")))
        }
    }
}

async fn list_scripts(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut scripts = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(scripts),
        Err(e) => return Err(e),
    };

    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if metadata.is_file() && is_executable(&metadata) {
            scripts.push(entry.path());
        } else {
            debug!("Skipping non-executable {}", entry.path().display());
        }
    }
    scripts.sort();
    Ok(scripts)
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

async fn run_script(path: &Path) -> Result<(), String> {
    let status = tokio::process::Command::new(path)
        .status()
        .await
        .map_err(|e| format!("failed to spawn: {e}"))?;

    if status.success() {
        Ok(())
    } else {
        Err(format!("exit status {}", status.code().unwrap_or(-1)))
    }
}
