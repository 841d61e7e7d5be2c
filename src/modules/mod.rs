//! Configuration modules
//!
//! Each module handles a specific aspect of cloud-init configuration.
//! Modules are looked up by name in a [`ModuleRegistry`] built at startup;
//! the stage module lists in the merged configuration decide which of them
//! run and in what order.

pub mod bootcmd;
pub mod final_message;
pub mod runcmd;
pub mod scripts;

use crate::Stage;
use crate::config::ConfigValue;
use crate::state::{BootKind, CloudPaths, Frequency, semaphore::canonical_name};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// How a module run failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    /// Logged; the stage carries on and the boot is marked degraded
    #[error("{0}")]
    Recoverable(String),
    /// The stage stops; its remaining modules are not attempted
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ModuleError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Recoverable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Read-only view of the boot handed to every module
#[derive(Debug, Clone)]
pub struct ModuleContext {
    pub stage: Stage,
    pub instance_id: String,
    pub boot_kind: BootKind,
    pub paths: CloudPaths,
    /// Datasource metadata
    pub metadata: ConfigValue,
    /// Full merged configuration
    pub config: ConfigValue,
}

/// Trait for configuration modules
#[async_trait]
pub trait Module: Send + Sync {
    /// Name of this module
    fn name(&self) -> &'static str;

    /// Execution frequency for this module
    fn frequency(&self) -> Frequency {
        Frequency::PerInstance
    }

    /// Key of this module's section in the merged configuration
    fn config_key(&self) -> &'static str {
        self.name()
    }

    /// Run with the module's section (if present)
    async fn handle(
        &self,
        section: Option<&ConfigValue>,
        ctx: &ModuleContext,
    ) -> Result<(), ModuleError>;
}

/// Table of known modules
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn Module>>,
}

impl ModuleRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in module
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(bootcmd::BootCmd));
        registry.register(Arc::new(runcmd::RunCmdModule));
        registry.register(Arc::new(scripts::ScriptsModule::per_boot()));
        registry.register(Arc::new(scripts::ScriptsModule::per_instance()));
        registry.register(Arc::new(scripts::ScriptsModule::per_once()));
        registry.register(Arc::new(final_message::FinalMessage));
        registry
    }

    /// Add or replace a module
    pub fn register(&mut self, module: Arc<dyn Module>) {
        self.modules.insert(canonical_name(module.name()), module);
    }

    /// Look a module up; `cc_` prefixes and dashes are ignored
    pub fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules.get(&canonical_name(name)).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = ModuleRegistry::builtin();
        assert_eq!(
            registry.names(),
            vec![
                "bootcmd",
                "final_message",
                "runcmd",
                "scripts_per_boot",
                "scripts_per_instance",
                "scripts_per_once",
            ]
        );
    }

    #[test]
    fn test_lookup_is_canonical() {
        let registry = ModuleRegistry::builtin();
        assert_eq!(registry.get("cc_runcmd").map(|m| m.name()), Some("runcmd"));
        assert_eq!(
            registry.get("scripts-per-once").map(|m| m.frequency()),
            Some(Frequency::PerOnce)
        );
        assert!(registry.get("ssh").is_none());
    }

    #[test]
    fn test_builtin_frequencies() {
        let registry = ModuleRegistry::builtin();
        let freq = |name: &str| registry.get(name).map(|m| m.frequency());
        assert_eq!(freq("bootcmd"), Some(Frequency::Always));
        assert_eq!(freq("runcmd"), Some(Frequency::PerInstance));
        assert_eq!(freq("final_message"), Some(Frequency::Always));
    }

    #[test]
    fn test_module_error_display() {
        assert_eq!(ModuleError::recoverable("oops").to_string(), "oops");
        assert_eq!(ModuleError::fatal("boom").to_string(), "fatal: boom");
        assert!(ModuleError::fatal("boom").is_fatal());
    }
}
