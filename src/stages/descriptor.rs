//! Module lists from the merged configuration
//!
//! A stage's list accepts three entry shapes:
//!
//! ```yaml
//! cloud_final_modules:
//!   - runcmd
//!   - [scripts_per_boot, always]
//!   - {name: final_message, frequency: always}
//! ```

use super::Stage;
use crate::config::ConfigValue;
use crate::state::Frequency;
use tracing::warn;

/// One module named in a stage list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    pub name: String,
    /// Overrides the module's declared frequency for this run
    pub frequency: Option<Frequency>,
    pub stage: Stage,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, stage: Stage) -> Self {
        Self {
            name: name.into(),
            frequency: None,
            stage,
        }
    }

    pub fn with_frequency(mut self, frequency: Frequency) -> Self {
        self.frequency = Some(frequency);
        self
    }

    fn from_entry(entry: &ConfigValue, stage: Stage) -> Result<Self, String> {
        let (name, frequency) = match entry {
            ConfigValue::String(name) => (Some(name.as_str()), None),
            ConfigValue::Sequence(items) => (
                items.first().and_then(ConfigValue::as_str),
                items.get(1).and_then(ConfigValue::as_str),
            ),
            ConfigValue::Mapping(_) => (
                entry.get("name").and_then(ConfigValue::as_str),
                entry.get("frequency").and_then(ConfigValue::as_str),
            ),
            _ => (None, None),
        };

        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| "entry has no module name".to_string())?;
        let mut descriptor = Self::new(name, stage);
        if let Some(frequency) = frequency {
            let frequency = frequency
                .parse::<Frequency>()
                .map_err(|e| format!("{name}: {e}"))?;
            descriptor = descriptor.with_frequency(frequency);
        }
        Ok(descriptor)
    }
}

/// Module descriptors for `stage`, in declared order
///
/// Malformed entries are skipped with a warning.
pub fn resolve_descriptors(stage: Stage, config: &ConfigValue) -> Vec<ModuleDescriptor> {
    let Some(key) = stage.module_key() else {
        return Vec::new();
    };

    let entries = match config.get(key) {
        None | Some(ConfigValue::Null) => return Vec::new(),
        Some(ConfigValue::Sequence(entries)) => entries,
        Some(_) => {
            warn!("'{}' is not a list; no modules will run in {}", key, stage);
            return Vec::new();
        }
    };

    entries
        .iter()
        .filter_map(|entry| match ModuleDescriptor::from_entry(entry, stage) {
            Ok(descriptor) => Some(descriptor),
            Err(e) => {
                warn!("Skipping invalid entry in '{}': {}", key, e);
                None
            }
        })
        .collect()
}
