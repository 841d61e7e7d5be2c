//! Cloud-config parsing and types
//!
//! Configuration is kept as a dynamic YAML tree ([`ConfigValue`]) so that
//! fragments can be merged structurally before any module interprets its
//! own section.

pub mod aggregate;
pub mod cmdline;
pub mod directive;
pub mod loader;
pub mod merge;

pub use aggregate::{Aggregated, DirectiveScope, Domain, Fragment, FragmentError, aggregate};
pub use directive::{MergeDirective, MergeEntry, MergeStack};
pub use merge::merge;

use serde::{Deserialize, Serialize};

/// A configuration tree: scalar, sequence, or ordered mapping
pub type ConfigValue = serde_yaml::Value;

/// Header line that marks a document as cloud-config
pub const CLOUD_CONFIG_MARKER: &str = "#cloud-config";

/// Check if this looks like a cloud-config (starts with #cloud-config)
pub fn is_cloud_config(data: &str) -> bool {
    data.trim_start().starts_with(CLOUD_CONFIG_MARKER)
}

/// Parse a cloud-config document into a mapping
///
/// The marker line is optional. An empty document is an empty mapping; a
/// document whose top level is not a mapping is rejected.
pub fn parse_cloud_config(text: &str) -> Result<ConfigValue, String> {
    let trimmed = text.trim_start();
    let body = trimmed
        .strip_prefix(CLOUD_CONFIG_MARKER)
        .unwrap_or(trimmed);

    let value: ConfigValue = serde_yaml::from_str(body).map_err(|e| e.to_string())?;
    match value {
        ConfigValue::Null => Ok(empty_config()),
        ConfigValue::Mapping(_) => Ok(value),
        other => Err(format!(
            "top level must be a mapping, found {}",
            describe(&other)
        )),
    }
}

/// An empty mapping
pub fn empty_config() -> ConfigValue {
    ConfigValue::Mapping(serde_yaml::Mapping::new())
}

/// Look up a dotted key (`a.b.c`) in a configuration tree
pub fn lookup<'a>(config: &'a ConfigValue, dotted: &str) -> Option<&'a ConfigValue> {
    dotted
        .split('.')
        .filter(|part| !part.is_empty())
        .try_fold(config, |node, part| match node {
            ConfigValue::Sequence(seq) => part.parse::<usize>().ok().and_then(|i| seq.get(i)),
            _ => node.get(part),
        })
}

fn describe(value: &ConfigValue) -> &'static str {
    match value {
        ConfigValue::Null => "null",
        ConfigValue::Bool(_) => "a boolean",
        ConfigValue::Number(_) => "a number",
        ConfigValue::String(_) => "a string",
        ConfigValue::Sequence(_) => "a sequence",
        ConfigValue::Mapping(_) => "a mapping",
        ConfigValue::Tagged(_) => "a tagged value",
    }
}

/// What to do when a semaphore file exists but cannot be read back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptSemaphorePolicy {
    /// Treat the module as already run
    #[default]
    Skip,
    /// Treat the module as not yet run
    Rerun,
}

/// Settings the core itself reads from the merged configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BootSettings {
    /// Trust the cached instance id over the datasource's
    pub manual_cache_clean: bool,

    pub corrupt_semaphore_policy: CorruptSemaphorePolicy,
}

impl BootSettings {
    /// Read settings from a merged tree, falling back to defaults on bad values
    pub fn from_config(config: &ConfigValue) -> Self {
        match serde_yaml::from_value::<BootSettings>(config.clone()) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("Invalid boot settings, using defaults: {}", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_cloud_config() {
        let yaml = r#"
#cloud-config
hostname: test-instance
packages:
  - nginx
  - vim
"#;
        let config = parse_cloud_config(yaml).unwrap();
        assert_eq!(config["hostname"].as_str(), Some("test-instance"));
        assert_eq!(config["packages"].as_sequence().map(Vec::len), Some(2));
    }

    #[test]
    fn test_parse_empty_is_empty_mapping() {
        assert_eq!(parse_cloud_config("#cloud-config\n").unwrap(), empty_config());
        assert_eq!(parse_cloud_config("").unwrap(), empty_config());
    }

    #[test]
    fn test_parse_rejects_non_mapping() {
        let err = parse_cloud_config("#cloud-config\n- a\n- b\n").unwrap_err();
        assert!(err.contains("sequence"));
        assert!(parse_cloud_config("key: [unclosed").is_err());
    }

    #[test]
    fn test_is_cloud_config() {
        assert!(is_cloud_config("#cloud-config\nhostname: test"));
        assert!(is_cloud_config("  #cloud-config\n"));
        assert!(!is_cloud_config("#!/bin/bash\necho hello"));
    }

    #[test]
    fn test_lookup_dotted() {
        let config = parse_cloud_config("a:\n  b:\n    - x\n    - y\n  c: 3\n").unwrap();
        assert_eq!(lookup(&config, "a.c").and_then(|v| v.as_u64()), Some(3));
        assert_eq!(lookup(&config, "a.b.1").and_then(|v| v.as_str()), Some("y"));
        assert!(lookup(&config, "a.missing").is_none());
        assert_eq!(lookup(&config, ""), Some(&config));
    }

    #[test]
    fn test_boot_settings() {
        let config = parse_cloud_config(
            "manual_cache_clean: true\ncorrupt_semaphore_policy: rerun\nother: 1\n",
        )
        .unwrap();
        let settings = BootSettings::from_config(&config);
        assert!(settings.manual_cache_clean);
        assert_eq!(settings.corrupt_semaphore_policy, CorruptSemaphorePolicy::Rerun);

        let defaults = BootSettings::from_config(&empty_config());
        assert!(!defaults.manual_cache_clean);
        assert_eq!(defaults.corrupt_semaphore_policy, CorruptSemaphorePolicy::Skip);
    }

    #[test]
    fn test_boot_settings_bad_values_fall_back() {
        let config = parse_cloud_config("manual_cache_clean: sometimes\n").unwrap();
        assert!(!BootSettings::from_config(&config).manual_cache_clean);
    }
}
