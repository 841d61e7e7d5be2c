//! Template variables
//!
//! Three views of the instance metadata are exposed:
//! - `ds.meta_data`: everything the datasource reported, with dashed keys
//!   also reachable in underscore form (`instance-id` → `instance_id`);
//! - `v1`: the normalised fields (`instance_id`, `local_hostname`,
//!   `cloud_name`);
//! - `instance_id` and `local_hostname` at the top level.

use crate::config::ConfigValue;
use crate::datasources::InstanceMetadata;
use minijinja::value::Value;
use serde_yaml::Mapping;
use std::collections::HashMap;

/// Build the render context for one instance
pub fn build_context(metadata: &InstanceMetadata) -> HashMap<String, Value> {
    let mut ctx = HashMap::new();

    let mut ds = HashMap::new();
    ds.insert("meta_data", Value::from_serialize(&underscored(&metadata.raw)));
    ctx.insert("ds".to_string(), Value::from_serialize(&ds));
    ctx.insert("v1".to_string(), v1(metadata));

    if let Some(id) = &metadata.instance_id {
        ctx.insert("instance_id".to_string(), Value::from(id.as_str()));
    }
    if let Some(hostname) = &metadata.local_hostname {
        ctx.insert("local_hostname".to_string(), Value::from(hostname.as_str()));
    }

    ctx
}

fn v1(metadata: &InstanceMetadata) -> Value {
    let fields = [
        ("instance_id", &metadata.instance_id),
        ("local_hostname", &metadata.local_hostname),
        ("cloud_name", &metadata.cloud_name),
    ];
    let v1: HashMap<&str, &str> = fields
        .into_iter()
        .filter_map(|(key, value)| value.as_deref().map(|v| (key, v)))
        .collect();
    Value::from_serialize(&v1)
}

/// Copy a mapping, adding an underscore alias for every dashed string key
fn underscored(raw: &ConfigValue) -> ConfigValue {
    let Some(map) = raw.as_mapping() else {
        return ConfigValue::Mapping(Mapping::new());
    };

    let mut out = map.clone();
    for (key, value) in map {
        if let Some(alias) = key.as_str().filter(|k| k.contains('-')) {
            let alias = ConfigValue::String(alias.replace('-', "_"));
            if !out.contains_key(&alias) {
                out.insert(alias, value.clone());
            }
        }
    }
    ConfigValue::Mapping(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_underscore_aliases() {
        let raw: ConfigValue =
            serde_yaml::from_str("instance-id: i-1\navailability_zone: az\n").unwrap();
        let out = underscored(&raw);
        assert_eq!(out["instance-id"].as_str(), Some("i-1"));
        assert_eq!(out["instance_id"].as_str(), Some("i-1"));
        assert_eq!(out["availability_zone"].as_str(), Some("az"));
    }

    #[test]
    fn test_context_keys() {
        let metadata = InstanceMetadata {
            instance_id: Some("i-1".to_string()),
            ..Default::default()
        };
        let ctx = build_context(&metadata);
        assert!(ctx.contains_key("ds"));
        assert!(ctx.contains_key("v1"));
        assert!(ctx.contains_key("instance_id"));
        assert!(!ctx.contains_key("local_hostname"));
    }
}
