//! Cloud-config merging
//!
//! Combines two configuration trees under a [`MergeDirective`]. Dispatch is
//! keyed by the shape of the *base* value: mappings go to the first `dict`
//! entry, sequences to the first `list` entry, strings to the first `str`
//! entry. Any other combination keeps the base unchanged, so merging never
//! fails.
//!
//! Built-in strategies:
//! - `dict(overwrite|replace, allow_delete, no_replace)`
//! - `list(extend|append, prepend, replace, no_replace)`
//! - `str(append, replace)`
//!
//! Unknown strategy names resolve to a no-op strategy so documents written
//! for newer merge classes still load.

use super::ConfigValue;
use super::directive::{MergeDirective, MergeEntry};
use tracing::{debug, trace};

/// Shapes of value a strategy can be dispatched on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Mapping,
    Sequence,
    String,
}

impl ValueKind {
    /// Mergeable kind of `value`; numbers, bools, null and tagged values have none
    pub fn of(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Mapping(_) => Some(Self::Mapping),
            ConfigValue::Sequence(_) => Some(Self::Sequence),
            ConfigValue::String(_) => Some(Self::String),
            _ => None,
        }
    }
}

/// A named merge class
pub trait MergeStrategy: std::fmt::Debug + Send + Sync {
    /// Kind of base value this strategy is dispatched on
    fn handles(&self) -> Option<ValueKind>;

    /// Combine `incoming` into `base` using the options of `entry`
    ///
    /// `directive` is the full directive in effect, used for recursion.
    fn merge_one(
        &self,
        base: ConfigValue,
        incoming: ConfigValue,
        entry: &MergeEntry,
        directive: &MergeDirective,
    ) -> ConfigValue;
}

/// Resolve a strategy name through the static registry
pub fn lookup_strategy(name: &str) -> &'static dyn MergeStrategy {
    match name {
        "dict" => &DictMerger,
        "list" => &ListMerger,
        "str" => &StrMerger,
        other => {
            debug!("No merge strategy named '{}', treating it as a no-op", other);
            &UnknownMerger
        }
    }
}

/// Merge `incoming` into `base` under `directive`
pub fn merge(base: ConfigValue, incoming: ConfigValue, directive: &MergeDirective) -> ConfigValue {
    match directive.strategy_for(&base) {
        Some(entry) => {
            trace!("Merging with {}", entry);
            entry.strategy().merge_one(base, incoming, entry, directive)
        }
        None => base,
    }
}

#[derive(Debug)]
struct DictMerger;

impl MergeStrategy for DictMerger {
    fn handles(&self) -> Option<ValueKind> {
        Some(ValueKind::Mapping)
    }

    fn merge_one(
        &self,
        base: ConfigValue,
        incoming: ConfigValue,
        entry: &MergeEntry,
        directive: &MergeDirective,
    ) -> ConfigValue {
        let mut result = match base {
            ConfigValue::Mapping(map) => map,
            other => return other,
        };
        let incoming = match incoming {
            ConfigValue::Mapping(map) => map,
            _ => return ConfigValue::Mapping(result),
        };

        let overwrite = entry.has_option("overwrite") || entry.has_option("replace");
        let allow_delete = entry.has_option("allow_delete");

        for (key, value) in incoming {
            if !result.contains_key(&key) {
                result.insert(key, value);
                continue;
            }
            if allow_delete && value.is_null() {
                result.remove(&key);
                continue;
            }
            if let Some(existing) = result.get_mut(&key) {
                let current = std::mem::take(existing);
                *existing = if overwrite {
                    value
                } else {
                    merge(current, value, directive)
                };
            }
        }

        ConfigValue::Mapping(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListMode {
    Extend,
    Prepend,
    Replace,
    NoReplace,
}

impl ListMode {
    fn from_entry(entry: &MergeEntry) -> Self {
        entry
            .options()
            .iter()
            .find_map(|opt| match opt.as_str() {
                "extend" | "append" => Some(Self::Extend),
                "prepend" => Some(Self::Prepend),
                "replace" => Some(Self::Replace),
                "no_replace" | "noreplace" => Some(Self::NoReplace),
                _ => None,
            })
            .unwrap_or(Self::Extend)
    }
}

#[derive(Debug)]
struct ListMerger;

impl MergeStrategy for ListMerger {
    fn handles(&self) -> Option<ValueKind> {
        Some(ValueKind::Sequence)
    }

    fn merge_one(
        &self,
        base: ConfigValue,
        incoming: ConfigValue,
        entry: &MergeEntry,
        _directive: &MergeDirective,
    ) -> ConfigValue {
        let mut result = match base {
            ConfigValue::Sequence(seq) => seq,
            other => return other,
        };
        let incoming = match incoming {
            ConfigValue::Sequence(seq) => seq,
            _ => return ConfigValue::Sequence(result),
        };

        match ListMode::from_entry(entry) {
            ListMode::Extend => {
                result.extend(incoming);
                ConfigValue::Sequence(result)
            }
            ListMode::Prepend => {
                let mut merged = incoming;
                merged.extend(result);
                ConfigValue::Sequence(merged)
            }
            ListMode::Replace => ConfigValue::Sequence(incoming),
            ListMode::NoReplace => ConfigValue::Sequence(result),
        }
    }
}

#[derive(Debug)]
struct StrMerger;

impl MergeStrategy for StrMerger {
    fn handles(&self) -> Option<ValueKind> {
        Some(ValueKind::String)
    }

    fn merge_one(
        &self,
        base: ConfigValue,
        incoming: ConfigValue,
        entry: &MergeEntry,
        _directive: &MergeDirective,
    ) -> ConfigValue {
        let mut result = match base {
            ConfigValue::String(s) => s,
            other => return other,
        };
        let incoming = match incoming {
            ConfigValue::String(s) => s,
            _ => return ConfigValue::String(result),
        };

        if entry.has_option("replace") {
            ConfigValue::String(incoming)
        } else {
            result.push_str(&incoming);
            ConfigValue::String(result)
        }
    }
}

/// Stand-in for strategy names with no implementation
#[derive(Debug)]
struct UnknownMerger;

impl MergeStrategy for UnknownMerger {
    fn handles(&self) -> Option<ValueKind> {
        None
    }

    fn merge_one(
        &self,
        base: ConfigValue,
        _incoming: ConfigValue,
        _entry: &MergeEntry,
        _directive: &MergeDirective,
    ) -> ConfigValue {
        base
    }
}
