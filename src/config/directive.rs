//! Merge directives and the merge stack
//!
//! A directive is an ordered list of `(strategy, options)` pairs written
//! either as a string, `list(extend)+dict()+str(append)`, or as a sequence of
//! `{name, settings}` records. Strategy names are resolved against the static
//! registry in [`super::merge`] when the directive is built.

use super::ConfigValue;
use super::merge::{self, MergeStrategy, ValueKind};
use std::fmt;
use tracing::debug;

/// Directive applied when nothing else has been declared
pub const DEFAULT_DIRECTIVE: &str = "list(extend)+dict()+str(append)";

/// Top-level keys a fragment may use to declare the next directive (first wins)
pub const DIRECTIVE_KEYS: [&str; 2] = ["merge_how", "merge_type"];

/// Transport headers a labeled part may use to declare the next directive (first wins)
pub const DIRECTIVE_HEADERS: [&str; 2] = ["Merge-Type", "X-Merge-Type"];

/// One `(strategy, options)` pair of a directive
#[derive(Debug, Clone)]
pub struct MergeEntry {
    name: String,
    options: Vec<String>,
    strategy: &'static dyn MergeStrategy,
}

impl MergeEntry {
    /// Build an entry, resolving the strategy name through the registry
    pub fn new<I, S>(name: &str, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let name = name.trim().to_lowercase();
        let mut opts: Vec<String> = Vec::new();
        for opt in options {
            let opt = opt.as_ref().trim().to_lowercase();
            if !opt.is_empty() && !opts.contains(&opt) {
                opts.push(opt);
            }
        }

        Self {
            strategy: merge::lookup_strategy(&name),
            name,
            options: opts,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    /// Whether `option` was given for this entry
    pub fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|o| o == option)
    }

    pub(crate) fn strategy(&self) -> &'static dyn MergeStrategy {
        self.strategy
    }
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.options == other.options
    }
}

impl Eq for MergeEntry {}

impl fmt::Display for MergeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.options.join(","))
    }
}

/// Ordered list of merge strategies; immutable once built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeDirective {
    entries: Vec<MergeEntry>,
}

impl MergeDirective {
    pub fn new(entries: Vec<MergeEntry>) -> Self {
        Self { entries }
    }

    /// Parse the string grammar `name(opt,opt)+name(opt)+...`
    ///
    /// Parsing never fails: malformed segments become strategies with
    /// unknown names, which never match any value.
    pub fn parse(input: &str) -> Self {
        let entries = input
            .split('+')
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(parse_segment)
            .collect();
        Self { entries }
    }

    /// Build a directive from its in-document form (string or record list)
    ///
    /// Returns `None` when the value declares nothing usable.
    pub fn from_value(value: &ConfigValue) -> Option<Self> {
        let directive = match value {
            ConfigValue::String(s) => Self::parse(s),
            ConfigValue::Sequence(records) => {
                let entries = records.iter().filter_map(parse_record).collect();
                Self { entries }
            }
            other => {
                debug!("Ignoring merge directive of unsupported shape: {:?}", other);
                return None;
            }
        };

        if directive.is_empty() {
            None
        } else {
            Some(directive)
        }
    }

    /// Extract the directive a fragment declares through `merge_how`/`merge_type`
    pub fn declared_in(fragment: &ConfigValue) -> Option<Self> {
        DIRECTIVE_KEYS
            .iter()
            .find_map(|key| fragment.get(*key))
            .and_then(Self::from_value)
    }

    pub fn entries(&self) -> &[MergeEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First entry whose strategy handles values shaped like `base`
    pub fn strategy_for(&self, base: &ConfigValue) -> Option<&MergeEntry> {
        let kind = ValueKind::of(base)?;
        self.entries
            .iter()
            .find(|entry| entry.strategy().handles() == Some(kind))
    }

    /// Append the default strategy for every value kind this directive does not cover
    pub fn with_defaults(mut self) -> Self {
        for default in Self::default().entries {
            let kind = default.strategy().handles();
            let covered = self
                .entries
                .iter()
                .any(|entry| entry.strategy().handles() == kind);
            if !covered {
                self.entries.push(default);
            }
        }
        self
    }
}

impl Default for MergeDirective {
    fn default() -> Self {
        Self::parse(DEFAULT_DIRECTIVE)
    }
}

impl fmt::Display for MergeDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str("+")?;
            }
            write!(f, "{entry}")?;
        }
        Ok(())
    }
}

fn parse_segment(segment: &str) -> MergeEntry {
    match (segment.find('('), segment.strip_suffix(')')) {
        (Some(open), Some(inner)) if open < inner.len() => {
            let name = &segment[..open];
            let options = inner[open + 1..].split(',');
            MergeEntry::new(name, options)
        }
        _ => MergeEntry::new(segment, std::iter::empty::<&str>()),
    }
}

fn parse_record(record: &ConfigValue) -> Option<MergeEntry> {
    let name = record.get("name")?.as_str()?;
    let options: Vec<&str> = match record.get("settings") {
        Some(ConfigValue::Sequence(settings)) => {
            settings.iter().filter_map(ConfigValue::as_str).collect()
        }
        Some(ConfigValue::String(single)) => vec![single.as_str()],
        _ => Vec::new(),
    };
    Some(MergeEntry::new(name, options))
}

/// History of directives; the top governs the next fold
#[derive(Debug, Clone)]
pub struct MergeStack {
    entries: Vec<MergeDirective>,
}

impl MergeStack {
    /// A stack holding only the default directive
    pub fn new() -> Self {
        Self {
            entries: vec![MergeDirective::default()],
        }
    }

    /// Directive governing the next fold
    pub fn top(&self) -> &MergeDirective {
        // The stack is never empty: `new` seeds it and nothing pops.
        &self.entries[self.entries.len() - 1]
    }

    pub fn push(&mut self, directive: MergeDirective) {
        debug!("Pushing merge directive: {}", directive);
        self.entries.push(directive);
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    /// Drop everything except the seed entry
    pub fn reset(&mut self) {
        self.entries.truncate(1);
    }
}

impl Default for MergeStack {
    fn default() -> Self {
        Self::new()
    }
}
