//! Fragment aggregation
//!
//! Folds an ordered sequence of configuration fragments into one tree. Each
//! fold uses the directive on top of a [`MergeStack`]; a directive declared by
//! a fragment is pushed only *after* that fragment has been folded, so it
//! governs the next fragment and never its own.

use super::directive::{DIRECTIVE_KEYS, MergeDirective, MergeStack};
use super::{ConfigValue, empty_config, merge, parse_cloud_config};
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

/// Where a fragment came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Domain {
    /// Kernel command line (`cc:` payloads, `cloud-config-url`)
    KernelCmdline,
    /// `/etc/cloud/cloud.cfg` and drop-ins
    System,
    /// Datasource vendor-data
    VendorData,
    /// Datasource user-data
    UserData,
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::KernelCmdline => write!(f, "kernel-cmdline"),
            Domain::System => write!(f, "system"),
            Domain::VendorData => write!(f, "vendor-data"),
            Domain::UserData => write!(f, "user-data"),
        }
    }
}

/// Body of a fragment
#[derive(Debug, Clone)]
pub enum FragmentContent {
    /// Cloud-config text still to be parsed
    Raw(String),
    /// Already parsed tree
    Parsed(ConfigValue),
}

/// One configuration document to fold
#[derive(Debug, Clone)]
pub struct Fragment {
    /// Human-readable origin (file path, part name)
    pub source: String,
    pub domain: Domain,
    pub content: FragmentContent,
    /// `Merge-Type` / `X-Merge-Type` header of a labeled part
    pub merge_type_header: Option<String>,
}

impl Fragment {
    pub fn raw(source: impl Into<String>, domain: Domain, text: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            domain,
            content: FragmentContent::Raw(text.into()),
            merge_type_header: None,
        }
    }

    pub fn parsed(source: impl Into<String>, domain: Domain, value: ConfigValue) -> Self {
        Self {
            source: source.into(),
            domain,
            content: FragmentContent::Parsed(value),
            merge_type_header: None,
        }
    }

    /// Attach the transport-level merge header
    pub fn with_merge_type(mut self, header: impl Into<String>) -> Self {
        self.merge_type_header = Some(header.into());
        self
    }

    fn into_value(self) -> Result<ConfigValue, String> {
        match self.content {
            FragmentContent::Raw(text) => parse_cloud_config(&text),
            FragmentContent::Parsed(ConfigValue::Null) => Ok(empty_config()),
            FragmentContent::Parsed(value @ ConfigValue::Mapping(_)) => Ok(value),
            FragmentContent::Parsed(_) => Err("top level must be a mapping".to_string()),
        }
    }
}

/// How far a declared directive reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectiveScope {
    /// One stack for the whole sequence
    AcrossFragments,
    /// The stack resets to the default whenever the domain changes, so
    /// vendor-data directives never govern user-data
    #[default]
    WithinDomain,
}

/// A fragment that could not be folded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FragmentError {
    pub source: String,
    pub domain: Domain,
    pub message: String,
}

impl fmt::Display for FragmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.source, self.domain, self.message)
    }
}

/// Result of an aggregation
#[derive(Debug, Clone)]
pub struct Aggregated {
    pub config: ConfigValue,
    pub errors: Vec<FragmentError>,
}

/// Fold `fragments` left to right, starting from an empty mapping
pub fn aggregate<I>(fragments: I, scope: DirectiveScope) -> Aggregated
where
    I: IntoIterator<Item = Fragment>,
{
    let mut stack = MergeStack::new();
    let mut config = empty_config();
    let mut errors = Vec::new();
    let mut current_domain: Option<Domain> = None;

    for fragment in fragments {
        if scope == DirectiveScope::WithinDomain
            && current_domain.is_some_and(|domain| domain != fragment.domain)
        {
            stack.reset();
        }
        current_domain = Some(fragment.domain);

        let source = fragment.source.clone();
        let domain = fragment.domain;
        let header = fragment
            .merge_type_header
            .as_deref()
            .map(MergeDirective::parse)
            .filter(|d| !d.is_empty());

        let mut value = match fragment.into_value() {
            Ok(value) => value,
            Err(message) => {
                warn!("Skipping malformed fragment {} ({}): {}", source, domain, message);
                errors.push(FragmentError {
                    source,
                    domain,
                    message,
                });
                continue;
            }
        };

        let declared = header.or_else(|| MergeDirective::declared_in(&value));
        strip_directive_keys(&mut value);

        debug!("Folding {} ({}) with {}", source, domain, stack.top());
        config = merge(config, value, stack.top());

        if let Some(directive) = declared {
            stack.push(directive.with_defaults());
        }
    }

    Aggregated { config, errors }
}

fn strip_directive_keys(value: &mut ConfigValue) {
    if let ConfigValue::Mapping(map) = value {
        for key in DIRECTIVE_KEYS {
            map.remove(key);
        }
    }
}
