//! Cloud-config loader
//!
//! Collects fragments from their standard locations, in fold order:
//! 1. `cloud-config-url` payload from the kernel command line
//! 2. /etc/cloud/cloud.cfg
//! 3. /etc/cloud/cloud.cfg.d/*.cfg (sorted alphabetically)
//! 4. Vendor-data parts
//! 5. User-data parts
//! 6. Inline `cc:` payloads from the kernel command line

use super::aggregate::{
    Aggregated, DirectiveScope, Domain, Fragment, FragmentError, aggregate,
};
use super::cmdline;
use crate::state::CloudPaths;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info, warn};

fn system_error(source: &Path, message: String) -> FragmentError {
    warn!("Skipping {}: {}", source.display(), message);
    FragmentError {
        source: source.display().to_string(),
        domain: Domain::System,
        message,
    }
}

/// Read a single config file as a raw fragment; a missing file is `None`
async fn load_config_file(path: impl AsRef<Path>) -> Result<Option<Fragment>, FragmentError> {
    let path = path.as_ref();

    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(system_error(path, e.to_string())),
    };
    let content = String::from_utf8(bytes)
        .map_err(|e| system_error(path, format!("not valid UTF-8: {}", e.utf8_error())))?;

    Ok(Some(Fragment::raw(
        path.display().to_string(),
        Domain::System,
        content,
    )))
}

/// Load all drop-in configs from a directory (sorted alphabetically)
async fn load_dropin_fragments(dir: impl AsRef<Path>) -> (Vec<Fragment>, Vec<FragmentError>) {
    let dir = dir.as_ref();
    let mut errors = Vec::new();

    if !dir.exists() {
        return (Vec::new(), errors);
    }

    let mut entries = Vec::new();
    match fs::read_dir(dir).await {
        Ok(mut read_dir) => loop {
            match read_dir.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    // Only process .cfg files
                    if path.extension().is_some_and(|e| e == "cfg") {
                        entries.push(path);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    errors.push(system_error(dir, e.to_string()));
                    break;
                }
            }
        },
        Err(e) => errors.push(system_error(dir, e.to_string())),
    }

    entries.sort();

    let mut fragments = Vec::with_capacity(entries.len());
    for path in entries {
        match load_config_file(&path).await {
            Ok(Some(fragment)) => {
                debug!("Loaded drop-in config from {}", path.display());
                fragments.push(fragment);
            }
            Ok(None) => {}
            Err(e) => errors.push(e),
        }
    }

    info!("Loaded {} drop-in configs", fragments.len());
    (fragments, errors)
}

/// Builder over the fragment sources of one boot
pub struct ConfigLoader {
    paths: CloudPaths,
    include_system: bool,
    include_dropins: bool,
    cmdline: String,
    url_fragment: Option<Fragment>,
    vendordata: Vec<Fragment>,
    userdata: Vec<Fragment>,
    scope: DirectiveScope,
}

impl ConfigLoader {
    /// Create a new config loader with default paths
    pub fn new() -> Self {
        Self {
            paths: CloudPaths::new(),
            include_system: true,
            include_dropins: true,
            cmdline: String::new(),
            url_fragment: None,
            vendordata: Vec::new(),
            userdata: Vec::new(),
            scope: DirectiveScope::default(),
        }
    }

    /// Use custom paths
    pub fn with_paths(mut self, paths: CloudPaths) -> Self {
        self.paths = paths;
        self
    }

    /// Skip loading system config
    pub fn skip_system(mut self) -> Self {
        self.include_system = false;
        self
    }

    /// Skip loading drop-in configs
    pub fn skip_dropins(mut self) -> Self {
        self.include_dropins = false;
        self
    }

    /// Kernel command line to scan for `cc:` payloads
    pub fn with_cmdline(mut self, cmdline: impl Into<String>) -> Self {
        self.cmdline = cmdline.into();
        self
    }

    /// Fragment fetched from `cloud-config-url`; folded first
    pub fn with_url_fragment(mut self, fragment: Option<Fragment>) -> Self {
        self.url_fragment = fragment;
        self
    }

    /// Set vendor-data fragments
    pub fn with_vendordata(mut self, fragments: Vec<Fragment>) -> Self {
        self.vendordata = fragments;
        self
    }

    /// Set user-data fragments
    pub fn with_userdata(mut self, fragments: Vec<Fragment>) -> Self {
        self.userdata = fragments;
        self
    }

    /// How far merge directives reach across domains
    pub fn with_scope(mut self, scope: DirectiveScope) -> Self {
        self.scope = scope;
        self
    }

    /// Collect fragments in fold order, with the system files that could
    /// not be read
    pub async fn fragments(self) -> (Vec<Fragment>, Vec<FragmentError>) {
        let mut fragments = Vec::new();
        let mut errors = Vec::new();

        fragments.extend(self.url_fragment);

        if self.include_system {
            match load_config_file(self.paths.main_config()).await {
                Ok(Some(fragment)) => {
                    debug!("Loaded base config from {}", self.paths.main_config().display());
                    fragments.push(fragment);
                }
                Ok(None) => {}
                Err(e) => errors.push(e),
            }
        }

        if self.include_dropins {
            let (dropins, dropin_errors) = load_dropin_fragments(self.paths.config_d()).await;
            fragments.extend(dropins);
            errors.extend(dropin_errors);
        }

        fragments.extend(self.vendordata);
        fragments.extend(self.userdata);
        fragments.extend(cmdline::inline_fragment(&self.cmdline));

        (fragments, errors)
    }

    /// Collect and fold all fragments; unreadable sources are reported
    /// ahead of the fold errors
    pub async fn load(self) -> Aggregated {
        let scope = self.scope;
        let (fragments, mut errors) = self.fragments().await;
        info!("Aggregating {} configuration fragments", fragments.len());
        let mut aggregated = aggregate(fragments, scope);
        errors.append(&mut aggregated.errors);
        aggregated.errors = errors;
        aggregated
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
