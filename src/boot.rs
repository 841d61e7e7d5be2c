//! Control flow of one invocation
//!
//! `local` and `network` discover: they read the system configuration,
//! detect the datasource, resolve instance identity, turn vendor-data and
//! user-data into fragments and save the merged snapshot. `config` and
//! `final` reuse what discovery cached for the current instance and only
//! discover themselves when nothing is cached. `cloud-config-url` is only
//! fetched once the network is up, so the local snapshot goes without it.
//!
//! Modules are gated on the classification of the invocation itself: a
//! discovering stage uses its own identity resolution, a cached one reports
//! `unknown` and so never re-runs a module that already left a record. The
//! status file keeps the classification of the first invocation of a boot,
//! so it still reads `first-boot` after an earlier stage wrote the cached id.
//! Records already stored under a first-boot id are dropped during identity
//! resolution, so leftovers cannot suppress the first run.

use crate::config::cmdline::{self, fetch_url_fragment};
use crate::config::loader::ConfigLoader;
use crate::config::{BootSettings, ConfigValue, Domain, FragmentError, lookup};
use crate::datasources::{Datasource, InstanceMetadata, default_datasources, detect_datasource};
use crate::modules::{ModuleContext, ModuleRegistry};
use crate::stages::{ModuleResult, Stage, StageOrchestrator, StageReport};
use crate::state::{
    BootKind, BootResult, BootStatus, CacheMode, CloudPaths, FileSemaphoreStore, Frequency,
    IdentityResolver, InstanceState, Scope, SemaphoreRecord, SemaphoreStore, StageStatus,
};
use crate::userdata::process_userdata;
use crate::CloudInitError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for fetching `cloud-config-url`
const URL_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a stage needs about the current instance
#[derive(Debug, Clone)]
pub struct BootContext {
    pub instance_id: String,
    pub boot_kind: BootKind,
    pub datasource: Option<String>,
    /// Raw datasource metadata
    pub metadata: ConfigValue,
    /// Merged configuration
    pub config: ConfigValue,
    /// Fragments that could not be used
    pub errors: Vec<FragmentError>,
}

/// Result of one stage invocation
#[derive(Debug, Clone)]
pub struct StageRun {
    pub report: StageReport,
    /// As recorded in status.json, fragment errors included
    pub status: StageStatus,
}

impl StageRun {
    /// Any recoverable or fatal error
    pub fn failed(&self) -> bool {
        self.status.fatal || !self.status.errors.is_empty()
    }
}

/// One invocation against a state tree
pub struct Boot {
    state: InstanceState,
    cmdline: String,
    datasources: Vec<Box<dyn Datasource>>,
    registry: ModuleRegistry,
    store: Arc<dyn SemaphoreStore>,
    url_timeout: Duration,
}

impl Boot {
    /// Built-in modules, file-backed semaphores and the default datasources
    pub fn new(paths: CloudPaths) -> Self {
        Self {
            datasources: default_datasources(&paths),
            store: Arc::new(FileSemaphoreStore::new(paths.clone())),
            state: InstanceState::with_paths(paths),
            cmdline: String::new(),
            registry: ModuleRegistry::builtin(),
            url_timeout: URL_TIMEOUT,
        }
    }

    /// Kernel command line text
    pub fn with_cmdline(mut self, cmdline: impl Into<String>) -> Self {
        self.cmdline = cmdline.into();
        self
    }

    /// Datasources tried in order
    pub fn with_datasources(mut self, datasources: Vec<Box<dyn Datasource>>) -> Self {
        self.datasources = datasources;
        self
    }

    pub fn with_registry(mut self, registry: ModuleRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SemaphoreStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_url_timeout(mut self, timeout: Duration) -> Self {
        self.url_timeout = timeout;
        self
    }

    pub fn state(&self) -> &InstanceState {
        &self.state
    }

    pub fn paths(&self) -> &CloudPaths {
        self.state.paths()
    }

    /// Run one stage and record it in status.json
    pub async fn run_stage(&self, stage: Stage) -> Result<StageRun, CloudInitError> {
        info!("Starting stage: {}", stage);

        let ctx = if stage.discovers() {
            self.discover(stage).await?
        } else {
            self.context(stage).await?
        };

        let mut status = self.boot_status(&ctx).await;
        let module_ctx = self.module_context(stage, &ctx);
        let report = self.orchestrator(&ctx.config).run_stage(stage, &module_ctx).await;

        let mut stage_status = report.to_status();
        stage_status
            .errors
            .extend(ctx.errors.iter().map(ToString::to_string));
        status.record_stage(stage.to_string(), stage_status.clone());
        self.state.update_status(&status).await?;

        if stage == Stage::Final {
            let result = BootResult {
                datasource: status.datasource.clone(),
                errors: status.all_errors(),
            };
            self.state.write_result(&result).await?;
        }

        info!("Completed stage: {}", stage);
        Ok(StageRun {
            report,
            status: stage_status,
        })
    }

    /// Run one module outside any stage list
    pub async fn run_single(
        &self,
        name: &str,
        frequency: Option<Frequency>,
    ) -> Result<ModuleResult, CloudInitError> {
        let ctx = self.context(Stage::Final).await?;
        let module_ctx = self.module_context(Stage::Final, &ctx);
        self.orchestrator(&ctx.config)
            .run_single(name, frequency, &module_ctx)
            .await
    }

    /// Look a dotted key up in the current instance's merged configuration
    pub async fn query(&self, key: &str) -> Result<Option<ConfigValue>, CloudInitError> {
        let snapshot = self.state.load_current_snapshot().await?.ok_or_else(|| {
            CloudInitError::Config("no merged configuration cached; run init first".to_string())
        })?;
        Ok(lookup(&snapshot, key).cloned())
    }

    /// Semaphores of the current instance followed by the `once` ones
    pub async fn semaphores(&self) -> Result<Vec<SemaphoreRecord>, CloudInitError> {
        let mut records = Vec::new();
        if let Some(instance_id) = self.state.current_instance_id().await? {
            records.extend(self.store.list(&Scope::Instance(instance_id)).await?);
        }
        records.extend(self.store.list(&Scope::Once).await?);
        Ok(records)
    }

    /// Remove instance state, invalidating semaphores through the store
    pub async fn clean(&self, include_logs: bool) -> Result<(), CloudInitError> {
        self.state.clean(self.store.as_ref(), include_logs).await
    }

    /// Cached context of the current instance, discovering for `stage` when
    /// there is none
    pub async fn context(&self, stage: Stage) -> Result<BootContext, CloudInitError> {
        match self.cached().await? {
            Some(ctx) => Ok(ctx),
            None => {
                info!("No cached instance state, discovering");
                self.discover(stage).await
            }
        }
    }

    async fn cached(&self) -> Result<Option<BootContext>, CloudInitError> {
        let Some(instance_id) = self.state.current_instance_id().await? else {
            return Ok(None);
        };
        let Some(config) = self.state.load_snapshot(&instance_id).await? else {
            return Ok(None);
        };

        debug!("Using cached state of instance {}", instance_id);
        Ok(Some(BootContext {
            datasource: self.state.load_datasource(&instance_id).await?,
            metadata: self.state.load_metadata(&instance_id).await?,
            instance_id,
            boot_kind: BootKind::Unknown,
            config,
            errors: Vec::new(),
        }))
    }

    /// Detect the datasource, resolve identity and aggregate configuration
    /// as seen from `stage`
    pub async fn discover(&self, stage: Stage) -> Result<BootContext, CloudInitError> {
        self.state.initialize().await?;
        let mut errors = Vec::new();

        let fetched = if stage.network_ready() {
            fetch_url_fragment(&self.cmdline, self.url_timeout).await
        } else {
            if cmdline::config_url(&self.cmdline).is_some() {
                debug!("Leaving cloud-config-url to a stage with network");
            }
            Ok(None)
        };
        let url_fragment = match fetched {
            Ok(fragment) => fragment,
            Err(e) => {
                warn!("Could not fetch cloud-config-url: {}", e);
                errors.push(FragmentError {
                    source: cmdline::config_url(&self.cmdline)
                        .map(|url| format!("kernel-cmdline:{url}"))
                        .unwrap_or_else(|| "kernel-cmdline".to_string()),
                    domain: Domain::KernelCmdline,
                    message: e.to_string(),
                });
                None
            }
        };

        // Identity is resolved before datasource configuration is known, so
        // the settings that steer it come from the system sources alone
        let system = self
            .loader()
            .with_url_fragment(url_fragment.clone())
            .load()
            .await;
        let settings = BootSettings::from_config(&system.config);

        let datasource = detect_datasource(&self.datasources).await?;
        let metadata = datasource.get_metadata().await?;
        let current_id = metadata.require_instance_id()?;

        let resolution = IdentityResolver::new(
            self.paths(),
            self.store.as_ref(),
            CacheMode::from_manual_cache_clean(settings.manual_cache_clean),
        )
        .resolve(current_id)
        .await?;
        let instance_id = resolution.instance_id.clone();

        let vendordata = fetch(datasource.get_vendordata().await, Domain::VendorData, &mut errors);
        let userdata = fetch(datasource.get_userdata().await, Domain::UserData, &mut errors);

        let vendor = process_raw(vendordata.as_deref(), Domain::VendorData, &metadata, &mut errors);
        let user = process_raw(userdata.as_deref(), Domain::UserData, &metadata, &mut errors);

        let merged = self
            .loader()
            .with_url_fragment(url_fragment)
            .with_vendordata(vendor)
            .with_userdata(user)
            .load()
            .await;
        errors.extend(merged.errors);

        self.state.save_snapshot(&instance_id, &merged.config).await?;
        self.state.save_datasource(&instance_id, datasource.name()).await?;
        self.state.save_metadata(&instance_id, &metadata.raw).await?;
        if let Some(data) = &userdata {
            self.state.save_userdata(&instance_id, data).await?;
        }
        if let Some(data) = &vendordata {
            self.state.save_vendordata(&instance_id, data).await?;
        }

        if !errors.is_empty() {
            warn!("{} configuration fragments could not be used", errors.len());
        }

        Ok(BootContext {
            instance_id,
            boot_kind: resolution.boot_kind,
            datasource: Some(datasource.name().to_string()),
            metadata: metadata.raw,
            config: merged.config,
            errors,
        })
    }

    fn loader(&self) -> ConfigLoader {
        ConfigLoader::new()
            .with_paths(self.paths().clone())
            .with_cmdline(self.cmdline.clone())
    }

    fn orchestrator(&self, config: &ConfigValue) -> StageOrchestrator {
        let settings = BootSettings::from_config(config);
        StageOrchestrator::new(self.registry.clone(), Arc::clone(&self.store))
            .with_policy(settings.corrupt_semaphore_policy)
    }

    fn module_context(&self, stage: Stage, ctx: &BootContext) -> ModuleContext {
        ModuleContext {
            stage,
            instance_id: ctx.instance_id.clone(),
            boot_kind: ctx.boot_kind,
            paths: self.paths().clone(),
            metadata: ctx.metadata.clone(),
            config: ctx.config.clone(),
        }
    }

    /// Status of this boot; starts fresh on the first invocation of a boot
    /// or when the instance changed
    async fn boot_status(&self, ctx: &BootContext) -> BootStatus {
        let status = match self.state.read_status().await {
            Ok(status) => status,
            Err(e) => {
                warn!("Ignoring unreadable status file: {}", e);
                BootStatus::default()
            }
        };

        if status.instance_id.as_deref() == Some(ctx.instance_id.as_str()) {
            debug!("Continuing {} of instance {}", status.boot_kind, ctx.instance_id);
            return status;
        }

        BootStatus {
            datasource: ctx.datasource.clone(),
            instance_id: Some(ctx.instance_id.clone()),
            boot_kind: ctx.boot_kind,
            ..Default::default()
        }
    }
}

/// Unwrap a datasource payload, recording a failure instead of aborting
fn fetch(
    result: Result<Option<Vec<u8>>, CloudInitError>,
    domain: Domain,
    errors: &mut Vec<FragmentError>,
) -> Option<Vec<u8>> {
    result.unwrap_or_else(|e| {
        warn!("Could not fetch {}: {}", domain, e);
        errors.push(FragmentError {
            source: domain.to_string(),
            domain,
            message: e.to_string(),
        });
        None
    })
}

fn process_raw(
    data: Option<&[u8]>,
    domain: Domain,
    metadata: &InstanceMetadata,
    errors: &mut Vec<FragmentError>,
) -> Vec<crate::config::Fragment> {
    let Some(data) = data else {
        return Vec::new();
    };
    let processed = process_userdata(data, domain, &domain.to_string(), metadata);
    errors.extend(processed.errors);
    processed.fragments
}
