//! Stage orchestration
//!
//! Runs a stage's modules strictly in declared order, gating each on its
//! frequency and semaphore, and records a semaphore after every successful
//! gated run before moving on.

use super::descriptor::resolve_descriptors;
use super::report::{ModuleOutcome, ModuleResult, StageReport};
use super::Stage;
use crate::CloudInitError;
use crate::config::CorruptSemaphorePolicy;
use crate::modules::{Module, ModuleContext, ModuleError, ModuleRegistry};
use crate::state::{BootKind, Frequency, SemaphoreKey, SemaphoreStore};
use std::sync::Arc;
use tracing::{Instrument, debug, error, info, info_span, warn};

pub struct StageOrchestrator {
    registry: ModuleRegistry,
    store: Arc<dyn SemaphoreStore>,
    policy: CorruptSemaphorePolicy,
}

impl StageOrchestrator {
    pub fn new(registry: ModuleRegistry, store: Arc<dyn SemaphoreStore>) -> Self {
        Self {
            registry,
            store,
            policy: CorruptSemaphorePolicy::default(),
        }
    }

    /// How unreadable semaphores are treated
    pub fn with_policy(mut self, policy: CorruptSemaphorePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Run every module listed for `stage` in the merged configuration
    pub async fn run_stage(&self, stage: Stage, ctx: &ModuleContext) -> StageReport {
        let span = info_span!("stage", stage = %stage, instance = %ctx.instance_id);
        self.run_stage_inner(stage, ctx).instrument(span).await
    }

    async fn run_stage_inner(&self, stage: Stage, ctx: &ModuleContext) -> StageReport {
        let descriptors = resolve_descriptors(stage, &ctx.config);
        info!("Running {} modules in stage {}", descriptors.len(), stage);

        let mut report = StageReport::begin(stage);
        let mut crashed = false;

        for descriptor in descriptors {
            if crashed {
                report.push(descriptor.name, descriptor.frequency, ModuleOutcome::NotAttempted);
                continue;
            }

            let Some(module) = self.registry.get(&descriptor.name) else {
                warn!("Unknown module '{}' in stage {}, skipping", descriptor.name, stage);
                report.push(descriptor.name, descriptor.frequency, ModuleOutcome::Unknown);
                continue;
            };

            let frequency = descriptor.frequency.unwrap_or_else(|| module.frequency());
            let outcome = self.run_module(module.as_ref(), frequency, ctx).await;
            if matches!(outcome, ModuleOutcome::Crashed(_)) {
                error!("Stage {} aborted by module {}", stage, descriptor.name);
                crashed = true;
            }
            report.push(descriptor.name, Some(frequency), outcome);
        }

        let report = report.finish();
        info!(
            "Stage {} finished: {} ran, {} skipped, {} failed{}",
            stage,
            report.count(&ModuleOutcome::Ran),
            report.count(&ModuleOutcome::Skipped),
            report.errors().len(),
            if report.crashed() { ", crashed" } else { "" }
        );
        report
    }

    /// Run one module outside any stage list
    ///
    /// `frequency` overrides the module's declared frequency for this run
    /// only.
    pub async fn run_single(
        &self,
        name: &str,
        frequency: Option<Frequency>,
        ctx: &ModuleContext,
    ) -> Result<ModuleResult, CloudInitError> {
        let module = self
            .registry
            .get(name)
            .ok_or_else(|| CloudInitError::module(name, "unknown module"))?;
        let frequency = frequency.unwrap_or_else(|| module.frequency());

        let span = info_span!("single", module = module.name(), instance = %ctx.instance_id);
        let outcome = self
            .run_module(module.as_ref(), frequency, ctx)
            .instrument(span)
            .await;

        Ok(ModuleResult {
            name: module.name().to_string(),
            frequency: Some(frequency),
            outcome,
        })
    }

    async fn run_module(
        &self,
        module: &dyn Module,
        frequency: Frequency,
        ctx: &ModuleContext,
    ) -> ModuleOutcome {
        let name = module.name();
        let key = SemaphoreKey::new(name, frequency, &ctx.instance_id);

        if let Some(key) = &key {
            match self.already_ran(key, ctx.boot_kind).await {
                Ok(true) => {
                    info!("Skipping {} ({}): already ran", name, frequency);
                    return ModuleOutcome::Skipped;
                }
                Ok(false) => {}
                Err(e) => return ModuleOutcome::Crashed(format!("semaphore lookup: {e}")),
            }
        }

        info!("Running module {} ({})", name, frequency);
        let section = ctx.config.get(module.config_key());
        match module.handle(section, ctx).await {
            Ok(()) => {
                if let Some(key) = &key {
                    if let Err(e) = self.store.record(key).await {
                        return ModuleOutcome::Crashed(format!("recording semaphore: {e}"));
                    }
                }
                debug!("Module {} completed", name);
                ModuleOutcome::Ran
            }
            Err(ModuleError::Recoverable(message)) => {
                error!("Module {} failed: {}", name, message);
                ModuleOutcome::Failed(message)
            }
            Err(ModuleError::Fatal(message)) => {
                error!("Module {} failed fatally: {}", name, message);
                ModuleOutcome::Crashed(message)
            }
        }
    }

    async fn already_ran(
        &self,
        key: &SemaphoreKey,
        boot_kind: BootKind,
    ) -> Result<bool, CloudInitError> {
        let present = self.store.exists(key, self.policy).await?;
        Ok(match key.frequency() {
            Frequency::Always => false,
            Frequency::PerOnce => present,
            // A first boot runs per-instance modules even over a leftover record
            Frequency::PerInstance => present && boot_kind != BootKind::FirstBoot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigValue;
    use crate::state::{CloudPaths, MemorySemaphoreStore};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Module that records its calls and returns a canned result
    #[derive(Debug)]
    struct StubModule {
        name: &'static str,
        frequency: Frequency,
        result: Result<(), ModuleError>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Module for StubModule {
        fn name(&self) -> &'static str {
            self.name
        }

        fn frequency(&self) -> Frequency {
            self.frequency
        }

        async fn handle(
            &self,
            section: Option<&ConfigValue>,
            ctx: &ModuleContext,
        ) -> Result<(), ModuleError> {
            let seen = section.and_then(ConfigValue::as_str).unwrap_or("-");
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}@{}:{}", self.name, ctx.instance_id, seen));
            self.result.clone()
        }
    }

    struct Harness {
        calls: Arc<Mutex<Vec<String>>>,
        store: Arc<MemorySemaphoreStore>,
        registry: ModuleRegistry,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                store: Arc::new(MemorySemaphoreStore::new()),
                registry: ModuleRegistry::new(),
            }
        }

        fn stub(mut self, name: &'static str, frequency: Frequency, result: Result<(), ModuleError>) -> Self {
            self.registry.register(Arc::new(StubModule {
                name,
                frequency,
                result,
                calls: self.calls.clone(),
            }));
            self
        }

        fn orchestrator(&self) -> StageOrchestrator {
            StageOrchestrator::new(self.registry.clone(), self.store.clone())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn context(instance_id: &str, boot_kind: BootKind, config: &str) -> ModuleContext {
        ModuleContext {
            stage: Stage::Final,
            instance_id: instance_id.to_string(),
            boot_kind,
            paths: CloudPaths::with_base("/nonexistent"),
            metadata: crate::config::empty_config(),
            config: serde_yaml::from_str(config).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_runs_in_declared_order_with_sections() {
        let harness = Harness::new()
            .stub("users", Frequency::Always, Ok(()))
            .stub("keys", Frequency::Always, Ok(()));
        let ctx = context(
            "i-1",
            BootKind::FirstBoot,
            "{cloud_final_modules: [users, keys], keys: abc}",
        );

        let report = harness.orchestrator().run_stage(Stage::Final, &ctx).await;
        assert_eq!(report.executed(), vec!["users", "keys"]);
        assert_eq!(harness.calls(), vec!["users@i-1:-", "keys@i-1:abc"]);
    }

    #[tokio::test]
    async fn test_fatal_second_of_four() {
        let harness = Harness::new()
            .stub("one", Frequency::PerInstance, Ok(()))
            .stub("two", Frequency::PerInstance, Err(ModuleError::fatal("boom")))
            .stub("three", Frequency::PerInstance, Ok(()))
            .stub("four", Frequency::PerInstance, Ok(()));
        let ctx = context(
            "i-1",
            BootKind::FirstBoot,
            "{cloud_final_modules: [one, two, three, four]}",
        );

        let report = harness.orchestrator().run_stage(Stage::Final, &ctx).await;
        assert_eq!(report.executed(), vec!["one", "two"]);
        assert_eq!(report.count(&ModuleOutcome::NotAttempted), 2);
        assert!(report.crashed());
        assert_eq!(harness.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_recoverable_error_continues_and_skips_semaphore() {
        let harness = Harness::new()
            .stub("flaky", Frequency::PerInstance, Err(ModuleError::recoverable("nope")))
            .stub("after", Frequency::PerInstance, Ok(()));
        let ctx = context("i-1", BootKind::FirstBoot, "{cloud_final_modules: [flaky, after]}");
        let orchestrator = harness.orchestrator();

        let report = orchestrator.run_stage(Stage::Final, &ctx).await;
        assert!(report.degraded());
        assert!(!report.crashed());
        assert_eq!(report.errors(), vec!["flaky: nope".to_string()]);

        // The failed module runs again on the next boot; the other does not
        let repeat = context("i-1", BootKind::RepeatBoot, "{cloud_final_modules: [flaky, after]}");
        let report = orchestrator.run_stage(Stage::Final, &repeat).await;
        assert_eq!(report.executed(), vec!["flaky"]);
    }

    #[tokio::test]
    async fn test_semaphore_idempotence() {
        let harness = Harness::new()
            .stub("inst", Frequency::PerInstance, Ok(()))
            .stub("every", Frequency::Always, Ok(()))
            .stub("ever", Frequency::PerOnce, Ok(()));
        let orchestrator = harness.orchestrator();
        let config = "{cloud_final_modules: [inst, every, ever]}";

        orchestrator
            .run_stage(Stage::Final, &context("i-1", BootKind::FirstBoot, config))
            .await;
        orchestrator
            .run_stage(Stage::Final, &context("i-1", BootKind::RepeatBoot, config))
            .await;
        orchestrator
            .run_stage(Stage::Final, &context("i-2", BootKind::FirstBoot, config))
            .await;

        assert_eq!(
            harness.calls(),
            vec![
                "inst@i-1:-",
                "every@i-1:-",
                "ever@i-1:-",
                "every@i-1:-",
                "inst@i-2:-",
                "every@i-2:-",
            ]
        );
    }

    #[tokio::test]
    async fn test_first_boot_ignores_leftover_instance_semaphore() {
        let harness = Harness::new().stub("inst", Frequency::PerInstance, Ok(()));
        let key = SemaphoreKey::new("inst", Frequency::PerInstance, "i-1").unwrap();
        harness.store.record(&key).await.unwrap();

        let report = harness
            .orchestrator()
            .run_stage(
                Stage::Final,
                &context("i-1", BootKind::FirstBoot, "{cloud_final_modules: [inst]}"),
            )
            .await;
        assert_eq!(report.executed(), vec!["inst"]);
    }

    #[tokio::test]
    async fn test_descriptor_frequency_override() {
        let harness = Harness::new().stub("inst", Frequency::PerInstance, Ok(()));
        let orchestrator = harness.orchestrator();
        let config = "{cloud_final_modules: [[inst, always]]}";

        for _ in 0..2 {
            orchestrator
                .run_stage(Stage::Final, &context("i-1", BootKind::RepeatBoot, config))
                .await;
        }
        assert_eq!(harness.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_semaphore_policy() {
        let harness = Harness::new().stub("inst", Frequency::PerInstance, Ok(()));
        let key = SemaphoreKey::new("inst", Frequency::PerInstance, "i-1").unwrap();
        harness.store.insert_corrupt(key);
        let ctx = context("i-1", BootKind::RepeatBoot, "{cloud_final_modules: [inst]}");

        let skipped = harness.orchestrator().run_stage(Stage::Final, &ctx).await;
        assert_eq!(skipped.count(&ModuleOutcome::Skipped), 1);

        let rerun = harness
            .orchestrator()
            .with_policy(CorruptSemaphorePolicy::Rerun)
            .run_stage(Stage::Final, &ctx)
            .await;
        assert_eq!(rerun.executed(), vec!["inst"]);
    }

    #[tokio::test]
    async fn test_unknown_module_is_skipped() {
        let harness = Harness::new().stub("known", Frequency::Always, Ok(()));
        let ctx = context("i-1", BootKind::FirstBoot, "{cloud_final_modules: [mystery, known]}");

        let report = harness.orchestrator().run_stage(Stage::Final, &ctx).await;
        assert_eq!(report.count(&ModuleOutcome::Unknown), 1);
        assert_eq!(report.executed(), vec!["known"]);
        assert!(!report.degraded());
    }

    #[tokio::test]
    async fn test_run_single_with_override() {
        let harness = Harness::new().stub("inst", Frequency::PerInstance, Ok(()));
        let orchestrator = harness.orchestrator();
        let ctx = context("i-1", BootKind::RepeatBoot, "{}");

        let first = orchestrator.run_single("inst", None, &ctx).await.unwrap();
        assert_eq!(first.outcome, ModuleOutcome::Ran);
        let second = orchestrator.run_single("inst", None, &ctx).await.unwrap();
        assert_eq!(second.outcome, ModuleOutcome::Skipped);
        let forced = orchestrator
            .run_single("inst", Some(Frequency::Always), &ctx)
            .await
            .unwrap();
        assert_eq!(forced.outcome, ModuleOutcome::Ran);

        assert!(orchestrator.run_single("nope", None, &ctx).await.is_err());
    }
}
