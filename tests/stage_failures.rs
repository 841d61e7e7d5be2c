//! Recoverable and fatal module errors as seen through status and result files

use async_trait::async_trait;
use cloud_init_core::config::ConfigValue;
use cloud_init_core::datasources::Datasource;
use cloud_init_core::datasources::mock::MockDatasource;
use cloud_init_core::modules::{Module, ModuleContext, ModuleError, ModuleRegistry};
use cloud_init_core::stages::ModuleOutcome;
use cloud_init_core::state::{BootResult, CloudPaths, Frequency, MemorySemaphoreStore};
use cloud_init_core::{Boot, Stage};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

type Calls = Arc<Mutex<Vec<&'static str>>>;

struct Step {
    name: &'static str,
    result: Result<(), ModuleError>,
    calls: Calls,
}

#[async_trait]
impl Module for Step {
    fn name(&self) -> &'static str {
        self.name
    }

    fn frequency(&self) -> Frequency {
        Frequency::Always
    }

    async fn handle(
        &self,
        _section: Option<&ConfigValue>,
        _ctx: &ModuleContext,
    ) -> Result<(), ModuleError> {
        self.calls.lock().unwrap().push(self.name);
        self.result.clone()
    }
}

fn boot(
    temp: &TempDir,
    userdata: &str,
    steps: &[(&'static str, Result<(), ModuleError>)],
) -> (Boot, Calls) {
    let calls = Calls::default();
    let mut registry = ModuleRegistry::new();
    for (name, result) in steps {
        registry.register(Arc::new(Step {
            name: *name,
            result: result.clone(),
            calls: Arc::clone(&calls),
        }));
    }

    let paths = CloudPaths::with_dirs(temp.path().join("var"), temp.path().join("etc"))
        .with_run_dir(temp.path().join("run"));
    let datasource: Box<dyn Datasource> = Box::new(
        MockDatasource::new()
            .with_instance_id("i-1")
            .with_userdata(userdata),
    );
    let boot = Boot::new(paths)
        .with_datasources(vec![datasource])
        .with_registry(registry)
        .with_store(Arc::new(MemorySemaphoreStore::new()));
    (boot, calls)
}

#[tokio::test]
async fn test_fatal_error_stops_the_stage() {
    let temp = TempDir::new().unwrap();
    let (boot, calls) = boot(
        &temp,
        "#cloud-config\ncloud_final_modules: [one, two, three, four]\n",
        &[
            ("one", Ok(())),
            ("two", Err(ModuleError::fatal("disk full"))),
            ("three", Ok(())),
            ("four", Ok(())),
        ],
    );

    boot.run_stage(Stage::Local).await.unwrap();
    let run = boot.run_stage(Stage::Final).await.unwrap();

    assert_eq!(*calls.lock().unwrap(), vec!["one", "two"]);
    assert_eq!(run.report.executed(), vec!["one", "two"]);
    assert_eq!(run.report.count(&ModuleOutcome::NotAttempted), 2);
    assert!(run.status.fatal);
    assert_eq!(run.status.fatal_error.as_deref(), Some("two: disk full"));

    let status = boot.state().read_status().await.unwrap();
    assert!(status.crashed());
    assert!(!status.degraded);

    let result: BootResult = serde_json::from_str(
        &std::fs::read_to_string(boot.paths().result_file()).unwrap(),
    )
    .unwrap();
    assert_eq!(result.datasource.as_deref(), Some("Mock"));
    assert_eq!(result.errors, vec!["final: two: disk full".to_string()]);
}

#[tokio::test]
async fn test_recoverable_error_degrades_the_boot() {
    let temp = TempDir::new().unwrap();
    let (boot, calls) = boot(
        &temp,
        "#cloud-config\ncloud_config_modules: [flaky, mystery, after]\n",
        &[
            ("flaky", Err(ModuleError::recoverable("exit status 1"))),
            ("after", Ok(())),
        ],
    );

    boot.run_stage(Stage::Local).await.unwrap();
    let run = boot.run_stage(Stage::Config).await.unwrap();

    assert_eq!(*calls.lock().unwrap(), vec!["flaky", "after"]);
    assert!(run.failed());
    assert!(!run.status.fatal);
    assert_eq!(run.status.errors, vec!["flaky: exit status 1".to_string()]);
    let outcomes: Vec<&str> = run
        .status
        .modules
        .iter()
        .map(|m| m.outcome.as_str())
        .collect();
    assert_eq!(outcomes, vec!["failed", "unknown", "ran"]);

    let status = boot.state().read_status().await.unwrap();
    assert!(status.degraded);
    assert!(!status.crashed());
    assert_eq!(status.all_errors(), vec!["config: flaky: exit status 1".to_string()]);
}

#[tokio::test]
async fn test_malformed_fragment_is_reported_not_fatal() {
    let temp = TempDir::new().unwrap();
    let (boot, calls) = boot(
        &temp,
        "Content-Type: multipart/mixed; boundary=B\n\n\
--B\nContent-Type: text/cloud-config\n\ncloud_final_modules: [one]\n\
--B\nContent-Type: text/cloud-config\n\nkey: [unclosed\n\
--B--\n",
        &[("one", Ok(()))],
    );

    let run = boot.run_stage(Stage::Local).await.unwrap();
    assert_eq!(run.status.errors.len(), 1);
    assert!(run.status.errors[0].contains("user-data/part-002"));

    let run = boot.run_stage(Stage::Final).await.unwrap();
    assert!(!run.failed());
    assert_eq!(*calls.lock().unwrap(), vec!["one"]);

    let status = boot.state().read_status().await.unwrap();
    assert!(status.degraded);
}
