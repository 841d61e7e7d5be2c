//! Per-stage results

use super::Stage;
use crate::state::{Frequency, ModuleStatus, StageStatus};
use chrono::{DateTime, Utc};
use std::fmt;

/// What happened to one module
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleOutcome {
    Ran,
    /// Semaphore present
    Skipped,
    /// Recoverable error
    Failed(String),
    /// Fatal error; the stage stopped here
    Crashed(String),
    /// An earlier module crashed the stage
    NotAttempted,
    /// Name not in the registry
    Unknown,
}

impl fmt::Display for ModuleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleOutcome::Ran => write!(f, "ran"),
            ModuleOutcome::Skipped => write!(f, "skipped"),
            ModuleOutcome::Failed(_) => write!(f, "failed"),
            ModuleOutcome::Crashed(_) => write!(f, "crashed"),
            ModuleOutcome::NotAttempted => write!(f, "not-attempted"),
            ModuleOutcome::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleResult {
    pub name: String,
    pub frequency: Option<Frequency>,
    pub outcome: ModuleOutcome,
}

impl ModuleResult {
    /// Whether the module's entry point was invoked
    pub fn executed(&self) -> bool {
        matches!(
            self.outcome,
            ModuleOutcome::Ran | ModuleOutcome::Failed(_) | ModuleOutcome::Crashed(_)
        )
    }
}

/// Result of one stage invocation
#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: Stage,
    pub start: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub modules: Vec<ModuleResult>,
}

impl StageReport {
    pub fn begin(stage: Stage) -> Self {
        Self {
            stage,
            start: Utc::now(),
            finished: None,
            modules: Vec::new(),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, frequency: Option<Frequency>, outcome: ModuleOutcome) {
        self.modules.push(ModuleResult {
            name: name.into(),
            frequency,
            outcome,
        });
    }

    pub fn finish(mut self) -> Self {
        self.finished = Some(Utc::now());
        self
    }

    /// Recoverable errors as `module: message`
    pub fn errors(&self) -> Vec<String> {
        self.modules
            .iter()
            .filter_map(|m| match &m.outcome {
                ModuleOutcome::Failed(message) => Some(format!("{}: {}", m.name, message)),
                _ => None,
            })
            .collect()
    }

    /// The fatal error that stopped the stage, if any
    pub fn fatal_error(&self) -> Option<String> {
        self.modules.iter().find_map(|m| match &m.outcome {
            ModuleOutcome::Crashed(message) => Some(format!("{}: {}", m.name, message)),
            _ => None,
        })
    }

    pub fn crashed(&self) -> bool {
        self.fatal_error().is_some()
    }

    pub fn degraded(&self) -> bool {
        self.modules
            .iter()
            .any(|m| matches!(m.outcome, ModuleOutcome::Failed(_)))
    }

    /// Names of modules whose entry point was invoked
    pub fn executed(&self) -> Vec<&str> {
        self.modules
            .iter()
            .filter(|m| m.executed())
            .map(|m| m.name.as_str())
            .collect()
    }

    pub fn count(&self, outcome: &ModuleOutcome) -> usize {
        self.modules.iter().filter(|m| &m.outcome == outcome).count()
    }

    /// Status record for status.json
    pub fn to_status(&self) -> StageStatus {
        StageStatus {
            start: self.start,
            finished: self.finished,
            errors: self.errors(),
            fatal: self.crashed(),
            fatal_error: self.fatal_error(),
            modules: self
                .modules
                .iter()
                .map(|m| ModuleStatus {
                    name: m.name.clone(),
                    outcome: m.outcome.to_string(),
                })
                .collect(),
        }
    }
}
