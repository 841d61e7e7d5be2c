//! Cloud-init execution stages
//!
//! Stages run in order during boot, one per process invocation:
//! 1. Local - before network (datasource discovery, identity)
//! 2. Network - after network is up (`cloud_init_modules`)
//! 3. Config - configuration application (`cloud_config_modules`)
//! 4. Final - user scripts and final tasks (`cloud_final_modules`)

pub mod descriptor;
pub mod orchestrator;
pub mod report;

pub use descriptor::{ModuleDescriptor, resolve_descriptors};
pub use orchestrator::StageOrchestrator;
pub use report::{ModuleOutcome, ModuleResult, StageReport};

use crate::CloudInitError;
use std::str::FromStr;

/// Cloud-init execution stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Local stage - runs before network is available
    Local,
    /// Network stage - runs after network is configured
    Network,
    /// Config stage - applies user configuration
    Config,
    /// Final stage - runs user scripts
    Final,
}

impl Stage {
    /// Every stage in boot order
    pub const ALL: [Stage; 4] = [Stage::Local, Stage::Network, Stage::Config, Stage::Final];

    /// Configuration key listing this stage's modules
    pub fn module_key(&self) -> Option<&'static str> {
        match self {
            Stage::Local => None,
            Stage::Network => Some("cloud_init_modules"),
            Stage::Config => Some("cloud_config_modules"),
            Stage::Final => Some("cloud_final_modules"),
        }
    }

    /// Whether this stage discovers the datasource and resolves identity
    /// rather than reusing the cached instance
    pub fn discovers(&self) -> bool {
        matches!(self, Stage::Local | Stage::Network)
    }

    /// Whether the network can be expected up when this stage runs
    pub fn network_ready(&self) -> bool {
        !matches!(self, Stage::Local)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Local => write!(f, "local"),
            Stage::Network => write!(f, "network"),
            Stage::Config => write!(f, "config"),
            Stage::Final => write!(f, "final"),
        }
    }
}

impl FromStr for Stage {
    type Err = CloudInitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Stage::Local),
            "network" | "init" => Ok(Stage::Network),
            "config" => Ok(Stage::Config),
            "final" => Ok(Stage::Final),
            other => Err(CloudInitError::stage(other, "unknown stage")),
        }
    }
}
