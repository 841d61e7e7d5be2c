//! cloud-init-core library
//!
//! The core of an instance bring-up tool: it aggregates configuration from
//! the kernel command line, the system configuration, vendor-data and
//! user-data under explicit merge directives, decides whether this boot is
//! the first boot of an instance, and runs configuration modules stage by
//! stage, each at most as often as its frequency allows.
//!
//! # Layout
//!
//! - [`config`]: merge engine, directives, fragment aggregation, loaders
//! - [`userdata`], [`template`]: raw datasource payloads to fragments
//! - [`state`]: persisted layout, semaphores, instance identity, status
//! - [`stages`], [`modules`]: the orchestrator and the module contract
//! - [`datasources`]: where instance metadata and user-data come from
//! - [`boot`]: one invocation, tying the above together

pub mod boot;
pub mod config;
pub mod datasources;
pub mod modules;
pub mod stages;
pub mod state;
pub mod template;
pub mod userdata;

mod error;

pub use boot::{Boot, BootContext, StageRun};
pub use datasources::InstanceMetadata;
pub use error::CloudInitError;
pub use stages::Stage;
