//! Bootcmd module - execute early boot commands
//!
//! These commands run on every boot, very early in the process, before most
//! other cloud-init modules. The instance id is exported to them as
//! `INSTANCE_ID`.

use super::runcmd::{RunCmd, parse_commands};
use super::{Module, ModuleContext, ModuleError};
use crate::config::ConfigValue;
use crate::state::Frequency;
use async_trait::async_trait;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct BootCmd;

#[async_trait]
impl Module for BootCmd {
    fn name(&self) -> &'static str {
        "bootcmd"
    }

    fn frequency(&self) -> Frequency {
        Frequency::Always
    }

    async fn handle(
        &self,
        section: Option<&ConfigValue>,
        ctx: &ModuleContext,
    ) -> Result<(), ModuleError> {
        let Some(section) = section else {
            debug!("Skipping bootcmd: no 'bootcmd' key in configuration");
            return Ok(());
        };
        let commands = parse_commands(self.name(), section)?;
        if commands.is_empty() {
            return Ok(());
        }

        info!("Executing {} bootcmd commands", commands.len());
        let mut failures = Vec::new();
        for (i, cmd) in commands.iter().enumerate() {
            if let Err(e) = run(cmd, &ctx.instance_id).await {
                warn!("bootcmd {}/{} failed: {}", i + 1, commands.len(), e);
                failures.push(format!("command {}: {}", i + 1, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ModuleError::Recoverable(failures.join("; ")))
        }
    }
}

async fn run(cmd: &RunCmd, instance_id: &str) -> Result<(), String> {
    let mut command = match cmd {
        RunCmd::Shell(shell_cmd) => {
            debug!("Running bootcmd shell command: {}", shell_cmd);
            let mut command = tokio::process::Command::new("sh");
            command.args(["-c", shell_cmd.as_str()]);
            command
        }
        RunCmd::Args(args) => {
            let Some((program, rest)) = args.split_first() else {
                return Ok(());
            };
            debug!("Running bootcmd: {:?}", args);
            let mut command = tokio::process::Command::new(program);
            command.args(rest);
            command
        }
    };

    let status = command
        .env("INSTANCE_ID", instance_id)
        .status()
        .await
        .map_err(|e| format!("failed to spawn: {e}"))?;

    if status.success() {
        Ok(())
    } else {
        Err(format!("exit status {}", status.code().unwrap_or(-1)))
    }
}
