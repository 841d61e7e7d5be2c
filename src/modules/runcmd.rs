//! Runcmd module - execute commands from cloud-config

use super::{Module, ModuleContext, ModuleError};
use crate::config::ConfigValue;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

/// One command: a shell string or an argv list
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RunCmd {
    Shell(String),
    Args(Vec<String>),
}

/// Parse a command list section
pub fn parse_commands(module: &str, section: &ConfigValue) -> Result<Vec<RunCmd>, ModuleError> {
    serde_yaml::from_value(section.clone())
        .map_err(|e| ModuleError::recoverable(format!("invalid {module} section: {e}")))
}

/// Execute commands in order; failures are collected, not short-circuited
pub async fn execute_commands(label: &str, commands: &[RunCmd]) -> Result<(), ModuleError> {
    info!("Executing {} {} commands", commands.len(), label);

    let mut failures = Vec::new();
    for (i, cmd) in commands.iter().enumerate() {
        debug!("Executing {} {}/{}", label, i + 1, commands.len());
        if let Err(e) = execute_command(label, cmd).await {
            failures.push(format!("command {}: {}", i + 1, e));
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(ModuleError::Recoverable(failures.join("; ")))
    }
}

async fn execute_command(label: &str, cmd: &RunCmd) -> Result<(), String> {
    let output = match cmd {
        RunCmd::Shell(shell_cmd) => {
            debug!("Running {} shell command: {}", label, shell_cmd);
            tokio::process::Command::new("sh")
                .args(["-c", shell_cmd.as_str()])
                .output()
                .await
                .map_err(|e| format!("failed to spawn sh: {e}"))?
        }
        RunCmd::Args(args) => {
            let Some((program, rest)) = args.split_first() else {
                return Ok(());
            };
            debug!("Running {}: {:?}", label, args);
            tokio::process::Command::new(program)
                .args(rest)
                .output()
                .await
                .map_err(|e| format!("failed to spawn {program}: {e}"))?
        }
    };

    if !output.stdout.is_empty() {
        debug!("{} stdout: {}", label, String::from_utf8_lossy(&output.stdout));
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(
            "{} exited with status {}: {}",
            label,
            output.status.code().unwrap_or(-1),
            stderr.trim()
        );
        return Err(format!(
            "exit status {}",
            output.status.code().unwrap_or(-1)
        ));
    }

    Ok(())
}

/// Runs `runcmd` once per instance
#[derive(Debug, Default)]
pub struct RunCmdModule;

#[async_trait]
impl Module for RunCmdModule {
    fn name(&self) -> &'static str {
        "runcmd"
    }

    async fn handle(
        &self,
        section: Option<&ConfigValue>,
        _ctx: &ModuleContext,
    ) -> Result<(), ModuleError> {
        let Some(section) = section else {
            debug!("Skipping runcmd: no 'runcmd' key in configuration");
            return Ok(());
        };
        let commands = parse_commands(self.name(), section)?;
        execute_commands("runcmd", &commands).await
    }
}
