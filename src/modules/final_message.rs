//! Final message module
//!
//! Logs a completion message and writes the instance's `boot-finished`
//! marker. The message may use `$INSTANCE_ID`, `$TIMESTAMP`, `$VERSION` and
//! `$UPTIME`.

use super::{Module, ModuleContext, ModuleError};
use crate::config::ConfigValue;
use crate::state::{Frequency, InstanceState};
use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

const DEFAULT_MESSAGE: &str =
    "cloud-init v. $VERSION finished at $TIMESTAMP. Instance $INSTANCE_ID. Up $UPTIME seconds";

#[derive(Debug, Default)]
pub struct FinalMessage;

#[async_trait]
impl Module for FinalMessage {
    fn name(&self) -> &'static str {
        "final_message"
    }

    fn frequency(&self) -> Frequency {
        Frequency::Always
    }

    async fn handle(
        &self,
        section: Option<&ConfigValue>,
        ctx: &ModuleContext,
    ) -> Result<(), ModuleError> {
        let template = match section {
            None | Some(ConfigValue::Null) => DEFAULT_MESSAGE,
            Some(ConfigValue::String(message)) => message.as_str(),
            Some(_) => {
                return Err(ModuleError::recoverable(
                    "final_message must be a string",
                ));
            }
        };

        let uptime = read_uptime().await.unwrap_or_else(|| "unknown".to_string());
        info!("{}", render(template, &ctx.instance_id, &uptime));

        InstanceState::with_paths(ctx.paths.clone())
            .mark_boot_finished(&ctx.instance_id)
            .await
            .map_err(|e| ModuleError::recoverable(format!("writing boot-finished: {e}")))
    }
}

fn render(template: &str, instance_id: &str, uptime: &str) -> String {
    template
        .replace("$INSTANCE_ID", instance_id)
        .replace("$TIMESTAMP", &Utc::now().to_rfc2822())
        .replace("$VERSION", env!("CARGO_PKG_VERSION"))
        .replace("$UPTIME", uptime)
}

async fn read_uptime() -> Option<String> {
    let content = tokio::fs::read_to_string("/proc/uptime").await.ok()?;
    content.split_whitespace().next().map(str::to_string)
}
