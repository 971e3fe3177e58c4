//! Environment-control feature: runtime information and the emergency
//! lock down trigger.

use async_trait::async_trait;

use super::{Command, CommandResult, Feature};
use crate::error::CommandError;
use crate::processor::COMMAND_DURATION_STATS;
use crate::{inet, lockdown, unix_now, uptime_secs};

const BAD_CHOICE: &str = "lock | info";

/// Retrieve runtime information or trigger the emergency lock down.
#[derive(Debug, Clone, Default)]
pub struct EnvControl;

async fn runtime_info() -> String {
    format!(
        "IP: {}\nClock: {}\nUptime: {}s\nCommand stats: {}\n",
        inet::get_public_ip().await,
        unix_now(),
        uptime_secs(),
        COMMAND_DURATION_STATS.format(1_000_000.0)
    )
}

#[async_trait]
impl Feature for EnvControl {
    fn is_configured(&self) -> bool {
        true
    }

    fn initialise(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn self_test(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn trigger(&self) -> &'static str {
        ".e"
    }

    async fn execute(&self, mut cmd: Command) -> CommandResult {
        if let Some(err_result) = cmd.trim() {
            return err_result;
        }
        match cmd.content.to_lowercase().as_str() {
            "lock" => {
                lockdown::trigger();
                CommandResult::from_output("OK - EmergencyLockDown")
            }
            "info" => CommandResult::from_output(runtime_info().await),
            _ => CommandResult::from_error(CommandError::Feature(BAD_CHOICE.to_string())),
        }
    }
}
