//! Slot control through the `systemctl` command

use super::SlotLifecycle;
use crate::error::{Error, Result};
use crate::exec::CommandRunner;
use crate::types::{Slot, SlotStatus};

pub struct SystemctlLifecycle<R> {
    runner: R,
    prefix: String,
}

impl<R: CommandRunner> SystemctlLifecycle<R> {
    pub fn new(runner: R, prefix: impl Into<String>) -> Self {
        Self {
            runner,
            prefix: prefix.into(),
        }
    }

    /// Run systemctl command
    fn systemctl(&self, action: &str, slot: Slot) -> Result<()> {
        let unit = self.unit_name(slot);
        tracing::info!(slot = %slot, unit = %unit, action, "systemctl");
        self.runner
            .run("systemctl", &[action, &unit])
            .map_err(|e| match e {
                Error::CommandFailed { stderr, .. } => {
                    Error::Systemd(format!("{} {}: {}", action, unit, stderr))
                }
                other => other,
            })?;
        Ok(())
    }
}

impl<R: CommandRunner> SlotLifecycle for SystemctlLifecycle<R> {
    fn unit_name(&self, slot: Slot) -> String {
        slot.unit_name(&self.prefix)
    }

    fn start(&self, slot: Slot) -> Result<()> {
        self.systemctl("start", slot)
    }

    fn stop(&self, slot: Slot) -> Result<()> {
        self.systemctl("stop", slot)
    }

    fn restart(&self, slot: Slot) -> Result<()> {
        self.systemctl("restart", slot)
    }

    fn status(&self, slot: Slot) -> Result<SlotStatus> {
        // is-active exits non-zero for anything but "active" yet still prints the state.
        let output = self
            .runner
            .output("systemctl", &["is-active", &self.unit_name(slot)])?;
        Ok(SlotStatus::from_active_state(&output.stdout))
    }
}
