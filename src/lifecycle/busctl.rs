//! Slot control through the systemd manager's D-Bus interface
//!
//! Uses `busctl` as the bus client: job methods on
//! `org.freedesktop.systemd1.Manager` and the unit's `ActiveState` property.

use super::SlotLifecycle;
use crate::error::{Error, Result};
use crate::exec::CommandRunner;
use crate::types::{Slot, SlotStatus};

const DESTINATION: &str = "org.freedesktop.systemd1";
const MANAGER_PATH: &str = "/org/freedesktop/systemd1";
const MANAGER_INTERFACE: &str = "org.freedesktop.systemd1.Manager";
const UNIT_INTERFACE: &str = "org.freedesktop.systemd1.Unit";

pub struct BusctlLifecycle<R> {
    runner: R,
    prefix: String,
}

impl<R: CommandRunner> BusctlLifecycle<R> {
    pub fn new(runner: R, prefix: impl Into<String>) -> Self {
        Self {
            runner,
            prefix: prefix.into(),
        }
    }

    fn busctl(&self, args: &[&str]) -> Result<String> {
        self.runner.run("busctl", args).map_err(|e| match e {
            Error::CommandFailed { stderr, .. } => Error::Systemd(stderr),
            other => other,
        })
    }

    /// Queue a job for the slot's unit in "replace" mode
    fn call_unit_method(&self, method: &str, slot: Slot) -> Result<()> {
        let unit = self.unit_name(slot);
        tracing::info!(slot = %slot, unit = %unit, method, "systemd job");
        self.runner
            .run(
                "busctl",
                &[
                    "call",
                    DESTINATION,
                    MANAGER_PATH,
                    MANAGER_INTERFACE,
                    method,
                    "ss",
                    &unit,
                    "replace",
                ],
            )
            .map_err(|e| match e {
                Error::CommandFailed { stderr, .. } => {
                    Error::Systemd(format!("Failed to call {}: {}", method, stderr))
                }
                other => other,
            })?;
        Ok(())
    }

    /// Object path of the unit, loading it if needed
    fn unit_path(&self, unit: &str) -> Result<String> {
        let output = self.busctl(&[
            "call",
            DESTINATION,
            MANAGER_PATH,
            MANAGER_INTERFACE,
            "LoadUnit",
            "s",
            unit,
        ])?;
        parse_reply(&output, "o")
            .ok_or_else(|| Error::Systemd(format!("Failed to parse unit path for {}", unit)))
    }

    fn unit_property(&self, unit: &str, property: &str) -> Result<String> {
        let path = self.unit_path(unit)?;
        let output = self.busctl(&[
            "get-property",
            DESTINATION,
            &path,
            UNIT_INTERFACE,
            property,
        ])?;
        parse_reply(&output, "s").ok_or_else(|| {
            Error::Systemd(format!("Failed to parse {} of {}", property, unit))
        })
    }
}

/// Extract the value from a single-value busctl reply such as `s "active"`
fn parse_reply(output: &str, signature: &str) -> Option<String> {
    let rest = output.trim().strip_prefix(signature)?.trim_start();
    let value = rest.strip_prefix('"')?.strip_suffix('"')?;
    Some(value.to_string())
}

impl<R: CommandRunner> SlotLifecycle for BusctlLifecycle<R> {
    fn unit_name(&self, slot: Slot) -> String {
        slot.unit_name(&self.prefix)
    }

    fn start(&self, slot: Slot) -> Result<()> {
        self.call_unit_method("StartUnit", slot)
    }

    fn stop(&self, slot: Slot) -> Result<()> {
        self.call_unit_method("StopUnit", slot)
    }

    fn restart(&self, slot: Slot) -> Result<()> {
        self.call_unit_method("RestartUnit", slot)
    }

    fn status(&self, slot: Slot) -> Result<SlotStatus> {
        let unit = self.unit_name(slot);
        match self.unit_property(&unit, "ActiveState") {
            Ok(state) => Ok(SlotStatus::from_active_state(&state)),
            Err(e) => {
                tracing::warn!(unit = %unit, error = %e, "could not read unit state");
                Ok(SlotStatus::Unknown)
            }
        }
    }
}
