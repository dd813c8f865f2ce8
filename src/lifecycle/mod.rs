//! Control of the process bound to a slot
//!
//! Each slot runs as one service-manager unit named `<prefix><slot>.service`.
//! Two clients are provided: [`SystemctlLifecycle`] shells out to
//! `systemctl`, [`BusctlLifecycle`] calls the systemd manager over D-Bus.

mod busctl;
mod systemctl;

pub use busctl::BusctlLifecycle;
pub use systemctl::SystemctlLifecycle;

use crate::config::{Config, LifecycleKind};
use crate::error::Result;
use crate::exec::SystemRunner;
use crate::types::{Slot, SlotStatus};

/// Lifecycle details of one slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotDetails {
    pub slot: Slot,
    pub unit: String,
    pub status: SlotStatus,
    pub ip: &'static str,
}

/// Start, stop and query slot processes
pub trait SlotLifecycle {
    /// Unit name for a slot
    fn unit_name(&self, slot: Slot) -> String;

    fn start(&self, slot: Slot) -> Result<()>;

    fn stop(&self, slot: Slot) -> Result<()>;

    fn restart(&self, slot: Slot) -> Result<()>;

    /// Query the unit without side effects
    fn status(&self, slot: Slot) -> Result<SlotStatus>;

    /// Check if a slot is running
    fn is_running(&self, slot: Slot) -> Result<bool> {
        Ok(self.status(slot)? == SlotStatus::Running)
    }

    fn details(&self, slot: Slot) -> Result<SlotDetails> {
        Ok(SlotDetails {
            slot,
            unit: self.unit_name(slot),
            status: self.status(slot)?,
            ip: slot.ip(),
        })
    }
}

impl<L: SlotLifecycle + ?Sized> SlotLifecycle for &L {
    fn unit_name(&self, slot: Slot) -> String {
        (**self).unit_name(slot)
    }

    fn start(&self, slot: Slot) -> Result<()> {
        (**self).start(slot)
    }

    fn stop(&self, slot: Slot) -> Result<()> {
        (**self).stop(slot)
    }

    fn restart(&self, slot: Slot) -> Result<()> {
        (**self).restart(slot)
    }

    fn status(&self, slot: Slot) -> Result<SlotStatus> {
        (**self).status(slot)
    }
}

impl<L: SlotLifecycle + ?Sized> SlotLifecycle for Box<L> {
    fn unit_name(&self, slot: Slot) -> String {
        (**self).unit_name(slot)
    }

    fn start(&self, slot: Slot) -> Result<()> {
        (**self).start(slot)
    }

    fn stop(&self, slot: Slot) -> Result<()> {
        (**self).stop(slot)
    }

    fn restart(&self, slot: Slot) -> Result<()> {
        (**self).restart(slot)
    }

    fn status(&self, slot: Slot) -> Result<SlotStatus> {
        (**self).status(slot)
    }
}

/// Build the lifecycle client selected by the config
pub fn from_config(config: &Config) -> Box<dyn SlotLifecycle> {
    let prefix = config.service_prefix.clone();
    match config.lifecycle {
        LifecycleKind::Systemctl => Box::new(SystemctlLifecycle::new(SystemRunner, prefix)),
        LifecycleKind::Busctl => Box::new(BusctlLifecycle::new(SystemRunner, prefix)),
    }
}
