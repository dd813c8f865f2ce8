//! Multi-step commands: migrate and confirmed delete

use crate::backend::DatasetBackend;
use crate::error::{Error, MigrateStep, Result};
use crate::lifecycle::SlotLifecycle;
use crate::provider::StateProvider;
use crate::types::{Slot, SlotStatus, State};
use std::thread;
use std::time::Duration;

/// Literal the operator must type to confirm a delete
pub const DELETE_CONFIRMATION: &str = "DELETE";

#[derive(Debug, Clone, Default)]
pub struct MigrateOptions {
    /// Wait after stopping the slot before its image is swapped
    pub settle_delay: Duration,
    /// Allow the state to stay bound to another slot as well
    pub force: bool,
}

/// A completed migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrateOutcome {
    pub slot: Slot,
    pub state: State,
    pub previous: String,
    pub was_running: bool,
    pub created: bool,
}

/// Stop the slot, assign the state, start the slot.
///
/// Steps run strictly in that order and nothing is rolled back. A failure is
/// reported as [`Error::MigrationFailed`] naming the step:
///
/// * stop: the slot is untouched and still running,
/// * assign: the slot is stopped and keeps its old state,
/// * start: the slot is stopped with the new state already assigned.
///
/// The slot is never stopped if the assignment is known to be refused, and
/// a slot whose status cannot be read is treated as possibly running.
pub fn migrate<B, L>(
    states: &StateProvider<B>,
    lifecycle: &L,
    state: &State,
    slot: Slot,
    options: &MigrateOptions,
) -> Result<MigrateOutcome>
where
    B: DatasetBackend,
    L: SlotLifecycle + ?Sized,
{
    let _lock = states.lock()?;

    states.check_assignable(slot, state, options.force)?;

    let status = lifecycle
        .status(slot)
        .map_err(|e| Error::migration(MigrateStep::Stop, e))?;
    let was_running = match status {
        SlotStatus::Running => true,
        SlotStatus::Stopped | SlotStatus::Failed => false,
        SlotStatus::Unknown => {
            return Err(Error::migration(
                MigrateStep::Stop,
                Error::Systemd(format!("cannot determine whether {} is running", slot)),
            ))
        }
    };

    if was_running {
        tracing::info!(slot = %slot, "stopping slot for migration");
        lifecycle
            .stop(slot)
            .map_err(|e| Error::migration(MigrateStep::Stop, e))?;
        if !options.settle_delay.is_zero() {
            thread::sleep(options.settle_delay);
        }
    }

    let assigned = states
        .assign_state(slot, state, options.force)
        .map_err(|e| Error::migration(MigrateStep::Assign, e))?;

    lifecycle
        .start(slot)
        .map_err(|e| Error::migration(MigrateStep::Start, e))?;

    tracing::info!(slot = %slot, state = %state, "migration complete");
    Ok(MigrateOutcome {
        slot,
        state: state.clone(),
        previous: assigned.previous,
        was_running,
        created: assigned.created,
    })
}

/// Delete a state after the operator types [`DELETE_CONFIRMATION`].
///
/// Existence and the in-use check run before asking, so a refused delete
/// never prompts. `confirm` returns the operator's answer.
pub fn delete_confirmed<B, F>(
    states: &StateProvider<B>,
    state: &State,
    force: bool,
    confirm: F,
) -> Result<()>
where
    B: DatasetBackend,
    F: FnOnce(&State) -> Result<String>,
{
    if !states.state_exists(state)? {
        return Err(Error::StateNotFound(state.clone()));
    }
    if !force {
        if let Some(slot) = states.is_state_in_use(state)? {
            return Err(Error::StateInUse {
                state: state.clone(),
                slot,
            });
        }
    }

    let answer = confirm(state)?;
    if answer.trim() != DELETE_CONFIRMATION {
        tracing::info!(state = %state, "delete not confirmed");
        return Err(Error::Aborted);
    }

    states.delete_state(state, force)
}
