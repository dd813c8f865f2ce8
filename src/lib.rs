//! vm-state: Manage portable MicroVM states
//!
//! States are copy-on-write datasets that can be snapshotted, cloned and
//! moved between slots (fixed network identities). [`StateProvider`] layers
//! state semantics over a [`DatasetBackend`]; [`SlotLifecycle`] controls the
//! process bound to each slot; [`workflow`] combines the two.

pub mod backend;
pub mod config;
pub mod error;
pub mod exec;
pub mod lifecycle;
pub mod provider;
pub mod store;
pub mod types;
pub mod workflow;

pub use backend::DatasetBackend;
pub use config::Config;
pub use error::{Error, ErrorKind, MigrateStep, Result};
pub use lifecycle::SlotLifecycle;
pub use provider::StateProvider;
pub use types::{Slot, SlotInfo, SlotStatus, Snapshot, SnapshotInfo, State, StateInfo};
