//! Exactly-once-effective restore of one host per contender.
//!
//! Flow for one contender: [`RestoreCoordinator::prepare`] resolves the plan,
//! the distributed mutex is acquired in exclusive mode, [`RestoreExecutor`]
//! consults the [`IdempotencyGuard`] and calls the transfer engine, and the
//! outcome goes through [`StatusSynchronizer`] or [`FailureHandler`] before
//! the lock is released.

mod coordinator;
mod executor;
mod failure;
mod guard;
mod host;
mod status;

pub use coordinator::{RestoreCoordinator, RestoreOutcome, RestoreReport, exit_code};
pub use executor::{ExecutionOutcome, RestoreExecutor, RestorePlan};
pub use failure::FailureHandler;
pub use guard::IdempotencyGuard;
pub use host::{TargetReplicaTopology, TopologyProvider, hostname_for};
pub use status::{StatusSynchronizer, StatusUpdate, merge_status};
