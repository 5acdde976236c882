//! Deployment rollouts — stage execution, state machine, rollback.
//!
//! This crate drives one deployment from build to verified health. It
//! calls external collaborators for every side effect and never touches a
//! cluster directly, so the same controller runs against real tooling or
//! the in-memory doubles in [`memory`].
//!
//! # Components
//!
//! - **`collaborators`** — Builder, applier, quality and sink contracts
//! - **`executor`** — Runs one stage with retries, backoff, and a deadline
//! - **`controller`** — Rollout state machine and committal-point logic
//! - **`rollback`** — Restores the known-good resource set
//! - **`memory`** — In-memory collaborators for dry runs and tests

pub mod collaborators;
pub mod controller;
pub mod executor;
pub mod memory;
pub mod rollback;

pub use collaborators::{
    ApplyOutcome, ArtifactBuilder, Collaborators, NotificationSink, QualityChecker,
    ResourceApplier,
};
pub use controller::{RolloutController, planned_stages};
pub use executor::{Stage, StageContext, StageExecutor};
pub use rollback::{RollbackController, RollbackPlan};
