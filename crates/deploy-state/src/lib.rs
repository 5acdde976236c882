//! deploy-state — embedded rollout history for the deployment orchestrator.
//!
//! Backed by [redb](https://docs.rs/redb). Finalized rollout records are kept
//! for audit, and the last fully-succeeded resource set of each environment
//! is kept as its rollback target.
//!
//! # Architecture
//!
//! Records are JSON-serialized into redb's `&[u8]` value columns. Rollout
//! keys are `{environment}/{rollout_id}` so one environment's history is a
//! prefix scan; known-good sets are keyed by environment alone.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::StateStore;
