//! redb table definitions for the state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Finalized rollout records keyed by `{environment}/{rollout_id}`.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

/// Known-good resource sets keyed by `{environment}`.
pub const KNOWN_GOOD: TableDefinition<&str, &[u8]> = TableDefinition::new("known_good");

pub fn rollout_key(environment: &str, rollout_id: &str) -> String {
    format!("{environment}/{rollout_id}")
}

pub fn environment_prefix(environment: &str) -> String {
    format!("{environment}/")
}
