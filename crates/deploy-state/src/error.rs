//! Errors from the rollout history store.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    /// The database file could not be created or opened.
    #[error("cannot open state database: {0}")]
    Open(String),

    /// A redb transaction, table, or storage operation failed.
    #[error("state database: {0}")]
    Storage(String),

    #[error("cannot encode {kind} `{key}`: {reason}")]
    Encode {
        kind: &'static str,
        key: String,
        reason: String,
    },

    /// A stored value no longer decodes, e.g. after a format change.
    #[error("stored {kind} `{key}` is unreadable: {reason}")]
    Corrupt {
        kind: &'static str,
        key: String,
        reason: String,
    },

    #[error("rollout {0} is still in progress and cannot be stored")]
    NotFinalized(String),
}
