//! # Error Taxonomy
//!
//! Failure modes of identity resolution and deduplication. Consistency and
//! invariant errors abort the enclosing request before any write; pipeline
//! errors are recoverable by re-invocation.

use thiserror::Error;

use crate::model::ProfileId;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// All failure modes surfaced by the resolution and deduplication core.
#[derive(Debug, Error)]
pub enum Error {
    /// A profile was loaded for id X but neither its canonical id nor its
    /// alternate-id set contains X. Signals a forged or unrelated id and
    /// aborts the request without retry.
    #[error(
        "inconsistent load: profile '{loaded}' answered the lookup for id \
         '{requested}', which is neither its id nor one of its alternate ids"
    )]
    InconsistentLoad {
        requested: ProfileId,
        loaded: ProfileId,
    },

    /// A resolved (profile, session) pair failed a post-condition. Indicates
    /// a logic bug, never bad input.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// No configured or default strategy accepted a field's observed values.
    /// Carries every candidate value for diagnosis.
    #[error("could not merge field '{field}': no strategy accepted values [{}]", values.join(", "))]
    UnmergeableField { field: String, values: Vec<String> },

    /// Duplicate discovery for an id returned nothing. The profile was
    /// already absorbed by a prior merge or deleted.
    #[error("no profile records found for '{0}', probably already merged")]
    AlreadyMerged(ProfileId),

    /// The advisory lock for a profile key is held elsewhere. Never retried
    /// internally.
    #[error("profile lock busy for key '{0}'")]
    LockBusy(String),

    /// A stored record could not be decoded into its domain type.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// Transport or backend failure from the store. Opaque to the core
    /// beyond "not found" vs "other failure".
    #[error("storage backend: {0}")]
    Storage(String),
}

impl Error {
    /// Invariant breakage helper used at post-condition checkpoints.
    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::InvariantViolation(msg.into())
    }

    /// Storage failure helper for backend implementations.
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmergeable_field_lists_candidates() {
        let err = Error::UnmergeableField {
            field: "traits.age".to_string(),
            values: vec!["41".to_string(), "\"old\"".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("traits.age"));
        assert!(msg.contains("41"));
        assert!(msg.contains("\"old\""));
    }

    #[test]
    fn inconsistent_load_names_both_ids() {
        let err = Error::InconsistentLoad {
            requested: ProfileId::from("p123"),
            loaded: ProfileId::from("x999"),
        };
        let msg = err.to_string();
        assert!(msg.contains("p123"));
        assert!(msg.contains("x999"));
    }
}
