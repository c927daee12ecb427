//! Error types for the collaboration crate.

use crate::ids::SessionKey;
use crate::session::SessionStatus;
use doc_model::DocModelError;
use thiserror::Error;

/// Result type alias for collaboration operations.
pub type CollabResult<T> = Result<T, CollabError>;

/// Errors that can occur during collaborative editing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollabError {
    /// A step cannot be applied to the current content tree.
    #[error("Schema violation: {0}")]
    SchemaViolation(#[from] DocModelError),

    /// Rebasing could not produce a valid merged document.
    #[error("Irreconcilable state: {0}")]
    IrreconcilableState(String),

    /// A submission was computed against a version the authority moved past.
    #[error("Stale version: submitted against {base}, authority is at {current}")]
    StaleVersion { base: u64, current: u64 },

    /// The collaboration channel is not connected.
    #[error("Collaboration channel disconnected")]
    ChannelDisconnected,

    /// The authority refused to let this client edit the field.
    #[error("Join denied for {key}: {reason}")]
    JoinDenied { key: SessionKey, reason: String },

    /// The session cannot accept edits in its current state.
    #[error("Session {key} is not active ({status:?})")]
    NotActive { key: SessionKey, status: SessionStatus },

    /// No session is registered under the key.
    #[error("Unknown session: {0}")]
    UnknownSession(SessionKey),

    /// A step could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Saving content to the document store failed.
    #[error("Persistence error: {0}")]
    Persistence(String),
}
