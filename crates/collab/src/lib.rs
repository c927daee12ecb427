//! Collaboration features for real-time document editing.
//!
//! This crate keeps several editors of the same rich-text field consistent
//! through operational transformation against a central authority.
//!
//! # Modules
//!
//! - `transform`: Rebasing pending local steps over confirmed remote steps
//! - `session`: Editor session state machine (join, edit, resync, close)
//! - `registry`: Per-client registry of sessions and message routing
//! - `authority`: Authoritative state, ordering and fan-out per session
//! - `protocol`: Messages between sessions and the authority
//! - `channel`: The connection a client uses to reach the authority
//! - `presence`: Which users are editing which field
//! - `interfaces`: Host-provided persistence, notification and rendering
//! - `codec`: Wire encoding of steps
//! - `error`: Error types for the collaboration crate
//!
//! # Example
//!
//! ```
//! use collab::transform::{ConfirmedStep, OtEngine, TransformEngine};
//! use collab::{ClientId, UserId};
//! use doc_model::{Document, DocumentState, Step};
//!
//! let confirmed = DocumentState::new(Document::from_paragraphs(["abcdefgh"]));
//! let pending = vec![Step::insert_text(5, "!")];
//! let incoming = vec![ConfirmedStep::new(
//!     Step::insert_text(2, "?"),
//!     UserId::from("bob"),
//!     ClientId::from("bob-tab"),
//! )];
//!
//! let rebased = OtEngine
//!     .rebase(&confirmed, &pending, &incoming, &ClientId::from("alice-tab"))
//!     .unwrap();
//! assert_eq!(rebased.pending, vec![Step::insert_text(6, "!")]);
//! assert_eq!(rebased.local.doc().text_content(), "a?bcd!efgh");
//! ```

pub mod authority;
pub mod channel;
pub mod codec;
pub mod error;
pub mod ids;
pub mod interfaces;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transform;

/// WebSocket collaboration server module.
///
/// This module is only available when the `server` feature is enabled.
///
/// # Example
///
/// ```ignore
/// use collab::server::{CollaborationServer, ServerConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let config = ServerConfig::with_port(8080);
///     let server = CollaborationServer::new(config);
///     server.run().await.unwrap();
/// }
/// ```
#[cfg(feature = "server")]
pub mod server;

// Re-export commonly used types
pub use authority::{
    AccessPolicy, AllowAll, Authority, AuthorityCommand, AuthorityConfig, AuthorityHandle,
    AuthorityService, AuthorityStats,
};
pub use channel::{Channel, LocalChannel};
pub use codec::{JsonStepCodec, StepCodec};
pub use error::{CollabError, CollabResult};
pub use ids::{ClientId, FieldTarget, SessionKey, UserId};
pub use interfaces::{
    ContentPreserver, DocumentStore, EditorView, LogNotifier, LogPreserver, MemoryStore, Notifier,
    RecordingNotifier, RecordingPreserver, WarnOptions,
};
pub use presence::{EditorRoster, PresenceChange, PresenceTracker};
pub use protocol::{ClientMessage, ServerMessage, WireHistoryEntry};
pub use registry::EditorRegistry;
pub use session::{EditorSession, SessionConfig, SessionEvent, SessionServices, SessionStatus};
pub use transform::{ConfirmedStep, OtEngine, Rebased, TransformEngine};
