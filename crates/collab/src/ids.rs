//! Identifiers for clients, users and editor sessions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for one client runtime (one connection).
///
/// This is separate from `UserId` because a single user may have several
/// clients open at once (e.g. two browser tabs).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        ClientId(id.into())
    }

    /// Generate a new unique client ID.
    pub fn generate() -> Self {
        ClientId(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        ClientId(s.to_string())
    }
}

/// Identifier of a user account.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        UserId(id.into())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        UserId(s.to_string())
    }
}

const LOCAL_PREFIX: &str = "local-";

/// Key of one editor session.
///
/// Collaborative sessions are keyed `{document id}#{field name}` so every
/// client editing the same field lands in the same authority session.
/// Local-only editors get a generated key that never collides with those.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn collaborative(document_id: &str, field: &str) -> Self {
        SessionKey(format!("{document_id}#{field}"))
    }

    /// A fresh key for a non-collaborative editor.
    pub fn local() -> Self {
        SessionKey(format!("{LOCAL_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_PREFIX)
    }

    /// The document field this key addresses, for collaborative keys.
    pub fn field_target(&self) -> Option<FieldTarget> {
        if self.is_local() {
            return None;
        }
        let (document_id, field_path) = self.0.split_once('#')?;
        Some(FieldTarget::new(document_id, field_path))
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A field of a stored document, used for persistence.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldTarget {
    pub document_id: String,
    pub field_path: String,
}

impl FieldTarget {
    pub fn new(document_id: impl Into<String>, field_path: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            field_path: field_path.into(),
        }
    }
}
