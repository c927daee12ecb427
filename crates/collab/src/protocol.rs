//! Message types exchanged between editor sessions and the authority.
//!
//! Every message names the session key it belongs to, so one connection can
//! carry any number of editor sessions. Steps travel as opaque JSON values
//! produced by a [`StepCodec`](crate::codec::StepCodec).

use crate::ids::{ClientId, SessionKey, UserId};
use doc_model::Document;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One confirmed step in the authority's history, as sent on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireHistoryEntry {
    pub step: Value,
    pub user_id: UserId,
    pub client_id: ClientId,
}

/// Messages sent from client to authority.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Identify the connection. Must be the first frame on a socket.
    ///
    /// `client_id` should stay the same across reconnects so the client can
    /// recognize its own confirmed steps. The authority assigns one when it
    /// is missing and reports it in [`ServerMessage::Welcome`].
    Hello {
        #[serde(rename = "userId")]
        user_id: UserId,
        #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
        client_id: Option<ClientId>,
    },

    /// Join the session for a field.
    ///
    /// `initial` is the proposed content, used only when no authoritative
    /// state exists yet. `since` is set when rejoining after a disconnect.
    Join {
        key: SessionKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initial: Option<Document>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<u64>,
    },

    /// Submit steps computed against confirmed `version`.
    Submit {
        key: SessionKey,
        version: u64,
        steps: Vec<Value>,
    },

    /// Ask for every confirmed step after `since`.
    RequestSteps { key: SessionKey, since: u64 },

    /// Ask for a full authoritative snapshot.
    RequestSnapshot { key: SessionKey },

    /// Stop editing the field.
    Leave { key: SessionKey },

    /// Keep this client's presence alive.
    Heartbeat { key: SessionKey },

    /// Receive autosaved content without editing.
    Observe { key: SessionKey },

    Unobserve { key: SessionKey },

    /// Rendered content of the editor, relayed to observers.
    Autosave { key: SessionKey, html: String },
}

impl ClientMessage {
    /// The session key the message refers to, if any.
    pub fn key(&self) -> Option<&SessionKey> {
        match self {
            ClientMessage::Hello { .. } => None,
            ClientMessage::Join { key, .. }
            | ClientMessage::Submit { key, .. }
            | ClientMessage::RequestSteps { key, .. }
            | ClientMessage::RequestSnapshot { key }
            | ClientMessage::Leave { key }
            | ClientMessage::Heartbeat { key }
            | ClientMessage::Observe { key }
            | ClientMessage::Unobserve { key }
            | ClientMessage::Autosave { key, .. } => Some(key),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Messages sent from authority to client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake accepted; the id confirmed steps from this client carry.
    Welcome {
        #[serde(rename = "clientId")]
        client_id: ClientId,
    },

    /// Join accepted; the authoritative snapshot to start from.
    Joined {
        key: SessionKey,
        state: Document,
        version: u64,
    },

    JoinDenied { key: SessionKey, reason: String },

    /// Confirmed steps, the first of which moved the document from `offset`.
    NewSteps {
        key: SessionKey,
        offset: u64,
        history: Vec<WireHistoryEntry>,
    },

    /// Discard local state and adopt this snapshot.
    Resync {
        key: SessionKey,
        state: Document,
        version: u64,
    },

    /// Full set of users currently editing the field.
    UsersEditing {
        key: SessionKey,
        #[serde(rename = "userIds")]
        user_ids: Vec<UserId>,
    },

    /// Autosaved content for observers.
    Autosave { key: SessionKey, html: String },

    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<SessionKey>,
        code: String,
        message: String,
    },
}

/// Error code sent when a client acts on a session it has not joined.
pub const ERROR_NOT_JOINED: &str = "not_joined";

impl ServerMessage {
    /// Create an error message.
    pub fn error(key: Option<SessionKey>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            key,
            code: code.into(),
            message: message.into(),
        }
    }

    /// The session key the message refers to, if any.
    pub fn key(&self) -> Option<&SessionKey> {
        match self {
            ServerMessage::Joined { key, .. }
            | ServerMessage::JoinDenied { key, .. }
            | ServerMessage::NewSteps { key, .. }
            | ServerMessage::Resync { key, .. }
            | ServerMessage::UsersEditing { key, .. }
            | ServerMessage::Autosave { key, .. } => Some(key),
            ServerMessage::Error { key, .. } => key.as_ref(),
            ServerMessage::Welcome { .. } => None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
