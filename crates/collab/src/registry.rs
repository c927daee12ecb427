//! Registry of the editor sessions of one client runtime.
//!
//! Holds at most one session per key, routes authority messages to the
//! session they name, and owns the client's presence view.

use crate::channel::Channel;
use crate::error::{CollabError, CollabResult};
use crate::ids::{ClientId, SessionKey, UserId};
use crate::presence::PresenceTracker;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::{EditorSession, SessionEvent, SessionServices};
use doc_model::Document;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct EditorRegistry {
    client_id: ClientId,
    channel: Arc<dyn Channel>,
    services: SessionServices,
    sessions: HashMap<SessionKey, EditorSession>,
    presence: PresenceTracker,
    observed: HashMap<SessionKey, Option<String>>,
}

impl EditorRegistry {
    pub fn new(client_id: ClientId, channel: Arc<dyn Channel>, services: SessionServices) -> Self {
        Self {
            client_id,
            channel,
            services,
            sessions: HashMap::new(),
            presence: PresenceTracker::new(),
            observed: HashMap::new(),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Open the collaborative editor for a document field.
    ///
    /// Returns the existing session if one is already open for the field.
    pub fn open_collaborative(
        &mut self,
        document_id: &str,
        field: &str,
        initial: Document,
    ) -> CollabResult<&mut EditorSession> {
        let key = SessionKey::collaborative(document_id, field);
        match self.sessions.entry(key) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let session = EditorSession::collaborative(
                    entry.key().clone(),
                    self.client_id.clone(),
                    Arc::clone(&self.channel),
                    initial,
                    self.services.clone(),
                )?;
                info!(key = %entry.key(), "Opened collaborative editor");
                Ok(entry.insert(session))
            }
        }
    }

    /// Open an editor that never talks to the authority.
    pub fn open_local(&mut self, initial: Document) -> &mut EditorSession {
        let session = EditorSession::local(initial, self.services.clone());
        self.sessions.entry(session.key().clone()).or_insert(session)
    }

    pub fn get(&self, key: &SessionKey) -> Option<&EditorSession> {
        self.sessions.get(key)
    }

    pub fn get_mut(&mut self, key: &SessionKey) -> Option<&mut EditorSession> {
        self.sessions.get_mut(key)
    }

    pub fn session_mut(&mut self, key: &SessionKey) -> CollabResult<&mut EditorSession> {
        self.sessions
            .get_mut(key)
            .ok_or_else(|| CollabError::UnknownSession(key.clone()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &SessionKey> {
        self.sessions.keys()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close and forget a session. Returns false if it was not open.
    pub fn close(&mut self, key: &SessionKey) -> bool {
        match self.sessions.remove(key) {
            Some(mut session) => {
                session.close();
                self.presence.clear(key);
                true
            }
            None => false,
        }
    }

    pub fn close_all(&mut self) {
        let keys: Vec<SessionKey> = self.sessions.keys().cloned().collect();
        for key in keys {
            self.close(&key);
        }
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Users currently editing `key`, according to the last broadcast.
    pub fn users_editing(&self, key: &SessionKey) -> Vec<UserId> {
        self.presence.users(key)
    }

    /// Route one authority message.
    pub fn dispatch(&mut self, message: ServerMessage) -> CollabResult<Option<SessionEvent>> {
        match message {
            ServerMessage::UsersEditing { key, user_ids } => {
                if !self.sessions.contains_key(&key) {
                    debug!(key = %key, "Presence for a session that is not open");
                    return Ok(None);
                }
                let change = self.presence.on_users_changed(&key, &user_ids);
                Ok(Some(SessionEvent::UsersChanged { key, change }))
            }
            ServerMessage::Autosave { key, html } => match self.observed.get_mut(&key) {
                Some(content) => {
                    *content = Some(html);
                    Ok(Some(SessionEvent::Autosaved { key }))
                }
                None => Ok(None),
            },
            ServerMessage::Welcome { client_id } => {
                if client_id != self.client_id {
                    warn!(
                        assigned = %client_id,
                        own = %self.client_id,
                        "Authority knows this client under another id"
                    );
                }
                Ok(None)
            }
            ServerMessage::Error { key: None, code, message } => {
                warn!(%code, %message, "Authority reported an error");
                Ok(None)
            }
            message => {
                let Some(key) = message.key().cloned() else {
                    return Ok(None);
                };
                let Some(session) = self.sessions.get_mut(&key) else {
                    debug!(key = %key, "Dropping message for a session that is not open");
                    return Ok(None);
                };
                let result = session.handle(message);
                if matches!(result, Err(CollabError::JoinDenied { .. })) {
                    self.sessions.remove(&key);
                    self.presence.clear(&key);
                }
                result
            }
        }
    }

    /// Start receiving autosaved content for a field without editing it.
    pub fn observe(&mut self, key: SessionKey) -> CollabResult<()> {
        self.channel.send(ClientMessage::Observe { key: key.clone() })?;
        self.observed.entry(key).or_insert(None);
        Ok(())
    }

    pub fn unobserve(&mut self, key: &SessionKey) -> CollabResult<()> {
        if self.observed.remove(key).is_some() {
            self.channel.send(ClientMessage::Unobserve { key: key.clone() })?;
        }
        Ok(())
    }

    /// Last autosaved content received for an observed field.
    pub fn observed_content(&self, key: &SessionKey) -> Option<&str> {
        self.observed.get(key)?.as_deref()
    }

    pub fn on_disconnected(&mut self) {
        for session in self.sessions.values_mut() {
            session.on_disconnected();
        }
    }

    /// Rejoin every collaborative session and restore observations.
    ///
    /// Every session and observation is attempted; the first failure is
    /// returned once all have been tried.
    pub fn on_reconnected(&mut self) -> CollabResult<()> {
        let mut first_error = None;
        for (key, session) in self.sessions.iter_mut() {
            if let Err(e) = session.on_reconnected() {
                warn!(key = %key, error = %e, "Rejoin failed");
                first_error.get_or_insert(e);
            }
        }
        for key in self.observed.keys() {
            if let Err(e) = self.channel.send(ClientMessage::Observe { key: key.clone() }) {
                warn!(key = %key, error = %e, "Observe not restored");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Send a heartbeat for every collaborative session.
    pub fn heartbeat(&self) -> CollabResult<()> {
        for session in self.sessions.values().filter(|s| s.is_collaborative()) {
            session.heartbeat()?;
        }
        Ok(())
    }
}
