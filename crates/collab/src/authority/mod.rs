//! Central authority for collaborative sessions.
//!
//! The authority owns the confirmed state and history of every open session,
//! totally orders submissions, and fans confirmed steps out to every client
//! editing the same key. A submission is accepted only when it was computed
//! against the current version; anything else gets the client caught up
//! instead, and the client rebases and submits again.
//!
//! [`Authority`] is synchronous and transport-agnostic. [`AuthorityService`]
//! drives it from a command channel on a tokio task.

mod document;
mod service;

pub use document::{DocumentAuthority, HistoryEntry};
pub use service::{AuthorityHandle, AuthorityService};

use crate::codec::{JsonStepCodec, StepCodec};
use crate::error::CollabError;
use crate::ids::{ClientId, SessionKey, UserId};
use crate::protocol::{ClientMessage, ServerMessage, WireHistoryEntry, ERROR_NOT_JOINED};
use chrono::{DateTime, Duration, Utc};
use doc_model::{Document, DocumentState};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Configuration for the authority.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Confirmed steps kept per session for catch-up.
    pub history_retention: usize,
    /// Editors idle this long lose their presence entry.
    pub idle_timeout_ms: u64,
    /// How often idle editors are expired.
    pub expiry_interval_ms: u64,
    /// Maximum clients editing one session.
    pub max_editors_per_session: usize,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            history_retention: 1000,
            idle_timeout_ms: 300_000,
            expiry_interval_ms: 30_000,
            max_editors_per_session: 100,
        }
    }
}

/// Decides who may edit which session.
pub trait AccessPolicy: Send + Sync {
    fn can_edit(&self, user_id: &UserId, key: &SessionKey) -> Result<(), String>;
}

/// Policy that lets everyone edit everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn can_edit(&self, _user_id: &UserId, _key: &SessionKey) -> Result<(), String> {
        Ok(())
    }
}

impl<F> AccessPolicy for F
where
    F: Fn(&UserId, &SessionKey) -> Result<(), String> + Send + Sync,
{
    fn can_edit(&self, user_id: &UserId, key: &SessionKey) -> Result<(), String> {
        self(user_id, key)
    }
}

/// Commands consumed by the authority.
#[derive(Debug)]
pub enum AuthorityCommand {
    /// A client connected; messages for it go to `sender`.
    Connect {
        client_id: ClientId,
        user_id: UserId,
        sender: mpsc::UnboundedSender<ServerMessage>,
    },
    /// A message from a connected client.
    Message {
        client_id: ClientId,
        message: ClientMessage,
    },
    /// A client's connection went away.
    Disconnect { client_id: ClientId },
    /// One transport connection closed. Ignored if the client has since
    /// reconnected over a different connection.
    ConnectionClosed {
        client_id: ClientId,
        sender: mpsc::UnboundedSender<ServerMessage>,
    },
}

/// Authority statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthorityStats {
    pub clients: usize,
    pub sessions: usize,
    pub editors: usize,
}

#[derive(Debug)]
struct ConnectedClient {
    user_id: UserId,
    sender: mpsc::UnboundedSender<ServerMessage>,
    editing: HashSet<SessionKey>,
    observing: HashSet<SessionKey>,
}

fn send_to(clients: &HashMap<ClientId, ConnectedClient>, client_id: &ClientId, message: ServerMessage) {
    if let Some(client) = clients.get(client_id) {
        if client.sender.send(message).is_err() {
            debug!(client_id = %client_id, "Client channel closed, dropping message");
        }
    }
}

fn encode_history<C: StepCodec>(codec: &C, entries: &[HistoryEntry]) -> Result<Vec<WireHistoryEntry>, CollabError> {
    entries
        .iter()
        .map(|entry| {
            Ok(WireHistoryEntry {
                step: codec.encode(&entry.step)?,
                user_id: entry.user_id.clone(),
                client_id: entry.client_id.clone(),
            })
        })
        .collect()
}

fn resync_message(doc: &DocumentAuthority) -> ServerMessage {
    ServerMessage::Resync {
        key: doc.key().clone(),
        state: doc.state().doc().clone(),
        version: doc.version(),
    }
}

/// Steps after `since` as a catch-up message, or a resync if they are gone.
fn catch_up_message<C: StepCodec>(codec: &C, doc: &DocumentAuthority, since: u64) -> ServerMessage {
    let Some(entries) = doc.steps_since(since) else {
        debug!(key = %doc.key(), since, "Steps no longer retained, sending snapshot");
        return resync_message(doc);
    };
    match encode_history(codec, &entries) {
        Ok(history) => ServerMessage::NewSteps {
            key: doc.key().clone(),
            offset: since,
            history,
        },
        Err(e) => {
            warn!(key = %doc.key(), error = %e, "Failed to encode history");
            resync_message(doc)
        }
    }
}

fn broadcast_users(clients: &HashMap<ClientId, ConnectedClient>, doc: &DocumentAuthority) {
    let user_ids = doc.roster().users();
    for client_id in doc.roster().clients() {
        send_to(
            clients,
            client_id,
            ServerMessage::UsersEditing {
                key: doc.key().clone(),
                user_ids: user_ids.clone(),
            },
        );
    }
}

/// The authority state machine.
pub struct Authority<C: StepCodec = JsonStepCodec, P: AccessPolicy = AllowAll> {
    config: AuthorityConfig,
    codec: C,
    policy: P,
    clients: HashMap<ClientId, ConnectedClient>,
    documents: HashMap<SessionKey, DocumentAuthority>,
    observers: HashMap<SessionKey, HashSet<ClientId>>,
}

impl Authority<JsonStepCodec, AllowAll> {
    /// Create an authority that admits every user.
    pub fn new(config: AuthorityConfig) -> Self {
        Self::with_policy(config, JsonStepCodec, AllowAll)
    }
}

impl<C: StepCodec, P: AccessPolicy> Authority<C, P> {
    pub fn with_policy(config: AuthorityConfig, codec: C, policy: P) -> Self {
        Self {
            config,
            codec,
            policy,
            clients: HashMap::new(),
            documents: HashMap::new(),
            observers: HashMap::new(),
        }
    }

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    pub fn document(&self, key: &SessionKey) -> Option<&DocumentAuthority> {
        self.documents.get(key)
    }

    pub fn stats(&self) -> AuthorityStats {
        AuthorityStats {
            clients: self.clients.len(),
            sessions: self.documents.len(),
            editors: self.documents.values().map(|d| d.roster().len()).sum(),
        }
    }

    pub fn apply_command(&mut self, command: AuthorityCommand) {
        match command {
            AuthorityCommand::Connect {
                client_id,
                user_id,
                sender,
            } => self.connect(client_id, user_id, sender),
            AuthorityCommand::Message { client_id, message } => self.handle(&client_id, message),
            AuthorityCommand::Disconnect { client_id } => self.disconnect(&client_id),
            AuthorityCommand::ConnectionClosed { client_id, sender } => {
                let current = self
                    .clients
                    .get(&client_id)
                    .is_some_and(|client| client.sender.same_channel(&sender));
                if current {
                    self.disconnect(&client_id);
                } else {
                    debug!(client_id = %client_id, "Ignoring close of a replaced connection");
                }
            }
        }
    }

    pub fn connect(
        &mut self,
        client_id: ClientId,
        user_id: UserId,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) {
        if self.clients.contains_key(&client_id) {
            debug!(client_id = %client_id, "Client reconnected without disconnecting");
            self.disconnect(&client_id);
        }
        info!(client_id = %client_id, user_id = %user_id, "Client connected");
        self.clients.insert(
            client_id,
            ConnectedClient {
                user_id,
                sender,
                editing: HashSet::new(),
                observing: HashSet::new(),
            },
        );
    }

    /// Forget a client and remove it from every session it was in.
    pub fn disconnect(&mut self, client_id: &ClientId) {
        let Some(client) = self.clients.remove(client_id) else {
            return;
        };
        info!(client_id = %client_id, user_id = %client.user_id, "Client disconnected");
        for key in &client.editing {
            self.remove_editor(key, client_id);
        }
        for key in &client.observing {
            self.remove_observer(key, client_id);
        }
    }

    pub fn handle(&mut self, client_id: &ClientId, message: ClientMessage) {
        let Some(client) = self.clients.get(client_id) else {
            debug!(client_id = %client_id, "Message from unknown client");
            return;
        };
        let user_id = client.user_id.clone();

        match message {
            ClientMessage::Hello { .. } => {
                debug!(client_id = %client_id, "Ignoring repeated hello");
            }
            ClientMessage::Join { key, initial, since } => self.join(client_id, &user_id, key, initial, since),
            ClientMessage::Submit { key, version, steps } => {
                self.submit(client_id, &user_id, key, version, steps)
            }
            ClientMessage::RequestSteps { key, since } => {
                let Some(doc) = self.editable(client_id, &key) else {
                    return;
                };
                let message = catch_up_message(&self.codec, doc, since);
                send_to(&self.clients, client_id, message);
            }
            ClientMessage::RequestSnapshot { key } => {
                let Some(doc) = self.editable(client_id, &key) else {
                    return;
                };
                let message = resync_message(doc);
                send_to(&self.clients, client_id, message);
            }
            ClientMessage::Leave { key } => {
                if let Some(client) = self.clients.get_mut(client_id) {
                    client.editing.remove(&key);
                }
                self.remove_editor(&key, client_id);
            }
            ClientMessage::Heartbeat { key } => {
                let now = Utc::now();
                let touched = self
                    .documents
                    .get_mut(&key)
                    .is_some_and(|doc| doc.roster_mut().touch(client_id, now));
                if !touched {
                    self.not_joined(client_id, &key);
                }
            }
            ClientMessage::Observe { key } => self.observe(client_id, key),
            ClientMessage::Unobserve { key } => {
                if let Some(client) = self.clients.get_mut(client_id) {
                    client.observing.remove(&key);
                }
                self.remove_observer(&key, client_id);
            }
            ClientMessage::Autosave { key, html } => {
                if self.editable(client_id, &key).is_none() {
                    return;
                }
                let Some(observers) = self.observers.get(&key) else {
                    return;
                };
                for observer in observers {
                    send_to(
                        &self.clients,
                        observer,
                        ServerMessage::Autosave {
                            key: key.clone(),
                            html: html.clone(),
                        },
                    );
                }
            }
        }
    }

    /// The session `key` if `client_id` is editing it; otherwise tell the
    /// client it has to join first.
    fn editable(&self, client_id: &ClientId, key: &SessionKey) -> Option<&DocumentAuthority> {
        match self.documents.get(key) {
            Some(doc) if doc.roster().contains(client_id) => Some(doc),
            _ => {
                self.not_joined(client_id, key);
                None
            }
        }
    }

    fn not_joined(&self, client_id: &ClientId, key: &SessionKey) {
        debug!(client_id = %client_id, key = %key, "Client is not editing this session");
        send_to(
            &self.clients,
            client_id,
            ServerMessage::error(Some(key.clone()), ERROR_NOT_JOINED, "join the session first"),
        );
    }

    fn deny(&self, client_id: &ClientId, key: SessionKey, reason: String) {
        warn!(client_id = %client_id, key = %key, %reason, "Join denied");
        send_to(&self.clients, client_id, ServerMessage::JoinDenied { key, reason });
    }

    fn join(
        &mut self,
        client_id: &ClientId,
        user_id: &UserId,
        key: SessionKey,
        initial: Option<Document>,
        since: Option<u64>,
    ) {
        if let Err(reason) = self.policy.can_edit(user_id, &key) {
            self.deny(client_id, key, reason);
            return;
        }

        let doc = match self.documents.entry(key.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let initial = initial.unwrap_or_default();
                if let Err(e) = initial.validate() {
                    let reason = format!("invalid initial content: {e}");
                    warn!(client_id = %client_id, key = %key, %reason, "Join denied");
                    send_to(&self.clients, client_id, ServerMessage::JoinDenied { key, reason });
                    return;
                }
                let state = match since {
                    Some(version) => DocumentState::at_version(initial, version),
                    None => DocumentState::new(initial),
                };
                info!(key = %key, version = state.version(), "Established authoritative state");
                entry.insert(DocumentAuthority::new(
                    key.clone(),
                    state,
                    self.config.history_retention,
                ))
            }
        };

        if !doc.roster().contains(client_id) && doc.roster().len() >= self.config.max_editors_per_session {
            let reason = "too many editors".to_string();
            warn!(client_id = %client_id, key = %key, %reason, "Join denied");
            send_to(&self.clients, client_id, ServerMessage::JoinDenied { key, reason });
            return;
        }

        doc.roster_mut().insert(client_id.clone(), user_id.clone(), Utc::now());
        if let Some(client) = self.clients.get_mut(client_id) {
            client.editing.insert(key.clone());
        }

        let reply = match since {
            None => ServerMessage::Joined {
                key: key.clone(),
                state: doc.state().doc().clone(),
                version: doc.version(),
            },
            Some(since) => catch_up_message(&self.codec, doc, since),
        };
        debug!(client_id = %client_id, key = %key, version = doc.version(), "Client joined session");
        send_to(&self.clients, client_id, reply);
        broadcast_users(&self.clients, doc);
    }

    fn submit(
        &mut self,
        client_id: &ClientId,
        user_id: &UserId,
        key: SessionKey,
        version: u64,
        steps: Vec<serde_json::Value>,
    ) {
        let joined = self
            .documents
            .get(&key)
            .is_some_and(|doc| doc.roster().contains(client_id));
        if !joined {
            self.not_joined(client_id, &key);
            return;
        }
        let Some(doc) = self.documents.get_mut(&key) else {
            return;
        };
        doc.roster_mut().touch(client_id, Utc::now());

        let current = doc.version();
        if version != current {
            let err = CollabError::StaleVersion { base: version, current };
            debug!(client_id = %client_id, key = %key, error = %err, "Rejected submission");
            let reply = if version > current {
                resync_message(doc)
            } else {
                catch_up_message(&self.codec, doc, version)
            };
            send_to(&self.clients, client_id, reply);
            return;
        }

        let decoded = match self.codec.decode_all(&steps) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(client_id = %client_id, key = %key, error = %e, "Undecodable submission");
                send_to(&self.clients, client_id, resync_message(doc));
                return;
            }
        };

        let entries = match doc.commit(decoded, user_id, client_id) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(client_id = %client_id, key = %key, error = %e, "Submission does not apply, forcing resync");
                send_to(&self.clients, client_id, resync_message(doc));
                return;
            }
        };

        let history = match encode_history(&self.codec, &entries) {
            Ok(history) => history,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode confirmed steps");
                return;
            }
        };
        debug!(
            client_id = %client_id,
            key = %key,
            steps = history.len(),
            version = doc.version(),
            "Accepted submission"
        );
        for editor in doc.roster().clients() {
            send_to(
                &self.clients,
                editor,
                ServerMessage::NewSteps {
                    key: key.clone(),
                    offset: version,
                    history: history.clone(),
                },
            );
        }
    }

    fn observe(&mut self, client_id: &ClientId, key: SessionKey) {
        let Some(client) = self.clients.get_mut(client_id) else {
            return;
        };
        client.observing.insert(key.clone());
        debug!(client_id = %client_id, key = %key, "Client observing session");
        self.observers.entry(key).or_default().insert(client_id.clone());
    }

    fn remove_observer(&mut self, key: &SessionKey, client_id: &ClientId) {
        if let Some(observers) = self.observers.get_mut(key) {
            observers.remove(client_id);
            if observers.is_empty() {
                self.observers.remove(key);
            }
        }
    }

    fn remove_editor(&mut self, key: &SessionKey, client_id: &ClientId) {
        let Some(doc) = self.documents.get_mut(key) else {
            return;
        };
        if doc.roster_mut().remove(client_id) {
            broadcast_users(&self.clients, doc);
        }
        self.drop_if_abandoned(key);
    }

    fn drop_if_abandoned(&mut self, key: &SessionKey) {
        if self.documents.get(key).is_some_and(|doc| doc.is_abandoned()) {
            info!(key = %key, "Last client left, discarding session state");
            self.documents.remove(key);
        }
    }

    /// Remove editors that have been idle longer than the configured timeout.
    pub fn expire_idle(&mut self, now: DateTime<Utc>) {
        let timeout = Duration::milliseconds(self.config.idle_timeout_ms as i64);
        let keys: Vec<SessionKey> = self.documents.keys().cloned().collect();
        for key in keys {
            let Some(doc) = self.documents.get_mut(&key) else {
                continue;
            };
            let expired = doc.roster_mut().expire_idle(now, timeout);
            if expired.is_empty() {
                continue;
            }
            for client_id in &expired {
                info!(client_id = %client_id, key = %key, "Editor idle, removing presence");
                if let Some(client) = self.clients.get_mut(client_id) {
                    client.editing.remove(&key);
                }
                send_to(
                    &self.clients,
                    client_id,
                    ServerMessage::error(Some(key.clone()), ERROR_NOT_JOINED, "editor expired after being idle"),
                );
            }
            broadcast_users(&self.clients, doc);
            self.drop_if_abandoned(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use doc_model::Step;

    struct TestClient {
        id: ClientId,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
    }

    impl TestClient {
        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut messages = Vec::new();
            while let Ok(message) = self.rx.try_recv() {
                messages.push(message);
            }
            messages
        }
    }

    fn key() -> SessionKey {
        SessionKey::collaborative("Doc.1", "body")
    }

    fn connect<C: StepCodec, P: AccessPolicy>(authority: &mut Authority<C, P>, id: &str, user: &str) -> TestClient {
        let (tx, rx) = mpsc::unbounded_channel();
        authority.connect(ClientId::from(id), UserId::from(user), tx);
        TestClient {
            id: ClientId::from(id),
            rx,
        }
    }

    fn join<C: StepCodec, P: AccessPolicy>(authority: &mut Authority<C, P>, client: &TestClient, text: &str) {
        authority.handle(
            &client.id,
            ClientMessage::Join {
                key: key(),
                initial: Some(Document::from_paragraphs([text])),
                since: None,
            },
        );
    }

    fn submit(authority: &mut Authority, client: &TestClient, version: u64, steps: &[Step]) {
        authority.handle(
            &client.id,
            ClientMessage::Submit {
                key: key(),
                version,
                steps: JsonStepCodec.encode_all(steps).unwrap(),
            },
        );
    }

    #[test]
    fn test_first_join_establishes_state() {
        let mut authority = Authority::new(AuthorityConfig::default());
        let mut alice = connect(&mut authority, "c1", "alice");
        join(&mut authority, &alice, "hello");

        let messages = alice.drain();
        assert!(matches!(
            &messages[0],
            ServerMessage::Joined { version: 0, state, .. } if state.text_content() == "hello"
        ));
        assert_eq!(
            messages[1],
            ServerMessage::UsersEditing {
                key: key(),
                user_ids: vec![UserId::from("alice")]
            }
        );

        // a later joiner gets the existing state, not its own proposal
        let mut bob = connect(&mut authority, "c2", "bob");
        join(&mut authority, &bob, "ignored");
        assert!(matches!(
            &bob.drain()[0],
            ServerMessage::Joined { state, .. } if state.text_content() == "hello"
        ));
        assert_eq!(authority.stats().editors, 2);
    }

    #[test]
    fn test_accepted_submission_is_broadcast() {
        let mut authority = Authority::new(AuthorityConfig::default());
        let mut alice = connect(&mut authority, "c1", "alice");
        let mut bob = connect(&mut authority, "c2", "bob");
        join(&mut authority, &alice, "abc");
        join(&mut authority, &bob, "abc");
        alice.drain();
        bob.drain();

        submit(&mut authority, &alice, 0, &[Step::insert_text(1, "x")]);
        for client in [&mut alice, &mut bob] {
            let messages = client.drain();
            assert_eq!(messages.len(), 1);
            assert!(matches!(
                &messages[0],
                ServerMessage::NewSteps { offset: 0, history, .. }
                    if history.len() == 1 && history[0].client_id == ClientId::from("c1")
            ));
        }
        assert_eq!(authority.document(&key()).unwrap().version(), 1);
    }

    #[test]
    fn test_stale_submission_gets_catch_up() {
        let mut authority = Authority::new(AuthorityConfig::default());
        let mut alice = connect(&mut authority, "c1", "alice");
        let mut bob = connect(&mut authority, "c2", "bob");
        join(&mut authority, &alice, "abc");
        join(&mut authority, &bob, "abc");

        submit(&mut authority, &alice, 0, &[Step::insert_text(1, "x")]);
        alice.drain();
        bob.drain();

        submit(&mut authority, &bob, 0, &[Step::insert_text(1, "y")]);
        assert!(alice.drain().is_empty());
        let messages = bob.drain();
        assert!(matches!(
            &messages[..],
            [ServerMessage::NewSteps { offset: 0, history, .. }] if history.len() == 1
        ));
        assert_eq!(authority.document(&key()).unwrap().version(), 1);
    }

    #[test]
    fn test_future_base_forces_resync() {
        let mut authority = Authority::new(AuthorityConfig::default());
        let mut alice = connect(&mut authority, "c1", "alice");
        join(&mut authority, &alice, "abc");
        alice.drain();

        submit(&mut authority, &alice, 4, &[Step::insert_text(1, "x")]);
        assert!(matches!(&alice.drain()[..], [ServerMessage::Resync { version: 0, .. }]));
    }

    #[test]
    fn test_invalid_submission_forces_resync_without_advancing() {
        let mut authority = Authority::new(AuthorityConfig::default());
        let mut alice = connect(&mut authority, "c1", "alice");
        join(&mut authority, &alice, "abc");
        alice.drain();

        submit(&mut authority, &alice, 0, &[Step::insert_text(1, "x"), Step::delete(0, 2)]);
        assert!(matches!(&alice.drain()[..], [ServerMessage::Resync { version: 0, .. }]));
        assert_eq!(authority.document(&key()).unwrap().version(), 0);
    }

    #[test]
    fn test_submit_without_join_is_rejected() {
        let mut authority = Authority::new(AuthorityConfig::default());
        let mut alice = connect(&mut authority, "c1", "alice");
        submit(&mut authority, &alice, 0, &[Step::insert_text(1, "x")]);
        assert!(matches!(
            &alice.drain()[..],
            [ServerMessage::Error { code, .. }] if code == ERROR_NOT_JOINED
        ));
    }

    #[test]
    fn test_policy_denies_join() {
        let policy = |user: &UserId, _key: &SessionKey| {
            if user.0 == "guest" {
                Err("read-only access".to_string())
            } else {
                Ok(())
            }
        };
        let mut authority = Authority::with_policy(AuthorityConfig::default(), JsonStepCodec, policy);
        let mut guest = connect(&mut authority, "c1", "guest");
        join(&mut authority, &guest, "abc");
        assert!(matches!(
            &guest.drain()[..],
            [ServerMessage::JoinDenied { reason, .. }] if reason == "read-only access"
        ));
        assert!(authority.document(&key()).is_none());
    }

    #[test]
    fn test_invalid_initial_content_is_denied() {
        let mut authority = Authority::new(AuthorityConfig::default());
        let mut alice = connect(&mut authority, "c1", "alice");
        let bad: Document = serde_json::from_value(serde_json::json!({
            "nodes": [{ "node": "text", "ch": "a", "marks": [] }]
        }))
        .unwrap();
        authority.handle(
            &alice.id,
            ClientMessage::Join {
                key: key(),
                initial: Some(bad),
                since: None,
            },
        );
        assert!(matches!(&alice.drain()[..], [ServerMessage::JoinDenied { .. }]));
    }

    #[test]
    fn test_rejoin_catches_up_from_history() {
        let mut authority = Authority::new(AuthorityConfig::default());
        let mut alice = connect(&mut authority, "c1", "alice");
        let mut bob = connect(&mut authority, "c2", "bob");
        join(&mut authority, &alice, "abc");
        join(&mut authority, &bob, "abc");

        authority.disconnect(&bob.id);
        submit(&mut authority, &alice, 0, &[Step::insert_text(1, "x")]);
        submit(&mut authority, &alice, 1, &[Step::insert_text(1, "y")]);

        bob = connect(&mut authority, "c2", "bob");
        authority.handle(
            &bob.id,
            ClientMessage::Join {
                key: key(),
                initial: None,
                since: Some(0),
            },
        );
        let messages = bob.drain();
        assert!(matches!(
            &messages[0],
            ServerMessage::NewSteps { offset: 0, history, .. } if history.len() == 2
        ));
    }

    #[test]
    fn test_rejoin_outside_retention_gets_snapshot() {
        let config = AuthorityConfig {
            history_retention: 1,
            ..AuthorityConfig::default()
        };
        let mut authority = Authority::new(config);
        let alice = connect(&mut authority, "c1", "alice");
        join(&mut authority, &alice, "abc");
        submit(&mut authority, &alice, 0, &[Step::insert_text(1, "x")]);
        submit(&mut authority, &alice, 1, &[Step::insert_text(1, "y")]);

        let mut bob = connect(&mut authority, "c2", "bob");
        authority.handle(
            &bob.id,
            ClientMessage::Join {
                key: key(),
                initial: None,
                since: Some(0),
            },
        );
        assert!(matches!(&bob.drain()[0], ServerMessage::Resync { version: 2, .. }));
    }

    #[test]
    fn test_reestablishes_state_from_rejoining_client() {
        let mut authority = Authority::new(AuthorityConfig::default());
        let mut alice = connect(&mut authority, "c1", "alice");
        authority.handle(
            &alice.id,
            ClientMessage::Join {
                key: key(),
                initial: Some(Document::from_paragraphs(["kept"])),
                since: Some(41),
            },
        );
        assert!(matches!(
            &alice.drain()[0],
            ServerMessage::NewSteps { offset: 41, history, .. } if history.is_empty()
        ));
        assert_eq!(authority.document(&key()).unwrap().version(), 41);
    }

    #[test]
    fn test_last_leave_discards_session() {
        let mut authority = Authority::new(AuthorityConfig::default());
        let mut alice = connect(&mut authority, "c1", "alice");
        let bob = connect(&mut authority, "c2", "bob");
        join(&mut authority, &alice, "abc");
        join(&mut authority, &bob, "abc");
        alice.drain();

        authority.handle(&bob.id, ClientMessage::Leave { key: key() });
        assert_eq!(
            alice.drain(),
            vec![ServerMessage::UsersEditing {
                key: key(),
                user_ids: vec![UserId::from("alice")]
            }]
        );

        authority.disconnect(&alice.id);
        assert!(authority.document(&key()).is_none());
        assert_eq!(authority.stats(), AuthorityStats { clients: 1, sessions: 0, editors: 0 });
    }

    #[test]
    fn test_autosave_reaches_observers() {
        let mut authority = Authority::new(AuthorityConfig::default());
        let alice = connect(&mut authority, "c1", "alice");
        let mut watcher = connect(&mut authority, "c2", "watcher");
        authority.handle(&watcher.id, ClientMessage::Observe { key: key() });
        join(&mut authority, &alice, "abc");

        authority.handle(
            &alice.id,
            ClientMessage::Autosave {
                key: key(),
                html: "<p>abc</p>".into(),
            },
        );
        assert_eq!(
            watcher.drain(),
            vec![ServerMessage::Autosave {
                key: key(),
                html: "<p>abc</p>".into()
            }]
        );
    }

    #[test]
    fn test_idle_editors_expire() {
        let config = AuthorityConfig {
            idle_timeout_ms: 1_000,
            ..AuthorityConfig::default()
        };
        let mut authority = Authority::new(config);
        let mut alice = connect(&mut authority, "c1", "alice");
        let bob = connect(&mut authority, "c2", "bob");
        join(&mut authority, &alice, "abc");
        join(&mut authority, &bob, "abc");
        alice.drain();

        let later = Utc::now() + Duration::seconds(5);
        authority.expire_idle(later);
        assert!(authority.document(&key()).is_none());
        // expired editors are told so they rejoin
        assert!(matches!(
            &alice.drain()[..],
            [ServerMessage::Error { key: Some(k), code, .. }] if *k == key() && code == ERROR_NOT_JOINED
        ));
    }

    #[test]
    fn test_stale_connection_close_is_ignored() {
        let mut authority = Authority::new(AuthorityConfig::default());
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        authority.connect(ClientId::from("c1"), UserId::from("alice"), old_tx.clone());
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        authority.connect(ClientId::from("c1"), UserId::from("alice"), new_tx.clone());
        authority.handle(
            &ClientId::from("c1"),
            ClientMessage::Join {
                key: key(),
                initial: Some(Document::from_paragraphs(["abc"])),
                since: None,
            },
        );

        authority.apply_command(AuthorityCommand::ConnectionClosed {
            client_id: ClientId::from("c1"),
            sender: old_tx,
        });
        assert_eq!(authority.stats().clients, 1);
        assert_eq!(authority.stats().editors, 1);
        assert!(matches!(new_rx.try_recv(), Ok(ServerMessage::Joined { .. })));

        authority.apply_command(AuthorityCommand::ConnectionClosed {
            client_id: ClientId::from("c1"),
            sender: new_tx,
        });
        assert_eq!(authority.stats().clients, 0);
        assert!(authority.document(&key()).is_none());
    }

    #[test]
    fn test_editor_cap() {
        let config = AuthorityConfig {
            max_editors_per_session: 1,
            ..AuthorityConfig::default()
        };
        let mut authority = Authority::new(config);
        let alice = connect(&mut authority, "c1", "alice");
        let mut bob = connect(&mut authority, "c2", "bob");
        join(&mut authority, &alice, "abc");
        join(&mut authority, &bob, "abc");
        assert!(matches!(&bob.drain()[..], [ServerMessage::JoinDenied { .. }]));
    }
}
