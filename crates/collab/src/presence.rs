//! Presence: which users are editing which field.
//!
//! The authority keeps an [`EditorRoster`] per session and broadcasts the
//! full user set whenever it changes. Clients keep a [`PresenceTracker`]
//! that replaces its view on every broadcast and reports who joined or left.

use crate::ids::{ClientId, SessionKey, UserId};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap};

/// Difference between two consecutive user sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceChange {
    pub joined: Vec<UserId>,
    pub left: Vec<UserId>,
}

impl PresenceChange {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

/// Client-side view of the users editing each session.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    sessions: HashMap<SessionKey, BTreeSet<UserId>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the user set for `key` with `users`.
    pub fn on_users_changed(&mut self, key: &SessionKey, users: &[UserId]) -> PresenceChange {
        let next: BTreeSet<UserId> = users.iter().cloned().collect();
        let previous = self.sessions.insert(key.clone(), next).unwrap_or_default();
        let current = &self.sessions[key];

        PresenceChange {
            joined: current.difference(&previous).cloned().collect(),
            left: previous.difference(current).cloned().collect(),
        }
    }

    /// Users currently editing `key`, sorted.
    pub fn users(&self, key: &SessionKey) -> Vec<UserId> {
        self.sessions
            .get(key)
            .map(|users| users.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_editing(&self, key: &SessionKey, user: &UserId) -> bool {
        self.sessions
            .get(key)
            .is_some_and(|users| users.contains(user))
    }

    /// Forget a session, e.g. when its editor closes.
    pub fn clear(&mut self, key: &SessionKey) {
        self.sessions.remove(key);
    }
}

#[derive(Debug, Clone)]
struct RosterEntry {
    user_id: UserId,
    last_seen: DateTime<Utc>,
}

/// Authority-side record of the clients editing one session.
#[derive(Debug, Default)]
pub struct EditorRoster {
    editors: HashMap<ClientId, RosterEntry>,
}

impl EditorRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh an editor. Returns true if the user set changed.
    pub fn insert(&mut self, client_id: ClientId, user_id: UserId, now: DateTime<Utc>) -> bool {
        let before = self.users();
        self.editors.insert(
            client_id,
            RosterEntry {
                user_id,
                last_seen: now,
            },
        );
        before != self.users()
    }

    /// Remove an editor. Returns true if the user set changed.
    pub fn remove(&mut self, client_id: &ClientId) -> bool {
        let before = self.users();
        self.editors.remove(client_id);
        before != self.users()
    }

    /// Record activity from an editor.
    pub fn touch(&mut self, client_id: &ClientId, now: DateTime<Utc>) -> bool {
        match self.editors.get_mut(client_id) {
            Some(entry) => {
                entry.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Drop editors idle for longer than `timeout`, returning their clients.
    pub fn expire_idle(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<ClientId> {
        let expired: Vec<ClientId> = self
            .editors
            .iter()
            .filter(|(_, entry)| now - entry.last_seen > timeout)
            .map(|(client_id, _)| client_id.clone())
            .collect();
        for client_id in &expired {
            self.editors.remove(client_id);
        }
        expired
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.editors.contains_key(client_id)
    }

    /// Distinct users editing, sorted.
    pub fn users(&self) -> Vec<UserId> {
        let users: BTreeSet<&UserId> = self.editors.values().map(|e| &e.user_id).collect();
        users.into_iter().cloned().collect()
    }

    pub fn clients(&self) -> impl Iterator<Item = &ClientId> {
        self.editors.keys()
    }

    pub fn len(&self) -> usize {
        self.editors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.editors.is_empty()
    }
}
