//! Authoritative state of one collaborative session.

use crate::ids::{ClientId, SessionKey, UserId};
use crate::presence::EditorRoster;
use doc_model::{DocModelError, DocumentState, Step};
use std::collections::VecDeque;

/// A confirmed step with its author.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub step: Step,
    pub user_id: UserId,
    pub client_id: ClientId,
}

/// The single source of truth for one session key.
#[derive(Debug)]
pub struct DocumentAuthority {
    key: SessionKey,
    state: DocumentState,
    history: VecDeque<HistoryEntry>,
    retention: usize,
    roster: EditorRoster,
}

impl DocumentAuthority {
    pub fn new(key: SessionKey, state: DocumentState, retention: usize) -> Self {
        Self {
            key,
            state,
            history: VecDeque::new(),
            retention,
            roster: EditorRoster::new(),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn state(&self) -> &DocumentState {
        &self.state
    }

    pub fn version(&self) -> u64 {
        self.state.version()
    }

    /// Oldest version that can still be caught up from history.
    pub fn oldest_retained(&self) -> u64 {
        self.version() - self.history.len() as u64
    }

    /// Confirmed steps after `since`, or `None` if they are not retained.
    pub fn steps_since(&self, since: u64) -> Option<Vec<HistoryEntry>> {
        if since > self.version() || since < self.oldest_retained() {
            return None;
        }
        let skip = (since - self.oldest_retained()) as usize;
        Some(self.history.iter().skip(skip).cloned().collect())
    }

    /// Apply a batch of steps atomically.
    ///
    /// Either every step applies and is appended to history, or the state is
    /// left exactly as it was.
    pub fn commit(
        &mut self,
        steps: Vec<Step>,
        user_id: &UserId,
        client_id: &ClientId,
    ) -> Result<Vec<HistoryEntry>, DocModelError> {
        let mut next = self.state.clone();
        next.apply_all(&steps)?;
        self.state = next;

        let entries: Vec<HistoryEntry> = steps
            .into_iter()
            .map(|step| HistoryEntry {
                step,
                user_id: user_id.clone(),
                client_id: client_id.clone(),
            })
            .collect();
        self.history.extend(entries.iter().cloned());
        while self.history.len() > self.retention {
            self.history.pop_front();
        }
        Ok(entries)
    }

    pub fn roster(&self) -> &EditorRoster {
        &self.roster
    }

    pub fn roster_mut(&mut self) -> &mut EditorRoster {
        &mut self.roster
    }

    /// No editors left.
    pub fn is_abandoned(&self) -> bool {
        self.roster.is_empty()
    }
}
