//! Host-provided collaborators of an editor session.
//!
//! The host application supplies persistence, user notifications, content
//! preservation across resyncs, and rendering. Each seam is a trait with a
//! logging default and an in-memory implementation that records calls.

use crate::error::{CollabError, CollabResult};
use crate::ids::{FieldTarget, SessionKey};
use doc_model::{Document, Selection};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Persists rendered field content.
pub trait DocumentStore: Send + Sync {
    fn set_field_content(&self, target: &FieldTarget, html: &str) -> CollabResult<()>;
}

/// Options for a user-facing warning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarnOptions {
    /// Keep the notice visible until dismissed.
    pub persistent: bool,
}

/// Shows notices to the user.
pub trait Notifier: Send + Sync {
    fn warn(&self, message: &str, options: WarnOptions);
}

/// Keeps a copy of local content that a resync is about to discard.
pub trait ContentPreserver: Send + Sync {
    fn preserve(&self, key: &SessionKey, html: &str);
}

/// Displays an editor session's document.
pub trait EditorView: Send {
    fn render(&mut self, doc: &Document, selection: Option<Selection>);
}

/// Notifier that writes warnings to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn warn(&self, message: &str, options: WarnOptions) {
        warn!(persistent = options.persistent, "{message}");
    }
}

/// Preserver that logs the discarded content.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPreserver;

impl ContentPreserver for LogPreserver {
    fn preserve(&self, key: &SessionKey, html: &str) {
        info!(key = %key, bytes = html.len(), "Preserved local content before resync");
        debug!(key = %key, content = html, "Preserved content");
    }
}

/// In-memory document store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    fields: Mutex<HashMap<FieldTarget, String>>,
    read_only: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes to every field of `document_id`.
    pub fn lock_document(&self, document_id: impl Into<String>) {
        lock(&self.read_only).push(document_id.into());
    }

    pub fn field_content(&self, target: &FieldTarget) -> Option<String> {
        lock(&self.fields).get(target).cloned()
    }
}

impl DocumentStore for MemoryStore {
    fn set_field_content(&self, target: &FieldTarget, html: &str) -> CollabResult<()> {
        if lock(&self.read_only).contains(&target.document_id) {
            return Err(CollabError::Persistence(format!(
                "document {} is read-only",
                target.document_id
            )));
        }
        lock(&self.fields).insert(target.clone(), html.to_string());
        Ok(())
    }
}

/// Notifier that records every warning.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    warnings: Mutex<Vec<(String, WarnOptions)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warnings(&self) -> Vec<(String, WarnOptions)> {
        lock(&self.warnings).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn warn(&self, message: &str, options: WarnOptions) {
        lock(&self.warnings).push((message.to_string(), options));
    }
}

/// Preserver that keeps preserved content in memory.
#[derive(Debug, Default)]
pub struct RecordingPreserver {
    preserved: Mutex<Vec<(SessionKey, String)>>,
}

impl RecordingPreserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preserved(&self) -> Vec<(SessionKey, String)> {
        lock(&self.preserved).clone()
    }
}

impl ContentPreserver for RecordingPreserver {
    fn preserve(&self, key: &SessionKey, html: &str) {
        lock(&self.preserved).push((key.clone(), html.to_string()));
    }
}
