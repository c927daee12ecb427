//! Editor session: one editor instance bound to one field.
//!
//! A session starts `Uninitialized`, becomes `Active` once it has an
//! authoritative snapshot, passes through `Resyncing` when its state can no
//! longer be reconciled, and ends `Closed`. Local-only sessions are `Active`
//! from the start and never talk to an authority.
//!
//! Collaborative sessions keep two states: `confirmed` (what the authority
//! has acknowledged) and `local` (confirmed plus pending steps). The local
//! state is always rebuilt from the confirmed state, so it can never drift
//! from what the authority will end up with once pending steps land.

use crate::channel::Channel;
use crate::codec::{JsonStepCodec, StepCodec};
use crate::error::{CollabError, CollabResult};
use crate::ids::{ClientId, FieldTarget, SessionKey};
use crate::interfaces::{
    ContentPreserver, DocumentStore, EditorView, LogNotifier, LogPreserver, Notifier, WarnOptions,
};
use crate::presence::PresenceChange;
use crate::protocol::{ClientMessage, ServerMessage, WireHistoryEntry, ERROR_NOT_JOINED};
use crate::transform::{ConfirmedStep, OtEngine, TransformEngine};
use doc_model::{Document, DocumentState, Mapping, Selection, Step};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

const RESYNC_NOTICE: &str =
    "This editor fell out of sync with other editors and was reloaded. Unsaved changes were preserved.";

/// Configuration for editor sessions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Hand unsaved local content to the preserver before a resync.
    pub preserve_on_resync: bool,
    /// Show the resync notice until the user dismisses it.
    pub persistent_resync_notice: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            preserve_on_resync: true,
            persistent_resync_notice: true,
        }
    }
}

/// Lifecycle state of an editor session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Uninitialized,
    Active,
    Resyncing,
    Closed,
}

/// Something observable that happened to a session.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// The session received its authoritative snapshot.
    Activated { key: SessionKey, version: u64 },
    /// Confirmed steps were merged into local state.
    StepsApplied {
        key: SessionKey,
        steps: usize,
        own: usize,
        version: u64,
    },
    /// The session started waiting for a fresh snapshot.
    ResyncStarted { key: SessionKey },
    /// The session adopted a fresh authoritative snapshot.
    Resynced {
        key: SessionKey,
        version: u64,
        preserved: bool,
    },
    /// The set of users editing the field changed.
    UsersChanged {
        key: SessionKey,
        change: PresenceChange,
    },
    /// Autosaved content arrived for an observed field.
    Autosaved { key: SessionKey },
}

/// Shared collaborators used by every session of a client runtime.
#[derive(Clone)]
pub struct SessionServices {
    pub engine: Arc<dyn TransformEngine>,
    pub codec: Arc<dyn StepCodec>,
    pub notifier: Arc<dyn Notifier>,
    pub preserver: Arc<dyn ContentPreserver>,
    pub config: SessionConfig,
}

impl Default for SessionServices {
    fn default() -> Self {
        Self {
            engine: Arc::new(OtEngine),
            codec: Arc::new(JsonStepCodec),
            notifier: Arc::new(LogNotifier),
            preserver: Arc::new(LogPreserver),
            config: SessionConfig::default(),
        }
    }
}

struct CollabLink {
    client_id: ClientId,
    channel: Arc<dyn Channel>,
    /// (confirmed version, pending count) of the last submission.
    last_submitted: Option<(u64, usize)>,
    awaiting_steps: bool,
}

/// One editor instance bound to one field.
pub struct EditorSession {
    key: SessionKey,
    status: SessionStatus,
    target: Option<FieldTarget>,
    link: Option<CollabLink>,
    confirmed: DocumentState,
    local: DocumentState,
    pending: Vec<Step>,
    selection: Option<Selection>,
    focused: bool,
    dirty: bool,
    /// Whether content was handed to the preserver before the current resync.
    preserved: bool,
    view: Option<Box<dyn EditorView>>,
    services: SessionServices,
}

impl std::fmt::Debug for EditorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditorSession")
            .field("key", &self.key)
            .field("status", &self.status)
            .field("version", &self.local.version())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl EditorSession {
    /// Create a session that edits `initial` without collaboration.
    pub fn local(initial: Document, services: SessionServices) -> Self {
        let state = DocumentState::new(initial);
        Self {
            key: SessionKey::local(),
            status: SessionStatus::Active,
            target: None,
            link: None,
            confirmed: state.clone(),
            local: state,
            pending: Vec::new(),
            selection: None,
            focused: false,
            dirty: false,
            preserved: false,
            view: None,
            services,
        }
    }

    /// Create a collaborative session and ask the authority to join.
    ///
    /// `initial` is only used if the authority has no state for the key
    /// yet. The session stays `Uninitialized` until the authority answers.
    pub fn collaborative(
        key: SessionKey,
        client_id: ClientId,
        channel: Arc<dyn Channel>,
        initial: Document,
        services: SessionServices,
    ) -> CollabResult<Self> {
        let state = DocumentState::new(initial.clone());
        let session = Self {
            target: key.field_target(),
            key: key.clone(),
            status: SessionStatus::Uninitialized,
            link: Some(CollabLink {
                client_id,
                channel: Arc::clone(&channel),
                last_submitted: None,
                awaiting_steps: false,
            }),
            confirmed: state.clone(),
            local: state,
            pending: Vec::new(),
            selection: None,
            focused: false,
            dirty: false,
            preserved: false,
            view: None,
            services,
        };

        channel.send(ClientMessage::Join {
            key,
            initial: Some(initial),
            since: None,
        })?;
        debug!(key = %session.key, "Join requested");
        Ok(session)
    }

    /// Persist to `target` on save.
    pub fn with_target(mut self, target: FieldTarget) -> Self {
        self.target = Some(target);
        self
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_collaborative(&self) -> bool {
        self.link.is_some()
    }

    pub fn target(&self) -> Option<&FieldTarget> {
        self.target.as_ref()
    }

    /// The document as the user sees it.
    pub fn doc(&self) -> &Document {
        self.local.doc()
    }

    /// Local version: confirmed version plus pending steps.
    pub fn version(&self) -> u64 {
        self.local.version()
    }

    pub fn confirmed_version(&self) -> u64 {
        self.confirmed.version()
    }

    pub fn confirmed_doc(&self) -> &Document {
        self.confirmed.doc()
    }

    pub fn pending(&self) -> &[Step] {
        &self.pending
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn selection(&self) -> Option<Selection> {
        self.selection
    }

    pub fn is_focused(&self) -> bool {
        self.focused
    }

    pub fn set_focused(&mut self, focused: bool) {
        self.focused = focused;
    }

    pub fn set_selection(&mut self, selection: Selection) {
        self.selection = Some(selection.clamp(self.local.doc().len()));
    }

    /// Attach a view and render into it.
    pub fn mount(&mut self, view: Box<dyn EditorView>) {
        self.view = Some(view);
        self.render();
    }

    fn render(&mut self) {
        if let Some(view) = self.view.as_mut() {
            view.render(self.local.doc(), self.selection);
        }
    }

    fn ensure_active(&self) -> CollabResult<()> {
        if self.status == SessionStatus::Active {
            Ok(())
        } else {
            Err(CollabError::NotActive {
                key: self.key.clone(),
                status: self.status,
            })
        }
    }

    /// Apply a user edit to the local state.
    ///
    /// Collaborative sessions queue the step and submit it; a disconnected
    /// channel only delays the submission.
    pub fn apply_local(&mut self, step: Step) -> CollabResult<()> {
        self.ensure_active()?;
        self.local.apply(&step)?;

        if let Some(selection) = self.selection {
            let mapping = Mapping::from(step.get_map());
            self.selection = Some(selection.map(&mapping).clamp(self.local.doc().len()));
        }
        if self.link.is_some() {
            self.pending.push(step);
        } else {
            self.confirmed = self.local.clone();
        }
        self.dirty = true;
        self.render();
        self.flush()?;
        Ok(())
    }

    /// Submit pending steps if there is anything new to submit.
    ///
    /// Returns true if a submission was sent.
    pub fn flush(&mut self) -> CollabResult<bool> {
        if self.status != SessionStatus::Active || self.pending.is_empty() {
            return Ok(false);
        }
        let Some(link) = self.link.as_mut() else {
            return Ok(false);
        };
        if !link.channel.is_connected() {
            return Ok(false);
        }
        let marker = (self.confirmed.version(), self.pending.len());
        if link.last_submitted == Some(marker) {
            return Ok(false);
        }

        let steps = self.services.codec.encode_all(&self.pending)?;
        let message = ClientMessage::Submit {
            key: self.key.clone(),
            version: self.confirmed.version(),
            steps,
        };
        match link.channel.send(message) {
            Ok(()) => {
                link.last_submitted = Some(marker);
                debug!(key = %self.key, version = marker.0, steps = marker.1, "Submitted pending steps");
                Ok(true)
            }
            Err(CollabError::ChannelDisconnected) => {
                debug!(key = %self.key, "Channel down, keeping steps pending");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Handle a message from the authority addressed to this session.
    pub fn handle(&mut self, message: ServerMessage) -> CollabResult<Option<SessionEvent>> {
        if self.status == SessionStatus::Closed {
            debug!(key = %self.key, "Dropping message for closed session");
            return Ok(None);
        }
        match message {
            ServerMessage::Joined { state, version, .. } => Ok(Some(self.adopt_snapshot(state, version))),
            ServerMessage::Resync { state, version, .. } => {
                if self.status == SessionStatus::Active {
                    self.local_content_lost();
                }
                Ok(Some(self.adopt_snapshot(state, version)))
            }
            ServerMessage::JoinDenied { reason, .. } => {
                warn!(key = %self.key, %reason, "Join denied");
                self.status = SessionStatus::Closed;
                self.view = None;
                Err(CollabError::JoinDenied {
                    key: self.key.clone(),
                    reason,
                })
            }
            ServerMessage::NewSteps { offset, history, .. } => self.receive_steps(offset, history),
            ServerMessage::Error { code, message, .. } => {
                if code == ERROR_NOT_JOINED && self.status != SessionStatus::Uninitialized {
                    info!(key = %self.key, "Authority dropped this session, rejoining");
                    self.rejoin()?;
                } else {
                    warn!(key = %self.key, %code, %message, "Authority reported an error");
                }
                Ok(None)
            }
            ServerMessage::UsersEditing { .. }
            | ServerMessage::Autosave { .. }
            | ServerMessage::Welcome { .. } => Ok(None),
        }
    }

    fn receive_steps(
        &mut self,
        offset: u64,
        history: Vec<WireHistoryEntry>,
    ) -> CollabResult<Option<SessionEvent>> {
        if self.status != SessionStatus::Active {
            debug!(key = %self.key, status = ?self.status, "Ignoring steps while not active");
            return Ok(None);
        }
        let confirmed_version = self.confirmed.version();
        if offset > confirmed_version {
            self.request_missing_steps(confirmed_version)?;
            return Ok(None);
        }

        let skip = usize::try_from(confirmed_version - offset).unwrap_or(usize::MAX);
        if skip >= history.len() {
            debug!(key = %self.key, offset, "Batch already applied");
            self.flush()?;
            return Ok(None);
        }

        let mut incoming = Vec::with_capacity(history.len() - skip);
        for entry in &history[skip..] {
            match self.services.codec.decode(&entry.step) {
                Ok(step) => incoming.push(ConfirmedStep::new(
                    step,
                    entry.user_id.clone(),
                    entry.client_id.clone(),
                )),
                Err(e) => {
                    warn!(key = %self.key, error = %e, "Undecodable confirmed step");
                    return Ok(Some(self.begin_resync()?));
                }
            }
        }

        let client_id = match &mut self.link {
            Some(link) => {
                link.awaiting_steps = false;
                link.client_id.clone()
            }
            None => return Ok(None),
        };

        let rebased = match self
            .services
            .engine
            .rebase(&self.confirmed, &self.pending, &incoming, &client_id)
        {
            Ok(rebased) => rebased,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Rebase failed");
                return Ok(Some(self.begin_resync()?));
            }
        };

        if let Some(selection) = self.selection {
            let len = rebased.local.doc().len();
            self.selection = Some(if self.focused {
                selection.map(&rebased.mapping).clamp(len)
            } else {
                selection.clamp(len)
            });
        }
        self.confirmed = rebased.confirmed;
        self.local = rebased.local;
        self.pending = rebased.pending;
        self.render();
        self.flush()?;

        debug!(
            key = %self.key,
            steps = incoming.len(),
            own = rebased.confirmed_own,
            version = self.confirmed.version(),
            "Applied confirmed steps"
        );
        Ok(Some(SessionEvent::StepsApplied {
            key: self.key.clone(),
            steps: incoming.len(),
            own: rebased.confirmed_own,
            version: self.confirmed.version(),
        }))
    }

    fn request_missing_steps(&mut self, since: u64) -> CollabResult<()> {
        let Some(link) = self.link.as_mut() else {
            return Ok(());
        };
        if link.awaiting_steps {
            return Ok(());
        }
        debug!(key = %self.key, since, "Gap in confirmed steps, requesting catch-up");
        match link.channel.send(ClientMessage::RequestSteps {
            key: self.key.clone(),
            since,
        }) {
            Ok(()) => {
                link.awaiting_steps = true;
                Ok(())
            }
            Err(CollabError::ChannelDisconnected) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Give up on local state and wait for a fresh snapshot.
    fn begin_resync(&mut self) -> CollabResult<SessionEvent> {
        self.local_content_lost();
        self.status = SessionStatus::Resyncing;
        self.request_snapshot()?;
        Ok(SessionEvent::ResyncStarted {
            key: self.key.clone(),
        })
    }

    fn request_snapshot(&mut self) -> CollabResult<()> {
        let Some(link) = self.link.as_ref() else {
            return Ok(());
        };
        match link.channel.send(ClientMessage::RequestSnapshot {
            key: self.key.clone(),
        }) {
            Ok(()) | Err(CollabError::ChannelDisconnected) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Preserve unsaved content and tell the user about the resync.
    fn local_content_lost(&mut self) {
        let preserve = self.services.config.preserve_on_resync && (self.dirty || !self.pending.is_empty());
        if preserve {
            self.services
                .preserver
                .preserve(&self.key, &self.local.doc().to_html());
        }
        self.services.notifier.warn(
            RESYNC_NOTICE,
            WarnOptions {
                persistent: self.services.config.persistent_resync_notice,
            },
        );
        info!(key = %self.key, preserved = preserve, "Resyncing editor session");
        self.preserved = preserve;
    }

    fn adopt_snapshot(&mut self, doc: Document, version: u64) -> SessionEvent {
        let previous = self.status;
        let state = DocumentState::at_version(doc, version);
        self.confirmed = state.clone();
        self.local = state;
        self.pending.clear();
        if let Some(selection) = self.selection {
            self.selection = Some(selection.clamp(self.local.doc().len()));
        }
        if let Some(link) = self.link.as_mut() {
            link.last_submitted = None;
            link.awaiting_steps = false;
        }
        self.status = SessionStatus::Active;
        self.render();

        if previous == SessionStatus::Uninitialized {
            info!(key = %self.key, version, "Editor session active");
            SessionEvent::Activated {
                key: self.key.clone(),
                version,
            }
        } else {
            let preserved = std::mem::take(&mut self.preserved);
            self.dirty = false;
            SessionEvent::Resynced {
                key: self.key.clone(),
                version,
                preserved,
            }
        }
    }

    /// The channel went down. Pending steps stay queued.
    pub fn on_disconnected(&mut self) {
        if let Some(link) = self.link.as_mut() {
            link.last_submitted = None;
            link.awaiting_steps = false;
            debug!(key = %self.key, pending = self.pending.len(), "Channel disconnected");
        }
    }

    /// The channel came back: rejoin and catch up.
    pub fn on_reconnected(&mut self) -> CollabResult<()> {
        if self.status == SessionStatus::Closed || self.link.is_none() {
            return Ok(());
        }
        self.rejoin()
    }

    fn rejoin(&mut self) -> CollabResult<()> {
        let Some(link) = self.link.as_mut() else {
            return Ok(());
        };
        link.last_submitted = None;
        link.awaiting_steps = false;
        let message = match self.status {
            SessionStatus::Active => ClientMessage::Join {
                key: self.key.clone(),
                initial: Some(self.confirmed.doc().clone()),
                since: Some(self.confirmed.version()),
            },
            SessionStatus::Uninitialized | SessionStatus::Resyncing => ClientMessage::Join {
                key: self.key.clone(),
                initial: Some(self.confirmed.doc().clone()),
                since: None,
            },
            SessionStatus::Closed => return Ok(()),
        };
        info!(key = %self.key, status = ?self.status, "Rejoining session");
        match link.channel.send(message) {
            Ok(()) | Err(CollabError::ChannelDisconnected) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Persist the rendered content to the session's field.
    pub fn save(&mut self, store: &dyn DocumentStore) -> CollabResult<()> {
        let target = self.target.as_ref().ok_or_else(|| {
            CollabError::Persistence(format!("session {} has no field to save to", self.key))
        })?;
        store.set_field_content(target, &self.local.doc().to_html())?;
        self.dirty = false;
        debug!(key = %self.key, "Saved field content");
        Ok(())
    }

    /// Persist and publish the current content to observers.
    pub fn autosave(&mut self, store: &dyn DocumentStore) -> CollabResult<()> {
        self.ensure_active()?;
        self.save(store)?;
        if let Some(link) = self.link.as_ref() {
            let message = ClientMessage::Autosave {
                key: self.key.clone(),
                html: self.local.doc().to_html(),
            };
            match link.channel.send(message) {
                Ok(()) | Err(CollabError::ChannelDisconnected) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Keep the authority's presence entry for this session alive.
    pub fn heartbeat(&self) -> CollabResult<()> {
        match self.link.as_ref() {
            Some(link) if self.status != SessionStatus::Closed => link.channel.send(ClientMessage::Heartbeat {
                key: self.key.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Leave the authority session and stop processing messages.
    pub fn close(&mut self) {
        if self.status == SessionStatus::Closed {
            return;
        }
        if let Some(link) = self.link.as_ref() {
            if let Err(e) = link.channel.send(ClientMessage::Leave {
                key: self.key.clone(),
            }) {
                debug!(key = %self.key, error = %e, "Leave not delivered");
            }
        }
        self.status = SessionStatus::Closed;
        self.view = None;
        info!(key = %self.key, "Editor session closed");
    }
}
