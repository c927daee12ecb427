//! Integration tests for the collaboration system
//! Tests convergence, concurrent editing, reconnects and presence
//!
//! These tests simulate several clients editing the same field through one
//! authority, with explicit control over when the authority processes
//! submissions and when each client receives its messages.

use chrono::Utc;
use collab::{
    Authority, AuthorityCommand, AuthorityConfig, AuthorityService, ClientId, EditorRegistry,
    EditorSession, LocalChannel, PresenceChange, RecordingNotifier, RecordingPreserver,
    ServerMessage, SessionEvent, SessionKey, SessionServices, SessionStatus, UserId,
};
use doc_model::{Document, Mark, Node, Step};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const DOC: &str = "JournalEntry.1";
const FIELD: &str = "text.content";

fn key() -> SessionKey {
    SessionKey::collaborative(DOC, FIELD)
}

struct SimulatedClient {
    channel: Arc<LocalChannel>,
    inbound: mpsc::UnboundedReceiver<ServerMessage>,
    registry: EditorRegistry,
    notifier: Arc<RecordingNotifier>,
    preserver: Arc<RecordingPreserver>,
    events: Vec<SessionEvent>,
}

impl SimulatedClient {
    fn session(&self) -> &EditorSession {
        self.registry.get(&key()).expect("session is open")
    }

    fn edit(&mut self, step: Step) {
        self.registry
            .session_mut(&key())
            .unwrap()
            .apply_local(step)
            .unwrap();
    }

    /// Apply an edit if the session currently accepts one.
    fn try_edit(&mut self, step: Step) {
        if let Some(session) = self.registry.get_mut(&key()) {
            let _ = session.apply_local(step);
        }
    }

    fn text(&self) -> String {
        self.session().doc().text_content()
    }

    fn last_presence_change(&self) -> Option<&PresenceChange> {
        self.events.iter().rev().find_map(|event| match event {
            SessionEvent::UsersChanged { change, .. } => Some(change),
            _ => None,
        })
    }
}

/// Test harness for simulating multiple clients
struct CollaborationHarness {
    authority: Authority,
    commands_tx: mpsc::UnboundedSender<AuthorityCommand>,
    commands_rx: mpsc::UnboundedReceiver<AuthorityCommand>,
    clients: Vec<SimulatedClient>,
}

impl CollaborationHarness {
    fn new() -> Self {
        Self::with_config(AuthorityConfig::default())
    }

    fn with_config(config: AuthorityConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            authority: Authority::new(config),
            commands_tx,
            commands_rx,
            clients: Vec::new(),
        }
    }

    /// Add a new client
    fn add_client(&mut self, user: &str) -> usize {
        let client_id = ClientId::new(format!("{user}-{}", self.clients.len()));
        let (channel, inbound) =
            LocalChannel::connect(client_id.clone(), UserId::from(user), self.commands_tx.clone())
                .unwrap();
        let channel = Arc::new(channel);
        let notifier = Arc::new(RecordingNotifier::new());
        let preserver = Arc::new(RecordingPreserver::new());
        let services = SessionServices {
            notifier: notifier.clone(),
            preserver: preserver.clone(),
            ..SessionServices::default()
        };
        let registry = EditorRegistry::new(client_id, channel.clone(), services);
        self.clients.push(SimulatedClient {
            channel,
            inbound,
            registry,
            notifier,
            preserver,
            events: Vec::new(),
        });
        self.clients.len() - 1
    }

    fn open(&mut self, idx: usize, initial: &str) {
        self.clients[idx]
            .registry
            .open_collaborative(DOC, FIELD, Document::from_paragraphs([initial]))
            .unwrap();
    }

    fn disconnect(&mut self, idx: usize) {
        let client = &mut self.clients[idx];
        client.channel.disconnect();
        client.registry.on_disconnected();
    }

    fn reconnect(&mut self, idx: usize) {
        let client = &mut self.clients[idx];
        if client.channel.reconnect().is_ok() {
            client.registry.on_reconnected().unwrap();
        }
    }

    /// Process every queued command at the authority.
    fn pump_authority(&mut self) -> bool {
        let mut progressed = false;
        while let Ok(command) = self.commands_rx.try_recv() {
            self.authority.apply_command(command);
            progressed = true;
        }
        progressed
    }

    /// Deliver everything queued for one client.
    fn deliver(&mut self, idx: usize) -> bool {
        let client = &mut self.clients[idx];
        let mut progressed = false;
        while let Ok(message) = client.inbound.try_recv() {
            progressed = true;
            if let Ok(Some(event)) = client.registry.dispatch(message) {
                client.events.push(event);
            }
        }
        progressed
    }

    /// Run the authority and all clients until no messages are in flight.
    fn settle(&mut self) {
        for _ in 0..10_000 {
            let mut progressed = self.pump_authority();
            for idx in 0..self.clients.len() {
                progressed |= self.deliver(idx);
            }
            if !progressed {
                return;
            }
        }
        panic!("collaboration did not settle");
    }

    fn assert_converged(&self) {
        let expected = self
            .authority
            .document(&key())
            .expect("authority holds the session")
            .state()
            .clone();
        for client in &self.clients {
            let Some(session) = client.registry.get(&key()) else {
                continue;
            };
            assert_eq!(session.status(), SessionStatus::Active);
            assert!(session.pending().is_empty());
            assert_eq!(session.doc(), expected.doc());
            assert_eq!(session.version(), expected.version());
        }
    }
}

// =============================================================================
// Concurrent editing
// =============================================================================

#[test]
fn test_two_user_concurrent_insert() {
    let mut harness = CollaborationHarness::new();
    let bob = harness.add_client("bob");
    let alice = harness.add_client("alice");

    harness.open(bob, "Hello world");
    harness.settle();
    // bring the document to version 10 without changing its text
    for _ in 0..5 {
        harness.clients[bob].edit(Step::insert_text(12, "x"));
        harness.settle();
        harness.clients[bob].edit(Step::delete(12, 13));
        harness.settle();
    }
    harness.open(alice, "ignored");
    harness.settle();
    assert_eq!(harness.clients[alice].session().version(), 10);
    assert_eq!(harness.clients[alice].text(), "Hello world");

    // bob's edit is sequenced first
    harness.clients[bob].edit(Step::insert_text(6, ", there"));
    harness.pump_authority();

    harness.clients[alice].edit(Step::insert_text(12, "!"));
    assert_eq!(harness.clients[alice].session().version(), 11);
    assert_eq!(harness.clients[alice].text(), "Hello world!");

    harness.deliver(alice);
    let session = harness.clients[alice].session();
    assert_eq!(session.doc().text_content(), "Hello, there world!");
    assert_eq!(session.version(), 12);
    assert_eq!(session.confirmed_version(), 11);

    harness.settle();
    let session = harness.clients[alice].session();
    assert!(session.pending().is_empty());
    assert_eq!(session.confirmed_version(), 12);
    assert_eq!(harness.clients[bob].text(), "Hello, there world!");
    harness.assert_converged();
}

#[test]
fn test_own_steps_apply_exactly_once() {
    let mut harness = CollaborationHarness::new();
    let alice = harness.add_client("alice");
    harness.open(alice, "abc");
    harness.settle();

    harness.clients[alice].edit(Step::insert_text(4, "!"));
    harness.clients[alice].edit(Step::insert_text(5, "?"));
    harness.settle();

    assert_eq!(harness.clients[alice].text(), "abc!?");
    assert_eq!(harness.clients[alice].session().version(), 2);
    let own: usize = harness.clients[alice]
        .events
        .iter()
        .map(|event| match event {
            SessionEvent::StepsApplied { own, .. } => *own,
            _ => 0,
        })
        .sum();
    assert_eq!(own, 2);
    harness.assert_converged();
}

#[test]
fn test_concurrent_formatting_and_typing() {
    let mut harness = CollaborationHarness::new();
    let alice = harness.add_client("alice");
    let bob = harness.add_client("bob");
    harness.open(alice, "make this bold");
    harness.open(bob, "make this bold");
    harness.settle();

    // alice bolds "bold" while bob types at the start
    harness.clients[alice].edit(Step::add_mark(11, 15, Mark::Bold));
    harness.clients[bob].edit(Step::insert_text(1, ">> "));
    harness.settle();

    harness.assert_converged();
    let session = harness.clients[bob].session();
    assert_eq!(session.doc().text_content(), ">> make this bold");
    assert_eq!(
        session.doc().to_html(),
        "<p>&gt;&gt; make this <strong>bold</strong></p>"
    );
}

#[test]
fn test_insert_into_concurrently_deleted_text_is_dropped() {
    let mut harness = CollaborationHarness::new();
    let alice = harness.add_client("alice");
    let bob = harness.add_client("bob");
    harness.open(alice, "abcdef");
    harness.open(bob, "abcdef");
    harness.settle();

    harness.clients[alice].edit(Step::delete(2, 6));
    harness.pump_authority();
    harness.clients[bob].edit(Step::insert_text(4, "X"));
    harness.settle();

    harness.assert_converged();
    assert_eq!(harness.clients[alice].text(), "af");
}

// =============================================================================
// Presence
// =============================================================================

#[test]
fn test_presence_follows_open_and_close() {
    let mut harness = CollaborationHarness::new();
    let alice = harness.add_client("alice");
    let bob = harness.add_client("bob");
    let carol = harness.add_client("carol");

    harness.open(alice, "text");
    harness.open(bob, "text");
    harness.settle();
    let pair = vec![UserId::from("alice"), UserId::from("bob")];
    assert_eq!(harness.clients[alice].registry.users_editing(&key()), pair);

    harness.open(carol, "text");
    harness.settle();
    let trio = vec![UserId::from("alice"), UserId::from("bob"), UserId::from("carol")];
    for idx in [alice, bob, carol] {
        assert_eq!(harness.clients[idx].registry.users_editing(&key()), trio);
    }
    for idx in [alice, bob] {
        let change = harness.clients[idx].last_presence_change().unwrap();
        assert_eq!(change.joined, vec![UserId::from("carol")]);
    }

    assert!(harness.clients[carol].registry.close(&key()));
    harness.settle();
    for idx in [alice, bob] {
        assert_eq!(harness.clients[idx].registry.users_editing(&key()), pair);
        let change = harness.clients[idx].last_presence_change().unwrap();
        assert_eq!(change.left, vec![UserId::from("carol")]);
    }
}

#[test]
fn test_two_tabs_of_one_user_count_once() {
    let mut harness = CollaborationHarness::new();
    let tab1 = harness.add_client("alice");
    let tab2 = harness.add_client("alice");
    harness.open(tab1, "x");
    harness.open(tab2, "x");
    harness.settle();
    assert_eq!(
        harness.clients[tab1].registry.users_editing(&key()),
        vec![UserId::from("alice")]
    );

    harness.clients[tab2].registry.close(&key());
    harness.settle();
    assert_eq!(
        harness.clients[tab1].registry.users_editing(&key()),
        vec![UserId::from("alice")]
    );
}

// =============================================================================
// Disconnects and resync
// =============================================================================

#[test]
fn test_offline_edits_merge_after_reconnect() {
    let mut harness = CollaborationHarness::new();
    let alice = harness.add_client("alice");
    let bob = harness.add_client("bob");
    harness.open(alice, "shared text");
    harness.open(bob, "shared text");
    harness.settle();

    harness.disconnect(bob);
    harness.clients[bob].edit(Step::insert_text(1, "B: "));
    harness.clients[alice].edit(Step::insert_text(12, "!"));
    harness.settle();
    assert_eq!(harness.clients[bob].session().pending().len(), 1);

    harness.reconnect(bob);
    harness.settle();

    harness.assert_converged();
    assert_eq!(harness.clients[alice].text(), "B: shared text!");
    assert!(harness.clients[bob].preserver.preserved().is_empty());
    assert!(harness.clients[bob].notifier.warnings().is_empty());
}

#[test]
fn test_reconnect_outside_retention_resyncs_and_preserves() {
    let mut harness = CollaborationHarness::with_config(AuthorityConfig {
        history_retention: 2,
        ..AuthorityConfig::default()
    });
    let alice = harness.add_client("alice");
    let bob = harness.add_client("bob");
    harness.open(alice, "abc");
    harness.open(bob, "abc");
    harness.settle();

    harness.disconnect(bob);
    harness.clients[bob].edit(Step::insert_text(1, "B"));
    for _ in 0..4 {
        harness.clients[alice].edit(Step::insert_text(4, "a"));
        harness.settle();
    }

    harness.reconnect(bob);
    harness.settle();

    harness.assert_converged();
    assert_eq!(harness.clients[bob].text(), "abcaaaa");
    let preserved = harness.clients[bob].preserver.preserved();
    assert_eq!(preserved, vec![(key(), "<p>Babc</p>".to_string())]);
    let warnings = harness.clients[bob].notifier.warnings();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].1.persistent);
    assert!(harness.clients[bob]
        .events
        .iter()
        .any(|event| matches!(event, SessionEvent::Resynced { version: 4, preserved: true, .. })));
}

#[test]
fn test_idle_editors_rejoin_after_expiry() {
    let mut harness = CollaborationHarness::new();
    let alice = harness.add_client("alice");
    let bob = harness.add_client("bob");
    harness.open(alice, "abc");
    harness.open(bob, "abc");
    harness.settle();

    harness
        .authority
        .expire_idle(Utc::now() + chrono::Duration::seconds(600));
    harness.settle();
    let both = vec![UserId::from("alice"), UserId::from("bob")];
    for idx in [alice, bob] {
        assert_eq!(harness.clients[idx].session().status(), SessionStatus::Active);
        assert_eq!(harness.clients[idx].registry.users_editing(&key()), both);
    }

    // bob never sent anything after expiry but still receives alice's edit
    harness.clients[alice].edit(Step::insert_text(4, "!"));
    harness.settle();
    assert_eq!(harness.clients[bob].text(), "abc!");
    harness.assert_converged();
}

#[test]
fn test_closed_session_drops_late_messages() {
    let mut harness = CollaborationHarness::new();
    let alice = harness.add_client("alice");
    let bob = harness.add_client("bob");
    harness.open(alice, "abc");
    harness.open(bob, "abc");
    harness.settle();

    harness.clients[bob].edit(Step::insert_text(1, "b"));
    harness.pump_authority();
    assert!(harness.clients[alice].registry.close(&key()));
    harness.settle();

    assert!(harness.clients[alice].registry.get(&key()).is_none());
    assert_eq!(
        harness.clients[bob].registry.users_editing(&key()),
        vec![UserId::from("bob")]
    );
    harness.assert_converged();
}

#[test]
fn test_authority_forgets_session_after_last_close() {
    let mut harness = CollaborationHarness::new();
    let alice = harness.add_client("alice");
    let bob = harness.add_client("bob");
    harness.open(alice, "abc");
    harness.open(bob, "abc");
    harness.settle();

    harness.clients[alice].registry.close(&key());
    harness.clients[bob].registry.close(&key());
    harness.settle();
    assert!(harness.authority.document(&key()).is_none());
    assert_eq!(harness.authority.stats().sessions, 0);
}

#[test]
fn test_join_denied_by_policy() {
    let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();
    let policy = |user: &UserId, _key: &SessionKey| {
        if user.0 == "viewer" {
            Err("view only".to_string())
        } else {
            Ok(())
        }
    };
    let mut authority =
        Authority::with_policy(AuthorityConfig::default(), collab::JsonStepCodec, policy);

    let client_id = ClientId::from("viewer-1");
    let (channel, mut inbound) =
        LocalChannel::connect(client_id.clone(), UserId::from("viewer"), commands_tx).unwrap();
    let mut registry =
        EditorRegistry::new(client_id, Arc::new(channel), SessionServices::default());
    registry
        .open_collaborative(DOC, FIELD, Document::empty())
        .unwrap();

    while let Ok(command) = commands_rx.try_recv() {
        authority.apply_command(command);
    }
    let message = inbound.try_recv().unwrap();
    let result = registry.dispatch(message);
    assert!(matches!(result, Err(collab::CollabError::JoinDenied { .. })));
    assert!(registry.is_empty());
}

// =============================================================================
// Async service
// =============================================================================

async fn dispatch_until(
    registry: &mut EditorRegistry,
    inbound: &mut mpsc::UnboundedReceiver<ServerMessage>,
    done: impl Fn(&SessionEvent) -> bool,
) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(message) = inbound.recv().await {
            if let Ok(Some(event)) = registry.dispatch(message) {
                if done(&event) {
                    return;
                }
            }
        }
        panic!("authority went away");
    })
    .await
    .expect("timed out waiting for authority");
}

#[tokio::test]
async fn test_editing_through_authority_service() {
    let (service, handle) = AuthorityService::new(Authority::new(AuthorityConfig::default()));
    let task = tokio::spawn(service.run());

    let (alice_channel, mut alice_rx) = handle
        .connect_local(ClientId::from("alice-1"), UserId::from("alice"))
        .unwrap();
    let (bob_channel, mut bob_rx) = handle
        .connect_local(ClientId::from("bob-1"), UserId::from("bob"))
        .unwrap();
    let mut alice = EditorRegistry::new(
        ClientId::from("alice-1"),
        Arc::new(alice_channel),
        SessionServices::default(),
    );
    let mut bob = EditorRegistry::new(
        ClientId::from("bob-1"),
        Arc::new(bob_channel),
        SessionServices::default(),
    );

    alice
        .open_collaborative(DOC, FIELD, Document::from_paragraphs(["hi"]))
        .unwrap();
    dispatch_until(&mut alice, &mut alice_rx, |e| {
        matches!(e, SessionEvent::Activated { .. })
    })
    .await;
    bob.open_collaborative(DOC, FIELD, Document::empty()).unwrap();
    dispatch_until(&mut bob, &mut bob_rx, |e| {
        matches!(e, SessionEvent::Activated { .. })
    })
    .await;
    assert_eq!(bob.get(&key()).unwrap().doc().text_content(), "hi");

    alice
        .session_mut(&key())
        .unwrap()
        .apply_local(Step::insert_text(3, "!"))
        .unwrap();
    dispatch_until(&mut bob, &mut bob_rx, |e| {
        matches!(e, SessionEvent::StepsApplied { .. })
    })
    .await;
    assert_eq!(bob.get(&key()).unwrap().doc().text_content(), "hi!");

    handle.shutdown();
    let authority = task.await.unwrap();
    assert_eq!(authority.document(&key()).unwrap().version(), 1);
}

// =============================================================================
// Convergence under random interleavings
// =============================================================================

#[derive(Debug, Clone)]
enum Action {
    Edit { client: usize, kind: u8, a: u16, b: u16 },
    PumpAuthority,
    Deliver(usize),
    Disconnect(usize),
    Reconnect(usize),
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        5 => (0..3usize, 0..6u8, any::<u16>(), any::<u16>())
            .prop_map(|(client, kind, a, b)| Action::Edit { client, kind, a, b }),
        2 => Just(Action::PumpAuthority),
        3 => (0..3usize).prop_map(Action::Deliver),
        // client 0 stays connected so the authority keeps its state
        1 => (1..3usize).prop_map(Action::Disconnect),
        1 => (1..3usize).prop_map(Action::Reconnect),
    ]
}

/// A step that is valid for `doc`.
fn random_step(doc: &Document, kind: u8, a: u16, b: u16) -> Step {
    let len = doc.len();
    let pos = 1 + a as usize % len;
    let range = || {
        let from = 1 + a as usize % (len - 1);
        let to = from + 1 + b as usize % (len - from);
        (from, to)
    };
    match kind {
        0 | 1 => Step::insert_text(pos, ["x", "yz", "q w"][b as usize % 3]),
        2 if len > 1 => {
            let (from, to) = range();
            Step::delete(from, to)
        }
        3 => Step::insert(pos, vec![Node::paragraph()]),
        4 if len > 1 => {
            let (from, to) = range();
            Step::add_mark(from, to, Mark::Italic)
        }
        5 => Step::set_attr(0, "align", serde_json::json!(["left", "center"][b as usize % 2])),
        _ => Step::insert_text(pos, "w"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_all_editors_converge(actions in prop::collection::vec(action(), 1..60)) {
        let mut harness = CollaborationHarness::new();
        for user in ["alice", "bob", "carol"] {
            let idx = harness.add_client(user);
            harness.open(idx, "The quick fox");
        }
        harness.settle();

        for action in actions {
            match action {
                Action::Edit { client, kind, a, b } => {
                    let doc = harness.clients[client].session().doc().clone();
                    harness.clients[client].try_edit(random_step(&doc, kind, a, b));
                }
                Action::PumpAuthority => {
                    harness.pump_authority();
                }
                Action::Deliver(idx) => {
                    harness.deliver(idx);
                }
                Action::Disconnect(idx) => harness.disconnect(idx),
                Action::Reconnect(idx) => harness.reconnect(idx),
            }
        }

        for idx in 0..harness.clients.len() {
            harness.reconnect(idx);
        }
        harness.settle();
        harness.assert_converged();
    }
}
