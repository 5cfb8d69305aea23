//! End-to-end behaviour of the session controller, driven by hand.

use scratchpad_core::types::{ConnectionId, FileEntry, FileList, Origin, TextDocument, TransportState};
use scratchpad_core::{PushRejection, ScratchpadError};
use scratchpad_crypto::LocalKeypair;
use scratchpad_sync::{
    Command, ConnectionRecord, Envelope, KeyStore, MemoryStore, SessionController,
    SessionSettings, Tag, WireMessage,
};
use std::time::Duration;

const URL: &str = "ws://relay.test/api/ws/conn";

fn conn() -> ConnectionId {
    "7d9f0c1e-2b3a-4c5d-8e6f-0a1b2c3d4e5f".parse().unwrap()
}

fn other_conn() -> ConnectionId {
    "11111111-2222-4333-8444-555555555555".parse().unwrap()
}

fn settings() -> SessionSettings {
    SessionSettings {
        initial_backoff: Duration::from_secs(1),
        quiet_interval: Duration::from_millis(1000),
        welcome_text: "welcome".into(),
    }
}

struct Party {
    session: SessionController,
    store: KeyStore<MemoryStore>,
    tag: Tag,
}

impl Party {
    fn new() -> Self {
        Party {
            session: SessionController::new(settings()),
            store: KeyStore::new(MemoryStore::new()),
            tag: Tag {
                generation: 0,
                attempt: 0,
            },
        }
    }

    /// Activate `id`, return the commands, remember the transport tag.
    fn activate(&mut self, id: ConnectionId) -> Vec<Command> {
        self.session.activate(id, URL.into(), &self.store);
        let cmds = self.session.take_commands();
        self.tag = open_tag(&cmds).expect("activation opens a transport");
        cmds
    }

    fn open(&mut self) -> Vec<Command> {
        self.session.on_transport_open(self.tag);
        self.session.take_commands()
    }

    fn record(&mut self, record: ConnectionRecord) -> Vec<Command> {
        self.session
            .on_record(self.tag.generation, record, &mut self.store)
            .unwrap();
        self.session.take_commands()
    }

    fn frame(&mut self, frame: &str) -> Vec<Command> {
        self.session
            .on_frame(self.tag, frame, &mut self.store)
            .unwrap();
        self.session.take_commands()
    }

    fn close(&mut self) -> Vec<Command> {
        self.session.on_transport_closed(self.tag, "test close");
        self.session.take_commands()
    }

    fn public_key(&mut self) -> scratchpad_crypto::PublicJwk {
        self.store.local_public_key().unwrap()
    }
}

fn open_tag(cmds: &[Command]) -> Option<Tag> {
    cmds.iter().find_map(|c| match c {
        Command::OpenTransport { tag, .. } => Some(*tag),
        _ => None,
    })
}

fn sent_frames(cmds: &[Command]) -> Vec<WireMessage> {
    cmds.iter()
        .filter_map(|c| match c {
            Command::Send(frame) => Some(WireMessage::from_frame(frame).unwrap()),
            _ => None,
        })
        .collect()
}

fn key_exchange(key: &scratchpad_crypto::PublicJwk) -> String {
    WireMessage::KeyExchange { key: key.clone() }
        .to_frame()
        .unwrap()
}

/// Activated, open, keyed against a throwaway peer.
fn keyed_party() -> (Party, LocalKeypair) {
    let mut party = Party::new();
    party.activate(conn());
    party.open();
    party.record(ConnectionRecord::default());
    let peer = LocalKeypair::generate();
    party.frame(&key_exchange(peer.public_jwk()));
    assert!(party.session.is_keyed());
    (party, peer)
}

// ── Pairing ───────────────────────────────────────────────────────────────────

#[test]
fn test_two_parties_pair_through_the_relay() {
    let mut alice = Party::new();
    let mut bob = Party::new();

    // Alice is first: empty record, announces herself once the socket opens.
    alice.activate(conn());
    assert!(alice.record(ConnectionRecord::default()).is_empty());
    let sent = sent_frames(&alice.open());
    assert_eq!(sent.len(), 1);
    let WireMessage::KeyExchange { key: alice_pub } = &sent[0] else {
        panic!("expected key-exchange");
    };
    assert!(!alice.session.is_keyed());

    // The relay stored Alice in slot a. Bob derives straight from the record.
    bob.activate(conn());
    bob.open();
    let sent = sent_frames(&bob.record(ConnectionRecord {
        a: Some(alice_pub.clone()),
        ..Default::default()
    }));
    assert!(bob.session.is_keyed());
    let WireMessage::KeyExchange { key: bob_pub } = &sent[0] else {
        panic!("expected key-exchange");
    };

    // The relay forwards Bob's key to Alice.
    alice.frame(&key_exchange(bob_pub));
    assert!(alice.session.is_keyed());
    assert_eq!(alice.session.symmetric_key(), bob.session.symmetric_key());
    assert_eq!(alice.session.fingerprint(), bob.session.fingerprint());
    assert_eq!(alice.session.fingerprint().unwrap().len(), 26);

    // Text flows from Alice to Bob.
    alice.session.local_text("hello bob", 10_000);
    alice.session.tick(11_000).unwrap();
    let cmds = alice.session.take_commands();
    let Command::Send(frame) = &cmds[0] else {
        panic!("expected a push, got {cmds:?}");
    };
    bob.frame(frame);
    assert_eq!(bob.session.scratchpad().text(), "hello bob");
    assert_eq!(bob.session.scratchpad().origin(), Origin::Remote);
}

#[test]
fn test_registered_party_with_cached_key_skips_handshake() {
    let (mut first, _peer) = keyed_party();
    let key = first.session.symmetric_key().cloned().unwrap();
    let me = first.public_key();

    // Same device, new session: the key comes from the store.
    first.session.deactivate();
    first.session.take_commands();
    first.activate(conn());
    assert!(first.session.is_keyed());
    first.open();
    let cmds = first.record(ConnectionRecord {
        a: Some(me),
        b: Some(LocalKeypair::generate().public_jwk().clone()),
        ..Default::default()
    });
    assert!(sent_frames(&cmds).is_empty());
    assert_eq!(first.session.symmetric_key(), Some(&key));
}

#[test]
fn test_peer_key_before_record_still_announces_local_key() {
    let mut party = Party::new();
    let peer = LocalKeypair::generate();
    party.activate(conn());
    assert!(sent_frames(&party.open()).is_empty());

    // The peer's key-exchange overtakes the record fetch.
    party.frame(&key_exchange(peer.public_jwk()));
    assert!(party.session.is_keyed());
    let key = party.session.symmetric_key().cloned().unwrap();

    // The relay only knows the peer; our key must still go out.
    let sent = sent_frames(&party.record(ConnectionRecord {
        a: Some(peer.public_jwk().clone()),
        ..Default::default()
    }));
    let me = party.public_key();
    assert_eq!(sent, vec![WireMessage::KeyExchange { key: me }]);
    assert_eq!(party.session.symmetric_key(), Some(&key));
}

#[test]
fn test_unreadable_stored_key_reruns_handshake() {
    let mut party = Party::new();
    party
        .store
        .persist_value(
            &format!("{}-commonKey", conn()),
            Some(&serde_json::json!({"kty": "oct", "k": "AAAA"})),
        )
        .unwrap();
    assert!(party.store.load_common_key(&conn()).is_err());

    party.activate(conn());
    assert!(!party.session.is_keyed());
    party.open();

    let peer = LocalKeypair::generate();
    let sent = sent_frames(&party.record(ConnectionRecord {
        a: Some(peer.public_jwk().clone()),
        ..Default::default()
    }));
    assert!(matches!(sent.as_slice(), [WireMessage::KeyExchange { .. }]));
    assert!(party.session.is_keyed());
    assert_eq!(
        party.store.load_common_key(&conn()).unwrap().as_ref(),
        party.session.symmetric_key()
    );
}

#[test]
fn test_handshake_is_idempotent() {
    let (mut party, peer) = keyed_party();
    let established = party.store.load_common_key(&conn()).unwrap().unwrap();

    // The same key again, then a stranger's key.
    party.frame(&key_exchange(peer.public_jwk()));
    party.frame(&key_exchange(LocalKeypair::generate().public_jwk()));

    assert_eq!(party.session.symmetric_key(), Some(&established));
    assert_eq!(
        party.store.load_common_key(&conn()).unwrap().unwrap(),
        established
    );
}

#[test]
fn test_malformed_peer_key_fails_without_keying() {
    let mut party = Party::new();
    party.activate(conn());
    party.open();
    party.record(ConnectionRecord::default());

    let mut bad = LocalKeypair::generate().public_jwk().clone();
    bad.crv = "P-256".into();
    let err = party
        .session
        .on_frame(party.tag, &key_exchange(&bad), &mut party.store)
        .unwrap_err();

    assert!(matches!(err, ScratchpadError::KeyAgreement(_)));
    assert!(!party.session.is_keyed());
    assert!(party.store.load_common_key(&conn()).unwrap().is_none());
}

#[test]
fn test_record_history_is_adopted() {
    let (mut party, _peer) = keyed_party();
    let key = party.session.symmetric_key().cloned().unwrap();
    let files: FileList = vec![FileEntry {
        name: "notes.md".into(),
        size: 4,
        mime_type: "text/markdown".into(),
        data: "IyBoaQ==".into(),
    }];
    let record = ConnectionRecord {
        last_text: Some(Envelope::seal(&TextDocument::new("stored", 42), &key).unwrap()),
        last_files: Some(Envelope::seal(&files, &key).unwrap()),
        ..Default::default()
    };

    party.record(record);

    assert_eq!(party.session.scratchpad().text(), "stored");
    assert_eq!(party.session.scratchpad().last_change(), 42);
    assert_eq!(party.session.scratchpad().files(), &files);
}

#[test]
fn test_undecryptable_history_falls_back_to_placeholder() {
    let (mut party, _peer) = keyed_party();
    let foreign = scratchpad_crypto::SymmetricKey::generate();
    let record = ConnectionRecord {
        last_text: Some(Envelope::seal(&TextDocument::new("x", 1), &foreign).unwrap()),
        ..Default::default()
    };

    party.record(record);
    assert_eq!(party.session.scratchpad().text(), "welcome");
}

#[test]
fn test_foreign_or_tampered_text_is_dropped() {
    let (mut party, _peer) = keyed_party();
    let key = party.session.symmetric_key().cloned().unwrap();
    party.session.local_text("mine", 10);

    let foreign = WireMessage::seal_text(
        &TextDocument::new("intruder", 20),
        &scratchpad_crypto::SymmetricKey::generate(),
    )
    .unwrap()
    .to_frame()
    .unwrap();

    let mut envelope = Envelope::seal(&TextDocument::new("edited", 30), &key).unwrap();
    let mut sealed = envelope.encrypted.into_bytes();
    sealed[2] = if sealed[2] == b'A' { b'B' } else { b'A' };
    envelope.encrypted = String::from_utf8(sealed).unwrap();
    let tampered = WireMessage::Text(envelope).to_frame().unwrap();

    for frame in [foreign, tampered] {
        let err = party
            .session
            .on_frame(party.tag, &frame, &mut party.store)
            .unwrap_err();
        assert!(matches!(err, ScratchpadError::Decryption(_)), "{err:?}");
        assert!(err.is_message_local());
    }

    assert!(party.session.take_commands().is_empty());
    assert_eq!(party.session.scratchpad().text(), "mine");
    assert!(party.session.scratchpad().is_dirty());
    assert_eq!(party.session.scratchpad().origin(), Origin::Local);
    assert_eq!(party.session.transport_state(), TransportState::Open);
}

// ── Transport lifecycle ───────────────────────────────────────────────────────

#[test]
fn test_backoff_doubles_per_close_and_resets_on_open() {
    let mut party = Party::new();
    party.activate(conn());

    let mut delays = Vec::new();
    for _ in 0..5 {
        let cmds = party.close();
        let (delay, generation) = match cmds.as_slice() {
            [Command::ScheduleReconnect { delay, generation }] => (*delay, *generation),
            other => panic!("expected a reconnect, got {other:?}"),
        };
        delays.push(delay.as_secs());

        party.session.on_reconnect_due(generation);
        let cmds = party.session.take_commands();
        party.tag = open_tag(&cmds).unwrap();
        assert_eq!(party.session.transport_state(), TransportState::Connecting);
    }
    assert_eq!(delays, [1, 2, 4, 8, 16]);

    party.open();
    assert_eq!(party.session.transport_state(), TransportState::Open);
    match party.close().as_slice() {
        [Command::ScheduleReconnect { delay, .. }] => assert_eq!(*delay, Duration::from_secs(1)),
        other => panic!("expected a reconnect, got {other:?}"),
    }
}

#[test]
fn test_denied_is_terminal() {
    let mut party = Party::new();
    party.activate(conn());
    party.open();

    party.frame(r#"{"type":"denied"}"#);
    assert!(!party.session.wanted_open());

    let cmds = party.close();
    assert!(cmds
        .iter()
        .all(|c| !matches!(c, Command::ScheduleReconnect { .. })));
    assert_eq!(party.session.transport_state(), TransportState::Closed);
}

#[test]
fn test_events_from_a_previous_connection_are_ignored() {
    let (mut party, _peer) = keyed_party();
    let old_tag = party.tag;
    let key = party.session.symmetric_key().cloned().unwrap();

    party.activate(other_conn());
    assert!(!party.session.is_keyed());

    let late = WireMessage::seal_text(&TextDocument::new("late", 1), &key)
        .unwrap()
        .to_frame()
        .unwrap();
    party
        .session
        .on_frame(old_tag, &late, &mut party.store)
        .unwrap();
    party.session.on_transport_open(old_tag);
    party.session.on_transport_closed(old_tag, "late close");
    party
        .session
        .on_record(old_tag.generation, ConnectionRecord::default(), &mut party.store)
        .unwrap();

    assert!(party.session.take_commands().is_empty());
    assert_eq!(party.session.scratchpad().text(), "");
    assert_eq!(party.session.transport_state(), TransportState::Connecting);
}

// ── Flush ─────────────────────────────────────────────────────────────────────

#[test]
fn test_bursts_of_edits_coalesce_into_one_push() {
    let (mut party, _peer) = keyed_party();
    let key = party.session.symmetric_key().cloned().unwrap();
    let edits = [(0u64, "a"), (200, "ab"), (900, "abc")];

    let mut pending = edits.iter().peekable();
    let mut pushes = Vec::new();
    for now in (0..=4000u64).step_by(250) {
        // edits that happened since the previous tick
        while let Some((at, text)) = pending.next_if(|(at, _)| *at <= now) {
            party.session.local_text(*text, *at);
        }
        party.session.tick(now).unwrap();
        for msg in sent_frames(&party.session.take_commands()) {
            pushes.push((now, msg));
        }
    }

    assert_eq!(pushes.len(), 1, "{pushes:?}");
    let (at, WireMessage::Text(envelope)) = &pushes[0] else {
        panic!("expected a text push");
    };
    assert_eq!(*at, 2000);
    let doc: TextDocument = envelope.open(&key).unwrap();
    assert_eq!(doc, TextDocument::new("abc", 900));
    assert!(!party.session.scratchpad().is_dirty());
}

#[test]
fn test_rejected_push_keeps_text_dirty_until_reconnect() {
    let (mut party, _peer) = keyed_party();
    party.session.local_text("offline edit", 0);
    party.close();

    assert!(matches!(
        party.session.push_text(&TextDocument::new("x", 0)),
        Err(ScratchpadError::PushRejected(PushRejection::TransportNotOpen))
    ));
    party.session.tick(5_000).unwrap();
    assert!(party.session.take_commands().is_empty());
    assert!(party.session.scratchpad().is_dirty());

    party.session.on_reconnect_due(party.tag.generation);
    let cmds = party.session.take_commands();
    party.tag = open_tag(&cmds).unwrap();
    party.open();
    party.session.tick(6_000).unwrap();

    let sent = sent_frames(&party.session.take_commands());
    assert!(matches!(sent.as_slice(), [WireMessage::Text(_)]));
    assert!(!party.session.scratchpad().is_dirty());
}

#[test]
fn test_file_changes_push_immediately_or_retry_on_tick() {
    let (mut party, _peer) = keyed_party();
    let entry = FileEntry {
        name: "a.bin".into(),
        size: 2,
        mime_type: "application/octet-stream".into(),
        data: "AAE=".into(),
    };

    party.session.add_file(entry.clone()).unwrap();
    let sent = sent_frames(&party.session.take_commands());
    assert!(matches!(sent.as_slice(), [WireMessage::Files(_)]));

    party.close();
    assert_eq!(party.session.delete_file(0).unwrap(), Some(entry));
    assert!(party.session.scratchpad().files_dirty());
    assert_eq!(party.session.delete_file(3).unwrap(), None);

    party.session.on_reconnect_due(party.tag.generation);
    party.tag = open_tag(&party.session.take_commands()).unwrap();
    party.open();
    party.session.tick(0).unwrap();

    let sent = sent_frames(&party.session.take_commands());
    assert!(matches!(sent.as_slice(), [WireMessage::Files(_)]));
    assert!(!party.session.scratchpad().files_dirty());
}

#[test]
fn test_remote_update_clears_notified_flag() {
    let (mut party, _peer) = keyed_party();
    let key = party.session.symmetric_key().cloned().unwrap();
    party.session.mark_notified();
    assert!(party.session.snapshot().notified);

    let frame = WireMessage::seal_text(&TextDocument::new("ping", 7), &key)
        .unwrap()
        .to_frame()
        .unwrap();
    party.frame(&frame);

    let snapshot = party.session.snapshot();
    assert!(!snapshot.notified);
    assert_eq!(snapshot.text, "ping");
    assert_eq!(snapshot.origin, Origin::Remote);
    assert!(snapshot.keyed);
}

#[test]
fn test_failed_send_restores_dirty_and_reconnects() {
    let (mut party, _peer) = keyed_party();
    party.session.local_text("important edit", 0);
    party.session.tick(5_000).unwrap();
    let cmds = party.session.take_commands();
    let Some(Command::Send(frame)) = cmds.first() else {
        panic!("expected a push, got {cmds:?}");
    };
    assert!(!party.session.scratchpad().is_dirty());

    party.session.on_send_failed(frame, "writer stopped");
    assert!(party.session.scratchpad().is_dirty());
    assert_eq!(party.session.transport_state(), TransportState::Closed);
    let cmds = party.session.take_commands();
    assert_eq!(cmds[0], Command::CloseTransport);
    assert!(matches!(cmds[1], Command::ScheduleReconnect { .. }));

    // the dead socket's own close is not counted twice
    assert!(party.close().is_empty());

    party.session.on_reconnect_due(party.tag.generation);
    party.tag = open_tag(&party.session.take_commands()).unwrap();
    party.open();
    party.session.tick(6_000).unwrap();
    let sent = sent_frames(&party.session.take_commands());
    assert!(matches!(sent.as_slice(), [WireMessage::Text(_)]));
}
