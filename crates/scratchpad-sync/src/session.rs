//! SessionController: one logical connection to the relay.
//!
//! The controller performs no I/O. Every input (activation, transport events,
//! the fetched connection record, inbound frames, flush ticks) is a method
//! call; every side effect it wants is queued as a [`Command`] and drained by
//! the caller with [`SessionController::take_commands`]. Inputs are handled
//! one at a time, so symmetric-key derivation is naturally at-most-once.
//!
//! Transport lifecycle:
//!
//! ```text
//!   Closed ──activate──▶ Connecting ──opened──▶ Open
//!     ▲                      │                    │
//!     └────────closed────────┴────────closed──────┘
//!            (wanted_open: schedule reconnect after backoff, backoff *= 2)
//! ```
//!
//! Every transport attempt is tagged with the session generation and an
//! attempt number. Events carrying any other tag come from a socket or a
//! request that has since been replaced and are dropped.

use scratchpad_core::config::SessionConfig;
use scratchpad_core::types::{
    ConnectionId, FileEntry, FileList, Origin, TextDocument, TransportState,
};
use scratchpad_core::{PushRejection, ScratchpadError, ScratchpadResult};
use scratchpad_crypto::{encode_key, LocalKeypair, PublicJwk, SymmetricKey};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::keystore::KeyStore;
use crate::protocol::{ConnectionRecord, WireMessage};
use crate::scratchpad::ScratchpadState;
use crate::store::KeyValueStore;

// ── Tags and commands ─────────────────────────────────────────────────────────

/// Identifies the transport attempt an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag {
    pub generation: u64,
    pub attempt: u64,
}

/// Side effect requested by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open a channel to `url`; report its events with `tag`.
    OpenTransport { url: String, tag: Tag },
    /// Close the current channel, if any.
    CloseTransport,
    /// Write one text frame to the open channel.
    Send(String),
    /// Fetch the relay's record for `id`; report it with `generation`.
    FetchRecord { id: ConnectionId, generation: u64 },
    /// Call [`SessionController::on_reconnect_due`] after `delay`.
    ScheduleReconnect { delay: Duration, generation: u64 },
    /// Drop any pending reconnect timer.
    CancelReconnect,
}

/// Tunables taken from `[session]`.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub initial_backoff: Duration,
    pub quiet_interval: Duration,
    pub welcome_text: String,
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        SessionSettings {
            initial_backoff: config.initial_backoff(),
            quiet_interval: Duration::from_millis(config.quiet_interval_ms),
            welcome_text: config.welcome_text.clone(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        (&SessionConfig::default()).into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Pending,
    Loaded,
    /// Fetch failed; retried on the next transport open.
    Failed,
}

/// Read-only view for UIs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub connection: Option<ConnectionId>,
    pub transport: TransportState,
    pub keyed: bool,
    pub wanted_open: bool,
    pub backoff_secs: u64,
    pub text: String,
    pub last_change: u64,
    pub files: FileList,
    pub origin: Origin,
    pub dirty: bool,
    pub files_dirty: bool,
    pub notified: bool,
}

// ── SessionController ─────────────────────────────────────────────────────────

pub struct SessionController {
    settings: SessionSettings,
    generation: u64,
    attempt: u64,
    connection: Option<ConnectionId>,
    socket_url: String,
    transport: TransportState,
    wanted_open: bool,
    backoff: Backoff,
    key: Option<SymmetricKey>,
    /// The key came from the store at activation; the handshake is skipped.
    key_cached: bool,
    identity: Option<LocalKeypair>,
    /// Key-exchange frames waiting for the transport to open
    pending: Vec<String>,
    record: RecordState,
    scratchpad: ScratchpadState,
    commands: Vec<Command>,
}

impl SessionController {
    pub fn new(settings: SessionSettings) -> Self {
        let backoff = Backoff::new(settings.initial_backoff);
        SessionController {
            settings,
            generation: 0,
            attempt: 0,
            connection: None,
            socket_url: String::new(),
            transport: TransportState::Closed,
            wanted_open: false,
            backoff,
            key: None,
            key_cached: false,
            identity: None,
            pending: Vec::new(),
            record: RecordState::Pending,
            scratchpad: ScratchpadState::new(),
            commands: Vec::new(),
        }
    }

    /// Drain the side effects queued so far.
    pub fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    fn current_tag(&self) -> Tag {
        Tag {
            generation: self.generation,
            attempt: self.attempt,
        }
    }

    fn is_current(&self, tag: Tag) -> bool {
        self.connection.is_some() && tag == self.current_tag()
    }

    // ── Activation ────────────────────────────────────────────────────────────

    /// Start a session for `id`: load a cached key, open the channel, fetch
    /// the relay record. Any previous session is torn down first.
    ///
    /// A stored key that cannot be read is ignored; the handshake runs again
    /// and overwrites it.
    pub fn activate<S: KeyValueStore>(
        &mut self,
        id: ConnectionId,
        socket_url: String,
        store: &KeyStore<S>,
    ) {
        let key = match store.load_common_key(&id) {
            Ok(key) => key,
            Err(e) => {
                warn!(connection = %id, error = %e, "ignoring unreadable stored key");
                None
            }
        };
        if self.connection.is_some() {
            self.deactivate();
        }

        self.generation += 1;
        self.attempt = 1;
        self.connection = Some(id);
        self.socket_url = socket_url;
        self.scratchpad.reset();
        self.backoff.reset();
        self.wanted_open = true;
        self.transport = TransportState::Connecting;
        self.key_cached = key.is_some();
        self.key = key;
        self.record = RecordState::Pending;

        info!(connection = %id, keyed = self.key.is_some(), "activating connection");

        self.commands.push(Command::OpenTransport {
            url: self.socket_url.clone(),
            tag: self.current_tag(),
        });
        self.commands.push(Command::FetchRecord {
            id,
            generation: self.generation,
        });
    }

    /// Stop wanting the channel, close it, cancel any pending reconnect, and
    /// forget the key and document. Late events for the old session are
    /// ignored afterwards.
    pub fn deactivate(&mut self) {
        self.wanted_open = false;
        let Some(id) = self.connection.take() else {
            return;
        };
        info!(connection = %id, "deactivating connection");

        self.commands.push(Command::CancelReconnect);
        self.commands.push(Command::CloseTransport);
        self.generation += 1;
        self.transport = TransportState::Closed;
        self.key = None;
        self.key_cached = false;
        self.pending.clear();
        self.scratchpad.reset();
    }

    // ── Transport events ──────────────────────────────────────────────────────

    pub fn on_transport_open(&mut self, tag: Tag) {
        if !self.is_current(tag) {
            debug!(?tag, "ignoring open event from a stale transport");
            return;
        }
        info!(connection = ?self.connection, "transport open");
        self.transport = TransportState::Open;
        self.backoff.reset();

        for frame in self.pending.drain(..) {
            self.commands.push(Command::Send(frame));
        }

        if let (RecordState::Failed, Some(id)) = (self.record, self.connection) {
            self.record = RecordState::Pending;
            self.commands.push(Command::FetchRecord {
                id,
                generation: self.generation,
            });
        }
    }

    /// Error and close both land here.
    pub fn on_transport_closed(&mut self, tag: Tag, reason: &str) {
        if !self.is_current(tag) || self.transport == TransportState::Closed {
            debug!(?tag, "ignoring close event from a stale transport");
            return;
        }
        self.transport = TransportState::Closed;

        if self.wanted_open {
            let delay = self.backoff.next_delay();
            info!(
                connection = ?self.connection,
                reason,
                backoff_secs = delay.as_secs_f64(),
                "transport closed, scheduling reconnect"
            );
            self.commands.push(Command::ScheduleReconnect {
                delay,
                generation: self.generation,
            });
        } else {
            info!(connection = ?self.connection, reason, "transport closed");
        }
    }

    pub fn on_reconnect_due(&mut self, generation: u64) {
        if generation != self.generation
            || self.connection.is_none()
            || !self.wanted_open
            || self.transport != TransportState::Closed
        {
            debug!(generation, "ignoring stale reconnect timer");
            return;
        }
        self.attempt += 1;
        self.transport = TransportState::Connecting;
        debug!(connection = ?self.connection, attempt = self.attempt, "reconnecting");
        self.commands.push(Command::OpenTransport {
            url: self.socket_url.clone(),
            tag: self.current_tag(),
        });
    }

    // ── Handshake ─────────────────────────────────────────────────────────────

    /// Handle the fetched relay record: run the handshake unless the key was
    /// cached at activation, then adopt the stored text and files.
    pub fn on_record<S: KeyValueStore>(
        &mut self,
        generation: u64,
        record: ConnectionRecord,
        store: &mut KeyStore<S>,
    ) -> ScratchpadResult<()> {
        if generation != self.generation || self.connection.is_none() {
            debug!(generation, "ignoring stale connection record");
            return Ok(());
        }

        self.record = RecordState::Loaded;
        let handshake = if self.key_cached {
            Ok(())
        } else {
            self.handshake(&record, store)
        };

        self.reconcile(&record);
        handshake
    }

    /// The record could not be fetched. The handshake waits for the next
    /// transport open, or for the peer's key-exchange.
    pub fn on_record_failed(&mut self, generation: u64, error: &ScratchpadError) {
        if generation != self.generation || self.connection.is_none() {
            return;
        }
        warn!(connection = ?self.connection, %error, "fetching connection record failed");
        self.record = RecordState::Failed;
        if self.scratchpad.text().is_empty() && !self.scratchpad.is_dirty() {
            self.scratchpad.set_placeholder(self.settings.welcome_text.clone());
        }
    }

    fn handshake<S: KeyValueStore>(
        &mut self,
        record: &ConnectionRecord,
        store: &mut KeyStore<S>,
    ) -> ScratchpadResult<()> {
        let identity = self.identity(store)?;
        let lookup = record.locate(&identity);

        if !lookup.local_registered {
            debug!(connection = ?self.connection, "relay does not know our key yet, announcing it");
            let frame = WireMessage::KeyExchange {
                key: identity.public_jwk().clone(),
            }
            .to_frame()?;
            if self.transport == TransportState::Open {
                self.commands.push(Command::Send(frame));
            } else {
                self.pending.push(frame);
            }
        }

        // The peer's key-exchange may have keyed us before the record arrived.
        if self.key.is_some() {
            return Ok(());
        }
        match lookup.peer {
            Some(peer) => self.establish_key(&identity, peer, store),
            None => {
                info!(connection = ?self.connection, "waiting for the other party");
                Ok(())
            }
        }
    }

    /// Derive and persist the key from `peer`. Only ever called while no key
    /// is held.
    fn establish_key<S: KeyValueStore>(
        &mut self,
        identity: &LocalKeypair,
        peer: &PublicJwk,
        store: &mut KeyStore<S>,
    ) -> ScratchpadResult<()> {
        let Some(id) = self.connection else {
            return Ok(());
        };
        let key = identity.derive_symmetric_key(peer)?;
        store.store_common_key(&id, &key)?;
        info!(connection = %id, "symmetric key established");
        self.key = Some(key);
        Ok(())
    }

    fn identity<S: KeyValueStore>(&mut self, store: &mut KeyStore<S>) -> ScratchpadResult<LocalKeypair> {
        if let Some(identity) = &self.identity {
            return Ok(identity.clone());
        }
        let identity = store.local_keypair()?;
        self.identity = Some(identity.clone());
        Ok(identity)
    }

    fn reconcile(&mut self, record: &ConnectionRecord) {
        let Some(key) = &self.key else {
            self.scratchpad.set_placeholder(self.settings.welcome_text.clone());
            return;
        };

        match &record.last_text {
            Some(envelope) => match envelope.open::<TextDocument>(key) {
                Ok(doc) => self.scratchpad.remote_text_change(doc),
                Err(e) => {
                    warn!(error = %e, "stored text could not be opened, showing placeholder");
                    self.scratchpad.set_placeholder(self.settings.welcome_text.clone());
                }
            },
            None => self.scratchpad.set_placeholder(self.settings.welcome_text.clone()),
        }

        if let Some(envelope) = &record.last_files {
            match envelope.open::<FileList>(key) {
                Ok(files) => self.scratchpad.remote_files_change(files),
                Err(e) => warn!(error = %e, "stored file list could not be opened"),
            }
        }
    }

    // ── Inbound frames ────────────────────────────────────────────────────────

    /// Route one inbound frame. `Protocol` and `Decryption` errors only drop
    /// the frame; the channel stays up.
    pub fn on_frame<S: KeyValueStore>(
        &mut self,
        tag: Tag,
        frame: &str,
        store: &mut KeyStore<S>,
    ) -> ScratchpadResult<()> {
        if !self.is_current(tag) {
            debug!(?tag, "ignoring frame from a stale transport");
            return Ok(());
        }

        let message = WireMessage::from_frame(frame)?;
        debug!(kind = message.kind(), "received frame");

        match message {
            WireMessage::Denied => {
                warn!(connection = ?self.connection, "relay denied the connection");
                self.wanted_open = false;
                self.commands.push(Command::CancelReconnect);
            }
            WireMessage::KeyExchange { key } => {
                if self.key.is_some() {
                    // An established key is never replaced.
                    debug!("ignoring key-exchange, key already established");
                    return Ok(());
                }
                let identity = self.identity(store)?;
                if identity.is_local_public_key(Some(&key)) {
                    debug!("ignoring our own key-exchange");
                    return Ok(());
                }
                self.establish_key(&identity, &key, store)?;
            }
            WireMessage::Text(envelope) => {
                let Some(key) = &self.key else {
                    debug!("dropping text, no key yet");
                    return Ok(());
                };
                let doc: TextDocument = envelope.open(key)?;
                self.scratchpad.remote_text_change(doc);
            }
            WireMessage::Files(envelope) => {
                let Some(key) = &self.key else {
                    debug!("dropping files, no key yet");
                    return Ok(());
                };
                let files: FileList = envelope.open(key)?;
                self.scratchpad.remote_files_change(files);
            }
        }
        Ok(())
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    fn push_key(&self) -> ScratchpadResult<&SymmetricKey> {
        if self.transport != TransportState::Open {
            return Err(ScratchpadError::PushRejected(PushRejection::TransportNotOpen));
        }
        self.key
            .as_ref()
            .ok_or(ScratchpadError::PushRejected(PushRejection::NoSymmetricKey))
    }

    /// Encrypt and send a document. Never queued: fails unless the channel
    /// is open and keyed.
    pub fn push_text(&mut self, doc: &TextDocument) -> ScratchpadResult<()> {
        let frame = WireMessage::seal_text(doc, self.push_key()?)?.to_frame()?;
        debug!(bytes = frame.len(), "pushing text");
        self.commands.push(Command::Send(frame));
        Ok(())
    }

    /// Encrypt and send the whole file list. Same rules as [`Self::push_text`].
    pub fn push_files(&mut self, files: &FileList) -> ScratchpadResult<()> {
        let frame = WireMessage::seal_files(files, self.push_key()?)?.to_frame()?;
        debug!(count = files.len(), bytes = frame.len(), "pushing files");
        self.commands.push(Command::Send(frame));
        Ok(())
    }

    /// A queued frame could not be handed to the channel. The channel is
    /// treated as closed and whatever the frame carried is sent again later.
    pub fn on_send_failed(&mut self, frame: &str, reason: &str) {
        if self.connection.is_none() {
            return;
        }
        match WireMessage::from_frame(frame) {
            Ok(WireMessage::Text(_)) => self.scratchpad.mark_text_unsent(),
            Ok(WireMessage::Files(_)) => self.scratchpad.mark_files_unsent(),
            Ok(WireMessage::KeyExchange { .. }) => self.pending.push(frame.to_string()),
            Ok(WireMessage::Denied) | Err(_) => {}
        }
        if self.transport != TransportState::Closed {
            warn!(connection = ?self.connection, reason, "send failed, dropping transport");
            self.commands.push(Command::CloseTransport);
            let tag = self.current_tag();
            self.on_transport_closed(tag, reason);
        }
    }

    // ── Local edits and flush ─────────────────────────────────────────────────

    pub fn local_text(&mut self, text: impl Into<String>, now_ms: u64) {
        self.scratchpad.local_text_change(text, now_ms);
    }

    /// Append a file and push the list right away.
    pub fn add_file(&mut self, entry: FileEntry) -> ScratchpadResult<()> {
        self.scratchpad.add_file(entry);
        self.flush_files()
    }

    /// Remove a file and push the list right away. `None` if out of range.
    pub fn delete_file(&mut self, index: usize) -> ScratchpadResult<Option<FileEntry>> {
        let removed = self.scratchpad.delete_file(index);
        if removed.is_some() {
            self.flush_files()?;
        }
        Ok(removed)
    }

    pub fn mark_notified(&mut self) {
        self.scratchpad.mark_notified();
    }

    /// Periodic flush: push the text once it has been quiet long enough, and
    /// retry a file list whose last push was rejected.
    pub fn tick(&mut self, now_ms: u64) -> ScratchpadResult<()> {
        if let Some(doc) = self
            .scratchpad
            .due_text(now_ms, self.settings.quiet_interval)
            .cloned()
        {
            match self.push_text(&doc) {
                Ok(()) => self.scratchpad.mark_text_pushed(),
                Err(ScratchpadError::PushRejected(reason)) => {
                    debug!(%reason, "text push deferred");
                }
                Err(e) => return Err(e),
            }
        }
        self.flush_files()
    }

    fn flush_files(&mut self) -> ScratchpadResult<()> {
        let Some(files) = self.scratchpad.due_files().cloned() else {
            return Ok(());
        };
        match self.push_files(&files) {
            Ok(()) => {
                self.scratchpad.mark_files_pushed();
                Ok(())
            }
            Err(ScratchpadError::PushRejected(reason)) => {
                debug!(%reason, "file push deferred");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    pub fn transport_state(&self) -> TransportState {
        self.transport
    }

    pub fn wanted_open(&self) -> bool {
        self.wanted_open
    }

    pub fn is_keyed(&self) -> bool {
        self.key.is_some()
    }

    pub fn symmetric_key(&self) -> Option<&SymmetricKey> {
        self.key.as_ref()
    }

    /// Delay the next reconnect would use.
    pub fn backoff(&self) -> Duration {
        self.backoff.current()
    }

    pub fn scratchpad(&self) -> &ScratchpadState {
        &self.scratchpad
    }

    /// Mnemonic of the active key, for out-of-band comparison.
    pub fn fingerprint(&self) -> Option<Vec<&'static str>> {
        self.key.as_ref().map(encode_key)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            connection: self.connection,
            transport: self.transport,
            keyed: self.key.is_some(),
            wanted_open: self.wanted_open,
            backoff_secs: self.backoff.current().as_secs(),
            text: self.scratchpad.text().to_string(),
            last_change: self.scratchpad.last_change(),
            files: self.scratchpad.files().clone(),
            origin: self.scratchpad.origin(),
            dirty: self.scratchpad.is_dirty(),
            files_dirty: self.scratchpad.files_dirty(),
            notified: self.scratchpad.is_notified(),
        }
    }
}
