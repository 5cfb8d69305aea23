//! The single consumer loop that drives a [`SessionController`].
//!
//! [`ScratchpadClient::run`] owns the controller, the key store, the live
//! transport handle and the reconnect timer. It handles one input at a time
//! (a UI request, a transport event, a relay reply, a timer, a flush tick),
//! then executes the commands the controller queued and publishes a fresh
//! [`Snapshot`]. Nothing else touches session state.
//!
//! UIs talk to the loop through a cloneable [`ClientHandle`].

use scratchpad_core::config::{ClientConfig, ScratchpadConfig};
use scratchpad_core::types::{now_millis, ConnectionId, FileEntry};
use scratchpad_core::{ScratchpadError, ScratchpadResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::keystore::KeyStore;
use crate::protocol::ConnectionRecord;
use crate::relay::RelayApi;
use crate::session::{Command, SessionController, SessionSettings, Snapshot};
use crate::store::KeyValueStore;
use crate::transport::{Connector, TransportEvent, TransportHandle};

// ── Requests ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Switch to `id`, or to no connection.
    ChangeConnection(Option<ConnectionId>),
    /// Disconnect and forget the current connection.
    RemoveConnection,
    /// Replace the document text.
    LocalText(String),
    AddFile(FileEntry),
    DeleteFile(usize),
    MarkNotified,
    Shutdown,
}

type Reply = oneshot::Sender<ScratchpadResult<()>>;

/// Cloneable front door to a running [`ScratchpadClient`].
#[derive(Clone)]
pub struct ClientHandle {
    requests: mpsc::UnboundedSender<(Request, Reply)>,
    snapshot: watch::Receiver<Snapshot>,
}

impl ClientHandle {
    /// Send a request and wait until the loop has processed it.
    pub async fn request(&self, request: Request) -> ScratchpadResult<()> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send((request, tx))
            .map_err(|_| ScratchpadError::Other(anyhow::anyhow!("client loop has stopped")))?;
        rx.await
            .map_err(|_| ScratchpadError::Other(anyhow::anyhow!("client loop dropped the request")))?
    }

    pub async fn change_connection(&self, id: Option<ConnectionId>) -> ScratchpadResult<()> {
        self.request(Request::ChangeConnection(id)).await
    }

    pub async fn remove_connection(&self) -> ScratchpadResult<()> {
        self.request(Request::RemoveConnection).await
    }

    pub async fn set_text(&self, text: impl Into<String>) -> ScratchpadResult<()> {
        self.request(Request::LocalText(text.into())).await
    }

    pub async fn add_file(&self, entry: FileEntry) -> ScratchpadResult<()> {
        self.request(Request::AddFile(entry)).await
    }

    pub async fn delete_file(&self, index: usize) -> ScratchpadResult<()> {
        self.request(Request::DeleteFile(index)).await
    }

    pub async fn mark_notified(&self) -> ScratchpadResult<()> {
        self.request(Request::MarkNotified).await
    }

    pub async fn shutdown(&self) -> ScratchpadResult<()> {
        self.request(Request::Shutdown).await
    }

    /// Latest published state.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that wakes on every state change.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }
}

// ── Loop ──────────────────────────────────────────────────────────────────────

enum Internal {
    Record {
        generation: u64,
        result: ScratchpadResult<ConnectionRecord>,
    },
    ReconnectDue {
        generation: u64,
    },
}

pub struct ScratchpadClient<S, C, R> {
    controller: SessionController,
    store: KeyStore<S>,
    connector: C,
    relay: Arc<R>,
    client_config: ClientConfig,
    flush_tick: Duration,
    transport: Option<TransportHandle>,
    reconnect: Option<CancellationToken>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    requests: mpsc::UnboundedReceiver<(Request, Reply)>,
    snapshot: watch::Sender<Snapshot>,
}

impl<S, C, R> ScratchpadClient<S, C, R>
where
    S: KeyValueStore,
    C: Connector,
    R: RelayApi + 'static,
{
    pub fn new(
        config: &ScratchpadConfig,
        store: KeyStore<S>,
        connector: C,
        relay: R,
    ) -> (Self, ClientHandle) {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());

        let client = ScratchpadClient {
            controller: SessionController::new(SessionSettings::from(&config.session)),
            store,
            connector,
            relay: Arc::new(relay),
            client_config: config.client.clone(),
            flush_tick: config.session.flush_tick(),
            transport: None,
            reconnect: None,
            transport_tx,
            transport_rx,
            internal_tx,
            internal_rx,
            requests: request_rx,
            snapshot: snapshot_tx,
        };
        let handle = ClientHandle {
            requests: request_tx,
            snapshot: snapshot_rx,
        };
        (client, handle)
    }

    /// Run until [`Request::Shutdown`] or until every handle is dropped.
    /// Resumes the stored current connection, if any.
    pub async fn run(mut self) -> ScratchpadResult<()> {
        let resumed = self.resume();
        report(resumed);
        self.execute();
        self.publish();

        let mut ticker = tokio::time::interval(self.flush_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = self.requests.recv() => {
                    let Some((request, reply)) = request else {
                        debug!("all client handles dropped");
                        break;
                    };
                    if request == Request::Shutdown {
                        self.stop();
                        let _ = reply.send(Ok(()));
                        return Ok(());
                    }
                    let result = self.handle_request(request);
                    self.execute();
                    self.publish();
                    let _ = reply.send(result);
                }
                Some(event) = self.transport_rx.recv() => self.handle_transport(event),
                Some(event) = self.internal_rx.recv() => self.handle_internal(event),
                _ = ticker.tick() => {
                    let result = self.controller.tick(now_millis());
                    report(result);
                }
            }
            self.execute();
            self.publish();
        }

        self.stop();
        Ok(())
    }

    /// Reactivate the stored current connection, if any. A failure here
    /// leaves the client idle instead of stopping it.
    fn resume(&mut self) -> ScratchpadResult<()> {
        let Some(id) = self.store.current_connection()? else {
            return Ok(());
        };
        let socket_url = self.client_config.socket_url(&id)?;
        self.controller.activate(id, socket_url, &self.store);
        Ok(())
    }

    fn stop(&mut self) {
        info!("stopping scratchpad client");
        self.controller.deactivate();
        self.execute();
        self.publish();
    }

    fn handle_request(&mut self, request: Request) -> ScratchpadResult<()> {
        match request {
            Request::ChangeConnection(id) => self.change_connection(id),
            Request::RemoveConnection => self.remove_connection(),
            Request::LocalText(text) => {
                self.controller.local_text(text, now_millis());
                Ok(())
            }
            Request::AddFile(entry) => self.controller.add_file(entry),
            Request::DeleteFile(index) => match self.controller.delete_file(index)? {
                Some(_) => Ok(()),
                None => Err(ScratchpadError::Other(anyhow::anyhow!(
                    "no file at index {index}"
                ))),
            },
            Request::MarkNotified => {
                self.controller.mark_notified();
                Ok(())
            }
            Request::Shutdown => Ok(()),
        }
    }

    /// Tear down the current session, persist the new selection, and start
    /// a session for `id` (appending it to the known connections).
    fn change_connection(&mut self, id: Option<ConnectionId>) -> ScratchpadResult<()> {
        self.controller.deactivate();
        self.store.set_current_connection(id.as_ref())?;

        let Some(id) = id else {
            return Ok(());
        };
        if self.store.add_connection(&id)? {
            info!(connection = %id, "added connection");
        }
        let socket_url = self.client_config.socket_url(&id)?;
        self.controller.activate(id, socket_url, &self.store);
        Ok(())
    }

    /// Disconnect and forget the current connection and its key.
    fn remove_connection(&mut self) -> ScratchpadResult<()> {
        let current = match self.controller.connection() {
            Some(id) => Some(id),
            None => self.store.current_connection()?,
        };
        self.controller.deactivate();
        match current {
            Some(id) => self.store.forget_connection(&id),
            None => Ok(()),
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened { tag } => self.controller.on_transport_open(tag),
            TransportEvent::Frame { tag, text } => {
                let result = self.controller.on_frame(tag, &text, &mut self.store);
                report(result);
            }
            TransportEvent::Closed { tag, reason } => {
                self.controller.on_transport_closed(tag, &reason)
            }
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Record { generation, result } => match result {
                Ok(record) => {
                    let result = self.controller.on_record(generation, record, &mut self.store);
                    report(result);
                }
                Err(e) => self.controller.on_record_failed(generation, &e),
            },
            Internal::ReconnectDue { generation } => {
                self.reconnect = None;
                self.controller.on_reconnect_due(generation);
            }
        }
    }

    // ── Command execution ─────────────────────────────────────────────────────

    /// Run queued commands until the controller has nothing left; a failed
    /// send queues more.
    fn execute(&mut self) {
        loop {
            let commands = self.controller.take_commands();
            if commands.is_empty() {
                return;
            }
            for command in commands {
                self.run_command(command);
            }
        }
    }

    fn run_command(&mut self, command: Command) {
        match command {
            Command::OpenTransport { url, tag } => {
                if let Some(old) = self.transport.take() {
                    old.close();
                }
                debug!(%url, ?tag, "opening transport");
                self.transport =
                    Some(self.connector.connect(&url, tag, self.transport_tx.clone()));
            }
            Command::CloseTransport => {
                if let Some(handle) = self.transport.take() {
                    handle.close();
                }
            }
            Command::Send(frame) => {
                let sent = match &self.transport {
                    Some(handle) => handle.send(frame.clone()),
                    None => Err(ScratchpadError::Transport("no transport".into())),
                };
                if let Err(e) = sent {
                    warn!(error = %e, "outbound frame not delivered");
                    self.controller.on_send_failed(&frame, &e.to_string());
                }
            }
            Command::FetchRecord { id, generation } => {
                let relay = Arc::clone(&self.relay);
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = relay.fetch_record(&id).await;
                    let _ = tx.send(Internal::Record { generation, result });
                });
            }
            Command::ScheduleReconnect { delay, generation } => {
                self.cancel_reconnect();
                let token = CancellationToken::new();
                let cancelled = token.clone();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancelled.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            let _ = tx.send(Internal::ReconnectDue { generation });
                        }
                    }
                });
                self.reconnect = Some(token);
            }
            Command::CancelReconnect => self.cancel_reconnect(),
        }
    }

    fn cancel_reconnect(&mut self) {
        if let Some(token) = self.reconnect.take() {
            token.cancel();
        }
    }

    fn publish(&self) {
        let next = self.controller.snapshot();
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Log a handler failure. None of them stop the loop.
fn report(result: ScratchpadResult<()>) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_message_local() => warn!(error = %e, "dropped message"),
        Err(e) => error!(error = %e, "session error"),
    }
}
