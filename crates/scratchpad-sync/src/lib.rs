//! scratchpad-sync: key storage, relay protocol, and the session state machine
//!
//! Layers, bottom to top:
//!   - `store` / `keystore`: persisted keypair, per-connection keys, registry
//!   - `protocol`: relay frames and the connection record
//!   - `scratchpad`: the shared document and its flush bookkeeping
//!   - `session`: sans-IO controller (transport lifecycle, handshake, routing)
//!   - `transport` / `relay`: WebSocket and HTTP adapters
//!   - `runtime`: the single loop wiring them together

pub mod backoff;
pub mod keystore;
pub mod protocol;
pub mod relay;
pub mod runtime;
pub mod scratchpad;
pub mod session;
pub mod store;
pub mod transport;

pub use keystore::KeyStore;
pub use protocol::{ConnectionRecord, Envelope, WireMessage};
pub use runtime::{ClientHandle, Request, ScratchpadClient};
pub use session::{Command, SessionController, SessionSettings, Snapshot, Tag};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore};
pub use transport::{Connector, TransportEvent, TransportHandle, WsConnector};
