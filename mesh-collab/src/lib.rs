//! # mesh-collab — Peer-to-peer CRDT replication over a signaling mesh
//!
//! Replicates a CRDT document and ephemeral presence ("awareness") among
//! participants of a named room. Participants find each other through
//! topic-based signaling servers, then talk over direct peer links.
//! Participants in the same process also share a local broadcast channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   announce/signal   ┌──────────────────┐
//! │ Provider A   │ ◄─────────────────► │ SignalingServer  │
//! │  └ Session   │                     │ (topic pub/sub)  │
//! └──────┬───────┘                     └────────▲─────────┘
//!        │ PeerLink (sync + awareness)          │
//!        ▼                                      │
//! ┌──────────────┐ ─────────────────────────────┘
//! │ Provider B   │
//! │  └ Session   │ ◄── BroadcastHub ──► other sessions in-process
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`codec`] — lib0 variable-length integers, strings and `Any` values
//! - [`protocol`] — binary message envelope shared by edges and channels
//! - [`sync`] — state-vector handshake over a [`sync::Document`]
//! - [`awareness`] — clocked presence map with timeout eviction
//! - [`signaling`] — reconnecting control-plane client and link registry
//! - [`server`] — the signaling rendezvous server
//! - [`transport`] / [`peer`] — direct edges and their handshake
//! - [`broadcast`] — process-local named channels with a reentrancy guard
//! - [`crypto`] — passphrase-derived AES-GCM payload encryption
//! - [`session`] / [`provider`] — rooms and the application-facing handle

pub mod awareness;
pub mod broadcast;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod events;
pub mod peer;
pub mod protocol;
pub mod provider;
pub mod server;
pub mod session;
pub mod signaling;
pub mod sync;
pub mod transport;

// Re-exports for convenience
pub use awareness::{Awareness, AwarenessChanges, AwarenessEvent, Origin, OUTDATED_TIMEOUT};
pub use broadcast::{BroadcastGuard, BroadcastHub, BroadcastStats, Delivery};
pub use codec::{Any, Decoder, Encoder};
pub use crypto::EncryptionKey;
pub use error::{
    CodecError, CryptoError, MeshError, ProtocolError, Result, SignalingError, SyncError,
    TransportError,
};
pub use events::{EventDispatcher, ListenerId};
pub use peer::{PeerLink, PeerState};
pub use protocol::{Message, MessageType, SyncMessage};
pub use provider::{MeshContext, Provider, ProviderConfig, DEFAULT_SIGNALING_URLS};
pub use server::{ServerConfig, ServerStats, SignalingServer};
pub use session::{MeshEvent, Session, SessionParams, SessionRegistry};
pub use signaling::{
    ConnectionState, ControlMessage, SignalingConfig, SignalingEvent, SignalingLink,
    SignalingRegistry,
};
pub use sync::{Document, YrsDocument};
pub use transport::{MemoryNetwork, Transport, TransportEvent, TransportFactory};
