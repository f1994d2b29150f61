//! One direct edge to a remote participant.
//!
//! ```text
//!            signal(offer/answer)          Connect
//! Connecting ─────────────────────► ... ─────────► Connected ──Close/Error──► Closed
//!      │                                                ▲
//!      └──────────────── Close / Error / destroy ───────┴───────────────────► Closed
//! ```
//! Each link owns a pump task that drains its transport's events in order
//! and hands them to the owning [`PeerHost`]. The pump holds the host
//! weakly, so a dropped session simply ends it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::Message;
use crate::signaling::SignalingLink;
use crate::transport::{Transport, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Closed,
}

/// What a link needs from the session that owns it.
pub trait PeerHost: Send + Sync {
    /// Messages to send as soon as the edge connects.
    fn greeting(&self) -> Vec<Message>;

    /// Handle one inbound message; the returned reply goes back on `link`.
    fn handle_message(&self, link: &Arc<PeerLink>, message: Message) -> Option<Message>;

    /// Relay a negotiation signal to the remote side.
    fn forward_signal(&self, link: &Arc<PeerLink>, signal: Value);

    fn link_closed(&self, link: &Arc<PeerLink>);

    /// The transport failed. The link is already closed and its pump stopped.
    fn link_error(&self, link: &Arc<PeerLink>, error: &str);
}

pub struct PeerLink {
    remote_peer_id: String,
    initiator: bool,
    transport: Arc<dyn Transport>,
    /// The signaling link this edge was negotiated through.
    signaling: Weak<SignalingLink>,
    state: Mutex<PeerState>,
    synced: AtomicBool,
}

impl PeerLink {
    pub fn new(
        remote_peer_id: impl Into<String>,
        initiator: bool,
        transport: Arc<dyn Transport>,
        signaling: Weak<SignalingLink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote_peer_id: remote_peer_id.into(),
            initiator,
            transport,
            signaling,
            state: Mutex::new(PeerState::Connecting),
            synced: AtomicBool::new(false),
        })
    }

    pub fn remote_peer_id(&self) -> &str {
        &self.remote_peer_id
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == PeerState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state() == PeerState::Closed
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    pub fn signaling(&self) -> Option<Arc<SignalingLink>> {
        self.signaling.upgrade()
    }

    /// Feed a remote negotiation signal into the transport.
    pub fn signal(&self, signal: Value) {
        if let Err(e) = self.transport.signal(signal) {
            log::warn!("Signal for peer {} rejected: {e}", self.remote_peer_id);
        }
    }

    /// Send one message. Failures are logged; a broken edge reports
    /// itself through its close event.
    pub fn send(&self, message: &Message) -> bool {
        self.send_bytes(&message.encode())
    }

    /// Send an already encoded message.
    pub fn send_bytes(&self, bytes: &[u8]) -> bool {
        match self.transport.send(bytes) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Send to peer {} failed: {e}", self.remote_peer_id);
                false
            }
        }
    }

    pub fn destroy(&self) {
        self.transport.destroy();
    }

    /// Start draining transport events into `host`.
    pub fn spawn_pump(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        host: Weak<dyn PeerHost>,
    ) -> JoinHandle<()> {
        let link = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(host) = host.upgrade() else { break };
                if !link.handle_event(&*host, event) {
                    break;
                }
            }
            *link.state.lock() = PeerState::Closed;
        })
    }

    /// Returns `false` once the edge is finished.
    fn handle_event(self: &Arc<Self>, host: &dyn PeerHost, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Signal(signal) => host.forward_signal(self, signal),
            TransportEvent::Connect => {
                *self.state.lock() = PeerState::Connected;
                log::info!("Connected to peer {}", self.remote_peer_id);
                for message in host.greeting() {
                    self.send(&message);
                }
            }
            TransportEvent::Data(bytes) => match Message::decode(&bytes) {
                Ok(message) => {
                    if let Some(reply) = host.handle_message(self, message) {
                        self.send(&reply);
                    }
                }
                Err(e) => log::warn!("Dropping malformed message from peer {}: {e}", self.remote_peer_id),
            },
            TransportEvent::Close => {
                *self.state.lock() = PeerState::Closed;
                log::info!("Disconnected from peer {}", self.remote_peer_id);
                self.transport.destroy();
                host.link_closed(self);
                return false;
            }
            TransportEvent::Error(error) => {
                *self.state.lock() = PeerState::Closed;
                log::warn!("Transport error with peer {}: {error}", self.remote_peer_id);
                self.transport.destroy();
                host.link_error(self, &error);
                return false;
            }
        }
        true
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("remote_peer_id", &self.remote_peer_id)
            .field("initiator", &self.initiator)
            .field("state", &self.state())
            .field("synced", &self.is_synced())
            .finish()
    }
}
