//! Peer transport capability.
//!
//! A transport is one bidirectional byte pipe to a remote participant,
//! negotiated by exchanging opaque signals through the signaling plane.
//! Transports report progress as [`TransportEvent`]s on a channel handed
//! to them at creation.
//!
//! [`MemoryNetwork`] is the in-process implementation: an initiator
//! publishes an offer naming its endpoint, the acceptor claims it and
//! answers. Claiming happens under the network lock, so two initiators
//! racing to offer each other end up with exactly one pipe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Progress reported by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A negotiation signal to forward to the remote side.
    Signal(Value),
    Connect,
    Data(Vec<u8>),
    Close,
    Error(String),
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// One negotiated pipe.
pub trait Transport: Send + Sync {
    fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Feed a signal received from the remote side.
    fn signal(&self, signal: Value) -> Result<(), TransportError>;

    /// Close the pipe. Both sides observe [`TransportEvent::Close`].
    fn destroy(&self);

    fn is_connected(&self) -> bool;
}

/// Creates transports for new edges.
pub trait TransportFactory: Send + Sync {
    fn create(&self, initiator: bool, events: TransportEvents) -> Arc<dyn Transport>;
}

// ───────────────────────────────────────────────────────────────────
// In-process network
// ───────────────────────────────────────────────────────────────────

enum LinkState {
    Idle,
    Connected(Weak<Endpoint>),
    Closed,
}

struct Endpoint {
    id: u64,
    events: TransportEvents,
    link: Mutex<LinkState>,
}

impl Endpoint {
    fn remote(&self) -> Option<Arc<Endpoint>> {
        match &*self.link.lock() {
            LinkState::Connected(remote) => remote.upgrade(),
            _ => None,
        }
    }

    fn emit(&self, event: TransportEvent) {
        // The receiving edge may already be gone.
        let _ = self.events.send(event);
    }
}

#[derive(Default)]
struct NetworkState {
    pending_offers: HashMap<u64, Arc<Endpoint>>,
}

/// A process-local "network" connecting [`MemoryTransport`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
    next_endpoint: Arc<AtomicU64>,
    connections: Arc<AtomicU64>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_offers(&self) -> usize {
        self.state.lock().pending_offers.len()
    }

    /// Pipes established over the lifetime of this network.
    pub fn connections_established(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl TransportFactory for MemoryNetwork {
    fn create(&self, initiator: bool, events: TransportEvents) -> Arc<dyn Transport> {
        let id = self.next_endpoint.fetch_add(1, Ordering::Relaxed) + 1;
        let endpoint = Arc::new(Endpoint {
            id,
            events,
            link: Mutex::new(LinkState::Idle),
        });
        if initiator {
            self.state.lock().pending_offers.insert(id, endpoint.clone());
            endpoint.emit(TransportEvent::Signal(json!({ "type": "offer", "endpoint": id })));
        }
        Arc::new(MemoryTransport { endpoint, network: self.clone() })
    }
}

/// One end of an in-process pipe.
pub struct MemoryTransport {
    endpoint: Arc<Endpoint>,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn endpoint_id(&self) -> u64 {
        self.endpoint.id
    }

    fn accept_offer(&self, offer: u64) -> Result<(), TransportError> {
        let me = &self.endpoint;
        let remote = {
            let mut network = self.network.state.lock();
            if !matches!(*me.link.lock(), LinkState::Idle) {
                return Ok(());
            }
            let remote = network
                .pending_offers
                .remove(&offer)
                .ok_or_else(|| TransportError::Signal(format!("unknown offer {offer}")))?;
            network.pending_offers.remove(&me.id);
            *remote.link.lock() = LinkState::Connected(Arc::downgrade(me));
            *me.link.lock() = LinkState::Connected(Arc::downgrade(&remote));
            remote
        };
        self.network.connections.fetch_add(1, Ordering::Relaxed);

        remote.emit(TransportEvent::Connect);
        me.emit(TransportEvent::Connect);
        me.emit(TransportEvent::Signal(json!({ "type": "answer", "endpoint": me.id })));
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        match &*self.endpoint.link.lock() {
            LinkState::Closed => return Err(TransportError::Closed),
            LinkState::Idle => return Err(TransportError::NotConnected),
            LinkState::Connected(_) => {}
        }
        let remote = self.endpoint.remote().ok_or(TransportError::Closed)?;
        remote
            .events
            .send(TransportEvent::Data(data.to_vec()))
            .map_err(|_| TransportError::Closed)
    }

    fn signal(&self, signal: Value) -> Result<(), TransportError> {
        let kind = signal.get("type").and_then(Value::as_str);
        let endpoint = signal.get("endpoint").and_then(Value::as_u64);
        match (kind, endpoint) {
            (Some("offer"), Some(offer)) => self.accept_offer(offer),
            // The offering side is wired up when its offer is claimed.
            (Some("answer"), Some(_)) => Ok(()),
            _ => Err(TransportError::Signal(signal.to_string())),
        }
    }

    fn destroy(&self) {
        self.network.state.lock().pending_offers.remove(&self.endpoint.id);
        let previous = std::mem::replace(&mut *self.endpoint.link.lock(), LinkState::Closed);
        let remote = match previous {
            LinkState::Closed => return,
            LinkState::Idle => None,
            LinkState::Connected(remote) => remote.upgrade(),
        };
        self.endpoint.emit(TransportEvent::Close);
        if let Some(remote) = remote {
            let was_connected = {
                let mut link = remote.link.lock();
                let connected = matches!(*link, LinkState::Connected(_));
                if connected {
                    *link = LinkState::Closed;
                }
                connected
            };
            if was_connected {
                remote.emit(TransportEvent::Close);
            }
        }
    }

    fn is_connected(&self) -> bool {
        matches!(*self.endpoint.link.lock(), LinkState::Connected(_))
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.state.lock().pending_offers.remove(&self.endpoint.id);
    }
}
