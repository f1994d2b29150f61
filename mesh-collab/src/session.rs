//! A mesh room: every edge and channel one document is replicated over.
//!
//! ```text
//!                    ┌──────────────── Session "docA" ────────────────┐
//! SignalingLink ───► │ announce / signal ──► PeerLink ◄─► Transport   │
//! SignalingLink ───► │                      PeerLink ◄─► Transport    │
//!                    │ BroadcastGuard ──► BroadcastMember (hub)       │
//!                    │ Document updates ─┐                            │
//!                    │ Awareness updates ┴──► every edge + channel    │
//!                    └────────────────────────────────────────────────┘
//! ```
//!
//! Locking: the session lock guards bookkeeping only. It is never held
//! while calling into the document, awareness, a transport or a
//! signaling link.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::awareness::{Awareness, Origin};
use crate::broadcast::{BroadcastGuard, BroadcastHub, BroadcastMember, Delivery};
use crate::crypto::EncryptionKey;
use crate::error::{MeshError, Result};
use crate::events::ListenerId;
use crate::peer::{PeerHost, PeerLink};
use crate::protocol::Message;
use crate::provider::MeshContext;
use crate::signaling::{SignalingHandler, SignalingLink};
use crate::sync::{read_sync_message, state_vector_request, update_reply, Document};
use crate::transport::TransportFactory;

/// Default cap on direct edges per session.
pub const DEFAULT_MAX_PEER_LINKS: usize = 20;

/// Notifications emitted by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// The aggregate synced flag flipped.
    Synced { synced: bool },
    /// The edge set or the broadcast peer set changed.
    Peers {
        added: Vec<String>,
        removed: Vec<String>,
        peer_links: Vec<String>,
        broadcast_peers: Vec<String>,
    },
}

/// Where an inbound message came from.
#[derive(Debug, Clone, Copy)]
pub enum MessageOrigin<'a> {
    Peer(&'a Arc<PeerLink>),
    Broadcast,
}

impl MessageOrigin<'_> {
    fn name(&self) -> &str {
        match self {
            MessageOrigin::Peer(link) => link.remote_peer_id(),
            MessageOrigin::Broadcast => "broadcast",
        }
    }
}

/// Everything a session needs besides its name and context.
pub struct SessionParams {
    pub doc: Arc<dyn Document>,
    pub awareness: Arc<Awareness>,
    pub key: Option<EncryptionKey>,
    pub max_peer_links: usize,
    pub filter_broadcast_peers: bool,
    pub events: broadcast::Sender<MeshEvent>,
}

impl SessionParams {
    pub fn new(doc: Arc<dyn Document>, awareness: Arc<Awareness>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            doc,
            awareness,
            key: None,
            max_peer_links: DEFAULT_MAX_PEER_LINKS,
            filter_broadcast_peers: true,
            events,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

enum Slot {
    Reserved,
    Open(Weak<Session>),
}

/// Names of the sessions open in one context. A name maps to at most one
/// live session.
#[derive(Default)]
pub struct SessionRegistry {
    slots: Mutex<HashMap<String, Slot>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name` ahead of opening a session under it.
    pub fn reserve(self: &Arc<Self>, name: &str) -> Result<Reservation> {
        let mut slots = self.slots.lock();
        let taken = match slots.get(name) {
            Some(Slot::Reserved) => true,
            Some(Slot::Open(session)) => session.strong_count() > 0,
            None => false,
        };
        if taken {
            return Err(MeshError::SessionExists(name.to_string()));
        }
        slots.insert(name.to_string(), Slot::Reserved);
        Ok(Reservation {
            registry: self.clone(),
            name: name.to_string(),
            filled: false,
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<Session>> {
        match self.slots.lock().get(name) {
            Some(Slot::Open(session)) => session.upgrade(),
            _ => None,
        }
    }

    /// Whether `name` is reserved or open.
    pub fn contains(&self, name: &str) -> bool {
        match self.slots.lock().get(name) {
            Some(Slot::Reserved) => true,
            Some(Slot::Open(session)) => session.strong_count() > 0,
            None => false,
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.slots.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    fn fill(&self, name: &str, session: &Arc<Session>) {
        self.slots
            .lock()
            .insert(name.to_string(), Slot::Open(Arc::downgrade(session)));
    }

    fn remove_session(&self, name: &str, session: &Session) -> bool {
        let mut slots = self.slots.lock();
        let ours = matches!(
            slots.get(name),
            Some(Slot::Open(open)) if std::ptr::eq(open.as_ptr(), session)
        );
        if ours {
            slots.remove(name);
        }
        ours
    }

    fn cancel(&self, name: &str) {
        let mut slots = self.slots.lock();
        if matches!(slots.get(name), Some(Slot::Reserved)) {
            slots.remove(name);
        }
    }
}

/// A claimed session name. Dropping it unused frees the name again.
pub struct Reservation {
    registry: Arc<SessionRegistry>,
    name: String,
    filled: bool,
}

impl Reservation {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.filled {
            self.registry.cancel(&self.name);
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Session
// ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct SessionState {
    connected: bool,
    destroyed: bool,
    synced: bool,
    links: HashMap<String, Arc<PeerLink>>,
    broadcast_peers: BTreeSet<String>,
    signaling: Vec<Arc<SignalingLink>>,
    member: Option<BroadcastMember>,
    tasks: Vec<JoinHandle<()>>,
    awareness_listener: Option<ListenerId>,
}

pub struct Session {
    name: String,
    peer_id: String,
    doc: Arc<dyn Document>,
    awareness: Arc<Awareness>,
    key: Option<EncryptionKey>,
    max_peer_links: usize,
    filter_broadcast_peers: bool,
    registry: Arc<SessionRegistry>,
    hub: Arc<BroadcastHub>,
    transports: Arc<dyn TransportFactory>,
    events: broadcast::Sender<MeshEvent>,
    guard: Arc<BroadcastGuard>,
    state: Mutex<SessionState>,
    this: Weak<Session>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Reserve `name` in the context's registry and open a session under it.
    pub fn open(ctx: &MeshContext, name: &str, params: SessionParams) -> Result<Arc<Self>> {
        let reservation = ctx.sessions.reserve(name)?;
        Ok(Self::open_reserved(ctx, reservation, params))
    }

    /// Open a session under an already reserved name.
    pub fn open_reserved(
        ctx: &MeshContext,
        mut reservation: Reservation,
        params: SessionParams,
    ) -> Arc<Self> {
        let session = Arc::new_cyclic(|this| Self {
            name: reservation.name.clone(),
            peer_id: uuid::Uuid::new_v4().to_string(),
            doc: params.doc,
            awareness: params.awareness,
            key: params.key,
            max_peer_links: params.max_peer_links,
            filter_broadcast_peers: params.filter_broadcast_peers,
            registry: reservation.registry.clone(),
            hub: ctx.broadcast.clone(),
            transports: ctx.transports.clone(),
            events: params.events,
            guard: Arc::new(BroadcastGuard::new()),
            state: Mutex::new(SessionState::default()),
            this: this.clone(),
        });
        reservation.registry.fill(&reservation.name, &session);
        reservation.filled = true;
        log::info!("Opened room {} as peer {}", session.name, session.peer_id);
        session
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn doc(&self) -> &Arc<dyn Document> {
        &self.doc
    }

    pub fn awareness(&self) -> &Arc<Awareness> {
        &self.awareness
    }

    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// True when every edge has completed a sync round.
    pub fn synced(&self) -> bool {
        self.state.lock().synced
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub fn peer_links(&self) -> Vec<Arc<PeerLink>> {
        self.state.lock().links.values().cloned().collect()
    }

    pub fn peer_link_ids(&self) -> Vec<String> {
        self.state.lock().links.keys().cloned().collect()
    }

    pub fn broadcast_peers(&self) -> Vec<String> {
        self.state.lock().broadcast_peers.iter().cloned().collect()
    }

    /// Start replicating over `signaling` and the local broadcast channel.
    /// Calling again while connected only attaches links not seen before.
    pub fn connect(&self, signaling: &[Arc<SignalingLink>]) {
        let handler: Weak<dyn SignalingHandler> = self.this.clone();
        let first = {
            let mut st = self.state.lock();
            if st.destroyed {
                return;
            }
            let first = !st.connected;
            st.connected = true;
            for link in signaling {
                if !st.signaling.iter().any(|known| Arc::ptr_eq(known, link)) {
                    st.signaling.push(link.clone());
                }
            }
            first
        };
        for link in signaling {
            link.attach(&self.name, handler.clone());
        }
        if !first {
            self.announce_signaling_info();
            return;
        }
        log::info!("Connecting room {}", self.name);

        let doc_task = self.spawn_doc_forwarder();
        let weak = self.this.clone();
        let listener = self.awareness.on_update(move |changes, _origin| {
            if let Some(session) = weak.upgrade() {
                let update = session.awareness.encode_update(&changes.all());
                session.broadcast_room_message(&Message::awareness(update));
            }
        });
        {
            let mut st = self.state.lock();
            st.tasks.push(doc_task);
            st.awareness_listener = Some(listener);
        }

        self.announce_signaling_info();

        let (member, mut receiver) = self.hub.join(&self.name);
        self.state.lock().member = Some(member);
        let weak = self.this.clone();
        let bc_task = tokio::spawn(async move {
            while let Some(delivery) = receiver.recv().await {
                let Some(session) = weak.upgrade() else { break };
                match delivery {
                    Delivery::Frame(payload) => session.receive_broadcast(payload),
                    Delivery::Lagged(skipped) => {
                        log::warn!(
                            "Room {}: missed {skipped} broadcast frames, resyncing",
                            session.name
                        );
                        session.sync_broadcast_channel();
                    }
                }
            }
        });
        self.state.lock().tasks.push(bc_task);

        self.broadcast_bc_peer_id();
        self.sync_broadcast_channel();
    }

    /// Full sync with same-process peers: ask for what we lack, offer
    /// everything we have, and exchange presence.
    fn sync_broadcast_channel(&self) {
        self.broadcast_bc_message(&state_vector_request(&*self.doc));
        match update_reply(&*self.doc, &[]) {
            Ok(reply) => self.broadcast_bc_message(&reply),
            Err(e) => log::error!("Cannot encode document for room {}: {e}", self.name),
        }
        self.broadcast_bc_message(&Message::QueryAwareness);
        let local = self.awareness.encode_update(&[self.awareness.client_id()]);
        self.broadcast_bc_message(&Message::awareness(local));
    }

    /// Leave every signaling topic, edge and channel. The session can be
    /// connected again afterwards.
    pub fn disconnect(&self) {
        let signaling = {
            let mut st = self.state.lock();
            if !st.connected {
                return;
            }
            st.connected = false;
            std::mem::take(&mut st.signaling)
        };
        log::info!("Disconnecting room {}", self.name);
        for link in &signaling {
            link.detach(&self.name);
        }

        self.awareness
            .remove_states(&[self.awareness.client_id()], Origin::Disconnect);
        self.broadcast_bc_message(&Message::peer_id(false, &self.peer_id));

        let (member, tasks, listener, links) = {
            let mut st = self.state.lock();
            st.broadcast_peers.clear();
            (
                st.member.take(),
                std::mem::take(&mut st.tasks),
                st.awareness_listener.take(),
                std::mem::take(&mut st.links),
            )
        };
        for task in tasks {
            task.abort();
        }
        if let Some(listener) = listener {
            self.awareness.off(listener);
        }
        // the channel closes once the aborted receive task drops its receiver
        drop(member);

        if !links.is_empty() {
            let removed: Vec<String> = links.keys().cloned().collect();
            for link in links.values() {
                link.destroy();
            }
            self.emit_peers(Vec::new(), removed);
        }
        self.check_is_synced();
    }

    /// Disconnect and release the name.
    pub fn destroy(&self) {
        self.disconnect();
        self.state.lock().destroyed = true;
        self.registry.remove_session(&self.name, self);
        log::info!("Destroyed room {}", self.name);
    }

    /// Handle one decoded message. The reply, if any, belongs on the edge
    /// or channel the message came from.
    pub fn read_message(&self, message: Message, origin: MessageOrigin<'_>) -> Option<Message> {
        let from = origin.name();
        match message {
            Message::Sync(sync) => {
                let handled = read_sync_message(&*self.doc, sync, from);
                if handled.completed_round {
                    if let MessageOrigin::Peer(link) = origin {
                        if !link.is_synced() {
                            link.mark_synced();
                            log::debug!("Room {}: edge to {from} synced", self.name);
                            self.check_is_synced();
                        }
                    }
                }
                handled.reply.map(Message::Sync)
            }
            Message::QueryAwareness => Some(Message::awareness(self.awareness.encode_full_update())),
            Message::Awareness(update) => {
                if let Err(e) = self.awareness.apply_update(&update, Origin::Remote(from.to_string())) {
                    log::warn!("Room {}: bad awareness update from {from}: {e}", self.name);
                }
                None
            }
            Message::PeerIdAnnounce { add, peer_id } => {
                self.handle_broadcast_peer(add, peer_id);
                None
            }
        }
    }

    /// Send to the broadcast channel and every connected edge.
    pub fn broadcast_room_message(&self, message: &Message) {
        self.broadcast_bc_message(message);
        let bytes = message.encode();
        for link in self.peer_links() {
            if link.is_connected() {
                link.send_bytes(&bytes);
            }
        }
    }

    fn broadcast_bc_message(&self, message: &Message) {
        let Some(member) = self.state.lock().member.clone() else { return };
        let payload = match &self.key {
            Some(key) => match key.encrypt(&message.encode()) {
                Ok(sealed) => sealed,
                Err(e) => {
                    log::error!("Room {}: cannot encrypt broadcast message: {e}", self.name);
                    return;
                }
            },
            None => message.encode(),
        };
        self.guard.run(move || {
            member.publish(payload);
        });
    }

    fn broadcast_bc_peer_id(&self) {
        if self.filter_broadcast_peers {
            self.broadcast_bc_message(&Message::peer_id(true, &self.peer_id));
        }
    }

    fn receive_broadcast(self: Arc<Self>, payload: Arc<Vec<u8>>) {
        let session = self.clone();
        self.guard.run(move || {
            let plaintext = match &session.key {
                Some(key) => match key.decrypt(&payload) {
                    Ok(plaintext) => plaintext,
                    Err(e) => {
                        log::warn!("Room {}: dropping broadcast message: {e}", session.name);
                        return;
                    }
                },
                None => payload.to_vec(),
            };
            match Message::decode(&plaintext) {
                Ok(message) => {
                    if let Some(reply) = session.read_message(message, MessageOrigin::Broadcast) {
                        session.broadcast_bc_message(&reply);
                    }
                }
                Err(e) => log::warn!("Room {}: malformed broadcast message: {e}", session.name),
            }
        });
    }

    fn handle_broadcast_peer(&self, add: bool, peer_id: String) {
        if peer_id == self.peer_id {
            return;
        }
        let changed = {
            let mut st = self.state.lock();
            if add {
                st.broadcast_peers.insert(peer_id.clone())
            } else {
                st.broadcast_peers.remove(&peer_id)
            }
        };
        if !changed {
            return;
        }
        log::debug!(
            "Room {}: broadcast peer {peer_id} {}",
            self.name,
            if add { "joined" } else { "left" }
        );
        if add {
            self.emit_peers(vec![peer_id], Vec::new());
        } else {
            self.emit_peers(Vec::new(), vec![peer_id]);
        }
        self.broadcast_bc_peer_id();
    }

    fn spawn_doc_forwarder(&self) -> JoinHandle<()> {
        let mut updates = self.doc.subscribe();
        let weak = self.this.clone();
        tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                let Some(session) = weak.upgrade() else { break };
                session.broadcast_room_message(&Message::update(update));
            }
        })
    }

    fn emit_peers(&self, added: Vec<String>, removed: Vec<String>) {
        let (peer_links, broadcast_peers) = {
            let st = self.state.lock();
            (
                st.links.keys().cloned().collect(),
                st.broadcast_peers.iter().cloned().collect(),
            )
        };
        // No subscribers is fine.
        let _ = self.events.send(MeshEvent::Peers {
            added,
            removed,
            peer_links,
            broadcast_peers,
        });
    }

    fn check_is_synced(&self) {
        let flipped = {
            let mut st = self.state.lock();
            let synced = st.links.values().all(|link| link.is_synced());
            if synced == st.synced {
                None
            } else {
                st.synced = synced;
                Some(synced)
            }
        };
        if let Some(synced) = flipped {
            log::info!("Room {} synced: {synced}", self.name);
            let _ = self.events.send(MeshEvent::Synced { synced });
        }
    }

    // ── Signaling ───────────────────────────────────────────────────

    /// Subscribe on every connected link and, below the edge cap, announce.
    fn announce_signaling_info(&self) {
        let (links, edges) = {
            let st = self.state.lock();
            if !st.connected {
                return;
            }
            (st.signaling.clone(), st.links.len())
        };
        for link in links.iter().filter(|link| link.is_connected()) {
            link.subscribe(vec![self.name.clone()]);
            if edges < self.max_peer_links {
                self.publish_signaling(link, self.announce_record());
            }
        }
    }

    fn announce_record(&self) -> Value {
        json!({ "type": "announce", "from": self.peer_id })
    }

    fn publish_signaling(&self, link: &SignalingLink, record: Value) {
        let data = match &self.key {
            Some(key) => match key.seal_json(&record) {
                Ok(sealed) => Value::String(sealed),
                Err(e) => {
                    log::error!("Room {}: cannot encrypt signaling record: {e}", self.name);
                    return;
                }
            },
            None => record,
        };
        link.publish(&self.name, data);
    }

    fn handle_signaling_record(&self, signaling: &Arc<SignalingLink>, record: &Value) {
        let Some(from) = record.get("from").and_then(Value::as_str) else { return };
        let to = record.get("to").and_then(Value::as_str);
        if from == self.peer_id || to.is_some_and(|to| to != self.peer_id) {
            return;
        }
        {
            let st = self.state.lock();
            if !st.connected || st.broadcast_peers.contains(from) {
                return;
            }
        }

        match record.get("type").and_then(Value::as_str) {
            Some("announce") => {
                if self.state.lock().links.len() < self.max_peer_links {
                    let (_, created) = self.get_or_create_link(signaling, from, true);
                    if created {
                        self.emit_peers(vec![from.to_string()], Vec::new());
                    }
                }
            }
            Some("signal") if to.is_some() => {
                let (link, created) = self.get_or_create_link(signaling, from, false);
                if let Some(signal) = record.get("signal") {
                    link.signal(signal.clone());
                }
                if created {
                    self.emit_peers(vec![from.to_string()], Vec::new());
                }
            }
            other => log::debug!("Room {}: ignoring signaling record {other:?}", self.name),
        }
    }

    fn get_or_create_link(
        &self,
        signaling: &Arc<SignalingLink>,
        remote: &str,
        initiator: bool,
    ) -> (Arc<PeerLink>, bool) {
        let (link, events) = {
            let mut st = self.state.lock();
            if let Some(existing) = st.links.get(remote) {
                return (existing.clone(), false);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let transport = self.transports.create(initiator, tx);
            let link = PeerLink::new(remote, initiator, transport, Arc::downgrade(signaling));
            st.links.insert(remote.to_string(), link.clone());
            (link, rx)
        };
        log::info!(
            "Room {}: new {} edge to {remote}",
            self.name,
            if initiator { "outgoing" } else { "incoming" }
        );
        let host: Weak<dyn PeerHost> = self.this.clone();
        link.spawn_pump(events, host);
        self.check_is_synced();
        (link, true)
    }
}

impl SignalingHandler for Session {
    fn on_connect(&self, link: &Arc<SignalingLink>) {
        if self.is_connected() {
            self.publish_signaling(link, self.announce_record());
        }
    }

    fn on_publish(&self, link: &Arc<SignalingLink>, data: &Value) {
        match &self.key {
            Some(key) => {
                // Encrypted rooms only ever publish strings.
                let Some(sealed) = data.as_str() else { return };
                match key.open_json(sealed) {
                    Ok(record) => self.handle_signaling_record(link, &record),
                    Err(e) => log::warn!("Room {}: cannot open signaling record: {e}", self.name),
                }
            }
            None => self.handle_signaling_record(link, data),
        }
    }
}

impl PeerHost for Session {
    fn greeting(&self) -> Vec<Message> {
        let mut messages = vec![state_vector_request(&*self.doc)];
        if !self.awareness.states().is_empty() {
            messages.push(Message::awareness(self.awareness.encode_full_update()));
        }
        messages
    }

    fn handle_message(&self, link: &Arc<PeerLink>, message: Message) -> Option<Message> {
        self.read_message(message, MessageOrigin::Peer(link))
    }

    fn forward_signal(&self, link: &Arc<PeerLink>, signal: Value) {
        let Some(signaling) = link.signaling() else {
            log::debug!("Room {}: no signaling link left for {}", self.name, link.remote_peer_id());
            return;
        };
        let record = json!({
            "type": "signal",
            "from": self.peer_id,
            "to": link.remote_peer_id(),
            "signal": signal,
        });
        self.publish_signaling(&signaling, record);
    }

    fn link_closed(&self, link: &Arc<PeerLink>) {
        let id = link.remote_peer_id().to_string();
        let removed = {
            let mut st = self.state.lock();
            match st.links.get(&id) {
                Some(current) if Arc::ptr_eq(current, link) => {
                    st.links.remove(&id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.emit_peers(Vec::new(), vec![id]);
        }
        self.check_is_synced();
        self.announce_signaling_info();
    }

    fn link_error(&self, link: &Arc<PeerLink>, error: &str) {
        log::debug!("Room {}: dropping edge to {} after error: {error}", self.name, link.remote_peer_id());
        self.link_closed(link);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let (tasks, listener) = {
            let st = self.state.get_mut();
            (std::mem::take(&mut st.tasks), st.awareness_listener.take())
        };
        for task in tasks {
            task.abort();
        }
        if let Some(listener) = listener {
            self.awareness.off(listener);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::YrsDocument;
    use crate::transport::TransportEvent;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn params() -> (Arc<YrsDocument>, SessionParams) {
        let doc = Arc::new(YrsDocument::new().unwrap());
        let awareness = Arc::new(Awareness::new(rand::random()));
        let shared: Arc<dyn Document> = doc.clone();
        (doc, SessionParams::new(shared, awareness))
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    /// A second context sharing only the broadcast hub with `ctx`.
    fn sibling(ctx: &MeshContext) -> MeshContext {
        MeshContext {
            broadcast: ctx.broadcast.clone(),
            ..MeshContext::default()
        }
    }

    #[test]
    fn test_session_name_uniqueness() {
        let ctx = MeshContext::default();
        let first = Session::open(&ctx, "docA", params().1).unwrap();

        let err = Session::open(&ctx, "docA", params().1).unwrap_err();
        assert!(matches!(err, MeshError::SessionExists(ref name) if name == "docA"));
        assert!(Arc::ptr_eq(&ctx.sessions.get("docA").unwrap(), &first));
        assert!(!first.is_destroyed());

        first.destroy();
        assert!(!ctx.sessions.contains("docA"));
        assert!(Session::open(&ctx, "docA", params().1).is_ok());
    }

    #[test]
    fn test_unused_reservation_frees_name() {
        let ctx = MeshContext::default();
        let reservation = ctx.sessions.reserve("docA").unwrap();
        assert!(matches!(ctx.sessions.reserve("docA"), Err(MeshError::SessionExists(_))));
        drop(reservation);
        assert!(ctx.sessions.reserve("docA").is_ok());
    }

    #[test]
    fn test_dropped_session_frees_name() {
        let ctx = MeshContext::default();
        drop(Session::open(&ctx, "docA", params().1).unwrap());
        assert!(ctx.sessions.get("docA").is_none());
        assert!(Session::open(&ctx, "docA", params().1).is_ok());
    }

    #[test]
    fn test_state_vector_request_answered() {
        let ctx = MeshContext::default();
        let (doc, params) = params();
        doc.insert_text("t", 0, "hello");
        let session = Session::open(&ctx, "docA", params).unwrap();

        let other = YrsDocument::new().unwrap();
        let request = state_vector_request(&other);
        let reply = session.read_message(request, MessageOrigin::Broadcast).unwrap();
        let Message::Sync(sync) = reply else { panic!("expected sync reply") };
        assert!(read_sync_message(&other, sync, "session").completed_round);
        assert_eq!(other.text("t"), "hello");
    }

    #[test]
    fn test_query_awareness_answered_with_snapshot() {
        let ctx = MeshContext::default();
        let session = Session::open(&ctx, "docA", params().1).unwrap();
        session.awareness().set_local_state_field("name", "alice");

        let reply = session.read_message(Message::QueryAwareness, MessageOrigin::Broadcast).unwrap();
        let Message::Awareness(update) = reply else { panic!("expected awareness") };
        let entries = Awareness::decode_update(&update).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].client_id, session.awareness().client_id());
    }

    #[test]
    fn test_broadcast_peer_announce_tracks_set() {
        let ctx = MeshContext::default();
        let session = Session::open(&ctx, "docA", params().1).unwrap();
        let mut events = session.subscribe_events();

        session.read_message(Message::peer_id(true, "other"), MessageOrigin::Broadcast);
        assert_eq!(session.broadcast_peers(), vec!["other".to_string()]);
        match events.try_recv().unwrap() {
            MeshEvent::Peers { added, broadcast_peers, .. } => {
                assert_eq!(added, vec!["other".to_string()]);
                assert_eq!(broadcast_peers, vec!["other".to_string()]);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // repeated adds and our own id change nothing
        session.read_message(Message::peer_id(true, "other"), MessageOrigin::Broadcast);
        let own = session.peer_id().to_string();
        session.read_message(Message::peer_id(true, own), MessageOrigin::Broadcast);
        assert!(events.try_recv().is_err());

        session.read_message(Message::peer_id(false, "other"), MessageOrigin::Broadcast);
        assert!(session.broadcast_peers().is_empty());
        assert!(matches!(events.try_recv().unwrap(), MeshEvent::Peers { removed, .. } if removed == vec!["other".to_string()]));
    }

    #[test]
    fn test_malformed_sync_leaves_session_usable() {
        let ctx = MeshContext::default();
        let (doc, params) = params();
        let session = Session::open(&ctx, "docA", params).unwrap();
        assert!(session
            .read_message(Message::update_reply(vec![0xff, 0xff, 0xff]), MessageOrigin::Broadcast)
            .is_none());
        doc.insert_text("t", 0, "still fine");
        assert_eq!(doc.text("t"), "still fine");
    }

    #[tokio::test]
    async fn test_broadcast_channel_replication() {
        let ctx_a = MeshContext::default();
        let ctx_b = sibling(&ctx_a);
        let (doc_a, params_a) = params();
        let (doc_b, params_b) = params();
        doc_a.insert_text("t", 0, "before");

        let a = Session::open(&ctx_a, "docA", params_a).unwrap();
        let b = Session::open(&ctx_b, "docA", params_b).unwrap();
        a.connect(&[]);
        b.connect(&[]);

        eventually(|| doc_b.text("t") == "before").await;
        doc_a.insert_text("t", 6, " after");
        eventually(|| doc_b.text("t") == "before after").await;

        // filtered peers learn each other's ids
        eventually(|| a.broadcast_peers() == vec![b.peer_id().to_string()]).await;
        eventually(|| b.broadcast_peers() == vec![a.peer_id().to_string()]).await;

        // and awareness crosses the channel
        let b_id = b.awareness().client_id();
        eventually(|| a.awareness().state(b_id).is_some()).await;

        b.disconnect();
        eventually(|| a.awareness().state(b_id).is_none()).await;
        eventually(|| a.broadcast_peers().is_empty()).await;
    }

    #[tokio::test]
    async fn test_encrypted_broadcast_channel_replication() {
        let ctx_a = MeshContext::default();
        let ctx_b = sibling(&ctx_a);
        let key = EncryptionKey::from_bytes(&[9u8; 32]);
        let (doc_a, mut params_a) = params();
        let (doc_b, mut params_b) = params();
        params_a.key = Some(key.clone());
        params_b.key = Some(key);

        let a = Session::open(&ctx_a, "docA", params_a).unwrap();
        let b = Session::open(&ctx_b, "docA", params_b).unwrap();
        assert!(a.is_encrypted());
        a.connect(&[]);
        b.connect(&[]);
        doc_a.insert_text("t", 0, "sealed");
        eventually(|| doc_b.text("t") == "sealed").await;
    }

    #[tokio::test]
    async fn test_nested_broadcast_is_deferred() {
        let ctx = MeshContext::default();
        let session = Session::open(&ctx, "docA", params().1).unwrap();
        session.connect(&[]);
        let (_observer, mut frames) = ctx.broadcast.join("docA");

        let pending_inside = Arc::new(AtomicUsize::new(usize::MAX));
        let seen = pending_inside.clone();
        let s = session.clone();
        session.guard.run(move || {
            s.broadcast_bc_message(&Message::QueryAwareness);
            seen.store(s.guard.pending_count(), Ordering::SeqCst);
        });

        assert_eq!(pending_inside.load(Ordering::SeqCst), 1);
        assert_eq!(session.guard.pending_count(), 0);
        let Some(Delivery::Frame(frame)) = frames.try_recv() else {
            panic!("expected a frame");
        };
        assert_eq!(Message::decode(&frame).unwrap(), Message::QueryAwareness);
    }

    #[tokio::test]
    async fn test_lagged_member_resyncs_over_channel() {
        let ctx_a = MeshContext {
            broadcast: Arc::new(BroadcastHub::new(16)),
            ..MeshContext::default()
        };
        let ctx_b = sibling(&ctx_a);
        let (doc_a, params_a) = params();
        let (doc_b, params_b) = params();
        let a = Session::open(&ctx_a, "docA", params_a).unwrap();
        let b = Session::open(&ctx_b, "docA", params_b).unwrap();
        a.connect(&[]);
        b.connect(&[]);

        // many more updates than the channel buffers, with no chance to drain
        for i in 0..600u32 {
            doc_a.insert_text("t", i, "x");
        }

        eventually(|| doc_b.text("t").len() == 600).await;
        assert_eq!(doc_a.text("t"), doc_b.text("t"));
        let channel = ctx_a.broadcast.channel("docA").unwrap();
        assert!(channel.stats().messages_dropped > 0);
    }

    #[tokio::test]
    async fn test_transport_error_removes_edge() {
        let ctx = MeshContext::default();
        let session = Session::open(&ctx, "docA", params().1).unwrap();
        session.connect(&[]);
        let mut events = session.subscribe_events();

        let (tx, rx) = mpsc::unbounded_channel();
        let transport = ctx.transports.create(true, tx.clone());
        let link = PeerLink::new("remote", true, transport, Weak::new());
        session.state.lock().links.insert("remote".to_string(), link.clone());
        session.check_is_synced();
        assert!(!session.synced());
        let host: Weak<dyn PeerHost> = session.this.clone();
        link.spawn_pump(rx, host);

        tx.send(TransportEvent::Error("ice failed".into())).unwrap();
        eventually(|| session.peer_link_ids().is_empty()).await;
        assert!(link.is_closed());
        assert!(session.synced());

        let mut removed = Vec::new();
        let mut synced = None;
        while let Ok(event) = events.try_recv() {
            match event {
                MeshEvent::Peers { removed: ids, .. } => removed.extend(ids),
                MeshEvent::Synced { synced: flag } => synced = Some(flag),
            }
        }
        assert_eq!(removed, vec!["remote".to_string()]);
        assert_eq!(synced, Some(true));
    }

    #[tokio::test]
    async fn test_reconnect_cycles_close_broadcast_channel() {
        let ctx = MeshContext::default();
        let session = Session::open(&ctx, "docA", params().1).unwrap();
        for _ in 0..5 {
            session.connect(&[]);
            assert_eq!(ctx.broadcast.channel_count(), 1);
            session.disconnect();
            eventually(|| ctx.broadcast.channel_count() == 0).await;
        }
    }

    #[tokio::test]
    async fn test_disconnect_and_destroy() {
        let ctx = MeshContext::default();
        let session = Session::open(&ctx, "docA", params().1).unwrap();
        session.connect(&[]);
        assert!(session.is_connected());
        assert!(session.awareness().local_state().is_some());

        session.disconnect();
        assert!(!session.is_connected());
        assert!(session.awareness().local_state().is_none());
        // idempotent
        session.disconnect();

        session.destroy();
        assert!(session.is_destroyed());
        assert!(ctx.sessions.get("docA").is_none());
        session.connect(&[]);
        assert!(!session.is_connected());
    }
}
