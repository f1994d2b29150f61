//! Application-facing handle on one replicated room.
//!
//! ```text
//! Provider::new ──► reserve name ──► derive key (blocking pool) ──► open Session
//!                        │                                            │
//!                        └─ SessionExists ◄── name taken              └─ connect if wanted
//! ```
//! The name is claimed synchronously, so a collision fails `new` itself.
//! Everything after that runs on a background task that
//! [`Provider::destroy`] waits for.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::awareness::Awareness;
use crate::broadcast::BroadcastHub;
use crate::crypto::derive_key;
use crate::error::{MeshError, Result};
use crate::session::{MeshEvent, Reservation, Session, SessionParams, SessionRegistry};
use crate::signaling::{SignalingConfig, SignalingLink, SignalingRegistry};
use crate::sync::Document;
use crate::transport::{MemoryNetwork, TransportFactory};

/// Public signaling servers used when none are configured.
pub const DEFAULT_SIGNALING_URLS: &[&str] = &[
    "wss://signaling.yjs.dev",
    "wss://y-webrtc-signaling-eu.herokuapp.com",
    "wss://y-webrtc-signaling-us.herokuapp.com",
];

/// Provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Signaling servers to rendezvous through
    pub signaling_urls: Vec<String>,
    /// Enables end-to-end encryption of signaling and broadcast traffic
    pub passphrase: Option<String>,
    /// Cap on direct edges
    pub max_peer_links: usize,
    /// Skip direct edges to peers already reachable over the broadcast channel
    pub filter_broadcast_peers: bool,
    /// Awareness client id (random when unset)
    pub awareness_client_id: Option<u32>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            signaling_urls: DEFAULT_SIGNALING_URLS.iter().map(|url| url.to_string()).collect(),
            passphrase: None,
            // randomised so that meshes do not all saturate at the same size
            max_peer_links: 20 + rand::thread_rng().gen_range(0..15),
            filter_broadcast_peers: true,
            awareness_client_id: None,
        }
    }
}

/// The registries and transport shared by every provider in one process.
/// Tests build one per case to stay isolated.
#[derive(Clone)]
pub struct MeshContext {
    pub sessions: Arc<SessionRegistry>,
    pub signaling: Arc<SignalingRegistry>,
    pub broadcast: Arc<BroadcastHub>,
    pub transports: Arc<dyn TransportFactory>,
}

impl MeshContext {
    pub fn new(transports: Arc<dyn TransportFactory>) -> Self {
        Self {
            sessions: Arc::new(SessionRegistry::new()),
            signaling: Arc::new(SignalingRegistry::default()),
            broadcast: Arc::new(BroadcastHub::default()),
            transports,
        }
    }

    pub fn with_signaling_config(mut self, config: SignalingConfig) -> Self {
        self.signaling = Arc::new(SignalingRegistry::new(config));
        self
    }
}

impl Default for MeshContext {
    fn default() -> Self {
        Self::new(Arc::new(MemoryNetwork::new()))
    }
}

#[derive(Default)]
struct ProviderState {
    should_connect: bool,
    destroyed: bool,
    session: Option<Arc<Session>>,
    /// Signaling links this provider holds a reference on.
    links: Vec<Arc<SignalingLink>>,
}

struct Shared {
    room_name: String,
    ctx: MeshContext,
    signaling_urls: Vec<String>,
    state: Mutex<ProviderState>,
    /// Flips to true once opening has finished, successfully or not.
    settled: watch::Sender<bool>,
}

impl Shared {
    fn connect_session(&self) {
        let (session, links) = {
            let mut st = self.state.lock();
            let Some(session) = st.session.clone() else { return };
            if st.links.is_empty() {
                st.links = self
                    .signaling_urls
                    .iter()
                    .map(|url| self.ctx.signaling.acquire(url))
                    .collect();
            }
            (session, st.links.clone())
        };
        session.connect(&links);
    }

    fn disconnect_session(&self) {
        let (session, links) = {
            let mut st = self.state.lock();
            (st.session.clone(), std::mem::take(&mut st.links))
        };
        if let Some(session) = session {
            session.disconnect();
        }
        for link in links {
            self.ctx.signaling.release(link.url());
        }
    }
}

pub struct Provider {
    shared: Arc<Shared>,
    doc: Arc<dyn Document>,
    awareness: Arc<Awareness>,
    events: broadcast::Sender<MeshEvent>,
    opening: Mutex<Option<JoinHandle<()>>>,
    sweeper: JoinHandle<()>,
}

impl Provider {
    /// Claim `room_name` and start opening its session in the background.
    /// Must be called inside a tokio runtime.
    ///
    /// Fails with [`MeshError::SessionExists`] when the name is taken in
    /// `ctx`; the existing session is left untouched.
    pub fn new(
        ctx: &MeshContext,
        room_name: &str,
        doc: Arc<dyn Document>,
        config: ProviderConfig,
    ) -> Result<Self> {
        let reservation = ctx.sessions.reserve(room_name)?;

        let client_id = config.awareness_client_id.unwrap_or_else(rand::random);
        let awareness = Arc::new(Awareness::new(client_id));
        let sweeper = awareness.spawn_sweeper();
        let (events, _) = broadcast::channel(256);
        let (settled, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            room_name: room_name.to_string(),
            ctx: ctx.clone(),
            signaling_urls: config.signaling_urls.clone(),
            state: Mutex::new(ProviderState {
                should_connect: true,
                ..ProviderState::default()
            }),
            settled,
        });

        let params = SessionParams {
            doc: doc.clone(),
            awareness: awareness.clone(),
            key: None,
            max_peer_links: config.max_peer_links,
            filter_broadcast_peers: config.filter_broadcast_peers,
            events: events.clone(),
        };
        let opening = tokio::spawn(Self::open_session(
            shared.clone(),
            reservation,
            params,
            config.passphrase,
        ));

        Ok(Self {
            shared,
            doc,
            awareness,
            events,
            opening: Mutex::new(Some(opening)),
            sweeper,
        })
    }

    async fn open_session(
        shared: Arc<Shared>,
        reservation: Reservation,
        mut params: SessionParams,
        passphrase: Option<String>,
    ) {
        if let Some(passphrase) = passphrase {
            match derive_key(passphrase, shared.room_name.clone()).await {
                Ok(key) => params.key = Some(key),
                Err(e) => {
                    log::error!("Cannot derive key for room {}: {e}", shared.room_name);
                    shared.settled.send_replace(true);
                    return;
                }
            }
        }

        let session = Session::open_reserved(&shared.ctx, reservation, params);
        let connect = {
            let mut st = shared.state.lock();
            if st.destroyed {
                None
            } else {
                st.session = Some(session.clone());
                Some(st.should_connect)
            }
        };
        match connect {
            None => session.destroy(),
            Some(true) => shared.connect_session(),
            Some(false) => {}
        }
        shared.settled.send_replace(true);
    }

    pub fn room_name(&self) -> &str {
        &self.shared.room_name
    }

    pub fn doc(&self) -> &Arc<dyn Document> {
        &self.doc
    }

    pub fn awareness(&self) -> &Arc<Awareness> {
        &self.awareness
    }

    /// The open session, once key derivation has finished.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.shared.state.lock().session.clone()
    }

    /// Wait until opening has finished and return the session.
    pub async fn ready(&self) -> Result<Arc<Session>> {
        let mut settled = self.shared.settled.subscribe();
        // The sender lives in `shared`, so this only fails if it is dropped.
        settled
            .wait_for(|done| *done)
            .await
            .map_err(|_| MeshError::NotReady)?;
        self.session().ok_or(MeshError::NotReady)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Session exists and the provider intends to stay connected.
    pub fn connected(&self) -> bool {
        let st = self.shared.state.lock();
        st.session.is_some() && st.should_connect
    }

    pub fn synced(&self) -> bool {
        self.session().is_some_and(|session| session.synced())
    }

    pub fn connect(&self) {
        {
            let mut st = self.shared.state.lock();
            if st.destroyed {
                return;
            }
            st.should_connect = true;
        }
        self.shared.connect_session();
    }

    pub fn disconnect(&self) {
        self.shared.state.lock().should_connect = false;
        self.shared.disconnect_session();
    }

    /// Wait for opening to settle, then tear the session down and free
    /// its name.
    pub async fn destroy(&self) {
        {
            let mut st = self.shared.state.lock();
            if st.destroyed {
                return;
            }
            st.destroyed = true;
            st.should_connect = false;
        }
        let opening = self.opening.lock().take();
        if let Some(opening) = opening {
            if let Err(e) = opening.await {
                log::error!("Opening room {} failed: {e}", self.shared.room_name);
            }
        }
        self.shared.disconnect_session();
        let session = self.shared.state.lock().session.take();
        if let Some(session) = session {
            session.destroy();
        }
        self.sweeper.abort();
        log::info!("Provider for room {} destroyed", self.shared.room_name);
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}
