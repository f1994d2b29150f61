//! Topic-based signaling rendezvous server.
//!
//! Architecture:
//! ```text
//! Peer A ──┐                            ┌──► Peer A
//!           ├── subscribe(room) ── Topic ├──► Peer B
//! Peer B ──┘        publish(room) ──────┘
//! ```
//!
//! The server never looks inside published data: encrypted rooms relay
//! base64 strings, plaintext rooms relay JSON objects. Every subscriber
//! of a topic receives each publish, the sender included, with a
//! `clients` field carrying the current subscriber count.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::signaling::ControlMessage;

type ConnId = u64;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Connections silent for longer than this are dropped
    pub ping_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4444".to_string(),
            ping_timeout_secs: 30,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub relayed_messages: u64,
    pub active_topics: usize,
}

#[derive(Default)]
struct Registry {
    /// topic → subscribed connections
    topics: HashMap<String, HashSet<ConnId>>,
    /// connection → outbound queue
    conns: HashMap<ConnId, mpsc::UnboundedSender<Message>>,
}

impl Registry {
    fn subscribe(&mut self, conn: ConnId, topics: &[String]) {
        for topic in topics {
            self.topics.entry(topic.clone()).or_default().insert(conn);
        }
    }

    fn unsubscribe(&mut self, conn: ConnId, topics: &[String]) {
        for topic in topics {
            if let Some(subs) = self.topics.get_mut(topic) {
                subs.remove(&conn);
                if subs.is_empty() {
                    self.topics.remove(topic);
                }
            }
        }
    }

    fn remove_conn(&mut self, conn: ConnId) {
        self.conns.remove(&conn);
        self.topics.retain(|_, subs| {
            subs.remove(&conn);
            !subs.is_empty()
        });
    }
}

/// The signaling server.
pub struct SignalingServer {
    config: ServerConfig,
    registry: Arc<RwLock<Registry>>,
    stats: Arc<RwLock<ServerStats>>,
    next_conn: AtomicU64,
}

impl SignalingServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: Arc::new(RwLock::new(Registry::default())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            next_conn: AtomicU64::new(1),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Current subscriber count of `topic`.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.registry.read().await.topics.get(topic).map_or(0, HashSet::len)
    }

    /// Bind and serve in the background. Returns the bound address, which
    /// is useful with a `:0` bind address.
    pub async fn listen(self: Arc<Self>) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        log::info!("Signaling server listening on {addr}");
        let handle = tokio::spawn(async move {
            if let Err(e) = self.accept_loop(listener).await {
                log::error!("Signaling server stopped: {e}");
            }
        });
        Ok((addr, handle))
    }

    /// Bind and serve until the listener fails.
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Signaling server listening on {}", self.config.bind_addr);
        self.accept_loop(listener).await
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::debug!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);

        log::info!("WebSocket connection {conn} established from {addr}");

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        self.registry.write().await.conns.insert(conn, tx.clone());
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let ping_timeout = Duration::from_secs(self.config.ping_timeout_secs);
        loop {
            let msg = match tokio::time::timeout(ping_timeout, ws_receiver.next()).await {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(e))) => {
                    log::debug!("WebSocket error from {addr}: {e}");
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    log::info!("Connection {conn} from {addr} timed out");
                    break;
                }
            };
            match msg {
                Message::Text(text) => {
                    self.stats.write().await.total_messages += 1;
                    match ControlMessage::from_json(text.as_str()) {
                        Ok(control) => self.handle_control(conn, &tx, control).await,
                        Err(e) => log::debug!("Ignoring malformed message from {addr}: {e}"),
                    }
                }
                Message::Close(_) => break,
                // Transport-level pings are answered by tungstenite.
                _ => {}
            }
        }

        let active_topics = {
            let mut registry = self.registry.write().await;
            registry.remove_conn(conn);
            registry.topics.len()
        };
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_topics = active_topics;
        }
        drop(tx);
        writer.abort();
        log::info!("Connection {conn} from {addr} closed");
        Ok(())
    }

    async fn handle_control(
        &self,
        conn: ConnId,
        reply: &mpsc::UnboundedSender<Message>,
        control: ControlMessage,
    ) {
        match control {
            ControlMessage::Subscribe { topics } => {
                let active = {
                    let mut registry = self.registry.write().await;
                    registry.subscribe(conn, &topics);
                    registry.topics.len()
                };
                self.stats.write().await.active_topics = active;
            }
            ControlMessage::Unsubscribe { topics } => {
                let active = {
                    let mut registry = self.registry.write().await;
                    registry.unsubscribe(conn, &topics);
                    registry.topics.len()
                };
                self.stats.write().await.active_topics = active;
            }
            ControlMessage::Publish { topic, data, .. } => {
                let receivers: Vec<mpsc::UnboundedSender<Message>> = {
                    let registry = self.registry.read().await;
                    match registry.topics.get(&topic) {
                        Some(subs) => subs
                            .iter()
                            .filter_map(|id| registry.conns.get(id).cloned())
                            .collect(),
                        None => Vec::new(),
                    }
                };
                if receivers.is_empty() {
                    return;
                }
                let relayed = ControlMessage::Publish {
                    topic,
                    data,
                    clients: Some(receivers.len()),
                };
                let text = match relayed.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Cannot encode relayed publish: {e}");
                        return;
                    }
                };
                for receiver in &receivers {
                    let _ = receiver.send(Message::Text(text.clone().into()));
                }
                self.stats.write().await.relayed_messages += receivers.len() as u64;
            }
            ControlMessage::Ping => {
                if let Ok(text) = ControlMessage::Pong.to_json() {
                    let _ = reply.send(Message::Text(text.into()));
                }
            }
            ControlMessage::Pong => {}
        }
    }
}
