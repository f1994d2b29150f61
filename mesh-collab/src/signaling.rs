//! Reconnecting control-plane link to one signaling server.
//!
//! The link speaks JSON over WebSocket:
//! ```text
//! {"type":"subscribe","topics":[..]}     {"type":"unsubscribe","topics":[..]}
//! {"type":"publish","topic":..,"data":..} {"type":"ping"} / {"type":"pong"}
//! ```
//!
//! State machine:
//! ```text
//! Disconnected ──spawn/retry──► Connecting ──open──► Connected
//!      ▲                            │                    │
//!      └──── backoff ◄── fail ──────┘◄── close/silence ──┘
//! ```
//! Backoff is `min(log10(failures + 1) × base, cap)`, so the first retry
//! after a dropped connection is immediate. While connected the link pings
//! every half `message_timeout` and drops the socket once nothing at all
//! has arrived for a full `message_timeout`.
//!
//! Links are shared per URL through [`SignalingRegistry`] and reference
//! counted by the providers using them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::SignalingError;

/// Control-plane record exchanged with the signaling server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Subscribe {
        #[serde(default)]
        topics: Vec<String>,
    },
    Unsubscribe {
        #[serde(default)]
        topics: Vec<String>,
    },
    Publish {
        topic: String,
        #[serde(default)]
        data: Value,
        /// Subscriber count, added by the server on relay.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        clients: Option<usize>,
    },
    Ping,
    Pong,
}

impl ControlMessage {
    pub fn publish(topic: impl Into<String>, data: Value) -> Self {
        ControlMessage::Publish { topic: topic.into(), data, clients: None }
    }

    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Json(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|e| SignalingError::Json(e.to_string()))
    }
}

/// Reconnect and keepalive tuning.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    pub message_timeout: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_millis(1200),
            reconnect_cap: Duration::from_millis(2500),
            message_timeout: Duration::from_secs(30),
        }
    }
}

impl SignalingConfig {
    /// Delay before the next connection attempt.
    pub fn reconnect_delay(&self, unsuccessful_attempts: u32) -> Duration {
        let factor = (f64::from(unsuccessful_attempts) + 1.0).log10();
        self.reconnect_base.mul_f64(factor).min(self.reconnect_cap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Link lifecycle and traffic, for observers.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Connected,
    Disconnected,
    Message(ControlMessage),
}

/// Receiver of traffic for one topic.
pub trait SignalingHandler: Send + Sync {
    /// The link (re)connected and has re-subscribed this topic.
    fn on_connect(&self, link: &Arc<SignalingLink>);

    /// A `publish` for this topic arrived.
    fn on_publish(&self, link: &Arc<SignalingLink>, data: &Value);
}

// ───────────────────────────────────────────────────────────────────
// Link
// ───────────────────────────────────────────────────────────────────

pub struct SignalingLink {
    url: String,
    config: SignalingConfig,
    state: Mutex<ConnectionState>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    handlers: Mutex<HashMap<String, Weak<dyn SignalingHandler>>>,
    events: broadcast::Sender<SignalingEvent>,
    should_connect: AtomicBool,
    unsuccessful_reconnects: AtomicU32,
    shutdown: Notify,
}

impl SignalingLink {
    /// Create and start connecting. Must be called inside a tokio runtime.
    pub fn spawn(url: impl Into<String>, config: SignalingConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let link = Arc::new(Self {
            url: url.into(),
            config,
            state: Mutex::new(ConnectionState::Disconnected),
            outgoing: Mutex::new(None),
            handlers: Mutex::new(HashMap::new()),
            events,
            should_connect: AtomicBool::new(true),
            unsuccessful_reconnects: AtomicU32::new(0),
            shutdown: Notify::new(),
        });
        tokio::spawn(Self::run(link.clone()));
        link
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn unsuccessful_reconnects(&self) -> u32 {
        self.unsuccessful_reconnects.load(Ordering::Relaxed)
    }

    pub fn events(&self) -> broadcast::Receiver<SignalingEvent> {
        self.events.subscribe()
    }

    /// Queue a record. Returns `false` when not connected; nothing is
    /// buffered across reconnects.
    pub fn send(&self, message: &ControlMessage) -> bool {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Cannot encode signaling message for {}: {e}", self.url);
                return false;
            }
        };
        match &*self.outgoing.lock() {
            Some(tx) => tx.send(text).is_ok(),
            None => false,
        }
    }

    pub fn subscribe(&self, topics: Vec<String>) -> bool {
        self.send(&ControlMessage::Subscribe { topics })
    }

    pub fn unsubscribe(&self, topics: Vec<String>) -> bool {
        self.send(&ControlMessage::Unsubscribe { topics })
    }

    pub fn publish(&self, topic: &str, data: Value) -> bool {
        self.send(&ControlMessage::publish(topic, data))
    }

    /// Route `topic` to `handler` and subscribe it if connected.
    pub fn attach(&self, topic: &str, handler: Weak<dyn SignalingHandler>) {
        self.handlers.lock().insert(topic.to_string(), handler);
        self.subscribe(vec![topic.to_string()]);
    }

    /// Stop routing `topic` and unsubscribe it if connected.
    pub fn detach(&self, topic: &str) {
        let removed = self.handlers.lock().remove(topic).is_some();
        if removed {
            self.unsubscribe(vec![topic.to_string()]);
        }
    }

    pub fn topics(&self) -> Vec<String> {
        self.handlers.lock().keys().cloned().collect()
    }

    /// Close the socket and stop reconnecting.
    pub fn destroy(&self) {
        if !self.should_connect.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.notify_one();
        self.outgoing.lock().take();
        self.handlers.lock().clear();
        log::info!("Signaling link {} destroyed", self.url);
    }

    pub fn is_destroyed(&self) -> bool {
        !self.should_connect.load(Ordering::Acquire)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    fn emit(&self, event: SignalingEvent) {
        // No observers is fine.
        let _ = self.events.send(event);
    }

    fn handler(&self, topic: &str) -> Option<Arc<dyn SignalingHandler>> {
        let mut handlers = self.handlers.lock();
        let upgraded = handlers.get(topic).map(Weak::upgrade);
        match upgraded {
            Some(Some(handler)) => Some(handler),
            Some(None) => {
                handlers.remove(topic);
                None
            }
            None => None,
        }
    }

    fn handlers_snapshot(&self) -> Vec<Arc<dyn SignalingHandler>> {
        self.handlers.lock().values().filter_map(Weak::upgrade).collect()
    }

    fn on_open(self: &Arc<Self>) {
        log::info!("Signaling link connected ({})", self.url);
        self.unsuccessful_reconnects.store(0, Ordering::Relaxed);
        self.set_state(ConnectionState::Connected);
        self.emit(SignalingEvent::Connected);

        let topics = self.topics();
        if !topics.is_empty() {
            self.subscribe(topics);
        }
        for handler in self.handlers_snapshot() {
            handler.on_connect(self);
        }
    }

    fn on_text(self: &Arc<Self>, text: &str) {
        let message = match ControlMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Ignoring malformed signaling message from {}: {e}", self.url);
                return;
            }
        };
        if let ControlMessage::Publish { topic, data, .. } = &message {
            if let Some(handler) = self.handler(topic) {
                handler.on_publish(self, data);
            }
        }
        self.emit(SignalingEvent::Message(message));
    }

    async fn run(self: Arc<Self>) {
        while !self.is_destroyed() {
            self.set_state(ConnectionState::Connecting);
            let was_connected = tokio::select! {
                connected = self.connect_once() => connected,
                _ = self.shutdown.notified() => break,
            };

            self.outgoing.lock().take();
            self.set_state(ConnectionState::Disconnected);
            if was_connected {
                log::info!("Signaling link disconnected ({})", self.url);
                self.emit(SignalingEvent::Disconnected);
            } else {
                self.unsuccessful_reconnects.fetch_add(1, Ordering::Relaxed);
            }
            if self.is_destroyed() {
                break;
            }

            let delay = self.config.reconnect_delay(self.unsuccessful_reconnects());
            log::debug!("Reconnecting to {} in {delay:?}", self.url);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.notified() => break,
            }
        }
        self.outgoing.lock().take();
        self.set_state(ConnectionState::Disconnected);
    }

    /// One connection attempt and, if it opens, its whole session.
    /// Returns whether the socket ever opened.
    async fn connect_once(self: &Arc<Self>) -> bool {
        let ws = match tokio_tungstenite::connect_async(self.url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                log::debug!("Signaling connect to {} failed: {e}", self.url);
                return false;
            }
        };
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.outgoing.lock() = Some(tx);
        self.on_open();

        let keepalive = self.config.message_timeout / 2;
        let mut ping = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
        let mut last_message = Instant::now();

        loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        last_message = Instant::now();
                        self.on_text(text.as_str());
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => last_message = Instant::now(),
                    Some(Err(e)) => {
                        log::warn!("Signaling socket error on {}: {e}", self.url);
                        break;
                    }
                },
                outgoing = rx.recv() => match outgoing {
                    Some(text) => {
                        if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                            log::warn!("Signaling send to {} failed: {e}", self.url);
                            break;
                        }
                    }
                    None => {
                        let _ = sink.close().await;
                        break;
                    }
                },
                _ = ping.tick() => {
                    if last_message.elapsed() > self.config.message_timeout {
                        log::warn!("No signaling traffic from {} in {:?}, closing", self.url, self.config.message_timeout);
                        break;
                    }
                    let frame = ControlMessage::Ping.to_json().unwrap_or_default();
                    if sink.send(WsMessage::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        true
    }
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

struct RegistryEntry {
    link: Arc<SignalingLink>,
    refcount: usize,
}

/// Shared links keyed by URL.
pub struct SignalingRegistry {
    config: SignalingConfig,
    links: Mutex<HashMap<String, RegistryEntry>>,
}

impl Default for SignalingRegistry {
    fn default() -> Self {
        Self::new(SignalingConfig::default())
    }
}

impl SignalingRegistry {
    pub fn new(config: SignalingConfig) -> Self {
        Self {
            config,
            links: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the link for `url` and take a reference to it.
    pub fn acquire(&self, url: &str) -> Arc<SignalingLink> {
        let mut links = self.links.lock();
        let entry = links.entry(url.to_string()).or_insert_with(|| {
            log::info!("Opening signaling link to {url}");
            RegistryEntry {
                link: SignalingLink::spawn(url, self.config.clone()),
                refcount: 0,
            }
        });
        entry.refcount += 1;
        entry.link.clone()
    }

    /// Drop a reference. The last release destroys the link.
    /// Returns whether the link was destroyed.
    pub fn release(&self, url: &str) -> bool {
        let removed = {
            let mut links = self.links.lock();
            match links.get_mut(url) {
                Some(entry) if entry.refcount > 1 => {
                    entry.refcount -= 1;
                    None
                }
                Some(_) => links.remove(url),
                None => None,
            }
        };
        match removed {
            Some(entry) => {
                entry.link.destroy();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, url: &str) -> Option<Arc<SignalingLink>> {
        self.links.lock().get(url).map(|e| e.link.clone())
    }

    pub fn refcount(&self, url: &str) -> usize {
        self.links.lock().get(url).map_or(0, |e| e.refcount)
    }

    pub fn links(&self) -> Vec<Arc<SignalingLink>> {
        self.links.lock().values().map(|e| e.link.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.links.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_control_message_wire_shape() {
        let sub = ControlMessage::Subscribe { topics: vec!["docA".into()] };
        assert_eq!(
            serde_json::to_value(&sub).unwrap(),
            json!({ "type": "subscribe", "topics": ["docA"] })
        );
        let publish = ControlMessage::publish("docA", json!({ "type": "announce", "from": "p1" }));
        assert_eq!(
            serde_json::to_value(&publish).unwrap(),
            json!({ "type": "publish", "topic": "docA", "data": { "type": "announce", "from": "p1" } })
        );
        assert_eq!(ControlMessage::Ping.to_json().unwrap(), r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_control_message_parse() {
        assert_eq!(ControlMessage::from_json(r#"{"type":"pong"}"#).unwrap(), ControlMessage::Pong);
        let relayed = ControlMessage::from_json(r#"{"type":"publish","topic":"t","data":"abc","clients":2}"#).unwrap();
        assert_eq!(
            relayed,
            ControlMessage::Publish { topic: "t".into(), data: json!("abc"), clients: Some(2) }
        );
        assert_eq!(
            ControlMessage::from_json(r#"{"type":"unsubscribe"}"#).unwrap(),
            ControlMessage::Unsubscribe { topics: vec![] }
        );
        assert!(matches!(ControlMessage::from_json(r#"{"type":"nope"}"#), Err(SignalingError::Json(_))));
    }

    #[test]
    fn test_reconnect_delay_curve() {
        let config = SignalingConfig::default();
        assert_eq!(config.reconnect_delay(0), Duration::ZERO);
        let first = config.reconnect_delay(1);
        assert!(first > Duration::from_millis(350) && first < Duration::from_millis(370));
        assert!(config.reconnect_delay(3) > first);
        assert_eq!(config.reconnect_delay(100), Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_registry_refcounts_links() {
        let registry = SignalingRegistry::default();
        let url = "ws://127.0.0.1:9";
        let a = registry.acquire(url);
        let b = registry.acquire(url);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.refcount(url), 2);
        assert_eq!(registry.len(), 1);

        assert!(!registry.release(url));
        assert!(!a.is_destroyed());
        assert!(registry.release(url));
        assert!(a.is_destroyed());
        assert!(registry.is_empty());
        assert!(!registry.release(url));
    }

    #[tokio::test]
    async fn test_registries_are_isolated() {
        let r1 = SignalingRegistry::default();
        let r2 = SignalingRegistry::default();
        let a = r1.acquire("ws://127.0.0.1:9");
        let b = r2.acquire("ws://127.0.0.1:9");
        assert!(!Arc::ptr_eq(&a, &b));
        a.destroy();
        b.destroy();
    }

    #[tokio::test]
    async fn test_unreachable_link_counts_failures() {
        let config = SignalingConfig {
            reconnect_base: Duration::from_millis(10),
            reconnect_cap: Duration::from_millis(20),
            ..SignalingConfig::default()
        };
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let link = SignalingLink::spawn(format!("ws://127.0.0.1:{port}"), config);
        tokio::time::timeout(Duration::from_secs(5), async {
            while link.unsuccessful_reconnects() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!link.is_connected());
        assert!(!link.publish("t", json!(null)));
        link.destroy();
    }
}
