//! Awareness protocol: ephemeral per-client presence state.
//!
//! Every participant owns one entry `client_id → (state, clock)`. Entries
//! are gossiped as a whole and merged with a last-writer-wins rule on the
//! owner's clock, so updates may arrive in any order, any number of times.
//!
//! ## Data flow
//!
//! ```text
//! set_local_state()
//!       │  clock += 1
//!       ▼
//! AwarenessEvent::Update ──► session encodes + broadcasts
//!       │
//!       ▼   (peer links, broadcast channel)
//! Remote Awareness::apply_update()
//!       │  accept iff clock newer (or equal-clock tombstone)
//!       ▼
//! AwarenessEvent::Change (only when a value differs)
//! ```
//!
//! ## Update wire format
//!
//! ```text
//! varuint count . count × (varuint client_id, varuint clock, varstring json)
//! ```
//!
//! An absent state travels as the JSON literal `null`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::{Any, Decoder, Encoder};
use crate::error::ProtocolError;
use crate::events::{EventDispatcher, ListenerId};

/// Remote entries not refreshed within this window are evicted.
pub const OUTDATED_TIMEOUT: Duration = Duration::from_secs(30);

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Clock bookkeeping for one client, kept even after its state is gone
/// so that stale updates cannot resurrect it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaClientState {
    pub clock: u32,
    pub last_updated: Instant,
}

/// Who caused an awareness mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    Local,
    Timeout,
    Disconnect,
    /// A peer link or channel, named by the caller.
    Remote(String),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Local => f.write_str("local"),
            Origin::Timeout => f.write_str("timeout"),
            Origin::Disconnect => f.write_str("disconnect"),
            Origin::Remote(name) => f.write_str(name),
        }
    }
}

/// Client ids touched by one mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChanges {
    pub added: Vec<u32>,
    pub updated: Vec<u32>,
    pub removed: Vec<u32>,
}

impl AwarenessChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every touched id, in added/updated/removed order.
    pub fn all(&self) -> Vec<u32> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

/// Notifications emitted by [`Awareness`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwarenessEvent {
    /// Something was written, including refreshes that left the value
    /// unchanged. This is what gets rebroadcast.
    Update { changes: AwarenessChanges, origin: Origin },
    /// Only entries whose value actually differs.
    Change { changes: AwarenessChanges, origin: Origin },
}

#[derive(Debug, Default)]
struct AwarenessState {
    states: HashMap<u32, Any>,
    meta: HashMap<u32, MetaClientState>,
}

/// One decoded entry of an awareness update.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub client_id: u32,
    pub clock: u32,
    pub state: Option<Any>,
}

// ───────────────────────────────────────────────────────────────────
// Awareness
// ───────────────────────────────────────────────────────────────────

/// Shared presence state for one document.
///
/// Mutations happen under an internal lock; listeners run after the lock
/// is released, so a listener may call back into the same instance.
pub struct Awareness {
    client_id: u32,
    inner: Mutex<AwarenessState>,
    events: EventDispatcher<AwarenessEvent>,
    outdated_timeout: Duration,
    destroyed: AtomicBool,
}

impl Awareness {
    /// Create with an empty-object local state at clock 0.
    pub fn new(client_id: u32) -> Self {
        Self::with_timeout(client_id, OUTDATED_TIMEOUT)
    }

    pub fn with_timeout(client_id: u32, outdated_timeout: Duration) -> Self {
        let awareness = Self {
            client_id,
            inner: Mutex::new(AwarenessState::default()),
            events: EventDispatcher::new(),
            outdated_timeout,
            destroyed: AtomicBool::new(false),
        };
        awareness.set_local_state(Some(Any::Object(Default::default())));
        awareness
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    pub fn outdated_timeout(&self) -> Duration {
        self.outdated_timeout
    }

    /// Subscribe to both event kinds.
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&AwarenessEvent) + Send + Sync + 'static,
    {
        self.events.on(listener)
    }

    /// Subscribe to [`AwarenessEvent::Update`] only.
    pub fn on_update<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&AwarenessChanges, &Origin) + Send + Sync + 'static,
    {
        self.events.on(move |event| {
            if let AwarenessEvent::Update { changes, origin } = event {
                listener(changes, origin);
            }
        })
    }

    /// Subscribe to [`AwarenessEvent::Change`] only.
    pub fn on_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&AwarenessChanges, &Origin) + Send + Sync + 'static,
    {
        self.events.on(move |event| {
            if let AwarenessEvent::Change { changes, origin } = event {
                listener(changes, origin);
            }
        })
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    pub fn local_state(&self) -> Option<Any> {
        self.inner.lock().states.get(&self.client_id).cloned()
    }

    /// Snapshot of every known non-null state.
    pub fn states(&self) -> HashMap<u32, Any> {
        self.inner.lock().states.clone()
    }

    pub fn state(&self, client_id: u32) -> Option<Any> {
        self.inner.lock().states.get(&client_id).cloned()
    }

    pub fn meta(&self, client_id: u32) -> Option<MetaClientState> {
        self.inner.lock().meta.get(&client_id).copied()
    }

    /// Ids of every client with a non-null state.
    pub fn client_ids(&self) -> Vec<u32> {
        self.inner.lock().states.keys().copied().collect()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Replace the local state. `None` (or a JSON null) marks this client
    /// offline. The clock always advances, even for an identical value.
    pub fn set_local_state(&self, state: Option<Any>) {
        self.set_local_state_at(state, Instant::now());
    }

    fn set_local_state_at(&self, state: Option<Any>, now: Instant) {
        let state = state.filter(|s| !s.is_null());
        let client_id = self.client_id;
        let mut changes = AwarenessChanges::default();
        let mut filtered = AwarenessChanges::default();
        {
            let mut inner = self.inner.lock();
            let clock = inner.meta.get(&client_id).map_or(0, |m| m.clock.wrapping_add(1));
            let prev = match &state {
                Some(s) => inner.states.insert(client_id, s.clone()),
                None => inner.states.remove(&client_id),
            };
            inner.meta.insert(client_id, MetaClientState { clock, last_updated: now });

            match (&prev, &state) {
                (_, None) => changes.removed.push(client_id),
                (None, Some(_)) => changes.added.push(client_id),
                (Some(prev), Some(next)) => {
                    changes.updated.push(client_id);
                    if prev != next {
                        filtered.updated.push(client_id);
                    }
                }
            }
            filtered.added = changes.added.clone();
            filtered.removed = changes.removed.clone();
        }

        if !filtered.is_empty() {
            self.events.emit(&AwarenessEvent::Change { changes: filtered, origin: Origin::Local });
        }
        self.events.emit(&AwarenessEvent::Update { changes, origin: Origin::Local });
    }

    /// Set one field of the local object state. No-op while offline or
    /// when the local state is not an object.
    pub fn set_local_state_field(&self, field: &str, value: impl Into<Any>) {
        let next = match self.local_state() {
            Some(Any::Object(mut map)) => {
                map.insert(field.to_string(), value.into());
                Any::Object(map)
            }
            Some(_) => {
                log::debug!("Ignoring field update on non-object awareness state");
                return;
            }
            None => return,
        };
        self.set_local_state(Some(next));
    }

    /// Drop the given clients' states. Removing the local client advances
    /// its clock so the removal wins against its last broadcast state.
    pub fn remove_states(&self, client_ids: &[u32], origin: Origin) {
        let now = Instant::now();
        let mut removed = Vec::new();
        {
            let mut inner = self.inner.lock();
            for &client_id in client_ids {
                if inner.states.remove(&client_id).is_none() {
                    continue;
                }
                if client_id == self.client_id {
                    let clock = inner.meta.get(&client_id).map_or(0, |m| m.clock.wrapping_add(1));
                    inner.meta.insert(client_id, MetaClientState { clock, last_updated: now });
                }
                removed.push(client_id);
            }
        }

        if removed.is_empty() {
            return;
        }
        let changes = AwarenessChanges { removed, ..Default::default() };
        self.events.emit(&AwarenessEvent::Change { changes: changes.clone(), origin: origin.clone() });
        self.events.emit(&AwarenessEvent::Update { changes, origin });
    }

    /// Encode the given clients. Ids without clock metadata are skipped.
    pub fn encode_update(&self, client_ids: &[u32]) -> Vec<u8> {
        let inner = self.inner.lock();
        let entries: Vec<(u32, u32, Option<&Any>)> = client_ids
            .iter()
            .filter_map(|id| {
                inner.meta.get(id).map(|meta| (*id, meta.clock, inner.states.get(id)))
            })
            .collect();

        let mut encoder = Encoder::with_capacity(1 + entries.len() * 16);
        encoder.write_var_uint(entries.len() as u64);
        for (client_id, clock, state) in entries {
            encoder.write_var_uint(u64::from(client_id));
            encoder.write_var_uint(u64::from(clock));
            match state {
                Some(state) => encoder.write_var_string(&state.to_json_string()),
                None => encoder.write_var_string("null"),
            }
        }
        encoder.into_bytes()
    }

    /// Encode every client with a non-null state.
    pub fn encode_full_update(&self) -> Vec<u8> {
        self.encode_update(&self.client_ids())
    }

    /// Decode an update without applying it.
    pub fn decode_update(update: &[u8]) -> Result<Vec<AwarenessEntry>, ProtocolError> {
        let mut decoder = Decoder::new(update);
        let len = decoder.read_var_uint()?;
        let mut entries = Vec::with_capacity(len.min(1024) as usize);
        for _ in 0..len {
            let client_id = decoder.read_var_u32()?;
            let clock = decoder.read_var_u32()?;
            let json = decoder.read_var_string()?;
            let state = Any::from_json_str(&json)
                .map_err(|e| ProtocolError::Json(e.to_string()))?;
            entries.push(AwarenessEntry {
                client_id,
                clock,
                state: Some(state).filter(|s| !s.is_null()),
            });
        }
        Ok(entries)
    }

    /// Merge a remote update.
    ///
    /// An entry is accepted when its clock is newer than ours, or when it
    /// carries the same clock with a null state and we still hold a state
    /// for that client. A remote null for our own client is answered by
    /// bumping our clock instead, which surfaces as an update to rebroadcast.
    ///
    /// The update is decoded in full before anything is applied, so a
    /// malformed update changes nothing.
    pub fn apply_update(&self, update: &[u8], origin: Origin) -> Result<(), ProtocolError> {
        let entries = Self::decode_update(update)?;
        let now = Instant::now();
        let mut changes = AwarenessChanges::default();
        let mut filtered = AwarenessChanges::default();
        {
            let mut inner = self.inner.lock();
            for AwarenessEntry { client_id, mut clock, state } in entries {
                let meta = inner.meta.get(&client_id).copied();
                let has_state = inner.states.contains_key(&client_id);
                let accept = match meta {
                    None => true,
                    Some(m) => m.clock < clock || (m.clock == clock && state.is_none() && has_state),
                };
                if !accept {
                    continue;
                }

                let prev = inner.states.get(&client_id).cloned();
                match &state {
                    None if client_id == self.client_id && has_state => {
                        clock = clock.wrapping_add(1);
                    }
                    None => {
                        inner.states.remove(&client_id);
                    }
                    Some(s) => {
                        inner.states.insert(client_id, s.clone());
                    }
                }
                inner.meta.insert(client_id, MetaClientState { clock, last_updated: now });

                match (&prev, &state) {
                    (Some(_), None) if client_id == self.client_id => {
                        changes.updated.push(client_id);
                    }
                    (Some(_), None) => {
                        changes.removed.push(client_id);
                        filtered.removed.push(client_id);
                    }
                    (None, None) => {}
                    (None, Some(_)) => {
                        changes.added.push(client_id);
                        filtered.added.push(client_id);
                    }
                    (Some(prev), Some(next)) => {
                        changes.updated.push(client_id);
                        if prev != next {
                            filtered.updated.push(client_id);
                        }
                    }
                }
            }
        }

        if !filtered.is_empty() {
            self.events.emit(&AwarenessEvent::Change { changes: filtered, origin: origin.clone() });
        }
        if !changes.is_empty() {
            self.events.emit(&AwarenessEvent::Update { changes, origin });
        }
        Ok(())
    }

    /// One sweep of the timeout rules at time `now`: renew the local entry
    /// once half the window has passed, evict remote entries older than the
    /// full window. Returns the evicted ids.
    pub fn check_outdated_at(&self, now: Instant) -> Vec<u32> {
        let (renew, stale) = {
            let inner = self.inner.lock();
            let renew = inner.states.get(&self.client_id).cloned().filter(|_| {
                inner
                    .meta
                    .get(&self.client_id)
                    .map_or(false, |m| now.saturating_duration_since(m.last_updated) >= self.outdated_timeout / 2)
            });
            let stale: Vec<u32> = inner
                .meta
                .iter()
                .filter(|(id, meta)| {
                    **id != self.client_id
                        && inner.states.contains_key(id)
                        && now.saturating_duration_since(meta.last_updated) >= self.outdated_timeout
                })
                .map(|(id, _)| *id)
                .collect();
            (renew, stale)
        };

        if let Some(state) = renew {
            self.set_local_state_at(Some(state), now);
        }
        if !stale.is_empty() {
            log::debug!("Evicting {} outdated awareness entries", stale.len());
            self.remove_states(&stale, Origin::Timeout);
        }
        stale
    }

    /// Run [`Self::check_outdated_at`] every tenth of the timeout window
    /// until this instance is destroyed or dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = (self.outdated_timeout / 10).max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(awareness) = weak.upgrade() else { break };
                if awareness.is_destroyed() {
                    break;
                }
                awareness.check_outdated_at(Instant::now());
            }
        })
    }

    /// Publish a final null local state, then drop all listeners.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_local_state(None);
        self.events.clear();
    }
}

impl fmt::Debug for Awareness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Awareness")
            .field("client_id", &self.client_id)
            .field("states", &inner.states.len())
            .field("listeners", &self.events.listener_count())
            .finish()
    }
}

// ===================================================================
// Tests
// ===================================================================
