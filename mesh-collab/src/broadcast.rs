//! Process-local broadcast channels.
//!
//! The same-origin fallback bus: every session joined to a channel name
//! receives every frame published on it, except its own. Uses tokio
//! broadcast channels for O(1) fan-out; each member gets an independent
//! receiver that buffers up to `capacity` frames.
//!
//! A member that falls more than `capacity` frames behind loses the
//! overwritten frames and is told so with [`Delivery::Lagged`]; recovering
//! the lost state is up to the member.
//!
//! [`BroadcastHub`] is an injectable registry, so tests get isolated buses.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Default frames buffered per member before a slow member starts lagging.
pub const DEFAULT_CAPACITY: usize = 256;

/// Statistics for monitoring channel health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

/// Lock-free counters on the hot path, read via [`BroadcastChannel::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// One frame on a channel, tagged with the publishing member.
#[derive(Debug, Clone)]
pub struct BroadcastFrame {
    pub sender: u64,
    pub payload: Arc<Vec<u8>>,
}

/// What a member gets from [`MemberReceiver::recv`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A frame published by another member.
    Frame(Arc<Vec<u8>>),
    /// This many frames were overwritten before they were read.
    Lagged(u64),
}

type ChannelMap = Mutex<HashMap<String, Arc<BroadcastChannel>>>;

// ───────────────────────────────────────────────────────────────────
// Channel
// ───────────────────────────────────────────────────────────────────

/// A named channel shared by every member that joined it.
pub struct BroadcastChannel {
    name: String,
    sender: broadcast::Sender<BroadcastFrame>,
    capacity: usize,
    next_member: AtomicU64,
    /// Live receivers; only changed under the hub lock.
    members: AtomicUsize,
    stats: AtomicBroadcastStats,
}

impl BroadcastChannel {
    fn new(name: String, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            name,
            sender,
            capacity,
            next_member: AtomicU64::new(1),
            members: AtomicUsize::new(0),
            stats: AtomicBroadcastStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn member_count(&self) -> usize {
        self.members.load(Ordering::Acquire)
    }

    /// Fan a frame out to every receiver, including the sender's own.
    /// Returns the number of receivers reached.
    fn publish(&self, sender: u64, payload: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(BroadcastFrame { sender, payload }).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_members: self.member_count(),
        }
    }
}

/// Publishing side of a channel membership. Cheap to clone.
#[derive(Clone)]
pub struct BroadcastMember {
    id: u64,
    channel: Arc<BroadcastChannel>,
}

impl BroadcastMember {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> &Arc<BroadcastChannel> {
        &self.channel
    }

    /// Publish to every other member.
    pub fn publish(&self, payload: Vec<u8>) -> usize {
        self.channel.publish(self.id, Arc::new(payload))
    }
}

/// Receiving side of a channel membership. The hub forgets the channel
/// once its last receiver is dropped.
pub struct MemberReceiver {
    id: u64,
    channel: Arc<BroadcastChannel>,
    receiver: broadcast::Receiver<BroadcastFrame>,
    hub: Weak<ChannelMap>,
}

impl MemberReceiver {
    /// Next frame published by another member, or the number of frames
    /// this member missed. `None` once the channel has no publishers left.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            match self.receiver.recv().await {
                Ok(frame) if frame.sender == self.id => continue,
                Ok(frame) => return Some(Delivery::Frame(frame.payload)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Some(self.lagged(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`Self::recv`].
    pub fn try_recv(&mut self) -> Option<Delivery> {
        loop {
            match self.receiver.try_recv() {
                Ok(frame) if frame.sender == self.id => continue,
                Ok(frame) => return Some(Delivery::Frame(frame.payload)),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    return Some(self.lagged(skipped));
                }
                Err(_) => return None,
            }
        }
    }

    fn lagged(&self, skipped: u64) -> Delivery {
        log::debug!("Broadcast channel {} lagged, {} frames dropped", self.channel.name, skipped);
        self.channel.stats.messages_dropped.fetch_add(skipped, Ordering::Relaxed);
        Delivery::Lagged(skipped)
    }
}

impl Drop for MemberReceiver {
    fn drop(&mut self) {
        let hub = self.hub.upgrade();
        let mut channels = hub.as_ref().map(|hub| hub.lock());
        let last = self.channel.members.fetch_sub(1, Ordering::AcqRel) == 1;
        let Some(channels) = channels.as_mut().filter(|_| last) else { return };
        let ours = channels
            .get(&self.channel.name)
            .is_some_and(|current| Arc::ptr_eq(current, &self.channel));
        if ours {
            channels.remove(&self.channel.name);
            log::debug!("Broadcast channel {} closed", self.channel.name);
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Hub
// ───────────────────────────────────────────────────────────────────

/// Registry mapping channel names to channels. A channel lives as long
/// as it has members.
pub struct BroadcastHub {
    channels: Arc<ChannelMap>,
    capacity: usize,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    /// The open channel for `name`, if anyone is joined to it.
    pub fn channel(&self, name: &str) -> Option<Arc<BroadcastChannel>> {
        self.channels.lock().get(name).cloned()
    }

    /// Join a channel, opening it if needed. The receiver sees every frame
    /// published after this call.
    pub fn join(&self, name: &str) -> (BroadcastMember, MemberReceiver) {
        let mut channels = self.channels.lock();
        let channel = channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(BroadcastChannel::new(name.to_string(), self.capacity)))
            .clone();
        let id = channel.next_member.fetch_add(1, Ordering::Relaxed);
        let receiver = channel.sender.subscribe();
        channel.members.fetch_add(1, Ordering::AcqRel);
        drop(channels);
        log::debug!("Joined broadcast channel {name} as member {id}");
        (
            BroadcastMember { id, channel: channel.clone() },
            MemberReceiver {
                id,
                channel,
                receiver,
                hub: Arc::downgrade(&self.channels),
            },
        )
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.lock().keys().cloned().collect()
    }
}

// ───────────────────────────────────────────────────────────────────
// Reentrancy guard
// ───────────────────────────────────────────────────────────────────

type Job = Box<dyn FnOnce() + Send>;

/// "One active broadcast at a time."
///
/// A job submitted while another is running is queued and executed by the
/// running caller once its own job returns, never inline. A panicking job
/// still releases the guard.
#[derive(Default)]
pub struct BroadcastGuard {
    active: AtomicBool,
    pending: Mutex<VecDeque<Job>>,
}

/// Clears the active flag when dropped, unwinding included.
struct Release<'a>(&'a AtomicBool);

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BroadcastGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` now if the guard is free, otherwise defer it.
    /// Returns `true` if the job ran inline.
    pub fn run<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.pending.lock().push_back(Box::new(job));
            return false;
        }

        {
            let _release = Release(&self.active);
            job();
            self.drain_pending();
        }
        // A job may have been queued between the last pop and the release.
        while !self.pending.lock().is_empty()
            && self
                .active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            let _release = Release(&self.active);
            self.drain_pending();
        }
        true
    }

    fn drain_pending(&self) {
        loop {
            let next = self.pending.lock().pop_front();
            match next {
                Some(job) => job(),
                None => break,
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
