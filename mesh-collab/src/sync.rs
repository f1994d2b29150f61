//! CRDT sync protocol over an opaque document capability.
//!
//! Handshake per edge (both sides initiate, there is no server role):
//! ```text
//!  A                                   B
//!  │── StateVectorRequest(sv_A) ──────►│
//!  │◄────── StateVectorRequest(sv_B) ──│
//!  │◄────────── UpdateReply(B − sv_A) ─│   A: edge synced
//!  │── UpdateReply(A − sv_B) ─────────►│   B: edge synced
//!  │◄─────────────── Update(delta) ───►│   steady state
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

use crate::error::SyncError;
use crate::protocol::{Message, SyncMessage};

/// The replicated document, as seen by the mesh.
///
/// The mesh never interprets state vectors or updates; it only moves them.
pub trait Document: Send + Sync {
    /// Compact summary of which operations this replica has.
    fn encode_state_vector(&self) -> Vec<u8>;

    /// Everything this replica has that is absent from `state_vector`.
    /// An empty slice means "the whole document".
    fn encode_state_as_update(&self, state_vector: &[u8]) -> Result<Vec<u8>, SyncError>;

    /// Integrate a remote update.
    fn apply_update(&self, update: &[u8], origin: &str) -> Result<(), SyncError>;

    /// Stream of updates produced by every change to this document,
    /// local edits and integrated remote updates alike.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<u8>>;
}

/// Result of handling one inbound sync message.
#[derive(Debug, Default)]
pub struct SyncHandled {
    /// Message to send back on the same edge/channel.
    pub reply: Option<SyncMessage>,
    /// An UpdateReply was received and applied.
    pub completed_round: bool,
}

/// Build the step-1 message for `doc`.
pub fn state_vector_request(doc: &dyn Document) -> Message {
    Message::state_vector_request(doc.encode_state_vector())
}

/// Build the step-2 message for `doc` against a remote state vector.
pub fn update_reply(doc: &dyn Document, state_vector: &[u8]) -> Result<Message, SyncError> {
    Ok(Message::update_reply(doc.encode_state_as_update(state_vector)?))
}

/// Apply one sync message to `doc`.
///
/// A StateVectorRequest always yields an UpdateReply unless the state
/// vector itself is malformed. Apply failures are logged; they leave the
/// round incomplete but never propagate.
pub fn read_sync_message(doc: &dyn Document, message: SyncMessage, origin: &str) -> SyncHandled {
    match message {
        SyncMessage::StateVectorRequest(state_vector) => {
            match doc.encode_state_as_update(&state_vector) {
                Ok(update) => SyncHandled {
                    reply: Some(SyncMessage::UpdateReply(update)),
                    completed_round: false,
                },
                Err(e) => {
                    log::warn!("Cannot answer state vector request from {origin}: {e}");
                    SyncHandled::default()
                }
            }
        }
        SyncMessage::UpdateReply(update) => match doc.apply_update(&update, origin) {
            Ok(()) => SyncHandled { reply: None, completed_round: true },
            Err(e) => {
                log::error!("Caught error while applying sync reply from {origin}: {e}");
                SyncHandled::default()
            }
        },
        SyncMessage::Update(update) => {
            if let Err(e) = doc.apply_update(&update, origin) {
                log::error!("Caught error while applying update from {origin}: {e}");
            }
            SyncHandled::default()
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// yrs-backed document
// ───────────────────────────────────────────────────────────────────

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>>;

/// [`Document`] implementation over a `yrs::Doc`.
pub struct YrsDocument {
    doc: Doc,
    subscribers: Subscribers,
    _update_sub: yrs::Subscription,
}

impl YrsDocument {
    pub fn new() -> Result<Self, SyncError> {
        Self::from_doc(Doc::new())
    }

    /// Wrap an existing doc. Updates are observed from this point on.
    pub fn from_doc(doc: Doc) -> Result<Self, SyncError> {
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        let subs = subscribers.clone();
        let update_sub = doc
            .observe_update_v1(move |_txn, event| {
                subs.lock().retain(|tx| tx.send(event.update.clone()).is_ok());
            })
            .map_err(|e| SyncError::Observe(e.to_string()))?;
        Ok(Self { doc, subscribers, _update_sub: update_sub })
    }

    /// The underlying yrs document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Insert `chunk` into the named text at `index`.
    pub fn insert_text(&self, name: &str, index: u32, chunk: &str) {
        let text = self.doc.get_or_insert_text(name);
        let mut txn = self.doc.transact_mut();
        text.insert(&mut txn, index, chunk);
    }

    /// Current contents of the named text.
    pub fn text(&self, name: &str) -> String {
        let text = self.doc.get_or_insert_text(name);
        let txn = self.doc.transact();
        text.get_string(&txn)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Document for YrsDocument {
    fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    fn encode_state_as_update(&self, state_vector: &[u8]) -> Result<Vec<u8>, SyncError> {
        let sv = if state_vector.is_empty() {
            StateVector::default()
        } else {
            StateVector::decode_v1(state_vector)
                .map_err(|e| SyncError::InvalidStateVector(e.to_string()))?
        };
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    fn apply_update(&self, update: &[u8], origin: &str) -> Result<(), SyncError> {
        let update = Update::decode_v1(update).map_err(|e| SyncError::InvalidUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(origin);
        txn.apply_update(update)
            .map_err(|e| SyncError::InvalidUpdate(format!("{e:?}")))
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run a full two-sided handshake between two documents.
    fn handshake(a: &YrsDocument, b: &YrsDocument) -> (bool, bool) {
        let step1_a = SyncMessage::StateVectorRequest(a.encode_state_vector());
        let step1_b = SyncMessage::StateVectorRequest(b.encode_state_vector());

        let reply_from_b = read_sync_message(b, step1_a, "a").reply.unwrap();
        let reply_from_a = read_sync_message(a, step1_b, "b").reply.unwrap();

        let a_synced = read_sync_message(a, reply_from_b, "b").completed_round;
        let b_synced = read_sync_message(b, reply_from_a, "a").completed_round;
        (a_synced, b_synced)
    }

    #[test]
    fn test_state_vector_request_always_replies() {
        let doc = YrsDocument::new().unwrap();
        let handled = read_sync_message(&doc, SyncMessage::StateVectorRequest(Vec::new()), "peer");
        assert!(matches!(handled.reply, Some(SyncMessage::UpdateReply(_))));
        assert!(!handled.completed_round);
    }

    #[test]
    fn test_disjoint_histories_converge() {
        let a = YrsDocument::new().unwrap();
        let b = YrsDocument::new().unwrap();
        a.insert_text("content", 0, "hello ");
        b.insert_text("content", 0, "world");

        let (a_synced, b_synced) = handshake(&a, &b);
        assert!(a_synced);
        assert!(b_synced);
        assert_eq!(a.text("content"), b.text("content"));
        assert_eq!(a.text("content").len(), "hello world".len());
    }

    #[test]
    fn test_malformed_update_does_not_complete_round() {
        let doc = YrsDocument::new().unwrap();
        let handled = read_sync_message(&doc, SyncMessage::UpdateReply(vec![0xFF, 0xFF, 0xFF]), "peer");
        assert!(!handled.completed_round);
        assert!(handled.reply.is_none());
    }

    #[test]
    fn test_malformed_state_vector_yields_no_reply() {
        let doc = YrsDocument::new().unwrap();
        let handled = read_sync_message(&doc, SyncMessage::StateVectorRequest(vec![0xFF]), "peer");
        assert!(handled.reply.is_none());
    }

    #[test]
    fn test_incremental_update_applies() {
        let a = YrsDocument::new().unwrap();
        let b = YrsDocument::new().unwrap();
        let mut updates = a.subscribe();

        a.insert_text("content", 0, "x");
        let update = updates.try_recv().unwrap();
        read_sync_message(&b, SyncMessage::Update(update), "a");
        assert_eq!(b.text("content"), "x");
    }

    #[test]
    fn test_subscribers_pruned_when_dropped() {
        let doc = YrsDocument::new().unwrap();
        let rx = doc.subscribe();
        assert_eq!(doc.subscriber_count(), 1);
        drop(rx);
        doc.insert_text("content", 0, "y");
        assert_eq!(doc.subscriber_count(), 0);
    }

    #[test]
    fn test_empty_state_vector_means_full_state() {
        let a = YrsDocument::new().unwrap();
        a.insert_text("content", 0, "full");
        let msg = update_reply(&a, &[]).unwrap();
        let b = YrsDocument::new().unwrap();
        if let Message::Sync(sync) = msg {
            assert!(read_sync_message(&b, sync, "a").completed_round);
        }
        assert_eq!(b.text("content"), "full");
        assert!(matches!(state_vector_request(&b), Message::Sync(SyncMessage::StateVectorRequest(_))));
    }
}
