//! Binary wire messages exchanged on peer links and the broadcast channel.
//!
//! Wire format (lib0 encoding, see [`crate::codec`]):
//! ```text
//! ┌──────────────┬────────────────────────────────────────────────┐
//! │ varuint tag  │ payload                                        │
//! ├──────────────┼────────────────────────────────────────────────┤
//! │ 0 Sync       │ varuint subtype (0 sv / 1 reply / 2 update)    │
//! │              │ . varbytes                                     │
//! │ 1 Awareness  │ varbytes (awareness update)                    │
//! │ 3 QueryAw.   │ (empty)                                        │
//! │ 4 PeerId     │ u8 add flag . varstring peer id                │
//! └──────────────┴────────────────────────────────────────────────┘
//! ```
//!
//! Tag 2 is reserved by the Yjs ecosystem for auth and is never produced here.

use crate::codec::{Decoder, Encoder};
use crate::error::ProtocolError;

/// Top-level message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// CRDT sync (state vector request, reply, incremental update)
    Sync = 0,
    /// Awareness update
    Awareness = 1,
    /// Request for a full awareness snapshot
    QueryAwareness = 3,
    /// Broadcast-channel peer id add/remove
    PeerIdAnnounce = 4,
}

impl MessageType {
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(Self::Sync),
            1 => Some(Self::Awareness),
            3 => Some(Self::QueryAwareness),
            4 => Some(Self::PeerIdAnnounce),
            _ => None,
        }
    }
}

/// Sync subtypes carried inside a [`MessageType::Sync`] message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Step 1: the sender's state vector.
    StateVectorRequest(Vec<u8>),
    /// Step 2: everything the sender has beyond the received state vector.
    UpdateReply(Vec<u8>),
    /// Steady-state incremental update.
    Update(Vec<u8>),
}

impl SyncMessage {
    pub const STATE_VECTOR_REQUEST: u64 = 0;
    pub const UPDATE_REPLY: u64 = 1;
    pub const UPDATE: u64 = 2;

    pub fn subtype(&self) -> u64 {
        match self {
            Self::StateVectorRequest(_) => Self::STATE_VECTOR_REQUEST,
            Self::UpdateReply(_) => Self::UPDATE_REPLY,
            Self::Update(_) => Self::UPDATE,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Self::StateVectorRequest(p) | Self::UpdateReply(p) | Self::Update(p) => p,
        }
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_var_uint(self.subtype());
        encoder.write_var_bytes(self.payload());
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, ProtocolError> {
        let subtype = decoder.read_var_uint()?;
        let payload = decoder.read_var_bytes()?.to_vec();
        match subtype {
            Self::STATE_VECTOR_REQUEST => Ok(Self::StateVectorRequest(payload)),
            Self::UPDATE_REPLY => Ok(Self::UpdateReply(payload)),
            Self::UPDATE => Ok(Self::Update(payload)),
            other => Err(ProtocolError::UnknownSyncSubtype(other)),
        }
    }
}

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    /// Encoded awareness update (see [`crate::awareness::Awareness::encode_update`]).
    Awareness(Vec<u8>),
    QueryAwareness,
    PeerIdAnnounce { add: bool, peer_id: String },
}

impl Message {
    pub fn state_vector_request(state_vector: Vec<u8>) -> Self {
        Self::Sync(SyncMessage::StateVectorRequest(state_vector))
    }

    pub fn update_reply(update: Vec<u8>) -> Self {
        Self::Sync(SyncMessage::UpdateReply(update))
    }

    pub fn update(update: Vec<u8>) -> Self {
        Self::Sync(SyncMessage::Update(update))
    }

    pub fn awareness(update: Vec<u8>) -> Self {
        Self::Awareness(update)
    }

    pub fn peer_id(add: bool, peer_id: impl Into<String>) -> Self {
        Self::PeerIdAnnounce { add, peer_id: peer_id.into() }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Sync(_) => MessageType::Sync,
            Self::Awareness(_) => MessageType::Awareness,
            Self::QueryAwareness => MessageType::QueryAwareness,
            Self::PeerIdAnnounce { .. } => MessageType::PeerIdAnnounce,
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(16 + self.payload_len());
        encoder.write_var_uint(self.message_type() as u64);
        match self {
            Self::Sync(sync) => sync.encode_into(&mut encoder),
            Self::Awareness(update) => encoder.write_var_bytes(update),
            Self::QueryAwareness => {}
            Self::PeerIdAnnounce { add, peer_id } => {
                encoder.write_u8(u8::from(*add));
                encoder.write_var_string(peer_id);
            }
        }
        encoder.into_bytes()
    }

    /// Deserialize from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut decoder = Decoder::new(bytes);
        let tag = decoder.read_var_uint()?;
        match MessageType::from_tag(tag) {
            Some(MessageType::Sync) => Ok(Self::Sync(SyncMessage::decode_from(&mut decoder)?)),
            Some(MessageType::Awareness) => {
                Ok(Self::Awareness(decoder.read_var_bytes()?.to_vec()))
            }
            Some(MessageType::QueryAwareness) => Ok(Self::QueryAwareness),
            Some(MessageType::PeerIdAnnounce) => {
                let add = decoder.read_u8()? == 1;
                let peer_id = decoder.read_var_string()?;
                Ok(Self::PeerIdAnnounce { add, peer_id })
            }
            None => Err(ProtocolError::UnknownMessageTag(tag)),
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Self::Sync(sync) => sync.payload().len(),
            Self::Awareness(update) => update.len(),
            Self::QueryAwareness => 0,
            Self::PeerIdAnnounce { peer_id, .. } => peer_id.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CodecError;

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Sync as u8, 0);
        assert_eq!(MessageType::Awareness as u8, 1);
        assert_eq!(MessageType::QueryAwareness as u8, 3);
        assert_eq!(MessageType::PeerIdAnnounce as u8, 4);
        assert_eq!(MessageType::from_tag(2), None);
    }

    #[test]
    fn test_state_vector_request_bytes() {
        let msg = Message::state_vector_request(vec![10, 20]);
        assert_eq!(msg.encode(), vec![0, 0, 2, 10, 20]);
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_update_reply_and_update() {
        let reply = Message::update_reply(vec![1, 2, 3]);
        let update = Message::update(vec![]);
        assert_eq!(reply.encode()[1], 1);
        assert_eq!(update.encode(), vec![0, 2, 0]);
        assert_eq!(Message::decode(&reply.encode()).unwrap(), reply);
        assert_eq!(Message::decode(&update.encode()).unwrap(), update);
    }

    #[test]
    fn test_query_awareness_is_single_byte() {
        assert_eq!(Message::QueryAwareness.encode(), vec![3]);
        assert_eq!(Message::decode(&[3]).unwrap(), Message::QueryAwareness);
    }

    #[test]
    fn test_peer_id_announce() {
        let msg = Message::peer_id(false, "abc");
        let bytes = msg.encode();
        assert_eq!(bytes, vec![4, 0, 3, b'a', b'b', b'c']);
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_unknown_tag() {
        assert_eq!(Message::decode(&[2]), Err(ProtocolError::UnknownMessageTag(2)));
        assert_eq!(Message::decode(&[9, 1, 2]), Err(ProtocolError::UnknownMessageTag(9)));
    }

    #[test]
    fn test_unknown_sync_subtype() {
        assert_eq!(
            Message::decode(&[0, 7, 0]),
            Err(ProtocolError::UnknownSyncSubtype(7))
        );
    }

    #[test]
    fn test_truncated_payload() {
        assert_eq!(
            Message::decode(&[0, 0, 5, 1]),
            Err(ProtocolError::Codec(CodecError::UnexpectedEndOfInput))
        );
        assert_eq!(
            Message::decode(&[]),
            Err(ProtocolError::Codec(CodecError::UnexpectedEndOfInput))
        );
    }

    #[test]
    fn test_large_update() {
        let update = vec![42u8; 65536];
        let msg = Message::update(update.clone());
        match Message::decode(&msg.encode()).unwrap() {
            Message::Sync(SyncMessage::Update(payload)) => assert_eq!(payload, update),
            other => panic!("unexpected message {other:?}"),
        }
    }
}
