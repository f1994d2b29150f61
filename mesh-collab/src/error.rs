//! Error taxonomy for the mesh stack.
//!
//! Each layer owns its error enum. Only [`MeshError::SessionExists`] is
//! meant to reach application code as a hard failure; everything else is
//! logged at the edge or channel where it happened.

use thiserror::Error;

/// Binary decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Read past the end of the buffer.
    #[error("unexpected end of input")]
    UnexpectedEndOfInput,

    /// A variable-length integer exceeded the 53-bit safe range.
    #[error("integer out of range")]
    IntegerOutOfRange,

    /// A length-prefixed string was not valid UTF-8.
    #[error("invalid utf-8 in string")]
    InvalidUtf8,

    /// `read_any` met a tag outside 116..=127.
    #[error("unknown any tag: {0}")]
    UnknownAnyTag(u8),

    /// Objects and arrays nested deeper than `codec::MAX_ANY_DEPTH`.
    #[error("any value nested too deeply")]
    NestingTooDeep,
}

/// Wire message errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("unknown message tag: {0}")]
    UnknownMessageTag(u64),

    #[error("unknown sync message subtype: {0}")]
    UnknownSyncSubtype(u64),

    #[error("json error: {0}")]
    Json(String),
}

/// Errors raised at the CRDT document boundary.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("invalid state vector: {0}")]
    InvalidStateVector(String),

    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    #[error("failed to observe document: {0}")]
    Observe(String),
}

/// Payload encryption errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("unknown encryption algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("decryption failed")]
    Decryption,

    #[error("encryption failed")]
    Encryption,

    #[error("malformed envelope: {0}")]
    Envelope(#[from] CodecError),

    #[error("base64 error: {0}")]
    Base64(String),
}

/// Peer transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport not connected")]
    NotConnected,

    #[error("signal rejected: {0}")]
    Signal(String),
}

/// Signaling connection errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("signaling link destroyed")]
    Destroyed,

    #[error("json error: {0}")]
    Json(String),
}

/// Top-level errors surfaced by sessions and providers.
#[derive(Debug, Error)]
pub enum MeshError {
    /// A session with this name is already open in the registry.
    #[error("a document connected to room \"{0}\" already exists")]
    SessionExists(String),

    /// The session has not been opened yet (key derivation pending).
    #[error("session not ready")]
    NotReady,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

impl From<CodecError> for MeshError {
    fn from(e: CodecError) -> Self {
        MeshError::Protocol(ProtocolError::Codec(e))
    }
}

/// Result type for mesh operations.
pub type Result<T> = std::result::Result<T, MeshError>;
