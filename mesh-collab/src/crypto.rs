//! Optional payload encryption for broadcast-channel and signaling traffic.
//!
//! Key: PBKDF2-HMAC-SHA256 over the passphrase, salted with the room name.
//! Envelope (lib0 encoding):
//! ```text
//! varstring "AES-GCM" . varbytes iv(12) . varbytes ciphertext
//! ```
//! Peer-link traffic is never encrypted here.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use sha2::Sha256;

use crate::codec::{Any, Decoder, Encoder};
use crate::error::{CryptoError, MeshError};

pub const ALGORITHM: &str = "AES-GCM";
pub const PBKDF2_ITERATIONS: u32 = 100_000;
pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;

/// A derived AES-256-GCM key.
#[derive(Clone)]
pub struct EncryptionKey {
    cipher: Aes256Gcm,
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

impl EncryptionKey {
    /// Derive synchronously. PBKDF2 at this cost blocks; from async code use
    /// [`derive_key`].
    pub fn derive(passphrase: &str, room_name: &str) -> Self {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            passphrase.as_bytes(),
            room_name.as_bytes(),
            PBKDF2_ITERATIONS,
            &mut key,
        );
        Self::from_bytes(&key)
    }

    pub fn from_bytes(key: &[u8; KEY_LEN]) -> Self {
        Self { cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)) }
    }

    /// Encrypt into an envelope with a fresh random IV.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| CryptoError::Encryption)?;

        let mut encoder = Encoder::with_capacity(ALGORITHM.len() + IV_LEN + ciphertext.len() + 4);
        encoder.write_var_string(ALGORITHM);
        encoder.write_var_bytes(&iv);
        encoder.write_var_bytes(&ciphertext);
        Ok(encoder.into_bytes())
    }

    /// Open an envelope produced by [`Self::encrypt`].
    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut decoder = Decoder::new(envelope);
        let algorithm = decoder.read_var_string()?;
        if algorithm != ALGORITHM {
            return Err(CryptoError::UnknownAlgorithm(algorithm));
        }
        let iv = decoder.read_var_bytes()?;
        let ciphertext = decoder.read_var_bytes()?;
        if iv.len() != IV_LEN {
            return Err(CryptoError::Decryption);
        }
        self.cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| CryptoError::Decryption)
    }

    /// `write_any` the value, then encrypt.
    pub fn encrypt_any(&self, value: &Any) -> Result<Vec<u8>, CryptoError> {
        let mut encoder = Encoder::new();
        encoder.write_any(value);
        self.encrypt(encoder.as_bytes())
    }

    /// Decrypt, then `read_any`.
    pub fn decrypt_any(&self, envelope: &[u8]) -> Result<Any, CryptoError> {
        let plaintext = self.decrypt(envelope)?;
        Ok(Decoder::new(&plaintext).read_any()?)
    }

    /// Signaling form: encrypted `Any`, base64 encoded.
    pub fn seal_json(&self, value: &serde_json::Value) -> Result<String, CryptoError> {
        Ok(to_base64(&self.encrypt_any(&Any::from(value.clone()))?))
    }

    pub fn open_json(&self, sealed: &str) -> Result<serde_json::Value, CryptoError> {
        let any = self.decrypt_any(&from_base64(sealed)?)?;
        Ok(serde_json::Value::from(&any))
    }
}

/// Derive a key off the async executor.
pub async fn derive_key(passphrase: String, room_name: String) -> Result<EncryptionKey, MeshError> {
    tokio::task::spawn_blocking(move || EncryptionKey::derive(&passphrase, &room_name))
        .await
        .map_err(|e| MeshError::KeyDerivation(e.to_string()))
}

pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn from_base64(s: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD.decode(s).map_err(|e| CryptoError::Base64(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CodecError;

    fn test_key() -> EncryptionKey {
        EncryptionKey::from_bytes(&[7u8; KEY_LEN])
    }

    #[test]
    fn test_envelope_layout() {
        let key = test_key();
        let envelope = key.encrypt(b"hello").unwrap();
        let mut decoder = Decoder::new(&envelope);
        assert_eq!(decoder.read_var_string().unwrap(), "AES-GCM");
        assert_eq!(decoder.read_var_bytes().unwrap().len(), IV_LEN);
        // 16-byte tag appended by GCM
        assert_eq!(decoder.read_var_bytes().unwrap().len(), 5 + 16);
        assert!(!decoder.has_content());
    }

    #[test]
    fn test_decrypt_recovers_plaintext() {
        let key = test_key();
        let envelope = key.encrypt(&[0, 1, 2, 3]).unwrap();
        assert_eq!(key.decrypt(&envelope).unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_fresh_iv_per_message() {
        let key = test_key();
        assert_ne!(key.encrypt(b"same").unwrap(), key.encrypt(b"same").unwrap());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let envelope = test_key().encrypt(b"secret").unwrap();
        let other = EncryptionKey::from_bytes(&[8u8; KEY_LEN]);
        assert_eq!(other.decrypt(&envelope), Err(CryptoError::Decryption));
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let mut encoder = Encoder::new();
        encoder.write_var_string("ROT13");
        encoder.write_var_bytes(&[0; IV_LEN]);
        encoder.write_var_bytes(&[1, 2, 3]);
        assert_eq!(
            test_key().decrypt(encoder.as_bytes()),
            Err(CryptoError::UnknownAlgorithm("ROT13".into()))
        );
    }

    #[test]
    fn test_truncated_envelope() {
        let envelope = test_key().encrypt(b"x").unwrap();
        assert_eq!(
            test_key().decrypt(&envelope[..10]),
            Err(CryptoError::Envelope(CodecError::UnexpectedEndOfInput))
        );
    }

    #[test]
    fn test_derivation_is_salted_by_room() {
        let a = EncryptionKey::derive("secret", "docA");
        let b = EncryptionKey::derive("secret", "docA");
        let c = EncryptionKey::derive("secret", "docB");
        let envelope = a.encrypt(b"payload").unwrap();
        assert_eq!(b.decrypt(&envelope).unwrap(), b"payload");
        assert!(c.decrypt(&envelope).is_err());
    }

    #[test]
    fn test_seal_and_open_json() {
        let key = test_key();
        let record = serde_json::json!({ "type": "announce", "from": "peer-1" });
        let sealed = key.seal_json(&record).unwrap();
        assert!(from_base64(&sealed).is_ok());
        assert_eq!(key.open_json(&sealed).unwrap(), record);
        assert!(matches!(key.open_json("not base64!"), Err(CryptoError::Base64(_))));
    }

    #[tokio::test]
    async fn test_derive_key_off_executor() {
        let key = derive_key("secret".into(), "docA".into()).await.unwrap();
        let envelope = key.encrypt(b"ok").unwrap();
        assert_eq!(EncryptionKey::derive("secret", "docA").decrypt(&envelope).unwrap(), b"ok");
    }
}
