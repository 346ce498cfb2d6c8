//! # Message Framing
//!
//! The plaintext framing under every envelope payload: the user payload
//! plus random padding sized so the encoded frame is a multiple of
//! [`PAD_SIZE_LIMIT`] bytes — observers learn only a coarse size class.
//! The frame is encrypted (or carried raw) into [`Envelope::data`] and
//! decoded back on delivery.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use crate::config::PAD_SIZE_LIMIT;
use crate::whisper::crypto::{
    self, CryptoError, WhisperKey,
};
use crate::whisper::envelope::Envelope;
use crate::whisper::topic::Topic;

/// The padded plaintext frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PaddedFrame {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

/// Encodes `payload` with enough random padding that the frame length is
/// a positive multiple of [`PAD_SIZE_LIMIT`].
pub fn pad_payload(payload: &[u8]) -> Vec<u8> {
    let bare = PaddedFrame {
        payload: payload.to_vec(),
        padding: Vec::new(),
    };
    let bare_len = bincode::serialized_size(&bare).unwrap_or(0) as usize;
    let padding_len = (PAD_SIZE_LIMIT - bare_len % PAD_SIZE_LIMIT) % PAD_SIZE_LIMIT;

    let mut padding = vec![0u8; padding_len];
    rand::rngs::OsRng.fill_bytes(&mut padding);

    bincode::serialize(&PaddedFrame {
        payload: payload.to_vec(),
        padding,
    })
    .unwrap_or_default()
}

/// Recovers the payload from a padded frame.
pub fn unpad_payload(frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let frame: PaddedFrame =
        bincode::deserialize(frame).map_err(|_| CryptoError::DecryptFailed)?;
    Ok(frame.payload)
}

/// Sender-side payload protection.
pub enum MessageKey {
    /// Pre-shared AES-256 key.
    Symmetric([u8; 32]),
    /// Recipient's secp256k1 public key.
    Asymmetric(k256::PublicKey),
}

/// Everything needed to build one outgoing envelope.
pub struct MessageParams {
    /// Payload protection; `None` sends the padded frame in clear.
    pub key: Option<MessageKey>,
    pub topic: Topic,
    /// Mining budget in seconds.
    pub pow_time: u32,
    pub ttl: u32,
    pub payload: Vec<u8>,
}

impl MessageParams {
    /// Pads, encrypts and wraps the payload into an unmined envelope.
    pub fn build_envelope(&self) -> Result<Envelope, CryptoError> {
        let frame = pad_payload(&self.payload);

        let data = match &self.key {
            Some(MessageKey::Symmetric(key)) => crypto::encrypt_symmetric(key, &frame)?,
            Some(MessageKey::Asymmetric(public)) => crypto::encrypt_asymmetric(public, &frame)?,
            None => frame,
        };

        Ok(Envelope::new(self.ttl, self.topic, data))
    }
}

/// A decrypted message delivered into a subscriber's inbox.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    /// Unix second the envelope was sent.
    pub sent: u32,
    pub ttl: u32,
    pub payload: Vec<u8>,
    pub topic: Topic,
    /// SHA3-256 of the symmetric key that opened the payload, if any.
    pub sym_key_hash: Option<[u8; 32]>,
    /// True when the payload was opened with an asymmetric key.
    pub decrypted_asymmetrically: bool,
    /// Identity of the envelope this message came from.
    pub envelope_hash: [u8; 32],
}

/// Attempts to open an envelope with a subscriber's key. `None` when the
/// key does not fit.
pub fn open_envelope(envelope: &Envelope, key: Option<&WhisperKey>) -> Option<ReceivedMessage> {
    let (payload, sym_key_hash, decrypted_asymmetrically) = match key {
        Some(WhisperKey::Keypair(secret)) => {
            let frame = crypto::decrypt_asymmetric(secret, &envelope.data).ok()?;
            (unpad_payload(&frame).ok()?, None, true)
        }
        Some(WhisperKey::Symmetric(sym_key)) => {
            let frame = crypto::decrypt_symmetric(sym_key, &envelope.data).ok()?;
            let key_hash: [u8; 32] = Sha3_256::digest(sym_key).into();
            (unpad_payload(&frame).ok()?, Some(key_hash), false)
        }
        None => (unpad_payload(&envelope.data).ok()?, None, false),
    };

    Some(ReceivedMessage {
        sent: envelope.sent_time(),
        ttl: envelope.ttl,
        payload,
        topic: envelope.topic,
        sym_key_hash,
        decrypted_asymmetrically,
        envelope_hash: envelope.hash(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::SecretKey;
    use rand::rngs::OsRng;

    #[test]
    fn padded_frames_are_multiples_of_the_pad_size() {
        for len in [0usize, 1, 100, 239, 240, 241, 1000] {
            let frame = pad_payload(&vec![0x5a; len]);
            assert_eq!(frame.len() % PAD_SIZE_LIMIT, 0, "payload length {len}");
            assert!(!frame.is_empty());
        }
    }

    #[test]
    fn pad_unpad_round_trip() {
        let payload = b"the payload".to_vec();
        let frame = pad_payload(&payload);
        assert_eq!(unpad_payload(&frame).unwrap(), payload);
    }

    #[test]
    fn plaintext_envelope_round_trip() {
        let params = MessageParams {
            key: None,
            topic: Topic::from_bytes(b"open"),
            pow_time: 0,
            ttl: 50,
            payload: b"hello".to_vec(),
        };
        let envelope = params.build_envelope().unwrap();
        let message = open_envelope(&envelope, None).expect("opens in clear");
        assert_eq!(message.payload, b"hello");
        assert_eq!(message.topic, Topic::from_bytes(b"open"));
        assert!(message.sym_key_hash.is_none());
    }

    #[test]
    fn symmetric_envelope_round_trip() {
        let raw_key = [7u8; 32];
        let params = MessageParams {
            key: Some(MessageKey::Symmetric(raw_key)),
            topic: Topic::from_bytes(b"sym!"),
            pow_time: 0,
            ttl: 50,
            payload: b"ping".to_vec(),
        };
        let envelope = params.build_envelope().unwrap();

        let key = WhisperKey::Symmetric(raw_key);
        let message = open_envelope(&envelope, Some(&key)).expect("right key opens");
        assert_eq!(message.payload, b"ping");
        assert!(message.sym_key_hash.is_some());

        let wrong = WhisperKey::Symmetric([8u8; 32]);
        assert!(open_envelope(&envelope, Some(&wrong)).is_none());
        assert!(open_envelope(&envelope, None).is_none());
    }

    #[test]
    fn asymmetric_envelope_round_trip() {
        let secret = SecretKey::random(&mut OsRng);
        let params = MessageParams {
            key: Some(MessageKey::Asymmetric(secret.public_key())),
            topic: Topic::from_bytes(b"asym"),
            pow_time: 0,
            ttl: 50,
            payload: b"secret ping".to_vec(),
        };
        let envelope = params.build_envelope().unwrap();

        let recipient = WhisperKey::Keypair(secret);
        let message = open_envelope(&envelope, Some(&recipient)).expect("private key opens");
        assert_eq!(message.payload, b"secret ping");
        assert!(message.decrypted_asymmetrically);

        let other = WhisperKey::Keypair(SecretKey::random(&mut OsRng));
        assert!(open_envelope(&envelope, Some(&other)).is_none());
    }

    #[test]
    fn envelope_hash_identifies_received_message() {
        let params = MessageParams {
            key: None,
            topic: Topic::from_bytes(b"hash"),
            pow_time: 0,
            ttl: 50,
            payload: b"x".to_vec(),
        };
        let envelope = params.build_envelope().unwrap();
        let message = open_envelope(&envelope, None).unwrap();
        assert_eq!(message.envelope_hash, envelope.hash());
        assert_eq!(message.sent, envelope.sent_time());
    }
}
