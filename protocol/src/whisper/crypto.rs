//! # Whisper Payload Crypto
//!
//! Two payload protections: AES-256-GCM under a pre-shared 32-byte key,
//! and ECIES over secp256k1 (ephemeral ECDH, HKDF-SHA256 key derivation,
//! AES-256-GCM sealing). Wire formats:
//!
//! ```text
//! symmetric:  nonce(12) || ciphertext+tag
//! asymmetric: ephemeral_pubkey_sec1(33) || nonce(12) || ciphertext+tag
//! ```
//!
//! Error variants are deliberately coarse — distinguishing "wrong key"
//! from "corrupted ciphertext" helps nobody we want to help.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use dashmap::DashMap;
use hkdf::Hkdf;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

use crate::config::{AES_KEY_LENGTH, AES_NONCE_LENGTH, KEY_ID_SIZE};

/// SEC1 compressed point length.
const PUBKEY_LENGTH: usize = 33;

/// Domain separation for the ECIES key derivation.
const ECIES_INFO: &[u8] = b"whisper-ecies-aes256gcm";

/// Errors of the Whisper crypto layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {AES_KEY_LENGTH} bytes")]
    InvalidKeyLength,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid private key")]
    InvalidPrivateKey,
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed -- wrong key or corrupted ciphertext")]
    DecryptFailed,
    #[error("no key stored under the given id")]
    UnknownKey,
    #[error("key id collision")]
    DuplicateId,
}

// ---------------------------------------------------------------------------
// Symmetric
// ---------------------------------------------------------------------------

/// Seals `plaintext` under AES-256-GCM with a fresh random nonce,
/// returning `nonce || ciphertext`.
pub fn encrypt_symmetric(
    key: &[u8; AES_KEY_LENGTH],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::EncryptFailed)?;

    let mut nonce_bytes = [0u8; AES_NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptFailed)?;

    let mut sealed = Vec::with_capacity(AES_NONCE_LENGTH + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Opens `nonce || ciphertext` sealed by [`encrypt_symmetric`].
pub fn decrypt_symmetric(
    key: &[u8; AES_KEY_LENGTH],
    sealed: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < AES_NONCE_LENGTH {
        return Err(CryptoError::DecryptFailed);
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(AES_NONCE_LENGTH);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::DecryptFailed)?;
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)
}

// ---------------------------------------------------------------------------
// Asymmetric (ECIES over secp256k1)
// ---------------------------------------------------------------------------

/// Derives the AES key from an ECDH shared secret.
fn derive_key(shared: &k256::ecdh::SharedSecret) -> Result<[u8; AES_KEY_LENGTH], CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(None, shared.raw_secret_bytes());
    let mut key = [0u8; AES_KEY_LENGTH];
    hkdf.expand(ECIES_INFO, &mut key)
        .map_err(|_| CryptoError::EncryptFailed)?;
    Ok(key)
}

/// Seals `plaintext` to a secp256k1 public key: a fresh ephemeral key
/// agrees on a shared secret, HKDF turns it into an AES key, AES-GCM
/// seals. Returns `ephemeral_pubkey || nonce || ciphertext`.
pub fn encrypt_asymmetric(public: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = SecretKey::random(&mut OsRng);
    let shared = k256::ecdh::diffie_hellman(ephemeral.to_nonzero_scalar(), public.as_affine());
    let key = derive_key(&shared)?;

    let sealed = encrypt_symmetric(&key, plaintext)?;
    let ephemeral_point = ephemeral.public_key().to_encoded_point(true);

    let mut out = Vec::with_capacity(PUBKEY_LENGTH + sealed.len());
    out.extend_from_slice(ephemeral_point.as_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Opens an ECIES payload with the recipient's private key.
pub fn decrypt_asymmetric(secret: &SecretKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < PUBKEY_LENGTH + AES_NONCE_LENGTH {
        return Err(CryptoError::DecryptFailed);
    }
    let (point_bytes, ciphertext) = sealed.split_at(PUBKEY_LENGTH);
    let ephemeral =
        PublicKey::from_sec1_bytes(point_bytes).map_err(|_| CryptoError::DecryptFailed)?;

    let shared = k256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), ephemeral.as_affine());
    let key = derive_key(&shared).map_err(|_| CryptoError::DecryptFailed)?;
    decrypt_symmetric(&key, ciphertext)
}

// ---------------------------------------------------------------------------
// Key Store
// ---------------------------------------------------------------------------

/// A stored Whisper key: pre-shared symmetric or secp256k1 keypair.
#[derive(Clone)]
pub enum WhisperKey {
    Symmetric([u8; AES_KEY_LENGTH]),
    Keypair(SecretKey),
}

/// Random-id keyed storage for Whisper crypto keys. Keys persist until
/// explicitly deleted.
#[derive(Default)]
pub struct KeyStore {
    keys: DashMap<String, WhisperKey>,
}

/// A fresh 32-byte random identifier, hex encoded.
pub fn generate_random_id() -> String {
    let mut bytes = [0u8; KEY_ID_SIZE];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, key: WhisperKey) -> Result<String, CryptoError> {
        let id = generate_random_id();
        match self.keys.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(CryptoError::DuplicateId),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(key);
                Ok(id)
            }
        }
    }

    /// Generates and stores a random symmetric key.
    pub fn new_symmetric_key(&self) -> Result<String, CryptoError> {
        let mut key = [0u8; AES_KEY_LENGTH];
        OsRng.fill_bytes(&mut key);
        self.insert(WhisperKey::Symmetric(key))
    }

    /// Imports a hex-encoded 32-byte symmetric key.
    pub fn add_symmetric_key(&self, hex_key: &str) -> Result<String, CryptoError> {
        let bytes = hex::decode(hex_key).map_err(|_| CryptoError::InvalidKeyLength)?;
        let key: [u8; AES_KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        self.insert(WhisperKey::Symmetric(key))
    }

    /// Generates and stores a secp256k1 keypair.
    pub fn new_key_pair(&self) -> Result<String, CryptoError> {
        self.insert(WhisperKey::Keypair(SecretKey::random(&mut OsRng)))
    }

    /// Imports a raw secp256k1 private key.
    pub fn add_private_key(&self, bytes: &[u8]) -> Result<String, CryptoError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidPrivateKey)?;
        self.insert(WhisperKey::Keypair(secret))
    }

    /// True when a key is stored under `id`.
    pub fn has_key(&self, id: &str) -> bool {
        self.keys.contains_key(id)
    }

    /// Removes a key.
    pub fn delete_key(&self, id: &str) {
        self.keys.remove(id);
    }

    /// The stored key under `id`.
    pub fn get(&self, id: &str) -> Result<WhisperKey, CryptoError> {
        self.keys
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or(CryptoError::UnknownKey)
    }

    /// The symmetric key under `id`.
    pub fn symmetric_key(&self, id: &str) -> Result<[u8; AES_KEY_LENGTH], CryptoError> {
        match self.get(id)? {
            WhisperKey::Symmetric(key) => Ok(key),
            WhisperKey::Keypair(_) => Err(CryptoError::UnknownKey),
        }
    }

    /// The private key under `id`.
    pub fn private_key(&self, id: &str) -> Result<SecretKey, CryptoError> {
        match self.get(id)? {
            WhisperKey::Keypair(secret) => Ok(secret),
            WhisperKey::Symmetric(_) => Err(CryptoError::UnknownKey),
        }
    }

    /// The SEC1-compressed public key under `id`.
    pub fn public_key(&self, id: &str) -> Result<Vec<u8>, CryptoError> {
        let secret = self.private_key(id)?;
        Ok(secret.public_key().to_encoded_point(true).as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; AES_KEY_LENGTH] {
        let mut key = [0u8; AES_KEY_LENGTH];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        key
    }

    #[test]
    fn symmetric_round_trip() {
        let key = test_key();
        let sealed = encrypt_symmetric(&key, b"ping").unwrap();
        assert_eq!(decrypt_symmetric(&key, &sealed).unwrap(), b"ping");
    }

    #[test]
    fn symmetric_wrong_key_fails() {
        let sealed = encrypt_symmetric(&test_key(), b"ping").unwrap();
        let mut wrong = test_key();
        wrong[0] ^= 0xff;
        assert!(decrypt_symmetric(&wrong, &sealed).is_err());
    }

    #[test]
    fn symmetric_tamper_fails() {
        let key = test_key();
        let mut sealed = encrypt_symmetric(&key, b"ping").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(decrypt_symmetric(&key, &sealed).is_err());
    }

    #[test]
    fn symmetric_nonces_are_unique() {
        let key = test_key();
        let a = encrypt_symmetric(&key, b"x").unwrap();
        let b = encrypt_symmetric(&key, b"x").unwrap();
        assert_ne!(&a[..AES_NONCE_LENGTH], &b[..AES_NONCE_LENGTH]);
    }

    #[test]
    fn asymmetric_round_trip() {
        let secret = SecretKey::random(&mut OsRng);
        let sealed = encrypt_asymmetric(&secret.public_key(), b"ping").unwrap();
        assert_eq!(decrypt_asymmetric(&secret, &sealed).unwrap(), b"ping");
    }

    #[test]
    fn asymmetric_wrong_recipient_fails() {
        let alice = SecretKey::random(&mut OsRng);
        let mallory = SecretKey::random(&mut OsRng);
        let sealed = encrypt_asymmetric(&alice.public_key(), b"ping").unwrap();
        assert!(decrypt_asymmetric(&mallory, &sealed).is_err());
    }

    #[test]
    fn asymmetric_truncated_fails() {
        let secret = SecretKey::random(&mut OsRng);
        let sealed = encrypt_asymmetric(&secret.public_key(), b"ping").unwrap();
        assert!(decrypt_asymmetric(&secret, &sealed[..20]).is_err());
    }

    #[test]
    fn key_store_symmetric_lifecycle() {
        let store = KeyStore::new();
        let id = store.new_symmetric_key().unwrap();
        assert!(store.has_key(&id));
        assert_eq!(store.symmetric_key(&id).unwrap().len(), AES_KEY_LENGTH);

        store.delete_key(&id);
        assert!(!store.has_key(&id));
        assert!(store.symmetric_key(&id).is_err());
    }

    #[test]
    fn key_store_imports_hex_symmetric_key() {
        let store = KeyStore::new();
        let id = store.add_symmetric_key(&hex::encode(test_key())).unwrap();
        assert_eq!(store.symmetric_key(&id).unwrap(), test_key());

        assert!(store.add_symmetric_key("abcd").is_err());
        assert!(store.add_symmetric_key("not-hex").is_err());
    }

    #[test]
    fn key_store_keypair_lifecycle() {
        let store = KeyStore::new();
        let id = store.new_key_pair().unwrap();
        let public = store.public_key(&id).unwrap();
        assert_eq!(public.len(), PUBKEY_LENGTH);

        // The stored private key opens what the public key seals.
        let recipient = PublicKey::from_sec1_bytes(&public).unwrap();
        let sealed = encrypt_asymmetric(&recipient, b"hello").unwrap();
        let secret = store.private_key(&id).unwrap();
        assert_eq!(decrypt_asymmetric(&secret, &sealed).unwrap(), b"hello");
    }

    #[test]
    fn key_kinds_do_not_cross() {
        let store = KeyStore::new();
        let sym = store.new_symmetric_key().unwrap();
        let asym = store.new_key_pair().unwrap();
        assert!(store.private_key(&sym).is_err());
        assert!(store.symmetric_key(&asym).is_err());
    }
}
