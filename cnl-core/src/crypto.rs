//! Content crypto and key storage: symmetric content decryption, private-key
//! unwrapping of content keys, and a key store resolving private keys by name.

use std::collections::HashMap;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::name::Name;

const NONCE_LEN: usize = 12;
const PUBLIC_KEY_LEN: usize = 32;
const WRAP_DOMAIN: &[u8] = b"cnl-key-wrap-v1";

/// Public half of a key-wrapping keypair (32 bytes, X25519).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// X25519 private key used to unwrap content keys. Keep private; expose only the public key.
pub struct PrivateKey {
    secret: StaticSecret,
    public: PublicKey,
}

impl PrivateKey {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    fn shared_secret(&self, other: &[u8; 32]) -> [u8; 32] {
        let other = X25519PublicKey::from(*other);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

/// Crypto capability consumed by the group-decryption handler.
pub trait ContentCrypto {
    /// Decrypt object content with a symmetric content key.
    fn decrypt(&self, ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Recover a content key that was wrapped for `private_key`'s public half.
    fn unwrap_key(&self, wrapped: &[u8], private_key: &PrivateKey) -> Result<Vec<u8>, CryptoError>;
}

/// Trust/key-storage capability: resolve a private key by name.
pub trait KeyStore {
    fn resolve_private_key(&self, key_name: &Name) -> Option<&PrivateKey>;
}

/// Default crypto: ChaCha20-Poly1305 content, X25519 + SHA-256 key wrapping.
/// Content layout: nonce (12) ‖ AEAD ciphertext.
/// Wrapped key layout: ephemeral public key (32) ‖ nonce (12) ‖ AEAD ciphertext.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChaChaCrypto;

impl ContentCrypto for ChaChaCrypto {
    fn decrypt(&self, ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        open(key, ciphertext)
    }

    fn unwrap_key(&self, wrapped: &[u8], private_key: &PrivateKey) -> Result<Vec<u8>, CryptoError> {
        if wrapped.len() < PUBLIC_KEY_LEN + NONCE_LEN {
            return Err(CryptoError::Format);
        }
        let mut ephemeral = [0u8; PUBLIC_KEY_LEN];
        ephemeral.copy_from_slice(&wrapped[..PUBLIC_KEY_LEN]);
        let shared = private_key.shared_secret(&ephemeral);
        let kek = derive_wrap_key(&shared, &ephemeral);
        open(&kek, &wrapped[PUBLIC_KEY_LEN..])
    }
}

/// Encrypt object content under a symmetric content key (producer side).
pub fn encrypt_content(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    seal(key, plaintext)
}

/// Wrap a content key for the holder of `recipient`'s private key (producer side).
pub fn wrap_key(recipient: &PublicKey, content_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = PrivateKey::generate();
    let shared = ephemeral.shared_secret(recipient.as_bytes());
    let kek = derive_wrap_key(&shared, ephemeral.public_key().as_bytes());
    let sealed = seal(&kek, content_key)?;
    let mut out = Vec::with_capacity(PUBLIC_KEY_LEN + sealed.len());
    out.extend_from_slice(ephemeral.public_key().as_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Random 32-byte content key.
pub fn generate_content_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

fn derive_wrap_key(shared_secret: &[u8; 32], ephemeral_public: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(WRAP_DOMAIN);
    hasher.update(shared_secret);
    hasher.update(ephemeral_public);
    hasher.finalize().into()
}

fn seal(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Key)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = chacha20poly1305::Nonce::from_slice(&nonce_bytes);
    let sealed = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn open(key: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN {
        return Err(CryptoError::Format);
    }
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Key)?;
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce = chacha20poly1305::Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key")]
    Key,
    #[error("malformed ciphertext")]
    Format,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

/// In-memory key store.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: HashMap<Name, PrivateKey>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key_name: Name, key: PrivateKey) {
        self.keys.insert(key_name, key);
    }
}

impl KeyStore for MemoryKeyStore {
    fn resolve_private_key(&self, key_name: &Name) -> Option<&PrivateKey> {
        self.keys.get(key_name)
    }
}
