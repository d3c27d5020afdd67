//! # Frame Encryption
//!
//! XChaCha20-Poly1305 sealing of frame payloads, keyed by the shared secret.
//!
//! ## Layout of an encrypted payload
//! ```text
//! [Nonce(24)] [Ciphertext + Tag(16)]
//! ```
//!
//! The key is SHA-256 of the shared secret. Every seal draws a fresh random
//! nonce from the OS (getrandom), so two encryptions of the same plaintext
//! differ while `open(seal(x)) == x` always holds.
//!
//! [`FrameCipher`] is the asynchronous seam used by the transport pipelines.
//! [`ChaChaCipher`] moves the actual work onto the blocking pool so large
//! frames never stall the runtime.

use crate::error::{ProtocolError, Result};
use bytes::Bytes;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use futures::future::BoxFuture;
use futures::FutureExt;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use zeroize::Zeroize;

/// Nonce length for XChaCha20-Poly1305
pub const NONCE_LEN: usize = 24;

/// Authentication tag length
pub const TAG_LEN: usize = 16;

/// Symmetric AEAD keyed by a 32-byte key.
pub struct Crypto {
    cipher: XChaCha20Poly1305,
}

impl Crypto {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Derive the key from a shared secret (password).
    pub fn from_secret(secret: &str) -> Self {
        let mut key: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
        let crypto = Self::new(&key);
        key.zeroize();
        crypto
    }

    pub fn generate_nonce() -> Result<[u8; NONCE_LEN]> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom::fill(&mut nonce).map_err(|_| ProtocolError::EncryptionFailure)?;
        Ok(nonce)
    }

    pub fn encrypt(&self, plaintext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(XNonce::from_slice(nonce), plaintext)
            .map_err(|_| ProtocolError::EncryptionFailure)
    }

    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| ProtocolError::DecryptionFailure)
    }

    /// Encrypt with a fresh nonce and prepend it.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = Self::generate_nonce()?;
        let ciphertext = self.encrypt(plaintext, &nonce)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend(ciphertext);
        nonce.zeroize();
        Ok(sealed)
    }

    /// Split off the nonce and decrypt.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(ProtocolError::DecryptionFailure);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);
        self.decrypt(ciphertext, &nonce)
    }
}

/// Asynchronous symmetric encryption of frame payloads.
///
/// Implementations may complete operations out of order; the transport
/// pipelines restore submission order.
pub trait FrameCipher: Send + Sync + 'static {
    fn encrypt(&self, plaintext: Bytes) -> BoxFuture<'static, Result<Bytes>>;
    fn decrypt(&self, ciphertext: Bytes) -> BoxFuture<'static, Result<Bytes>>;
}

/// [`FrameCipher`] backed by [`Crypto`] on the blocking thread pool.
#[derive(Clone)]
pub struct ChaChaCipher {
    crypto: Arc<Crypto>,
}

impl ChaChaCipher {
    pub fn from_secret(secret: &str) -> Self {
        Self {
            crypto: Arc::new(Crypto::from_secret(secret)),
        }
    }
}

impl FrameCipher for ChaChaCipher {
    fn encrypt(&self, plaintext: Bytes) -> BoxFuture<'static, Result<Bytes>> {
        let crypto = self.crypto.clone();
        async move {
            tokio::task::spawn_blocking(move || crypto.seal(&plaintext))
                .await
                .map_err(|_| ProtocolError::EncryptionFailure)?
                .map(Bytes::from)
        }
        .boxed()
    }

    fn decrypt(&self, ciphertext: Bytes) -> BoxFuture<'static, Result<Bytes>> {
        let crypto = self.crypto.clone();
        async move {
            tokio::task::spawn_blocking(move || crypto.open(&ciphertext))
                .await
                .map_err(|_| ProtocolError::DecryptionFailure)?
                .map(Bytes::from)
        }
        .boxed()
    }
}
