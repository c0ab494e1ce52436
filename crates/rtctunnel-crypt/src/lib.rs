//! Keypairs and authenticated box encryption for rtctunnel
//!
//! Every endpoint is identified by a long-term x25519 keypair. Messages are
//! sealed to a recipient's public key so that the recipient can both decrypt
//! the payload and authenticate the sender:
//! - key: SHA-256 of the x25519 shared secret between sender and recipient
//! - box: `sender_pub(32) || nonce(12) || chacha20poly1305 ciphertext`
//! - AAD: `sender_pub || recipient_pub` (binds both identities to the box)
//!
//! Public keys render as base58 strings, which is the form used for rendezvous
//! room/client ids.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use x25519_dalek::StaticSecret;

/// Size of a public key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of an AEAD nonce in bytes
const NONCE_SIZE: usize = 12;

/// Errors from key parsing and box operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptError {
    #[error("invalid public key")]
    InvalidKey,
    #[error("malformed box")]
    Malformed,
    #[error("decryption failed")]
    DecryptionFailed,
}

/// A 32-byte x25519 public key
///
/// Comparable and hashable so it can be used as a map key. The `Display` form
/// is base58 and round-trips through `FromStr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl FromStr for PublicKey {
    type Err = CryptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|_| CryptError::InvalidKey)?;
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| CryptError::InvalidKey)?;
        Ok(Self(bytes))
    }
}

/// An x25519 private key
///
/// Can derive its public key, seal a box to a remote public key, and open a
/// box addressed to it, returning the authenticated sender.
#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    /// Generate a fresh keypair from the system RNG.
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// The public half of this keypair.
    pub fn public(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0).to_bytes())
    }

    /// Seal `plaintext` to `remote` so that only `remote` can open it, and so
    /// that `remote` learns this key's public half as the authenticated sender.
    pub fn encrypt(&self, remote: &PublicKey, plaintext: &[u8]) -> Vec<u8> {
        let sender = self.public();
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.box_key(remote)));

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let aad = box_aad(&sender, remote);
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .expect("chacha20poly1305 encryption is infallible for in-memory buffers");

        let mut out = Vec::with_capacity(KEY_SIZE + NONCE_SIZE + sealed.len());
        out.extend_from_slice(sender.as_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        out
    }

    /// Open a box addressed to this key. Returns the authenticated sender and
    /// the plaintext, or an error if the box is malformed or does not verify.
    pub fn decrypt(&self, sealed: &[u8]) -> Result<(PublicKey, Vec<u8>), CryptError> {
        if sealed.len() < KEY_SIZE + NONCE_SIZE {
            return Err(CryptError::Malformed);
        }

        let mut sender_bytes = [0u8; KEY_SIZE];
        sender_bytes.copy_from_slice(&sealed[..KEY_SIZE]);
        let sender = PublicKey(sender_bytes);
        let nonce = &sealed[KEY_SIZE..KEY_SIZE + NONCE_SIZE];
        let ciphertext = &sealed[KEY_SIZE + NONCE_SIZE..];

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.box_key(&sender)));
        let aad = box_aad(&sender, &self.public());
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptError::DecryptionFailed)?;

        Ok((sender, plaintext))
    }

    /// Symmetric AEAD key for the (self, other) pair: SHA-256 of the x25519
    /// shared secret. Both directions of a pair derive the same key.
    fn box_key(&self, other: &PublicKey) -> [u8; KEY_SIZE] {
        let shared = self
            .0
            .diffie_hellman(&x25519_dalek::PublicKey::from(*other.as_bytes()));
        Sha256::digest(shared.as_bytes()).into()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never print the secret scalar
        f.debug_tuple("PrivateKey").field(&self.public()).finish()
    }
}

fn box_aad(sender: &PublicKey, recipient: &PublicKey) -> [u8; KEY_SIZE * 2] {
    let mut aad = [0u8; KEY_SIZE * 2];
    aad[..KEY_SIZE].copy_from_slice(sender.as_bytes());
    aad[KEY_SIZE..].copy_from_slice(recipient.as_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_roundtrip() {
        let k1 = PrivateKey::generate();
        let k2 = PrivateKey::generate();

        let sealed = k1.encrypt(&k2.public(), b"HELLO WORLD");
        let (sender, plaintext) = k2.decrypt(&sealed).unwrap();

        assert_eq!(sender, k1.public());
        assert_eq!(plaintext, b"HELLO WORLD");
    }

    #[test]
    fn test_box_rejects_tampering() {
        let k1 = PrivateKey::generate();
        let k2 = PrivateKey::generate();

        let sealed = k1.encrypt(&k2.public(), b"payload");
        for i in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[i] ^= 0x01;
            assert!(k2.decrypt(&tampered).is_err(), "byte {} accepted", i);
        }
    }

    #[test]
    fn test_box_wrong_recipient() {
        let k1 = PrivateKey::generate();
        let k2 = PrivateKey::generate();
        let k3 = PrivateKey::generate();

        let sealed = k1.encrypt(&k2.public(), b"for k2 only");
        assert_eq!(k3.decrypt(&sealed), Err(CryptError::DecryptionFailed));
    }

    #[test]
    fn test_box_too_short() {
        let k1 = PrivateKey::generate();
        assert_eq!(k1.decrypt(&[0u8; 10]), Err(CryptError::Malformed));
    }

    #[test]
    fn test_public_key_base58_roundtrip() {
        let k = PrivateKey::generate();
        let text = k.public().to_string();
        let parsed: PublicKey = text.parse().unwrap();
        assert_eq!(parsed, k.public());
    }

    #[test]
    fn test_public_key_rejects_garbage() {
        assert!("not base58 !!!".parse::<PublicKey>().is_err());
        // valid base58, wrong length
        assert!("3mJr7AoUXx2Wqd".parse::<PublicKey>().is_err());
    }
}
