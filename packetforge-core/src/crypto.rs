//! X25519 key agreement and ChaCha20-Poly1305 AEAD transport encryption.
//!
//! Shared secret derivation is `SHA256(X25519(local_secret, peer_public))` —
//! the scalar-mult output is never used directly as a symmetric key. Nonces
//! are derived from a caller-supplied monotonic counter rather than sampled,
//! so both ends of a connection must agree on who owns which counter.
use crate::error::CryptoError;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

/// Length of a derived symmetric key and of an X25519 public/private key.
pub const KEY_SIZE: usize = 32;
/// Length of the AEAD nonce.
pub const NONCE_SIZE: usize = 12;

/// An X25519 keypair generated for one handshake attempt. Kept around in
/// connection metadata between `StartHandshake` and `CompleteHandshake`.
pub struct HandshakeKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl HandshakeKeypair {
    /// Generates a fresh keypair from the OS RNG.
    pub fn generate() -> HandshakeKeypair {
        let secret = StaticSecret::random_from_rng(rand_core::OsRng);
        let public = PublicKey::from(&secret);
        HandshakeKeypair { secret, public }
    }

    #[inline]
    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Computes `SHA256(X25519(self.secret, peer_public))`.
    pub fn derive_shared_key(&self, peer_public: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
        let peer = PublicKey::from(*peer_public);
        let shared = self.secret.diffie_hellman(&peer);

        let mut hasher = Sha256::new();
        hasher.update(shared.as_bytes());
        hasher.finalize().into()
    }
}

fn nonce_from_counter(counter: u64) -> Nonce {
    let mut bytes = [0u8; NONCE_SIZE];
    bytes[NONCE_SIZE - 8..].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(bytes)
}

/// Seals `plaintext` under `key`, using `counter` to derive the nonce.
/// The returned buffer is `ciphertext ‖ 16-byte tag`.
pub fn encrypt(key: &[u8; KEY_SIZE], counter: u64, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = nonce_from_counter(counter);
    cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::SealFailed)
}

/// Opens a buffer produced by [`encrypt`] under the same `key`/`counter`.
pub fn decrypt(key: &[u8; KEY_SIZE], counter: u64, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = nonce_from_counter(counter);
    cipher
        .decrypt(&nonce, sealed)
        .map_err(|_| CryptoError::SealFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_derives_matching_shared_key() {
        let server = HandshakeKeypair::generate();
        let client = HandshakeKeypair::generate();

        let server_key = server.derive_shared_key(&client.public_bytes());
        let client_key = client.derive_shared_key(&server.public_bytes());

        assert_eq!(server_key, client_key);
    }

    #[test]
    fn different_peers_derive_different_keys() {
        let server = HandshakeKeypair::generate();
        let client_a = HandshakeKeypair::generate();
        let client_b = HandshakeKeypair::generate();

        let key_a = server.derive_shared_key(&client_a.public_bytes());
        let key_b = server.derive_shared_key(&client_b.public_bytes());

        assert_ne!(key_a, key_b);
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = [7u8; KEY_SIZE];
        let sealed = encrypt(&key, 1, b"hello").unwrap();
        let opened = decrypt(&key, 1, &sealed).unwrap();
        assert_eq!(opened, b"hello");
    }

    #[test]
    fn decrypt_rejects_wrong_counter() {
        let key = [7u8; KEY_SIZE];
        let sealed = encrypt(&key, 1, b"hello").unwrap();
        assert!(decrypt(&key, 2, &sealed).is_err());
    }

    #[test]
    fn decrypt_rejects_tampered_ciphertext() {
        let key = [7u8; KEY_SIZE];
        let mut sealed = encrypt(&key, 1, b"hello").unwrap();
        sealed[0] ^= 0xFF;
        assert!(decrypt(&key, 1, &sealed).is_err());
    }
}
