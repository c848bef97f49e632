//! HPKE-style seal/open: X25519 KEM, HKDF-SHA256, ChaCha20-Poly1305 AEAD.
//!
//! Every call generates or consumes one single-shot message: a fresh
//! ephemeral key is encapsulated per call on the sealing side, so the shared
//! secret (and therefore the derived AEAD key) is unique per message. This
//! is what makes a fixed all-zero nonce safe here — there is never a second
//! message under the same derived key to create a nonce-reuse collision.
//! This is the real recipient-bound seal the router's chunk encryption
//! requires.

use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use hkdf::Hkdf;
use rand_core::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret};

const HKDF_INFO: &[u8] = b"hushrouter-hpke-v1";
const ZERO_NONCE: [u8; 12] = [0u8; 12];

/// Output of [`seal`]: the sender's encapsulated (ephemeral) public key and
/// the AEAD ciphertext (tag included).
pub struct SealedMessage {
    pub encapsulated_key: PublicKey,
    pub ciphertext: Vec<u8>,
}

fn derive_key(shared_secret: &SharedSecret) -> Key {
    let hk = Hkdf::<Sha256>::new(None, shared_secret.as_bytes());
    let mut okm = [0u8; 32];
    hk.expand(HKDF_INFO, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    *Key::from_slice(&okm)
}

/// Seal `plaintext` to `recipient_pubkey`, binding `aad`.
pub fn seal(recipient_pubkey: &PublicKey, plaintext: &[u8], aad: &[u8]) -> SealedMessage {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let encapsulated_key = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient_pubkey);
    let key = derive_key(&shared);
    let cipher = ChaCha20Poly1305::new(&key);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&ZERO_NONCE),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .expect("AEAD seal under a freshly-derived key cannot fail");
    SealedMessage {
        encapsulated_key,
        ciphertext,
    }
}

/// Open a message sealed to `router_private`'s matching public key.
pub fn open(
    router_private: &StaticSecret,
    encapsulated_key: &PublicKey,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, ()> {
    let shared = router_private.diffie_hellman(encapsulated_key);
    let key = derive_key(&shared);
    let cipher = ChaCha20Poly1305::new(&key);
    cipher
        .decrypt(
            Nonce::from_slice(&ZERO_NONCE),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| ())
}

/// Canonical AAD for a stream chunk: binds ciphertext to its sequence number
/// and the request it belongs to.
pub fn chunk_aad(request_id: &str, sequence: u64) -> Vec<u8> {
    format!("hushrouter-chunk:{request_id}:{sequence}").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng as TestRng;

    #[test]
    fn round_trips_through_seal_and_open() {
        let recipient_private = StaticSecret::random_from_rng(TestRng);
        let recipient_public = PublicKey::from(&recipient_private);

        let aad = chunk_aad("req-1", 3);
        let sealed = seal(&recipient_public, b"hello", &aad);
        let opened = open(
            &recipient_private,
            &sealed.encapsulated_key,
            &sealed.ciphertext,
            &aad,
        )
        .unwrap();

        assert_eq!(opened, b"hello");
    }

    #[test]
    fn rejects_tampered_aad() {
        let recipient_private = StaticSecret::random_from_rng(TestRng);
        let recipient_public = PublicKey::from(&recipient_private);

        let sealed = seal(&recipient_public, b"hello", &chunk_aad("req-1", 0));
        let result = open(
            &recipient_private,
            &sealed.encapsulated_key,
            &sealed.ciphertext,
            &chunk_aad("req-1", 1),
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_wrong_recipient() {
        let recipient_private = StaticSecret::random_from_rng(TestRng);
        let recipient_public = PublicKey::from(&recipient_private);
        let other_private = StaticSecret::random_from_rng(TestRng);

        let aad = chunk_aad("req-1", 0);
        let sealed = seal(&recipient_public, b"hello", &aad);
        let result = open(&other_private, &sealed.encapsulated_key, &sealed.ciphertext, &aad);
        assert!(result.is_err());
    }
}
