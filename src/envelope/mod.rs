// SPDX-License-Identifier: MIT
//! The envelope service: decrypt client requests, encrypt stream
//! chunks, rotate/persist the router key pair, enforce the replay window.

pub mod crypto;
pub mod keypair;
pub mod replay;

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use tokio::sync::RwLock;
use x25519_dalek::PublicKey;

use crate::errors::EnvelopeError;
use crate::models::{ChatPayload, EncryptedChunk, EncryptedEnvelope, PubkeyResponse};
use keypair::RouterKeyPair;
use replay::ReplayLedger;

pub struct EnvelopeService {
    keys: RwLock<RouterKeyPair>,
    ledger: Mutex<ReplayLedger>,
    private_key_path: PathBuf,
    public_key_path: PathBuf,
    request_ttl: Duration,
    clock_skew: Duration,
}

impl EnvelopeService {
    pub fn new(
        private_key_path: PathBuf,
        public_key_path: PathBuf,
        rotation_period: Duration,
        mlock_secrets: bool,
        request_ttl: Duration,
        clock_skew: Duration,
        replay_retention: Duration,
    ) -> anyhow::Result<Self> {
        let keys = RouterKeyPair::init(
            &private_key_path,
            &public_key_path,
            rotation_period,
            mlock_secrets,
        )?;
        Ok(EnvelopeService {
            keys: RwLock::new(keys),
            ledger: Mutex::new(ReplayLedger::new(replay_retention)),
            private_key_path,
            public_key_path,
            request_ttl,
            clock_skew,
        })
    }

    /// Step order: replay/timestamp check, record, evict, open hybrid
    /// context, AEAD-decrypt, parse + clamp.
    pub async fn decrypt_request(
        &self,
        envelope: &EncryptedEnvelope,
    ) -> Result<ChatPayload, EnvelopeError> {
        let now = Utc::now();
        let age = now.signed_duration_since(envelope.timestamp);
        if age > chrono::Duration::from_std(self.request_ttl).unwrap_or(chrono::Duration::MAX) {
            return Err(EnvelopeError::ReplayRejected);
        }
        if -age > chrono::Duration::from_std(self.clock_skew).unwrap_or(chrono::Duration::MAX) {
            return Err(EnvelopeError::ReplayRejected);
        }

        {
            let ledger = self.ledger.lock().expect("replay ledger mutex poisoned");
            if ledger.contains(&envelope.request_id) {
                return Err(EnvelopeError::ReplayRejected);
            }
        }
        {
            let mut ledger = self.ledger.lock().expect("replay ledger mutex poisoned");
            ledger.record(&envelope.request_id);
        }

        let encapsulated_key = decode_pubkey(&envelope.encapsulated_key)
            .map_err(|_| EnvelopeError::DecryptFailed)?;
        let ciphertext = URL_SAFE_NO_PAD
            .decode(&envelope.ciphertext)
            .map_err(|_| EnvelopeError::DecryptFailed)?;
        let aad = URL_SAFE_NO_PAD
            .decode(&envelope.aad)
            .map_err(|_| EnvelopeError::DecryptFailed)?;

        // Read lock only: rotation swaps the `current`/`next` fields under a
        // short write lock, so an in-flight decrypt here always observes one
        // complete, consistent pair.
        let keys = self.keys.read().await;
        let plaintext = crypto::open(keys.current.private(), &encapsulated_key, &ciphertext, &aad)
            .map_err(|_| EnvelopeError::DecryptFailed)?;
        drop(keys);

        let payload: ChatPayload =
            serde_json::from_slice(&plaintext).map_err(|_| EnvelopeError::SchemaInvalid)?;
        Ok(payload.clamp())
    }

    /// Binds `sequence` into the AAD so chunks cannot be reordered or
    /// replayed against another sequence number.
    pub async fn encrypt_chunk(
        &self,
        plaintext: &[u8],
        recipient_pubkey: &PublicKey,
        request_id: &str,
        sequence: u64,
    ) -> EncryptedChunk {
        let aad = crypto::chunk_aad(request_id, sequence);
        let sealed = crypto::seal(recipient_pubkey, plaintext, &aad);
        EncryptedChunk {
            encapsulated_key: URL_SAFE_NO_PAD.encode(sealed.encapsulated_key.as_bytes()),
            ciphertext: URL_SAFE_NO_PAD.encode(sealed.ciphertext),
            aad: URL_SAFE_NO_PAD.encode(aad),
            sequence,
        }
    }

    /// Pure observation.
    pub async fn public_keys(&self) -> PubkeyResponse {
        let keys = self.keys.read().await;
        PubkeyResponse {
            current_pubkey: URL_SAFE_NO_PAD.encode(keys.current.public().as_bytes()),
            next_pubkey: URL_SAFE_NO_PAD.encode(keys.next.public().as_bytes()),
            key_id: keys.key_id.clone(),
            expires_at: keys.expires_at,
            algorithm: keypair::ALGORITHM.to_string(),
        }
    }

    /// Briefly takes the write lock to swap; in-flight
    /// readers that already cloned/borrowed the previous pair finish
    /// normally because the swap only replaces the struct fields, it does
    /// not invalidate memory a reader is mid-use of.
    pub async fn rotate_keys(&self) -> anyhow::Result<()> {
        let mut keys = self.keys.write().await;
        keys.rotate(&self.private_key_path, &self.public_key_path)
    }

    pub async fn should_rotate(&self) -> bool {
        self.keys.read().await.should_rotate()
    }
}

fn decode_pubkey(b64: &str) -> anyhow::Result<PublicKey> {
    let bytes = URL_SAFE_NO_PAD.decode(b64)?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("public key is not 32 bytes"))?;
    Ok(PublicKey::from(arr))
}
