// SPDX-License-Identifier: MIT
//! Router key pair: current + pre-generated next, persisted to disk,
//! page-locked and zeroed in memory.

use std::fs;
use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

const PEM_HEADER: &str = "-----BEGIN HUSHROUTER X25519 PRIVATE KEY-----";
const PEM_FOOTER: &str = "-----END HUSHROUTER X25519 PRIVATE KEY-----";

/// Algorithm identifier exposed on `/api/pubkey` so clients can pick a
/// matching implementation.
pub const ALGORITHM: &str = "X25519-HKDF-SHA256-ChaCha20Poly1305";

/// One asymmetric key pair plus its lifecycle metadata.
pub struct KeyPair {
    private: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    fn generate() -> Self {
        let private = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&private);
        KeyPair { private, public }
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn private(&self) -> &StaticSecret {
        &self.private
    }

    pub(crate) fn public_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.public.as_bytes())
    }

    fn load(path: &Path) -> anyhow::Result<Self> {
        let pem = fs::read_to_string(path)?;
        let body: String = pem
            .lines()
            .filter(|l| !l.starts_with("-----"))
            .collect();
        let bytes = URL_SAFE_NO_PAD.decode(body.trim())?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("private key file is not 32 bytes"))?;
        let private = StaticSecret::from(arr);
        let public = PublicKey::from(&private);
        Ok(KeyPair { private, public })
    }

    /// Persist private key (owner-read-only) and public key (world-readable)
    /// at the configured paths.
    fn persist(&self, private_path: &Path, public_path: &Path) -> anyhow::Result<()> {
        let encoded = URL_SAFE_NO_PAD.encode(self.private.to_bytes());
        let pem = format!("{PEM_HEADER}\n{encoded}\n{PEM_FOOTER}\n");
        fs::write(private_path, pem)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(private_path, fs::Permissions::from_mode(0o600))?;
        }

        fs::write(public_path, self.public_b64())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(public_path, fs::Permissions::from_mode(0o644))?;
        }
        Ok(())
    }

    /// Page-lock the private key bytes so they are never written to swap.
    /// Best-effort: failures are logged by the caller, not fatal.
    #[cfg(unix)]
    fn mlock(&self) -> bool {
        let ptr = self.private.as_bytes().as_ptr() as *const libc::c_void;
        let len = self.private.as_bytes().len();
        // Safety: ptr/len describe the StaticSecret's own 32-byte buffer,
        // which outlives this call.
        unsafe { libc::mlock(ptr, len) == 0 }
    }

    #[cfg(not(unix))]
    fn mlock(&self) -> bool {
        false
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        let mut bytes = self.private.to_bytes();
        bytes.zeroize();
    }
}

/// Current + next router identity, rotated on a timer or on demand.
pub struct RouterKeyPair {
    pub current: KeyPair,
    pub next: KeyPair,
    pub key_id: String,
    pub expires_at: DateTime<Utc>,
    rotation_period: Duration,
    mlock_secrets: bool,
}

impl RouterKeyPair {
    /// Load from disk if present, otherwise generate and persist.
    pub fn init(
        private_path: &Path,
        public_path: &Path,
        rotation_period: Duration,
        mlock_secrets: bool,
    ) -> anyhow::Result<Self> {
        let current = if private_path.exists() {
            KeyPair::load(private_path)?
        } else {
            let generated = KeyPair::generate();
            generated.persist(private_path, public_path)?;
            generated
        };
        let next = KeyPair::generate();

        if mlock_secrets {
            current.mlock();
            next.mlock();
        }

        Ok(RouterKeyPair {
            current,
            next,
            key_id: next_key_id(),
            expires_at: Utc::now() + chrono::Duration::from_std(rotation_period)?,
            rotation_period,
            mlock_secrets,
        })
    }

    pub fn should_rotate(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Promote `next` to `current`, generate a fresh `next`, persist the
    /// new current key pair. Monotone, time-derived key id.
    pub fn rotate(&mut self, private_path: &Path, public_path: &Path) -> anyhow::Result<()> {
        let new_next = KeyPair::generate();
        if self.mlock_secrets {
            new_next.mlock();
        }
        let promoted = std::mem::replace(&mut self.next, new_next);
        self.current = promoted;
        self.current.persist(private_path, public_path)?;
        self.key_id = next_key_id();
        self.expires_at = Utc::now() + chrono::Duration::from_std(self.rotation_period)?;
        Ok(())
    }
}

/// Monotone, time-derived key id — a millisecond timestamp is sufficient
/// since rotation is never more frequent than once per second.
fn next_key_id() -> String {
    Utc::now().timestamp_millis().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_generates_and_persists_when_absent() {
        let dir = tempdir().unwrap();
        let priv_path = dir.path().join("private.pem");
        let pub_path = dir.path().join("public.pem");

        let pair = RouterKeyPair::init(&priv_path, &pub_path, Duration::from_secs(3600), false)
            .unwrap();
        assert!(priv_path.exists());
        assert!(pub_path.exists());
        assert!(!pair.should_rotate());
    }

    #[test]
    fn init_reloads_existing_private_key() {
        let dir = tempdir().unwrap();
        let priv_path = dir.path().join("private.pem");
        let pub_path = dir.path().join("public.pem");

        let first = RouterKeyPair::init(&priv_path, &pub_path, Duration::from_secs(3600), false)
            .unwrap();
        let first_public = first.current.public_b64();

        let second = RouterKeyPair::init(&priv_path, &pub_path, Duration::from_secs(3600), false)
            .unwrap();
        assert_eq!(first_public, second.current.public_b64());
    }

    #[test]
    fn rotate_promotes_next_and_regenerates() {
        let dir = tempdir().unwrap();
        let priv_path = dir.path().join("private.pem");
        let pub_path = dir.path().join("public.pem");

        let mut pair = RouterKeyPair::init(&priv_path, &pub_path, Duration::from_secs(3600), false)
            .unwrap();
        let old_next_pub = pair.next.public_b64();
        let old_key_id = pair.key_id.clone();

        pair.rotate(&priv_path, &pub_path).unwrap();

        assert_eq!(pair.current.public_b64(), old_next_pub);
        assert_ne!(pair.next.public_b64(), old_next_pub);
        assert_ne!(pair.key_id, old_key_id);
    }
}
