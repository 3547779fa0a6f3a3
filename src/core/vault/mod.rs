//! Local encrypted store for the provider API key.
//!
//! The vault keeps exactly one secret per user. The encryption key is derived
//! on every access from the user id and a [`DeviceFingerprint`] and is never
//! written anywhere, so the same user on the same device reads back what they
//! stored while a different user or device gets `None`.
//!
//! This deters casual inspection of the storage backend. It does not protect
//! against anyone who can run code as the same user: the fingerprint inputs
//! are public-ish environment attributes and the key can simply be re-derived.

pub mod cipher;
mod digest;
pub mod storage;

use tracing::{debug, warn};

use self::digest::Sha256;

pub use cipher::VaultKey;
pub use storage::{FileStorage, KeyringAccessError, KeyringStorage, MemoryStorage, VaultError, VaultStorage};

const KEY_DOMAIN: &[u8] = b"uru-vault-key-v1";
const SLOT_PREFIX: &str = "api-key";
const FIELD_SEPARATOR: &[u8] = b"\x1f";

/// Stable attributes of the current device/profile, hashed into the vault key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceFingerprint {
    pub locale: String,
    pub platform: String,
    pub host: String,
    pub profile: String,
}

impl DeviceFingerprint {
    pub fn new(
        locale: impl Into<String>,
        platform: impl Into<String>,
        host: impl Into<String>,
        profile: impl Into<String>,
    ) -> Self {
        Self {
            locale: locale.into(),
            platform: platform.into(),
            host: host.into(),
            profile: profile.into(),
        }
    }

    /// Collect the fingerprint of the running environment.
    pub fn detect() -> Self {
        let locale = ["LC_ALL", "LANG"]
            .iter()
            .find_map(|name| std::env::var(name).ok().filter(|value| !value.is_empty()))
            .unwrap_or_else(|| "C".to_string());
        let platform = format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH);
        let host = ["HOSTNAME", "COMPUTERNAME"]
            .iter()
            .find_map(|name| std::env::var(name).ok().filter(|value| !value.is_empty()))
            .unwrap_or_default();
        let profile = directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().display().to_string())
            .unwrap_or_default();
        Self::new(locale, platform, host, profile)
    }

    fn digest(&self) -> [u8; 32] {
        let fields = [&self.locale, &self.platform, &self.host, &self.profile];
        let mut hasher = Sha256::new();
        for (index, field) in fields.into_iter().enumerate() {
            if index > 0 {
                hasher = hasher.update(FIELD_SEPARATOR);
            }
            hasher = hasher.update(field.as_bytes());
        }
        hasher.finalize()
    }
}

/// Deterministically derive the vault key for `user_id` on `fingerprint`.
pub fn derive_key(user_id: &str, fingerprint: &DeviceFingerprint) -> VaultKey {
    let key = Sha256::new()
        .update(KEY_DOMAIN)
        .update(&[0])
        .update(user_id.as_bytes())
        .update(&[0])
        .update(&fingerprint.digest())
        .finalize();
    VaultKey(key)
}

/// Credential vault over an injected storage backend.
pub struct VaultService<S> {
    storage: S,
    user_id: String,
    fingerprint: DeviceFingerprint,
}

impl<S: VaultStorage> VaultService<S> {
    pub fn new(storage: S, user_id: impl Into<String>, fingerprint: DeviceFingerprint) -> Self {
        Self {
            storage,
            user_id: user_id.into(),
            fingerprint,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    // One slot per user so several users can share a backend.
    fn slot(&self) -> String {
        format!("{SLOT_PREFIX}:{}", self.user_id)
    }

    /// Encrypt and persist `secret`, replacing any previous value.
    pub fn store(&self, secret: &str) -> Result<(), VaultError> {
        let key = derive_key(&self.user_id, &self.fingerprint);
        let envelope = cipher::seal(&key, secret).map_err(VaultError::Entropy)?;
        self.storage.write(&self.slot(), &envelope)?;
        debug!(user = %self.user_id, "credential stored");
        Ok(())
    }

    /// Decrypt the stored secret.
    ///
    /// Missing ciphertext, unreadable storage, a key mismatch and malformed
    /// plaintext all yield `None`.
    pub fn retrieve(&self) -> Option<String> {
        let envelope = match self.storage.read(&self.slot()) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return None,
            Err(err) => {
                warn!(user = %self.user_id, error = %err, "vault storage unreadable");
                return None;
            }
        };
        let key = derive_key(&self.user_id, &self.fingerprint);
        let secret = cipher::open(&key, &envelope);
        if secret.is_none() {
            debug!(user = %self.user_id, "stored credential did not decrypt for this user/device");
        }
        secret
    }

    pub fn has_credential(&self) -> bool {
        self.retrieve().is_some()
    }

    /// Like [`has_credential`](Self::has_credential), but a storage failure
    /// is returned instead of being read as "nothing stored".
    pub fn check(&self) -> Result<bool, VaultError> {
        let Some(envelope) = self.storage.read(&self.slot())? else {
            return Ok(false);
        };
        let key = derive_key(&self.user_id, &self.fingerprint);
        Ok(cipher::open(&key, &envelope).is_some())
    }

    pub fn clear(&self) -> Result<(), VaultError> {
        self.storage.remove(&self.slot())?;
        debug!(user = %self.user_id, "credential cleared");
        Ok(())
    }
}
