use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use keyring::Entry;
use tempfile::NamedTempFile;

/// A failed keyring call. Transient failures (a locked or unreachable
/// secret service) may succeed on retry; anything else will not.
#[derive(Debug)]
pub struct KeyringAccessError {
    source: keyring::Error,
    transient: bool,
}

impl KeyringAccessError {
    pub fn is_recoverable(&self) -> bool {
        self.transient
    }
}

impl From<keyring::Error> for KeyringAccessError {
    fn from(source: keyring::Error) -> Self {
        let transient = matches!(
            source,
            keyring::Error::PlatformFailure(_) | keyring::Error::NoStorageAccess(_)
        );
        Self { source, transient }
    }
}

impl fmt::Display for KeyringAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.source, f)
    }
}

impl Error for KeyringAccessError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

/// Failures raised by vault writes. Reads never surface these to callers.
#[derive(Debug)]
pub enum VaultError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Keyring(KeyringAccessError),
    Entropy(getrandom::Error),
}

impl fmt::Display for VaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VaultError::Io { path, source } => {
                write!(f, "vault storage at {} failed: {}", path.display(), source)
            }
            VaultError::Keyring(err) => write!(f, "keyring unavailable: {err}"),
            VaultError::Entropy(err) => write!(f, "no randomness for vault nonce: {err}"),
        }
    }
}

impl Error for VaultError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            VaultError::Io { source, .. } => Some(source),
            VaultError::Keyring(err) => Some(err),
            VaultError::Entropy(_) => None,
        }
    }
}

impl VaultError {
    /// Whether the same operation may succeed if tried again later.
    pub fn is_recoverable(&self) -> bool {
        match self {
            VaultError::Io { source, .. } => matches!(
                source.kind(),
                ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
            ),
            VaultError::Keyring(err) => err.is_recoverable(),
            VaultError::Entropy(_) => false,
        }
    }
}

impl From<KeyringAccessError> for VaultError {
    fn from(err: KeyringAccessError) -> Self {
        VaultError::Keyring(err)
    }
}

/// Persistent slot storage for vault ciphertext.
///
/// Access is synchronous. Implementations hold opaque strings and never see
/// plaintext.
pub trait VaultStorage: Send + Sync {
    fn read(&self, slot: &str) -> Result<Option<String>, VaultError>;
    fn write(&self, slot: &str, value: &str) -> Result<(), VaultError>;
    fn remove(&self, slot: &str) -> Result<(), VaultError>;
}

impl<T: VaultStorage + ?Sized> VaultStorage for Box<T> {
    fn read(&self, slot: &str) -> Result<Option<String>, VaultError> {
        (**self).read(slot)
    }

    fn write(&self, slot: &str, value: &str) -> Result<(), VaultError> {
        (**self).write(slot, value)
    }

    fn remove(&self, slot: &str) -> Result<(), VaultError> {
        (**self).remove(slot)
    }
}

/// In-process storage. Clones share the same slots.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    slots: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored value, for inspection in tests and diagnostics.
    pub fn raw(&self, slot: &str) -> Option<String> {
        self.slots().get(slot).cloned()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl VaultStorage for MemoryStorage {
    fn read(&self, slot: &str) -> Result<Option<String>, VaultError> {
        Ok(self.raw(slot))
    }

    fn write(&self, slot: &str, value: &str) -> Result<(), VaultError> {
        self.slots().insert(slot.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, slot: &str) -> Result<(), VaultError> {
        self.slots().remove(slot);
        Ok(())
    }
}

/// One file per slot under a directory; writes go through a temp file and an
/// atomic rename so readers never observe a partial envelope.
#[derive(Clone, Debug)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn slot_path(&self, slot: &str) -> PathBuf {
        let file_name: String = slot
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{file_name}.vault"))
    }

    fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> VaultError + '_ {
        move |source| VaultError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl VaultStorage for FileStorage {
    fn read(&self, slot: &str) -> Result<Option<String>, VaultError> {
        let path = self.slot_path(slot);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(VaultError::Io { path, source }),
        }
    }

    fn write(&self, slot: &str, value: &str) -> Result<(), VaultError> {
        let path = self.slot_path(slot);
        fs::create_dir_all(&self.dir).map_err(Self::io_error(&self.dir))?;

        let mut temp_file = NamedTempFile::new_in(&self.dir).map_err(Self::io_error(&path))?;
        temp_file
            .write_all(value.as_bytes())
            .map_err(Self::io_error(&path))?;
        temp_file
            .as_file_mut()
            .sync_all()
            .map_err(Self::io_error(&path))?;
        temp_file
            .persist(&path)
            .map_err(|err| VaultError::Io {
                path: path.clone(),
                source: err.error,
            })?;
        Ok(())
    }

    fn remove(&self, slot: &str) -> Result<(), VaultError> {
        let path = self.slot_path(slot);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(VaultError::Io { path, source }),
        }
    }
}

/// Stores the envelope in the platform keyring under `service`.
#[derive(Clone, Debug)]
pub struct KeyringStorage {
    service: String,
}

impl KeyringStorage {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, slot: &str) -> Result<Entry, VaultError> {
        Entry::new(&self.service, slot).map_err(|err| KeyringAccessError::from(err).into())
    }
}

impl VaultStorage for KeyringStorage {
    fn read(&self, slot: &str) -> Result<Option<String>, VaultError> {
        match self.entry(slot)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(KeyringAccessError::from(err).into()),
        }
    }

    fn write(&self, slot: &str, value: &str) -> Result<(), VaultError> {
        self.entry(slot)?
            .set_password(value)
            .map_err(|err| KeyringAccessError::from(err).into())
    }

    fn remove(&self, slot: &str) -> Result<(), VaultError> {
        match self.entry(slot)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(KeyringAccessError::from(err).into()),
        }
    }
}
