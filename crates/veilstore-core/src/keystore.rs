//! Hardware-backed key provider abstraction.
//!
//! The cursor footer at the tail of the primary container is XOR-obfuscated
//! with a stable 16-byte key that must come from outside the container
//! directory (on device: the hardware keystore). The engine only requires
//! stability; hosts plug in their platform's secure storage.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::crypto::aead;

/// Errors from key-store providers.
#[derive(Error, Debug)]
pub enum KeyStoreError {
    #[error("keystore io error: {0}")]
    Io(#[from] io::Error),
    #[error("stored key has invalid length {0}, expected 16")]
    InvalidLength(usize),
}

/// Provides the stable 16-byte footer-obfuscation key.
pub trait SecureKeyStore: Send + Sync {
    fn footer_key(&self) -> Result<[u8; 16], KeyStoreError>;
}

/// File-backed key store.
///
/// Generates the key on first access and persists it with owner-only
/// permissions. Suitable for hosts without a hardware keystore and for
/// tests; mobile hosts should implement [`SecureKeyStore`] against their
/// platform keychain instead.
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl SecureKeyStore for FileKeyStore {
    fn footer_key(&self) -> Result<[u8; 16], KeyStoreError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => {
                let key: [u8; 16] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| KeyStoreError::InvalidLength(bytes.len()))?;
                Ok(key)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let mut key = [0u8; 16];
                aead::fill_random(&mut key);
                if let Some(parent) = self.path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&self.path, key)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(
                        &self.path,
                        std::fs::Permissions::from_mode(0o600),
                    )?;
                }
                Ok(key)
            }
            Err(e) => Err(KeyStoreError::Io(e)),
        }
    }
}

impl fmt::Debug for FileKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileKeyStore")
            .field("path", &self.path)
            .finish()
    }
}

/// Fixed-key store for tests and embedding hosts that manage the key
/// themselves.
#[derive(Clone)]
pub struct StaticKeyStore(pub [u8; 16]);

impl SecureKeyStore for StaticKeyStore {
    fn footer_key(&self) -> Result<[u8; 16], KeyStoreError> {
        Ok(self.0)
    }
}

impl fmt::Debug for StaticKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StaticKeyStore").field(&"[REDACTED]").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_store_generates_then_reuses() {
        let dir = TempDir::new().unwrap();
        let store = FileKeyStore::new(dir.path().join("footer.key"));

        let first = store.footer_key().unwrap();
        let second = store.footer_key().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn file_store_rejects_wrong_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("footer.key");
        std::fs::write(&path, b"short").unwrap();

        let store = FileKeyStore::new(&path);
        assert!(matches!(
            store.footer_key(),
            Err(KeyStoreError::InvalidLength(5))
        ));
    }
}
