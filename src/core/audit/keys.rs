use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info, warn};

use super::signing::SigningKey;
use super::AuditError;
use crate::core::secure_fs::{
    ensure_private_dir, harden_permissions, is_owner_only, mode_of, write_private_atomic, FileLock,
};

pub const KEY_FILE: &str = "audit.key";
pub const KEY_ARCHIVE_DIR: &str = "keys";
const ARCHIVED_KEY_EXT: &str = "key";

/// Owns the active signing key file and the archive of retired keys.
#[derive(Debug, Clone)]
pub struct KeyStore {
    key_path: PathBuf,
    archive_dir: PathBuf,
}

/// Outcome of a key rotation
#[derive(Debug, Clone)]
pub struct KeyRotation {
    pub previous: Option<String>,
    pub current: SigningKey,
}

impl KeyStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            key_path: dir.join(KEY_FILE),
            archive_dir: dir.join(KEY_ARCHIVE_DIR),
        }
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// The active key, generated and persisted on first use.
    pub fn signing_key(&self) -> Result<SigningKey, AuditError> {
        if let Some(key) = self.read_active()? {
            return Ok(key);
        }

        let _lock = FileLock::acquire(&FileLock::path_for(&self.key_path))?;

        // Another process may have created it while we waited
        if let Some(key) = self.read_active()? {
            return Ok(key);
        }

        let key = SigningKey::generate();
        self.install(&key)?;
        info!(fingerprint = %key.fingerprint(), "Generated audit signing key");
        Ok(key)
    }

    /// Retire the active key into the archive and install a fresh one.
    pub fn rotate(&self) -> Result<KeyRotation, AuditError> {
        let _lock = FileLock::acquire(&FileLock::path_for(&self.key_path))?;

        let previous = match self.read_active()? {
            Some(old) => {
                self.archive(&old)?;
                Some(old.fingerprint())
            }
            None => None,
        };

        let current = SigningKey::generate();
        self.install(&current)?;

        info!(
            previous = previous.as_deref().unwrap_or("none"),
            current = %current.fingerprint(),
            "Rotated audit signing key"
        );

        Ok(KeyRotation { previous, current })
    }

    /// Active key (if any) followed by archived keys, newest first.
    pub fn key_ring(&self) -> Vec<SigningKey> {
        let mut ring = Vec::new();

        match self.read_active() {
            Ok(Some(key)) => ring.push(key),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not read active signing key"),
        }

        for key in self.archived_keys() {
            if !ring.contains(&key) {
                ring.push(key);
            }
        }

        ring
    }

    pub fn archived_keys(&self) -> Vec<SigningKey> {
        let entries = match fs::read_dir(&self.archive_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(error = %e, "Could not read signing key archive");
                return Vec::new();
            }
        };

        let mut keys: Vec<(SystemTime, SigningKey)> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == ARCHIVED_KEY_EXT))
            .filter_map(|path| {
                let bytes = fs::read(&path).ok()?;
                match SigningKey::from_bytes(&bytes) {
                    Ok(key) => {
                        let modified = fs::metadata(&path)
                            .and_then(|m| m.modified())
                            .unwrap_or(SystemTime::UNIX_EPOCH);
                        Some((modified, key))
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable archived key");
                        None
                    }
                }
            })
            .collect();

        keys.sort_by(|a, b| b.0.cmp(&a.0));
        keys.into_iter().map(|(_, key)| key).collect()
    }

    /// Permission bits of the active key file when they are looser than 0600.
    pub fn loose_mode(&self) -> Option<u32> {
        match is_owner_only(&self.key_path) {
            Ok(false) => mode_of(&self.key_path),
            _ => None,
        }
    }

    /// Re-apply owner-only mode to the active key file.
    pub fn harden(&self) -> Result<bool, AuditError> {
        Ok(harden_permissions(&self.key_path)?)
    }

    fn read_active(&self) -> Result<Option<SigningKey>, AuditError> {
        match fs::read(&self.key_path) {
            Ok(bytes) => SigningKey::from_bytes(&bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn install(&self, key: &SigningKey) -> Result<(), AuditError> {
        write_private_atomic(&self.key_path, key.as_bytes())?;
        if !harden_permissions(&self.key_path)? {
            warn!(path = %self.key_path.display(), "Signing key permissions could not be restricted");
        }
        Ok(())
    }

    fn archive(&self, key: &SigningKey) -> Result<(), AuditError> {
        ensure_private_dir(&self.archive_dir)?;
        let path = self
            .archive_dir
            .join(format!("{}.{}", key.fingerprint(), ARCHIVED_KEY_EXT));
        write_private_atomic(&path, key.as_bytes())?;
        harden_permissions(&path)?;
        debug!(path = %path.display(), "Archived signing key");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_key_created_once() {
        let dir = tempdir().unwrap();
        let store = KeyStore::new(dir.path());

        let first = store.signing_key().unwrap();
        let second = store.signing_key().unwrap();

        assert_eq!(first, second);
        assert_eq!(fs::read(store.key_path()).unwrap().len(), 32);
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_private() {
        let dir = tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        store.signing_key().unwrap();
        assert_eq!(mode_of(store.key_path()), Some(0o600));
        assert!(store.loose_mode().is_none());
    }

    #[test]
    fn test_rotation_archives_previous_key() {
        let dir = tempdir().unwrap();
        let store = KeyStore::new(dir.path());

        let original = store.signing_key().unwrap();
        let rotation = store.rotate().unwrap();

        assert_eq!(rotation.previous, Some(original.fingerprint()));
        assert_ne!(rotation.current, original);
        assert_eq!(store.signing_key().unwrap(), rotation.current);

        let ring = store.key_ring();
        assert_eq!(ring.len(), 2);
        assert_eq!(ring[0], rotation.current);
        assert!(ring.contains(&original));
    }

    #[test]
    fn test_corrupt_key_is_an_error() {
        let dir = tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        fs::write(store.key_path(), b"short").unwrap();

        assert!(matches!(
            store.signing_key(),
            Err(AuditError::InvalidKey { len: 5 })
        ));
    }
}
