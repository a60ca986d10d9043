//! Owner-only file helpers shared by the rate limiter and the audit log.
//!
//! State and key files are committed by writing a temp file in the same
//! directory, syncing it and renaming it over the target, so a crash never
//! leaves a half-written file behind. Read-modify-write cycles run under an
//! exclusive advisory lock on a sibling `.lock` file.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

pub const PRIVATE_FILE_MODE: u32 = 0o600;
pub const PRIVATE_DIR_MODE: u32 = 0o700;

/// Create `dir` (and parents) if missing; a newly created leaf gets mode 0700.
pub fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }

    fs::create_dir_all(dir)?;
    set_mode(dir, PRIVATE_DIR_MODE)
}

/// Atomically replace `path` with `bytes`.
pub fn write_private_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = parent_dir(path);
    ensure_private_dir(&dir)?;

    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    Ok(())
}

/// Open `path` for appending, creating it owner-only if needed.
pub fn open_private_append(path: &Path) -> io::Result<File> {
    ensure_private_dir(&parent_dir(path))?;

    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(PRIVATE_FILE_MODE);
    }
    options.open(path)
}

/// chmod 0600, then read the mode back. `Ok(false)` means the mode didn't stick.
pub fn harden_permissions(path: &Path) -> io::Result<bool> {
    set_mode(path, PRIVATE_FILE_MODE)?;
    let hardened = is_owner_only(path)?;
    debug!(path = %path.display(), hardened, "Hardened file permissions");
    Ok(hardened)
}

/// True when neither group nor others have any access bits.
#[cfg(unix)]
pub fn is_owner_only(path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(path)?.permissions().mode();
    Ok(mode & 0o077 == 0)
}

#[cfg(not(unix))]
pub fn is_owner_only(path: &Path) -> io::Result<bool> {
    fs::metadata(path).map(|_| true)
}

/// Current permission bits, for diagnostics.
#[cfg(unix)]
pub fn mode_of(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).ok().map(|m| m.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
pub fn mode_of(_path: &Path) -> Option<u32> {
    None
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Exclusive advisory lock held for the guard's lifetime.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the lock on `path` is ours.
    pub fn acquire(path: &Path) -> io::Result<Self> {
        let file = open_private_append(path)?;
        FileExt::lock_exclusive(&file)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Lock file guarding `target`: same directory, `.lock` appended.
    pub fn path_for(target: &Path) -> PathBuf {
        let mut name = target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        target.with_file_name(name)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
