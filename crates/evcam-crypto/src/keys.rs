//! Symmetric key store: one 32-byte key, generated once and persisted.

use rand::RngCore;
use std::io::Write;
use std::path::Path;
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::KEY_SIZE;

/// The footage encryption key. Zeroized on drop.
#[derive(Clone)]
pub struct Key {
    bytes: [u8; KEY_SIZE],
}

impl Key {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for Key {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key").field("bytes", &"[REDACTED]").finish()
    }
}

/// Generate a random 256-bit key.
pub fn generate_key() -> Key {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    Key::from_bytes(bytes)
}

/// Load the key at `path`, generating and persisting a fresh one if absent.
///
/// The new key is written to a temporary file next to `path` and moved into
/// place without clobbering, so two processes racing on first start end up
/// sharing whichever key landed first.
pub fn load_or_create_key(path: &Path) -> CryptoResult<Key> {
    match std::fs::read(path) {
        Ok(bytes) => return key_from_file_bytes(path, bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(unavailable(path, e)),
    }

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(|e| unavailable(path, e))?;

    let key = generate_key();
    let mut tmp = tempfile::Builder::new()
        .prefix(".key-")
        .tempfile_in(parent)
        .map_err(|e| unavailable(path, e))?;
    restrict_permissions(tmp.as_file()).map_err(|e| unavailable(path, e))?;
    tmp.write_all(key.as_bytes())
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| unavailable(path, e))?;

    match tmp.persist_noclobber(path) {
        Ok(_) => {
            tracing::info!(path = %path.display(), "generated new footage key");
            Ok(key)
        }
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
            tracing::debug!(path = %path.display(), "key appeared concurrently, loading it");
            let bytes = std::fs::read(path).map_err(|e| unavailable(path, e))?;
            key_from_file_bytes(path, bytes)
        }
        Err(e) => Err(unavailable(path, e.error)),
    }
}

fn key_from_file_bytes(path: &Path, mut bytes: Vec<u8>) -> CryptoResult<Key> {
    if bytes.len() != KEY_SIZE {
        let len = bytes.len();
        bytes.zeroize();
        return Err(CryptoError::KeyUnavailable {
            path: path.to_path_buf(),
            reason: format!("key file holds {len} bytes (expected {KEY_SIZE})"),
        });
    }
    let mut key_bytes = [0u8; KEY_SIZE];
    key_bytes.copy_from_slice(&bytes);
    bytes.zeroize();
    Ok(Key::from_bytes(key_bytes))
}

fn unavailable(path: &Path, e: std::io::Error) -> CryptoError {
    CryptoError::KeyUnavailable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

#[cfg(unix)]
fn restrict_permissions(file: &std::fs::File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &std::fs::File) -> std::io::Result<()> {
    Ok(())
}
