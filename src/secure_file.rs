//! Owner-only file writes
//!
//! Node configuration and rendered daemon configs carry passphrases, so they
//! are written with restrictive permissions and replaced atomically.

use crate::error::MeshResult;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;
use tracing::debug;

/// Mode used for every file meshctl persists
pub const PRIVATE_MODE: u32 = 0o600;

/// Write `content` to `path` via a temp file in the same directory and rename
///
/// Readers never observe a half-written file, and the final file has `mode`
/// even if an older copy existed with looser permissions.
pub fn write_secure(path: &Path, content: &str, mode: u32) -> MeshResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "meshctl".to_string());
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }

    // mode() is masked by umask and ignored for pre-existing files
    fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))?;
    fs::rename(&tmp, path)?;

    debug!("Wrote {:?} with permissions {:o}", path, mode);
    Ok(())
}

/// Permission bits of an existing file
pub fn file_mode(path: &Path) -> MeshResult<u32> {
    Ok(fs::metadata(path)?.permissions().mode() & 0o777)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("secret.conf");

        write_secure(&path, "wpa_passphrase=hunter22\n", PRIVATE_MODE).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "wpa_passphrase=hunter22\n");
        assert_eq!(file_mode(&path).unwrap(), 0o600);
    }

    #[test]
    fn tightens_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        fs::write(&path, "old").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        write_secure(&path, "new", PRIVATE_MODE).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
        assert_eq!(file_mode(&path).unwrap(), 0o600);
        assert!(!dir.path().join(".node.toml.tmp").exists());
    }
}
