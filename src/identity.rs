//! Identity files: the decimal pid of a supervised process, stored in a
//! directory that the OS clears on reboot so a stale pid can never be taken
//! for a survivor.

use std::ffi::CString;
use std::fs::{self, DirBuilder};
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use nix::unistd::{access, getuid, AccessFlags};
use sha2::{Digest, Sha256};

use crate::errors::WardenError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityFile {
    path: PathBuf,
}

impl IdentityFile {
    pub fn for_slot(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(format!("pgwarden-{name}.pid")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Returns the recorded pid. A missing, empty or unparsable file reads as `None`.
    pub fn read(&self) -> Result<Option<i32>, WardenError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(content
            .trim()
            .parse::<i32>()
            .ok()
            .filter(|pid| *pid > 0))
    }

    pub fn write(&self, pid: i32) -> Result<(), WardenError> {
        fs::write(&self.path, pid.to_string())?;
        Ok(())
    }

    pub fn remove(&self) -> Result<(), WardenError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Creates the identity directory if needed and checks we can write to it.
    pub fn ensure_writable_dir(&self) -> Result<(), WardenError> {
        let Some(dir) = self.path.parent() else {
            return Err(WardenError::Environment(format!(
                "identity path {} has no parent directory",
                self.path.display()
            )));
        };
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .map_err(|err| {
                WardenError::Environment(format!("cannot create {}: {err}", dir.display()))
            })?;
        access(dir, AccessFlags::W_OK).map_err(|err| {
            WardenError::Environment(format!("{} is not writable: {err}", dir.display()))
        })
    }

    /// Path as a C string, prepared before fork so the child never allocates.
    pub fn c_path(&self) -> Result<CString, WardenError> {
        CString::new(self.path.as_os_str().as_bytes()).map_err(|_| {
            WardenError::InvalidArgument(format!(
                "identity path {} contains a NUL byte",
                self.path.display()
            ))
        })
    }
}

/// Reboot-cleared location for the identity files of one home directory:
/// under `/dev/shm` where present, otherwise the per-user runtime dir,
/// otherwise the temp dir.
pub fn default_runtime_dir(base_dir: &Path) -> PathBuf {
    let shm = Path::new("/dev/shm");
    let root = if shm.is_dir() {
        shm.to_path_buf()
    } else {
        dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
    };
    scoped_runtime_dir(&root, base_dir, getuid().as_raw())
}

/// `<root>/pgwarden-<uid>-<home digest>`. Two users, or two homes of one
/// user, never share identity files.
pub fn scoped_runtime_dir(root: &Path, base_dir: &Path, uid: u32) -> PathBuf {
    let home = fs::canonicalize(base_dir).unwrap_or_else(|_| base_dir.to_path_buf());
    let digest = format!("{:x}", Sha256::digest(home.as_os_str().as_bytes()));
    root.join(format!("pgwarden-{uid}-{}", &digest[..16]))
}
