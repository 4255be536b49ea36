// src/db/dir.rs

//! Directory-anchored file access
//!
//! The storage engine opens the DB directory exactly once and from then on
//! resolves every file inside it through the held descriptor, never through
//! the absolute path again. Renaming or symlink-swapping the directory after
//! open cannot redirect our accesses. On Linux the anchored view is the
//! `/proc/self/fd/N/<name>` path, which the kernel resolves via the
//! descriptor.

use std::fs::{self, File, Metadata};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};
use tracing::debug;

use crate::error::{Error, Result};

/// File name of the local package store inside the DB dir
pub const LOCAL_DB_NAME: &str = "local.sqlite";

/// An open handle on the database directory
#[derive(Debug)]
pub struct DbDir {
    dir: File,
    path: PathBuf,
}

impl DbDir {
    /// Open the DB directory, creating it when `create` is set
    pub fn open(path: &Path, create: bool) -> Result<Self> {
        if !path.exists() {
            if !create {
                return Err(Error::NoDb(path.display().to_string()));
            }
            fs::create_dir_all(path)?;
            debug!("created database directory {}", path.display());
        }

        let dir = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NoDb(path.display().to_string()),
            std::io::ErrorKind::PermissionDenied => {
                Error::NoAccess(path.display().to_string())
            }
            _ => Error::Io(e),
        })?;

        let meta = dir.metadata()?;
        if !meta.is_dir() {
            return Err(Error::Fatal(format!(
                "{} is not a directory",
                path.display()
            )));
        }

        Ok(Self {
            dir,
            path: path.to_path_buf(),
        })
    }

    /// The path the directory was opened from; diagnostics only
    pub fn opened_from(&self) -> &Path {
        &self.path
    }

    /// Resolve a name inside the directory through the held descriptor
    pub fn anchored(&self, name: &str) -> PathBuf {
        PathBuf::from(format!("/proc/self/fd/{}/{}", self.dir.as_raw_fd(), name))
    }

    /// Anchored path of the local package store
    pub fn sqlite_path(&self) -> PathBuf {
        self.anchored(LOCAL_DB_NAME)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.anchored(name).exists()
    }

    fn stat(&self, name: Option<&str>) -> Result<Metadata> {
        let meta = match name {
            None => self.dir.metadata()?,
            Some(n) => fs::metadata(self.anchored(n)).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::NoDb(n.to_string()),
                std::io::ErrorKind::PermissionDenied => Error::NoAccess(n.to_string()),
                _ => Error::Io(e),
            })?,
        };
        Ok(meta)
    }

    /// Verify ownership and permissions of the directory itself (`name` =
    /// None) or a file inside it.
    ///
    /// With `install_as_user` the expected owner is the current euid/egid,
    /// otherwise root. Root-owned state must not be group- or world-writable;
    /// user-owned state must not be world-writable and may be group-writable
    /// only for the expected group.
    pub fn check_secure(&self, name: Option<&str>, install_as_user: bool) -> Result<()> {
        let (expect_uid, expect_gid) = if install_as_user {
            (Uid::effective().as_raw(), Gid::effective().as_raw())
        } else {
            (0, 0)
        };

        let meta = self.stat(name)?;
        let mode = meta.mode();
        let target = name.unwrap_or(".");

        let mut bad_perms = false;
        let mut wrong_owner = false;

        if expect_uid == 0 {
            if mode & 0o022 != 0 {
                bad_perms = true;
            }
            if meta.uid() != expect_uid {
                wrong_owner = true;
            }
        } else {
            if mode & 0o002 != 0 {
                bad_perms = true;
            }
            if meta.gid() != expect_gid && mode & 0o020 != 0 {
                bad_perms = true;
            }
            if meta.uid() != 0 && meta.uid() != expect_uid && meta.gid() != expect_gid {
                wrong_owner = true;
            }
        }

        if bad_perms {
            return Err(Error::Insecure(format!(
                "{} permissions ({:#o}) too lax",
                target,
                mode & 0o777
            )));
        }
        if wrong_owner {
            return Err(Error::Insecure(format!(
                "{} wrong user or group ownership (expected {}/{} versus actual {}/{})",
                target,
                expect_uid,
                expect_gid,
                meta.uid(),
                meta.gid()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_open_missing_without_create() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope");
        let err = DbDir::open(&missing, false).unwrap_err();
        assert!(matches!(err, Error::NoDb(_)));
    }

    #[test]
    fn test_open_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("db");
        let dir = DbDir::open(&target, true).unwrap();
        assert!(target.is_dir());
        assert!(!dir.contains(LOCAL_DB_NAME));
    }

    #[test]
    fn test_anchored_resolves_through_fd() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DbDir::open(tmp.path(), false).unwrap();
        std::fs::write(tmp.path().join("probe"), b"x").unwrap();
        assert!(dir.contains("probe"));
        assert_eq!(std::fs::read(dir.anchored("probe")).unwrap(), b"x");
    }

    #[test]
    fn test_check_secure_as_user_accepts_own_dir() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        let dir = DbDir::open(tmp.path(), false).unwrap();
        // We own the tempdir; as-user mode must accept it
        dir.check_secure(None, true).unwrap();
    }

    #[test]
    fn test_check_secure_rejects_world_writable() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DbDir::open(tmp.path(), false).unwrap();
        let file = tmp.path().join("loose");
        std::fs::write(&file, b"").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o666)).unwrap();
        let err = dir.check_secure(Some("loose"), true).unwrap_err();
        assert!(matches!(err, Error::Insecure(_)));
    }
}
