// src/cache.rs

//! Package archive cache
//!
//! Downloaded archives live under one cache directory. The name is derived
//! deterministically from `(name, version, checksum)` so every caller
//! resolves the same path for the same package. Entries with the wrong size
//! are deleted and re-downloaded on the next run; entries that also carry
//! the right checksum are trusted without network I/O.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::Result;
use crate::pkg::Package;

/// How much of the checksum participates in the file name
const CKSUM_NAME_LEN: usize = 16;

/// Deterministic cache file name for a remote package
pub fn cached_name(pkg: &Package) -> String {
    match &pkg.cksum {
        Some(cksum) => {
            let short = &cksum[..cksum.len().min(CKSUM_NAME_LEN)];
            format!("{}-{}-{}.pkg", pkg.name, pkg.version, short)
        }
        None => format!("{}-{}.pkg", pkg.name, pkg.version),
    }
}

/// Absolute cache path for a remote package
pub fn cached_path(cache_dir: &Path, pkg: &Package) -> PathBuf {
    cache_dir.join(cached_name(pkg))
}

/// SHA-256 of a file, streaming
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Whether a cached entry can satisfy the package without a download
///
/// A wrong-size entry is corrupt: it is unlinked so the next run fetches it
/// again. Size alone is not enough to trust the file; the checksum must
/// match too when the catalog carries one.
pub fn validate(path: &Path, pkg: &Package) -> Result<bool> {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return Ok(false),
    };

    if let Some(expected) = pkg.pkgsize {
        if meta.len() as i64 != expected {
            warn!(
                "cached {} has wrong size ({} versus {}), removing",
                path.display(),
                meta.len(),
                expected
            );
            std::fs::remove_file(path)?;
            return Ok(false);
        }
    }

    if let Some(expected) = &pkg.cksum {
        let actual = sha256_file(path)?;
        if &actual != expected {
            warn!("cached {} has wrong checksum, removing", path.display());
            std::fs::remove_file(path)?;
            return Ok(false);
        }
    }

    debug!("cache hit for {}", path.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_pkg(payload: &[u8]) -> Package {
        let mut p = Package::new_remote("a", "1.0", "misc/a");
        p.pkgsize = Some(payload.len() as i64);
        p.cksum = Some(format!("{:x}", Sha256::digest(payload)));
        p
    }

    #[test]
    fn test_cached_name_is_deterministic() {
        let p = remote_pkg(b"payload");
        let q = remote_pkg(b"payload");
        assert_eq!(cached_name(&p), cached_name(&q));
        assert!(cached_name(&p).starts_with("a-1.0-"));

        // Different content, different name
        let r = remote_pkg(b"other payload!!");
        assert_ne!(cached_name(&p), cached_name(&r));
    }

    #[test]
    fn test_validate_accepts_good_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let pkg = remote_pkg(b"payload");
        let path = cached_path(tmp.path(), &pkg);
        std::fs::write(&path, b"payload").unwrap();
        assert!(validate(&path, &pkg).unwrap());
        assert!(path.exists());
    }

    #[test]
    fn test_validate_removes_wrong_size() {
        let tmp = tempfile::tempdir().unwrap();
        let pkg = remote_pkg(b"payload");
        let path = cached_path(tmp.path(), &pkg);
        std::fs::write(&path, b"short").unwrap();
        assert!(!validate(&path, &pkg).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_validate_removes_wrong_checksum() {
        let tmp = tempfile::tempdir().unwrap();
        let pkg = remote_pkg(b"payload");
        let path = cached_path(tmp.path(), &pkg);
        // Same length, different bytes
        std::fs::write(&path, b"daolyap").unwrap();
        assert!(!validate(&path, &pkg).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_validate_missing_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let pkg = remote_pkg(b"payload");
        assert!(!validate(&cached_path(tmp.path(), &pkg), &pkg).unwrap());
    }
}
