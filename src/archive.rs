// src/archive.rs

//! Package archives
//!
//! An archive is a tar stream, optionally compressed with gzip, xz, or zstd
//! (detected by magic bytes, never by file name). The first entry must be
//! `+MANIFEST`, a JSON document carrying the package metadata; file entries
//! follow. Readers rely only on that ordering invariant.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};
use crate::pkg::{
    ConfigFile, Dependency, LicenseLogic, LuaScriptKind, Package, PackageType, PkgDir,
    PkgFile, PkgOption, ScriptKind,
};

/// Name of the metadata entry, always first in the stream
pub const MANIFEST_NAME: &str = "+MANIFEST";

/// One dependency entry in a manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestDep {
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// The `+MANIFEST` document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub name: String,
    pub origin: String,
    pub version: String,
    pub comment: String,
    pub desc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub arch: String,
    pub maintainer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub www: Option<String>,
    pub prefix: String,
    pub flatsize: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pkgsize: Option<i64>,
    pub licenselogic: String,
    pub licenses: Vec<String>,
    pub categories: Vec<String>,
    pub users: Vec<String>,
    pub groups: Vec<String>,
    pub deps: BTreeMap<String, ManifestDep>,
    /// path → sha256
    pub files: BTreeMap<String, String>,
    /// paths whose content is tracked as configuration
    pub config: Vec<String>,
    /// path → try flag
    pub directories: BTreeMap<String, bool>,
    pub scripts: BTreeMap<String, String>,
    pub lua_scripts: BTreeMap<String, Vec<String>>,
    pub options: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub shlibs_required: Vec<String>,
    pub shlibs_provided: Vec<String>,
    pub provides: Vec<String>,
    pub requires: Vec<String>,
    pub conflicts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dep_formula: Option<String>,
    pub vital: bool,
}

fn script_kind_name(kind: ScriptKind) -> &'static str {
    match kind {
        ScriptKind::PreInstall => "pre-install",
        ScriptKind::PostInstall => "post-install",
        ScriptKind::PreDeinstall => "pre-deinstall",
        ScriptKind::PostDeinstall => "post-deinstall",
        ScriptKind::PreUpgrade => "pre-upgrade",
        ScriptKind::PostUpgrade => "post-upgrade",
        ScriptKind::Install => "install",
        ScriptKind::Deinstall => "deinstall",
        ScriptKind::Upgrade => "upgrade",
    }
}

fn script_kind_from_name(name: &str) -> Option<ScriptKind> {
    ScriptKind::ALL
        .into_iter()
        .find(|k| script_kind_name(*k) == name)
}

fn lua_kind_name(kind: LuaScriptKind) -> &'static str {
    match kind {
        LuaScriptKind::PreInstall => "pre-install",
        LuaScriptKind::PostInstall => "post-install",
        LuaScriptKind::PreDeinstall => "pre-deinstall",
        LuaScriptKind::PostDeinstall => "post-deinstall",
        LuaScriptKind::PostUpgrade => "post-upgrade",
    }
}

fn lua_kind_from_name(name: &str) -> Option<LuaScriptKind> {
    LuaScriptKind::ALL
        .into_iter()
        .find(|k| lua_kind_name(*k) == name)
}

impl Manifest {
    pub fn from_package(pkg: &Package) -> Self {
        Self {
            name: pkg.name.clone(),
            origin: pkg.origin.clone(),
            version: pkg.version.clone(),
            comment: pkg.comment.clone(),
            desc: pkg.desc.clone(),
            message: pkg.message.clone(),
            arch: pkg.arch.clone(),
            maintainer: pkg.maintainer.clone(),
            www: pkg.www.clone(),
            prefix: pkg.prefix.clone(),
            flatsize: pkg.flatsize,
            pkgsize: pkg.pkgsize,
            licenselogic: pkg.license_logic.as_str().to_string(),
            licenses: pkg.licenses.clone(),
            categories: pkg.categories.clone(),
            users: pkg.users.clone(),
            groups: pkg.groups.clone(),
            deps: pkg
                .deps
                .iter()
                .map(|d| {
                    (
                        d.name.clone(),
                        ManifestDep {
                            origin: d.origin.clone(),
                            version: d.version.clone(),
                        },
                    )
                })
                .collect(),
            files: pkg
                .files
                .iter()
                .map(|f| (f.path.clone(), f.sha256.clone().unwrap_or_default()))
                .collect(),
            config: pkg.config_files.iter().map(|c| c.path.clone()).collect(),
            directories: pkg
                .dirs
                .iter()
                .map(|d| (d.path.clone(), d.try_flag))
                .collect(),
            scripts: pkg
                .scripts
                .iter()
                .map(|(k, v)| (script_kind_name(*k).to_string(), v.clone()))
                .collect(),
            lua_scripts: pkg
                .lua_scripts
                .iter()
                .map(|(k, v)| (lua_kind_name(*k).to_string(), v.clone()))
                .collect(),
            options: pkg
                .options
                .iter()
                .map(|(k, v)| (k.clone(), v.value.clone()))
                .collect(),
            annotations: pkg.annotations.clone(),
            shlibs_required: pkg.shlibs_required.clone(),
            shlibs_provided: pkg.shlibs_provided.clone(),
            provides: pkg.provides.clone(),
            requires: pkg.requires.clone(),
            conflicts: pkg.conflicts.clone(),
            dep_formula: pkg.dep_formula.clone(),
            vital: pkg.vital,
        }
    }

    pub fn into_package(self) -> Package {
        let mut pkg = Package {
            pkg_type: PackageType::File,
            uid: self.name.clone(),
            name: self.name,
            origin: self.origin,
            version: self.version,
            comment: self.comment,
            desc: self.desc,
            message: self.message,
            arch: self.arch,
            maintainer: self.maintainer,
            www: self.www,
            prefix: self.prefix,
            flatsize: self.flatsize,
            pkgsize: self.pkgsize,
            license_logic: self.licenselogic.parse().unwrap_or(LicenseLogic::Single),
            licenses: self.licenses,
            categories: self.categories,
            users: self.users,
            groups: self.groups,
            shlibs_required: self.shlibs_required,
            shlibs_provided: self.shlibs_provided,
            provides: self.provides,
            requires: self.requires,
            conflicts: self.conflicts,
            annotations: self.annotations,
            dep_formula: self.dep_formula,
            vital: self.vital,
            ..Package::default()
        };

        for (name, dep) in self.deps {
            pkg.deps.push(Dependency {
                name,
                origin: dep.origin,
                version: dep.version,
            });
        }
        let config: std::collections::BTreeSet<String> = self.config.into_iter().collect();
        for (path, sha256) in self.files {
            let is_config = config.contains(&path);
            if is_config {
                pkg.config_files.push(ConfigFile {
                    path: path.clone(),
                    content: None,
                });
            }
            pkg.files.push(PkgFile {
                path,
                sha256: if sha256.is_empty() { None } else { Some(sha256) },
                config: is_config,
            });
        }
        for (path, try_flag) in self.directories {
            pkg.dirs.push(PkgDir { path, try_flag });
        }
        for (name, body) in self.scripts {
            if let Some(kind) = script_kind_from_name(&name) {
                pkg.scripts.insert(kind, body);
            }
        }
        for (name, bodies) in self.lua_scripts {
            if let Some(kind) = lua_kind_from_name(&name) {
                pkg.lua_scripts.insert(kind, bodies);
            }
        }
        for (name, value) in self.options {
            pkg.options.insert(
                name,
                PkgOption {
                    value,
                    ..PkgOption::default()
                },
            );
        }
        pkg
    }
}

/// Wrap a raw archive stream in the right decompressor, sniffing magic bytes
fn decompress(path: &Path) -> Result<Box<dyn Read>> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 6];
    let n = file.read(&mut magic)?;
    drop(file);

    let file = File::open(path)?;
    let reader: Box<dyn Read> = if n >= 2 && magic[..2] == [0x1f, 0x8b] {
        Box::new(flate2::read::GzDecoder::new(file))
    } else if n >= 6 && magic == [0xfd, b'7', b'z', b'X', b'Z', 0x00] {
        Box::new(xz2::read::XzDecoder::new(file))
    } else if n >= 4 && magic[..4] == [0x28, 0xb5, 0x2f, 0xfd] {
        Box::new(
            zstd::stream::read::Decoder::new(file)
                .map_err(|e| Error::Fatal(format!("zstd: {}", e)))?,
        )
    } else {
        Box::new(file)
    };
    Ok(reader)
}

fn entry_name(entry: &tar::Entry<'_, Box<dyn Read>>) -> Result<String> {
    let path = entry.path().map_err(|e| Error::Fatal(e.to_string()))?;
    Ok(path.to_string_lossy().trim_start_matches("./").to_string())
}

/// Read the manifest of a package archive
///
/// Enforces the ordering invariant: the first entry must be `+MANIFEST`.
pub fn read_manifest(path: &Path) -> Result<Manifest> {
    let reader = decompress(path)?;
    let mut archive = tar::Archive::new(reader);

    let mut entries = archive.entries().map_err(Error::Io)?;
    let Some(first) = entries.next() else {
        return Err(Error::Fatal(format!("{}: empty archive", path.display())));
    };
    let mut first = first.map_err(Error::Io)?;
    if entry_name(&first)? != MANIFEST_NAME {
        return Err(Error::Fatal(format!(
            "{}: archive does not start with {}",
            path.display(),
            MANIFEST_NAME
        )));
    }

    let mut data = String::new();
    first.read_to_string(&mut data)?;
    serde_json::from_str(&data)
        .map_err(|e| Error::Fatal(format!("{}: bad manifest: {}", path.display(), e)))
}

/// Read the manifest and materialise it as a file-typed package
pub fn read_package(path: &Path) -> Result<Package> {
    Ok(read_manifest(path)?.into_package())
}

/// Extract file entries under a staging root, returning `(archive path,
/// staged path)` pairs in stream order
pub fn extract_files(path: &Path, staging: &Path) -> Result<Vec<(String, PathBuf)>> {
    let reader = decompress(path)?;
    let mut archive = tar::Archive::new(reader);
    let mut seen_manifest = false;
    let mut staged = Vec::new();

    for entry in archive.entries().map_err(Error::Io)? {
        let mut entry = entry.map_err(Error::Io)?;
        let name = entry_name(&entry)?;

        if !seen_manifest {
            if name != MANIFEST_NAME {
                return Err(Error::Fatal(format!(
                    "{}: archive does not start with {}",
                    path.display(),
                    MANIFEST_NAME
                )));
            }
            seen_manifest = true;
            continue;
        }
        if name.starts_with('+') {
            // Other metadata entries are ignored
            continue;
        }

        let rel = name.trim_start_matches('/');
        let dest = staging.join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&dest)?;
        std::io::copy(&mut entry, &mut out)?;
        debug!("staged {} as {}", name, dest.display());
        staged.push((format!("/{}", rel), dest));
    }

    Ok(staged)
}

/// Create a gzip-compressed package archive
///
/// The manifest gets its file checksums filled from the payloads. Paths are
/// stored without their leading slash, manifest first.
pub fn write_package(
    dest: &Path,
    pkg: &Package,
    payloads: &[(String, Vec<u8>)],
) -> Result<()> {
    let mut manifest = Manifest::from_package(pkg);
    for (path, bytes) in payloads {
        let digest = format!("{:x}", Sha256::digest(bytes));
        manifest.files.insert(path.clone(), digest);
    }

    let file = File::create(dest)?;
    let gz = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(gz);

    let manifest_json = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| Error::Fatal(format!("manifest encoding: {}", e)))?;
    let mut header = tar::Header::new_ustar();
    header.set_size(manifest_json.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, MANIFEST_NAME, manifest_json.as_slice())
        .map_err(Error::Io)?;

    for (path, bytes) in payloads {
        let mut header = tar::Header::new_ustar();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, path.trim_start_matches('/'), bytes.as_slice())
            .map_err(Error::Io)?;
    }

    let gz = builder.into_inner().map_err(Error::Io)?;
    let mut file = gz.finish().map_err(Error::Io)?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Package {
        let mut p = Package::new("tool", "1.2", "misc/tool");
        p.comment = "a tool".into();
        p.desc = "a longer tool description".into();
        p.arch = "amd64".into();
        p.maintainer = "x@example.org".into();
        p.scripts
            .insert(ScriptKind::PostInstall, "echo done".into());
        p.dep_formula = Some("lib >= 1.0".into());
        p
    }

    #[test]
    fn test_write_then_read_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tool-1.2.pkg");
        write_package(
            &path,
            &sample(),
            &[("/usr/local/bin/tool".into(), b"#!/bin/sh\n".to_vec())],
        )
        .unwrap();

        let manifest = read_manifest(&path).unwrap();
        assert_eq!(manifest.name, "tool");
        assert_eq!(manifest.version, "1.2");
        assert_eq!(manifest.dep_formula.as_deref(), Some("lib >= 1.0"));
        assert!(manifest.files.contains_key("/usr/local/bin/tool"));

        let pkg = manifest.into_package();
        assert_eq!(pkg.pkg_type, PackageType::File);
        assert_eq!(pkg.files.len(), 1);
        assert_eq!(
            pkg.scripts.get(&ScriptKind::PostInstall).map(String::as_str),
            Some("echo done")
        );
    }

    #[test]
    fn test_extract_files() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tool-1.2.pkg");
        write_package(
            &path,
            &sample(),
            &[("/usr/local/bin/tool".into(), b"payload".to_vec())],
        )
        .unwrap();

        let staging = tmp.path().join("stage");
        let staged = extract_files(&path, &staging).unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].0, "/usr/local/bin/tool");
        assert_eq!(std::fs::read(&staged[0].1).unwrap(), b"payload");
    }

    #[test]
    fn test_manifest_must_come_first() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.pkg");

        // A tar whose first entry is a regular file
        let file = File::create(&path).unwrap();
        let mut builder = tar::Builder::new(file);
        let mut header = tar::Header::new_ustar();
        header.set_size(3);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "usr/local/bin/x", &b"abc"[..])
            .unwrap();
        builder.finish().unwrap();

        let err = read_manifest(&path).unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
    }

    #[test]
    fn test_plain_tar_is_accepted() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("plain.pkg");

        let manifest = Manifest::from_package(&sample());
        let json = serde_json::to_vec(&manifest).unwrap();
        let file = File::create(&path).unwrap();
        let mut builder = tar::Builder::new(file);
        let mut header = tar::Header::new_ustar();
        header.set_size(json.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, MANIFEST_NAME, json.as_slice())
            .unwrap();
        builder.finish().unwrap();

        // No compression magic; sniffed as raw tar
        let m = read_manifest(&path).unwrap();
        assert_eq!(m.name, "tool");
    }
}
