// src/pkg/mod.rs

//! In-memory package representation
//!
//! A [`Package`] mirrors one row of the `packages` table plus its collateral
//! collections. Collaterals are loaded lazily: each section is guarded by a
//! bit in [`LoadFlags`], set once the corresponding loader has run, so
//! reloading is idempotent. Remote packages carry the same shape but are
//! transient objects materialised from a repository catalog for planning.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Package lifecycle type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackageType {
    #[default]
    Installed,
    Remote,
    File,
    GroupInstalled,
    GroupRemote,
}

/// How multiple licenses combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LicenseLogic {
    #[default]
    Single,
    AnyOf,
    AllOf,
}

impl LicenseLogic {
    pub fn as_i64(&self) -> i64 {
        match self {
            LicenseLogic::Single => 1,
            LicenseLogic::AnyOf => 2,
            LicenseLogic::AllOf => 3,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            2 => LicenseLogic::AnyOf,
            3 => LicenseLogic::AllOf,
            _ => LicenseLogic::Single,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LicenseLogic::Single => "single",
            LicenseLogic::AnyOf => "any-of",
            LicenseLogic::AllOf => "all-of",
        }
    }
}

impl FromStr for LicenseLogic {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "single" => Ok(LicenseLogic::Single),
            "any-of" | "or" => Ok(LicenseLogic::AnyOf),
            "all-of" | "and" => Ok(LicenseLogic::AllOf),
            _ => Err(format!("Invalid license logic: {}", s)),
        }
    }
}

/// The nine shell script hooks, in their persisted type order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScriptKind {
    PreInstall = 0,
    PostInstall = 1,
    PreDeinstall = 2,
    PostDeinstall = 3,
    PreUpgrade = 4,
    PostUpgrade = 5,
    Install = 6,
    Deinstall = 7,
    Upgrade = 8,
}

impl ScriptKind {
    pub const ALL: [ScriptKind; 9] = [
        ScriptKind::PreInstall,
        ScriptKind::PostInstall,
        ScriptKind::PreDeinstall,
        ScriptKind::PostDeinstall,
        ScriptKind::PreUpgrade,
        ScriptKind::PostUpgrade,
        ScriptKind::Install,
        ScriptKind::Deinstall,
        ScriptKind::Upgrade,
    ];

    pub fn from_i64(v: i64) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }
}

/// The five lua script hooks, in their persisted type order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LuaScriptKind {
    PreInstall = 0,
    PostInstall = 1,
    PreDeinstall = 2,
    PostDeinstall = 3,
    PostUpgrade = 4,
}

impl LuaScriptKind {
    pub const ALL: [LuaScriptKind; 5] = [
        LuaScriptKind::PreInstall,
        LuaScriptKind::PostInstall,
        LuaScriptKind::PreDeinstall,
        LuaScriptKind::PostDeinstall,
        LuaScriptKind::PostUpgrade,
    ];

    pub fn from_i64(v: i64) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }
}

/// Which collateral sections of a package have been (or should be) loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadFlags(pub u32);

impl LoadFlags {
    pub const BASIC: LoadFlags = LoadFlags(0);
    pub const DEPS: LoadFlags = LoadFlags(1 << 0);
    pub const RDEPS: LoadFlags = LoadFlags(1 << 1);
    pub const FILES: LoadFlags = LoadFlags(1 << 2);
    pub const DIRS: LoadFlags = LoadFlags(1 << 3);
    pub const SCRIPTS: LoadFlags = LoadFlags(1 << 4);
    pub const OPTIONS: LoadFlags = LoadFlags(1 << 5);
    pub const CATEGORIES: LoadFlags = LoadFlags(1 << 6);
    pub const LICENSES: LoadFlags = LoadFlags(1 << 7);
    pub const USERS: LoadFlags = LoadFlags(1 << 8);
    pub const GROUPS: LoadFlags = LoadFlags(1 << 9);
    pub const SHLIBS_REQUIRED: LoadFlags = LoadFlags(1 << 10);
    pub const SHLIBS_PROVIDED: LoadFlags = LoadFlags(1 << 11);
    pub const ANNOTATIONS: LoadFlags = LoadFlags(1 << 12);
    pub const CONFLICTS: LoadFlags = LoadFlags(1 << 13);
    pub const PROVIDES: LoadFlags = LoadFlags(1 << 14);
    pub const REQUIRES: LoadFlags = LoadFlags(1 << 15);
    pub const LUA_SCRIPTS: LoadFlags = LoadFlags(1 << 16);

    /// Everything
    pub const FULL: LoadFlags = LoadFlags((1 << 17) - 1);

    pub fn contains(&self, other: LoadFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: LoadFlags) {
        self.0 |= other.0;
    }

    pub fn union(self, other: LoadFlags) -> LoadFlags {
        LoadFlags(self.0 | other.0)
    }
}

impl std::ops::BitOr for LoadFlags {
    type Output = LoadFlags;

    fn bitor(self, rhs: LoadFlags) -> LoadFlags {
        self.union(rhs)
    }
}

/// One dependency edge as persisted in the `deps` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    pub origin: String,
    pub version: Option<String>,
}

/// One file owned by a package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgFile {
    pub path: String,
    pub sha256: Option<String>,
    pub config: bool,
}

/// One configuration file with its current content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    pub path: String,
    pub content: Option<String>,
}

/// One directory a package owns or shares
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgDir {
    pub path: String,
    pub try_flag: bool,
}

/// Value of one build option
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PkgOption {
    pub value: String,
    pub default_value: Option<String>,
    pub description: Option<String>,
}

/// A package and its lazily-loaded collaterals
#[derive(Debug, Clone, Default)]
pub struct Package {
    pub id: i64,
    pub pkg_type: PackageType,

    pub name: String,
    pub origin: String,
    pub version: String,
    /// Unique textual id; equal to `name` unless the caller overrides it
    pub uid: String,

    pub comment: String,
    pub desc: String,
    pub message: Option<String>,
    pub arch: String,
    /// Legacy spelling of the architecture tag
    pub altarch: Option<String>,
    pub maintainer: String,
    pub www: Option<String>,
    pub prefix: String,
    pub flatsize: i64,
    /// Compressed archive size, for remote packages
    pub pkgsize: Option<i64>,
    pub automatic: bool,
    pub locked: bool,
    pub vital: bool,
    pub license_logic: LicenseLogic,
    /// Install timestamp, epoch seconds
    pub time: Option<i64>,
    pub manifest_digest: Option<String>,
    pub dep_formula: Option<String>,

    /// Repository the package was materialised from, for remote packages
    pub repo_name: Option<String>,
    /// Path of the archive within its repository
    pub repopath: Option<String>,
    /// Archive checksum, for fetch verification
    pub cksum: Option<String>,
    /// Version being replaced, populated by the planner during upgrades
    pub old_version: Option<String>,

    pub deps: Vec<Dependency>,
    pub rdeps: Vec<Dependency>,
    pub files: Vec<PkgFile>,
    pub config_files: Vec<ConfigFile>,
    pub dirs: Vec<PkgDir>,
    pub categories: Vec<String>,
    pub licenses: Vec<String>,
    pub users: Vec<String>,
    pub groups: Vec<String>,
    pub shlibs_required: Vec<String>,
    pub shlibs_provided: Vec<String>,
    pub provides: Vec<String>,
    pub requires: Vec<String>,
    /// UIDs this package must not coexist with
    pub conflicts: Vec<String>,
    pub options: BTreeMap<String, PkgOption>,
    pub scripts: BTreeMap<ScriptKind, String>,
    pub lua_scripts: BTreeMap<LuaScriptKind, Vec<String>>,
    pub annotations: BTreeMap<String, String>,

    /// Sections already materialised
    pub loaded: LoadFlags,
}

impl Package {
    pub fn new(name: &str, version: &str, origin: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            origin: origin.to_string(),
            uid: name.to_string(),
            license_logic: LicenseLogic::Single,
            prefix: "/usr/local".to_string(),
            ..Self::default()
        }
    }

    pub fn new_remote(name: &str, version: &str, origin: &str) -> Self {
        Self {
            pkg_type: PackageType::Remote,
            ..Self::new(name, version, origin)
        }
    }

    /// Option name → value view, for formula option post-filtering
    pub fn option_values(&self) -> BTreeMap<String, String> {
        self.options
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }

    /// Both halves of an upgrade or a plain install mention the package this
    /// way in diagnostics
    pub fn full_name(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    pub fn is_installed(&self) -> bool {
        matches!(
            self.pkg_type,
            PackageType::Installed | PackageType::GroupInstalled
        )
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_defaults_to_name() {
        let p = Package::new("curl", "8.6.0", "ftp/curl");
        assert_eq!(p.uid, "curl");
        assert_eq!(p.full_name(), "curl-8.6.0");
    }

    #[test]
    fn test_load_flags_set_and_query() {
        let mut flags = LoadFlags::BASIC;
        assert!(!flags.contains(LoadFlags::DEPS));

        flags.insert(LoadFlags::DEPS);
        flags.insert(LoadFlags::FILES);
        assert!(flags.contains(LoadFlags::DEPS));
        assert!(flags.contains(LoadFlags::DEPS | LoadFlags::FILES));
        assert!(!flags.contains(LoadFlags::SCRIPTS));

        assert!(LoadFlags::FULL.contains(LoadFlags::LUA_SCRIPTS));
    }

    #[test]
    fn test_script_kind_codes_are_stable() {
        assert_eq!(ScriptKind::from_i64(0), Some(ScriptKind::PreInstall));
        assert_eq!(ScriptKind::from_i64(8), Some(ScriptKind::Upgrade));
        assert_eq!(ScriptKind::from_i64(9), None);
        assert_eq!(ScriptKind::Upgrade as i64, 8);
    }

    #[test]
    fn test_license_logic_roundtrip() {
        for logic in [LicenseLogic::Single, LicenseLogic::AnyOf, LicenseLogic::AllOf] {
            assert_eq!(LicenseLogic::from_i64(logic.as_i64()), logic);
            assert_eq!(logic.as_str().parse::<LicenseLogic>().unwrap(), logic);
        }
    }

    #[test]
    fn test_option_values_view() {
        let mut p = Package::new("nginx", "1.25.0", "www/nginx");
        p.options.insert(
            "SSL".into(),
            PkgOption {
                value: "on".into(),
                ..PkgOption::default()
            },
        );
        let values = p.option_values();
        assert_eq!(values.get("SSL").map(String::as_str), Some("on"));
    }
}
