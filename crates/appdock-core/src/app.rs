use std::path::PathBuf;

use semver::Version;

const MAX_APP_NAME_LEN: usize = 64;

/// Installed state of one hosted app, keyed by `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledApp {
    pub name: String,
    pub installed_version: Option<Version>,
    pub loaded: bool,
}

/// A freshly extracted package sitting in its version-suffixed staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedPackage {
    pub name: String,
    pub version: Version,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSwap {
    pub name: String,
    pub staged_version: Version,
    pub staged_path: PathBuf,
}

impl From<StagedPackage> for PendingSwap {
    fn from(value: StagedPackage) -> Self {
        Self {
            name: value.name,
            staged_version: value.version,
            staged_path: value.path,
        }
    }
}

/// App names become directory and file names under `apps/`, so they are
/// restricted to a conservative character set. A name may not read as another
/// app's staging directory (`{name}-{version}`) or download (`{name}.zip`).
pub fn is_valid_app_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_APP_NAME_LEN || name.starts_with('.') {
        return false;
    }
    if name.ends_with(".zip") {
        return false;
    }
    if name
        .as_bytes()
        .windows(2)
        .any(|pair| pair[0] == b'-' && pair[1].is_ascii_digit())
    {
        return false;
    }

    name.chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.')
}
