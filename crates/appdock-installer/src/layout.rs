use std::path::{Path, PathBuf};

use semver::Version;

const APPS_DIR: &str = "apps";
const SETTINGS_FILE: &str = "settings.json";

/// On-disk layout rooted at the host data directory:
///
/// ```text
/// apps/{name}/            live package
/// apps/{name}-{version}/  staged package awaiting a swap
/// apps/.{name}-{version}.partial/  extraction in progress
/// apps/{name}.zip         transient download
/// apps/.{name}.old/       live package moved aside during a swap
/// settings.json           persisted session settings
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppsLayout {
    root: PathBuf,
}

impl AppsLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.root.join(APPS_DIR)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }

    pub fn live_dir(&self, name: &str) -> PathBuf {
        self.apps_dir().join(name)
    }

    pub fn staging_dir(&self, name: &str, version: &Version) -> PathBuf {
        self.apps_dir().join(format!("{name}-{version}"))
    }

    pub fn partial_dir(&self, name: &str, version: &Version) -> PathBuf {
        self.apps_dir().join(format!(".{name}-{version}.partial"))
    }

    pub fn archive_path(&self, name: &str) -> PathBuf {
        self.apps_dir().join(format!("{name}.zip"))
    }

    pub fn trash_dir(&self, name: &str) -> PathBuf {
        self.apps_dir().join(format!(".{name}.old"))
    }

    /// Parses `dir_name` as the staging directory of `name`, returning the
    /// staged version.
    pub fn staged_version(name: &str, dir_name: &str) -> Option<Version> {
        let version = dir_name.strip_prefix(name)?.strip_prefix('-')?;
        Version::parse(version).ok()
    }

    pub fn is_partial_dir(dir_name: &str) -> bool {
        dir_name.starts_with('.') && dir_name.ends_with(".partial")
    }

    pub fn trashed_app_name(dir_name: &str) -> Option<&str> {
        dir_name
            .strip_prefix('.')?
            .strip_suffix(".old")
            .filter(|name| !name.is_empty())
    }
}
