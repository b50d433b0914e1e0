use std::collections::BTreeMap;

use semver::Version;
use tracing::warn;

use crate::ManifestError;

/// Snapshot of the remote `versions.json`: app name to latest available version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionManifest {
    versions: BTreeMap<String, Version>,
}

impl VersionManifest {
    pub fn from_json_str(input: &str) -> Result<Self, ManifestError> {
        let raw: BTreeMap<String, String> = serde_json::from_str(input)?;
        let mut versions = BTreeMap::new();
        for (name, value) in raw {
            match Version::parse(value.trim()) {
                Ok(version) => {
                    versions.insert(name, version);
                }
                Err(err) => {
                    warn!(app = %name, version = %value, "skipping manifest entry: {err}");
                }
            }
        }
        Ok(Self { versions })
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, Version)>) -> Self {
        Self {
            versions: entries.into_iter().collect(),
        }
    }

    pub fn latest(&self, name: &str) -> Option<&Version> {
        self.versions.get(name)
    }

    /// Returns the manifest version when it is strictly newer than `installed`,
    /// or when nothing is installed yet.
    pub fn upgrade_for(&self, name: &str, installed: Option<&Version>) -> Option<&Version> {
        let latest = self.latest(name)?;
        match installed {
            Some(current) if latest <= current => None,
            _ => Some(latest),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Version)> {
        self.versions
            .iter()
            .map(|(name, version)| (name.as_str(), version))
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}
