use std::collections::{BTreeMap, HashSet};

use semver::Version;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::is_valid_app_name;

/// Durable session state: the foregrounded app, the ordered set of apps with a
/// live view, and the installed version of every app.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
    #[serde(default)]
    pub loaded_apps: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_app_versions")]
    pub apps: BTreeMap<String, Version>,
}

impl Settings {
    pub fn from_json_str(input: &str) -> Result<Self, serde_json::Error> {
        let settings: Self = serde_json::from_str(input)?;
        Ok(settings.normalized())
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Applies the load-time defaulting rules so downstream code never has to
    /// re-check for duplicates or blank values.
    pub fn normalized(mut self) -> Self {
        let mut seen = HashSet::new();
        self.loaded_apps
            .retain(|name| is_valid_app_name(name) && seen.insert(name.clone()));

        if self
            .current
            .as_deref()
            .is_some_and(|current| current.trim().is_empty())
        {
            self.current = None;
        }

        self.apps.retain(|name, _| is_valid_app_name(name));
        self
    }
}

fn deserialize_app_versions<'de, D>(deserializer: D) -> Result<BTreeMap<String, Version>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, String>>::deserialize(deserializer)?.unwrap_or_default();
    let mut apps = BTreeMap::new();
    for (name, value) in raw {
        match Version::parse(value.trim()) {
            Ok(version) => {
                apps.insert(name, version);
            }
            Err(err) => {
                warn!(app = %name, version = %value, "dropping installed version record: {err}");
            }
        }
    }
    Ok(apps)
}
