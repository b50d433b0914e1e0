use semver::Version;

const MANIFEST_FILE_NAME: &str = "versions.json";

/// Remote location serving the version manifest and the package archives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageEndpoint {
    base_url: String,
}

impl PackageEndpoint {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn manifest_url(&self) -> String {
        format!("{}/{MANIFEST_FILE_NAME}", self.base_url)
    }

    pub fn archive_url(&self, name: &str, version: &Version) -> String {
        format!("{}/{}", self.base_url, archive_file_name(name, version))
    }
}

pub fn archive_file_name(name: &str, version: &Version) -> String {
    format!("{name}.{version}.zip")
}
