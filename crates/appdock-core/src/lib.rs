mod app;
mod archive;
mod config;
mod error;
mod manifest;
mod settings;

pub use app::{is_valid_app_name, InstalledApp, PendingSwap, StagedPackage};
pub use archive::{archive_file_name, PackageEndpoint};
pub use config::{HostConfig, RetryConfig, TimeoutConfig, DEFAULT_APP, DEFAULT_BASE_URL};
pub use error::{InstallError, InstallStage, ManifestError, StorageError, TransportError};
pub use manifest::VersionManifest;
pub use settings::Settings;
