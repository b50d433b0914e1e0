use std::io;
use std::path::PathBuf;

use appdock_core::{InstallError, ManifestError, StorageError};
use appdock_installer::SwapError;
use semver::Version;
use thiserror::Error;

/// Failures that leave an app without usable content. The caller decides
/// whether to retry or give up loading the app.
#[derive(Debug, Error)]
pub enum BlockingError {
    #[error("invalid app name '{0}'")]
    InvalidName(String),
    #[error("version manifest unavailable and '{name}' is not installed")]
    ManifestUnavailable {
        name: String,
        #[source]
        source: ManifestError,
    },
    #[error("no version defined for '{0}'")]
    UnknownApp(String),
    #[error("failed to install {name} {version}")]
    InstallFailed {
        name: String,
        version: Version,
        #[source]
        source: InstallError,
    },
    #[error("failed to activate {name} {version}")]
    Swap {
        name: String,
        version: Version,
        #[source]
        source: SwapError,
    },
}

/// Failures of session management commands (unload, activate, remove).
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("invalid app name '{0}'")]
    InvalidName(String),
    #[error("failed to persist session settings")]
    Storage(#[from] StorageError),
    #[error("failed to {action} {}", path.display())]
    Filesystem {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
