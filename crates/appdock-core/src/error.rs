use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error requesting {url}: {message}")]
    Network { url: String, message: String },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
        }
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to fetch version manifest")]
    Network(#[from] TransportError),
    #[error("failed to parse version manifest")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStage {
    Validate,
    Download,
    Archive,
    Extract,
    Filesystem,
}

impl InstallStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Download => "download",
            Self::Archive => "archive",
            Self::Extract => "extract",
            Self::Filesystem => "filesystem",
        }
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("invalid app name '{0}'")]
    InvalidName(String),
    #[error("failed to download {url}")]
    Download {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("package archive {} is corrupt: {message}", path.display())]
    Archive { path: PathBuf, message: String },
    #[error("failed to extract {} into {}: {message}", archive.display(), destination.display())]
    Extract {
        archive: PathBuf,
        destination: PathBuf,
        message: String,
    },
    #[error("failed to {action} {}", path.display())]
    Filesystem {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl InstallError {
    pub fn filesystem(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Filesystem {
            action,
            path: path.into(),
            source,
        }
    }

    pub fn stage(&self) -> InstallStage {
        match self {
            Self::InvalidName(_) => InstallStage::Validate,
            Self::Download { .. } => InstallStage::Download,
            Self::Archive { .. } => InstallStage::Archive,
            Self::Extract { .. } => InstallStage::Extract,
            Self::Filesystem { .. } => InstallStage::Filesystem,
        }
    }

    /// Archive corruption counts as retryable; callers bound those attempts
    /// separately from network failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Download { source, .. } => source.is_retryable(),
            Self::Archive { .. } => true,
            Self::InvalidName(_) | Self::Extract { .. } | Self::Filesystem { .. } => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to {action} settings file {}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("settings file {} is malformed", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize settings")]
    Serialize(#[source] serde_json::Error),
    #[error("settings storage unavailable: {0}")]
    Unavailable(String),
}
