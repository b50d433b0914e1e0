use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use appdock_core::{is_valid_app_name, InstallError, PackageEndpoint, StagedPackage};
use appdock_registry::RemoteSource;
use futures::StreamExt;
use semver::Version;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::fs_utils::{remove_dir_if_exists, remove_file_if_exists};
use crate::AppsLayout;

/// Downloads one app archive and extracts it into its version-suffixed staging
/// directory. The live directory is never written here.
pub struct PackageInstaller {
    layout: AppsLayout,
    endpoint: PackageEndpoint,
    source: Arc<dyn RemoteSource>,
}

impl PackageInstaller {
    pub fn new(layout: AppsLayout, endpoint: PackageEndpoint, source: Arc<dyn RemoteSource>) -> Self {
        Self {
            layout,
            endpoint,
            source,
        }
    }

    pub fn layout(&self) -> &AppsLayout {
        &self.layout
    }

    pub async fn install(&self, name: &str, version: &Version) -> Result<StagedPackage, InstallError> {
        if !is_valid_app_name(name) {
            return Err(InstallError::InvalidName(name.to_string()));
        }

        let apps_dir = self.layout.apps_dir();
        fs::create_dir_all(&apps_dir)
            .await
            .map_err(|err| InstallError::filesystem("create", &apps_dir, err))?;

        let archive_path = self.layout.archive_path(name);
        remove_file_if_exists(&archive_path)
            .await
            .map_err(|err| InstallError::filesystem("remove stale archive", &archive_path, err))?;

        let result = self.fetch_and_stage(name, version, &archive_path).await;

        if let Err(err) = remove_file_if_exists(&archive_path).await {
            warn!(
                path = %archive_path.display(),
                "failed to remove downloaded archive: {err}"
            );
        }

        match &result {
            Ok(staged) => info!(
                app = name,
                %version,
                path = %staged.path.display(),
                "staged package"
            ),
            Err(err) => warn!(
                app = name,
                %version,
                stage = err.stage().as_str(),
                "package install failed: {err}"
            ),
        }
        result
    }

    async fn fetch_and_stage(
        &self,
        name: &str,
        version: &Version,
        archive_path: &Path,
    ) -> Result<StagedPackage, InstallError> {
        let url = self.endpoint.archive_url(name, version);
        let written = self.download(&url, archive_path).await?;
        debug!(app = name, %url, bytes = written, "downloaded archive");

        let entries = validate_archive(archive_path).await?;
        debug!(app = name, entries, "archive is well formed");

        // An interrupted extract leaves only the hidden partial directory.
        let partial_dir = self.layout.partial_dir(name, version);
        let staging_dir = self.layout.staging_dir(name, version);
        for stale in [&partial_dir, &staging_dir] {
            remove_dir_if_exists(stale)
                .await
                .map_err(|err| InstallError::filesystem("clear staging directory", stale, err))?;
        }
        fs::create_dir_all(&partial_dir)
            .await
            .map_err(|err| InstallError::filesystem("create", &partial_dir, err))?;

        if let Err(err) = extract_archive(archive_path, &partial_dir).await {
            remove_partial(&partial_dir).await;
            return Err(err);
        }
        if let Err(err) = fs::rename(&partial_dir, &staging_dir).await {
            remove_partial(&partial_dir).await;
            return Err(InstallError::filesystem("move extracted package to", &staging_dir, err));
        }

        Ok(StagedPackage {
            name: name.to_string(),
            version: version.clone(),
            path: staging_dir,
        })
    }

    async fn download(&self, url: &str, archive_path: &Path) -> Result<u64, InstallError> {
        let download_error = |source| InstallError::Download {
            url: url.to_string(),
            source,
        };

        let mut stream = self.source.open_stream(url).await.map_err(download_error)?;
        let mut file = fs::File::create(archive_path)
            .await
            .map_err(|err| InstallError::filesystem("create", archive_path, err))?;

        let mut written = 0_u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(download_error)?;
            file.write_all(&chunk)
                .await
                .map_err(|err| InstallError::filesystem("write", archive_path, err))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|err| InstallError::filesystem("flush", archive_path, err))?;
        Ok(written)
    }
}

async fn remove_partial(path: &Path) {
    if let Err(err) = remove_dir_if_exists(path).await {
        warn!(
            path = %path.display(),
            "failed to remove partial extraction: {err}"
        );
    }
}

async fn validate_archive(archive_path: &Path) -> Result<usize, InstallError> {
    let path = archive_path.to_path_buf();
    run_blocking(archive_path, move || {
        let file = File::open(&path).map_err(|err| InstallError::filesystem("open", &path, err))?;
        let archive = ZipArchive::new(file).map_err(|err| InstallError::Archive {
            path: path.clone(),
            message: err.to_string(),
        })?;
        if archive.is_empty() {
            return Err(InstallError::Archive {
                path,
                message: "archive contains no entries".to_string(),
            });
        }
        Ok(archive.len())
    })
    .await
}

async fn extract_archive(archive_path: &Path, destination: &Path) -> Result<(), InstallError> {
    let archive = archive_path.to_path_buf();
    let destination: PathBuf = destination.to_path_buf();
    run_blocking(archive_path, move || {
        let file =
            File::open(&archive).map_err(|err| InstallError::filesystem("open", &archive, err))?;
        let mut zip = ZipArchive::new(file).map_err(|err| InstallError::Archive {
            path: archive.clone(),
            message: err.to_string(),
        })?;
        zip.extract(&destination)
            .map_err(|err| InstallError::Extract {
                archive: archive.clone(),
                destination: destination.clone(),
                message: err.to_string(),
            })
    })
    .await
}

async fn run_blocking<T, F>(path: &Path, task: F) -> Result<T, InstallError>
where
    F: FnOnce() -> Result<T, InstallError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| InstallError::filesystem("run blocking task for", path, io::Error::other(err)))?
}
