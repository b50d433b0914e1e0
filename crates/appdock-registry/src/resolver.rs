use std::sync::Arc;

use appdock_core::{ManifestError, PackageEndpoint, VersionManifest};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::RemoteSource;

/// Fetches `versions.json` once per session and hands out the cached snapshot.
///
/// Concurrent callers queue on the cache lock, so a startup sweep over many
/// apps issues a single request.
pub struct ManifestResolver {
    source: Arc<dyn RemoteSource>,
    endpoint: PackageEndpoint,
    cache: Mutex<Option<Arc<VersionManifest>>>,
}

impl ManifestResolver {
    pub fn new(source: Arc<dyn RemoteSource>, endpoint: PackageEndpoint) -> Self {
        Self {
            source,
            endpoint,
            cache: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &PackageEndpoint {
        &self.endpoint
    }

    pub async fn resolve(&self) -> Result<Arc<VersionManifest>, ManifestError> {
        let mut cache = self.cache.lock().await;
        if let Some(manifest) = cache.as_ref() {
            return Ok(Arc::clone(manifest));
        }

        let manifest = Arc::new(self.fetch().await?);
        *cache = Some(Arc::clone(&manifest));
        Ok(manifest)
    }

    /// Bypasses the cache. A failed refresh keeps the previous snapshot.
    pub async fn refresh(&self) -> Result<Arc<VersionManifest>, ManifestError> {
        let mut cache = self.cache.lock().await;
        let manifest = Arc::new(self.fetch().await?);
        *cache = Some(Arc::clone(&manifest));
        Ok(manifest)
    }

    pub async fn invalidate(&self) {
        self.cache.lock().await.take();
    }

    pub async fn cached(&self) -> Option<Arc<VersionManifest>> {
        self.cache.lock().await.clone()
    }

    async fn fetch(&self) -> Result<VersionManifest, ManifestError> {
        let url = self.endpoint.manifest_url();
        debug!(%url, "fetching version manifest");
        let body = self.source.fetch_text(&url).await?;
        let manifest = VersionManifest::from_json_str(&body)?;
        info!(%url, apps = manifest.len(), "resolved version manifest");
        Ok(manifest)
    }
}
