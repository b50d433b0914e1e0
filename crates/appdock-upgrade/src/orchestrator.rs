use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use appdock_core::{is_valid_app_name, HostConfig, Settings, TransportError};
use appdock_installer::{
    recover_leftovers, AppsLayout, DeferredSwapScheduler, InstallStateStore, JsonSettingsStore,
    PackageInstaller, RecoveryReport, SettingsStore, SwapReport,
};
use appdock_registry::{HttpSource, ManifestResolver, RemoteSource};
use futures::future::join_all;
use semver::Version;
use tracing::{debug, error, info, warn};

use crate::{BlockingError, UpgradeCoordinator, UpgradeError, UpgradeOutcome, ViewHost};

/// What the shell gets back when it attaches a view to an app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledAppHandle {
    pub name: String,
    pub version: Version,
    /// Live directory the view should serve from.
    pub path: PathBuf,
    /// Version staged behind this view, swapped in at shutdown.
    pub pending: Option<Version>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppStatus {
    pub name: String,
    pub installed: Option<Version>,
    pub available: Option<Version>,
    pub pending: Option<Version>,
    pub loaded: bool,
    pub current: bool,
}

/// Session context owning every component. Built once at startup and torn
/// down by [`Orchestrator::shutdown`].
pub struct Orchestrator {
    config: HostConfig,
    layout: AppsLayout,
    resolver: Arc<ManifestResolver>,
    store: Arc<InstallStateStore>,
    swaps: Arc<DeferredSwapScheduler>,
    coordinator: UpgradeCoordinator,
}

impl Orchestrator {
    /// Starts a session over HTTP with settings persisted to
    /// `<root>/settings.json`.
    pub async fn start_http(
        config: HostConfig,
        root: impl Into<PathBuf>,
        host: Arc<dyn ViewHost>,
    ) -> Result<Self, TransportError> {
        let layout = AppsLayout::new(root);
        let source = Arc::new(HttpSource::new(config.timeouts)?);
        let settings = Arc::new(JsonSettingsStore::new(layout.settings_path()));
        Ok(Self::start(config, layout.root().to_path_buf(), source, settings, host).await)
    }

    pub async fn start(
        config: HostConfig,
        root: impl Into<PathBuf>,
        source: Arc<dyn RemoteSource>,
        persistence: Arc<dyn SettingsStore>,
        host: Arc<dyn ViewHost>,
    ) -> Self {
        let layout = AppsLayout::new(root);
        let settings = match persistence.load().await {
            Ok(settings) => settings,
            Err(err) => {
                warn!("failed to load session settings, starting from defaults: {err}");
                Settings::default()
            }
        }
        .normalized();

        let recovery = recover(&layout, &settings).await;
        let store = Arc::new(InstallStateStore::new(settings, persistence));
        for (name, version) in &recovery.promoted {
            if let Err(err) = store.record_install(name, version).await {
                warn!(app = %name, "failed to persist recovered version: {err}");
            }
        }

        let endpoint = config.endpoint();
        let resolver = Arc::new(ManifestResolver::new(Arc::clone(&source), endpoint.clone()));
        let swaps = Arc::new(DeferredSwapScheduler::new(layout.clone()));
        let installer = PackageInstaller::new(layout.clone(), endpoint, source);
        let coordinator = UpgradeCoordinator::new(
            Arc::clone(&resolver),
            installer,
            Arc::clone(&store),
            Arc::clone(&swaps),
            host,
            config.retry,
        );

        info!(root = %layout.root().display(), base_url = %config.base_url, "session started");
        Self {
            config,
            layout,
            resolver,
            store,
            swaps,
            coordinator,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn layout(&self) -> &AppsLayout {
        &self.layout
    }

    pub fn store(&self) -> &InstallStateStore {
        &self.store
    }

    pub fn coordinator(&self) -> &UpgradeCoordinator {
        &self.coordinator
    }

    /// Brings `name` up to date as far as possible and marks it loaded.
    ///
    /// Only fails when there is no installed content to fall back on; an
    /// installed app whose upgrade fails keeps its current version.
    pub async fn load_or_upgrade(&self, name: &str) -> Result<InstalledAppHandle, BlockingError> {
        if !is_valid_app_name(name) {
            return Err(BlockingError::InvalidName(name.to_string()));
        }

        match self.coordinator.check_and_upgrade(name).await {
            Ok(outcome) => debug!(app = name, ?outcome, "upgrade check finished"),
            Err(err) => {
                let has_live = self.layout.live_dir(name).is_dir();
                match self.store.installed_version(name).await {
                    Some(installed) if has_live => {
                        warn!(app = name, %installed, "upgrade failed, keeping installed version: {err}");
                    }
                    _ => return Err(err),
                }
            }
        }

        let version = self
            .store
            .installed_version(name)
            .await
            .ok_or_else(|| BlockingError::UnknownApp(name.to_string()))?;
        if let Err(err) = self.store.mark_loaded(name).await {
            warn!(app = name, "failed to persist loaded apps: {err}");
        }

        Ok(InstalledAppHandle {
            name: name.to_string(),
            version,
            path: self.layout.live_dir(name),
            pending: self.swaps.pending(name).map(|swap| swap.staged_version),
        })
    }

    /// Apps to re-attach at startup: the persisted loaded set, else the last
    /// active app, else the configured default.
    pub async fn session_apps(&self) -> Vec<String> {
        let loaded = self.store.loaded_apps().await;
        if !loaded.is_empty() {
            return loaded;
        }
        match self.store.current().await {
            Some(current) => vec![current],
            None => vec![self.config.default_app.clone()],
        }
    }

    pub async fn restore_session(&self) -> Vec<(String, Result<InstalledAppHandle, BlockingError>)> {
        let names = self.session_apps().await;
        let loads = names.iter().map(|name| async move {
            (name.clone(), self.load_or_upgrade(name).await)
        });
        join_all(loads).await
    }

    /// Re-fetches the manifest and checks every loaded app against it.
    pub async fn refresh_installed_apps(
        &self,
    ) -> Vec<(String, Result<UpgradeOutcome, BlockingError>)> {
        if let Err(err) = self.resolver.refresh().await {
            warn!("failed to refresh version manifest: {err}");
        }

        let names = self.store.loaded_apps().await;
        let results = self.coordinator.check_and_upgrade_all(&names).await;
        for (name, result) in &results {
            match result {
                Ok(outcome) => debug!(app = %name, ?outcome, "refreshed"),
                Err(err) => warn!(app = %name, "refresh failed: {err}"),
            }
        }
        results
    }

    pub async fn unload(&self, name: &str) -> Result<(), UpgradeError> {
        validate(name)?;
        self.store.mark_unloaded(name).await?;
        info!(app = name, "unloaded");
        Ok(())
    }

    pub async fn activate(&self, name: &str) -> Result<(), UpgradeError> {
        validate(name)?;
        self.store.set_current(name).await?;
        Ok(())
    }

    /// Unloads `name`, deletes its live and staged packages and forgets it.
    pub async fn remove(&self, name: &str) -> Result<(), UpgradeError> {
        validate(name)?;
        let _guard = self.coordinator.lock_app(name).await;

        self.store.mark_unloaded(name).await?;
        self.swaps.discard(name).await;
        let live = self.layout.live_dir(name);
        match tokio::fs::remove_dir_all(&live).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(UpgradeError::Filesystem {
                    action: "remove",
                    path: live,
                    source,
                });
            }
        }
        self.store.forget(name).await?;
        info!(app = name, "removed");
        Ok(())
    }

    pub async fn status(&self) -> Vec<AppStatus> {
        let manifest = match self.resolver.resolve().await {
            Ok(manifest) => Some(manifest),
            Err(err) => {
                debug!("version manifest unavailable for status: {err}");
                None
            }
        };
        let settings = self.store.snapshot().await;

        let names = settings
            .apps
            .keys()
            .chain(settings.loaded_apps.iter())
            .cloned()
            .collect::<BTreeSet<_>>();
        names
            .into_iter()
            .map(|name| AppStatus {
                installed: settings.apps.get(&name).cloned(),
                available: manifest
                    .as_ref()
                    .and_then(|manifest| manifest.latest(&name).cloned()),
                pending: self.swaps.pending(&name).map(|swap| swap.staged_version),
                loaded: settings.loaded_apps.contains(&name),
                current: settings.current.as_deref() == Some(name.as_str()),
                name,
            })
            .collect()
    }

    /// Applies every pending swap. Blocks until done and ends the session.
    pub async fn shutdown(self) -> SwapReport {
        let swaps = Arc::clone(&self.swaps);
        let report = match tokio::task::spawn_blocking(move || swaps.apply_pending_swaps()).await {
            Ok(report) => report,
            Err(err) => {
                error!("shutdown swap task failed: {err}");
                SwapReport::default()
            }
        };

        for swap in &report.applied {
            if let Err(err) = self.store.record_install(&swap.name, &swap.staged_version).await {
                warn!(app = %swap.name, "failed to persist swapped version: {err}");
            }
        }
        info!(
            applied = report.applied.len(),
            missing = report.missing.len(),
            failed = report.failed.len(),
            "session shut down"
        );
        report
    }
}

fn validate(name: &str) -> Result<(), UpgradeError> {
    if is_valid_app_name(name) {
        Ok(())
    } else {
        Err(UpgradeError::InvalidName(name.to_string()))
    }
}

async fn recover(layout: &AppsLayout, settings: &Settings) -> RecoveryReport {
    let mut known: BTreeMap<String, Option<Version>> = settings
        .apps
        .iter()
        .map(|(name, version)| (name.clone(), Some(version.clone())))
        .collect();
    for name in settings.loaded_apps.iter().chain(settings.current.iter()) {
        known.entry(name.clone()).or_insert(None);
    }

    let layout = layout.clone();
    match tokio::task::spawn_blocking(move || recover_leftovers(&layout, &known)).await {
        Ok(report) => {
            if report != RecoveryReport::default() {
                info!(
                    promoted = report.promoted.len(),
                    removed_staging = report.removed_staging.len(),
                    restored_live = report.restored_live.len(),
                    removed_archives = report.removed_archives.len(),
                    "recovered leftovers of an earlier session"
                );
            }
            report
        }
        Err(err) => {
            warn!("startup recovery task failed: {err}");
            RecoveryReport::default()
        }
    }
}
