use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use appdock_core::{is_valid_app_name, InstallError, InstallStage, RetryConfig, StagedPackage};
use appdock_installer::{
    promote_staged_async, DeferredSwapScheduler, InstallStateStore, PackageInstaller,
};
use appdock_registry::ManifestResolver;
use futures::future::join_all;
use semver::Version;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::{BlockingError, ViewHost};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// Installed version already matches the manifest, or the manifest has
    /// no entry for an installed app.
    UpToDate { version: Version },
    /// A new version was installed straight into the live directory.
    Promoted {
        previous: Option<Version>,
        version: Version,
    },
    /// A new version was staged behind a loaded app.
    Staged { installed: Version, version: Version },
    AlreadyStaged { installed: Version, version: Version },
    ManifestUnavailable { installed: Version },
    /// A background install for a loaded app failed; the installed version
    /// keeps serving.
    Abandoned {
        installed: Version,
        target: Version,
        reason: String,
    },
}

/// Decides per app whether a newer version exists and whether it goes live
/// now or waits behind a running view for the shutdown swap.
pub struct UpgradeCoordinator {
    resolver: Arc<ManifestResolver>,
    installer: PackageInstaller,
    store: Arc<InstallStateStore>,
    swaps: Arc<DeferredSwapScheduler>,
    host: Arc<dyn ViewHost>,
    retry: RetryConfig,
    in_flight: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl UpgradeCoordinator {
    pub fn new(
        resolver: Arc<ManifestResolver>,
        installer: PackageInstaller,
        store: Arc<InstallStateStore>,
        swaps: Arc<DeferredSwapScheduler>,
        host: Arc<dyn ViewHost>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            resolver,
            installer,
            store,
            swaps,
            host,
            retry,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Serializes all install work for `name`. A second caller waits here and
    /// then sees the first caller's result in the state store.
    pub(crate) async fn lock_app(&self, name: &str) -> AppLock<'_> {
        let lock = {
            let mut in_flight = self.in_flight();
            Arc::clone(in_flight.entry(name.to_string()).or_default())
        };
        AppLock {
            in_flight: &self.in_flight,
            name: name.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    pub(crate) fn in_flight_len(&self) -> usize {
        self.in_flight().len()
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn check_and_upgrade(&self, name: &str) -> Result<UpgradeOutcome, BlockingError> {
        if !is_valid_app_name(name) {
            return Err(BlockingError::InvalidName(name.to_string()));
        }
        let _guard = self.lock_app(name).await;

        let recorded = self.store.installed_version(name).await;
        let has_live = is_dir(&self.installer.layout().live_dir(name)).await;
        let usable = match recorded {
            Some(version) if has_live => Some(version),
            Some(version) => {
                warn!(app = name, %version, "live package missing, reinstalling");
                None
            }
            None => None,
        };

        let manifest = match self.resolver.resolve().await {
            Ok(manifest) => manifest,
            Err(err) => {
                return match usable {
                    Some(installed) => {
                        warn!(app = name, %installed, "version manifest unavailable, keeping installed version: {err}");
                        Ok(UpgradeOutcome::ManifestUnavailable { installed })
                    }
                    None => Err(BlockingError::ManifestUnavailable {
                        name: name.to_string(),
                        source: err,
                    }),
                };
            }
        };

        let Some(target) = manifest.latest(name).cloned() else {
            return match usable {
                Some(version) => {
                    debug!(app = name, "no manifest entry, keeping installed version");
                    Ok(UpgradeOutcome::UpToDate { version })
                }
                None => Err(BlockingError::UnknownApp(name.to_string())),
            };
        };

        let loaded = self.store.is_loaded(name).await;
        match usable {
            Some(installed) if loaded => self.stage_behind_live(name, installed, target).await,
            _ => self.install_live(name, usable, target).await,
        }
    }

    /// Runs [`Self::check_and_upgrade`] for every name concurrently.
    pub async fn check_and_upgrade_all(
        &self,
        names: &[String],
    ) -> Vec<(String, Result<UpgradeOutcome, BlockingError>)> {
        let checks = names.iter().map(|name| async move {
            (name.clone(), self.check_and_upgrade(name).await)
        });
        join_all(checks).await
    }

    async fn stage_behind_live(
        &self,
        name: &str,
        installed: Version,
        target: Version,
    ) -> Result<UpgradeOutcome, BlockingError> {
        if let Some(pending) = self.swaps.pending(name) {
            if pending.staged_version >= target {
                return Ok(UpgradeOutcome::AlreadyStaged {
                    installed,
                    version: pending.staged_version,
                });
            }
        }
        if installed >= target {
            // A staged package older than the live one must never be swapped in.
            self.swaps.discard(name).await;
            return Ok(UpgradeOutcome::UpToDate { version: installed });
        }

        info!(app = name, %installed, %target, "staging upgrade behind loaded app");
        match self.installer.install(name, &target).await {
            Ok(staged) => {
                self.swaps.record(staged.into()).await;
                self.host.notify_upgraded(name, &target);
                Ok(UpgradeOutcome::Staged {
                    installed,
                    version: target,
                })
            }
            Err(err) => {
                warn!(
                    app = name,
                    version = %target,
                    stage = err.stage().as_str(),
                    "background upgrade abandoned: {err}"
                );
                Ok(UpgradeOutcome::Abandoned {
                    installed,
                    target,
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn install_live(
        &self,
        name: &str,
        previous: Option<Version>,
        target: Version,
    ) -> Result<UpgradeOutcome, BlockingError> {
        if let Some(pending) = self.swaps.pending(name) {
            let fresher = previous
                .as_ref()
                .map_or(true, |installed| pending.staged_version > *installed);
            if fresher && pending.staged_version >= target {
                self.swaps.take(name);
                let staged = StagedPackage {
                    name: pending.name,
                    version: pending.staged_version,
                    path: pending.staged_path,
                };
                debug!(app = name, version = %staged.version, "promoting pending swap of unloaded app");
                return self.promote(staged, previous).await;
            }
            self.swaps.discard(name).await;
        }

        if let Some(installed) = previous.as_ref().filter(|installed| **installed >= target) {
            return Ok(UpgradeOutcome::UpToDate {
                version: installed.clone(),
            });
        }

        info!(app = name, version = %target, "installing into live directory");
        let staged = self
            .install_with_retry(name, &target)
            .await
            .map_err(|source| BlockingError::InstallFailed {
                name: name.to_string(),
                version: target.clone(),
                source,
            })?;
        self.promote(staged, previous).await
    }

    async fn promote(
        &self,
        staged: StagedPackage,
        previous: Option<Version>,
    ) -> Result<UpgradeOutcome, BlockingError> {
        let layout = self.installer.layout();
        if let Err(source) = promote_staged_async(layout, &staged.name, &staged.path).await {
            remove_staging(&staged.path).await;
            return Err(BlockingError::Swap {
                name: staged.name,
                version: staged.version,
                source,
            });
        }

        if let Err(err) = self.store.record_install(&staged.name, &staged.version).await {
            warn!(app = %staged.name, "failed to persist installed version: {err}");
        }
        info!(app = %staged.name, version = %staged.version, "package is live");
        Ok(UpgradeOutcome::Promoted {
            previous,
            version: staged.version,
        })
    }

    async fn install_with_retry(
        &self,
        name: &str,
        version: &Version,
    ) -> Result<StagedPackage, InstallError> {
        let mut attempt = 0;
        let mut download_failures = 0;
        let mut archive_failures = 0;
        loop {
            attempt += 1;
            let err = match self.installer.install(name, version).await {
                Ok(staged) => return Ok(staged),
                Err(err) => err,
            };

            let retry = match err.stage() {
                InstallStage::Download if err.is_retryable() => {
                    download_failures += 1;
                    download_failures < self.retry.download_attempts
                }
                InstallStage::Archive => {
                    archive_failures += 1;
                    archive_failures < self.retry.archive_attempts
                }
                _ => false,
            };
            if !retry {
                return Err(err);
            }

            let delay = self.retry.backoff(attempt);
            warn!(
                app = name,
                %version,
                attempt,
                stage = err.stage().as_str(),
                "install failed, retrying in {delay:?}: {err}"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Held for the duration of one app's install work. The app's entry leaves
/// the lock table once no other caller holds or awaits it.
pub(crate) struct AppLock<'a> {
    in_flight: &'a Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for AppLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight
            .get(&self.name)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            in_flight.remove(&self.name);
        }
    }
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|metadata| metadata.is_dir())
        .unwrap_or(false)
}

async fn remove_staging(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), "failed to remove staged package: {err}"),
    }
}
