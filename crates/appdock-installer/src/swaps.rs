use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use appdock_core::PendingSwap;
use semver::Version;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::fs_utils::{
    copy_dir_recursive, dir_has_entries, remove_dir_if_exists, remove_dir_if_exists_blocking,
};
use crate::AppsLayout;

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("staged directory {} does not exist", path.display())]
    MissingStaging { path: PathBuf },
    #[error("staged directory {} is empty", path.display())]
    EmptyStaging { path: PathBuf },
    #[error("failed to {action} {}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SwapError {
    fn io(action: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Default)]
pub struct SwapReport {
    pub applied: Vec<PendingSwap>,
    pub missing: Vec<PendingSwap>,
    pub failed: Vec<(PendingSwap, SwapError)>,
}

/// Holds at most one staged upgrade per app until a safe point, then swaps
/// each one into its live directory.
pub struct DeferredSwapScheduler {
    layout: AppsLayout,
    pending: Mutex<BTreeMap<String, PendingSwap>>,
}

impl DeferredSwapScheduler {
    pub fn new(layout: AppsLayout) -> Self {
        Self {
            layout,
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    /// Records `swap`, replacing any earlier entry for the same app. The
    /// superseded staged directory is deleted.
    pub async fn record(&self, swap: PendingSwap) -> Option<PendingSwap> {
        let name = swap.name.clone();
        let new_path = swap.staged_path.clone();
        let superseded = self.lock().insert(name.clone(), swap);

        if let Some(previous) = &superseded {
            if previous.staged_path != new_path {
                if let Err(err) = remove_dir_if_exists(&previous.staged_path).await {
                    warn!(
                        app = %name,
                        path = %previous.staged_path.display(),
                        "failed to remove superseded staged package: {err}"
                    );
                }
            }
            debug!(
                app = %name,
                superseded = %previous.staged_version,
                "replaced pending swap"
            );
        }
        superseded
    }

    pub fn pending(&self, name: &str) -> Option<PendingSwap> {
        self.lock().get(name).cloned()
    }

    pub fn pending_swaps(&self) -> Vec<PendingSwap> {
        self.lock().values().cloned().collect()
    }

    pub fn take(&self, name: &str) -> Option<PendingSwap> {
        self.lock().remove(name)
    }

    /// Forgets the pending swap for `name` and deletes its staged directory.
    pub async fn discard(&self, name: &str) -> Option<PendingSwap> {
        let discarded = self.take(name)?;
        if let Err(err) = remove_dir_if_exists(&discarded.staged_path).await {
            warn!(
                app = %name,
                path = %discarded.staged_path.display(),
                "failed to remove discarded staged package: {err}"
            );
        }
        Some(discarded)
    }

    /// Drains every pending swap and applies it. Blocks until done; failures
    /// are logged and their staged directories stay on disk so startup
    /// recovery can retry them.
    pub fn apply_pending_swaps(&self) -> SwapReport {
        let drained = std::mem::take(&mut *self.lock());
        let mut report = SwapReport::default();

        for (name, swap) in drained {
            if !swap.staged_path.is_dir() {
                warn!(
                    app = %name,
                    path = %swap.staged_path.display(),
                    "staged package vanished before swap"
                );
                report.missing.push(swap);
                continue;
            }

            match promote_staged(&self.layout, &name, &swap.staged_path) {
                Ok(()) => {
                    info!(app = %name, version = %swap.staged_version, "applied pending swap");
                    report.applied.push(swap);
                }
                Err(err) => {
                    error!(
                        app = %name,
                        version = %swap.staged_version,
                        "pending swap failed, leaving staged package for next launch: {err}"
                    );
                    report.failed.push((swap, err));
                }
            }
        }

        report
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, PendingSwap>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Replaces `apps/{name}` with `staged`.
///
/// The live directory is first renamed to `apps/.{name}.old`, the staged
/// directory is renamed into place, then the old copy is deleted. If the
/// second rename fails the old copy is renamed back. When rename is not
/// possible (staging on another device) the package is copied instead, and a
/// crash mid-copy leaves a partial live directory with the old copy still in
/// the trash path for recovery.
pub fn promote_staged(layout: &AppsLayout, name: &str, staged: &Path) -> Result<(), SwapError> {
    if !staged.is_dir() {
        return Err(SwapError::MissingStaging {
            path: staged.to_path_buf(),
        });
    }
    if !dir_has_entries(staged).map_err(|err| SwapError::io("read", staged, err))? {
        return Err(SwapError::EmptyStaging {
            path: staged.to_path_buf(),
        });
    }

    let live = layout.live_dir(name);
    let trash = layout.trash_dir(name);
    remove_dir_if_exists_blocking(&trash)
        .map_err(|err| SwapError::io("clear stale trash directory", &trash, err))?;

    let had_live = live.exists();
    if had_live {
        fs::rename(&live, &trash).map_err(|err| SwapError::io("move aside", &live, err))?;
    }

    if let Err(rename_err) = fs::rename(staged, &live) {
        debug!(
            app = name,
            "rename of staged package failed, copying instead: {rename_err}"
        );
        if let Err(copy_err) = copy_dir_recursive(staged, &live) {
            if let Err(err) = remove_dir_if_exists_blocking(&live) {
                warn!(
                    path = %live.display(),
                    "failed to remove partially copied package: {err}"
                );
            }
            if had_live {
                if let Err(restore_err) = fs::rename(&trash, &live) {
                    error!(
                        app = name,
                        "failed to restore previous live package: {restore_err}"
                    );
                }
            }
            return Err(SwapError::io("copy staged package into", &live, copy_err));
        }
        if let Err(err) = remove_dir_if_exists_blocking(staged) {
            warn!(
                path = %staged.display(),
                "failed to remove copied staged package: {err}"
            );
        }
    }

    if let Err(err) = remove_dir_if_exists_blocking(&trash) {
        warn!(
            path = %trash.display(),
            "failed to remove previous live package: {err}"
        );
    }
    Ok(())
}

pub async fn promote_staged_async(
    layout: &AppsLayout,
    name: &str,
    staged: &Path,
) -> Result<(), SwapError> {
    let layout = layout.clone();
    let name_owned = name.to_string();
    let staged_owned = staged.to_path_buf();
    tokio::task::spawn_blocking(move || promote_staged(&layout, &name_owned, &staged_owned))
        .await
        .map_err(|err| SwapError::io("run swap task for", staged, io::Error::other(err)))?
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub promoted: Vec<(String, Version)>,
    pub removed_staging: Vec<PathBuf>,
    pub restored_live: Vec<String>,
    pub removed_archives: Vec<PathBuf>,
}

/// Startup pass over `apps/` for leftovers of an earlier session: stale
/// downloads, trash directories and staged packages without a pending swap.
///
/// Interrupted extractions are deleted. Per app, only the highest staged
/// package newer than the recorded installed version is promoted (nothing is
/// attached yet at startup); every other staged package is deleted.
/// `installed` maps every known app name to its recorded version.
pub fn recover_leftovers(
    layout: &AppsLayout,
    installed: &BTreeMap<String, Option<Version>>,
) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    let apps_dir = layout.apps_dir();
    let entries = match fs::read_dir(&apps_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return report,
        Err(err) => {
            warn!(path = %apps_dir.display(), "failed to scan apps directory: {err}");
            return report;
        }
    };

    let mut staged: BTreeMap<String, Vec<(Version, PathBuf)>> = BTreeMap::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let Ok(file_type) = entry.file_type() else {
            continue;
        };

        if file_type.is_file() && file_name.ends_with(".zip") {
            match fs::remove_file(&path) {
                Ok(()) => report.removed_archives.push(path),
                Err(err) => warn!(path = %path.display(), "failed to remove stale archive: {err}"),
            }
            continue;
        }
        if !file_type.is_dir() {
            continue;
        }

        if AppsLayout::is_partial_dir(&file_name) {
            match remove_dir_if_exists_blocking(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "removed interrupted extraction");
                    report.removed_staging.push(path);
                }
                Err(err) => warn!(path = %path.display(), "failed to remove interrupted extraction: {err}"),
            }
            continue;
        }

        if let Some(name) = AppsLayout::trashed_app_name(&file_name) {
            let live = layout.live_dir(name);
            if live.exists() {
                if let Err(err) = remove_dir_if_exists_blocking(&path) {
                    warn!(path = %path.display(), "failed to remove trash directory: {err}");
                }
            } else {
                match fs::rename(&path, &live) {
                    Ok(()) => {
                        info!(app = name, "restored live package from interrupted swap");
                        report.restored_live.push(name.to_string());
                    }
                    Err(err) => warn!(app = name, "failed to restore live package: {err}"),
                }
            }
            continue;
        }

        if let Some((name, version)) = match_staging_dir(installed, &file_name) {
            staged.entry(name).or_default().push((version, path));
        }
    }

    for (name, mut candidates) in staged {
        candidates.sort_by(|(left, _), (right, _)| right.cmp(left));
        let recorded = installed.get(&name).cloned().flatten();
        let mut promoted = false;
        for (version, path) in candidates {
            let newer = recorded.as_ref().map_or(true, |current| version > *current);
            if !promoted && newer {
                match promote_staged(layout, &name, &path) {
                    Ok(()) => {
                        info!(app = %name, %version, "promoted leftover staged package");
                        report.promoted.push((name.clone(), version));
                        promoted = true;
                        continue;
                    }
                    Err(err) => warn!(
                        app = %name,
                        %version,
                        "failed to promote leftover staged package, removing it: {err}"
                    ),
                }
            }

            match remove_dir_if_exists_blocking(&path) {
                Ok(()) => {
                    debug!(app = %name, %version, "removed leftover staged package");
                    report.removed_staging.push(path);
                }
                Err(err) => warn!(path = %path.display(), "failed to remove leftover staged package: {err}"),
            }
        }
    }

    report
}

fn match_staging_dir(
    installed: &BTreeMap<String, Option<Version>>,
    dir_name: &str,
) -> Option<(String, Version)> {
    if installed.contains_key(dir_name) {
        return None;
    }
    installed
        .keys()
        .filter_map(|name| {
            AppsLayout::staged_version(name, dir_name).map(|version| (name.clone(), version))
        })
        .max_by_key(|(name, _)| name.len())
}
