use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use appdock_core::{InstalledApp, Settings, StorageError};
use async_trait::async_trait;
use semver::Version;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

/// Durable key-value home of [`Settings`].
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self) -> Result<Settings, StorageError>;
    async fn save(&self, settings: &Settings) -> Result<(), StorageError>;
}

/// Stores settings as pretty JSON; writes go to a sibling temp file first and
/// are renamed into place.
#[derive(Debug, Clone)]
pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut file_name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "settings.json".into());
        file_name.push(".tmp");
        self.path.with_file_name(file_name)
    }
}

#[async_trait]
impl SettingsStore for JsonSettingsStore {
    async fn load(&self) -> Result<Settings, StorageError> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Settings::default()),
            Err(source) => {
                return Err(StorageError::Io {
                    action: "read",
                    path: self.path.clone(),
                    source,
                });
            }
        };

        Settings::from_json_str(&raw).map_err(|source| StorageError::Malformed {
            path: self.path.clone(),
            source,
        })
    }

    async fn save(&self, settings: &Settings) -> Result<(), StorageError> {
        let payload = settings.to_json_string().map_err(StorageError::Serialize)?;
        let io_error = |action, source| StorageError::Io {
            action,
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| io_error("create directory for", err))?;
        }
        let tmp_path = self.tmp_path();
        fs::write(&tmp_path, payload.as_bytes())
            .await
            .map_err(|err| io_error("write", err))?;
        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|err| io_error("replace", err))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SessionState {
    current: Option<String>,
    loaded_apps: Vec<String>,
    installed: BTreeMap<String, Version>,
}

impl SessionState {
    fn to_settings(&self) -> Settings {
        Settings {
            current: self.current.clone(),
            loaded_apps: self.loaded_apps.clone(),
            apps: self.installed.clone(),
        }
    }
}

/// In-memory installed/loaded state with write-through persistence.
///
/// A failed save is returned to the caller but never rolls back the in-memory
/// change; the memory copy stays authoritative for the session.
pub struct InstallStateStore {
    state: Mutex<SessionState>,
    persistence: Arc<dyn SettingsStore>,
}

impl InstallStateStore {
    pub fn new(settings: Settings, persistence: Arc<dyn SettingsStore>) -> Self {
        let settings = settings.normalized();
        Self {
            state: Mutex::new(SessionState {
                current: settings.current,
                loaded_apps: settings.loaded_apps,
                installed: settings.apps,
            }),
            persistence,
        }
    }

    pub async fn get(&self, name: &str) -> Option<InstalledApp> {
        let state = self.state.lock().await;
        let installed_version = state.installed.get(name).cloned();
        let loaded = state.loaded_apps.iter().any(|loaded| loaded == name);
        if installed_version.is_none() && !loaded {
            return None;
        }
        Some(InstalledApp {
            name: name.to_string(),
            installed_version,
            loaded,
        })
    }

    pub async fn is_loaded(&self, name: &str) -> bool {
        self.state
            .lock()
            .await
            .loaded_apps
            .iter()
            .any(|loaded| loaded == name)
    }

    pub async fn installed_version(&self, name: &str) -> Option<Version> {
        self.state.lock().await.installed.get(name).cloned()
    }

    pub async fn loaded_apps(&self) -> Vec<String> {
        self.state.lock().await.loaded_apps.clone()
    }

    pub async fn installed_apps(&self) -> BTreeMap<String, Version> {
        self.state.lock().await.installed.clone()
    }

    pub async fn current(&self) -> Option<String> {
        self.state.lock().await.current.clone()
    }

    pub async fn snapshot(&self) -> Settings {
        self.state.lock().await.to_settings()
    }

    pub async fn record_install(&self, name: &str, version: &Version) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if state.installed.get(name) == Some(version) {
            return Ok(());
        }
        state.installed.insert(name.to_string(), version.clone());
        debug!(app = name, %version, "recorded installed version");
        self.persist(&state).await
    }

    pub async fn mark_loaded(&self, name: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if state.loaded_apps.iter().any(|loaded| loaded == name) {
            return Ok(());
        }
        state.loaded_apps.push(name.to_string());
        self.persist(&state).await
    }

    /// Removes `name` from the loaded set; a `current` pointing at it is cleared.
    pub async fn mark_unloaded(&self, name: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let before = state.loaded_apps.len();
        state.loaded_apps.retain(|loaded| loaded != name);
        let was_current = state.current.as_deref() == Some(name);
        if was_current {
            state.current = None;
        }
        if before == state.loaded_apps.len() && !was_current {
            return Ok(());
        }
        self.persist(&state).await
    }

    pub async fn set_current(&self, name: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if state.current.as_deref() == Some(name) {
            return Ok(());
        }
        state.current = Some(name.to_string());
        self.persist(&state).await
    }

    /// Drops every trace of `name`; used once its package is removed from disk.
    pub async fn forget(&self, name: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let removed = state.installed.remove(name).is_some();
        let before = state.loaded_apps.len();
        state.loaded_apps.retain(|loaded| loaded != name);
        let was_current = state.current.as_deref() == Some(name);
        if was_current {
            state.current = None;
        }
        if !removed && before == state.loaded_apps.len() && !was_current {
            return Ok(());
        }
        self.persist(&state).await
    }

    async fn persist(&self, state: &SessionState) -> Result<(), StorageError> {
        self.persistence.save(&state.to_settings()).await
    }
}
