use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use appdock_core::HostConfig;

pub const CONFIG_FILE: &str = "appdock.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub root: PathBuf,
    pub host: HostConfig,
}

pub fn default_root() -> Result<PathBuf> {
    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows data root")?;
        return Ok(PathBuf::from(app_data).join("Appdock"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve data root")?;
    Ok(PathBuf::from(home).join(".appdock"))
}

/// Config precedence: `--config`, then `<root>/appdock.toml`, then defaults.
/// Command-line flags win over the file.
pub fn resolve_config(
    root_flag: Option<&Path>,
    config_flag: Option<&Path>,
    base_url_flag: Option<&str>,
) -> Result<ResolvedConfig> {
    let mut host = match config_flag {
        Some(path) => read_config(path)?,
        None => {
            let root = match root_flag {
                Some(root) => root.to_path_buf(),
                None => default_root()?,
            };
            let path = root.join(CONFIG_FILE);
            if path.is_file() {
                read_config(&path)?
            } else {
                HostConfig::default()
            }
        }
    };

    if let Some(base_url) = base_url_flag {
        host.base_url = base_url.to_string();
    }
    let root = match (root_flag, host.root.as_ref()) {
        (Some(root), _) => root.to_path_buf(),
        (None, Some(root)) => root.clone(),
        (None, None) => default_root()?,
    };
    host.root = Some(root.clone());
    host.validate()?;

    Ok(ResolvedConfig { root, host })
}

fn read_config(path: &Path) -> Result<HostConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    HostConfig::from_toml_str(&raw)
        .with_context(|| format!("failed to load config: {}", path.display()))
}
