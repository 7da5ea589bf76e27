use std::{
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::CastleConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["castle.toml", "castle.yaml", "castle.yml", "castle.json"];

/// Overrides the gateway url from the environment.
pub const GATEWAY_URL_ENV: &str = "OPENCLAW_GATEWAY_URL";

static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Pin config discovery to a single directory. Each call replaces the
/// previous override.
pub fn set_config_dir(path: PathBuf) {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(path);
}

/// Restore default discovery.
pub fn clear_config_dir() {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = None;
}

fn config_dir_override() -> Option<PathBuf> {
    CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<CastleConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    let mut config = parse_config(&raw, path)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Discover and load config from standard locations.
///
/// Returns defaults (plus environment overrides) when no file is found or
/// the file fails to parse.
pub fn discover_and_load() -> CastleConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    let mut config = CastleConfig::default();
    apply_env_overrides(&mut config);
    config
}

fn apply_env_overrides(config: &mut CastleConfig) {
    if let Ok(url) = std::env::var(GATEWAY_URL_ENV)
        && !url.trim().is_empty()
    {
        config.gateway.url = url.trim().to_string();
    }
}

/// When a config dir override is set, only that directory is searched.
fn find_config_file() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return first_existing(&dir);
    }

    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    config_dir().and_then(|dir| first_existing(&dir))
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the config directory: override, or `~/.config/castle/`.
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return Some(dir);
    }
    home_dir().map(|h| h.join(".config").join("castle"))
}

/// Returns the data directory: `~/.castle/`.
pub fn data_dir() -> PathBuf {
    home_dir()
        .map(|h| h.join(".castle"))
        .unwrap_or_else(|| PathBuf::from(".castle"))
}

pub(crate) fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<CastleConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
