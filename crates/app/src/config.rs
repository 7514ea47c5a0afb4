use anyhow::{Context, Result};
use shared::settings::GatewaySettings;
use std::fs;
use std::path::{Path, PathBuf};

pub fn config_path() -> Option<PathBuf> {
    let proj = directories::ProjectDirs::from("com.local", "Little Helper", "LittleHelper")?;
    let _ = fs::create_dir_all(proj.config_dir());
    Some(proj.config_dir().join("settings.json"))
}

/// Settings from disk, or defaults on first run. The flag is true for a
/// fresh install.
pub fn load_settings_or_default() -> (GatewaySettings, bool) {
    if let Some(path) = config_path() {
        if path.exists() {
            match load_settings_from(&path) {
                Ok(settings) => return (settings, false),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable settings"),
            }
        }
    }
    (GatewaySettings::default(), true)
}

pub fn load_settings_from(path: &Path) -> Result<GatewaySettings> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

pub fn save_settings(settings: &GatewaySettings) -> Result<()> {
    match config_path() {
        Some(path) => save_settings_to(&path, settings),
        None => Ok(()),
    }
}

pub fn save_settings_to(path: &Path, settings: &GatewaySettings) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(settings)?;
    fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}
