//! Default locations of settings files

use std::path::PathBuf;

/// Directory holding the engine's settings: `<config dir>/ae`
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ae")
}

/// `<config dir>/ae/audio.yaml`
pub fn default_config_path() -> PathBuf {
    config_dir().join("audio.yaml")
}
