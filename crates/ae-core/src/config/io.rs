//! YAML persistence for settings

use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Parse a YAML file into `T`
pub fn read_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {:?}", path))?;
    serde_yaml::from_str(&contents).with_context(|| format!("Invalid settings in {:?}", path))
}

/// Load settings, falling back to defaults
///
/// A missing file is normal on first start. An unreadable or malformed one
/// is logged and ignored.
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        log::info!("Config: {:?} not found, using defaults", path);
        return T::default();
    }
    match read_config(path) {
        Ok(config) => {
            log::info!("Config: loaded {:?}", path);
            config
        }
        Err(e) => {
            log::warn!("Config: {:#}, using defaults", e);
            T::default()
        }
    }
}

/// Write settings as YAML, creating parent directories as needed
pub fn save_config<T>(config: &T, path: &Path) -> Result<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create settings directory: {:?}", parent))?;
    }
    let yaml = serde_yaml::to_string(config).context("Failed to serialize settings")?;
    std::fs::write(path, yaml).with_context(|| format!("Failed to write settings file: {:?}", path))?;
    log::info!("Config: saved {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AudioSettings, ConfigMode};
    use crate::types::StdLayout;

    #[test]
    fn test_missing_file_gives_defaults() {
        let settings: AudioSettings = load_config(Path::new("/nonexistent/ae/audio.yaml"));
        assert_eq!(settings, AudioSettings::default());
    }

    #[test]
    fn test_settings_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("audio.yaml");

        let mut settings = AudioSettings::default();
        settings.config_mode = ConfigMode::Fixed;
        settings.channels = StdLayout::L5_1;
        settings.sample_rate = 44100;
        settings.passthrough.enabled = true;

        save_config(&settings, &path).unwrap();
        let loaded: AudioSettings = load_config(&path);
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_malformed_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.yaml");
        std::fs::write(&path, "sample_rate: [not, a, number").unwrap();

        assert!(read_config::<AudioSettings>(&path).is_err());
        let settings: AudioSettings = load_config(&path);
        assert_eq!(settings, AudioSettings::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.yaml");
        std::fs::write(&path, "device: \"null:test\"\nchannels: \"5.1\"\n").unwrap();

        let settings: AudioSettings = load_config(&path);
        assert_eq!(settings.device, "null:test");
        assert_eq!(settings.channels, StdLayout::L5_1);
        assert_eq!(settings.sample_rate, AudioSettings::default().sample_rate);
    }
}
