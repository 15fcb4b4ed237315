//! Output device abstraction and backend registry
//!
//! Devices are named `driver:device`, e.g. `null:test` or `cpal:default`.
//! A name without a driver prefix goes to the first backend that lists
//! the device, falling back to the first backend for `default`.

use std::fmt;

use crate::buffer::SamplePacket;
use crate::error::{AeError, AeResult};
use crate::types::AudioFormat;

/// Information about an output device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// Backend driver name, e.g. "null" or "cpal"
    pub driver: String,
    /// Device name as the backend knows it
    pub name: String,
    /// Human-readable name
    pub display_name: String,
    pub is_default: bool,
    /// Supported sample rates (common ones)
    pub sample_rates: Vec<u32>,
    pub max_channels: u16,
    /// Accepts bitstream formats
    pub passthrough: bool,
}

impl DeviceInfo {
    /// Name to put into the settings
    pub fn id(&self) -> String {
        format!("{}:{}", self.driver, self.name)
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.driver, self.display_name)
    }
}

/// Split `driver:device`; names without a known driver have none
pub fn parse_device_name<'a>(name: &'a str, drivers: &[&str]) -> (Option<&'a str>, &'a str) {
    if let Some((driver, device)) = name.split_once(':') {
        if drivers.contains(&driver) {
            let device = if device.is_empty() { "default" } else { device };
            return (Some(driver), device);
        }
    }
    let device = if name.is_empty() { "default" } else { name };
    (None, device)
}

/// One open output device
///
/// All calls come from the sink thread. `add_packets` blocks until the
/// device has room; it may legitimately return 0 now and then.
pub trait AudioDevice: Send {
    /// Open the device for `format`, adjusting it to what the device runs with
    fn initialize(&mut self, format: &mut AudioFormat) -> AeResult<()>;

    fn deinitialize(&mut self);

    /// Write `frames` frames starting at frame `offset` of `pkt`
    ///
    /// Returns the number of frames written.
    fn add_packets(&mut self, pkt: &SamplePacket, offset: usize, frames: usize) -> AeResult<usize>;

    /// Insert a gap of `ms` milliseconds into a bitstream
    fn add_pause(&mut self, ms: u32) -> AeResult<()>;

    /// Audio written but not yet audible, in seconds
    fn delay(&mut self) -> f64;

    /// Audio the device buffers when full, in seconds
    fn cache_total(&self) -> f64;

    fn latency(&self) -> f64 {
        0.0
    }

    /// Block until everything written has been played
    fn drain(&mut self);

    /// Drop everything written but not yet played
    fn flush(&mut self);

    fn has_volume(&self) -> bool {
        false
    }

    fn set_volume(&mut self, _volume: f32) {}
}

/// Factory for the devices of one driver
pub trait DeviceBackend: Send {
    fn driver(&self) -> &'static str;

    fn enumerate(&self) -> Vec<DeviceInfo>;

    fn create(&self, device: &str) -> AeResult<Box<dyn AudioDevice>>;
}

/// Installed backends plus the last device list
///
/// Owned by the sink actor.
pub struct DeviceRegistry {
    backends: Vec<Box<dyn DeviceBackend>>,
    devices: Vec<DeviceInfo>,
}

impl DeviceRegistry {
    pub fn new(backends: Vec<Box<dyn DeviceBackend>>) -> Self {
        Self {
            backends,
            devices: Vec::new(),
        }
    }

    fn drivers(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.driver()).collect()
    }

    /// Device list, enumerating on first use or when `force` is set
    pub fn enumerate(&mut self, force: bool) -> &[DeviceInfo] {
        if force || self.devices.is_empty() {
            let mut devices: Vec<DeviceInfo> = self.backends.iter().flat_map(|b| b.enumerate()).collect();
            // default devices first, then by driver, then by name
            devices.sort_by(|a, b| {
                b.is_default
                    .cmp(&a.is_default)
                    .then_with(|| a.driver.cmp(&b.driver))
                    .then_with(|| a.name.cmp(&b.name))
            });
            log::info!("Sink: enumerated {} output devices from {} backends", devices.len(), self.backends.len());
            self.devices = devices;
        }
        &self.devices
    }

    /// Create the device `name` refers to
    ///
    /// Returns the device and its resolved `driver:device` name.
    pub fn create(&mut self, name: &str) -> AeResult<(Box<dyn AudioDevice>, String)> {
        if self.backends.is_empty() {
            return Err(AeError::NoDevices);
        }
        let drivers = self.drivers();
        let (driver, device) = parse_device_name(name, &drivers);

        let index = match driver {
            Some(driver) => self.backends.iter().position(|b| b.driver() == driver),
            None => {
                let listed = self
                    .enumerate(false)
                    .iter()
                    .find(|d| d.name == device)
                    .map(|d| d.driver.clone());
                match listed {
                    Some(driver) => self.backends.iter().position(|b| b.driver() == driver),
                    None if device == "default" => Some(0),
                    None => None,
                }
            }
        };
        let Some(index) = index else {
            return Err(AeError::DeviceNotFound(name.to_string()));
        };

        let backend = &self.backends[index];
        let resolved = format!("{}:{}", backend.driver(), device);
        let created = backend.create(device)?;
        Ok((created, resolved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::NullBackend;

    #[test]
    fn test_parse_device_name() {
        let drivers = ["null", "cpal"];
        assert_eq!(parse_device_name("null:test", &drivers), (Some("null"), "test"));
        assert_eq!(parse_device_name("cpal:hw:0,0", &drivers), (Some("cpal"), "hw:0,0"));
        assert_eq!(parse_device_name("hw:0,0", &drivers), (None, "hw:0,0"));
        assert_eq!(parse_device_name("cpal:", &drivers), (Some("cpal"), "default"));
        assert_eq!(parse_device_name("", &drivers), (None, "default"));
    }

    #[test]
    fn test_registry_resolves_names() {
        let mut registry = DeviceRegistry::new(vec![Box::new(NullBackend::new())]);
        assert_eq!(registry.enumerate(false).len(), 1);

        let (_, resolved) = registry.create("default").unwrap();
        assert_eq!(resolved, "null:default");
        let (_, resolved) = registry.create("null:left").unwrap();
        assert_eq!(resolved, "null:left");
        assert!(matches!(registry.create("jack:system"), Err(AeError::DeviceNotFound(_))));
    }

    #[test]
    fn test_empty_registry() {
        let mut registry = DeviceRegistry::new(Vec::new());
        assert!(matches!(registry.create("default"), Err(AeError::NoDevices)));
    }
}
