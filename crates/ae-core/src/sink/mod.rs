//! Output side of the engine
//!
//! The sink actor owns the output device and writes the mixed buffers the
//! engine sends it. Devices come from [`DeviceBackend`]s selected by the
//! `driver:device` name: `null` is always available, `cpal` drives real
//! hardware when the `cpal-backend` feature is on.

mod actor;
#[cfg(feature = "cpal-backend")]
mod cpal_device;
mod device;
mod null;
mod protocol;

#[cfg(feature = "cpal-backend")]
pub use cpal_device::{CpalBackend, CpalDevice};
pub use device::{parse_device_name, AudioDevice, DeviceBackend, DeviceInfo, DeviceRegistry};
pub use null::{NullBackend, NullDevice, NullProbe, ProbeRecord};
pub use protocol::{SinkControl, SinkData, SinkEvent, SinkInfo, SinkRequest};

pub(crate) use actor::SinkHandle;

/// Backends available in this build, in lookup order
pub fn default_backends() -> Vec<Box<dyn DeviceBackend>> {
    #[allow(unused_mut)]
    let mut backends: Vec<Box<dyn DeviceBackend>> = Vec::new();
    #[cfg(feature = "cpal-backend")]
    backends.push(Box::new(CpalBackend::new()));
    backends.push(Box::new(NullBackend::new()));
    backends
}
