//! Null output device
//!
//! Consumes audio at real-time speed without touching any hardware. The
//! device keeps a fixed amount of audio "in flight" and blocks writes until
//! it has played out enough, so the engine sees the same backpressure and
//! delay behaviour as with a sound card. A [`NullProbe`] records what was
//! written for inspection.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use super::device::{AudioDevice, DeviceBackend, DeviceInfo};
use crate::buffer::SamplePacket;
use crate::error::{AeError, AeResult};
use crate::types::AudioFormat;

/// Audio the simulated device buffers, in seconds
const CACHE_TOTAL: f64 = 0.1;

/// Period the device asks for when the caller has no preference
const PERIOD_MS: usize = 20;

/// What a null device saw
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeRecord {
    /// Successful `initialize` calls
    pub opens: usize,
    pub formats: Vec<AudioFormat>,
    pub frames_written: usize,
    /// Largest absolute sample written
    pub peak: f32,
    pub pauses_ms: u32,
    pub drains: usize,
    pub flushes: usize,
    pub volume: Option<f32>,
}

#[derive(Debug, Default)]
struct ProbeInner {
    record: ProbeRecord,
    fail_open: bool,
    fail_writes: bool,
}

/// Shared view into the null devices of one backend
#[derive(Debug, Clone, Default)]
pub struct NullProbe(Arc<Mutex<ProbeInner>>);

impl NullProbe {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ProbeInner> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self) -> ProbeRecord {
        self.lock().record.clone()
    }

    /// Make every following `initialize` fail
    pub fn set_fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    /// Make every following write fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }
}

/// Real-time simulating device
pub struct NullDevice {
    probe: NullProbe,
    format: Option<AudioFormat>,
    /// Audio in flight as of `updated`, in seconds
    queued: f64,
    updated: Instant,
}

impl NullDevice {
    pub fn new(probe: NullProbe) -> Self {
        Self {
            probe,
            format: None,
            queued: 0.0,
            updated: Instant::now(),
        }
    }
}

impl AudioDevice for NullDevice {
    fn initialize(&mut self, format: &mut AudioFormat) -> AeResult<()> {
        if self.probe.lock().fail_open {
            return Err(AeError::ConfigError("null device refused to open".into()));
        }
        let period = (format.sample_rate as usize * PERIOD_MS / 1000).max(1);
        if format.frames == 0 || format.frames > period {
            format.frames = period;
        }
        self.format = Some(format.clone());
        self.queued = 0.0;
        self.updated = Instant::now();

        let mut probe = self.probe.lock();
        probe.record.opens += 1;
        probe.record.formats.push(format.clone());
        log::debug!("Sink: null device opened with {}", format);
        Ok(())
    }

    fn deinitialize(&mut self) {
        self.format = None;
        self.queued = 0.0;
    }

    fn add_packets(&mut self, pkt: &SamplePacket, offset: usize, frames: usize) -> AeResult<usize> {
        if self.probe.lock().fail_writes {
            return Err(AeError::WriteError("null device write failed".into()));
        }
        let Some(format) = self.format.as_ref() else {
            return Err(AeError::WriteError("null device not open".into()));
        };
        let frames = frames.min(pkt.nb_samples.saturating_sub(offset));
        if frames == 0 {
            return Ok(0);
        }

        let duration = frames as f64 / format.sample_rate.max(1) as f64;
        let overflow = self.delay() + duration - CACHE_TOTAL;
        if overflow > 0.0 {
            thread::sleep(Duration::from_secs_f64(overflow));
        }
        self.queued = self.delay() + duration;
        self.updated = Instant::now();

        let mut probe = self.probe.lock();
        probe.record.frames_written += frames;
        if pkt.is_float_planar() {
            for c in 0..pkt.planes() {
                let peak = pkt.plane(c)[offset..offset + frames]
                    .iter()
                    .fold(0.0f32, |m, s| m.max(s.abs()));
                probe.record.peak = probe.record.peak.max(peak);
            }
        }
        Ok(frames)
    }

    fn add_pause(&mut self, ms: u32) -> AeResult<()> {
        if self.format.is_none() {
            return Err(AeError::WriteError("null device not open".into()));
        }
        thread::sleep(Duration::from_millis(ms as u64));
        self.probe.lock().record.pauses_ms += ms;
        Ok(())
    }

    fn delay(&mut self) -> f64 {
        (self.queued - self.updated.elapsed().as_secs_f64()).max(0.0)
    }

    fn cache_total(&self) -> f64 {
        CACHE_TOTAL
    }

    fn drain(&mut self) {
        let delay = self.delay();
        if delay > 0.0 {
            thread::sleep(Duration::from_secs_f64(delay));
        }
        self.queued = 0.0;
        self.probe.lock().record.drains += 1;
    }

    fn flush(&mut self) {
        self.queued = 0.0;
        self.probe.lock().record.flushes += 1;
    }

    fn has_volume(&self) -> bool {
        false
    }

    fn set_volume(&mut self, volume: f32) {
        self.probe.lock().record.volume = Some(volume);
    }
}

/// Backend handing out null devices that share one probe
#[derive(Debug, Clone, Default)]
pub struct NullBackend {
    probe: NullProbe,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_probe(probe: NullProbe) -> Self {
        Self { probe }
    }

    pub fn probe(&self) -> NullProbe {
        self.probe.clone()
    }
}

impl DeviceBackend for NullBackend {
    fn driver(&self) -> &'static str {
        "null"
    }

    fn enumerate(&self) -> Vec<DeviceInfo> {
        vec![DeviceInfo {
            driver: "null".into(),
            name: "default".into(),
            display_name: "Null output".into(),
            is_default: true,
            sample_rates: vec![44100, 48000, 88200, 96000, 176400, 192000],
            max_channels: 8,
            passthrough: true,
        }]
    }

    fn create(&self, _device: &str) -> AeResult<Box<dyn AudioDevice>> {
        Ok(Box::new(NullDevice::new(self.probe.clone())))
    }
}
