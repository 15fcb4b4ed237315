//! CPAL output device
//!
//! The sink thread writes interleaved float samples into a lock-free ring
//! buffer; the CPAL callback pops them and plays silence when it runs dry.
//!
//! ```text
//! ┌──────────────────┐  push()   ┌─────────────────────┐  pop()   ┌─────────────────────┐
//! │   Sink Thread    │──────────►│  Sample Ring Buffer │─────────►│ CPAL Audio Callback │
//! │ (blocking write) │           │   (SPSC, ~100ms)    │          │  (silence on empty) │
//! └──────────────────┘           └─────────────────────┘          └─────────────────────┘
//! ```
//!
//! `cpal::Stream` must stay on the thread that built it on some platforms,
//! so each open device runs a small helper thread owning the stream for as
//! long as the device is initialized.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{HostId, SampleFormat as CpalSampleFormat, StreamConfig};
use crossbeam::channel::{bounded, Sender};

use super::device::{AudioDevice, DeviceBackend, DeviceInfo};
use crate::buffer::SamplePacket;
use crate::error::{AeError, AeResult};
use crate::types::{AudioFormat, ChannelLayout, SampleFormat, DEFAULT_SAMPLE_RATE};

/// Audio held in the ring buffer, in milliseconds
const RING_MS: usize = 100;

/// Period reported to the engine
const PERIOD_MS: usize = 20;

/// Longest a write waits for room before reporting zero frames
const WRITE_TIMEOUT: Duration = Duration::from_millis(200);

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Get a human-readable name for a host ID
fn host_name(host_id: HostId) -> String {
    let name = format!("{:?}", host_id);
    match name.as_str() {
        "Alsa" => "ALSA".to_string(),
        "Jack" => "JACK".to_string(),
        "Wasapi" => "WASAPI".to_string(),
        _ => name,
    }
}

/// Find a device by `HOST/name`, plain `name` or `default`
fn find_device(name: &str) -> AeResult<cpal::Device> {
    if name == "default" {
        return cpal::default_host().default_output_device().ok_or(AeError::NoDevices);
    }

    let (host_filter, device_name) = match name.split_once('/') {
        Some((host, device)) => (Some(host), device),
        None => (None, name),
    };

    for host_id in cpal::available_hosts() {
        if host_filter.is_some_and(|h| h != host_name(host_id)) {
            continue;
        }
        let Ok(host) = cpal::host_from_id(host_id) else {
            continue;
        };
        let Ok(mut devices) = host.output_devices() else {
            continue;
        };
        if let Some(device) = devices.find(|d| d.name().ok().as_deref() == Some(device_name)) {
            return Ok(device);
        }
    }
    Err(AeError::DeviceNotFound(name.to_string()))
}

/// Pick the device configuration closest to what the engine asked for
fn select_config(device: &cpal::Device, channels: u16, sample_rate: u32) -> AeResult<cpal::SupportedStreamConfig> {
    let supported: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| AeError::ConfigError(e.to_string()))?
        .collect();

    let in_range = |c: &cpal::SupportedStreamConfigRange| {
        sample_rate >= c.min_sample_rate().0 && sample_rate <= c.max_sample_rate().0
    };

    let best = supported
        .iter()
        .filter(|c| c.sample_format() == CpalSampleFormat::F32)
        .filter(|c| c.channels() >= channels)
        .find(|c| in_range(*c))
        .or_else(|| {
            supported
                .iter()
                .filter(|c| c.sample_format() == CpalSampleFormat::F32)
                .find(|c| c.channels() >= 2)
        })
        .or_else(|| supported.iter().find(|c| c.sample_format() == CpalSampleFormat::F32))
        .ok_or_else(|| AeError::ConfigError("No float output configuration".to_string()))?;

    let rate = if in_range(best) {
        cpal::SampleRate(sample_rate)
    } else {
        let fallback = best.max_sample_rate();
        log::warn!(
            "Sink: device doesn't support {}Hz, falling back to {}Hz",
            sample_rate,
            fallback.0
        );
        fallback
    };
    Ok(best.clone().with_sample_rate(rate))
}

/// What the stream thread reports once the stream plays
struct Opened {
    producer: rtrb::Producer<f32>,
    capacity: usize,
    sample_rate: u32,
    device_channels: usize,
}

fn open_stream(
    name: &str,
    channels: u16,
    sample_rate: u32,
    flush: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
) -> AeResult<(cpal::Stream, Opened)> {
    let device = find_device(name)?;
    let supported = select_config(&device, channels, sample_rate)?;
    let config = StreamConfig {
        channels: supported.channels(),
        sample_rate: supported.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };
    let device_channels = config.channels as usize;
    let rate = config.sample_rate.0;

    let capacity = rate as usize * RING_MS / 1000 * device_channels;
    let (producer, mut consumer) = rtrb::RingBuffer::<f32>::new(capacity);

    log::info!(
        "Sink: cpal device {} opened with {} channels, {}Hz",
        device.name().unwrap_or_else(|_| "Unknown".to_string()),
        device_channels,
        rate
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                if flush.swap(false, Ordering::AcqRel) {
                    while consumer.pop().is_ok() {}
                }
                for sample in data.iter_mut() {
                    *sample = consumer.pop().unwrap_or(0.0);
                }
            },
            move |err| {
                log::error!("Sink: cpal stream error: {}", err);
                failed.store(true, Ordering::Release);
            },
            None,
        )
        .map_err(|e| AeError::StreamBuildError(e.to_string()))?;

    stream.play().map_err(|e| AeError::StreamPlayError(e.to_string()))?;

    Ok((
        stream,
        Opened {
            producer,
            capacity,
            sample_rate: rate,
            device_channels,
        },
    ))
}

/// Helper thread keeping the stream alive
struct StreamThread {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn stop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("Sink: cpal stream thread panicked");
            }
        }
    }
}

/// Output through CPAL
pub struct CpalDevice {
    name: String,
    thread: Option<StreamThread>,
    producer: Option<rtrb::Producer<f32>>,
    capacity: usize,
    sample_rate: u32,
    device_channels: usize,
    flush: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
}

impl CpalDevice {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            thread: None,
            producer: None,
            capacity: 0,
            sample_rate: DEFAULT_SAMPLE_RATE,
            device_channels: 2,
            flush: Arc::new(AtomicBool::new(false)),
            failed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn used_frames(&self) -> usize {
        let Some(producer) = self.producer.as_ref() else {
            return 0;
        };
        (self.capacity - producer.slots()) / self.device_channels.max(1)
    }
}

impl AudioDevice for CpalDevice {
    fn initialize(&mut self, format: &mut AudioFormat) -> AeResult<()> {
        if format.is_raw() {
            return Err(AeError::UnsupportedFormat("bitstream output through cpal".into()));
        }
        self.deinitialize();
        self.failed.store(false, Ordering::Release);
        self.flush.store(false, Ordering::Release);

        let (tx, rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let name = self.name.clone();
        let channels = format.channels() as u16;
        let rate = format.sample_rate;
        let flush = self.flush.clone();
        let failed = self.failed.clone();

        let handle = thread::Builder::new()
            .name("ae-cpal".to_string())
            .spawn(move || match open_stream(&name, channels, rate, flush, failed) {
                Ok((stream, opened)) => {
                    if tx.send(Ok(opened)).is_ok() {
                        // blocks until the device is closed
                        let _ = stop_rx.recv();
                    }
                    drop(stream);
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                }
            })
            .map_err(|e| AeError::StreamBuildError(format!("Failed to spawn stream thread: {}", e)))?;

        let mut thread = StreamThread {
            stop: Some(stop_tx),
            handle: Some(handle),
        };
        let opened = match rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                thread.stop();
                return Err(e);
            }
            Err(_) => {
                thread.stop();
                return Err(AeError::Timeout("cpal stream start"));
            }
        };

        format.sample_format = SampleFormat::F32;
        format.planar = true;
        format.sample_rate = opened.sample_rate;
        if opened.device_channels < format.channels() {
            format.layout = if opened.device_channels == 1 {
                ChannelLayout::mono()
            } else {
                ChannelLayout::stereo()
            };
        }
        let period = (opened.sample_rate as usize * PERIOD_MS / 1000).max(1);
        if format.frames == 0 || format.frames > period {
            format.frames = period;
        }

        self.producer = Some(opened.producer);
        self.capacity = opened.capacity;
        self.sample_rate = opened.sample_rate;
        self.device_channels = opened.device_channels;
        self.thread = Some(thread);
        Ok(())
    }

    fn deinitialize(&mut self) {
        self.producer = None;
        if let Some(mut thread) = self.thread.take() {
            thread.stop();
            log::debug!("Sink: cpal device {} closed", self.name);
        }
    }

    fn add_packets(&mut self, pkt: &SamplePacket, offset: usize, frames: usize) -> AeResult<usize> {
        if self.failed.load(Ordering::Acquire) {
            return Err(AeError::WriteError("cpal stream failed".into()));
        }
        if !pkt.is_float_planar() {
            return Err(AeError::UnsupportedFormat(pkt.format().to_string()));
        }
        let device_channels = self.device_channels.max(1);
        let Some(producer) = self.producer.as_mut() else {
            return Err(AeError::WriteError("cpal device not open".into()));
        };

        let deadline = Instant::now() + WRITE_TIMEOUT;
        let free_frames = loop {
            let free = producer.slots() / device_channels;
            if free > 0 {
                break free;
            }
            if self.failed.load(Ordering::Acquire) {
                return Err(AeError::WriteError("cpal stream failed".into()));
            }
            if Instant::now() >= deadline {
                return Ok(0);
            }
            thread::sleep(Duration::from_millis(1));
        };

        let frames = frames.min(free_frames).min(pkt.nb_samples.saturating_sub(offset));
        let channels = pkt.planes();
        for f in offset..offset + frames {
            for c in 0..device_channels {
                let sample = if c < channels { pkt.plane(c)[f] } else { 0.0 };
                if producer.push(sample).is_err() {
                    break;
                }
            }
        }
        Ok(frames)
    }

    fn add_pause(&mut self, _ms: u32) -> AeResult<()> {
        Err(AeError::UnsupportedFormat("bitstream pause through cpal".into()))
    }

    fn delay(&mut self) -> f64 {
        self.used_frames() as f64 / self.sample_rate.max(1) as f64
    }

    fn cache_total(&self) -> f64 {
        let frames = self.capacity / self.device_channels.max(1);
        frames as f64 / self.sample_rate.max(1) as f64
    }

    fn drain(&mut self) {
        let deadline = Instant::now() + Duration::from_secs_f64(self.cache_total()) + WRITE_TIMEOUT;
        while self.used_frames() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn flush(&mut self) {
        self.flush.store(true, Ordering::Release);
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.deinitialize();
    }
}

/// Devices of every CPAL host (ALSA, JACK, PulseAudio, ...)
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceBackend for CpalBackend {
    fn driver(&self) -> &'static str {
        "cpal"
    }

    fn enumerate(&self) -> Vec<DeviceInfo> {
        let mut all_devices = Vec::new();

        for host_id in cpal::available_hosts() {
            let host = match cpal::host_from_id(host_id) {
                Ok(h) => h,
                Err(e) => {
                    log::debug!("Sink: could not initialize host {:?}: {}", host_id, e);
                    continue;
                }
            };
            let host_label = host_name(host_id);
            let default_name = host.default_output_device().and_then(|d| d.name().ok());

            let devices = match host.output_devices() {
                Ok(d) => d,
                Err(e) => {
                    log::debug!("Sink: could not enumerate devices for {:?}: {}", host_id, e);
                    continue;
                }
            };

            for device in devices {
                let Ok(name) = device.name() else {
                    continue;
                };
                let configs: Vec<_> = match device.supported_output_configs() {
                    Ok(c) => c.collect(),
                    Err(_) => continue,
                };
                if configs.is_empty() {
                    continue;
                }

                let mut sample_rates: Vec<u32> = Vec::new();
                let mut max_channels: u16 = 0;
                for config in &configs {
                    max_channels = max_channels.max(config.channels());
                    for rate in [44100, 48000, 88200, 96000, 176400, 192000] {
                        if rate >= config.min_sample_rate().0
                            && rate <= config.max_sample_rate().0
                            && !sample_rates.contains(&rate)
                        {
                            sample_rates.push(rate);
                        }
                    }
                }
                sample_rates.sort();

                all_devices.push(DeviceInfo {
                    driver: "cpal".into(),
                    name: format!("{}/{}", host_label, name),
                    display_name: format!("{} ({})", name, host_label),
                    is_default: default_name.as_ref() == Some(&name),
                    sample_rates,
                    max_channels,
                    passthrough: false,
                });
            }
        }
        all_devices
    }

    fn create(&self, device: &str) -> AeResult<Box<dyn AudioDevice>> {
        Ok(Box::new(CpalDevice::new(device)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_host_names() {
        assert_eq!(host_name(HostId::Alsa), "ALSA");
    }

    #[test]
    fn test_raw_rejected_before_opening() {
        let mut device = CpalDevice::new("default");
        let mut format = AudioFormat::raw(crate::types::RawCodec::Ac3, 48000);
        assert!(matches!(device.initialize(&mut format), Err(AeError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_device_enumeration() {
        // May find nothing on machines without audio hardware
        let devices = CpalBackend::new().enumerate();
        for device in &devices {
            assert_eq!(device.driver, "cpal");
            assert!(device.max_channels > 0);
        }
    }
}
