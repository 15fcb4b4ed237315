//! Sink actor
//!
//! Owns the one open output device. Samples arrive on the data port, are
//! written with a blocking call and go back to the engine together with a
//! hint on how long the device can run without more data.
//!
//! ## States
//!
//! ```text
//! UNCONFIGURED ──configure──► CONFIGURED ─┬─ IDLE     device open, nothing to play
//!                                         ├─ PLAY     engine delivers samples
//!                                         ├─ SILENCE  engine stopped; silence keeps receivers locked
//!                                         └─ SUSPEND  device failed; reopened on the next sample
//! ```
//!
//! The silence timer runs forever while a stream is active, for the
//! configured timeout while the application has focus, and not at all
//! otherwise.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};

use super::device::{AudioDevice, DeviceRegistry};
use super::protocol::{SinkControl, SinkData, SinkEvent, SinkInfo, SinkRequest};
use crate::buffer::{SampleBuffer, SamplePacket};
use crate::engine::EngineStats;
use crate::error::{AeError, AeResult};

/// Consecutive zero-frame writes before a buffer is given up
const MAX_ZERO_WRITES: usize = 8;

/// Wake-up interval while nothing is scheduled
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Shortest wait for the next sample before falling back to silence
const MIN_PLAY_TIMEOUT: Duration = Duration::from_millis(10);

/// Level of the noise written instead of digital silence
const NOISE_LEVEL: f32 = 1.0e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkState {
    Unconfigured,
    Idle,
    Play,
    Silence,
    Suspend,
}

/// Tiny xorshift generator for the keep-alive noise
struct Noise(u32);

impl Noise {
    fn next(&mut self) -> f32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        (x as f32 / u32::MAX as f32 * 2.0 - 1.0) * NOISE_LEVEL
    }
}

struct SinkActor {
    events: Sender<SinkEvent>,
    stats: Arc<EngineStats>,
    registry: DeviceRegistry,
    state: SinkState,
    device: Option<Box<dyn AudioDevice>>,
    request: Option<SinkRequest>,
    info: Option<SinkInfo>,
    silence: Option<SamplePacket>,
    /// When the silence timer runs out; `None` runs forever
    silence_deadline: Option<Instant>,
    streaming: bool,
    focused: bool,
    volume: f32,
    noise: Noise,
}

/// Engine-side handle of the sink thread
pub(crate) struct SinkHandle {
    pub control: Sender<SinkControl>,
    pub data: Sender<SinkData>,
    pub events: Receiver<SinkEvent>,
    thread: Option<JoinHandle<()>>,
}

impl SinkHandle {
    /// Start the sink thread
    pub fn spawn(registry: DeviceRegistry, stats: Arc<EngineStats>) -> AeResult<Self> {
        let (control_tx, control_rx) = unbounded();
        let (data_tx, data_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();

        let actor = SinkActor {
            events: event_tx,
            stats,
            registry,
            state: SinkState::Unconfigured,
            device: None,
            request: None,
            info: None,
            silence: None,
            silence_deadline: None,
            streaming: false,
            focused: true,
            volume: 1.0,
            noise: Noise(0x1234_5678),
        };

        let thread = thread::Builder::new()
            .name("ae-sink".to_string())
            .spawn(move || actor.run(control_rx, data_rx))
            .map_err(|e| AeError::StreamBuildError(format!("Failed to spawn sink thread: {}", e)))?;

        Ok(Self {
            control: control_tx,
            data: data_tx,
            events: event_rx,
            thread: Some(thread),
        })
    }

    /// Wait for the thread after it was told to shut down
    pub fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("Sink: thread panicked");
            }
        }
    }
}

impl SinkActor {
    fn run(mut self, control: Receiver<SinkControl>, data: Receiver<SinkData>) {
        log::info!("Sink: started");

        loop {
            // control messages go first
            match control.try_recv() {
                Ok(msg) => {
                    if !self.handle_control(msg) {
                        break;
                    }
                    continue;
                }
                Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            let timeout = self.timeout();
            let keep_running = crossbeam::select! {
                recv(control) -> msg => match msg {
                    Ok(msg) => self.handle_control(msg),
                    Err(_) => false,
                },
                recv(data) -> msg => match msg {
                    Ok(SinkData::Sample(buffer)) => {
                        self.on_sample(buffer);
                        true
                    }
                    Err(_) => false,
                },
                default(timeout) => {
                    self.on_timeout();
                    true
                },
            };
            if !keep_running {
                break;
            }
        }

        self.close();
        log::info!("Sink: stopped");
    }

    fn timeout(&self) -> Duration {
        match self.state {
            SinkState::Play => {
                let half_cache = self.info.as_ref().map_or(0.0, |i| i.cache_total / 2.0);
                Duration::from_secs_f64(half_cache).max(MIN_PLAY_TIMEOUT)
            }
            SinkState::Silence => Duration::ZERO,
            _ => IDLE_POLL,
        }
    }

    /// Returns false once the actor should stop
    fn handle_control(&mut self, msg: SinkControl) -> bool {
        match msg {
            SinkControl::Configure { request, reply } => {
                let result = self.configure(*request);
                let _ = reply.send(result);
            }
            SinkControl::Unconfigure { reply } => {
                self.close();
                let _ = reply.send(());
            }
            SinkControl::Drain { reply } => {
                if let Some(device) = self.device.as_mut() {
                    device.drain();
                    if self.state == SinkState::Silence {
                        self.state = SinkState::Play;
                    }
                }
                let _ = reply.send(());
            }
            SinkControl::Flush { reply } => {
                if let Some(device) = self.device.as_mut() {
                    device.flush();
                }
                let _ = reply.send(());
            }
            SinkControl::Volume(volume) => {
                self.volume = volume;
                if let Some(device) = self.device.as_mut().filter(|d| d.has_volume()) {
                    device.set_volume(volume);
                }
            }
            SinkControl::Streaming(streaming) => {
                self.streaming = streaming;
                self.rearm_silence();
            }
            SinkControl::AppFocused(focused) => {
                self.focused = focused;
                self.rearm_silence();
            }
            SinkControl::Enumerate { force, reply } => {
                let devices = self.registry.enumerate(force).to_vec();
                let _ = reply.send(devices);
            }
            SinkControl::Shutdown { reply } => {
                self.close();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn configure(&mut self, request: SinkRequest) -> AeResult<SinkInfo> {
        if !request.force && self.state != SinkState::Suspend {
            let reusable = match (&self.request, &self.info, &self.device) {
                (Some(current), Some(_), Some(_)) => {
                    current.device == request.device && current.format.same_config(&request.format)
                }
                _ => false,
            };
            if reusable {
                if let (Some(current), Some(info)) = (self.request.as_mut(), self.info.as_ref()) {
                    current.silence_timeout = request.silence_timeout;
                    current.stream_noise = request.stream_noise;
                    log::debug!("Sink: keeping {} with {}", current.device, info.format);
                    return Ok(info.clone());
                }
            }
        }

        self.close();
        let result = self.open(&request);
        self.request = Some(request);
        result
    }

    fn open(&mut self, request: &SinkRequest) -> AeResult<SinkInfo> {
        let (mut device, resolved) = self.registry.create(&request.device).map_err(|e| {
            log::error!("Sink: no device for {}: {}", request.device, e);
            e
        })?;
        let mut format = request.format.clone();
        if let Err(e) = device.initialize(&mut format) {
            log::error!("Sink: failed to open {}: {}", resolved, e);
            return Err(e);
        }
        if device.has_volume() {
            device.set_volume(self.volume);
        }

        let info = SinkInfo {
            format: format.clone(),
            cache_total: device.cache_total(),
            latency: device.latency(),
            has_volume: device.has_volume(),
        };
        log::info!(
            "Sink: opened {} with {} (cache {:.0} ms)",
            resolved,
            format,
            info.cache_total * 1000.0
        );

        self.silence = Some(SamplePacket::new(&format, format.frames.max(1)));
        self.device = Some(device);
        self.info = Some(info.clone());
        self.set_state(SinkState::Idle);
        Ok(info)
    }

    fn close(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.deinitialize();
            log::debug!("Sink: device closed");
        }
        self.info = None;
        self.silence = None;
        self.set_state(SinkState::Unconfigured);
    }

    fn set_state(&mut self, state: SinkState) {
        if state != self.state {
            log::debug!("Sink: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn silence_timeout(&self) -> Option<Duration> {
        if self.streaming {
            None
        } else if self.focused {
            Some(self.request.as_ref().map_or(Duration::ZERO, |r| r.silence_timeout))
        } else {
            Some(Duration::ZERO)
        }
    }

    fn arm_silence(&mut self) {
        self.silence_deadline = self.silence_timeout().map(|t| Instant::now() + t);
    }

    fn silence_expired(&self) -> bool {
        self.silence_deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Streaming or focus changed
    fn rearm_silence(&mut self) {
        match self.state {
            SinkState::Silence => {
                self.arm_silence();
                if self.silence_expired() {
                    self.set_state(SinkState::Idle);
                }
            }
            SinkState::Idle if self.streaming && self.device.is_some() => {
                self.arm_silence();
                self.set_state(SinkState::Silence);
            }
            _ => {}
        }
    }

    fn on_timeout(&mut self) {
        match self.state {
            SinkState::Play => {
                self.arm_silence();
                if self.silence_expired() {
                    self.set_state(SinkState::Idle);
                } else {
                    self.set_state(SinkState::Silence);
                }
            }
            SinkState::Silence => {
                if self.silence_expired() {
                    self.set_state(SinkState::Idle);
                } else if let Err(e) = self.write_silence() {
                    self.fail(e);
                }
            }
            SinkState::Unconfigured | SinkState::Idle | SinkState::Suspend => {}
        }
    }

    fn write_silence(&mut self) -> AeResult<()> {
        let noise = self.request.as_ref().is_some_and(|r| r.stream_noise);
        let (Some(device), Some(pkt)) = (self.device.as_mut(), self.silence.as_mut()) else {
            return Ok(());
        };

        if pkt.format().is_raw() {
            let ms = pkt.format().frames_to_ms(pkt.max_nb_samples()).max(1.0) as u32;
            return device.add_pause(ms);
        }

        pkt.nb_samples = pkt.max_nb_samples();
        if pkt.is_float_planar() && noise {
            for plane in pkt.planes_mut() {
                for s in plane.iter_mut() {
                    *s = self.noise.next();
                }
            }
        } else {
            pkt.silence_from(0);
        }
        let frames = pkt.nb_samples;
        device.add_packets(pkt, 0, frames)?;
        Ok(())
    }

    fn on_sample(&mut self, buffer: SampleBuffer) {
        if self.state == SinkState::Suspend {
            self.reopen();
        }

        if self.device.is_some() {
            match self.write(&buffer) {
                Ok(()) => self.set_state(SinkState::Play),
                Err(e) => self.fail(e),
            }
        }
        self.return_sample(buffer);
    }

    /// Lazy retry after a failure
    fn reopen(&mut self) {
        let Some(request) = self.request.clone() else {
            return;
        };
        match self.open(&request) {
            Ok(_) => log::info!("Sink: device recovered"),
            Err(e) => {
                log::debug!("Sink: device still unavailable: {}", e);
                self.set_state(SinkState::Suspend);
            }
        }
    }

    fn write(&mut self, buffer: &SampleBuffer) -> AeResult<()> {
        let Some(device) = self.device.as_mut() else {
            return Ok(());
        };
        if buffer.pkt.pause_burst_ms > 0 {
            return device.add_pause(buffer.pkt.pause_burst_ms);
        }

        let frames = buffer.frames();
        let mut offset = 0;
        let mut zero_writes = 0;
        while offset < frames {
            let written = device.add_packets(&buffer.pkt, offset, frames - offset)?;
            if written == 0 {
                zero_writes += 1;
                if zero_writes >= MAX_ZERO_WRITES {
                    log::warn!("Sink: device stalled, dropped {} frames", frames - offset);
                    break;
                }
                continue;
            }
            zero_writes = 0;
            offset += written;
        }
        Ok(())
    }

    /// Close the device after a failed write and tell the engine
    fn fail(&mut self, error: AeError) {
        log::error!("Sink: write failed: {}", error);
        if let Some(mut device) = self.device.take() {
            device.deinitialize();
        }
        self.info = None;
        self.set_state(SinkState::Suspend);
        let _ = self.events.send(SinkEvent::Error(error));
    }

    fn return_sample(&mut self, buffer: SampleBuffer) {
        let delay = self.device.as_mut().map_or(0.0, |d| d.delay());
        self.stats.update_sink_delay(delay, buffer.frames());
        let event = SinkEvent::ReturnSample {
            buffer,
            delay_hint: Duration::from_secs_f64(delay / 2.0),
        };
        if self.events.send(event).is_err() {
            log::debug!("Sink: engine went away, buffer dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::engine::command::{reply_channel, wait_reply};
    use crate::sink::{NullBackend, NullProbe};
    use crate::types::{AudioFormat, ChannelLayout};

    const WAIT: Duration = Duration::from_secs(2);

    fn start(probe: &NullProbe) -> (SinkHandle, Arc<EngineStats>) {
        let stats = Arc::new(EngineStats::new());
        let registry = DeviceRegistry::new(vec![Box::new(NullBackend::with_probe(probe.clone()))]);
        (SinkHandle::spawn(registry, stats.clone()).unwrap(), stats)
    }

    fn configure(sink: &SinkHandle, force: bool) -> AeResult<SinkInfo> {
        let (reply, rx) = reply_channel();
        let request = SinkRequest {
            format: AudioFormat::internal(48000, ChannelLayout::stereo(), 0),
            device: "null:default".into(),
            force,
            silence_timeout: Duration::ZERO,
            stream_noise: false,
        };
        sink.control
            .send(SinkControl::Configure {
                request: Box::new(request),
                reply,
            })
            .unwrap();
        wait_reply(&rx, WAIT, "configure").unwrap()
    }

    fn shutdown(mut sink: SinkHandle) {
        let (reply, rx) = reply_channel();
        sink.control.send(SinkControl::Shutdown { reply }).unwrap();
        wait_reply(&rx, WAIT, "shutdown").unwrap();
        sink.join();
    }

    fn filled_pool(format: &AudioFormat) -> BufferPool {
        let mut pool = BufferPool::new(format.clone());
        pool.create(0);
        pool
    }

    #[test]
    fn test_configure_reports_format() {
        let probe = NullProbe::new();
        let (sink, _) = start(&probe);
        let info = configure(&sink, false).unwrap();
        assert_eq!(info.format.frames, 960);
        assert!((info.cache_total - 0.1).abs() < 1e-9);
        assert!(!info.has_volume);

        // same request keeps the device open
        configure(&sink, false).unwrap();
        assert_eq!(probe.record().opens, 1);
        configure(&sink, true).unwrap();
        assert_eq!(probe.record().opens, 2);
        shutdown(sink);
    }

    #[test]
    fn test_samples_come_back() {
        let probe = NullProbe::new();
        let (sink, stats) = start(&probe);
        let info = configure(&sink, false).unwrap();
        stats.reset(48000, info.cache_total, 0.0, 0.5);

        let mut pool = filled_pool(&info.format);
        let mut buffer = pool.get_free_buffer().unwrap();
        buffer.pkt.nb_samples = buffer.pkt.max_nb_samples();
        buffer.pkt.plane_mut(0).fill(0.25);
        stats.add_samples(buffer.frames());
        sink.data.send(SinkData::Sample(buffer)).unwrap();

        match sink.events.recv_timeout(WAIT).unwrap() {
            SinkEvent::ReturnSample { buffer, .. } => pool.return_buffer(buffer).unwrap(),
            SinkEvent::Error(e) => panic!("unexpected error {}", e),
        }
        assert!(pool.is_idle());
        assert_eq!(stats.get_water_level(), 0.0);
        let record = probe.record();
        assert_eq!(record.frames_written, 960);
        assert_eq!(record.peak, 0.25);
        shutdown(sink);
    }

    #[test]
    fn test_write_failure_suspends_and_recovers() {
        let probe = NullProbe::new();
        let (sink, _) = start(&probe);
        let info = configure(&sink, false).unwrap();
        let mut pool = filled_pool(&info.format);

        probe.set_fail_writes(true);
        let mut buffer = pool.get_free_buffer().unwrap();
        buffer.pkt.nb_samples = 10;
        sink.data.send(SinkData::Sample(buffer)).unwrap();

        let mut saw_error = false;
        for _ in 0..2 {
            match sink.events.recv_timeout(WAIT).unwrap() {
                SinkEvent::Error(_) => saw_error = true,
                SinkEvent::ReturnSample { buffer, .. } => pool.return_buffer(buffer).unwrap(),
            }
        }
        assert!(saw_error);

        // next sample reopens the device
        probe.set_fail_writes(false);
        let mut buffer = pool.get_free_buffer().unwrap();
        buffer.pkt.nb_samples = 10;
        sink.data.send(SinkData::Sample(buffer)).unwrap();
        match sink.events.recv_timeout(WAIT).unwrap() {
            SinkEvent::ReturnSample { buffer, .. } => pool.return_buffer(buffer).unwrap(),
            SinkEvent::Error(e) => panic!("unexpected error {}", e),
        }
        assert_eq!(probe.record().opens, 2);
        assert_eq!(probe.record().frames_written, 10);
        shutdown(sink);
    }

    #[test]
    fn test_enumerate() {
        let probe = NullProbe::new();
        let (sink, _) = start(&probe);
        let (reply, rx) = reply_channel();
        sink.control.send(SinkControl::Enumerate { force: true, reply }).unwrap();
        let devices = wait_reply(&rx, WAIT, "enumerate").unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id(), "null:default");
        shutdown(sink);
    }
}
