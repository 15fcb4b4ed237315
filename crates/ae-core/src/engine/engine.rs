//! Application-facing engine handle
//!
//! [`AudioEngine`] owns the engine and sink threads. Every call is a
//! message on the engine's control port; calls that need an answer wait
//! for it with a bounded timeout.

use std::sync::Arc;

use crossbeam::channel::Sender;

use super::actor::{EngineConfig, EngineHandle};
use super::command::{reply_channel, wait_reply, ControlMsg, DataMsg, SoundRequest, StreamRequest, SYNC_TIMEOUT};
use super::EngineStats;
use crate::clock::AvClock;
use crate::config::{AudioSettings, SoundMode};
use crate::encoder::EncoderFactory;
use crate::error::{AeError, AeResult};
use crate::resample::{create_resampler, ResamplerFactory};
use crate::sink::{default_backends, DeviceBackend, DeviceInfo};
use crate::stream::{AudioStream, StreamOptions};
use crate::tempo::{create_tempo_filter, TempoFilterFactory};
use crate::types::AudioFormat;
use crate::viz::AudioCallback;

/// Builder for an engine with non-default parts
pub struct EngineBuilder {
    settings: AudioSettings,
    resampler_factory: ResamplerFactory,
    tempo_factory: TempoFilterFactory,
    encoder_factory: Option<EncoderFactory>,
    backends: Option<Vec<Box<dyn DeviceBackend>>>,
}

impl EngineBuilder {
    pub fn new(settings: AudioSettings) -> Self {
        Self {
            settings,
            resampler_factory: create_resampler,
            tempo_factory: create_tempo_filter,
            encoder_factory: None,
            backends: None,
        }
    }

    pub fn resampler(mut self, factory: ResamplerFactory) -> Self {
        self.resampler_factory = factory;
        self
    }

    pub fn tempo_filter(mut self, factory: TempoFilterFactory) -> Self {
        self.tempo_factory = factory;
        self
    }

    /// Enable transcoding multichannel PCM for passthrough outputs
    pub fn encoder(mut self, factory: EncoderFactory) -> Self {
        self.encoder_factory = Some(factory);
        self
    }

    /// Replace the device backends (hardware plus null by default)
    pub fn backends(mut self, backends: Vec<Box<dyn DeviceBackend>>) -> Self {
        self.backends = Some(backends);
        self
    }

    /// Start the engine threads and open the output
    pub fn build(self) -> AeResult<AudioEngine> {
        let stats = Arc::new(EngineStats::new());
        let config = EngineConfig {
            settings: self.settings.clone(),
            resampler_factory: self.resampler_factory,
            tempo_factory: self.tempo_factory,
            encoder_factory: self.encoder_factory,
            backends: self.backends.unwrap_or_else(default_backends),
        };
        let handle = EngineHandle::spawn(config, stats.clone())?;
        let engine = AudioEngine {
            handle,
            stats,
            settings: self.settings,
            running: true,
        };
        engine.send(ControlMsg::Init)?;
        Ok(engine)
    }
}

/// The audio engine
///
/// Streams are created through [`AudioEngine::new_stream`] and fed from
/// any thread. Dropping the engine shuts both threads down.
pub struct AudioEngine {
    handle: EngineHandle,
    stats: Arc<EngineStats>,
    /// Settings last applied
    settings: AudioSettings,
    running: bool,
}

impl AudioEngine {
    /// Engine with the default resampler, tempo filter and backends
    pub fn new(settings: AudioSettings) -> AeResult<Self> {
        EngineBuilder::new(settings).build()
    }

    pub fn builder(settings: AudioSettings) -> EngineBuilder {
        EngineBuilder::new(settings)
    }

    fn send(&self, msg: ControlMsg) -> AeResult<()> {
        if !self.running {
            return Err(AeError::NotRunning);
        }
        self.handle
            .control
            .send(msg)
            .map_err(|_| AeError::Disconnected("engine control port"))
    }

    fn control(&self) -> Sender<ControlMsg> {
        self.handle.control.clone()
    }

    fn data(&self) -> Sender<DataMsg> {
        self.handle.data.clone()
    }

    /// Open a stream delivering `format`
    ///
    /// With a `clock`, the stream is kept in sync with it.
    pub fn new_stream(
        &self,
        format: AudioFormat,
        options: StreamOptions,
        clock: Option<Arc<dyn AvClock>>,
    ) -> AeResult<AudioStream> {
        let (reply, rx) = reply_channel();
        let request = StreamRequest {
            format: format.clone(),
            options,
            clock,
        };
        self.send(ControlMsg::NewStream {
            request: Box::new(request),
            reply,
        })?;
        let init = wait_reply(&rx, SYNC_TIMEOUT, "new stream")??;
        log::debug!("Engine: stream {} ready, buffers of {}", init.id, init.buffer_format);
        Ok(AudioStream::new(format, init, self.control(), self.data(), self.stats.clone()))
    }

    pub fn settings(&self) -> &AudioSettings {
        &self.settings
    }

    /// Apply new settings; the output is reopened if they require it
    pub fn apply_settings(&mut self, settings: AudioSettings) -> AeResult<()> {
        self.send(ControlMsg::ApplySettings(Box::new(settings.clone())))?;
        self.settings = settings;
        Ok(())
    }

    /// Release the output device; streams stay open
    pub fn suspend(&self) -> AeResult<()> {
        let (reply, rx) = reply_channel();
        self.send(ControlMsg::Suspend { reply })?;
        wait_reply(&rx, SYNC_TIMEOUT, "suspend")
    }

    /// Reopen the output after [`AudioEngine::suspend`]
    pub fn resume(&self) -> AeResult<()> {
        let (reply, rx) = reply_channel();
        self.send(ControlMsg::Resume { reply })?;
        wait_reply(&rx, SYNC_TIMEOUT, "resume")
    }

    pub fn is_suspended(&self) -> bool {
        self.stats.is_suspended()
    }

    /// Master volume in [0, 1]
    pub fn set_volume(&self, volume: f32) -> AeResult<()> {
        self.send(ControlMsg::SetVolume(volume))
    }

    pub fn set_mute(&self, muted: bool) -> AeResult<()> {
        self.send(ControlMsg::SetMute(muted))
    }

    pub fn set_sound_mode(&mut self, mode: SoundMode) -> AeResult<()> {
        self.send(ControlMsg::SetSoundMode(mode))?;
        self.settings.gui_sound_mode = mode;
        Ok(())
    }

    pub fn set_app_focused(&self, focused: bool) -> AeResult<()> {
        self.send(ControlMsg::AppFocused(focused))
    }

    /// The default device or its properties changed
    pub fn device_change(&self) -> AeResult<()> {
        self.send(ControlMsg::DeviceChange)
    }

    /// A device was plugged in or removed
    pub fn device_count_change(&self) -> AeResult<()> {
        self.send(ControlMsg::DeviceCountChange)
    }

    /// Reopen the output with the current settings
    pub fn reconfigure(&self) -> AeResult<()> {
        self.send(ControlMsg::Reconfigure)
    }

    pub fn enumerate_devices(&self) -> AeResult<Vec<DeviceInfo>> {
        let (reply, rx) = reply_channel();
        self.send(ControlMsg::EnumerateDevices { reply })?;
        wait_reply(&rx, SYNC_TIMEOUT, "device enumeration")
    }

    /// Register a short sound; returns its id
    pub fn make_sound(&self, format: AudioFormat, planes: Vec<Vec<u8>>, frames: usize) -> AeResult<u32> {
        let (reply, rx) = reply_channel();
        let request = SoundRequest { format, planes, frames };
        self.send(ControlMsg::MakeSound {
            request: Box::new(request),
            reply,
        })?;
        wait_reply(&rx, SYNC_TIMEOUT, "make sound")?
    }

    pub fn play_sound(&self, id: u32) -> AeResult<()> {
        self.send(ControlMsg::PlaySound(id))
    }

    pub fn stop_sound(&self, id: u32) -> AeResult<()> {
        self.send(ControlMsg::StopSound(id))
    }

    pub fn free_sound(&self, id: u32) -> AeResult<()> {
        self.send(ControlMsg::FreeSound(id))
    }

    /// Tap the mixed output; replaces any earlier callback
    pub fn register_callback(&self, callback: Box<dyn AudioCallback>) -> AeResult<()> {
        self.send(ControlMsg::RegisterCallback(callback))
    }

    pub fn unregister_callback(&self) -> AeResult<()> {
        self.send(ControlMsg::UnregisterCallback)
    }

    /// Timing snapshot shared with the engine threads
    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    /// Stop both threads; the engine is unusable afterwards
    pub fn shutdown(&mut self) -> AeResult<()> {
        if !self.running {
            return Ok(());
        }
        let (reply, rx) = reply_channel();
        let sent = self.send(ControlMsg::Shutdown { reply });
        self.running = false;
        let result = sent.and_then(|()| wait_reply(&rx, SYNC_TIMEOUT, "shutdown"));
        self.handle.join();
        result
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("Engine: shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{NullBackend, NullProbe};
    use crate::stream::{ExtData, SyncState};
    use crate::types::{ChannelLayout, SampleFormat};
    use std::time::{Duration, Instant};

    fn engine(settings: AudioSettings) -> (AudioEngine, NullProbe) {
        let probe = NullProbe::new();
        let backend = NullBackend::with_probe(probe.clone());
        let engine = AudioEngine::builder(settings)
            .backends(vec![Box::new(backend)])
            .build()
            .unwrap();
        (engine, probe)
    }

    fn stereo_format() -> AudioFormat {
        AudioFormat::pcm(SampleFormat::F32, 48000, ChannelLayout::stereo())
    }

    /// Feed `frames` interleaved stereo frames of a constant value
    fn feed(stream: &mut AudioStream, value: f32, frames: usize) {
        let samples = vec![value; frames * 2];
        let bytes: &[u8] = bytemuck::cast_slice(&samples);
        let mut offset = 0;
        let deadline = Instant::now() + Duration::from_secs(10);
        while offset < frames && Instant::now() < deadline {
            offset += stream.add_data(&[bytes], offset, frames - offset, Default::default());
        }
        assert_eq!(offset, frames);
    }

    /// Like `feed`, stamping every call with the pts of its first frame
    fn feed_at(stream: &mut AudioStream, value: f32, frames: usize, pts_ms: f64) {
        let samples = vec![value; frames * 2];
        let bytes: &[u8] = bytemuck::cast_slice(&samples);
        let mut offset = 0;
        let deadline = Instant::now() + Duration::from_secs(10);
        while offset < frames && Instant::now() < deadline {
            let ext = ExtData {
                pts: Some(pts_ms + offset as f64 * 1000.0 / 48000.0),
                ..Default::default()
            };
            offset += stream.add_data(&[bytes], offset, frames - offset, ext);
        }
        assert_eq!(offset, frames);
    }

    /// Presentation clock that never advances
    struct FrozenClock(f64);

    impl AvClock for FrozenClock {
        fn clock_ms(&self) -> f64 {
            self.0
        }
    }

    fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_stream_plays_and_drains() {
        let (engine, probe) = engine(AudioSettings::default());
        let mut stream = engine.new_stream(stereo_format(), StreamOptions::default(), None).unwrap();
        feed(&mut stream, 0.5, 9600);
        assert!(stream.drain(true));

        // drained means the engine let go of it, the device may still be writing
        assert!(wait_for(|| {
            let record = probe.record();
            record.frames_written >= 9600 && record.peak > 0.49
        }));
        let record = probe.record();
        assert!((record.peak - 0.5).abs() < 0.01, "peak {}", record.peak);
        assert_eq!(record.formats.last().map(|f| f.sample_rate), Some(48000));
    }

    #[test]
    fn test_two_streams_are_mixed() {
        let (engine, probe) = engine(AudioSettings::default());
        let mut a = engine.new_stream(stereo_format(), StreamOptions::default(), None).unwrap();
        let mut b = engine.new_stream(stereo_format(), StreamOptions::default(), None).unwrap();
        for _ in 0..10 {
            feed(&mut a, 0.3, 960);
            feed(&mut b, 0.3, 960);
        }
        a.drain(false);
        assert!(b.drain(true));
        a.drain(true);

        assert!(wait_for(|| probe.record().peak > 0.55));
        let peak = probe.record().peak;
        assert!((peak - 0.6).abs() < 0.05, "peak {}", peak);
    }

    #[test]
    fn test_master_volume_applied_without_device_volume() {
        let (engine, probe) = engine(AudioSettings::default());
        engine.set_volume(0.5).unwrap();
        let mut stream = engine.new_stream(stereo_format(), StreamOptions::default(), None).unwrap();
        feed(&mut stream, 0.8, 4800);
        assert!(stream.drain(true));

        assert!(wait_for(|| probe.record().peak > 0.35));
        let record = probe.record();
        assert!((record.peak - 0.4).abs() < 0.01, "peak {}", record.peak);
        assert_eq!(record.volume, None);
    }

    #[test]
    fn test_bitstream_must_play_alone() {
        let mut settings = AudioSettings::default();
        settings.passthrough.enabled = true;
        let (engine, _probe) = engine(settings);

        let ac3 = AudioFormat::raw(crate::types::RawCodec::Ac3, 48000);
        let _pcm = engine.new_stream(stereo_format(), StreamOptions::default(), None).unwrap();
        assert!(matches!(
            engine.new_stream(ac3, StreamOptions::default(), None),
            Err(AeError::InvalidStream(_))
        ));
    }

    #[test]
    fn test_disabled_passthrough_rejects_bitstream() {
        let (engine, _probe) = engine(AudioSettings::default());
        let ac3 = AudioFormat::raw(crate::types::RawCodec::Ac3, 48000);
        assert!(matches!(
            engine.new_stream(ac3, StreamOptions::default(), None),
            Err(AeError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_sound_plays_without_streams() {
        let (engine, probe) = engine(AudioSettings::default());
        let format = AudioFormat::pcm(SampleFormat::F32, 48000, ChannelLayout::mono());
        let samples = vec![0.25f32; 4800];
        let id = engine
            .make_sound(format, vec![bytemuck::cast_slice(&samples).to_vec()], samples.len())
            .unwrap();
        engine.play_sound(id).unwrap();

        // mono lands on both fronts at -3dB
        assert!(wait_for(|| probe.record().peak > 0.15));
        let peak = probe.record().peak;
        assert!((peak - 0.25 * std::f32::consts::FRAC_1_SQRT_2).abs() < 0.01, "peak {}", peak);
    }

    #[test]
    fn test_flush_twice_then_play() {
        let (engine, probe) = engine(AudioSettings::default());
        let mut stream = engine.new_stream(stereo_format(), StreamOptions::default(), None).unwrap();
        feed(&mut stream, 0.9, 4800);
        stream.flush();
        stream.flush();

        feed(&mut stream, 0.3, 4800);
        assert!(stream.drain(true));
        assert!(wait_for(|| probe.record().frames_written >= 4800));
    }

    #[test]
    fn test_repeated_drain_returns_at_once() {
        let (engine, _probe) = engine(AudioSettings::default());
        let mut stream = engine.new_stream(stereo_format(), StreamOptions::default(), None).unwrap();
        feed(&mut stream, 0.5, 4800);
        assert!(stream.drain(true));

        let start = Instant::now();
        assert!(stream.drain(true));
        assert!(stream.drain(false));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_backward_pts_widens_error_interval() {
        let (engine, _probe) = engine(AudioSettings::default());
        let mut stream = engine.new_stream(stereo_format(), StreamOptions::default(), None).unwrap();
        let id = stream.id();
        let interval = |engine: &AudioEngine| engine.stats().sync_info(id).map(|i| i.error_interval_ms);

        feed_at(&mut stream, 0.1, 960, 1000.0);
        feed_at(&mut stream, 0.1, 960, 500.0);
        assert!(wait_for(|| interval(&engine) == Some(2000)));

        // a long enough monotonic run halves it again
        for i in 1..=100 {
            feed_at(&mut stream, 0.1, 960, 500.0 + i as f64 * 20.0);
        }
        assert!(wait_for(|| interval(&engine) == Some(1000)));
    }

    #[test]
    fn test_stream_ahead_of_clock_is_adjusted() {
        let (engine, _probe) = engine(AudioSettings::default());
        let clock: Arc<dyn AvClock> = Arc::new(FrozenClock(0.0));
        let mut stream = engine
            .new_stream(stereo_format(), StreamOptions::default(), Some(clock))
            .unwrap();
        let id = stream.id();

        for chunk in 0..10 {
            feed_at(&mut stream, 0.2, 2400, 500.0 + chunk as f64 * 50.0);
        }
        assert!(wait_for(|| engine.stats().sync_info(id).is_some_and(|i| {
            matches!(i.state, SyncState::Adjust | SyncState::InSync) && i.error_ms > 0.0
        })));
    }

    #[test]
    fn test_streams_keep_flowing_without_a_device() {
        let probe = NullProbe::new();
        probe.set_fail_open(true);
        let engine = AudioEngine::builder(AudioSettings::default())
            .backends(vec![Box::new(NullBackend::with_probe(probe.clone()))])
            .build()
            .unwrap();
        let mut stream = engine.new_stream(stereo_format(), StreamOptions::default(), None).unwrap();

        let start = Instant::now();
        feed(&mut stream, 0.5, 48000);
        assert!(stream.drain(true));
        assert!(start.elapsed() < Duration::from_secs(3), "took {:?}", start.elapsed());
        assert_eq!(probe.record().frames_written, 0);
    }

    #[test]
    fn test_recovers_after_write_failures() {
        let (engine, probe) = engine(AudioSettings::default());
        let mut stream = engine.new_stream(stereo_format(), StreamOptions::default(), None).unwrap();
        feed(&mut stream, 0.5, 4800);
        assert!(wait_for(|| probe.record().frames_written > 0));

        let opens = probe.record().opens;
        probe.set_fail_writes(true);
        feed(&mut stream, 0.5, 24000);
        assert!(wait_for(|| probe.record().opens > opens));

        // audio fed before the next retry is dropped, so keep feeding
        probe.set_fail_writes(false);
        let target = probe.record().frames_written + 4800;
        let deadline = Instant::now() + Duration::from_secs(5);
        while probe.record().frames_written < target && Instant::now() < deadline {
            feed(&mut stream, 0.5, 960);
        }
        assert!(probe.record().frames_written >= target);
    }

    #[test]
    fn test_suspend_and_resume() {
        let (engine, probe) = engine(AudioSettings::default());
        assert!(wait_for(|| probe.record().opens >= 1));
        let opens = probe.record().opens;

        engine.suspend().unwrap();
        assert!(engine.is_suspended());
        engine.resume().unwrap();
        assert!(!engine.is_suspended());
        assert!(probe.record().opens > opens);
    }

    #[test]
    fn test_enumerate_devices() {
        let (engine, _probe) = engine(AudioSettings::default());
        let devices = engine.enumerate_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].driver, "null");
    }

    #[test]
    fn test_calls_after_shutdown_fail() {
        let (mut engine, _probe) = engine(AudioSettings::default());
        engine.shutdown().unwrap();
        assert!(matches!(engine.set_volume(1.0), Err(AeError::NotRunning)));
        assert!(engine.shutdown().is_ok());
    }
}
