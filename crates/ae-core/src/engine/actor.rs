//! Engine actor
//!
//! Owns every stream, every buffer pool and the sink handle. Producers and
//! the application talk to it only through the control and data ports; the
//! sink answers on its event port.
//!
//! ## States
//!
//! ```text
//! TOP ─┬─ WAIT_PRECOND     waiting for Init
//!      ├─ ERROR            sink failed; configure is retried on a timer
//!      ├─ UNCONFIGURED
//!      ├─ RECONFIGURING    waiting for queued audio to reach the device
//!      └─ CONFIGURED ─┬─ SUSPEND   device released
//!                     ├─ IDLE      nothing to process
//!                     └─ PLAY      ticking the pipeline
//! ```
//!
//! Every handler gets the event first at the leaf state and returns it when
//! it does not handle it, so it falls through to CONFIGURED (for the three
//! configured states) and finally to TOP.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{never, unbounded, Receiver, SendError, Sender, TryRecvError};

use super::command::{reply_channel, wait_reply, ControlMsg, DataMsg, StreamRequest, SYNC_TIMEOUT};
use super::configure::{
    aligned_input_frames, apply_settings_to_format, cap_period, select_input_format, FormatContext, OutputMode,
};
use super::gc::DiscardList;
use super::mixer::{self, Fade, Gain};
use super::sound::SoundBank;
use super::stats::{EngineStats, StreamStats};
use crate::buffer::{BufferPool, SampleBuffer};
use crate::config::{AudioSettings, ConfigMode, SoundMode};
use crate::encoder::{Encoder, EncoderFactory};
use crate::error::{AeError, AeResult};
use crate::resample::ResamplerFactory;
use crate::sink::{DeviceBackend, DeviceInfo, DeviceRegistry, SinkControl, SinkData, SinkEvent, SinkHandle, SinkInfo, SinkRequest};
use crate::stream::{EngineStream, SharedFlags, StreamBuffers, StreamEvent, StreamId, StreamInit, SyncAction, SyncState};
use crate::tempo::TempoFilterFactory;
use crate::types::{AudioFormat, SampleFormat, StdLayout, RAW_SAMPLE_RATE};
use crate::viz::VizTap;

/// Wait before the sink is opened again after a failure
const ERROR_RETRY: Duration = Duration::from_millis(500);

/// Longest wait between ticks while streams have audio queued
const PLAY_POLL: Duration = Duration::from_millis(100);

/// Shortest wait between ticks while waiting for the sink
const MIN_PLAY_WAIT: Duration = Duration::from_millis(5);

/// Housekeeping interval while idle
const IDLE_TICK: Duration = Duration::from_millis(5000);

/// Poll interval while queued audio plays out before a reconfigure
const RECONFIGURE_POLL: Duration = Duration::from_millis(100);

/// Wake-up interval when no timer is armed
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Everything the engine thread is started with
pub(crate) struct EngineConfig {
    pub settings: AudioSettings,
    pub resampler_factory: ResamplerFactory,
    pub tempo_factory: TempoFilterFactory,
    pub encoder_factory: Option<EncoderFactory>,
    pub backends: Vec<Box<dyn DeviceBackend>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    WaitPrecond,
    Error,
    Unconfigured,
    Reconfiguring,
    Suspend,
    Idle,
    Play,
}

impl EngineState {
    fn is_configured(self) -> bool {
        matches!(self, EngineState::Suspend | EngineState::Idle | EngineState::Play)
    }
}

enum Event {
    Control(ControlMsg),
    Data(DataMsg),
    Sink(SinkEvent),
    Timeout,
}

impl Event {
    fn name(&self) -> &'static str {
        match self {
            Event::Control(msg) => msg.name(),
            Event::Data(DataMsg::StreamSample { .. }) => "StreamSample",
            Event::Data(DataMsg::DrainStream { .. }) => "DrainStream",
            Event::Sink(SinkEvent::ReturnSample { .. }) => "ReturnSample",
            Event::Sink(SinkEvent::Error(_)) => "SinkError",
            Event::Timeout => "Timeout",
        }
    }
}

enum Wake {
    Event(Event),
    Tick,
    Closed,
}

/// Handle of the engine thread
pub(crate) struct EngineHandle {
    pub control: Sender<ControlMsg>,
    pub data: Sender<DataMsg>,
    thread: Option<JoinHandle<()>>,
}

impl EngineHandle {
    /// Start the sink and engine threads
    pub fn spawn(config: EngineConfig, stats: Arc<EngineStats>) -> AeResult<Self> {
        let (control_tx, control_rx) = unbounded();
        let (data_tx, data_rx) = unbounded();

        let sink = SinkHandle::spawn(DeviceRegistry::new(config.backends), stats.clone())?;
        let actor = EngineActor {
            settings: config.settings,
            resampler_factory: config.resampler_factory,
            tempo_factory: config.tempo_factory,
            encoder_factory: config.encoder_factory,
            stats,
            sink,
            state: EngineState::WaitPrecond,
            deadline: None,
            defer_data: false,
            running: true,
            streams: Vec::new(),
            next_stream_id: 0,
            sounds: SoundBank::new(),
            viz: None,
            discard: DiscardList::new(),
            sink_info: None,
            force_sink: false,
            devices: Vec::new(),
            mode: OutputMode::Pcm,
            input_format: None,
            internal_format: None,
            silence_pool: None,
            encoder: None,
            encoder_pool: None,
            volume: 1.0,
            muted: false,
            ext_drain: None,
            delay_hint: PLAY_POLL,
            scratch: Vec::new(),
            started: Instant::now(),
        };

        let thread = thread::Builder::new()
            .name("ae-engine".to_string())
            .spawn(move || actor.run(control_rx, data_rx))
            .map_err(|e| AeError::StreamBuildError(format!("Failed to spawn engine thread: {}", e)))?;

        Ok(Self {
            control: control_tx,
            data: data_tx,
            thread: Some(thread),
        })
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("Engine: thread panicked");
            }
        }
    }
}

struct EngineActor {
    settings: AudioSettings,
    resampler_factory: ResamplerFactory,
    tempo_factory: TempoFilterFactory,
    encoder_factory: Option<EncoderFactory>,
    stats: Arc<EngineStats>,
    sink: SinkHandle,

    state: EngineState,
    /// When the next Timeout fires; `None` disarms the timer
    deadline: Option<Instant>,
    /// Stop reading the data port
    defer_data: bool,
    running: bool,

    streams: Vec<EngineStream>,
    next_stream_id: u32,
    sounds: SoundBank,
    viz: Option<VizTap>,
    discard: DiscardList,

    sink_info: Option<SinkInfo>,
    /// Reopen the sink on the next configure even if the format matches
    force_sink: bool,
    devices: Vec<DeviceInfo>,
    mode: OutputMode,
    /// Format the engine was last driven by
    input_format: Option<AudioFormat>,
    /// Format streams are mixed in
    internal_format: Option<AudioFormat>,
    silence_pool: Option<BufferPool>,
    encoder: Option<Box<dyn Encoder>>,
    encoder_pool: Option<BufferPool>,

    volume: f32,
    muted: bool,
    /// Last stream went away; reconfigure once the sink has played out
    ext_drain: Option<Instant>,
    delay_hint: Duration,
    scratch: Vec<f32>,
    started: Instant,
}

impl EngineActor {
    fn run(mut self, control: Receiver<ControlMsg>, data: Receiver<DataMsg>) {
        log::info!("Engine: started");
        let deferred: Receiver<DataMsg> = never();

        while self.running {
            // control messages go first
            match control.try_recv() {
                Ok(msg) => {
                    self.dispatch(Event::Control(msg));
                    continue;
                }
                Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            let timeout = self
                .deadline
                .map_or(IDLE_POLL, |d| d.saturating_duration_since(Instant::now()));
            let data_port = if self.defer_data { &deferred } else { &data };
            let events = &self.sink.events;

            let wake = crossbeam::select! {
                recv(control) -> msg => match msg {
                    Ok(msg) => Wake::Event(Event::Control(msg)),
                    Err(_) => Wake::Closed,
                },
                recv(events) -> msg => match msg {
                    Ok(event) => Wake::Event(Event::Sink(event)),
                    Err(_) => Wake::Closed,
                },
                recv(data_port) -> msg => match msg {
                    Ok(msg) => Wake::Event(Event::Data(msg)),
                    Err(_) => Wake::Closed,
                },
                default(timeout) => Wake::Tick,
            };

            match wake {
                Wake::Event(event) => self.dispatch(event),
                Wake::Tick => {
                    if self.deadline.is_some_and(|d| Instant::now() >= d) {
                        self.deadline = None;
                        self.dispatch(Event::Timeout);
                    }
                }
                Wake::Closed => break,
            }
        }

        if self.running {
            self.shutdown();
        }
        log::info!("Engine: stopped");
    }

    fn dispatch(&mut self, event: Event) {
        let state = self.state;
        let handled = match state {
            EngineState::WaitPrecond | EngineState::Unconfigured => self.handle_unconfigured(event),
            EngineState::Error => self.handle_error(event),
            EngineState::Reconfiguring => self.handle_reconfiguring(event),
            EngineState::Suspend => self.handle_suspend(event),
            EngineState::Idle => self.handle_idle(event),
            EngineState::Play => self.handle_play(event),
        };
        let Some(event) = handled else {
            return;
        };
        let event = if state.is_configured() {
            match self.handle_configured(event) {
                Some(event) => event,
                None => return,
            }
        } else {
            event
        };
        if let Some(event) = self.handle_top(event) {
            log::debug!("Engine: {} not handled in {:?}", event.name(), state);
        }
    }

    fn set_state(&mut self, state: EngineState) {
        if state != self.state {
            log::debug!("Engine: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn set_timeout(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    /// Tick right away after new work arrived
    fn play_now(&mut self) {
        if matches!(self.state, EngineState::Idle | EngineState::Play) {
            self.set_state(EngineState::Play);
            self.set_timeout(Duration::ZERO);
        }
    }

    fn enter_play(&mut self) {
        self.set_state(EngineState::Play);
        self.set_timeout(Duration::ZERO);
    }

    fn enter_error(&mut self) {
        self.set_state(EngineState::Error);
        self.set_timeout(ERROR_RETRY);
        self.defer_data = false;
        self.discard_input();
    }

    /// Configure and go on playing, or fall into ERROR
    fn configure_or_error(&mut self, desired: Option<AudioFormat>) -> bool {
        match self.configure(desired) {
            Ok(()) => {
                self.enter_play();
                true
            }
            Err(e) => {
                log::error!("Engine: configure failed: {}", e);
                self.enter_error();
                false
            }
        }
    }

    fn begin_reconfigure(&mut self) {
        self.set_state(EngineState::Reconfiguring);
        // samples queue up on the port until the new format is in place
        self.defer_data = true;
        self.set_timeout(Duration::ZERO);
    }

    // ---- state handlers ----

    fn handle_top(&mut self, event: Event) -> Option<Event> {
        match event {
            Event::Control(msg) => self.top_control(msg),
            Event::Data(msg) => {
                self.queue_data(msg);
                None
            }
            Event::Sink(SinkEvent::ReturnSample { buffer, delay_hint }) => {
                self.delay_hint = delay_hint;
                self.route_buffer(buffer);
                None
            }
            Event::Sink(SinkEvent::Error(e)) => {
                log::warn!("Engine: sink error while not configured: {}", e);
                None
            }
            Event::Timeout => Some(Event::Timeout),
        }
    }

    fn top_control(&mut self, msg: ControlMsg) -> Option<Event> {
        let threshold = self.settings.atempo_threshold;
        match msg {
            ControlMsg::SetVolume(volume) => {
                self.volume = volume.clamp(0.0, 1.0);
                self.send_volume();
            }
            ControlMsg::SetMute(muted) => {
                self.muted = muted;
                self.send_volume();
            }
            ControlMsg::SetSoundMode(mode) => {
                self.settings.gui_sound_mode = mode;
            }
            ControlMsg::AppFocused(focused) => self.sink_send(SinkControl::AppFocused(focused)),
            ControlMsg::EnumerateDevices { reply } => {
                let devices = self.enumerate(false);
                let _ = reply.send(devices);
            }
            ControlMsg::Suspend { reply } | ControlMsg::Resume { reply } => {
                let _ = reply.send(());
            }
            ControlMsg::ApplySettings(settings) => self.store_settings(*settings),

            ControlMsg::NewStream { request, reply } => {
                let result = if self.state == EngineState::WaitPrecond {
                    Err(AeError::NotRunning)
                } else {
                    self.create_stream(*request).and_then(|id| self.stream_init(id))
                };
                let _ = reply.send(result);
            }
            ControlMsg::FreeStream { id, buffers } => self.free_stream(id, buffers),
            ControlMsg::FlushStream { id, epoch, reply } => {
                self.flush_stream(id, epoch);
                let _ = reply.send(());
            }
            ControlMsg::PauseStream { id, paused } => {
                self.with_stream(id, |s| s.set_paused(paused));
            }
            ControlMsg::StreamVolume { id, volume } => self.with_stream(id, |s| {
                s.volume = volume;
                s.fade = None;
                let mut flags = s.flags.lock();
                flags.volume = volume;
                flags.fading = false;
            }),
            ControlMsg::StreamReplayGain { id, gain } => self.with_stream(id, |s| s.replay_gain = gain),
            ControlMsg::StreamAmplification { id, amplify } => {
                self.with_stream(id, |s| s.limiter.set_amplification(amplify))
            }
            ControlMsg::StreamFade { id, from, to, ms } => self.with_stream(id, |s| {
                if ms == 0 {
                    s.volume = to;
                    s.fade = None;
                } else {
                    s.fade = Some(Fade::new(from, to, ms));
                }
                let mut flags = s.flags.lock();
                flags.fading = ms > 0;
                flags.volume = to;
            }),
            ControlMsg::StreamResampleRatio { id, ratio } => self.with_stream(id, |s| {
                s.resample_ratio = ratio;
                if s.sync.state() == SyncState::Off {
                    s.apply_rr(ratio, threshold);
                }
            }),
            ControlMsg::StreamResampleMode { id, enabled } => self.with_stream(id, |s| {
                s.resample_mode = enabled;
                s.flags.lock().resample_mode = enabled;
            }),
            ControlMsg::StreamForceResampler { id, force } => self.with_stream(id, |s| {
                s.force_resampler = force;
                if let Some(buffers) = s.buffers.as_mut() {
                    buffers.force_resampler(force);
                }
            }),
            ControlMsg::StreamSlave { id, slave } => self.with_stream(id, |s| s.slave = slave),
            ControlMsg::StreamErrorInterval { id, interval_ms } => {
                self.with_stream(id, |s| s.sync.set_error_interval(interval_ms))
            }
            ControlMsg::StreamSync { id, enabled } => self.with_stream(id, |s| {
                if enabled && s.clock.is_some() {
                    s.sync.start();
                } else {
                    s.sync.stop();
                    s.mute = false;
                    s.apply_rr(s.resample_ratio, threshold);
                }
            }),

            ControlMsg::MakeSound { request, reply } => {
                let _ = reply.send(self.sounds.add(*request));
            }
            ControlMsg::StopSound(id) => self.sounds.stop(id),
            ControlMsg::FreeSound(id) => self.sounds.free(id),
            ControlMsg::PlaySound(id) => log::debug!("Engine: sound {} ignored while not configured", id),

            ControlMsg::RegisterCallback(callback) => self.viz = Some(VizTap::new(callback)),
            ControlMsg::UnregisterCallback => self.viz = None,

            ControlMsg::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }

            msg @ (ControlMsg::Init
            | ControlMsg::Reconfigure
            | ControlMsg::DeviceChange
            | ControlMsg::DeviceCountChange) => return Some(Event::Control(msg)),
        }
        None
    }

    fn handle_unconfigured(&mut self, event: Event) -> Option<Event> {
        match event {
            Event::Control(ControlMsg::Init) => {
                self.set_state(EngineState::Unconfigured);
                self.enumerate(false);
                self.configure_or_error(None);
                None
            }
            event => Some(event),
        }
    }

    fn handle_error(&mut self, event: Event) -> Option<Event> {
        match event {
            Event::Timeout => {
                self.force_sink = true;
                self.configure_or_error(None);
                None
            }
            Event::Control(ControlMsg::DeviceChange) | Event::Control(ControlMsg::DeviceCountChange) => {
                self.enumerate(true);
                self.set_timeout(Duration::ZERO);
                None
            }
            Event::Control(ControlMsg::NewStream { request, reply }) => {
                let result = self.create_stream(*request).and_then(|id| self.stream_init(id));
                let _ = reply.send(result);
                self.discard_input();
                None
            }
            Event::Data(msg) => {
                self.discard_data(msg);
                None
            }
            event => Some(event),
        }
    }

    fn handle_reconfiguring(&mut self, event: Event) -> Option<Event> {
        match event {
            Event::Timeout => {
                if self.stats.get_water_level() > 0.0 {
                    self.set_timeout(RECONFIGURE_POLL);
                    return None;
                }
                self.drain_sink();
                self.defer_data = false;
                self.configure_or_error(None);
                None
            }
            Event::Control(ControlMsg::ApplySettings(settings)) => {
                let settings = *settings;
                let resamplers = self.settings.resampler_changed(&settings);
                self.store_settings(settings);
                if resamplers {
                    self.change_resamplers();
                }
                None
            }
            Event::Control(ControlMsg::Reconfigure) => None,
            Event::Control(ControlMsg::DeviceChange) => {
                self.enumerate(true);
                self.force_sink = true;
                None
            }
            event => Some(event),
        }
    }

    fn handle_suspend(&mut self, event: Event) -> Option<Event> {
        match event {
            Event::Control(ControlMsg::Resume { reply }) => {
                log::info!("Engine: resuming");
                self.stats.set_suspended(false);
                self.defer_data = false;
                self.enumerate(true);
                self.force_sink = true;
                self.configure_or_error(None);
                let _ = reply.send(());
                None
            }
            Event::Control(ControlMsg::Suspend { reply }) => {
                let _ = reply.send(());
                None
            }
            Event::Control(ControlMsg::NewStream { request, reply }) => {
                let result = self.create_stream(*request).and_then(|id| self.stream_init(id));
                let _ = reply.send(result);
                None
            }
            Event::Control(ControlMsg::ApplySettings(settings)) => {
                self.store_settings(*settings);
                self.force_sink = true;
                None
            }
            Event::Control(ControlMsg::Reconfigure)
            | Event::Control(ControlMsg::DeviceChange)
            | Event::Control(ControlMsg::DeviceCountChange) => {
                self.force_sink = true;
                None
            }
            Event::Control(ControlMsg::PlaySound(_)) => None,
            Event::Sink(SinkEvent::ReturnSample { buffer, .. }) => {
                self.route_buffer(buffer);
                None
            }
            Event::Sink(SinkEvent::Error(_)) | Event::Timeout => None,
            event => Some(event),
        }
    }

    fn handle_idle(&mut self, event: Event) -> Option<Event> {
        match event {
            Event::Timeout => {
                self.discard.sweep();
                match self.ext_drain {
                    Some(deadline) if Instant::now() >= deadline => {
                        // the last stream has played out: fall back to the idle format
                        self.ext_drain = None;
                        if self.configure_or_error(None) {
                            self.set_state(EngineState::Idle);
                            self.set_timeout(IDLE_TICK);
                        }
                    }
                    Some(deadline) => self.deadline = Some(deadline),
                    None => self.set_timeout(IDLE_TICK),
                }
                None
            }
            event => Some(event),
        }
    }

    fn handle_play(&mut self, event: Event) -> Option<Event> {
        match event {
            Event::Timeout => {
                self.discard.sweep();
                let busy = self.run_stages();
                if self.state != EngineState::Play {
                    return None;
                }
                if busy {
                    self.set_timeout(Duration::ZERO);
                } else if self.has_work() {
                    let wait = self.delay_hint.clamp(MIN_PLAY_WAIT, PLAY_POLL);
                    self.set_timeout(wait);
                } else {
                    self.set_state(EngineState::Idle);
                    self.set_timeout(Duration::ZERO);
                }
                None
            }
            event => Some(event),
        }
    }

    fn handle_configured(&mut self, event: Event) -> Option<Event> {
        match event {
            Event::Control(msg) => self.configured_control(msg),
            Event::Data(msg) => {
                self.queue_data(msg);
                self.play_now();
                None
            }
            Event::Sink(SinkEvent::ReturnSample { buffer, delay_hint }) => {
                self.delay_hint = delay_hint;
                self.route_buffer(buffer);
                self.play_now();
                None
            }
            Event::Sink(SinkEvent::Error(e)) => {
                log::error!("Engine: sink failed: {}", e);
                self.sink_info = None;
                self.force_sink = true;
                self.enter_error();
                None
            }
            event @ Event::Timeout => Some(event),
        }
    }

    fn configured_control(&mut self, msg: ControlMsg) -> Option<Event> {
        match msg {
            ControlMsg::Reconfigure => {
                self.change_resamplers();
                self.begin_reconfigure();
            }
            ControlMsg::ApplySettings(settings) => {
                let settings = *settings;
                let reconfigure = self.settings.needs_reconfigure(&settings);
                let resamplers = self.settings.resampler_changed(&settings);
                self.store_settings(settings);
                if resamplers {
                    self.change_resamplers();
                }
                if reconfigure {
                    self.begin_reconfigure();
                }
            }
            ControlMsg::DeviceChange => {
                log::info!("Engine: device changed");
                self.enumerate(true);
                self.force_sink = true;
                self.begin_reconfigure();
            }
            ControlMsg::DeviceCountChange => {
                let before = self.devices.clone();
                if self.enumerate(true) != before {
                    log::info!("Engine: device list changed");
                    self.force_sink = true;
                    self.begin_reconfigure();
                }
            }
            ControlMsg::Suspend { reply } => {
                log::info!("Engine: suspending");
                let (sink_reply, rx) = reply_channel();
                self.sink_send(SinkControl::Unconfigure { reply: sink_reply });
                if let Err(e) = wait_reply(&rx, SYNC_TIMEOUT, "sink unconfigure") {
                    log::error!("Engine: {}", e);
                }
                self.sink_info = None;
                self.stats.set_suspended(true);
                self.defer_data = true;
                self.set_state(EngineState::Suspend);
                self.deadline = None;
                let _ = reply.send(());
            }

            ControlMsg::NewStream { request, reply } => {
                let result = match self.create_stream(*request) {
                    Ok(id) => {
                        self.configure_or_error(None);
                        self.stream_init(id)
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            ControlMsg::FreeStream { id, buffers } => {
                self.free_stream(id, buffers);
                self.play_now();
            }
            ControlMsg::FlushStream { id, epoch, reply } => {
                if self.flush_stream(id, epoch) {
                    self.flush_engine();
                }
                let _ = reply.send(());
                self.play_now();
            }
            ControlMsg::PauseStream { id, paused } => {
                let only = self.streams.len() == 1;
                self.with_stream(id, |s| s.set_paused(paused));
                if paused && only {
                    self.flush_engine();
                }
                self.play_now();
            }
            ControlMsg::PlaySound(id) => {
                let allowed = match self.settings.gui_sound_mode {
                    SoundMode::Off => false,
                    SoundMode::Idle => self.streams.iter().all(|s| s.paused),
                    SoundMode::Always => true,
                };
                if allowed && !self.mode_is_raw() {
                    self.sounds.play(id);
                    self.play_now();
                }
            }
            msg => return Some(Event::Control(msg)),
        }
        None
    }

    // ---- streams ----

    fn stream_index(&self, id: StreamId) -> Option<usize> {
        self.streams.iter().position(|s| s.id == id)
    }

    fn with_stream(&mut self, id: StreamId, f: impl FnOnce(&mut EngineStream)) {
        match self.streams.iter_mut().find(|s| s.id == id) {
            Some(stream) => f(stream),
            None => log::debug!("Engine: message for unknown stream {}", id),
        }
    }

    fn mode_is_raw(&self) -> bool {
        self.mode == OutputMode::Raw
    }

    /// Validate a request and add the stream, without configuring
    fn create_stream(&mut self, request: StreamRequest) -> AeResult<StreamId> {
        let StreamRequest { format, options, clock } = request;
        validate_stream_format(&format, &self.settings)?;
        if format.is_raw() && !self.streams.is_empty() {
            return Err(AeError::InvalidStream("a bitstream stream must be the only stream".into()));
        }
        if self.streams.iter().any(|s| s.is_raw()) {
            return Err(AeError::InvalidStream("a bitstream stream is playing".into()));
        }

        self.next_stream_id += 1;
        let id = StreamId(self.next_stream_id);
        let (events, reclaim) = unbounded();
        let rate = self
            .internal_format
            .as_ref()
            .map_or(format.sample_rate, |f| f.sample_rate);
        let mut stream = EngineStream::new(
            id,
            format.clone(),
            BufferPool::new(format.clone()),
            options,
            clock,
            events,
            SharedFlags::default(),
            self.settings.sync.clone(),
            rate,
        );
        stream.reclaim = Some(reclaim);
        self.stats.update_stream(
            id,
            StreamStats {
                rr: 1.0,
                tempo: 1.0,
                ..Default::default()
            },
        );
        self.streams.push(stream);
        self.ext_drain = None;
        log::info!("Engine: stream {} created ({})", id, format);
        Ok(id)
    }

    /// Everything the producer handle needs; allocates the input pool if missing
    fn stream_init(&mut self, id: StreamId) -> AeResult<StreamInit> {
        let internal = self.internal_format.clone();
        let cache_ms = self.cache_ms();
        let tuning = self.settings.sync.clone();
        let Some(stream) = self.streams.iter_mut().find(|s| s.id == id) else {
            return Err(AeError::InvalidStream(format!("stream {} went away", id)));
        };
        if stream.input_pool.all_samples() == 0 {
            let format = match internal.as_ref() {
                Some(internal) => input_buffer_format(&stream.format, internal),
                None => fallback_buffer_format(&stream.format),
            };
            stream.input_pool = BufferPool::new(format);
            stream.input_pool.create(cache_ms);
        }
        let Some(events) = stream.reclaim.clone() else {
            return Err(AeError::Disconnected("stream events"));
        };
        Ok(StreamInit {
            id,
            buffer_format: stream.input_pool.format().clone(),
            events,
            flags: stream.flags.clone(),
            error_interval_ms: tuning.error_interval_ms,
            max_error_interval_ms: tuning.max_error_interval_ms,
        })
    }

    fn free_stream(&mut self, id: StreamId, buffers: Vec<SampleBuffer>) {
        let Some(index) = self.stream_index(id) else {
            for buffer in buffers {
                self.route_buffer(buffer);
            }
            return;
        };
        let mut stream = self.streams.remove(index);

        let mut returned = buffers;
        if let Some(reclaim) = stream.reclaim.take() {
            returned.extend(reclaim.try_iter().filter_map(|event| match event {
                StreamEvent::Buffer(buffer) => Some(buffer),
                StreamEvent::Drained => None,
            }));
        }
        for buffer in returned {
            if let Err(buffer) = stream.return_buffer(buffer) {
                self.route_buffer(buffer);
            }
        }

        self.discard.retire_all(stream.into_pools());
        self.stats.remove_stream(id);
        for other in &mut self.streams {
            if other.slave == Some(id) {
                other.slave = None;
            }
        }
        log::info!("Engine: stream {} freed", id);

        if self.streams.is_empty() {
            let delay = Duration::from_secs_f64(self.stats.get_delay());
            self.ext_drain = Some(Instant::now() + delay);
        }
    }

    /// Returns whether the stream is the only one
    fn flush_stream(&mut self, id: StreamId, epoch: u64) -> bool {
        let only = self.streams.len() == 1;
        let Some(stream) = self.streams.iter_mut().find(|s| s.id == id) else {
            return false;
        };
        stream.epoch = epoch;
        stream.flush();
        stream.set_paused(false);
        log::debug!("Engine: stream {} flushed", id);
        only
    }

    fn queue_data(&mut self, msg: DataMsg) {
        match msg {
            DataMsg::StreamSample { id, epoch, buffer } => {
                let Some(stream) = self.streams.iter_mut().find(|s| s.id == id) else {
                    self.route_buffer(buffer);
                    return;
                };
                stream.outstanding = stream.outstanding.saturating_sub(1);
                if epoch != stream.epoch || buffer.frames() == 0 {
                    if let Err(buffer) = stream.return_buffer(buffer) {
                        self.route_buffer(buffer);
                    }
                    return;
                }
                if stream.draining || stream.drained {
                    stream.set_draining(false);
                }
                stream.pending.push_back(buffer);
            }
            DataMsg::DrainStream { id, epoch } => self.with_stream(id, |s| {
                if s.epoch == epoch {
                    s.set_draining(true);
                }
            }),
        }
    }

    /// Without a device, producer samples go straight back as free buffers
    fn discard_data(&mut self, msg: DataMsg) {
        match msg {
            DataMsg::StreamSample { id, buffer, .. } => {
                let Some(stream) = self.streams.iter_mut().find(|s| s.id == id) else {
                    self.route_buffer(buffer);
                    return;
                };
                if let Err(SendError(event)) = stream.events.send(StreamEvent::Buffer(buffer)) {
                    stream.outstanding = stream.outstanding.saturating_sub(1);
                    if let StreamEvent::Buffer(buffer) = event {
                        if let Err(buffer) = stream.return_buffer(buffer) {
                            self.route_buffer(buffer);
                        }
                    }
                }
            }
            DataMsg::DrainStream { id, epoch } => self.with_stream(id, |s| {
                if s.epoch == epoch && !s.drained {
                    log::debug!("Stream {}: drained without a device", s.id);
                    if s.events.send(StreamEvent::Drained).is_err() {
                        log::debug!("Stream {}: producer went away", s.id);
                    }
                    s.set_drained();
                    s.draining = false;
                    s.started = false;
                }
            }),
        }
    }

    /// Drop queued producer audio and hand out every free input buffer
    fn discard_input(&mut self) {
        let mut foreign = Vec::new();
        for stream in &mut self.streams {
            let dropped = stream.pending.len();
            while let Some(buffer) = stream.pending.pop_front() {
                if let Err(buffer) = stream.return_buffer(buffer) {
                    foreign.push(buffer);
                }
            }
            if dropped > 0 {
                log::debug!("Stream {}: discarded {} queued buffers", stream.id, dropped);
            }
            top_up(stream, 0.0, f64::INFINITY);
        }
        for buffer in foreign {
            self.route_buffer(buffer);
        }
    }

    // ---- sink ----

    fn sink_send(&self, msg: SinkControl) {
        if self.sink.control.send(msg).is_err() {
            log::error!("Engine: sink went away");
        }
    }

    fn send_volume(&self) {
        let volume = if self.muted { 0.0 } else { self.volume };
        self.sink_send(SinkControl::Volume(volume));
    }

    fn enumerate(&mut self, force: bool) -> Vec<DeviceInfo> {
        let (reply, rx) = reply_channel();
        self.sink_send(SinkControl::Enumerate { force, reply });
        match wait_reply(&rx, SYNC_TIMEOUT, "device enumeration") {
            Ok(devices) => self.devices = devices,
            Err(e) => log::error!("Engine: {}", e),
        }
        self.devices.clone()
    }

    fn drain_sink(&mut self) {
        let (reply, rx) = reply_channel();
        self.sink_send(SinkControl::Drain { reply });
        if let Err(e) = wait_reply(&rx, SYNC_TIMEOUT, "sink drain") {
            log::error!("Engine: {}", e);
        }
    }

    /// Drop everything queued in the sink, the viz tap and the stats
    fn flush_engine(&mut self) {
        let (reply, rx) = reply_channel();
        self.sink_send(SinkControl::Flush { reply });
        if let Err(e) = wait_reply(&rx, SYNC_TIMEOUT, "sink flush") {
            log::error!("Engine: {}", e);
        }
        if let Some(viz) = self.viz.as_mut() {
            viz.flush();
        }
        if let Some(info) = self.sink_info.as_ref() {
            self.stats.reset(
                info.format.sample_rate,
                info.cache_total,
                info.latency,
                self.settings.buffering.max_cache_level_s,
            );
        }
    }

    fn open_sink(&mut self, format: AudioFormat, device: String) -> AeResult<SinkInfo> {
        let request = SinkRequest {
            format,
            device,
            force: std::mem::take(&mut self.force_sink),
            silence_timeout: Duration::from_secs(self.settings.silence_timeout_s as u64),
            stream_noise: self.settings.stream_noise,
        };
        let (reply, rx) = reply_channel();
        self.sink_send(SinkControl::Configure {
            request: Box::new(request),
            reply,
        });

        match wait_reply(&rx, SYNC_TIMEOUT, "sink configure").and_then(|result| result) {
            Ok(info) => {
                if self.sink_info.as_ref() != Some(&info) {
                    self.stats.reset(
                        info.format.sample_rate,
                        info.cache_total,
                        info.latency,
                        self.settings.buffering.max_cache_level_s,
                    );
                    self.stats.set_has_volume(info.has_volume);
                    self.send_volume();
                }
                self.sink_info = Some(info.clone());
                Ok(info)
            }
            Err(e) => {
                self.sink_info = None;
                Err(e)
            }
        }
    }

    // ---- configuration ----

    fn cache_ms(&self) -> u32 {
        (self.settings.buffering.max_cache_level_s * 1000.0) as u32
    }

    fn store_settings(&mut self, settings: AudioSettings) {
        if settings.sync != self.settings.sync {
            for stream in &mut self.streams {
                stream.sync.set_tuning(settings.sync.clone());
            }
        }
        self.settings = settings;
    }

    /// Rebuild resamplers after quality, upmix or normalize changed
    fn change_resamplers(&mut self) {
        let Some(internal_channels) = self.internal_format.as_ref().map(|f| f.channels()) else {
            return;
        };
        for stream in &mut self.streams {
            let normalize = normalize_for(&self.settings, stream.format.channels(), internal_channels);
            if let Some(buffers) = stream.buffers.as_mut() {
                buffers.configure_resampler(self.settings.resample_quality, self.settings.stereo_upmix, normalize);
            }
        }
    }

    /// Negotiate the output and bring every pool in line with it
    fn configure(&mut self, desired: Option<AudioFormat>) -> AeResult<()> {
        let active: Vec<&AudioFormat> = self.streams.iter().filter(|s| !s.drained).map(|s| &s.format).collect();
        let count = active.len();
        let input = select_input_format(active.first().copied(), count, desired.as_ref(), self.input_format.as_ref());
        let ctx = FormatContext {
            has_streams: count > 0,
            water_level: self.stats.get_water_level(),
            internal_layout: self.internal_format.as_ref().map(|f| f.layout.clone()),
            can_transcode: self.encoder_factory.is_some(),
        };
        let (mut request, mode) = apply_settings_to_format(&input, &self.settings, &ctx);

        let mut encoder = None;
        let mut pcm_format = None;
        if mode == OutputMode::Transcode {
            let Some(factory) = self.encoder_factory else {
                return Err(AeError::UnsupportedFormat("transcode without an encoder".into()));
            };
            let mut enc = factory();
            let mut pcm = AudioFormat::internal(RAW_SAMPLE_RATE, input.layout.resolve(&StdLayout::L5_1.layout()), 0);
            request = enc.initialize(&mut pcm)?;
            if request.frames == 0 {
                request.frames = enc.frames_per_packet();
            }
            pcm_format = Some(pcm);
            encoder = Some(enc);
        }

        let device = match mode {
            OutputMode::Pcm => self.settings.device.clone(),
            OutputMode::Raw | OutputMode::Transcode => self.settings.passthrough.device.clone(),
        };
        let info = self.open_sink(request.clone(), device)?;

        let mut sink_format = info.format.clone();
        if !sink_format.is_raw() {
            cap_period(&mut sink_format, self.settings.buffering.max_sink_buffer_ms);
        }
        let internal = match (mode, pcm_format) {
            (OutputMode::Transcode, Some(pcm)) => pcm,
            (OutputMode::Raw, _) => sink_format.clone(),
            _ => AudioFormat::internal(sink_format.sample_rate, sink_format.layout.clone(), sink_format.frames),
        };
        let internal_changed = self.internal_format.as_ref() != Some(&internal);

        if let Some(pool) = self.silence_pool.take() {
            self.discard.retire(pool);
        }
        if let Some(pool) = self.encoder_pool.take() {
            self.discard.retire(pool);
        }
        let water_ms = (self.settings.buffering.max_water_level_s * 1000.0) as u32;
        if !internal.is_raw() {
            let mut pool = BufferPool::new(internal.clone());
            pool.create(water_ms);
            self.silence_pool = Some(pool);
        }
        if encoder.is_some() {
            let mut pool = BufferPool::new(request.clone());
            pool.create(water_ms);
            self.encoder_pool = Some(pool);
        }
        self.sink_send(SinkControl::Streaming(!self.streams.is_empty()));

        let cache_ms = self.cache_ms();
        let fill_packets = mode == OutputMode::Transcode || self.streams.len() > 1;
        for stream in &mut self.streams {
            if stream.input_pool.all_samples() == 0 {
                let mut pool = BufferPool::new(input_buffer_format(&stream.format, &internal));
                pool.create(cache_ms);
                stream.input_pool = pool;
            }

            let stale = stream.buffers.as_ref().is_none_or(|b| b.format() != &internal);
            if stale {
                if let Some(old) = stream.buffers.take() {
                    let (pools, foreign) = old.into_pools();
                    for buffer in foreign {
                        if let Err(buffer) = stream.input_pool.return_buffer(buffer) {
                            log::debug!("Stream {}: dropping buffer of pool {:?}", stream.id, buffer.pool_id());
                        }
                    }
                    self.discard.retire_all(pools);
                }
                let mut buffers = StreamBuffers::new(
                    stream.input_pool.format().clone(),
                    internal.clone(),
                    self.settings.resample_quality,
                    self.resampler_factory,
                    self.tempo_factory,
                );
                let normalize = normalize_for(&self.settings, stream.format.channels(), internal.channels());
                buffers.force_resampler(stream.force_resampler);
                buffers.create(cache_ms, self.settings.stereo_upmix, normalize);
                if stream.draining {
                    buffers.set_drain(true);
                }
                stream.buffers = Some(buffers);
                stream.started = false;
            }
            if let Some(buffers) = stream.buffers.as_mut() {
                buffers.set_fill_packets(fill_packets);
            }
            stream.limiter.set_sample_rate(internal.sample_rate);
        }

        if internal_changed {
            self.sounds.invalidate();
        }
        log::info!("Engine: {:?} output, mixing in {}", mode, internal);
        self.mode = mode;
        self.encoder = encoder;
        self.input_format = Some(input);
        self.internal_format = Some(internal);
        self.discard.sweep();
        self.ext_drain = None;
        Ok(())
    }

    // ---- pipeline ----

    /// One tick of the pipeline; returns whether anything was done
    fn run_stages(&mut self) -> bool {
        let mut busy = false;
        let water = self.stats.get_water_level();
        let max_cache = self.settings.buffering.max_cache_level_s;
        let mut slaves = Vec::new();

        for stream in &mut self.streams {
            if stream.buffers.is_none() {
                continue;
            }
            if !stream.paused {
                busy |= stream.process();
                stream.set_buffering(false);
            } else if stream.buffering && stream.pending.len() * 2 > stream.input_pool.all_samples() {
                stream.set_buffering(false);
            }

            let drained = stream.draining
                && stream.pending.is_empty()
                && stream.buffers.as_ref().is_some_and(|b| b.is_drained());
            if drained {
                log::debug!("Stream {}: drained", stream.id);
                if stream.events.send(StreamEvent::Drained).is_err() {
                    log::debug!("Stream {}: producer went away", stream.id);
                }
                stream.set_drained();
                stream.draining = false;
                stream.started = false;
                if let Some(buffers) = stream.buffers.as_mut() {
                    buffers.set_drain(false);
                }
                slaves.extend(stream.slave.take());
            } else {
                top_up(stream, water, max_cache);
            }
        }

        for slave in slaves {
            let Some(index) = self.stream_index(slave) else {
                continue;
            };
            log::debug!("Engine: handing over to stream {}", slave);
            self.streams[index].set_paused(false);
            if self.settings.config_mode == ConfigMode::Match {
                let format = self.streams[index].format.clone();
                if let Err(e) = self.configure(Some(format)) {
                    log::error!("Engine: configure for stream {} failed: {}", slave, e);
                    self.enter_error();
                    return false;
                }
            }
        }

        let encoder_ready =
            self.mode != OutputMode::Transcode || self.encoder_pool.as_ref().is_some_and(|p| p.has_free());
        if self.sink_info.is_some()
            && encoder_ready
            && self.stats.get_water_level() < self.settings.buffering.max_water_level_s
        {
            self.sync_streams();
            busy |= match self.mode {
                OutputMode::Raw => self.pass_through(),
                OutputMode::Pcm | OutputMode::Transcode => self.mix(),
            };
        }

        self.publish_stats();
        busy
    }

    /// Drift correction against each stream's reference clock
    fn sync_streams(&mut self) {
        let now_ms = self.started.elapsed().as_millis() as u64;
        let delay_ms = self.stats.get_delay() * 1000.0;
        let threshold = self.settings.atempo_threshold;

        for stream in &mut self.streams {
            stream.mute = false;
            if stream.paused || stream.sync.state() == SyncState::Off {
                continue;
            }
            let Some(clock) = stream.clock.clone() else {
                continue;
            };
            let Some(pts) = stream.buffers.as_ref().and_then(|b| b.front_timestamp()) else {
                continue;
            };
            let speed = clock.clock_speed();
            let error = pts - (clock.clock_ms() + delay_ms * speed);
            let action = stream.sync.update(error, now_ms, speed, stream.resample_mode);

            match action {
                SyncAction::None => {}
                SyncAction::Mute => stream.mute = true,
                SyncAction::InsertSilence { ms } => {
                    if let Some(buffers) = stream.buffers.as_mut() {
                        let inserted = buffers.insert_silence(ms);
                        log::debug!("Stream {}: inserted {:.1} ms of silence", stream.id, inserted);
                    }
                }
                SyncAction::Drop { ms } => {
                    if let Some(buffers) = stream.buffers.as_mut() {
                        let dropped = buffers.drop_ms(ms);
                        log::debug!("Stream {}: dropped {:.1} ms", stream.id, dropped);
                    }
                }
                SyncAction::SetRatio(ratio) => {
                    let ratio = ratio * stream.resample_ratio;
                    stream.apply_rr(ratio, threshold);
                }
            }
        }
    }

    /// Bitstream output: the single raw stream goes to the sink untouched
    fn pass_through(&mut self) -> bool {
        let muted = self.muted;
        let Some(stream) = self.streams.iter_mut().find(|s| !s.paused) else {
            return false;
        };
        let Some(mut buffer) = stream.buffers.as_mut().and_then(|b| b.pop_output()) else {
            return false;
        };
        stream.started = true;
        if (stream.mute || muted) && buffer.pkt.pause_burst_ms == 0 {
            buffer.pkt.pause_burst_ms = buffer.duration_ms().round().max(1.0) as u32;
        }
        self.send_to_sink(buffer);
        true
    }

    /// Mix one buffer from every ready stream and send it on
    fn mix(&mut self) -> bool {
        let all_ready = self
            .streams
            .iter()
            .filter(|s| !s.paused && s.started && !s.draining)
            .all(|s| s.buffers.as_ref().is_some_and(|b| b.has_output()));
        if !all_ready {
            return false;
        }

        let mut out: Option<SampleBuffer> = None;
        let mut overflow = false;
        let mut foreign = Vec::new();
        for i in 0..self.streams.len() {
            let stream = &mut self.streams[i];
            if stream.paused {
                continue;
            }
            let Some(mut buffer) = stream.buffers.as_mut().and_then(|b| b.pop_output()) else {
                continue;
            };
            stream.started = true;

            let fading = stream.fade.is_some();
            let gain = if stream.mute {
                Gain::Uniform(0.0)
            } else {
                mixer::stream_gain(
                    &buffer.pkt,
                    &mut stream.volume,
                    stream.replay_gain,
                    &mut stream.fade,
                    &mut stream.limiter,
                    &mut self.scratch,
                )
            };
            if fading && stream.fade.is_none() {
                let mut flags = stream.flags.lock();
                flags.fading = false;
                flags.volume = stream.volume;
            }

            match out.as_mut() {
                None => {
                    overflow |= mixer::scale(&mut buffer.pkt, gain);
                    out = Some(buffer);
                }
                Some(acc) => {
                    let frames = buffer.pkt.nb_samples;
                    overflow |= mixer::mix_into(&mut acc.pkt, &buffer.pkt, 0, frames, gain);
                    if let Err(buffer) = stream.return_buffer(buffer) {
                        foreign.push(buffer);
                    }
                }
            }
        }
        for buffer in foreign {
            self.route_buffer(buffer);
        }

        if out.is_none() && self.sounds.is_playing() && self.streams.iter().all(|s| s.paused) {
            out = self.silence_pool.as_mut().and_then(|p| p.get_free_buffer()).map(|mut buffer| {
                buffer.pkt.silence_from(0);
                buffer.pkt.nb_samples = buffer.pkt.max_nb_samples();
                buffer
            });
        }
        let Some(mut out) = out else {
            return false;
        };

        if overflow {
            mixer::clamp(&mut out.pkt);
        }
        if let Some(viz) = self.viz.as_mut() {
            viz.push(&out.pkt, Duration::from_secs_f64(self.stats.get_delay()));
            viz.deliver(Instant::now());
        }
        self.sounds
            .mix(&mut out.pkt, self.resampler_factory, self.settings.resample_quality);

        let has_volume = self.sink_info.as_ref().is_some_and(|i| i.has_volume);
        if !has_volume {
            mixer::deamplify(&mut out.pkt, self.volume, self.muted);
        }

        let out = if self.mode == OutputMode::Transcode {
            match self.encode(out) {
                Some(encoded) => encoded,
                None => return true,
            }
        } else {
            out
        };
        self.send_to_sink(out);
        true
    }

    /// Encode a mixed PCM buffer; the PCM buffer goes back to its pool
    fn encode(&mut self, pcm: SampleBuffer) -> Option<SampleBuffer> {
        let result = match (self.encoder.as_mut(), self.encoder_pool.as_mut()) {
            (Some(encoder), Some(pool)) => match pool.get_free_buffer() {
                Some(mut encoded) => match encoder.encode(&pcm.pkt, &mut encoded.pkt) {
                    Ok(frames) => {
                        encoded.pkt.nb_samples = frames;
                        encoded.timestamp = pcm.timestamp;
                        Ok(encoded)
                    }
                    Err(e) => {
                        log::warn!("Engine: encoder failed: {}", e);
                        Err(Some(encoded))
                    }
                },
                None => Err(None),
            },
            _ => Err(None),
        };
        self.route_buffer(pcm);
        match result {
            Ok(encoded) => Some(encoded),
            Err(spare) => {
                if let Some(buffer) = spare {
                    self.route_buffer(buffer);
                }
                None
            }
        }
    }

    fn send_to_sink(&mut self, buffer: SampleBuffer) {
        self.stats.add_samples(buffer.frames());
        if let Err(SendError(SinkData::Sample(buffer))) = self.sink.data.send(SinkData::Sample(buffer)) {
            log::error!("Engine: sink went away, buffer dropped");
            self.route_buffer(buffer);
        }
    }

    /// Give a buffer back to whichever pool it belongs to
    fn route_buffer(&mut self, buffer: SampleBuffer) {
        let id = buffer.pool_id();
        let mut buffer = buffer;
        if let Some(stream) = self.streams.iter_mut().find(|s| s.owns_pool(id)) {
            match stream.return_buffer(buffer) {
                Ok(()) => return,
                Err(b) => buffer = b,
            }
        }
        for pool in [self.silence_pool.as_mut(), self.encoder_pool.as_mut()].into_iter().flatten() {
            match pool.return_buffer(buffer) {
                Ok(()) => return,
                Err(b) => buffer = b,
            }
        }
        if let Err(buffer) = self.discard.return_buffer(buffer) {
            log::debug!("Engine: dropping buffer of unknown pool {:?}", buffer.pool_id());
        }
    }

    fn has_work(&self) -> bool {
        self.sounds.is_playing()
            || self.streams.iter().any(|s| {
                !s.paused && (!s.pending.is_empty() || s.buffers.as_ref().is_some_and(|b| b.has_work()))
            })
    }

    fn publish_stats(&self) {
        for stream in &self.streams {
            let (rr, tempo) = stream.buffers.as_ref().map_or((1.0, 1.0), |b| (b.rr(), b.tempo()));
            self.stats.update_stream(
                stream.id,
                StreamStats {
                    buffered_time: stream.buffered_time(),
                    rr,
                    tempo,
                    sync: stream.sync.info(),
                },
            );
        }
    }

    fn shutdown(&mut self) {
        log::info!("Engine: shutting down");
        for stream in self.streams.drain(..) {
            self.stats.remove_stream(stream.id);
        }
        let (reply, rx) = reply_channel();
        self.sink_send(SinkControl::Shutdown { reply });
        if let Err(e) = wait_reply(&rx, SYNC_TIMEOUT, "sink shutdown") {
            log::error!("Engine: {}", e);
        }
        self.sink.join();
        self.sink_info = None;
        self.deadline = None;
        self.set_state(EngineState::Unconfigured);
        self.running = false;
    }
}

/// Hand the producer empty buffers until its cache target is met
fn top_up(stream: &mut EngineStream, water: f64, max_cache: f64) {
    let format = stream.input_pool.format();
    let buffer_secs = format.frames as f64 / format.sample_rate.max(1) as f64;
    loop {
        let queued = water + stream.buffered_time() + stream.outstanding as f64 * buffer_secs;
        if queued >= max_cache {
            break;
        }
        let Some(buffer) = stream.input_pool.get_free_buffer() else {
            break;
        };
        match stream.events.send(StreamEvent::Buffer(buffer)) {
            Ok(()) => stream.outstanding += 1,
            Err(SendError(event)) => {
                if let StreamEvent::Buffer(buffer) = event {
                    let _ = stream.input_pool.return_buffer(buffer);
                }
                break;
            }
        }
    }
}

fn validate_stream_format(format: &AudioFormat, settings: &AudioSettings) -> AeResult<()> {
    if format.sample_rate == 0 || format.channels() == 0 {
        return Err(AeError::InvalidStream(format!("unusable format {}", format)));
    }
    if let SampleFormat::Raw(codec) = format.sample_format {
        if !settings.passthrough.allows(codec) {
            return Err(AeError::UnsupportedFormat(format!("{} passthrough is disabled", codec.name())));
        }
    }
    Ok(())
}

/// Level normalization stays on unless downmixing with it switched off
fn normalize_for(settings: &AudioSettings, input_channels: usize, output_channels: usize) -> bool {
    !(output_channels < input_channels && !settings.normalize_levels)
}

/// Input buffers: planar float at the stream's rate, one output period long
fn input_buffer_format(format: &AudioFormat, internal: &AudioFormat) -> AudioFormat {
    if format.is_raw() {
        let frames = if format.frames > 0 { format.frames } else { internal.frames };
        return format.clone().with_frames(frames.max(1));
    }
    let frames = aligned_input_frames(format.sample_rate, internal);
    AudioFormat::internal(format.sample_rate, format.layout.clone(), frames)
}

/// Input buffers before any output format is known: 20 ms
fn fallback_buffer_format(format: &AudioFormat) -> AudioFormat {
    let frames = (format.sample_rate as usize / 50).max(1);
    if format.is_raw() {
        return format.clone().with_frames(frames);
    }
    AudioFormat::internal(format.sample_rate, format.layout.clone(), frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelLayout, RawCodec};

    #[test]
    fn test_input_buffers_follow_output_period() {
        let internal = AudioFormat::internal(48000, ChannelLayout::stereo(), 960);
        let producer = AudioFormat::pcm(SampleFormat::S16, 44100, ChannelLayout::mono());
        let format = input_buffer_format(&producer, &internal);
        assert_eq!(format.frames, 882);
        assert!(format.planar);
        assert_eq!(format.sample_format, SampleFormat::F32);
        assert_eq!(format.layout, ChannelLayout::mono());
    }

    #[test]
    fn test_raw_input_buffers_keep_the_bitstream() {
        let internal = AudioFormat::raw(RawCodec::Ac3, 48000).with_frames(1536);
        let producer = AudioFormat::raw(RawCodec::Ac3, 48000);
        let format = input_buffer_format(&producer, &internal);
        assert!(format.is_raw());
        assert_eq!(format.frames, 1536);
        assert_eq!(fallback_buffer_format(&producer).frames, 960);
    }

    #[test]
    fn test_stream_validation() {
        let mut settings = AudioSettings::default();
        let ac3 = AudioFormat::raw(RawCodec::Ac3, 48000);
        assert!(matches!(validate_stream_format(&ac3, &settings), Err(AeError::UnsupportedFormat(_))));
        settings.passthrough.enabled = true;
        assert!(validate_stream_format(&ac3, &settings).is_ok());

        let empty = AudioFormat::pcm(SampleFormat::F32, 0, ChannelLayout::stereo());
        assert!(matches!(validate_stream_format(&empty, &settings), Err(AeError::InvalidStream(_))));
    }

    #[test]
    fn test_normalize_only_dropped_when_downmixing() {
        let mut settings = AudioSettings::default();
        settings.normalize_levels = false;
        assert!(!normalize_for(&settings, 6, 2));
        assert!(normalize_for(&settings, 2, 6));
        settings.normalize_levels = true;
        assert!(normalize_for(&settings, 6, 2));
    }
}
