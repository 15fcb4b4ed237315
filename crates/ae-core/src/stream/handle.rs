//! Producer-side stream handle

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use super::convert::copy_frames;
use super::state::{SharedFlags, StreamEvent, StreamId, StreamInit};
use super::sync::SyncInfo;
use crate::buffer::SampleBuffer;
use crate::engine::command::{reply_channel, wait_reply, ControlMsg, DataMsg, SYNC_TIMEOUT};
use crate::engine::EngineStats;
use crate::types::AudioFormat;

/// How long `add_data` waits for an empty buffer before giving up
const BUFFER_WAIT: Duration = Duration::from_millis(200);

/// Monotonic timestamps needed before a widened error window shrinks again
const PTS_DECAY_RUN: u32 = 100;

/// Extra data attached to a block of frames
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtData {
    /// Presentation time of the first frame, in milliseconds
    pub pts: Option<f64>,
    /// Centre channel level for downmixing
    pub centre_mix_level: Option<f32>,
}

/// Handle through which a producer feeds one stream
///
/// Only the producer thread touches the handle. It never takes an engine
/// lock: empty buffers arrive on the stream's event channel and filled
/// ones go back on the engine's data port. Dropping the handle frees the
/// stream.
pub struct AudioStream {
    id: StreamId,
    format: AudioFormat,
    buffer_format: AudioFormat,
    control: Sender<ControlMsg>,
    data: Sender<DataMsg>,
    events: Receiver<StreamEvent>,
    flags: SharedFlags,
    stats: Arc<EngineStats>,

    free: VecDeque<SampleBuffer>,
    current: Option<SampleBuffer>,
    epoch: u64,
    flushed: bool,
    drain_sent: bool,
    drained_seen: bool,

    last_pts: Option<f64>,
    monotonic_run: u32,
    error_interval_ms: u64,
    base_error_interval_ms: u64,
    max_error_interval_ms: u64,
}

impl AudioStream {
    pub(crate) fn new(
        format: AudioFormat,
        init: StreamInit,
        control: Sender<ControlMsg>,
        data: Sender<DataMsg>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            id: init.id,
            format,
            buffer_format: init.buffer_format,
            control,
            data,
            events: init.events,
            flags: init.flags,
            stats,
            free: VecDeque::new(),
            current: None,
            epoch: 0,
            flushed: false,
            drain_sent: false,
            drained_seen: false,
            last_pts: None,
            monotonic_run: 0,
            error_interval_ms: init.error_interval_ms,
            base_error_interval_ms: init.error_interval_ms,
            max_error_interval_ms: init.max_error_interval_ms,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Format the producer delivers
    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn frame_size(&self) -> usize {
        self.format.frame_size()
    }

    pub fn channels(&self) -> usize {
        self.format.channels()
    }

    pub fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    /// Frames one input buffer holds
    pub fn buffer_frames(&self) -> usize {
        self.buffer_format.frames
    }

    fn handle_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Buffer(mut buffer) => {
                buffer.pkt.clear();
                buffer.timestamp = None;
                self.free.push_back(buffer);
            }
            StreamEvent::Drained => self.drained_seen = true,
        }
    }

    fn poll_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.handle_event(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Make sure a buffer to write into exists, waiting for one if needed
    fn ensure_current(&mut self) -> bool {
        if self.current.is_some() {
            return true;
        }
        self.poll_events();
        let deadline = Instant::now() + BUFFER_WAIT;
        loop {
            if let Some(buffer) = self.free.pop_front() {
                self.current = Some(buffer);
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => {
                    log::warn!("Stream {}: engine went away", self.id);
                    return false;
                }
            }
        }
    }

    fn send_current(&mut self) {
        let Some(buffer) = self.current.take() else {
            return;
        };
        let msg = DataMsg::StreamSample {
            id: self.id,
            epoch: self.epoch,
            buffer,
        };
        if self.data.send(msg).is_err() {
            log::warn!("Stream {}: engine went away, sample dropped", self.id);
        }
    }

    fn send_control(&self, msg: ControlMsg) {
        if self.control.send(msg).is_err() {
            log::warn!("Stream {}: engine went away", self.id);
        }
    }

    /// Widen the error window while timestamps jump backwards
    fn track_pts(&mut self, pts: f64) {
        let mut interval = self.error_interval_ms;
        match self.last_pts {
            Some(last) if pts < last => {
                self.monotonic_run = 0;
                interval = (interval * 2).min(self.max_error_interval_ms);
            }
            Some(_) => {
                self.monotonic_run += 1;
                if self.monotonic_run >= PTS_DECAY_RUN && interval > self.base_error_interval_ms {
                    self.monotonic_run = 0;
                    interval = (interval / 2).max(self.base_error_interval_ms);
                }
            }
            None => {}
        }
        self.last_pts = Some(pts);

        if interval != self.error_interval_ms {
            log::debug!("Stream {}: error interval {} ms", self.id, interval);
            self.error_interval_ms = interval;
            self.send_control(ControlMsg::StreamErrorInterval {
                id: self.id,
                interval_ms: interval,
            });
        }
    }

    /// Copy `frames` frames starting at frame `offset` of `planes`
    ///
    /// `planes` holds one slice per channel for planar formats, a single
    /// slice otherwise. Returns the number of frames consumed, which is
    /// less than `frames` if no empty buffer became available in time; the
    /// caller retries with the rest.
    pub fn add_data(&mut self, planes: &[&[u8]], offset: usize, frames: usize, ext: ExtData) -> usize {
        if frames == 0 {
            return 0;
        }
        if let Some(pts) = ext.pts {
            self.track_pts(pts);
        }

        let mut consumed = 0;
        while consumed < frames {
            if !self.ensure_current() {
                break;
            }
            let Some(buffer) = self.current.as_mut() else {
                break;
            };
            if buffer.pkt.nb_samples == 0 {
                buffer.timestamp = ext.pts.map(|pts| pts + self.format.frames_to_ms(consumed));
                buffer.centre_mix_level = ext.centre_mix_level;
            }
            let n = (frames - consumed).min(buffer.pkt.free_samples());
            copy_frames(&self.format, planes, offset + consumed, n, &mut buffer.pkt);
            consumed += n;
            if buffer.pkt.is_full() {
                self.send_current();
            }
        }

        if consumed > 0 {
            self.flushed = false;
            self.drain_sent = false;
            self.drained_seen = false;
        }
        consumed
    }

    /// Signal end of data
    ///
    /// The partially filled buffer is sent first. With `wait`, blocks until
    /// the engine reports the stream drained or a bounded timeout passes;
    /// returns whether the drained notification arrived. Calling again
    /// before new data is a no-op.
    pub fn drain(&mut self, wait: bool) -> bool {
        if !self.drain_sent {
            match self.current.take() {
                Some(buffer) if buffer.pkt.nb_samples > 0 => {
                    self.current = Some(buffer);
                    self.send_current();
                }
                Some(buffer) => self.free.push_back(buffer),
                None => {}
            }
            let msg = DataMsg::DrainStream {
                id: self.id,
                epoch: self.epoch,
            };
            if self.data.send(msg).is_err() {
                return false;
            }
            self.drain_sent = true;
            self.drained_seen = false;
        }
        if !wait {
            return true;
        }

        self.poll_events();
        let timeout = self.stats.get_cache_total() + self.stats.get_delay() + 2.0;
        let deadline = Instant::now() + Duration::from_secs_f64(timeout);
        while !self.drained_seen {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(event) => self.handle_event(event),
                Err(_) => {
                    log::warn!("Stream {}: drain timed out", self.id);
                    return false;
                }
            }
        }
        true
    }

    pub fn is_draining(&self) -> bool {
        self.flags.lock().draining
    }

    pub fn is_drained(&self) -> bool {
        self.flags.lock().drained
    }

    /// Drop all audio queued for this stream
    ///
    /// Repeated calls before new data arrives do nothing.
    pub fn flush(&mut self) {
        if self.flushed {
            return;
        }
        self.epoch += 1;
        if let Some(mut buffer) = self.current.take() {
            buffer.pkt.clear();
            buffer.timestamp = None;
            self.free.push_back(buffer);
        }

        let (reply, rx) = reply_channel();
        self.send_control(ControlMsg::FlushStream {
            id: self.id,
            epoch: self.epoch,
            reply,
        });
        if let Err(e) = wait_reply(&rx, SYNC_TIMEOUT, "stream flush") {
            log::warn!("Stream {}: {}", self.id, e);
        }
        self.flushed = true;
        self.drain_sent = false;
        self.drained_seen = false;
        self.last_pts = None;
    }

    pub fn pause(&mut self) {
        self.send_control(ControlMsg::PauseStream {
            id: self.id,
            paused: true,
        });
    }

    pub fn resume(&mut self) {
        self.send_control(ControlMsg::PauseStream {
            id: self.id,
            paused: false,
        });
    }

    pub fn is_paused(&self) -> bool {
        self.flags.lock().paused
    }

    /// True until a paused stream has buffered enough to start cleanly
    pub fn is_buffering(&self) -> bool {
        self.flags.lock().buffering
    }

    /// Time until a frame added now becomes audible, in seconds
    pub fn get_delay(&self) -> f64 {
        self.stats.get_delay_for(self.id)
    }

    /// Audio buffered for this stream, in seconds
    pub fn get_cache_time(&self) -> f64 {
        self.stats.get_cache_time(self.id)
    }

    /// Maximum audio that can be buffered, in seconds
    pub fn get_cache_total(&self) -> f64 {
        self.stats.get_cache_total()
    }

    pub fn get_sync_info(&self) -> Option<SyncInfo> {
        self.stats.sync_info(self.id)
    }

    pub fn volume(&self) -> f32 {
        self.flags.lock().volume
    }

    pub fn set_volume(&mut self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.flags.lock().volume = volume;
        self.send_control(ControlMsg::StreamVolume { id: self.id, volume });
    }

    pub fn replay_gain(&self) -> f32 {
        self.flags.lock().replay_gain
    }

    pub fn set_replay_gain(&mut self, gain: f32) {
        let gain = gain.max(0.0);
        self.flags.lock().replay_gain = gain;
        self.send_control(ControlMsg::StreamReplayGain { id: self.id, gain });
    }

    pub fn amplification(&self) -> f32 {
        self.flags.lock().amplification
    }

    /// Boost the stream; a peak limiter keeps it from clipping
    pub fn set_amplification(&mut self, amplify: f32) {
        let amplify = amplify.max(0.0);
        self.flags.lock().amplification = amplify;
        self.send_control(ControlMsg::StreamAmplification { id: self.id, amplify });
    }

    /// Ramp the volume from `from` to `to` over `ms` milliseconds
    pub fn fade_volume(&mut self, from: f32, to: f32, ms: u32) {
        self.flags.lock().fading = ms > 0;
        self.send_control(ControlMsg::StreamFade {
            id: self.id,
            from: from.clamp(0.0, 1.0),
            to: to.clamp(0.0, 1.0),
            ms,
        });
    }

    pub fn is_fading(&self) -> bool {
        self.flags.lock().fading
    }

    pub fn resample_ratio(&self) -> f64 {
        self.flags.lock().resample_ratio
    }

    /// Manual playback rate correction
    pub fn set_resample_ratio(&mut self, ratio: f64) {
        self.send_control(ControlMsg::StreamResampleRatio { id: self.id, ratio });
    }

    pub fn resample_mode(&self) -> bool {
        self.flags.lock().resample_mode
    }

    pub fn set_resample_mode(&mut self, enabled: bool) {
        self.flags.lock().resample_mode = enabled;
        self.send_control(ControlMsg::StreamResampleMode { id: self.id, enabled });
    }

    pub fn set_force_resampler(&mut self, force: bool) {
        self.send_control(ControlMsg::StreamForceResampler { id: self.id, force });
    }

    /// Stream to unpause once this one has drained
    pub fn register_slave(&mut self, slave: Option<&AudioStream>) {
        self.send_control(ControlMsg::StreamSlave {
            id: self.id,
            slave: slave.map(|s| s.id),
        });
    }

    /// Turn clock synchronisation on or off
    pub fn set_sync(&mut self, enabled: bool) {
        self.send_control(ControlMsg::StreamSync { id: self.id, enabled });
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.poll_events();
        let mut buffers: Vec<SampleBuffer> = self.free.drain(..).collect();
        buffers.extend(self.current.take());
        let _ = self.control.send(ControlMsg::FreeStream { id: self.id, buffers });
    }
}
