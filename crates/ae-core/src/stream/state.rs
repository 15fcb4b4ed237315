//! Stream state shared between the engine and the producer handle

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam::channel::{Receiver, Sender};

use super::{StreamBuffers, SyncController, SyncTuning};
use crate::buffer::{BufferPool, PoolId, SampleBuffer};
use crate::clock::AvClock;
use crate::engine::{Fade, Limiter};
use crate::types::AudioFormat;

/// Engine-assigned stream identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub(crate) u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Options given when a stream is created
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamOptions {
    /// Start paused; the producer resumes once it has buffered enough
    pub paused: bool,
    /// Always run the resampler, even when formats match
    pub force_resample: bool,
    /// The producer prefers ratio correction over dropping and inserting
    pub resample_mode: bool,
}

/// Engine to producer notifications
#[derive(Debug)]
pub enum StreamEvent {
    /// An empty input buffer to fill
    Buffer(SampleBuffer),
    /// Every frame queued before the last drain request has been played out
    Drained,
}

/// Flags the producer polls without talking to the engine
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFlags {
    pub paused: bool,
    pub buffering: bool,
    pub draining: bool,
    pub drained: bool,
    pub fading: bool,
    pub volume: f32,
    pub replay_gain: f32,
    pub amplification: f32,
    pub resample_ratio: f64,
    pub resample_mode: bool,
}

impl Default for StreamFlags {
    fn default() -> Self {
        Self {
            paused: false,
            buffering: true,
            draining: false,
            drained: false,
            fading: false,
            volume: 1.0,
            replay_gain: 1.0,
            amplification: 1.0,
            resample_ratio: 1.0,
            resample_mode: false,
        }
    }
}

/// Shared flags behind the per-stream lock
#[derive(Debug, Clone, Default)]
pub struct SharedFlags(Arc<Mutex<StreamFlags>>);

impl SharedFlags {
    pub fn lock(&self) -> MutexGuard<'_, StreamFlags> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self) -> StreamFlags {
        self.lock().clone()
    }
}

/// What the producer side needs to build its handle
pub struct StreamInit {
    pub id: StreamId,
    /// Format of the input buffers the producer fills
    pub buffer_format: AudioFormat,
    pub events: Receiver<StreamEvent>,
    pub flags: SharedFlags,
    pub error_interval_ms: u64,
    pub max_error_interval_ms: u64,
}

/// Engine-side record of one stream
pub(crate) struct EngineStream {
    pub id: StreamId,
    /// Format the input buffers hold
    pub format: AudioFormat,
    pub input_pool: BufferPool,
    pub buffers: Option<StreamBuffers>,
    /// Filled input buffers waiting for the pipeline
    pub pending: VecDeque<SampleBuffer>,
    /// Input buffers currently held by the producer
    pub outstanding: usize,
    pub epoch: u64,
    pub events: Sender<StreamEvent>,
    /// Engine copy of the event receiver, drained when the handle is gone
    pub reclaim: Option<Receiver<StreamEvent>>,
    pub flags: SharedFlags,

    pub volume: f32,
    pub replay_gain: f32,
    pub limiter: Limiter,
    pub fade: Option<Fade>,

    pub paused: bool,
    pub started: bool,
    pub buffering: bool,
    pub draining: bool,
    pub drained: bool,
    pub resample_mode: bool,
    pub force_resampler: bool,
    /// Manual ratio set by the producer
    pub resample_ratio: f64,

    pub sync: SyncController,
    pub clock: Option<Arc<dyn AvClock>>,
    /// Output of this tick is replaced by silence
    pub mute: bool,
    pub slave: Option<StreamId>,
}

impl EngineStream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: StreamId,
        format: AudioFormat,
        input_pool: BufferPool,
        options: StreamOptions,
        clock: Option<Arc<dyn AvClock>>,
        events: Sender<StreamEvent>,
        flags: SharedFlags,
        tuning: SyncTuning,
        sample_rate: u32,
    ) -> Self {
        {
            let mut f = flags.lock();
            f.paused = options.paused;
            f.resample_mode = options.resample_mode;
        }
        let mut sync = SyncController::new(tuning);
        if clock.is_some() {
            sync.start();
        }
        Self {
            id,
            format,
            input_pool,
            buffers: None,
            pending: VecDeque::new(),
            outstanding: 0,
            epoch: 0,
            events,
            reclaim: None,
            flags,
            volume: 1.0,
            replay_gain: 1.0,
            limiter: Limiter::new(sample_rate),
            fade: None,
            paused: options.paused,
            started: false,
            buffering: true,
            draining: false,
            drained: false,
            resample_mode: options.resample_mode,
            force_resampler: options.force_resample,
            resample_ratio: 1.0,
            sync,
            clock,
            mute: false,
            slave: None,
        }
    }

    pub fn is_raw(&self) -> bool {
        self.format.is_raw()
    }

    pub fn owns_pool(&self, id: PoolId) -> bool {
        self.input_pool.id() == id || self.buffers.as_ref().is_some_and(|b| b.owns_pool(id))
    }

    /// Take back a buffer from any pool of this stream
    pub fn return_buffer(&mut self, buffer: SampleBuffer) -> Result<(), SampleBuffer> {
        let buffer = match self.input_pool.return_buffer(buffer) {
            Ok(()) => return Ok(()),
            Err(buffer) => buffer,
        };
        match self.buffers.as_mut() {
            Some(buffers) => buffers.return_buffer(buffer),
            None => Err(buffer),
        }
    }

    /// Move producer samples into the pipeline and advance it
    pub fn process(&mut self) -> bool {
        let Some(buffers) = self.buffers.as_mut() else {
            return false;
        };
        let mut busy = false;
        while let Some(buffer) = self.pending.pop_front() {
            buffers.push_input(buffer);
            busy = true;
        }
        busy |= buffers.process_buffers();
        for spent in buffers.take_spent() {
            if let Err(foreign) = self.input_pool.return_buffer(spent) {
                log::debug!("Stream {}: dropping buffer of retired pool", self.id);
                drop(foreign);
            }
        }
        busy
    }

    /// Drop everything queued, e.g. after a flush
    pub fn flush(&mut self) {
        while let Some(buffer) = self.pending.pop_front() {
            let _ = self.input_pool.return_buffer(buffer);
        }
        if let Some(buffers) = self.buffers.as_mut() {
            buffers.flush();
            for spent in buffers.take_spent() {
                let _ = self.input_pool.return_buffer(spent);
            }
        }
        self.draining = false;
        self.drained = false;
        self.started = false;
        self.mute = false;
        if self.clock.is_some() {
            self.sync.start();
        }
        let mut f = self.flags.lock();
        f.draining = false;
        f.drained = false;
    }

    /// Audio queued inside the engine for this stream, in seconds
    pub fn buffered_time(&self) -> f64 {
        let pending: f64 = self.pending.iter().map(|b| b.duration_ms()).sum();
        pending / 1000.0 + self.buffers.as_ref().map_or(0.0, |b| b.delay())
    }

    /// Current volume as seen by the mixer
    pub fn effective_volume(&self) -> f32 {
        self.volume * self.replay_gain
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
        self.flags.lock().paused = paused;
        if !paused && self.clock.is_some() {
            self.sync.start();
        }
    }

    pub fn set_buffering(&mut self, buffering: bool) {
        if self.buffering != buffering {
            self.buffering = buffering;
            self.flags.lock().buffering = buffering;
        }
    }

    pub fn set_draining(&mut self, draining: bool) {
        self.draining = draining;
        self.drained = false;
        if let Some(buffers) = self.buffers.as_mut() {
            buffers.set_drain(draining);
        }
        let mut f = self.flags.lock();
        f.draining = draining;
        f.drained = false;
    }

    pub fn set_drained(&mut self) {
        self.drained = true;
        let mut f = self.flags.lock();
        f.drained = true;
        f.draining = false;
    }

    /// Rates the pipeline should use for drift correction
    pub fn apply_rr(&mut self, rr: f64, atempo_threshold: f64) {
        if let Some(buffers) = self.buffers.as_mut() {
            buffers.set_rr(rr, atempo_threshold);
        }
        self.flags.lock().resample_ratio = rr;
    }

    /// Hand the whole stream over for disposal
    pub fn into_pools(self) -> Vec<BufferPool> {
        let mut pools = vec![self.input_pool];
        if let Some(buffers) = self.buffers {
            let (stage_pools, foreign) = buffers.into_pools();
            pools.extend(stage_pools);
            let input = &mut pools[0];
            for buffer in foreign.into_iter().chain(self.pending) {
                let _ = input.return_buffer(buffer);
            }
        } else {
            let input = &mut pools[0];
            for buffer in self.pending {
                let _ = input.return_buffer(buffer);
            }
        }
        pools
    }
}
