//! Engine-wide timing snapshot
//!
//! The only engine state readable from any thread. Writers are the engine
//! and sink actors; readers are stream handles and the application. Every
//! access is one short lock with copy-out.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use crate::stream::{StreamId, SyncInfo};

/// Per-stream part of the snapshot
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StreamStats {
    /// Audio queued inside the engine for the stream, in seconds
    pub buffered_time: f64,
    pub rr: f64,
    pub tempo: f64,
    pub sync: SyncInfo,
}

#[derive(Debug, Default)]
struct StatsInner {
    /// Device delay as of `sink_update`, in seconds
    sink_delay: f64,
    sink_update: Option<Instant>,
    /// Frames handed to the sink and not yet written to the device
    buffered_frames: usize,
    sink_rate: u32,
    sink_cache_total: f64,
    sink_latency: f64,
    max_cache_level: f64,
    has_volume: bool,
    suspended: bool,
    streams: HashMap<StreamId, StreamStats>,
}

impl StatsInner {
    fn sink_delay_now(&self) -> f64 {
        let elapsed = self.sink_update.map_or(0.0, |t| t.elapsed().as_secs_f64());
        (self.sink_delay - elapsed).max(0.0)
    }

    fn water_level(&self) -> f64 {
        if self.sink_rate == 0 {
            return 0.0;
        }
        self.buffered_frames as f64 / self.sink_rate as f64
    }
}

/// Shared delay and buffer accounting
#[derive(Debug, Default)]
pub struct EngineStats {
    inner: Mutex<StatsInner>,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StatsInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start over after the sink was (re)opened
    pub(crate) fn reset(&self, sink_rate: u32, cache_total: f64, latency: f64, max_cache_level: f64) {
        let mut inner = self.lock();
        inner.sink_delay = 0.0;
        inner.sink_update = None;
        inner.buffered_frames = 0;
        inner.sink_rate = sink_rate;
        inner.sink_cache_total = cache_total;
        inner.sink_latency = latency;
        inner.max_cache_level = max_cache_level;
    }

    pub(crate) fn set_has_volume(&self, has_volume: bool) {
        self.lock().has_volume = has_volume;
    }

    /// Frames were queued towards the sink
    pub(crate) fn add_samples(&self, frames: usize) {
        self.lock().buffered_frames += frames;
    }

    /// The sink wrote `frames` frames and measured `delay` seconds
    pub(crate) fn update_sink_delay(&self, delay: f64, frames: usize) {
        let mut inner = self.lock();
        inner.sink_delay = delay;
        inner.sink_update = Some(Instant::now());
        inner.buffered_frames = inner.buffered_frames.saturating_sub(frames);
    }

    pub(crate) fn update_stream(&self, id: StreamId, stats: StreamStats) {
        self.lock().streams.insert(id, stats);
    }

    pub(crate) fn remove_stream(&self, id: StreamId) {
        self.lock().streams.remove(&id);
    }

    pub(crate) fn set_suspended(&self, suspended: bool) {
        self.lock().suspended = suspended;
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    pub fn has_volume(&self) -> bool {
        self.lock().has_volume
    }

    /// Time until audio mixed now becomes audible, in seconds
    pub fn get_delay(&self) -> f64 {
        let inner = self.lock();
        inner.sink_delay_now() + inner.water_level()
    }

    /// Time until a frame added to `id` now becomes audible, in seconds
    pub fn get_delay_for(&self, id: StreamId) -> f64 {
        let inner = self.lock();
        let stream = inner.streams.get(&id).map_or(0.0, |s| s.buffered_time);
        inner.sink_delay_now() + inner.water_level() + stream
    }

    /// Audio buffered for `id` that has not reached the device, in seconds
    pub fn get_cache_time(&self, id: StreamId) -> f64 {
        let inner = self.lock();
        let stream = inner.streams.get(&id).map_or(0.0, |s| s.buffered_time);
        inner.water_level() + stream
    }

    /// Most audio the engine and sink buffer together, in seconds
    pub fn get_cache_total(&self) -> f64 {
        let inner = self.lock();
        inner.max_cache_level + inner.sink_cache_total
    }

    /// Audio queued towards the sink, in seconds
    pub fn get_water_level(&self) -> f64 {
        self.lock().water_level()
    }

    pub fn latency(&self) -> f64 {
        self.lock().sink_latency
    }

    pub fn stream_stats(&self, id: StreamId) -> Option<StreamStats> {
        self.lock().streams.get(&id).copied()
    }

    pub fn sync_info(&self, id: StreamId) -> Option<SyncInfo> {
        self.lock().streams.get(&id).map(|s| s.sync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_water_level_follows_queue() {
        let stats = EngineStats::new();
        stats.reset(48000, 0.2, 0.01, 0.5);
        stats.add_samples(4800);
        assert!((stats.get_water_level() - 0.1).abs() < 1e-9);
        stats.update_sink_delay(0.0, 2400);
        assert!((stats.get_water_level() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_delay_includes_sink_and_stream() {
        let stats = EngineStats::new();
        stats.reset(48000, 0.2, 0.0, 0.5);
        stats.update_sink_delay(10.0, 0);
        let id = StreamId(1);
        stats.update_stream(
            id,
            StreamStats {
                buffered_time: 0.25,
                ..Default::default()
            },
        );
        let delay = stats.get_delay();
        assert!(delay > 9.9 && delay <= 10.0);
        let stream_delay = stats.get_delay_for(id);
        assert!((stream_delay - delay - 0.25).abs() < 0.01);
        assert!((stats.get_cache_time(id) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_delay_never_negative() {
        let stats = EngineStats::new();
        stats.reset(48000, 0.2, 0.0, 0.5);
        stats.update_sink_delay(0.0, 0);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(stats.get_delay(), 0.0);
    }

    #[test]
    fn test_cache_total() {
        let stats = EngineStats::new();
        stats.reset(44100, 0.3, 0.0, 0.5);
        assert!((stats.get_cache_total() - 0.8).abs() < 1e-9);
    }
}
