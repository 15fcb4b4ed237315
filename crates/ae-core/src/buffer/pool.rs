//! Fixed-capacity buffer arena
//!
//! A pool allocates all its buffers once in [`BufferPool::create`]. Buffers
//! travel through the pipeline by value; the pool only remembers, per slot,
//! whether the buffer is checked out and which generation it was handed out
//! as. Returning a buffer marks its slot free again.
//!
//! Pools are never resized. When a format changes the owner retires the
//! whole pool (see [`crate::engine::gc`]) and builds a new one.

use std::sync::atomic::{AtomicU64, Ordering};

use super::SamplePacket;
use crate::types::AudioFormat;

/// A pool never holds fewer buffers than this
pub const MIN_POOL_BUFFERS: usize = 5;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique pool identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(u64);

impl PoolId {
    fn next() -> Self {
        PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identifies the pool slot a buffer belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandle {
    pub pool: PoolId,
    pub slot: u32,
    pub generation: u32,
}

/// One pooled buffer
///
/// Owned by exactly one party at a time: the pool's free list, a stage
/// queue, a producer, or the sink. Ownership moves with the value.
#[derive(Debug)]
pub struct SampleBuffer {
    pub pkt: SamplePacket,
    /// Presentation time of the first frame in milliseconds
    pub timestamp: Option<f64>,
    /// Centre channel level requested by the producer for downmixing
    pub centre_mix_level: Option<f32>,
    handle: BufferHandle,
}

impl SampleBuffer {
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn pool_id(&self) -> PoolId {
        self.handle.pool
    }

    pub fn frames(&self) -> usize {
        self.pkt.nb_samples
    }

    /// Duration of the stored frames in milliseconds
    pub fn duration_ms(&self) -> f64 {
        self.pkt.duration_ms()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    generation: u32,
    ref_count: u32,
}

/// Arena of reusable sample buffers sharing one format
#[derive(Debug)]
pub struct BufferPool {
    id: PoolId,
    format: AudioFormat,
    slots: Vec<Slot>,
    free: Vec<SampleBuffer>,
}

impl BufferPool {
    /// Empty pool for `format`; `format.frames` is the size of each buffer
    pub fn new(format: AudioFormat) -> Self {
        Self {
            id: PoolId::next(),
            format,
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Allocate enough buffers to hold `total_time_ms` of audio
    pub fn create(&mut self, total_time_ms: u32) {
        let frames = self.format.frames.max(1);
        let total_frames = total_time_ms as usize * self.format.sample_rate as usize / 1000;
        let count = total_frames.div_ceil(frames).max(MIN_POOL_BUFFERS);

        self.slots.reserve(count);
        self.free.reserve(count);
        for _ in 0..count {
            let slot = self.slots.len() as u32;
            self.slots.push(Slot::default());
            self.free.push(SampleBuffer {
                pkt: SamplePacket::new(&self.format, frames),
                timestamp: None,
                centre_mix_level: None,
                handle: BufferHandle {
                    pool: self.id,
                    slot,
                    generation: 0,
                },
            });
        }

        log::debug!(
            "BufferPool {:?}: {} buffers of {} frames ({})",
            self.id,
            count,
            frames,
            self.format
        );
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Number of buffers this pool created
    pub fn all_samples(&self) -> usize {
        self.slots.len()
    }

    /// Number of buffers currently on the free list
    pub fn free_samples(&self) -> usize {
        self.free.len()
    }

    /// Every buffer has come home
    pub fn is_idle(&self) -> bool {
        self.free.len() == self.slots.len()
    }

    pub fn has_free(&self) -> bool {
        !self.free.is_empty()
    }

    pub fn owns(&self, buffer: &SampleBuffer) -> bool {
        buffer.handle.pool == self.id
    }

    /// Take a buffer off the free list
    ///
    /// `None` means the pool is exhausted; callers treat that as backpressure.
    pub fn get_free_buffer(&mut self) -> Option<SampleBuffer> {
        let mut buffer = self.free.pop()?;
        let slot = &mut self.slots[buffer.handle.slot as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.ref_count = 1;

        buffer.handle.generation = slot.generation;
        buffer.pkt.clear();
        buffer.timestamp = None;
        buffer.centre_mix_level = None;
        Some(buffer)
    }

    /// Hand a buffer back to its slot
    ///
    /// Buffers from another pool, or whose handle does not match the slot's
    /// current checkout, are given back as `Err`.
    pub fn return_buffer(&mut self, mut buffer: SampleBuffer) -> Result<(), SampleBuffer> {
        if buffer.handle.pool != self.id {
            return Err(buffer);
        }
        let Some(slot) = self.slots.get_mut(buffer.handle.slot as usize) else {
            return Err(buffer);
        };
        if slot.ref_count == 0 || slot.generation != buffer.handle.generation {
            log::warn!(
                "BufferPool {:?}: stale return of slot {}",
                self.id,
                buffer.handle.slot
            );
            return Err(buffer);
        }

        slot.ref_count = 0;
        buffer.pkt.clear();
        self.free.push(buffer);
        Ok(())
    }

    /// Free-list consistency: every free buffer belongs here and is unreferenced
    pub fn check_free_list(&self) -> bool {
        self.free.iter().all(|b| {
            b.handle.pool == self.id
                && self
                    .slots
                    .get(b.handle.slot as usize)
                    .is_some_and(|s| s.ref_count == 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelLayout;

    fn make_pool(frames: usize) -> BufferPool {
        BufferPool::new(AudioFormat::internal(48000, ChannelLayout::stereo(), frames))
    }

    #[test]
    fn test_create_covers_requested_time() {
        let mut pool = make_pool(480); // 10ms buffers
        pool.create(500);
        assert_eq!(pool.all_samples(), 50);
        assert!(pool.is_idle());
    }

    #[test]
    fn test_create_minimum_buffers() {
        let mut pool = make_pool(4800);
        pool.create(10);
        assert_eq!(pool.all_samples(), MIN_POOL_BUFFERS);
    }

    #[test]
    fn test_get_then_return_keeps_free_count() {
        let mut pool = make_pool(256);
        pool.create(100);
        let before = pool.free_samples();

        let mut buffer = pool.get_free_buffer().unwrap();
        buffer.pkt.nb_samples = 100;
        assert_eq!(pool.free_samples(), before - 1);
        assert!(pool.check_free_list());

        pool.return_buffer(buffer).unwrap();
        assert_eq!(pool.free_samples(), before);
        assert!(pool.check_free_list());
        assert!(pool.is_idle());
    }

    #[test]
    fn test_return_resets_sample_count() {
        let mut pool = make_pool(256);
        pool.create(0);
        let mut buffer = pool.get_free_buffer().unwrap();
        buffer.pkt.nb_samples = 10;
        pool.return_buffer(buffer).unwrap();

        // LIFO free list hands the same buffer back out
        let buffer = pool.get_free_buffer().unwrap();
        assert_eq!(buffer.pkt.nb_samples, 0);
    }

    #[test]
    fn test_exhaustion_is_none() {
        let mut pool = make_pool(256);
        pool.create(0);
        let taken: Vec<_> = (0..MIN_POOL_BUFFERS)
            .map(|_| pool.get_free_buffer().unwrap())
            .collect();
        assert!(pool.get_free_buffer().is_none());
        assert!(!pool.is_idle());

        for buffer in taken {
            pool.return_buffer(buffer).unwrap();
        }
        assert!(pool.is_idle());
    }

    #[test]
    fn test_foreign_buffer_rejected() {
        let mut a = make_pool(256);
        let mut b = make_pool(256);
        a.create(0);
        b.create(0);

        let buffer = a.get_free_buffer().unwrap();
        let buffer = b.return_buffer(buffer).unwrap_err();
        assert!(a.owns(&buffer));
        a.return_buffer(buffer).unwrap();
        assert!(a.is_idle() && b.is_idle());
    }

    #[test]
    fn test_generation_advances_per_checkout() {
        let mut pool = make_pool(256);
        pool.create(0);
        let first = pool.get_free_buffer().unwrap();
        let slot = first.handle().slot;
        let generation = first.handle().generation;
        pool.return_buffer(first).unwrap();

        let second = pool.get_free_buffer().unwrap();
        assert_eq!(second.handle().slot, slot);
        assert_ne!(second.handle().generation, generation);
    }
}
