//! Deferred disposal of retired buffer pools
//!
//! A pool whose format went stale cannot be dropped while any of its
//! buffers is still travelling through the pipeline, sitting with a
//! producer or queued in the sink. Such pools are parked here. Buffers that
//! come back are routed to their pool, and every engine tick sweeps out the
//! pools that have all their buffers home again.
//!
//! ## Invariant
//!
//! A pool leaves the list only when `is_idle()` holds, so no buffer is ever
//! freed while another party still owns it.

use crate::buffer::{BufferPool, PoolId, SampleBuffer};

/// Retired pools waiting for their buffers
#[derive(Debug, Default)]
pub struct DiscardList {
    pools: Vec<BufferPool>,
}

impl DiscardList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a pool until every buffer has come back
    pub fn retire(&mut self, pool: BufferPool) {
        log::debug!("Engine: retiring pool {:?} ({})", pool.id(), pool.format());
        self.pools.push(pool);
    }

    pub fn retire_all(&mut self, pools: impl IntoIterator<Item = BufferPool>) {
        for pool in pools {
            self.retire(pool);
        }
    }

    pub fn owns_pool(&self, id: PoolId) -> bool {
        self.pools.iter().any(|p| p.id() == id)
    }

    /// Hand a buffer of a retired pool back; other buffers come back as `Err`
    pub fn return_buffer(&mut self, buffer: SampleBuffer) -> Result<(), SampleBuffer> {
        let id = buffer.pool_id();
        match self.pools.iter_mut().find(|p| p.id() == id) {
            Some(pool) => pool.return_buffer(buffer),
            None => Err(buffer),
        }
    }

    /// Drop every pool whose buffers have all been returned
    ///
    /// Returns the number of pools deleted.
    pub fn sweep(&mut self) -> usize {
        let before = self.pools.len();
        self.pools.retain(|pool| {
            if pool.is_idle() {
                log::debug!("Engine: buffer pool {:?} deleted", pool.id());
                false
            } else {
                true
            }
        });
        before - self.pools.len()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AudioFormat, ChannelLayout};

    fn pool() -> BufferPool {
        let mut pool = BufferPool::new(AudioFormat::internal(48000, ChannelLayout::stereo(), 256));
        pool.create(0);
        pool
    }

    #[test]
    fn test_idle_pool_deleted_on_sweep() {
        let mut list = DiscardList::new();
        list.retire(pool());
        assert_eq!(list.sweep(), 1);
        assert!(list.is_empty());
    }

    #[test]
    fn test_pool_kept_until_buffers_return() {
        let mut list = DiscardList::new();
        let mut busy = pool();
        let out = busy.get_free_buffer().unwrap();
        let idle = pool();
        let idle_id = idle.id();

        list.retire(busy);
        list.retire(idle);
        assert_eq!(list.sweep(), 1);
        assert_eq!(list.len(), 1);
        assert!(!list.owns_pool(idle_id));

        list.return_buffer(out).unwrap();
        assert_eq!(list.sweep(), 1);
        assert!(list.is_empty());
    }

    #[test]
    fn test_foreign_buffer_is_handed_back() {
        let mut list = DiscardList::new();
        list.retire(pool());
        let mut live = pool();
        let buffer = live.get_free_buffer().unwrap();
        let buffer = list.return_buffer(buffer).unwrap_err();
        live.return_buffer(buffer).unwrap();
        assert_eq!(list.sweep(), 1);
    }
}
