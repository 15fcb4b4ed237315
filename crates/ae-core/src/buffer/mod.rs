//! Sample storage and recycling
//!
//! - [`SamplePacket`]: raw sample storage for one buffer
//! - [`SampleBuffer`]: a packet plus timing metadata and the handle of the pool slot it came from
//! - [`BufferPool`]: fixed-capacity arena of reusable buffers
//! - [`StageQueues`]: input/output queues shared by the pipeline stages

mod packet;
mod pool;
mod stage;

pub use packet::SamplePacket;
pub use pool::{BufferHandle, BufferPool, PoolId, SampleBuffer, MIN_POOL_BUFFERS};
pub use stage::StageInput;
pub(crate) use stage::StageQueues;
