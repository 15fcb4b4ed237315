//! Audio streams
//!
//! A producer owns an [`AudioStream`] handle and pushes frames into it. The
//! engine keeps the matching state and runs each stream's
//! [`StreamBuffers`] chain once per tick.

mod buffers;
mod convert;
mod handle;
mod state;
mod sync;

pub use buffers::StreamBuffers;
pub use handle::{AudioStream, ExtData};
pub use state::{SharedFlags, StreamEvent, StreamFlags, StreamId, StreamInit, StreamOptions};
pub use sync::{calc_resample_ratio, SyncAction, SyncController, SyncError, SyncInfo, SyncState, SyncTuning};

pub(crate) use convert::copy_frames;
pub(crate) use state::EngineStream;
