//! Messages between the engine and the sink actor

use std::time::Duration;

use crate::buffer::SampleBuffer;
use crate::engine::command::Reply;
use crate::error::{AeError, AeResult};
use crate::types::AudioFormat;

use super::DeviceInfo;

/// What the engine asks the sink to open
#[derive(Debug, Clone)]
pub struct SinkRequest {
    pub format: AudioFormat,
    /// Device as `driver:device`
    pub device: String,
    /// Reopen even if the device already runs with this format
    pub force: bool,
    /// Keep feeding silence this long after playback stops while focused
    pub silence_timeout: Duration,
    /// Use faint noise instead of digital silence
    pub stream_noise: bool,
}

/// Result of a successful configure
#[derive(Debug, Clone, PartialEq)]
pub struct SinkInfo {
    /// Format the device actually runs with
    pub format: AudioFormat,
    /// Audio the device buffers when full, in seconds
    pub cache_total: f64,
    pub latency: f64,
    pub has_volume: bool,
}

/// Priority messages to the sink
pub enum SinkControl {
    Configure {
        request: Box<SinkRequest>,
        reply: Reply<AeResult<SinkInfo>>,
    },
    /// Close the device; queued samples are returned
    Unconfigure { reply: Reply<()> },
    /// Play out everything the device holds
    Drain { reply: Reply<()> },
    /// Drop everything the device holds
    Flush { reply: Reply<()> },
    Volume(f32),
    /// Whether some stream is active; keeps the silence timer running forever
    Streaming(bool),
    AppFocused(bool),
    /// Re-read the device list
    Enumerate {
        force: bool,
        reply: Reply<Vec<DeviceInfo>>,
    },
    Shutdown { reply: Reply<()> },
}

/// Sample traffic to the sink
pub enum SinkData {
    Sample(SampleBuffer),
}

/// Sink to engine notifications
#[derive(Debug)]
pub enum SinkEvent {
    /// A buffer was written (or dropped) and goes back to its pool
    ReturnSample {
        buffer: SampleBuffer,
        /// How long the engine may wait before the device needs more
        delay_hint: Duration,
    },
    /// The device failed and was closed
    Error(AeError),
}
