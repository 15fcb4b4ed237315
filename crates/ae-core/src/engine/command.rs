//! Messages accepted by the engine actor
//!
//! Control messages travel on the priority port and are always handled.
//! Data messages travel on a second port the engine stops reading while it
//! reconfigures, so samples queue up instead of being processed against a
//! stale format.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};

use crate::buffer::SampleBuffer;
use crate::clock::AvClock;
use crate::config::{AudioSettings, SoundMode};
use crate::error::{AeError, AeResult};
use crate::sink::DeviceInfo;
use crate::stream::{StreamId, StreamInit, StreamOptions};
use crate::types::AudioFormat;
use crate::viz::AudioCallback;

/// Wait applied to synchronous requests
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// One-shot reply slot of a synchronous request
pub type Reply<T> = Sender<T>;

/// Make a reply channel for a synchronous request
pub fn reply_channel<T>() -> (Reply<T>, Receiver<T>) {
    bounded(1)
}

/// Wait for the reply of a synchronous request
pub fn wait_reply<T>(rx: &Receiver<T>, timeout: Duration, what: &'static str) -> AeResult<T> {
    use crossbeam::channel::RecvTimeoutError;
    rx.recv_timeout(timeout).map_err(|e| match e {
        RecvTimeoutError::Timeout => AeError::Timeout(what),
        RecvTimeoutError::Disconnected => AeError::Disconnected(what),
    })
}

/// Everything needed to open a stream
pub struct StreamRequest {
    /// Format the producer delivers
    pub format: AudioFormat,
    pub options: StreamOptions,
    pub clock: Option<Arc<dyn AvClock>>,
}

/// Pre-decoded sound to register
pub struct SoundRequest {
    pub format: AudioFormat,
    /// Interleaved or planar sample bytes in `format`
    pub planes: Vec<Vec<u8>>,
    pub frames: usize,
}

/// Priority messages
pub enum ControlMsg {
    /// Leave the waiting state and configure the output
    Init,
    Reconfigure,
    ApplySettings(Box<AudioSettings>),
    Suspend { reply: Reply<()> },
    Resume { reply: Reply<()> },
    /// The user picked another device or the current one changed
    DeviceChange,
    /// Devices were plugged or unplugged
    DeviceCountChange,
    EnumerateDevices { reply: Reply<Vec<DeviceInfo>> },
    SetVolume(f32),
    SetMute(bool),
    SetSoundMode(SoundMode),
    AppFocused(bool),

    NewStream {
        request: Box<StreamRequest>,
        reply: Reply<AeResult<StreamInit>>,
    },
    /// Stream handle dropped; the buffers it still held come back with it
    FreeStream { id: StreamId, buffers: Vec<SampleBuffer> },
    FlushStream { id: StreamId, epoch: u64, reply: Reply<()> },
    PauseStream { id: StreamId, paused: bool },
    StreamVolume { id: StreamId, volume: f32 },
    StreamReplayGain { id: StreamId, gain: f32 },
    StreamAmplification { id: StreamId, amplify: f32 },
    StreamFade { id: StreamId, from: f32, to: f32, ms: u32 },
    StreamResampleRatio { id: StreamId, ratio: f64 },
    StreamResampleMode { id: StreamId, enabled: bool },
    StreamForceResampler { id: StreamId, force: bool },
    StreamSlave { id: StreamId, slave: Option<StreamId> },
    StreamErrorInterval { id: StreamId, interval_ms: u64 },
    StreamSync { id: StreamId, enabled: bool },

    MakeSound {
        request: Box<SoundRequest>,
        reply: Reply<AeResult<u32>>,
    },
    PlaySound(u32),
    StopSound(u32),
    FreeSound(u32),

    RegisterCallback(Box<dyn AudioCallback>),
    UnregisterCallback,

    Shutdown { reply: Reply<()> },
}

/// Sample traffic from producers
pub enum DataMsg {
    /// A filled input buffer
    StreamSample {
        id: StreamId,
        epoch: u64,
        buffer: SampleBuffer,
    },
    /// End of data for now; queued after the last sample
    DrainStream { id: StreamId, epoch: u64 },
}

impl ControlMsg {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            ControlMsg::Init => "Init",
            ControlMsg::Reconfigure => "Reconfigure",
            ControlMsg::ApplySettings(_) => "ApplySettings",
            ControlMsg::Suspend { .. } => "Suspend",
            ControlMsg::Resume { .. } => "Resume",
            ControlMsg::DeviceChange => "DeviceChange",
            ControlMsg::DeviceCountChange => "DeviceCountChange",
            ControlMsg::EnumerateDevices { .. } => "EnumerateDevices",
            ControlMsg::SetVolume(_) => "SetVolume",
            ControlMsg::SetMute(_) => "SetMute",
            ControlMsg::SetSoundMode(_) => "SetSoundMode",
            ControlMsg::AppFocused(_) => "AppFocused",
            ControlMsg::NewStream { .. } => "NewStream",
            ControlMsg::FreeStream { .. } => "FreeStream",
            ControlMsg::FlushStream { .. } => "FlushStream",
            ControlMsg::PauseStream { .. } => "PauseStream",
            ControlMsg::StreamVolume { .. } => "StreamVolume",
            ControlMsg::StreamReplayGain { .. } => "StreamReplayGain",
            ControlMsg::StreamAmplification { .. } => "StreamAmplification",
            ControlMsg::StreamFade { .. } => "StreamFade",
            ControlMsg::StreamResampleRatio { .. } => "StreamResampleRatio",
            ControlMsg::StreamResampleMode { .. } => "StreamResampleMode",
            ControlMsg::StreamForceResampler { .. } => "StreamForceResampler",
            ControlMsg::StreamSlave { .. } => "StreamSlave",
            ControlMsg::StreamErrorInterval { .. } => "StreamErrorInterval",
            ControlMsg::StreamSync { .. } => "StreamSync",
            ControlMsg::MakeSound { .. } => "MakeSound",
            ControlMsg::PlaySound(_) => "PlaySound",
            ControlMsg::StopSound(_) => "StopSound",
            ControlMsg::FreeSound(_) => "FreeSound",
            ControlMsg::RegisterCallback(_) => "RegisterCallback",
            ControlMsg::UnregisterCallback => "UnregisterCallback",
            ControlMsg::Shutdown { .. } => "Shutdown",
        }
    }
}
