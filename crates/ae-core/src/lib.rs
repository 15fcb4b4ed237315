//! AE Core - real-time audio engine
//!
//! Producers push PCM or bitstream audio into [`AudioStream`]s; the engine
//! converts, synchronises and mixes them and hands the result to one output
//! device on its own thread.

pub mod buffer;
pub mod clock;
pub mod config;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod resample;
pub mod sink;
pub mod stream;
pub mod tempo;
pub mod types;
pub mod viz;

pub use clock::AvClock;
pub use config::AudioSettings;
pub use engine::{AudioEngine, EngineBuilder, EngineStats};
pub use error::{AeError, AeResult};
pub use stream::{AudioStream, ExtData, StreamOptions};
pub use types::*;
pub use viz::AudioCallback;
