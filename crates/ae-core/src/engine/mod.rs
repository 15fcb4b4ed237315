//! Audio engine - stream mixing, output negotiation and drift correction
//!
//! This module contains the engine side of the pipeline:
//! - AudioEngine: application handle owning the engine and sink threads
//! - Engine actor: hierarchical state machine driving every stream
//! - Output format negotiation and reconfiguration
//! - Mixer: per-stream gain, fades and the amplification limiter
//! - GUI sounds mixed on top of the streams
//! - EngineStats: timing snapshot readable from any thread

mod actor;
pub(crate) mod command;
mod configure;
mod engine;
mod gc;
mod limiter;
mod mixer;
mod sound;
mod stats;

pub use engine::*;
pub use limiter::*;
pub use mixer::Fade;
pub use stats::*;
