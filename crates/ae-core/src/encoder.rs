//! Bitstream encoder used in transcode mode
//!
//! The engine ships no encoder. Applications that can encode (for example
//! to AC3) install an [`EncoderFactory`] through the engine builder, which
//! makes transcode mode available.

use crate::buffer::SamplePacket;
use crate::error::AeResult;
use crate::types::AudioFormat;

/// PCM to bitstream encoder
pub trait Encoder: Send {
    /// Prepare for planar float input in `format`
    ///
    /// Returns the raw format of the encoded output. `format.frames` is
    /// adjusted to the number of frames one encoded packet consumes.
    fn initialize(&mut self, format: &mut AudioFormat) -> AeResult<AudioFormat>;

    /// Frames of PCM consumed per encoded packet
    fn frames_per_packet(&self) -> usize;

    /// Encode one full packet of `input` into `output`
    ///
    /// Returns the number of bitstream frames written.
    fn encode(&mut self, input: &SamplePacket, output: &mut SamplePacket) -> AeResult<usize>;

    /// Audio held inside the encoder, in seconds
    fn delay(&self) -> f64 {
        0.0
    }
}

/// Builds an encoder when transcode mode is entered
pub type EncoderFactory = fn() -> Box<dyn Encoder>;
