//! Sample rate and channel conversion
//!
//! The pipeline talks to resamplers through the [`Resampler`] trait. One
//! implementation is provided ([`RubatoResampler`]); the engine picks the
//! implementation at startup through a [`ResamplerFactory`].

mod remap;
mod converter;
mod stage;

pub use converter::RubatoResampler;
pub use remap::RemapMatrix;
pub use stage::ResampleStage;

use serde::{Deserialize, Serialize};

use crate::buffer::{SamplePacket, StageInput};
use crate::error::AeResult;
use crate::types::AudioFormat;

/// Conversion quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResampleQuality {
    Low,
    #[default]
    Medium,
    High,
}

/// Everything a resampler is built from
#[derive(Debug, Clone, PartialEq)]
pub struct ResampleConfig {
    pub input: AudioFormat,
    pub output: AudioFormat,
    pub quality: ResampleQuality,
    pub upmix: bool,
    pub normalize: bool,
    pub centre_mix_level: Option<f32>,
}

/// Rate/channel converter working on planar float packets
pub trait Resampler: Send {
    /// (Re)build internal state for `config`
    fn init(&mut self, config: &ResampleConfig) -> AeResult<()>;

    /// Convert `input` and write up to `max_out` frames into `dst` after
    /// its current `nb_samples`
    ///
    /// `ratio` scales the number of output frames per input frame for drift
    /// correction. Returns the number of frames written. An error means the
    /// converter is unusable and must be rebuilt.
    fn resample(
        &mut self,
        dst: &mut SamplePacket,
        max_out: usize,
        input: StageInput<'_>,
        ratio: f64,
    ) -> AeResult<usize>;

    /// Audio held inside the converter, in seconds
    fn delay(&self) -> f64;

    /// Audio held inside the converter, in output frames
    fn buffered_samples(&self) -> usize;

    /// Whether feeding more input is reasonable given `free` output frames
    fn wants_new_samples(&self, free: usize) -> bool {
        self.buffered_samples() <= free
    }
}

/// Builds the resampler implementation used by every pipeline stage
pub type ResamplerFactory = fn(&ResampleConfig) -> AeResult<Box<dyn Resampler>>;

/// Default factory: rubato-backed conversion
pub fn create_resampler(config: &ResampleConfig) -> AeResult<Box<dyn Resampler>> {
    let mut resampler = RubatoResampler::default();
    resampler.init(config)?;
    Ok(Box::new(resampler))
}
