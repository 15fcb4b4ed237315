//! Pitch-preserving speed change
//!
//! Large drift corrections are applied by stretching time instead of shifting
//! the sample rate, which would be audible as a pitch change.

mod stage;
mod stretcher;

pub use stage::TempoStage;
pub use stretcher::TimeStretcher;

use crate::buffer::{SamplePacket, StageInput};
use crate::error::AeResult;
use crate::types::AudioFormat;

/// Lower bound of the tempo factor
pub const MIN_TEMPO: f64 = 0.5;
/// Upper bound of the tempo factor
pub const MAX_TEMPO: f64 = 2.0;

/// Time-stretch filter working on planar float packets
///
/// Tempo > 1.0 plays faster (fewer output frames per input frame).
pub trait TempoFilter: Send {
    /// Rebuild internal state for `format` at `tempo`
    fn init(&mut self, format: &AudioFormat, tempo: f64) -> AeResult<()>;

    /// Change the factor without rebuilding; takes effect on the next input
    fn set_tempo(&mut self, tempo: f64);

    fn tempo(&self) -> f64;

    /// Stretch `input` and write up to `max_out` frames into `dst` after its
    /// current `nb_samples`. Returns the number of frames written.
    fn process(
        &mut self,
        dst: &mut SamplePacket,
        max_out: usize,
        input: StageInput<'_>,
    ) -> AeResult<usize>;

    /// Audio held inside the filter, in output frames
    fn buffered_frames(&self) -> usize;

    /// Audio held inside the filter, in seconds
    fn delay(&self) -> f64;

    /// Whether a flush has pushed out everything held inside
    fn is_eof(&self) -> bool;
}

/// Builds the filter implementation used by every tempo stage
pub type TempoFilterFactory = fn(&AudioFormat, f64) -> AeResult<Box<dyn TempoFilter>>;

/// Default factory: signalsmith-stretch
pub fn create_tempo_filter(format: &AudioFormat, tempo: f64) -> AeResult<Box<dyn TempoFilter>> {
    let mut filter = TimeStretcher::default();
    filter.init(format, tempo)?;
    Ok(Box::new(filter))
}
