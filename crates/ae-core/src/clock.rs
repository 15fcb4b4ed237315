//! Reference clock streams can be synchronised against

/// Clock of the presentation (usually the video) audio has to follow
///
/// Implementations are read from the engine thread once per tick and must
/// not block.
pub trait AvClock: Send + Sync {
    /// Current presentation time in milliseconds
    fn clock_ms(&self) -> f64;

    /// Playback speed; 1.0 is normal speed
    fn clock_speed(&self) -> f64 {
        1.0
    }
}
