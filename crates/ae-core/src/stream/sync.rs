//! Audio/video drift correction
//!
//! [`SyncController`] is a pure state machine: the engine feeds it the
//! measured error for a stream once per tick and applies whatever
//! [`SyncAction`] comes back.

use serde::{Deserialize, Serialize};

/// Tunable thresholds of the drift correction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncTuning {
    /// Error band considered converged after a discrete correction
    pub converge_band_ms: f64,
    /// Integral term only accumulates beyond this error
    pub integral_engage_ms: f64,
    /// Integral term is reset beyond this error
    pub failsafe_ms: f64,
    /// Base divergence that sends an in-sync stream back to adjusting
    pub adjust_threshold_ms: f64,
    /// Averaging window while muted or adjusting
    pub short_window_ms: u64,
    /// Averaging window while in sync
    pub error_interval_ms: u64,
    /// Upper bound the in-sync window may be widened to
    pub max_error_interval_ms: u64,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            converge_band_ms: 30.0,
            integral_engage_ms: 5.0,
            failsafe_ms: 1000.0,
            adjust_threshold_ms: 100.0,
            short_window_ms: 100,
            error_interval_ms: 1000,
            max_error_interval_ms: 8000,
        }
    }
}

/// Sync sub-state of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Off,
    Start,
    Mute,
    Adjust,
    InSync,
}

/// What the engine should do to a stream after a sync update
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncAction {
    None,
    /// Output silence instead of the stream's audio
    Mute,
    /// Audio is ahead: delay it by this much silence
    InsertSilence { ms: f64 },
    /// Audio is late: skip this much of it
    Drop { ms: f64 },
    /// Continuous correction through the resample ratio
    SetRatio(f64),
}

/// Windowed average of the measured error
#[derive(Debug, Clone)]
pub struct SyncError {
    sum: f64,
    count: u32,
    window_start: Option<u64>,
    interval_ms: u64,
    last_error: f64,
}

impl SyncError {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            sum: 0.0,
            count: 0,
            window_start: None,
            interval_ms,
            last_error: 0.0,
        }
    }

    pub fn add(&mut self, error_ms: f64, now_ms: u64) {
        if self.window_start.is_none() {
            self.window_start = Some(now_ms);
        }
        self.sum += error_ms;
        self.count += 1;
        self.last_error = error_ms;
    }

    /// Average over the window once it has elapsed, starting a new window
    pub fn get(&mut self, now_ms: u64) -> Option<f64> {
        let start = self.window_start?;
        if self.count == 0 || now_ms.saturating_sub(start) < self.interval_ms {
            return None;
        }
        let average = self.sum / self.count as f64;
        self.sum = 0.0;
        self.count = 0;
        self.window_start = Some(now_ms);
        Some(average)
    }

    /// Discard collected samples and switch to a new window length
    pub fn flush(&mut self, interval_ms: u64) {
        self.sum = 0.0;
        self.count = 0;
        self.window_start = None;
        self.interval_ms = interval_ms;
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn last_error(&self) -> f64 {
        self.last_error
    }
}

/// Snapshot for sync info queries
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SyncInfo {
    pub state: SyncState,
    /// Last averaged error in milliseconds
    pub error_ms: f64,
    pub rr: f64,
    pub error_interval_ms: u64,
}

/// Per-stream drift correction state machine
#[derive(Debug, Clone)]
pub struct SyncController {
    tuning: SyncTuning,
    state: SyncState,
    error: SyncError,
    error_interval_ms: u64,
    integral: f64,
    last_clock_speed: f64,
    /// Error measured when the current adjustment began
    adjust_entry_error: f64,
    last_average: f64,
    last_ratio: f64,
}

impl SyncController {
    pub fn new(tuning: SyncTuning) -> Self {
        let interval = tuning.error_interval_ms;
        Self {
            error: SyncError::new(interval),
            error_interval_ms: interval,
            tuning,
            state: SyncState::Off,
            integral: 0.0,
            last_clock_speed: 1.0,
            adjust_entry_error: 0.0,
            last_average: 0.0,
            last_ratio: 1.0,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Begin (or restart) synchronisation against the reference clock
    pub fn start(&mut self) {
        self.state = SyncState::Start;
    }

    pub fn stop(&mut self) {
        self.state = SyncState::Off;
        self.integral = 0.0;
    }

    pub fn set_tuning(&mut self, tuning: SyncTuning) {
        self.tuning = tuning;
    }

    /// Window used while in sync, widened while timestamps misbehave
    pub fn set_error_interval(&mut self, interval_ms: u64) {
        let interval_ms = interval_ms.clamp(self.tuning.error_interval_ms, self.tuning.max_error_interval_ms);
        if interval_ms == self.error_interval_ms {
            return;
        }
        self.error_interval_ms = interval_ms;
        if self.state == SyncState::InSync {
            self.error.flush(interval_ms);
        }
    }

    pub fn error_interval_ms(&self) -> u64 {
        self.error_interval_ms
    }

    pub fn info(&self) -> SyncInfo {
        SyncInfo {
            state: self.state,
            error_ms: self.last_average,
            rr: self.last_ratio,
            error_interval_ms: self.error_interval_ms,
        }
    }

    /// Divergence that counts as out of sync under the current conditions
    pub fn threshold(&self, clock_speed: f64, resample_mode: bool) -> f64 {
        let mut threshold = self.tuning.adjust_threshold_ms;
        if resample_mode {
            threshold *= 2.0;
        }
        if clock_speed != 1.0 {
            threshold *= 5.0;
        }
        threshold
    }

    /// Feed one error measurement (positive: audio ahead of the clock)
    pub fn update(
        &mut self,
        error_ms: f64,
        now_ms: u64,
        clock_speed: f64,
        resample_mode: bool,
    ) -> SyncAction {
        match self.state {
            SyncState::Off => return SyncAction::None,
            SyncState::Start => {
                self.error.flush(self.tuning.short_window_ms);
                self.integral = 0.0;
                self.set_state(SyncState::Mute);
                self.last_ratio = 1.0;
                return SyncAction::SetRatio(1.0);
            }
            _ => {}
        }

        self.error.add(error_ms, now_ms);
        let Some(average) = self.error.get(now_ms) else {
            return if self.state == SyncState::Mute {
                SyncAction::Mute
            } else {
                SyncAction::None
            };
        };
        self.last_average = average;
        let threshold = self.threshold(clock_speed, resample_mode);

        match self.state {
            SyncState::Mute => {
                self.adjust_entry_error = average.abs();
                self.set_state(SyncState::Adjust);
                self.adjust(average, threshold)
            }
            SyncState::Adjust => self.adjust(average, threshold),
            SyncState::InSync => {
                if average.abs() > threshold {
                    self.adjust_entry_error = average.abs();
                    self.set_state(SyncState::Adjust);
                    self.error.flush(self.tuning.short_window_ms);
                    return self.adjust(average, threshold);
                }
                let ratio = self.calc_resample_ratio(average, clock_speed);
                SyncAction::SetRatio(ratio)
            }
            SyncState::Off | SyncState::Start => SyncAction::None,
        }
    }

    fn adjust(&mut self, average: f64, threshold: f64) -> SyncAction {
        if average.abs() < self.tuning.converge_band_ms {
            if self.adjust_entry_error > 2.0 * threshold {
                self.adjust_entry_error = 0.0;
                self.error.flush(self.tuning.short_window_ms);
                self.set_state(SyncState::Mute);
                return SyncAction::Mute;
            }
            self.integral = 0.0;
            self.error.flush(self.error_interval_ms);
            self.set_state(SyncState::InSync);
            return SyncAction::None;
        }

        self.error.flush(self.tuning.short_window_ms);
        if average > 0.0 {
            SyncAction::InsertSilence { ms: average }
        } else {
            SyncAction::Drop { ms: -average }
        }
    }

    fn set_state(&mut self, state: SyncState) {
        if state != self.state {
            log::debug!("Sync: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// PI correction of the resample ratio for an averaged error
    pub fn calc_resample_ratio(&mut self, error_ms: f64, clock_speed: f64) -> f64 {
        if clock_speed != self.last_clock_speed {
            self.integral = 0.0;
            self.last_clock_speed = clock_speed;
        }
        let ratio = calc_resample_ratio(
            error_ms,
            clock_speed,
            self.error.interval_ms() as f64,
            &mut self.integral,
            &self.tuning,
        );
        self.last_ratio = ratio;
        ratio
    }
}

/// Proportional term is the error over half the averaging window; the
/// integral accumulates slowly outside a small dead band and resets on
/// very large errors.
pub fn calc_resample_ratio(
    error_ms: f64,
    clock_speed: f64,
    interval_ms: f64,
    integral: &mut f64,
    tuning: &SyncTuning,
) -> f64 {
    if error_ms.abs() > tuning.failsafe_ms {
        *integral = 0.0;
    } else if error_ms.abs() > tuning.integral_engage_ms {
        *integral += error_ms / 1000.0 / 200.0;
    }
    let proportional = error_ms / interval_ms.max(1.0) / 2.0;
    1.0 / clock_speed + proportional + *integral
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_window() {
        let mut error = SyncError::new(100);
        error.add(10.0, 0);
        error.add(20.0, 50);
        assert_eq!(error.get(50), None);
        error.add(30.0, 100);
        assert_eq!(error.get(100), Some(20.0));
        assert_eq!(error.get(150), None);
    }

    #[test]
    fn test_ratio_monotonic_in_error() {
        let tuning = SyncTuning::default();
        let mut last = f64::MIN;
        for e in -50..=50 {
            let mut integral = 0.01;
            let ratio = calc_resample_ratio(e as f64 * 2.0, 1.0, 1000.0, &mut integral, &tuning);
            assert!(ratio > last);
            last = ratio;
        }
    }

    #[test]
    fn test_integral_dead_band_and_failsafe() {
        let tuning = SyncTuning::default();
        let mut integral = 0.0;
        calc_resample_ratio(3.0, 1.0, 1000.0, &mut integral, &tuning);
        assert_eq!(integral, 0.0);
        calc_resample_ratio(10.0, 1.0, 1000.0, &mut integral, &tuning);
        assert!(integral > 0.0);
        calc_resample_ratio(1500.0, 1.0, 1000.0, &mut integral, &tuning);
        assert_eq!(integral, 0.0);
    }

    #[test]
    fn test_clock_speed_change_resets_integral() {
        let mut sync = SyncController::new(SyncTuning::default());
        sync.calc_resample_ratio(20.0, 1.0);
        let ratio = sync.calc_resample_ratio(0.0, 2.0);
        assert!((ratio - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_threshold_scaling() {
        let sync = SyncController::new(SyncTuning::default());
        assert_eq!(sync.threshold(1.0, false), 100.0);
        assert_eq!(sync.threshold(1.0, true), 200.0);
        assert_eq!(sync.threshold(1.5, true), 1000.0);
    }

    /// Drive the controller against a simulated stream whose error only
    /// changes through the corrections it requests
    fn simulate(initial_error: f64, ticks: u64) -> (SyncController, u64) {
        let mut sync = SyncController::new(SyncTuning::default());
        sync.start();
        let mut error = initial_error;
        for tick in 0..ticks {
            match sync.update(error, tick * 10, 1.0, false) {
                SyncAction::InsertSilence { ms } => error -= ms,
                SyncAction::Drop { ms } => error += ms,
                _ => {}
            }
            if sync.state() == SyncState::InSync {
                return (sync, tick);
            }
        }
        (sync, ticks)
    }

    #[test]
    fn test_converges_to_insync() {
        let (sync, ticks) = simulate(80.0, 100);
        assert_eq!(sync.state(), SyncState::InSync);
        assert!(ticks < 40, "took {} ticks", ticks);
    }

    #[test]
    fn test_late_audio_drops() {
        let (sync, _) = simulate(-60.0, 100);
        assert_eq!(sync.state(), SyncState::InSync);
    }

    #[test]
    fn test_large_error_mutes_again() {
        let mut sync = SyncController::new(SyncTuning::default());
        sync.start();
        assert_eq!(sync.update(500.0, 0, 1.0, false), SyncAction::SetRatio(1.0));
        assert_eq!(sync.state(), SyncState::Mute);
        assert_eq!(sync.update(500.0, 0, 1.0, false), SyncAction::Mute);
        assert_eq!(
            sync.update(500.0, 100, 1.0, false),
            SyncAction::InsertSilence { ms: 500.0 }
        );
        assert_eq!(sync.state(), SyncState::Adjust);
        sync.update(0.0, 110, 1.0, false);
        assert_eq!(sync.update(0.0, 210, 1.0, false), SyncAction::Mute);
        assert_eq!(sync.state(), SyncState::Mute);
    }

    #[test]
    fn test_insync_sets_ratio() {
        let (mut sync, ticks) = simulate(40.0, 100);
        let now = ticks * 10 + 10;
        sync.update(8.0, now, 1.0, true);
        let action = sync.update(8.0, now + 1000, 1.0, true);
        match action {
            SyncAction::SetRatio(r) => assert!(r > 1.0),
            other => panic!("unexpected {:?}", other),
        }
    }
}
