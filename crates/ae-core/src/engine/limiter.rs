//! Per-stream peak limiter for amplified streams
//!
//! Amplification can push peaks past full scale. The limiter computes a
//! per-frame gain: when the amplified peak would clip, gain drops at once to
//! the level that just avoids it, holds there, then releases
//! exponentially back to unity.

use crate::buffer::SamplePacket;

// ═══════════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════════

/// Time the reduced gain is held after a peak
const HOLD_SECS: f32 = 0.025;

/// Time to recover from full reduction back to unity
const RELEASE_SECS: f32 = 0.1;

// ═══════════════════════════════════════════════════════════════════════════════
// Limiter
// ═══════════════════════════════════════════════════════════════════════════════

/// Hold/release limiter driven by the peak across all channels of a frame
#[derive(Debug, Clone)]
pub struct Limiter {
    sample_rate: u32,
    amplify: f32,
    attenuation: f32,
    /// Per-frame factor applied to `attenuation` while releasing
    increase: f32,
    hold: u32,
}

impl Limiter {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            amplify: 1.0,
            attenuation: 1.0,
            increase: 1.0,
            hold: 0,
        }
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate.max(1);
    }

    pub fn set_amplification(&mut self, amplify: f32) {
        self.amplify = amplify.max(0.0);
    }

    pub fn amplification(&self) -> f32 {
        self.amplify
    }

    /// Whether the limiter has anything to do
    pub fn is_active(&self) -> bool {
        self.amplify != 1.0
    }

    /// Gain for frame `frame` of `pkt`: amplification times attenuation
    pub fn run(&mut self, pkt: &SamplePacket, frame: usize) -> f32 {
        let highest = (0..pkt.planes())
            .map(|c| pkt.plane(c)[frame].abs())
            .fold(0.0f32, f32::max);

        // ── 1. New peak: cut to the level that just avoids clipping ──────
        let peak = highest * self.amplify;
        if peak * self.attenuation > 1.0 {
            self.attenuation = 1.0 / peak;
            self.hold = (self.sample_rate as f32 * HOLD_SECS).round() as u32;
            self.increase = (1.0 / self.attenuation).powf(1.0 / (self.sample_rate as f32 * RELEASE_SECS));
        }

        let gain = self.attenuation * self.amplify;

        // ── 2. Hold, then release towards unity ──────────────────────────
        if self.hold > 0 {
            self.hold -= 1;
        } else {
            self.attenuation *= self.increase;
            if self.attenuation > 1.0 {
                self.attenuation = 1.0;
                self.increase = 1.0;
            }
        }
        gain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AudioFormat, ChannelLayout};

    fn packet(value: f32, frames: usize) -> SamplePacket {
        let fmt = AudioFormat::internal(1000, ChannelLayout::stereo(), frames);
        let mut pkt = SamplePacket::new(&fmt, frames);
        for plane in pkt.planes_mut() {
            plane.fill(value);
        }
        pkt.nb_samples = frames;
        pkt
    }

    #[test]
    fn test_quiet_signal_gets_full_amplification() {
        let mut limiter = Limiter::new(1000);
        limiter.set_amplification(2.0);
        let pkt = packet(0.25, 4);
        assert_eq!(limiter.run(&pkt, 0), 2.0);
    }

    #[test]
    fn test_loud_signal_never_clips() {
        let mut limiter = Limiter::new(1000);
        limiter.set_amplification(4.0);
        let pkt = packet(0.8, 100);
        for f in 0..100 {
            let gain = limiter.run(&pkt, f);
            assert!(0.8 * gain <= 1.0 + 1e-5, "frame {} clipped", f);
        }
    }

    #[test]
    fn test_releases_after_hold() {
        let mut limiter = Limiter::new(1000);
        limiter.set_amplification(2.0);
        let loud = packet(1.0, 1);
        let quiet = packet(0.0, 1);
        let cut = limiter.run(&loud, 0);
        assert!((cut - 1.0).abs() < 1e-6);
        // 25 frames hold at 1 kHz, 100 frames release
        for _ in 0..200 {
            limiter.run(&quiet, 0);
        }
        assert!((limiter.run(&quiet, 0) - 2.0).abs() < 1e-3);
    }
}
