//! Mixing primitives for planar float packets
//!
//! The engine keeps the first ready stream's buffer as the accumulator and
//! adds every other stream into it. Gains are either one value for the whole
//! buffer or one value per frame (fades, limiter).

use super::Limiter;
use crate::buffer::SamplePacket;

/// Gain applied to a packet
#[derive(Debug, Clone, Copy)]
pub enum Gain<'a> {
    Uniform(f32),
    /// One gain per frame, indexed from the first mixed frame
    PerFrame(&'a [f32]),
}

impl Gain<'_> {
    #[inline]
    fn at(&self, frame: usize) -> f32 {
        match self {
            Gain::Uniform(g) => *g,
            Gain::PerFrame(gains) => gains[frame],
        }
    }
}

/// Volume ramp of one stream
///
/// The frame count is fixed on first use, when the output rate is known.
#[derive(Debug, Clone, PartialEq)]
pub struct Fade {
    from: f32,
    to: f32,
    ms: u32,
    step: f32,
    remaining: Option<usize>,
}

impl Fade {
    pub fn new(from: f32, to: f32, ms: u32) -> Self {
        Self {
            from,
            to,
            ms,
            step: 0.0,
            remaining: None,
        }
    }

    pub fn target(&self) -> f32 {
        self.to
    }

    /// Advance one frame, updating `volume`; returns true once finished
    pub fn advance(&mut self, volume: &mut f32, sample_rate: u32) -> bool {
        let remaining = match self.remaining {
            Some(r) => r,
            None => {
                let frames = (sample_rate as f64 * self.ms as f64 / 1000.0) as usize;
                *volume = self.from;
                if frames > 0 {
                    self.step = (self.to - self.from) / frames as f32;
                }
                frames
            }
        };
        if remaining == 0 {
            *volume = self.to;
            self.remaining = Some(0);
            return true;
        }
        *volume += self.step;
        let remaining = remaining - 1;
        self.remaining = Some(remaining);
        if remaining == 0 {
            *volume = self.to;
            return true;
        }
        false
    }
}

/// Gain of one stream buffer
///
/// Uniform unless a fade runs or amplification needs the limiter; then one
/// gain per frame is written into `scratch`. A finished fade is cleared.
pub fn stream_gain<'a>(
    pkt: &SamplePacket,
    volume: &mut f32,
    replay_gain: f32,
    fade: &mut Option<Fade>,
    limiter: &mut Limiter,
    scratch: &'a mut Vec<f32>,
) -> Gain<'a> {
    if fade.is_none() && !limiter.is_active() {
        return Gain::Uniform(*volume * replay_gain);
    }

    let rate = pkt.format().sample_rate;
    scratch.clear();
    for frame in 0..pkt.nb_samples {
        if let Some(f) = fade.as_mut() {
            if f.advance(volume, rate) {
                *fade = None;
            }
        }
        let mut gain = *volume * replay_gain;
        if limiter.is_active() {
            gain *= limiter.run(pkt, frame);
        }
        scratch.push(gain);
    }
    Gain::PerFrame(scratch)
}

/// Scale the accumulator in place; returns whether anything left [-1, 1]
pub fn scale(pkt: &mut SamplePacket, gain: Gain<'_>) -> bool {
    let frames = pkt.nb_samples;
    if let Gain::Uniform(g) = gain {
        if g == 1.0 {
            return (0..pkt.planes()).any(|c| pkt.plane(c)[..frames].iter().any(|s| s.abs() > 1.0));
        }
    }
    let mut overflow = false;
    for plane in pkt.planes_mut() {
        for (i, s) in plane[..frames].iter_mut().enumerate() {
            *s *= gain.at(i);
            overflow |= s.abs() > 1.0;
        }
    }
    overflow
}

/// Add `frames` frames of `src` from `src_start` into the start of `dst`
///
/// `dst` grows with silence when it holds fewer frames. Returns whether a
/// summed sample left [-1, 1].
pub fn mix_into(
    dst: &mut SamplePacket,
    src: &SamplePacket,
    src_start: usize,
    frames: usize,
    gain: Gain<'_>,
) -> bool {
    let frames = frames
        .min(src.nb_samples.saturating_sub(src_start))
        .min(dst.max_nb_samples());
    if frames > dst.nb_samples {
        dst.silence_from(dst.nb_samples);
        dst.nb_samples = frames;
    }

    let mut overflow = false;
    let planes = dst.planes().min(src.planes());
    for c in 0..planes {
        let input = &src.plane(c)[src_start..src_start + frames];
        let out = &mut dst.plane_mut(c)[..frames];
        for (i, (o, s)) in out.iter_mut().zip(input).enumerate() {
            *o += s * gain.at(i);
            overflow |= o.abs() > 1.0;
        }
    }
    overflow
}

/// Clip every sample into [-1, 1]
pub fn clamp(pkt: &mut SamplePacket) {
    let frames = pkt.nb_samples;
    for plane in pkt.planes_mut() {
        for s in &mut plane[..frames] {
            *s = s.clamp(-1.0, 1.0);
        }
    }
}

/// Software master volume for sinks without hardware volume
pub fn deamplify(pkt: &mut SamplePacket, volume: f32, muted: bool) {
    if volume >= 1.0 && !muted {
        return;
    }
    let gain = if muted { 0.0 } else { volume.max(0.0) };
    scale(pkt, Gain::Uniform(gain));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AudioFormat, ChannelLayout};

    fn constant(value: f32, frames: usize) -> SamplePacket {
        let fmt = AudioFormat::internal(1000, ChannelLayout::stereo(), frames);
        let mut pkt = SamplePacket::new(&fmt, frames);
        for plane in pkt.planes_mut() {
            plane.fill(value);
        }
        pkt.nb_samples = frames;
        pkt
    }

    #[test]
    fn test_two_streams_sum() {
        let mut acc = constant(0.25, 16);
        let other = constant(0.25, 16);
        assert!(!scale(&mut acc, Gain::Uniform(1.0)));
        assert!(!mix_into(&mut acc, &other, 0, 16, Gain::Uniform(1.0)));
        assert!(acc.plane(1).iter().all(|&s| s == 0.5));
    }

    #[test]
    fn test_two_streams_clamped() {
        let mut acc = constant(0.75, 16);
        let other = constant(0.75, 16);
        scale(&mut acc, Gain::Uniform(1.0));
        let overflow = mix_into(&mut acc, &other, 0, 16, Gain::Uniform(1.0));
        assert!(overflow);
        clamp(&mut acc);
        assert!(acc.plane(0).iter().all(|&s| s == 1.0));
    }

    #[test]
    fn test_mix_extends_short_accumulator() {
        let mut acc = constant(0.1, 16);
        acc.nb_samples = 4;
        let other = constant(0.2, 16);
        mix_into(&mut acc, &other, 0, 16, Gain::Uniform(1.0));
        assert_eq!(acc.nb_samples, 16);
        assert!((acc.plane(0)[0] - 0.3).abs() < 1e-6);
        assert!((acc.plane(0)[10] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_mix_from_offset() {
        let mut acc = constant(0.0, 8);
        let mut sound = constant(0.0, 8);
        sound.plane_mut(0)[6] = 0.5;
        mix_into(&mut acc, &sound, 6, 8, Gain::Uniform(0.5));
        assert_eq!(acc.plane(0)[0], 0.25);
        assert_eq!(acc.plane(0)[2], 0.0);
    }

    #[test]
    fn test_fade_reaches_target() {
        let mut fade = Fade::new(0.0, 1.0, 10);
        let mut volume = 0.7;
        let mut frames = 0;
        while !fade.advance(&mut volume, 1000) {
            frames += 1;
            assert!(volume > 0.0 && volume < 1.0);
        }
        assert_eq!(frames, 9);
        assert_eq!(volume, 1.0);
    }

    #[test]
    fn test_fade_gains_are_per_frame() {
        let pkt = constant(0.5, 20);
        let mut volume = 1.0;
        let mut fade = Some(Fade::new(1.0, 0.0, 10));
        let mut limiter = Limiter::new(1000);
        let mut scratch = Vec::new();
        let gain = stream_gain(&pkt, &mut volume, 1.0, &mut fade, &mut limiter, &mut scratch);
        let Gain::PerFrame(gains) = gain else {
            panic!("expected per-frame gains");
        };
        assert_eq!(gains.len(), 20);
        assert!(gains[0] > gains[5]);
        assert_eq!(gains[15], 0.0);
        assert!(fade.is_none());
        assert_eq!(volume, 0.0);
    }

    #[test]
    fn test_deamplify() {
        let mut pkt = constant(0.5, 4);
        deamplify(&mut pkt, 1.0, false);
        assert_eq!(pkt.plane(0)[0], 0.5);
        deamplify(&mut pkt, 0.5, false);
        assert_eq!(pkt.plane(0)[0], 0.25);
        deamplify(&mut pkt, 1.0, true);
        assert_eq!(pkt.plane(0)[0], 0.0);
    }
}
