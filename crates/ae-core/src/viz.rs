//! Visualization tap
//!
//! One registered [`AudioCallback`] sees the mixed output as interleaved
//! stereo float, delivered when the audio is actually audible rather than
//! when it was mixed.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::buffer::SamplePacket;
use crate::resample::RemapMatrix;
use crate::types::{ChannelLayout, Sample};

/// Most frames handed over per callback
pub const VIZ_BLOCK_FRAMES: usize = 512;

/// Blocks kept waiting for playback before new ones are dropped
const MAX_PENDING_BLOCKS: usize = 64;

/// Receiver of the audio being played
///
/// Called on the engine thread; implementations must return quickly.
pub trait AudioCallback: Send {
    fn on_initialize(&mut self, channels: usize, sample_rate: u32, bits_per_sample: u32);

    /// Interleaved stereo samples, `samples.len() / 2` frames
    fn on_audio_data(&mut self, samples: &[f32]);
}

struct VizBlock {
    due: Instant,
    samples: Vec<f32>,
}

/// Delay queue in front of the callback
pub(crate) struct VizTap {
    callback: Box<dyn AudioCallback>,
    initialized: Option<(ChannelLayout, u32)>,
    remap: Option<RemapMatrix>,
    planes: Vec<Vec<Sample>>,
    pending: VecDeque<VizBlock>,
    spare: Vec<Vec<f32>>,
}

impl VizTap {
    pub fn new(callback: Box<dyn AudioCallback>) -> Self {
        Self {
            callback,
            initialized: None,
            remap: None,
            planes: vec![Vec::new(), Vec::new()],
            pending: VecDeque::new(),
            spare: Vec::new(),
        }
    }

    /// Forget queued audio, e.g. after a flush
    pub fn flush(&mut self) {
        while let Some(block) = self.pending.pop_front() {
            self.spare.push(block.samples);
        }
    }

    /// Queue the first frames of a mixed packet, audible after `delay`
    pub fn push(&mut self, pkt: &SamplePacket, delay: Duration) {
        if !pkt.is_float_planar() || pkt.nb_samples == 0 {
            return;
        }
        let layout = pkt.format().layout.clone();
        let rate = pkt.format().sample_rate;
        let config = (layout.clone(), rate);
        if self.initialized.as_ref() != Some(&config) {
            self.flush();
            self.callback.on_initialize(2, rate, 32);
            self.remap = Some(RemapMatrix::build(&layout, &ChannelLayout::stereo(), false, true, None));
            self.initialized = Some(config);
        }
        if self.pending.len() >= MAX_PENDING_BLOCKS {
            log::warn!("Engine: viz ran out of free buffers");
            return;
        }
        let Some(remap) = self.remap.as_ref() else {
            return;
        };

        let frames = pkt.nb_samples.min(VIZ_BLOCK_FRAMES);
        let src: Vec<&[Sample]> = (0..pkt.planes()).map(|c| &pkt.plane(c)[..frames]).collect();
        for plane in &mut self.planes {
            plane.clear();
        }
        remap.apply(&src, frames, &mut self.planes);

        let mut samples = self.spare.pop().unwrap_or_default();
        samples.clear();
        for f in 0..frames {
            samples.push(self.planes[0][f]);
            samples.push(self.planes[1][f]);
        }
        self.pending.push_back(VizBlock {
            due: Instant::now() + delay,
            samples,
        });
    }

    /// Hand every block that has become audible to the callback
    pub fn deliver(&mut self, now: Instant) -> bool {
        let mut delivered = false;
        while self.pending.front().is_some_and(|b| b.due <= now) {
            if let Some(block) = self.pending.pop_front() {
                self.callback.on_audio_data(&block.samples);
                self.spare.push(block.samples);
                delivered = true;
            }
        }
        delivered
    }

    pub fn into_callback(self) -> Box<dyn AudioCallback> {
        self.callback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AudioFormat, StdLayout};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        init: Vec<(usize, u32, u32)>,
        blocks: Vec<Vec<f32>>,
    }

    struct Probe(Arc<Mutex<Recorder>>);

    impl AudioCallback for Probe {
        fn on_initialize(&mut self, channels: usize, sample_rate: u32, bits: u32) {
            self.0.lock().unwrap().init.push((channels, sample_rate, bits));
        }

        fn on_audio_data(&mut self, samples: &[f32]) {
            self.0.lock().unwrap().blocks.push(samples.to_vec());
        }
    }

    fn packet(layout: ChannelLayout, frames: usize, value: f32) -> SamplePacket {
        let fmt = AudioFormat::internal(48000, layout, frames);
        let mut pkt = SamplePacket::new(&fmt, frames);
        for plane in pkt.planes_mut() {
            plane.fill(value);
        }
        pkt.nb_samples = frames;
        pkt
    }

    #[test]
    fn test_delivered_only_when_due() {
        let rec = Arc::new(Mutex::new(Recorder::default()));
        let mut tap = VizTap::new(Box::new(Probe(rec.clone())));
        let start = Instant::now();
        tap.push(&packet(ChannelLayout::stereo(), 1024, 0.5), Duration::from_millis(100));

        assert!(!tap.deliver(start));
        assert!(tap.deliver(start + Duration::from_millis(200)));

        let rec = rec.lock().unwrap();
        assert_eq!(rec.init, vec![(2, 48000, 32)]);
        assert_eq!(rec.blocks.len(), 1);
        assert_eq!(rec.blocks[0].len(), VIZ_BLOCK_FRAMES * 2);
        assert_eq!(rec.blocks[0][0], 0.5);
    }

    #[test]
    fn test_multichannel_downmixed_to_stereo() {
        let rec = Arc::new(Mutex::new(Recorder::default()));
        let mut tap = VizTap::new(Box::new(Probe(rec.clone())));
        tap.push(&packet(StdLayout::L5_1.layout(), 64, 0.1), Duration::ZERO);
        tap.deliver(Instant::now() + Duration::from_millis(1));

        let rec = rec.lock().unwrap();
        assert_eq!(rec.blocks[0].len(), 128);
        assert!(rec.blocks[0].iter().all(|s| s.abs() <= 1.0));
    }

    #[test]
    fn test_flush_drops_pending() {
        let rec = Arc::new(Mutex::new(Recorder::default()));
        let mut tap = VizTap::new(Box::new(Probe(rec.clone())));
        tap.push(&packet(ChannelLayout::stereo(), 64, 0.1), Duration::from_millis(50));
        tap.flush();
        assert!(!tap.deliver(Instant::now() + Duration::from_secs(1)));
        assert!(rec.lock().unwrap().blocks.is_empty());
    }
}
