//! Raw sample storage

use crate::types::{AudioFormat, Sample, SampleFormat};

/// Storage for one buffer worth of samples
///
/// Planes are kept as `f32` words so planar float data can be used directly.
/// Every other representation (integer PCM, bitstream) goes through the byte
/// views, which reinterpret the same storage with bytemuck.
#[derive(Debug, Clone)]
pub struct SamplePacket {
    format: AudioFormat,
    data: Vec<Vec<Sample>>,
    /// Frames currently stored
    pub nb_samples: usize,
    max_nb_samples: usize,
    /// Bitstream gap to emit in place of this packet's data (milliseconds)
    pub pause_burst_ms: u32,
}

impl SamplePacket {
    /// Allocate storage for `max_nb_samples` frames of `format`
    pub fn new(format: &AudioFormat, max_nb_samples: usize) -> Self {
        let stride = Self::stride_of(format);
        let words = (max_nb_samples * stride).div_ceil(std::mem::size_of::<Sample>());
        let data = (0..format.planes()).map(|_| vec![0.0; words]).collect();

        Self {
            format: format.clone().with_frames(max_nb_samples),
            data,
            nb_samples: 0,
            max_nb_samples,
            pause_burst_ms: 0,
        }
    }

    fn stride_of(format: &AudioFormat) -> usize {
        if format.planar {
            format.sample_format.bytes_per_sample()
        } else {
            format.frame_size()
        }
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn max_nb_samples(&self) -> usize {
        self.max_nb_samples
    }

    pub fn planes(&self) -> usize {
        self.data.len()
    }

    pub fn channels(&self) -> usize {
        self.format.channels()
    }

    /// Frames that still fit into this packet
    pub fn free_samples(&self) -> usize {
        self.max_nb_samples - self.nb_samples
    }

    pub fn is_full(&self) -> bool {
        self.nb_samples >= self.max_nb_samples
    }

    /// Bytes one frame occupies in a single plane
    pub fn plane_stride(&self) -> usize {
        Self::stride_of(&self.format)
    }

    /// Whether the packet holds planar float samples
    pub fn is_float_planar(&self) -> bool {
        self.format.planar && self.format.sample_format == SampleFormat::F32
    }

    /// Float samples of one plane (planar float packets only)
    pub fn plane(&self, index: usize) -> &[Sample] {
        &self.data[index][..self.max_nb_samples]
    }

    pub fn plane_mut(&mut self, index: usize) -> &mut [Sample] {
        let max = self.max_nb_samples;
        &mut self.data[index][..max]
    }

    /// All float planes at once, for stages that write several channels together
    pub fn planes_mut(&mut self) -> impl Iterator<Item = &mut [Sample]> {
        let max = self.max_nb_samples;
        self.data.iter_mut().map(move |p| &mut p[..max])
    }

    /// Byte view of one plane
    pub fn bytes(&self, index: usize) -> &[u8] {
        let len = self.max_nb_samples * self.plane_stride();
        &bytemuck::cast_slice::<Sample, u8>(&self.data[index])[..len]
    }

    pub fn bytes_mut(&mut self, index: usize) -> &mut [u8] {
        let len = self.max_nb_samples * self.plane_stride();
        &mut bytemuck::cast_slice_mut::<Sample, u8>(&mut self.data[index])[..len]
    }

    /// Zero every frame from `start` to the end of the packet
    pub fn silence_from(&mut self, start: usize) {
        let stride = self.plane_stride();
        for plane in 0..self.planes() {
            let bytes = self.bytes_mut(plane);
            bytes[start * stride..].fill(0);
        }
    }

    /// Pad the packet to its full size with silence
    pub fn pad_to_full(&mut self) {
        self.silence_from(self.nb_samples);
        self.nb_samples = self.max_nb_samples;
    }

    /// Remove `frames` frames from the front, shifting the rest down
    ///
    /// Returns the number of frames actually removed.
    pub fn discard_front(&mut self, frames: usize) -> usize {
        let frames = frames.min(self.nb_samples);
        if frames == 0 {
            return 0;
        }
        let stride = self.plane_stride();
        let end = self.nb_samples * stride;
        for plane in 0..self.planes() {
            self.bytes_mut(plane).copy_within(frames * stride..end, 0);
        }
        self.nb_samples -= frames;
        frames
    }

    /// Empty the packet without touching the storage
    pub fn clear(&mut self) {
        self.nb_samples = 0;
        self.pause_burst_ms = 0;
    }

    /// Duration of the stored frames in milliseconds
    pub fn duration_ms(&self) -> f64 {
        self.format.frames_to_ms(self.nb_samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelLayout, RawCodec};

    #[test]
    fn test_planar_float_layout() {
        let fmt = AudioFormat::internal(48000, ChannelLayout::stereo(), 256);
        let pkt = SamplePacket::new(&fmt, 256);
        assert_eq!(pkt.planes(), 2);
        assert_eq!(pkt.plane(0).len(), 256);
        assert_eq!(pkt.bytes(1).len(), 256 * 4);
        assert!(pkt.is_float_planar());
    }

    #[test]
    fn test_raw_layout_uses_byte_view() {
        let fmt = AudioFormat::raw(RawCodec::Ac3, 48000);
        let pkt = SamplePacket::new(&fmt, 1536);
        assert_eq!(pkt.planes(), 1);
        assert_eq!(pkt.plane_stride(), 4);
        assert_eq!(pkt.bytes(0).len(), 1536 * 4);
        assert!(!pkt.is_float_planar());
    }

    #[test]
    fn test_discard_front_shifts_samples() {
        let fmt = AudioFormat::internal(48000, ChannelLayout::stereo(), 8);
        let mut pkt = SamplePacket::new(&fmt, 8);
        for (i, s) in pkt.plane_mut(0).iter_mut().enumerate() {
            *s = i as f32;
        }
        pkt.nb_samples = 6;

        assert_eq!(pkt.discard_front(2), 2);
        assert_eq!(pkt.nb_samples, 4);
        assert_eq!(&pkt.plane(0)[..4], &[2.0, 3.0, 4.0, 5.0]);

        assert_eq!(pkt.discard_front(10), 4);
        assert_eq!(pkt.nb_samples, 0);
    }

    #[test]
    fn test_pad_to_full_zeroes_tail() {
        let fmt = AudioFormat::internal(48000, ChannelLayout::stereo(), 4);
        let mut pkt = SamplePacket::new(&fmt, 4);
        pkt.plane_mut(1).fill(0.5);
        pkt.nb_samples = 1;
        pkt.pad_to_full();
        assert_eq!(pkt.nb_samples, 4);
        assert_eq!(pkt.plane(1), &[0.5, 0.0, 0.0, 0.0]);
    }
}
