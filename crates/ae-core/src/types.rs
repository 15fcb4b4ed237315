//! Common types for the audio engine
//!
//! Sample formats, channel layouts and the audio format descriptor shared by
//! the streams, the pipeline stages, the engine and the sink.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Audio sample type used for all internal PCM processing
pub type Sample = f32;

/// Fallback rate when nothing else is known (48kHz, the usual device rate)
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Rate bitstream (IEC 61937) data is carried at for AC3/DTS passthrough
pub const RAW_SAMPLE_RATE: u32 = 48000;

/// Compressed bitstream codecs that can be passed through to a receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RawCodec {
    Ac3,
    Eac3,
    TrueHd,
    Dts,
    DtsHd,
}

impl RawCodec {
    pub fn name(&self) -> &'static str {
        match self {
            RawCodec::Ac3 => "AC3",
            RawCodec::Eac3 => "E-AC3",
            RawCodec::TrueHd => "TrueHD",
            RawCodec::Dts => "DTS",
            RawCodec::DtsHd => "DTS-HD",
        }
    }
}

/// Sample representation
///
/// `Raw` data is an opaque IEC-packed bitstream carried as 16-bit stereo frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    F32,
    F64,
    Raw(RawCodec),
}

impl SampleFormat {
    /// Bytes occupied by one sample of one channel
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16 | SampleFormat::Raw(_) => 2,
            SampleFormat::S32 | SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, SampleFormat::Raw(_))
    }

    /// Bit depth reported to visualization consumers
    pub fn bits(&self) -> u32 {
        self.bytes_per_sample() as u32 * 8
    }
}

/// Speaker positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    FL,
    FR,
    FC,
    LFE,
    BL,
    BR,
    BC,
    SL,
    SR,
}

impl Channel {
    /// Replacement speakers tried in order when a layout lacks this one.
    /// Each entry is a group that must be fully present to be used.
    fn fallbacks(&self) -> &'static [&'static [Channel]] {
        match self {
            Channel::FC => &[&[Channel::FL, Channel::FR]],
            Channel::BL => &[&[Channel::SL]],
            Channel::BR => &[&[Channel::SR]],
            Channel::SL => &[&[Channel::BL]],
            Channel::SR => &[&[Channel::BR]],
            Channel::BC => &[&[Channel::BL, Channel::BR], &[Channel::SL, Channel::SR]],
            _ => &[],
        }
    }
}

/// Ordered list of speakers carried by a format
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChannelLayout {
    channels: Vec<Channel>,
}

impl ChannelLayout {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self { channels }
    }

    pub fn mono() -> Self {
        Self::new(vec![Channel::FC])
    }

    pub fn stereo() -> Self {
        Self::new(vec![Channel::FL, Channel::FR])
    }

    pub fn count(&self) -> usize {
        self.channels.len()
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.channels.contains(&channel)
    }

    pub fn index_of(&self, channel: Channel) -> Option<usize> {
        self.channels.iter().position(|&c| c == channel)
    }

    pub fn has_lfe(&self) -> bool {
        self.contains(Channel::LFE)
    }

    /// Reduce this layout to the speakers available in `target`
    ///
    /// Speakers missing from `target` are replaced by their fallbacks
    /// (side ↔ back, centre → front pair); the result keeps `target`'s order.
    /// Never returns fewer than two channels.
    pub fn resolve(&self, target: &ChannelLayout) -> ChannelLayout {
        let mut wanted: Vec<Channel> = Vec::with_capacity(self.count());
        for &ch in &self.channels {
            if target.contains(ch) {
                wanted.push(ch);
                continue;
            }
            if let Some(group) = ch
                .fallbacks()
                .iter()
                .find(|group| group.iter().all(|c| target.contains(*c)))
            {
                wanted.extend_from_slice(group);
            }
        }

        let channels: Vec<Channel> = target
            .channels
            .iter()
            .copied()
            .filter(|c| wanted.contains(c))
            .collect();

        if channels.len() < 2 {
            return ChannelLayout::stereo();
        }
        ChannelLayout::new(channels)
    }
}

impl fmt::Display for ChannelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.channels.iter().map(|c| format!("{:?}", c)).collect();
        write!(f, "[{}]", names.join(","))
    }
}

/// Standard speaker configurations selectable in the settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StdLayout {
    #[serde(rename = "2.0")]
    #[default]
    L2_0,
    #[serde(rename = "2.1")]
    L2_1,
    #[serde(rename = "3.0")]
    L3_0,
    #[serde(rename = "3.1")]
    L3_1,
    #[serde(rename = "4.0")]
    L4_0,
    #[serde(rename = "4.1")]
    L4_1,
    #[serde(rename = "5.0")]
    L5_0,
    #[serde(rename = "5.1")]
    L5_1,
    #[serde(rename = "7.0")]
    L7_0,
    #[serde(rename = "7.1")]
    L7_1,
}

impl StdLayout {
    pub fn layout(&self) -> ChannelLayout {
        use Channel::*;
        let channels = match self {
            StdLayout::L2_0 => vec![FL, FR],
            StdLayout::L2_1 => vec![FL, FR, LFE],
            StdLayout::L3_0 => vec![FL, FR, FC],
            StdLayout::L3_1 => vec![FL, FR, FC, LFE],
            StdLayout::L4_0 => vec![FL, FR, BL, BR],
            StdLayout::L4_1 => vec![FL, FR, BL, BR, LFE],
            StdLayout::L5_0 => vec![FL, FR, FC, BL, BR],
            StdLayout::L5_1 => vec![FL, FR, FC, LFE, BL, BR],
            StdLayout::L7_0 => vec![FL, FR, FC, BL, BR, SL, SR],
            StdLayout::L7_1 => vec![FL, FR, FC, LFE, BL, BR, SL, SR],
        };
        ChannelLayout::new(channels)
    }

    /// Number of speakers excluding the LFE
    pub fn main_channels(&self) -> usize {
        let layout = self.layout();
        layout.count() - usize::from(layout.has_lfe())
    }
}

impl From<StdLayout> for ChannelLayout {
    fn from(std: StdLayout) -> Self {
        std.layout()
    }
}

/// Full description of an audio format
///
/// `frames` is the period: the number of frames one buffer of this format
/// holds. It is zero on formats requested by producers and filled in during
/// negotiation.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFormat {
    pub sample_format: SampleFormat,
    pub planar: bool,
    pub sample_rate: u32,
    pub layout: ChannelLayout,
    pub frames: usize,
}

impl AudioFormat {
    /// Interleaved PCM as a producer would deliver it
    pub fn pcm(sample_format: SampleFormat, sample_rate: u32, layout: ChannelLayout) -> Self {
        Self {
            sample_format,
            planar: false,
            sample_rate,
            layout,
            frames: 0,
        }
    }

    /// Planar float, the representation used inside the pipeline
    pub fn internal(sample_rate: u32, layout: ChannelLayout, frames: usize) -> Self {
        Self {
            sample_format: SampleFormat::F32,
            planar: true,
            sample_rate,
            layout,
            frames,
        }
    }

    /// IEC-packed bitstream
    pub fn raw(codec: RawCodec, sample_rate: u32) -> Self {
        Self {
            sample_format: SampleFormat::Raw(codec),
            planar: false,
            sample_rate,
            layout: ChannelLayout::stereo(),
            frames: 0,
        }
    }

    pub fn with_frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    pub fn with_planar(mut self, planar: bool) -> Self {
        self.planar = planar;
        self
    }

    pub fn channels(&self) -> usize {
        self.layout.count()
    }

    pub fn is_raw(&self) -> bool {
        self.sample_format.is_raw()
    }

    /// Number of sample planes a packet of this format carries
    pub fn planes(&self) -> usize {
        if self.planar {
            self.channels()
        } else {
            1
        }
    }

    /// Bytes per frame across all channels
    pub fn frame_size(&self) -> usize {
        self.sample_format.bytes_per_sample() * self.channels()
    }

    /// Duration of `frames` frames in milliseconds
    pub fn frames_to_ms(&self, frames: usize) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        frames as f64 * 1000.0 / self.sample_rate as f64
    }

    /// Number of frames covering `ms` milliseconds (rounded down)
    pub fn ms_to_frames(&self, ms: f64) -> usize {
        (ms.max(0.0) * self.sample_rate as f64 / 1000.0) as usize
    }

    /// Same representation, rate and layout; the period is ignored
    pub fn same_config(&self, other: &AudioFormat) -> bool {
        self.sample_format == other.sample_format
            && self.planar == other.planar
            && self.sample_rate == other.sample_rate
            && self.layout == other.layout
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}{} {}Hz {} ({} frames)",
            self.sample_format,
            if self.planar { "P" } else { "" },
            self.sample_rate,
            self.layout,
            self.frames
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_keeps_target_order() {
        let source = StdLayout::L5_1.layout();
        let target = StdLayout::L5_1.layout();
        assert_eq!(source.resolve(&target), target);
    }

    #[test]
    fn test_resolve_side_to_back() {
        use Channel::*;
        let source = ChannelLayout::new(vec![FL, FR, FC, LFE, SL, SR]);
        let resolved = source.resolve(&StdLayout::L5_1.layout());
        assert_eq!(resolved.channels(), &[FL, FR, FC, LFE, BL, BR]);
    }

    #[test]
    fn test_resolve_drops_lfe_when_missing() {
        let source = StdLayout::L5_1.layout();
        let resolved = source.resolve(&StdLayout::L5_0.layout());
        assert!(!resolved.has_lfe());
        assert_eq!(resolved.count(), 5);
    }

    #[test]
    fn test_resolve_mono_becomes_stereo() {
        let resolved = ChannelLayout::mono().resolve(&StdLayout::L2_0.layout());
        assert_eq!(resolved, ChannelLayout::stereo());
    }

    #[test]
    fn test_format_sizes() {
        let fmt = AudioFormat::pcm(SampleFormat::S16, 44100, ChannelLayout::stereo());
        assert_eq!(fmt.frame_size(), 4);
        assert_eq!(fmt.planes(), 1);

        let internal = AudioFormat::internal(48000, StdLayout::L5_1.layout(), 480);
        assert_eq!(internal.planes(), 6);
        assert!((internal.frames_to_ms(480) - 10.0).abs() < 1e-9);
        assert_eq!(internal.ms_to_frames(10.0), 480);
    }

    #[test]
    fn test_std_layout_main_channels() {
        assert_eq!(StdLayout::L5_1.main_channels(), 5);
        assert_eq!(StdLayout::L2_0.main_channels(), 2);
    }
}
