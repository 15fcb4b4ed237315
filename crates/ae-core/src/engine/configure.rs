//! Output format negotiation
//!
//! Pure functions the engine runs in `configure`: pick the format to ask
//! the sink for, decide the operating mode and size the pools.

use crate::config::{AudioSettings, ConfigMode};
use crate::types::{AudioFormat, ChannelLayout, RawCodec, SampleFormat, StdLayout, DEFAULT_SAMPLE_RATE, RAW_SAMPLE_RATE};

/// How mixed audio reaches the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Streams are mixed as planar float
    #[default]
    Pcm,
    /// One bitstream stream is passed through untouched
    Raw,
    /// Mixed PCM is encoded to a bitstream
    Transcode,
}

/// Engine state the negotiation depends on
#[derive(Debug, Clone, Default)]
pub struct FormatContext {
    pub has_streams: bool,
    /// Audio currently queued towards the sink, in seconds
    pub water_level: f64,
    /// Layout the engine mixes in right now
    pub internal_layout: Option<ChannelLayout>,
    /// An encoder is installed
    pub can_transcode: bool,
}

/// Format to request from the sink for content in `format`
pub fn apply_settings_to_format(
    format: &AudioFormat,
    settings: &AudioSettings,
    ctx: &FormatContext,
) -> (AudioFormat, OutputMode) {
    let mut format = format.clone();

    if format.is_raw() {
        return (format, OutputMode::Raw);
    }

    let pt = &settings.passthrough;
    if settings.channels == StdLayout::L2_0
        && pt.enabled
        && pt.ac3
        && pt.ac3_transcode
        && ctx.can_transcode
        && ctx.has_streams
        && (format.channels() > 2 || settings.stereo_upmix)
    {
        let mut raw = AudioFormat::raw(RawCodec::Ac3, RAW_SAMPLE_RATE);
        raw.frames = format.frames;
        return (raw, OutputMode::Transcode);
    }

    format.sample_format = SampleFormat::F32;
    format.planar = true;

    if format.channels() > 2 || settings.stereo_upmix || settings.config_mode == ConfigMode::Fixed {
        let std = settings.channels.layout();
        if settings.config_mode == ConfigMode::Fixed || (settings.stereo_upmix && format.channels() <= 2) {
            format.layout = std;
        } else {
            format.layout = format.layout.resolve(&std);
        }
    } else if settings.config_mode == ConfigMode::Auto && ctx.water_level > 0.0 {
        // don't fall back from multichannel to stereo while audio is queued
        if let Some(layout) = ctx.internal_layout.as_ref().filter(|l| l.count() > 2) {
            format.layout = layout.clone();
        }
    }

    if settings.config_mode == ConfigMode::Fixed {
        format.sample_rate = settings.sample_rate;
    }

    if format.channels() < 2 {
        format.layout = ChannelLayout::stereo();
    }

    (format, OutputMode::Pcm)
}

/// Format the engine is driven by
///
/// `desired` wins (a slave stream taking over), several streams keep the
/// previous format, otherwise the first stream decides.
pub fn select_input_format(
    first_stream: Option<&AudioFormat>,
    stream_count: usize,
    desired: Option<&AudioFormat>,
    previous: Option<&AudioFormat>,
) -> AudioFormat {
    let Some(first) = first_stream else {
        return AudioFormat::internal(DEFAULT_SAMPLE_RATE, ChannelLayout::stereo(), 0);
    };
    if let Some(desired) = desired {
        return desired.clone();
    }
    if stream_count > 1 {
        if let Some(previous) = previous {
            return previous.clone();
        }
    }
    first.clone()
}

/// Cap the period the sink reported at `max_ms`
pub fn cap_period(format: &mut AudioFormat, max_ms: u32) {
    let max_frames = (max_ms as usize * format.sample_rate as usize / 1000).max(1);
    if format.frames == 0 || format.frames > max_frames {
        if format.frames != 0 {
            log::warn!(
                "Engine: sink period of {:.0} ms too large, reducing to {} ms",
                format.frames_to_ms(format.frames),
                max_ms
            );
        }
        format.frames = max_frames;
    }
}

/// Input buffer size lining up with one output period
pub fn aligned_input_frames(input_rate: u32, output: &AudioFormat) -> usize {
    if output.sample_rate == 0 {
        return output.frames.max(1);
    }
    let frames = output.frames as u64 * input_rate as u64 / output.sample_rate as u64;
    (frames as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Channel;

    fn pcm(layout: ChannelLayout, rate: u32) -> AudioFormat {
        AudioFormat::pcm(SampleFormat::S16, rate, layout)
    }

    #[test]
    fn test_stereo_content_stays_stereo() {
        let settings = AudioSettings::default();
        let (fmt, mode) = apply_settings_to_format(&pcm(ChannelLayout::stereo(), 44100), &settings, &FormatContext::default());
        assert_eq!(mode, OutputMode::Pcm);
        assert_eq!(fmt.sample_format, SampleFormat::F32);
        assert!(fmt.planar);
        assert_eq!(fmt.sample_rate, 44100);
        assert_eq!(fmt.layout, ChannelLayout::stereo());
    }

    #[test]
    fn test_multichannel_resolved_against_setting() {
        let mut settings = AudioSettings::default();
        settings.channels = StdLayout::L5_0;
        let (fmt, _) = apply_settings_to_format(&pcm(StdLayout::L5_1.layout(), 48000), &settings, &FormatContext::default());
        assert_eq!(fmt.channels(), 5);
        assert!(!fmt.layout.has_lfe());
    }

    #[test]
    fn test_fixed_mode_forces_layout_and_rate() {
        let mut settings = AudioSettings::default();
        settings.config_mode = ConfigMode::Fixed;
        settings.channels = StdLayout::L5_1;
        settings.sample_rate = 96000;
        let (fmt, _) = apply_settings_to_format(&pcm(ChannelLayout::stereo(), 44100), &settings, &FormatContext::default());
        assert_eq!(fmt.layout, StdLayout::L5_1.layout());
        assert_eq!(fmt.sample_rate, 96000);
    }

    #[test]
    fn test_upmix_uses_full_layout() {
        let mut settings = AudioSettings::default();
        settings.stereo_upmix = true;
        settings.channels = StdLayout::L7_1;
        let (fmt, _) = apply_settings_to_format(&pcm(ChannelLayout::stereo(), 48000), &settings, &FormatContext::default());
        assert_eq!(fmt.channels(), 8);
    }

    #[test]
    fn test_mono_becomes_stereo() {
        let (fmt, _) = apply_settings_to_format(
            &pcm(ChannelLayout::new(vec![Channel::FC]), 48000),
            &AudioSettings::default(),
            &FormatContext::default(),
        );
        assert_eq!(fmt.channels(), 2);
    }

    #[test]
    fn test_auto_keeps_multichannel_while_playing() {
        let ctx = FormatContext {
            has_streams: true,
            water_level: 0.1,
            internal_layout: Some(StdLayout::L5_1.layout()),
            can_transcode: false,
        };
        let (fmt, _) = apply_settings_to_format(&pcm(ChannelLayout::stereo(), 48000), &AudioSettings::default(), &ctx);
        assert_eq!(fmt.channels(), 6);
    }

    #[test]
    fn test_raw_is_passthrough() {
        let (fmt, mode) = apply_settings_to_format(
            &AudioFormat::raw(RawCodec::Dts, 48000),
            &AudioSettings::default(),
            &FormatContext::default(),
        );
        assert_eq!(mode, OutputMode::Raw);
        assert!(fmt.is_raw());
    }

    #[test]
    fn test_transcode_needs_encoder() {
        let mut settings = AudioSettings::default();
        settings.passthrough.enabled = true;
        settings.passthrough.ac3_transcode = true;
        let mut ctx = FormatContext {
            has_streams: true,
            ..Default::default()
        };
        let content = pcm(StdLayout::L5_1.layout(), 48000);

        let (_, mode) = apply_settings_to_format(&content, &settings, &ctx);
        assert_eq!(mode, OutputMode::Pcm);

        ctx.can_transcode = true;
        let (fmt, mode) = apply_settings_to_format(&content, &settings, &ctx);
        assert_eq!(mode, OutputMode::Transcode);
        assert_eq!(fmt.sample_format, SampleFormat::Raw(RawCodec::Ac3));
    }

    #[test]
    fn test_input_format_selection() {
        let a = pcm(ChannelLayout::stereo(), 44100);
        let b = pcm(StdLayout::L5_1.layout(), 48000);
        assert_eq!(select_input_format(None, 0, None, None).sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(select_input_format(Some(&a), 1, None, Some(&b)), a);
        assert_eq!(select_input_format(Some(&a), 2, None, Some(&b)), b);
        assert_eq!(select_input_format(Some(&a), 2, Some(&a), Some(&b)), a);
    }

    #[test]
    fn test_period_cap_and_alignment() {
        let mut fmt = AudioFormat::internal(48000, ChannelLayout::stereo(), 9600);
        cap_period(&mut fmt, 80);
        assert_eq!(fmt.frames, 3840);
        assert_eq!(aligned_input_frames(44100, &fmt), 3528);
    }
}
