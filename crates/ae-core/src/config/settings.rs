//! Engine settings

use serde::{Deserialize, Serialize};

use crate::resample::ResampleQuality;
use crate::stream::SyncTuning;
use crate::types::{RawCodec, StdLayout};

/// How the output format follows the content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigMode {
    /// Always open the device with the configured layout and rate
    Fixed,
    /// Follow the content, up to the configured layout
    #[default]
    Auto,
    /// Follow the content exactly where the device allows
    Match,
}

/// When GUI sounds are played
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoundMode {
    Off,
    /// Only while no stream is playing
    #[default]
    Idle,
    Always,
}

/// Bitstream output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassthroughSettings {
    pub enabled: bool,
    /// Device used for bitstream output
    pub device: String,
    pub ac3: bool,
    pub eac3: bool,
    pub truehd: bool,
    pub dts: bool,
    pub dtshd: bool,
    /// Encode multichannel PCM to AC3 when the device cannot take it
    pub ac3_transcode: bool,
}

impl Default for PassthroughSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            device: "default".to_string(),
            ac3: true,
            eac3: false,
            truehd: false,
            dts: true,
            dtshd: false,
            ac3_transcode: false,
        }
    }
}

impl PassthroughSettings {
    /// Whether bitstream output of `codec` is allowed
    pub fn allows(&self, codec: RawCodec) -> bool {
        self.enabled
            && match codec {
                RawCodec::Ac3 => self.ac3,
                RawCodec::Eac3 => self.eac3,
                RawCodec::TrueHd => self.truehd,
                RawCodec::Dts => self.dts,
                RawCodec::DtsHd => self.dtshd,
            }
    }
}

/// Buffer sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferingSettings {
    /// Audio kept ready per stream, in seconds
    pub max_cache_level_s: f64,
    /// Audio queued towards the sink before mixing pauses, in seconds
    pub max_water_level_s: f64,
    /// Upper bound of one sink buffer
    pub max_sink_buffer_ms: u32,
}

impl Default for BufferingSettings {
    fn default() -> Self {
        Self {
            max_cache_level_s: 0.5,
            max_water_level_s: 0.25,
            max_sink_buffer_ms: 80,
        }
    }
}

/// Everything the engine can be configured with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Output device as `driver:device`
    pub device: String,
    pub passthrough: PassthroughSettings,
    pub config_mode: ConfigMode,
    /// Largest (auto) or exact (fixed) speaker layout
    pub channels: StdLayout,
    /// Output rate in fixed mode
    pub sample_rate: u32,
    pub stereo_upmix: bool,
    pub normalize_levels: bool,
    pub resample_quality: ResampleQuality,
    /// Relative drift above which corrections go through the tempo filter
    pub atempo_threshold: f64,
    /// Keep the device fed with silence this long after playback stops while focused
    pub silence_timeout_s: u32,
    /// Use faint noise instead of digital silence to keep receivers awake
    pub stream_noise: bool,
    pub gui_sound_mode: SoundMode,
    pub buffering: BufferingSettings,
    pub sync: SyncTuning,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            device: "default".to_string(),
            passthrough: PassthroughSettings::default(),
            config_mode: ConfigMode::Auto,
            channels: StdLayout::L2_0,
            sample_rate: crate::types::DEFAULT_SAMPLE_RATE,
            stereo_upmix: false,
            normalize_levels: true,
            resample_quality: ResampleQuality::Medium,
            atempo_threshold: 0.02,
            silence_timeout_s: 60,
            stream_noise: true,
            gui_sound_mode: SoundMode::Idle,
            buffering: BufferingSettings::default(),
            sync: SyncTuning::default(),
        }
    }
}

impl AudioSettings {
    /// Whether changing from `self` to `other` requires reopening the sink
    pub fn needs_reconfigure(&self, other: &AudioSettings) -> bool {
        self.device != other.device
            || self.passthrough != other.passthrough
            || self.config_mode != other.config_mode
            || self.channels != other.channels
            || self.sample_rate != other.sample_rate
            || self.stereo_upmix != other.stereo_upmix
            || self.buffering != other.buffering
    }

    /// Whether resamplers have to be rebuilt for `other`
    pub fn resampler_changed(&self, other: &AudioSettings) -> bool {
        self.resample_quality != other.resample_quality
            || self.stereo_upmix != other.stereo_upmix
            || self.normalize_levels != other.normalize_levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_allows_enabled_codecs_only() {
        let mut pt = PassthroughSettings::default();
        assert!(!pt.allows(RawCodec::Ac3));
        pt.enabled = true;
        assert!(pt.allows(RawCodec::Ac3));
        assert!(!pt.allows(RawCodec::TrueHd));
    }

    #[test]
    fn test_reconfigure_detection() {
        let a = AudioSettings::default();
        let mut b = a.clone();
        b.resample_quality = ResampleQuality::High;
        assert!(!a.needs_reconfigure(&b));
        assert!(a.resampler_changed(&b));

        b.channels = StdLayout::L5_1;
        assert!(a.needs_reconfigure(&b));
    }
}
