//! rubato-backed resampler

use ::rubato::{
    FastFixedIn, PolynomialDegree, Resampler as _, SincFixedIn, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};

use super::{RemapMatrix, ResampleConfig, ResampleQuality, Resampler};
use crate::buffer::StageInput;
use crate::buffer::SamplePacket;
use crate::error::{AeError, AeResult};
use crate::types::Sample;

/// Frames handed to the converter per call
const CHUNK_FRAMES: usize = 256;

/// Largest ratio correction the converter accepts in either direction
const MAX_RELATIVE_RATIO: f64 = 2.0;

/// Concrete rubato converter for the configured quality
enum Converter {
    Fast(FastFixedIn<Sample>),
    Sinc(Box<SincFixedIn<Sample>>),
}

impl Converter {
    fn new(quality: ResampleQuality, ratio: f64, channels: usize) -> AeResult<Self> {
        let converter = match quality {
            ResampleQuality::Low | ResampleQuality::Medium => {
                let degree = if quality == ResampleQuality::Low {
                    PolynomialDegree::Linear
                } else {
                    PolynomialDegree::Cubic
                };
                FastFixedIn::new(ratio, MAX_RELATIVE_RATIO, degree, CHUNK_FRAMES, channels)
                    .map(Converter::Fast)
            }
            ResampleQuality::High => {
                let params = SincInterpolationParameters {
                    sinc_len: 256,
                    f_cutoff: 0.95,
                    interpolation: SincInterpolationType::Linear,
                    oversampling_factor: 256,
                    window: WindowFunction::BlackmanHarris2,
                };
                SincFixedIn::new(ratio, MAX_RELATIVE_RATIO, params, CHUNK_FRAMES, channels)
                    .map(|c| Converter::Sinc(Box::new(c)))
            }
        };
        converter.map_err(|e| AeError::Resampler(e.to_string()))
    }

    fn input_frames_next(&self) -> usize {
        match self {
            Converter::Fast(c) => c.input_frames_next(),
            Converter::Sinc(c) => c.input_frames_next(),
        }
    }

    fn output_frames_max(&self) -> usize {
        match self {
            Converter::Fast(c) => c.output_frames_max(),
            Converter::Sinc(c) => c.output_frames_max(),
        }
    }

    fn output_delay(&self) -> usize {
        match self {
            Converter::Fast(c) => c.output_delay(),
            Converter::Sinc(c) => c.output_delay(),
        }
    }

    fn set_ratio_relative(&mut self, ratio: f64) -> AeResult<()> {
        let result = match self {
            Converter::Fast(c) => c.set_resample_ratio_relative(ratio, true),
            Converter::Sinc(c) => c.set_resample_ratio_relative(ratio, true),
        };
        result.map_err(|e| AeError::Resampler(e.to_string()))
    }

    fn process(
        &mut self,
        input: Option<&[&[Sample]]>,
        output: &mut [Vec<Sample>],
    ) -> AeResult<(usize, usize)> {
        let result = match (self, input) {
            (Converter::Fast(c), Some(input)) => c.process_into_buffer(input, output, None),
            (Converter::Sinc(c), Some(input)) => c.process_into_buffer(input, output, None),
            (Converter::Fast(c), None) => c.process_partial_into_buffer(None::<&[&[Sample]]>, output, None),
            (Converter::Sinc(c), None) => c.process_partial_into_buffer(None::<&[&[Sample]]>, output, None),
        };
        result.map_err(|e| AeError::Resampler(e.to_string()))
    }
}

/// Remaps channels, then converts the rate with rubato
///
/// The converter is only instantiated when the rates differ or a ratio
/// correction is requested; otherwise remapped frames are passed through.
/// The converter's own filter latency is trimmed from the start of the
/// output and made up with a zero tail when flushing, so the total output
/// length matches the input duration.
#[derive(Default)]
pub struct RubatoResampler {
    config: Option<ResampleConfig>,
    matrix: Option<RemapMatrix>,
    converter: Option<Converter>,
    ratio: f64,
    /// Remapped frames waiting for a full converter chunk
    pending_in: Vec<Vec<Sample>>,
    /// Converted frames not yet copied into a packet
    pending_out: Vec<Vec<Sample>>,
    scratch: Vec<Vec<Sample>>,
    /// Leading converter output still to drop
    skip_out: usize,
    /// Output frames the input fed so far should turn into
    expected_out: f64,
    frames_out: u64,
}

impl RubatoResampler {
    fn config(&self) -> AeResult<&ResampleConfig> {
        self.config
            .as_ref()
            .ok_or_else(|| AeError::Resampler("resampler not initialized".into()))
    }

    fn base_ratio(&self) -> AeResult<f64> {
        let config = self.config()?;
        Ok(config.output.sample_rate as f64 / config.input.sample_rate as f64)
    }

    fn out_channels(&self) -> usize {
        self.pending_out.len()
    }

    fn pending_in_frames(&self) -> usize {
        self.pending_in.first().map_or(0, |p| p.len())
    }

    fn pending_out_frames(&self) -> usize {
        self.pending_out.first().map_or(0, |p| p.len())
    }

    fn ensure_converter(&mut self, ratio: f64) -> AeResult<()> {
        let base = self.base_ratio()?;
        if self.converter.is_none() {
            if base == 1.0 && ratio == 1.0 {
                return Ok(());
            }
            let quality = self.config()?.quality;
            let converter = Converter::new(quality, base, self.out_channels())?;
            self.skip_out = converter.output_delay();
            self.scratch = vec![vec![0.0; converter.output_frames_max()]; self.out_channels()];
            self.converter = Some(converter);
            self.ratio = 1.0;
        }
        if ratio != self.ratio {
            if let Some(converter) = self.converter.as_mut() {
                converter.set_ratio_relative(ratio)?;
            }
            self.ratio = ratio;
        }
        Ok(())
    }

    /// Move converted frames from scratch to `pending_out`, trimming latency
    fn collect_output(&mut self, produced: usize) {
        let skip = self.skip_out.min(produced);
        self.skip_out -= skip;
        for (out, scratch) in self.pending_out.iter_mut().zip(self.scratch.iter()) {
            out.extend_from_slice(&scratch[skip..produced]);
        }
        self.frames_out += (produced - skip) as u64;
    }

    /// Run every complete chunk through the converter
    fn convert_pending(&mut self) -> AeResult<()> {
        if self.converter.is_none() {
            self.frames_out += self.pending_in_frames() as u64;
            for (out, pending) in self.pending_out.iter_mut().zip(self.pending_in.iter_mut()) {
                out.append(pending);
            }
            return Ok(());
        }

        loop {
            let Some(converter) = self.converter.as_mut() else {
                return Ok(());
            };
            let need = converter.input_frames_next();
            if self.pending_in.first().map_or(0, |p| p.len()) < need {
                return Ok(());
            }
            let input: Vec<&[Sample]> = self.pending_in.iter().map(|p| &p[..need]).collect();
            let (used, produced) = converter.process(Some(input.as_slice()), &mut self.scratch)?;
            for pending in self.pending_in.iter_mut() {
                pending.drain(..used);
            }
            self.collect_output(produced);
        }
    }

    /// Push out everything still inside the converter
    fn flush_converter(&mut self) -> AeResult<()> {
        let expected = self.expected_out.round() as u64;

        if self.pending_in_frames() > 0 {
            if let Some(converter) = self.converter.as_mut() {
                let input: Vec<&[Sample]> = self.pending_in.iter().map(|p| p.as_slice()).collect();
                let result = match converter {
                    Converter::Fast(c) => {
                        c.process_partial_into_buffer(Some(input.as_slice()), &mut self.scratch, None)
                    }
                    Converter::Sinc(c) => {
                        c.process_partial_into_buffer(Some(input.as_slice()), &mut self.scratch, None)
                    }
                };
                let (_, produced) = result.map_err(|e| AeError::Resampler(e.to_string()))?;
                for pending in self.pending_in.iter_mut() {
                    pending.clear();
                }
                self.collect_output(produced);
            }
        }

        // Zero chunks until the tail held inside the filter has come out
        let mut rounds = 0;
        while self.frames_out < expected && rounds < 64 {
            let Some(converter) = self.converter.as_mut() else {
                break;
            };
            let (_, produced) = converter.process(None, &mut self.scratch)?;
            if produced == 0 {
                break;
            }
            self.collect_output(produced);
            rounds += 1;
        }

        if self.frames_out > expected {
            let excess = (self.frames_out - expected) as usize;
            let keep = self.pending_out_frames().saturating_sub(excess);
            for out in self.pending_out.iter_mut() {
                out.truncate(keep);
            }
        }

        // Next stream segment starts fresh
        self.converter = None;
        self.ratio = 1.0;
        self.expected_out = 0.0;
        self.frames_out = 0;
        Ok(())
    }
}

impl Resampler for RubatoResampler {
    fn init(&mut self, config: &ResampleConfig) -> AeResult<()> {
        if config.input.is_raw() || config.output.is_raw() {
            return Err(AeError::Resampler("bitstream formats cannot be resampled".into()));
        }
        if config.input.sample_rate == 0 || config.output.sample_rate == 0 {
            return Err(AeError::Resampler("sample rate must be non-zero".into()));
        }

        let matrix = RemapMatrix::build(
            &config.input.layout,
            &config.output.layout,
            config.upmix,
            config.normalize,
            config.centre_mix_level,
        );
        let channels = matrix.output_channels();

        self.matrix = Some(matrix);
        self.config = Some(config.clone());
        self.converter = None;
        self.ratio = 1.0;
        self.pending_in = vec![Vec::new(); channels];
        self.pending_out = vec![Vec::new(); channels];
        self.scratch = Vec::new();
        self.skip_out = 0;
        self.expected_out = 0.0;
        self.frames_out = 0;

        log::debug!(
            "Resampler: {} -> {} ({:?})",
            config.input,
            config.output,
            config.quality
        );
        Ok(())
    }

    fn resample(
        &mut self,
        dst: &mut SamplePacket,
        max_out: usize,
        input: StageInput<'_>,
        ratio: f64,
    ) -> AeResult<usize> {
        let ratio = ratio.clamp(1.0 / MAX_RELATIVE_RATIO, MAX_RELATIVE_RATIO);

        match input {
            StageInput::Data(src) => {
                if !src.is_float_planar() || dst.planes() != self.out_channels() {
                    return Err(AeError::Resampler("packet layout mismatch".into()));
                }
                self.ensure_converter(ratio)?;
                let matrix = self
                    .matrix
                    .as_ref()
                    .ok_or_else(|| AeError::Resampler("resampler not initialized".into()))?;
                let planes: Vec<&[Sample]> = (0..src.planes()).map(|p| src.plane(p)).collect();
                matrix.apply(&planes, src.nb_samples, &mut self.pending_in);
                self.expected_out += src.nb_samples as f64 * self.base_ratio()? * self.ratio;
                self.convert_pending()?;
            }
            StageInput::Pending => {}
            StageInput::Flush => {
                if self.converter.is_some() {
                    self.flush_converter()?;
                } else {
                    self.convert_pending()?;
                }
            }
        }

        let count = max_out.min(self.pending_out_frames()).min(dst.free_samples());
        if count == 0 {
            return Ok(0);
        }
        let start = dst.nb_samples;
        for (plane, pending) in dst.planes_mut().zip(self.pending_out.iter_mut()) {
            plane[start..start + count].copy_from_slice(&pending[..count]);
            pending.drain(..count);
        }
        Ok(count)
    }

    fn delay(&self) -> f64 {
        let Some(config) = self.config.as_ref() else {
            return 0.0;
        };
        let in_rate = config.input.sample_rate as f64;
        let out_rate = config.output.sample_rate as f64;
        let latency = self.converter.as_ref().map_or(0, |c| c.output_delay());
        self.pending_in_frames() as f64 / in_rate
            + (self.pending_out_frames() + latency) as f64 / out_rate
    }

    fn buffered_samples(&self) -> usize {
        let Some(config) = self.config.as_ref() else {
            return 0;
        };
        let scale = config.output.sample_rate as f64 / config.input.sample_rate as f64;
        let latency = self.converter.as_ref().map_or(0, |c| c.output_delay());
        (self.pending_in_frames() as f64 * scale).round() as usize
            + self.pending_out_frames()
            + latency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AudioFormat, ChannelLayout};

    fn config(in_rate: u32, out_rate: u32) -> ResampleConfig {
        ResampleConfig {
            input: AudioFormat::internal(in_rate, ChannelLayout::stereo(), 1024),
            output: AudioFormat::internal(out_rate, ChannelLayout::stereo(), 1024),
            quality: ResampleQuality::Medium,
            upmix: false,
            normalize: true,
            centre_mix_level: None,
        }
    }

    fn run_through(resampler: &mut RubatoResampler, cfg: &ResampleConfig, frames: usize, value: f32) -> Vec<f32> {
        let mut src = SamplePacket::new(&cfg.input, frames);
        for plane in src.planes_mut() {
            plane.fill(value);
        }
        src.nb_samples = frames;

        let mut out = Vec::new();
        let mut dst = SamplePacket::new(&cfg.output, 1024);
        let n = resampler.resample(&mut dst, 1024, StageInput::Data(&src), 1.0).unwrap();
        out.extend_from_slice(&dst.plane(0)[..n]);
        loop {
            dst.clear();
            let n = resampler.resample(&mut dst, 1024, StageInput::Flush, 1.0).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&dst.plane(0)[..n]);
        }
        out
    }

    #[test]
    fn test_same_rate_is_passthrough() {
        let cfg = config(48000, 48000);
        let mut r = RubatoResampler::default();
        r.init(&cfg).unwrap();
        let out = run_through(&mut r, &cfg, 1000, 0.25);
        assert_eq!(out.len(), 1000);
        assert!(out.iter().all(|&s| s == 0.25));
        assert_eq!(r.buffered_samples(), 0);
    }

    #[test]
    fn test_rate_conversion_length() {
        let cfg = config(48000, 44100);
        let mut r = RubatoResampler::default();
        r.init(&cfg).unwrap();
        let out = run_through(&mut r, &cfg, 4800, 0.0);
        assert!((out.len() as i64 - 4410).abs() <= 2, "got {}", out.len());
    }

    #[test]
    fn test_rejects_bitstream() {
        let mut cfg = config(48000, 48000);
        cfg.input = AudioFormat::raw(crate::types::RawCodec::Ac3, 48000);
        let mut r = RubatoResampler::default();
        assert!(r.init(&cfg).is_err());
    }
}
