//! Time-stretching via signalsmith-stretch

use signalsmith_stretch::Stretch;

use super::{TempoFilter, MAX_TEMPO, MIN_TEMPO};
use crate::buffer::{SamplePacket, StageInput};
use crate::error::{AeError, AeResult};
use crate::types::{AudioFormat, Sample};

/// Tempo filter backed by signalsmith-stretch
///
/// The stretch ratio is given implicitly by the ratio of input to output
/// length on each call, so the filter only has to size its output. A
/// fractional remainder is carried between calls to keep the long-run
/// output length exact.
#[derive(Default)]
pub struct TimeStretcher {
    stretcher: Option<Stretch>,
    channels: usize,
    sample_rate: u32,
    tempo: f64,
    /// Interleaved scratch buffers handed to the library
    input: Vec<Sample>,
    output: Vec<Sample>,
    /// Stretched frames not yet handed out, per channel
    pending: Vec<Vec<Sample>>,
    out_frac: f64,
    /// Input went in since the last flush
    fed: bool,
}

impl TimeStretcher {
    /// Frames the library holds back before output catches up
    pub fn output_latency(&self) -> usize {
        self.stretcher.as_ref().map_or(0, |s| s.output_latency())
    }

    pub fn input_latency(&self) -> usize {
        self.stretcher.as_ref().map_or(0, |s| s.input_latency())
    }

    fn append_output(&mut self, frames: usize) {
        let channels = self.channels;
        for (c, plane) in self.pending.iter_mut().enumerate() {
            plane.extend((0..frames).map(|f| self.output[f * channels + c]));
        }
    }

    fn pending_frames(&self) -> usize {
        self.pending.first().map_or(0, |p| p.len())
    }
}

impl TempoFilter for TimeStretcher {
    fn init(&mut self, format: &AudioFormat, tempo: f64) -> AeResult<()> {
        if !format.planar || format.is_raw() {
            return Err(AeError::TempoFilter(format!("unsupported format {}", format)));
        }
        let channels = format.channels();
        if channels == 0 || format.sample_rate == 0 {
            return Err(AeError::TempoFilter(format!("invalid format {}", format)));
        }

        self.stretcher = Some(Stretch::preset_default(channels as u32, format.sample_rate));
        self.channels = channels;
        self.sample_rate = format.sample_rate;
        self.tempo = tempo.clamp(MIN_TEMPO, MAX_TEMPO);
        self.pending = vec![Vec::new(); channels];
        self.out_frac = 0.0;
        self.fed = false;
        Ok(())
    }

    fn set_tempo(&mut self, tempo: f64) {
        self.tempo = tempo.clamp(MIN_TEMPO, MAX_TEMPO);
    }

    fn tempo(&self) -> f64 {
        self.tempo
    }

    fn process(
        &mut self,
        dst: &mut SamplePacket,
        max_out: usize,
        input: StageInput<'_>,
    ) -> AeResult<usize> {
        let Some(stretcher) = self.stretcher.as_mut() else {
            return Err(AeError::TempoFilter("not initialized".into()));
        };
        let channels = self.channels;

        match input {
            StageInput::Data(pkt) => {
                if pkt.channels() != channels || !pkt.is_float_planar() {
                    return Err(AeError::TempoFilter("input format changed".into()));
                }
                let frames = pkt.nb_samples;
                self.input.clear();
                self.input.reserve(frames * channels);
                for f in 0..frames {
                    for c in 0..channels {
                        self.input.push(pkt.plane(c)[f]);
                    }
                }

                let exact = frames as f64 / self.tempo + self.out_frac;
                let out_frames = exact.floor() as usize;
                self.out_frac = exact - out_frames as f64;

                self.output.clear();
                self.output.resize(out_frames * channels, 0.0);
                stretcher.process(&self.input[..], &mut self.output[..]);
                self.fed = true;
                self.append_output(out_frames);
            }
            StageInput::Flush if self.fed => {
                let tail = stretcher.output_latency();
                self.output.clear();
                self.output.resize(tail * channels, 0.0);
                stretcher.flush(&mut self.output[..]);
                stretcher.reset();
                self.fed = false;
                self.out_frac = 0.0;
                self.append_output(tail);
            }
            StageInput::Flush | StageInput::Pending => {}
        }

        let start = dst.nb_samples;
        let n = max_out.min(dst.free_samples()).min(self.pending_frames());
        for (c, plane) in self.pending.iter_mut().enumerate() {
            dst.plane_mut(c)[start..start + n].copy_from_slice(&plane[..n]);
            plane.drain(..n);
        }
        Ok(n)
    }

    fn buffered_frames(&self) -> usize {
        let inside = if self.fed { self.output_latency() } else { 0 };
        self.pending_frames() + inside
    }

    fn delay(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.buffered_frames() as f64 / self.sample_rate as f64
    }

    fn is_eof(&self) -> bool {
        self.buffered_frames() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelLayout;

    fn format() -> AudioFormat {
        AudioFormat::internal(48000, ChannelLayout::stereo(), 1024)
    }

    #[test]
    fn test_stretcher_creation() {
        let mut stretcher = TimeStretcher::default();
        stretcher.init(&format(), 1.0).unwrap();
        assert_eq!(stretcher.tempo(), 1.0);
        assert!(stretcher.input_latency() > 0);
        assert!(stretcher.output_latency() > 0);
        assert!(stretcher.is_eof());
    }

    #[test]
    fn test_tempo_clamped() {
        let mut stretcher = TimeStretcher::default();
        stretcher.init(&format(), 3.0).unwrap();
        assert_eq!(stretcher.tempo(), MAX_TEMPO);
        stretcher.set_tempo(0.1);
        assert_eq!(stretcher.tempo(), MIN_TEMPO);
    }

    #[test]
    fn test_faster_tempo_shortens_output() {
        let fmt = format();
        let mut stretcher = TimeStretcher::default();
        stretcher.init(&fmt, 1.25).unwrap();

        let mut src = SamplePacket::new(&fmt, 1000);
        src.nb_samples = 1000;
        let mut dst = SamplePacket::new(&fmt, 4096);
        let n = stretcher.process(&mut dst, 4096, StageInput::Data(&src)).unwrap();
        assert_eq!(n, 800);
        assert!(!stretcher.is_eof());

        dst.nb_samples = 0;
        stretcher.process(&mut dst, 4096, StageInput::Flush).unwrap();
        assert!(stretcher.is_eof());
    }

    #[test]
    fn test_output_limited_by_max_out() {
        let fmt = format();
        let mut stretcher = TimeStretcher::default();
        stretcher.init(&fmt, 0.5).unwrap();

        let mut src = SamplePacket::new(&fmt, 512);
        src.nb_samples = 512;
        let mut dst = SamplePacket::new(&fmt, 2048);
        let n = stretcher.process(&mut dst, 600, StageInput::Data(&src)).unwrap();
        assert_eq!(n, 600);
        dst.nb_samples += n;
        let rest = stretcher.process(&mut dst, 2048, StageInput::Pending).unwrap();
        assert_eq!(rest, 424);
    }

    #[test]
    fn test_rejects_raw() {
        let mut stretcher = TimeStretcher::default();
        let raw = AudioFormat::raw(crate::types::RawCodec::Ac3, 48000);
        assert!(stretcher.init(&raw, 1.0).is_err());
    }
}
