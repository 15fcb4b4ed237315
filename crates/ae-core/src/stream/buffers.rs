//! Per-stream processing chain: resample then tempo

use std::collections::VecDeque;

use crate::buffer::{BufferPool, PoolId, SampleBuffer};
use crate::resample::{ResampleQuality, ResampleStage, ResamplerFactory};
use crate::tempo::{TempoFilterFactory, TempoStage};
use crate::types::AudioFormat;

/// Two-stage pipeline with its own input and output queues
///
/// Input buffers come from the stream's input pool, which the stream keeps.
/// Whenever a buffer from a pool this chain does not own is consumed it is
/// parked until [`StreamBuffers::take_spent`] hands it back.
pub struct StreamBuffers {
    input_format: AudioFormat,
    format: AudioFormat,
    input: VecDeque<SampleBuffer>,
    output: VecDeque<SampleBuffer>,
    resample: ResampleStage,
    tempo: TempoStage,
    spent: Vec<SampleBuffer>,
    drain: bool,
}

impl StreamBuffers {
    pub fn new(
        input_format: AudioFormat,
        format: AudioFormat,
        quality: ResampleQuality,
        resampler_factory: ResamplerFactory,
        tempo_factory: TempoFilterFactory,
    ) -> Self {
        Self {
            resample: ResampleStage::new(
                input_format.clone(),
                format.clone(),
                quality,
                resampler_factory,
            ),
            tempo: TempoStage::new(format.clone(), tempo_factory),
            input_format,
            format,
            input: VecDeque::new(),
            output: VecDeque::new(),
            spent: Vec::new(),
            drain: false,
        }
    }

    /// Allocate both stage pools for `total_time_ms` of audio
    pub fn create(&mut self, total_time_ms: u32, upmix: bool, normalize: bool) {
        self.resample.create(total_time_ms, upmix, normalize);
        self.tempo.create(total_time_ms);
    }

    pub fn input_format(&self) -> &AudioFormat {
        &self.input_format
    }

    /// Format of the buffers this chain emits
    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn push_input(&mut self, buffer: SampleBuffer) {
        self.input.push_back(buffer);
    }

    pub fn pop_output(&mut self) -> Option<SampleBuffer> {
        self.output.pop_front()
    }

    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Push queued buffers one step through both stages
    ///
    /// Returns true if any stage did work.
    pub fn process_buffers(&mut self) -> bool {
        let mut busy = false;

        while let Some(buffer) = self.input.pop_front() {
            self.resample.push_input(buffer);
            busy = true;
        }
        busy |= self.resample.process();

        while let Some(buffer) = self.resample.pop_output() {
            self.tempo.push_input(buffer);
            busy = true;
        }
        if self.drain && self.resample.is_drained() {
            self.tempo.set_drain(true);
        }
        busy |= self.tempo.process();

        while let Some(buffer) = self.tempo.pop_output() {
            self.output.push_back(buffer);
            busy = true;
        }

        self.collect_spent();
        busy
    }

    fn collect_spent(&mut self) {
        self.spent.extend(self.resample.take_spent());
        for buffer in self.tempo.take_spent() {
            if let Err(foreign) = self.resample.pool_mut().return_buffer(buffer) {
                self.spent.push(foreign);
            }
        }
    }

    /// Give a buffer from one of the stage pools back
    ///
    /// Buffers from any other pool are handed back as `Err`.
    pub fn return_buffer(&mut self, buffer: SampleBuffer) -> Result<(), SampleBuffer> {
        let buffer = match self.resample.pool_mut().return_buffer(buffer) {
            Ok(()) => return Ok(()),
            Err(buffer) => buffer,
        };
        self.tempo.pool_mut().return_buffer(buffer)
    }

    pub fn owns_pool(&self, id: PoolId) -> bool {
        self.resample.pool_id() == id || self.tempo.pool_id() == id
    }

    /// Consumed buffers that belong to the stream's input pool
    pub fn take_spent(&mut self) -> Vec<SampleBuffer> {
        std::mem::take(&mut self.spent)
    }

    /// Route a drift correction to the resampler or the tempo filter
    ///
    /// Small deviations from 1.0 go to the resampler ratio with tempo reset
    /// to 1.0. Larger ones are inverted into the tempo filter and the
    /// resampler ratio is pinned at 1.0.
    pub fn set_rr(&mut self, rr: f64, atempo_threshold: f64) {
        if (rr - 1.0).abs() < atempo_threshold {
            self.resample.set_rr(rr);
            self.tempo.set_tempo(1.0);
        } else {
            self.resample.set_rr(1.0);
            self.tempo.set_tempo(1.0 / rr);
        }
    }

    pub fn rr(&self) -> f64 {
        self.resample.rr()
    }

    pub fn tempo(&self) -> f64 {
        self.tempo.tempo()
    }

    /// Start or cancel draining; the tempo stage follows once the resampler is empty
    pub fn set_drain(&mut self, drain: bool) {
        self.drain = drain;
        self.resample.set_drain(drain);
        if !drain {
            self.tempo.set_drain(false);
        }
    }

    pub fn is_drained(&self) -> bool {
        self.drain
            && self.input.is_empty()
            && self.output.is_empty()
            && self.resample.is_drained()
            && self.tempo.is_drained()
    }

    /// Audio held by the chain, in seconds
    pub fn delay(&self) -> f64 {
        let queued: f64 = self
            .input
            .iter()
            .chain(self.output.iter())
            .map(|b| b.duration_ms())
            .sum();
        queued / 1000.0 + self.resample.delay() + self.tempo.delay()
    }

    /// Drop everything in flight; foreign buffers land in the spent list
    pub fn flush(&mut self) {
        while let Some(buffer) = self.input.pop_front() {
            self.spent.push(buffer);
        }
        while let Some(buffer) = self.output.pop_front() {
            if let Err(foreign) = self.return_buffer(buffer) {
                self.spent.push(foreign);
            }
        }
        self.resample.flush();
        self.tempo.flush();
        self.collect_spent();
        self.set_drain(false);
    }

    pub fn configure_resampler(&mut self, quality: ResampleQuality, upmix: bool, normalize: bool) {
        self.resample.configure(quality, upmix, normalize);
    }

    pub fn set_fill_packets(&mut self, fill: bool) {
        self.resample.set_fill_packets(fill);
        self.tempo.set_fill_packets(fill);
    }

    pub fn force_resampler(&mut self, force: bool) {
        self.resample.force_resampler(force);
    }

    pub fn has_resampler(&self) -> bool {
        self.resample.has_resampler()
    }

    /// Remove up to `frames` frames from the front of the output queue
    ///
    /// Returns the number of frames removed.
    pub fn discard_front(&mut self, frames: usize) -> usize {
        let mut remaining = frames;
        while remaining > 0 {
            let Some(front) = self.output.front_mut() else {
                break;
            };
            if front.frames() <= remaining {
                remaining -= front.frames();
                if let Some(buffer) = self.output.pop_front() {
                    if let Err(foreign) = self.return_buffer(buffer) {
                        self.spent.push(foreign);
                    }
                }
            } else {
                let removed = front.pkt.discard_front(remaining);
                let ms = front.pkt.format().frames_to_ms(removed);
                if let Some(pts) = front.timestamp.as_mut() {
                    *pts += ms;
                }
                remaining -= removed;
            }
        }
        frames - remaining
    }

    /// Presentation time of the next frame to be mixed
    pub fn front_timestamp(&self) -> Option<f64> {
        self.output.front().and_then(|b| b.timestamp)
    }

    /// Anything queued here or inside a stage
    pub fn has_work(&self) -> bool {
        !self.input.is_empty()
            || !self.output.is_empty()
            || self.resample.has_queued()
            || self.tempo.has_queued()
    }

    /// Delay the output by `ms` of silence in front of the queue
    ///
    /// Bitstreams get a single pause burst. Returns the amount inserted,
    /// which is less than asked when the stage pool runs dry.
    pub fn insert_silence(&mut self, ms: f64) -> f64 {
        let pts = self.front_timestamp();
        let pool = self.resample.pool_mut();

        if self.format.is_raw() {
            let Some(mut buffer) = pool.get_free_buffer() else {
                return 0.0;
            };
            let ms = ms.round().max(1.0);
            buffer.pkt.pause_burst_ms = ms as u32;
            buffer.timestamp = pts.map(|p| p - ms);
            self.output.push_front(buffer);
            return ms;
        }

        let mut remaining = self.format.ms_to_frames(ms);
        let mut silence = Vec::new();
        while remaining > 0 {
            let Some(mut buffer) = pool.get_free_buffer() else {
                break;
            };
            let frames = remaining.min(buffer.pkt.max_nb_samples());
            buffer.pkt.silence_from(0);
            buffer.pkt.nb_samples = frames;
            remaining -= frames;
            silence.push(buffer);
        }

        let inserted: f64 = silence.iter().map(|b| b.duration_ms()).sum();
        let mut pts = pts.map(|p| p - inserted);
        for buffer in &mut silence {
            buffer.timestamp = pts;
            pts = pts.map(|p| p + buffer.duration_ms());
        }
        for buffer in silence.into_iter().rev() {
            self.output.push_front(buffer);
        }
        inserted
    }

    /// Skip `ms` of queued output
    ///
    /// Bitstreams only lose whole buffers. Returns the amount dropped.
    pub fn drop_ms(&mut self, ms: f64) -> f64 {
        if !self.format.is_raw() {
            let frames = self.discard_front(self.format.ms_to_frames(ms));
            return self.format.frames_to_ms(frames);
        }

        let mut dropped = 0.0;
        while let Some(duration) = self.output.front().map(|b| b.duration_ms().max(b.pkt.pause_burst_ms as f64)) {
            if dropped + duration > ms {
                break;
            }
            dropped += duration;
            if let Some(buffer) = self.output.pop_front() {
                if let Err(foreign) = self.return_buffer(buffer) {
                    self.spent.push(foreign);
                }
            }
        }
        dropped
    }

    /// Tear the chain down, giving back both pools plus foreign buffers
    pub fn into_pools(mut self) -> (Vec<BufferPool>, Vec<SampleBuffer>) {
        self.flush();
        let mut spent = std::mem::take(&mut self.spent);
        let (mut resample_pool, resample_spent) = self.resample.into_pool();
        let (mut tempo_pool, tempo_spent) = self.tempo.into_pool();
        spent.extend(resample_spent);
        spent.extend(tempo_spent);

        let mut foreign = Vec::new();
        for buffer in spent {
            let Err(buffer) = resample_pool.return_buffer(buffer) else {
                continue;
            };
            if let Err(buffer) = tempo_pool.return_buffer(buffer) {
                foreign.push(buffer);
            }
        }
        (vec![resample_pool, tempo_pool], foreign)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resample::create_resampler;
    use crate::tempo::create_tempo_filter;
    use crate::types::ChannelLayout;

    fn chain(frames: usize) -> (BufferPool, StreamBuffers) {
        let fmt = AudioFormat::internal(48000, ChannelLayout::stereo(), frames);
        let mut input = BufferPool::new(fmt.clone());
        input.create(1000);
        let mut buffers = StreamBuffers::new(
            fmt.clone(),
            fmt,
            ResampleQuality::Medium,
            create_resampler,
            create_tempo_filter,
        );
        buffers.create(500, false, true);
        (input, buffers)
    }

    fn push_silence(input: &mut BufferPool, buffers: &mut StreamBuffers, mut frames: usize) {
        while frames > 0 {
            let mut buffer = input.get_free_buffer().unwrap();
            let n = frames.min(buffer.pkt.max_nb_samples());
            buffer.pkt.silence_from(0);
            buffer.pkt.nb_samples = n;
            buffers.push_input(buffer);
            frames -= n;
        }
    }

    #[test]
    fn test_noop_pipeline_preserves_frames() {
        let (mut input, mut buffers) = chain(256);
        push_silence(&mut input, &mut buffers, 1000);
        buffers.set_drain(true);

        let mut total = 0;
        for _ in 0..20 {
            buffers.process_buffers();
            while let Some(buffer) = buffers.pop_output() {
                total += buffer.frames();
                assert!(buffer.pkt.plane(0)[..buffer.frames()].iter().all(|&s| s == 0.0));
                if let Err(foreign) = buffers.return_buffer(buffer) {
                    input.return_buffer(foreign).unwrap();
                }
            }
            for spent in buffers.take_spent() {
                input.return_buffer(spent).unwrap();
            }
            if buffers.is_drained() {
                break;
            }
        }
        assert_eq!(total, 1000);
        assert!(buffers.is_drained());
        assert!(input.is_idle());
    }

    #[test]
    fn test_output_count_matches_full_buffers() {
        let (mut input, mut buffers) = chain(256);
        push_silence(&mut input, &mut buffers, 256 * 3 + 10);
        buffers.process_buffers();
        let mut count = 0;
        while let Some(buffer) = buffers.pop_output() {
            count += 1;
            input.return_buffer(buffer).unwrap();
        }
        assert_eq!(count, 4);
    }

    #[test]
    fn test_set_rr_routing() {
        let (_input, mut buffers) = chain(256);
        buffers.set_rr(1.01, 0.02);
        assert_eq!(buffers.rr(), 1.01);
        assert_eq!(buffers.tempo(), 1.0);

        buffers.set_rr(1.25, 0.02);
        assert_eq!(buffers.rr(), 1.0);
        assert!((buffers.tempo() - 0.8).abs() < 1e-9);

        buffers.set_rr(1.0, 0.02);
        assert_eq!(buffers.rr(), 1.0);
        assert_eq!(buffers.tempo(), 1.0);
    }

    #[test]
    fn test_discard_front_spans_buffers() {
        let (mut input, mut buffers) = chain(256);
        push_silence(&mut input, &mut buffers, 512);
        buffers.process_buffers();
        assert_eq!(buffers.discard_front(300), 300);
        let front = buffers.pop_output().unwrap();
        assert_eq!(front.frames(), 212);
        input.return_buffer(front).unwrap();
        for spent in buffers.take_spent() {
            input.return_buffer(spent).unwrap();
        }
        assert!(input.is_idle());
    }

    #[test]
    fn test_insert_silence_shifts_timestamps() {
        let (mut input, mut buffers) = chain(480);
        let mut buffer = input.get_free_buffer().unwrap();
        buffer.pkt.plane_mut(0).fill(0.5);
        buffer.pkt.nb_samples = 480;
        buffer.timestamp = Some(1000.0);
        buffers.push_input(buffer);
        buffers.process_buffers();

        let inserted = buffers.insert_silence(15.0);
        assert!((inserted - 15.0).abs() < 1e-9);
        assert_eq!(buffers.front_timestamp(), Some(985.0));

        let silence = buffers.pop_output().unwrap();
        assert_eq!(silence.frames(), 480);
        assert!(silence.pkt.plane(0)[..480].iter().all(|&s| s == 0.0));
        buffers.return_buffer(silence).unwrap();
        let silence = buffers.pop_output().unwrap();
        assert_eq!(silence.frames(), 240);
        assert_eq!(silence.timestamp, Some(995.0));
        buffers.return_buffer(silence).unwrap();

        let audio = buffers.pop_output().unwrap();
        assert_eq!(audio.pkt.plane(0)[0], 0.5);
        input.return_buffer(audio).unwrap();
    }

    #[test]
    fn test_drop_ms_skips_frames() {
        let (mut input, mut buffers) = chain(480);
        push_silence(&mut input, &mut buffers, 960);
        buffers.process_buffers();
        let dropped = buffers.drop_ms(15.0);
        assert!((dropped - 15.0).abs() < 1e-9);
        let front = buffers.pop_output().unwrap();
        assert_eq!(front.frames(), 240);
        input.return_buffer(front).unwrap();
    }

    #[test]
    fn test_flush_returns_everything() {
        let (mut input, mut buffers) = chain(256);
        push_silence(&mut input, &mut buffers, 1024);
        buffers.process_buffers();
        buffers.flush();
        assert!(!buffers.has_output());
        for spent in buffers.take_spent() {
            input.return_buffer(spent).unwrap();
        }
        assert!(input.is_idle());
    }
}
