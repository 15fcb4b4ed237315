//! Resample stage: first step of a stream's processing chain

use super::{ResampleConfig, ResampleQuality, Resampler, ResamplerFactory};
use crate::buffer::{BufferPool, PoolId, SampleBuffer, StageInput, StageQueues};
use crate::types::AudioFormat;

/// Converts a stream's buffers to the engine's internal format
///
/// Buffers pass through untouched while input and output formats agree and
/// no ratio correction is active. Otherwise a [`Resampler`] writes into
/// buffers from this stage's own pool, filling one in-flight buffer at a time.
pub struct ResampleStage {
    queues: StageQueues,
    input_format: AudioFormat,
    factory: ResamplerFactory,
    resampler: Option<Box<dyn Resampler>>,
    quality: ResampleQuality,
    upmix: bool,
    normalize: bool,
    centre_mix_level: Option<f32>,
    resample_ratio: f64,
    resample_required: bool,
    change_resampler: bool,
    force_resampler: bool,
    /// Presentation time just after the last input frame consumed
    last_sample_pts: Option<f64>,
}

impl ResampleStage {
    /// `output.frames` sets the size of the buffers this stage emits
    pub fn new(
        input_format: AudioFormat,
        output: AudioFormat,
        quality: ResampleQuality,
        factory: ResamplerFactory,
    ) -> Self {
        Self {
            queues: StageQueues::new(BufferPool::new(output)),
            input_format,
            factory,
            resampler: None,
            quality,
            upmix: false,
            normalize: true,
            centre_mix_level: None,
            resample_ratio: 1.0,
            resample_required: false,
            change_resampler: false,
            force_resampler: false,
            last_sample_pts: None,
        }
    }

    /// Allocate the output pool and decide whether a resampler is needed
    pub fn create(&mut self, total_time_ms: u32, upmix: bool, normalize: bool) {
        self.queues.pool.create(total_time_ms);
        self.upmix = upmix;
        self.normalize = normalize;
        self.update_required();
        if self.resample_required {
            self.change_resampler();
        }
    }

    fn update_required(&mut self) {
        let output = self.queues.pool.format();
        self.resample_required = !self.input_format.is_raw()
            && (self.input_format.sample_rate != output.sample_rate
                || self.input_format.layout != output.layout
                || self.input_format.sample_format != output.sample_format
                || self.queues.fill_packets
                || self.force_resampler);
    }

    /// Rebuild the resampler from the current parameters
    fn change_resampler(&mut self) {
        self.resampler = None;
        self.change_resampler = false;

        let wanted =
            self.resample_required || self.resample_ratio != 1.0 || self.force_resampler;
        if !wanted || self.input_format.is_raw() {
            return;
        }

        let config = ResampleConfig {
            input: self.input_format.clone(),
            output: self.queues.pool.format().clone(),
            quality: self.quality,
            upmix: self.upmix,
            normalize: self.normalize,
            centre_mix_level: self.centre_mix_level,
        };
        match (self.factory)(&config) {
            Ok(resampler) => self.resampler = Some(resampler),
            Err(e) => log::error!("ResampleStage: failed to build resampler: {}", e),
        }
    }

    /// Advance the stage by one step; returns whether any work was done
    pub fn process(&mut self) -> bool {
        let Some(resampler) = self.resampler.as_mut() else {
            return self.process_bypass();
        };

        if !self.queues.can_produce() {
            return false;
        }

        let free = self
            .queues
            .proc_sample
            .as_ref()
            .map_or(self.queues.pool.format().frames, |p| p.pkt.free_samples());

        // Keep the converter's backlog from growing without bound
        let skip_input = !resampler.wants_new_samples(free) && !self.queues.empty;
        let has_input = !self.queues.input.is_empty();
        if !(has_input || skip_input || self.queues.drain || self.change_resampler) {
            return false;
        }

        let input = if has_input && !skip_input && !self.change_resampler {
            self.queues.input.pop_front()
        } else {
            None
        };

        let out_rate = self.queues.pool.format().sample_rate as f64;
        let flushing = self.queues.drain || self.change_resampler;
        let Some(proc) = self.queues.proc_sample() else {
            if let Some(input) = input {
                self.queues.input.push_front(input);
            }
            return false;
        };

        let max_out = proc.pkt.free_samples();
        let feed = match input.as_ref() {
            Some(buffer) => StageInput::Data(&buffer.pkt),
            None if flushing => StageInput::Flush,
            None => StageInput::Pending,
        };
        let produced = match resampler.resample(&mut proc.pkt, max_out, feed, self.resample_ratio) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("ResampleStage: resampler failed, rebuilding: {}", e);
                self.change_resampler = true;
                0
            }
        };
        proc.pkt.nb_samples += produced;

        if let Some(input) = input.as_ref() {
            if let Some(pts) = input.timestamp {
                self.last_sample_pts = Some(pts + input.duration_ms());
            } else if let Some(pts) = self.last_sample_pts.as_mut() {
                *pts += input.duration_ms();
            }
            if input.centre_mix_level != self.centre_mix_level && input.centre_mix_level.is_some() {
                self.centre_mix_level = input.centre_mix_level;
                self.change_resampler = true;
            }
        }

        let buffered = resampler.buffered_samples();
        proc.timestamp = self
            .last_sample_pts
            .map(|pts| pts - (buffered + proc.pkt.nb_samples) as f64 * 1000.0 / out_rate);

        let mut busy = true;
        self.queues.empty = produced == 0;

        if (self.queues.drain || self.change_resampler) && self.queues.empty {
            busy = self.queues.finish_proc_sample();
            if self.change_resampler {
                self.change_resampler();
            }
        } else {
            self.queues.emit_if_ready();
        }

        if let Some(input) = input {
            self.queues.recycle(input);
        }
        busy
    }

    fn process_bypass(&mut self) -> bool {
        if self.change_resampler {
            self.change_resampler();
            return true;
        }

        let mut busy = false;
        while let Some(buffer) = self.queues.input.pop_front() {
            if self.resample_required {
                // Formats differ and no converter could be built: drop
                self.queues.recycle(buffer);
            } else {
                self.queues.output.push_back(buffer);
            }
            busy = true;
        }
        busy
    }

    /// Drift-correction ratio applied by the converter
    pub fn set_rr(&mut self, ratio: f64) {
        self.resample_ratio = ratio;
        if self.resampler.is_none() && ratio != 1.0 && !self.input_format.is_raw() {
            self.change_resampler = true;
        }
    }

    pub fn rr(&self) -> f64 {
        self.resample_ratio
    }

    pub fn set_drain(&mut self, drain: bool) {
        self.queues.drain = drain;
    }

    /// Emit only completely filled buffers (padding the last one)
    pub fn set_fill_packets(&mut self, fill: bool) {
        self.queues.fill_packets = fill;
        let was_required = self.resample_required;
        self.update_required();
        if self.resample_required != was_required || (fill && self.resampler.is_none()) {
            self.change_resampler = self.resample_required;
        }
    }

    pub fn force_resampler(&mut self, force: bool) {
        self.force_resampler = force;
        self.update_required();
        if force && self.resampler.is_none() {
            self.change_resampler = true;
        }
    }

    /// Apply changed conversion settings, rebuilding gaplessly if needed
    pub fn configure(&mut self, quality: ResampleQuality, upmix: bool, normalize: bool) {
        if quality == self.quality && upmix == self.upmix && normalize == self.normalize {
            return;
        }
        self.quality = quality;
        self.upmix = upmix;
        self.normalize = normalize;
        if self.resampler.is_some() {
            self.change_resampler = true;
        }
    }

    /// Audio held by this stage, in seconds
    pub fn delay(&self) -> f64 {
        self.queues.queued_ms() / 1000.0 + self.resampler.as_ref().map_or(0.0, |r| r.delay())
    }

    /// Drop everything queued and restart the converter
    pub fn flush(&mut self) {
        self.queues.flush();
        self.last_sample_pts = None;
        if self.resampler.is_some() {
            self.change_resampler();
        }
    }

    /// Draining and nothing left anywhere in the stage
    pub fn is_drained(&self) -> bool {
        self.queues.drain
            && self.queues.is_empty()
            && self.resampler.as_ref().map_or(true, |r| r.buffered_samples() == 0)
    }

    /// Buffers waiting in the queues or in flight
    pub fn has_queued(&self) -> bool {
        !self.queues.is_empty()
    }

    pub fn has_resampler(&self) -> bool {
        self.resampler.is_some()
    }

    pub fn push_input(&mut self, buffer: SampleBuffer) {
        self.queues.input.push_back(buffer);
    }

    pub fn pop_output(&mut self) -> Option<SampleBuffer> {
        self.queues.output.pop_front()
    }

    /// Consumed input buffers that belong to other pools
    pub fn take_spent(&mut self) -> Vec<SampleBuffer> {
        std::mem::take(&mut self.queues.spent)
    }

    pub fn pool_id(&self) -> PoolId {
        self.queues.pool.id()
    }

    pub fn pool_mut(&mut self) -> &mut BufferPool {
        &mut self.queues.pool
    }

    pub fn output_format(&self) -> &AudioFormat {
        self.queues.pool.format()
    }

    /// Give up the pool, e.g. to retire it after a format change
    pub fn into_pool(mut self) -> (BufferPool, Vec<SampleBuffer>) {
        self.queues.flush();
        let spent = std::mem::take(&mut self.queues.spent);
        (self.queues.pool, spent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resample::create_resampler;
    use crate::types::ChannelLayout;

    fn input_pool(frames: usize) -> BufferPool {
        let mut pool = BufferPool::new(AudioFormat::internal(48000, ChannelLayout::stereo(), frames));
        pool.create(1000);
        pool
    }

    fn fill(pool: &mut BufferPool, frames: usize, value: f32) -> SampleBuffer {
        let mut buffer = pool.get_free_buffer().unwrap();
        for plane in buffer.pkt.planes_mut() {
            plane[..frames].fill(value);
        }
        buffer.pkt.nb_samples = frames;
        buffer
    }

    #[test]
    fn test_matching_formats_bypass() {
        let mut input = input_pool(256);
        let fmt = input.format().clone();
        let mut stage = ResampleStage::new(fmt.clone(), fmt, ResampleQuality::Medium, create_resampler);
        stage.create(500, false, true);
        assert!(!stage.has_resampler());

        for _ in 0..3 {
            let buffer = fill(&mut input, 256, 0.0);
            stage.push_input(buffer);
        }
        assert!(stage.process());

        let mut count = 0;
        while let Some(buffer) = stage.pop_output() {
            assert_eq!(buffer.frames(), 256);
            input.return_buffer(buffer).unwrap();
            count += 1;
        }
        assert_eq!(count, 3);
        assert!(input.is_idle());
    }

    #[test]
    fn test_rate_change_builds_resampler() {
        let mut input = input_pool(480);
        let in_fmt = input.format().clone();
        let out_fmt = AudioFormat::internal(44100, ChannelLayout::stereo(), 441);
        let mut stage = ResampleStage::new(in_fmt, out_fmt, ResampleQuality::Low, create_resampler);
        stage.create(500, false, true);
        assert!(stage.has_resampler());

        for _ in 0..10 {
            let buffer = fill(&mut input, 480, 0.1);
            stage.push_input(buffer);
        }
        stage.set_drain(true);
        let mut total = 0;
        for _ in 0..100 {
            stage.process();
            for spent in stage.take_spent() {
                input.return_buffer(spent).unwrap();
            }
            while let Some(buffer) = stage.pop_output() {
                total += buffer.frames();
                stage.pool_mut().return_buffer(buffer).unwrap();
            }
            if stage.is_drained() {
                break;
            }
        }
        assert!(stage.is_drained());
        assert!((total as i64 - 4410).abs() <= 2, "got {}", total);
        assert!(input.is_idle());
    }

    #[test]
    fn test_ratio_change_enables_resampler() {
        let fmt = AudioFormat::internal(48000, ChannelLayout::stereo(), 256);
        let mut stage = ResampleStage::new(fmt.clone(), fmt, ResampleQuality::Medium, create_resampler);
        stage.create(100, false, true);
        assert!(!stage.has_resampler());

        stage.set_rr(1.01);
        assert!(stage.process());
        assert!(stage.has_resampler());
        assert_eq!(stage.rr(), 1.01);
    }

    #[test]
    fn test_fill_packets_pads_final_buffer() {
        let mut input = input_pool(256);
        let fmt = input.format().clone();
        let mut stage = ResampleStage::new(fmt.clone(), fmt, ResampleQuality::Medium, create_resampler);
        stage.create(500, false, true);
        stage.set_fill_packets(true);
        stage.process();
        assert!(stage.has_resampler());

        let buffer = fill(&mut input, 100, 0.5);
        stage.push_input(buffer);
        stage.set_drain(true);

        let mut outputs = Vec::new();
        for _ in 0..20 {
            stage.process();
            while let Some(buffer) = stage.pop_output() {
                outputs.push(buffer);
            }
            if stage.is_drained() {
                break;
            }
        }
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].frames(), 256);
        assert_eq!(outputs[0].pkt.plane(0)[99], 0.5);
        assert_eq!(outputs[0].pkt.plane(0)[100], 0.0);
    }
}
