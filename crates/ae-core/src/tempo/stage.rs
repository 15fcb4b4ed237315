//! Tempo stage: second step of a stream's processing chain

use super::{TempoFilter, TempoFilterFactory, MAX_TEMPO, MIN_TEMPO};
use crate::buffer::{BufferPool, PoolId, SampleBuffer, StageInput, StageQueues};
use crate::types::AudioFormat;

/// Applies a tempo factor to buffers already in the internal format
///
/// At tempo 1.0 with no filter built, buffers pass straight through. A new
/// factor is only picked up at the start of a process cycle. Returning to
/// 1.0 flushes the filter and tears it down once its tail is out.
pub struct TempoStage {
    queues: StageQueues,
    factory: TempoFilterFactory,
    filter: Option<Box<dyn TempoFilter>>,
    tempo: f64,
    change_filter: bool,
    last_sample_pts: Option<f64>,
}

impl TempoStage {
    pub fn new(format: AudioFormat, factory: TempoFilterFactory) -> Self {
        Self {
            queues: StageQueues::new(BufferPool::new(format)),
            factory,
            filter: None,
            tempo: 1.0,
            change_filter: false,
            last_sample_pts: None,
        }
    }

    pub fn create(&mut self, total_time_ms: u32) {
        self.queues.pool.create(total_time_ms);
    }

    /// Request a new tempo factor, clamped to [0.5, 2.0]
    pub fn set_tempo(&mut self, tempo: f64) {
        let tempo = tempo.clamp(MIN_TEMPO, MAX_TEMPO);
        if tempo == self.tempo || self.queues.pool.format().is_raw() {
            return;
        }
        self.tempo = tempo;
        self.change_filter = true;
    }

    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    /// Apply a pending tempo change before any new input goes in
    ///
    /// Returns true while the old filter still has to be flushed first.
    fn apply_tempo_change(&mut self) -> bool {
        if !self.change_filter {
            return false;
        }
        match self.filter.as_mut() {
            Some(filter) if self.tempo != 1.0 => {
                filter.set_tempo(self.tempo);
                self.change_filter = false;
                false
            }
            Some(_) => true,
            None => {
                self.change_filter();
                false
            }
        }
    }

    fn change_filter(&mut self) {
        self.filter = None;
        self.change_filter = false;
        if self.tempo == 1.0 {
            return;
        }
        match (self.factory)(self.queues.pool.format(), self.tempo) {
            Ok(filter) => self.filter = Some(filter),
            Err(e) => log::error!("TempoStage: failed to build tempo filter: {}", e),
        }
    }

    /// Advance the stage by one step; returns whether any work was done
    pub fn process(&mut self) -> bool {
        let rebuilding = self.apply_tempo_change();
        if self.filter.is_none() {
            return self.process_bypass();
        }

        if !self.queues.can_produce() {
            return false;
        }

        let has_input = !self.queues.input.is_empty();
        let has_backlog = !self.queues.empty;
        if !(has_input || has_backlog || self.queues.drain || rebuilding) {
            return false;
        }

        let input = if has_input && !rebuilding && !has_backlog {
            self.queues.input.pop_front()
        } else {
            None
        };

        let out_rate = self.queues.pool.format().sample_rate as f64;
        let flush = rebuilding || (self.queues.drain && !has_input);
        let Some(filter) = self.filter.as_mut() else {
            return false;
        };
        let Some(proc) = self.queues.proc_sample() else {
            if let Some(input) = input {
                self.queues.input.push_front(input);
            }
            return false;
        };

        let max_out = proc.pkt.free_samples();
        let feed = match input.as_ref() {
            Some(buffer) => StageInput::Data(&buffer.pkt),
            None if flush => StageInput::Flush,
            None => StageInput::Pending,
        };
        let mut failed = false;
        let produced = match filter.process(&mut proc.pkt, max_out, feed) {
            Ok(n) => n,
            Err(e) => {
                log::warn!("TempoStage: filter failed, rebuilding: {}", e);
                failed = true;
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
        }
        let buffered = filter.buffered_frames();
        let tempo = filter.tempo();
        proc.timestamp = self
            .last_sample_pts
            .map(|pts| pts - (buffered + proc.pkt.nb_samples) as f64 * tempo * 1000.0 / out_rate);

        let mut busy = true;
        self.queues.empty = produced == 0 && input.is_none();
        let eof = filter.is_eof();

        if failed {
            self.change_filter();
        } else if flush && produced == 0 && eof {
            busy = self.queues.finish_proc_sample();
            if rebuilding {
                self.change_filter();
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
        let mut busy = false;
        while let Some(buffer) = self.queues.input.pop_front() {
            self.queues.output.push_back(buffer);
            busy = true;
        }
        busy
    }

    pub fn set_drain(&mut self, drain: bool) {
        self.queues.drain = drain;
    }

    pub fn set_fill_packets(&mut self, fill: bool) {
        self.queues.fill_packets = fill;
    }

    /// Audio held by this stage, in seconds
    pub fn delay(&self) -> f64 {
        self.queues.queued_ms() / 1000.0 + self.filter.as_ref().map_or(0.0, |f| f.delay())
    }

    /// Drop everything queued; a pending filter is rebuilt from scratch
    pub fn flush(&mut self) {
        self.queues.flush();
        self.last_sample_pts = None;
        if self.filter.is_some() {
            self.change_filter();
        }
    }

    pub fn is_drained(&self) -> bool {
        self.queues.drain
            && self.queues.is_empty()
            && self.filter.as_ref().map_or(true, |f| f.is_eof())
    }

    /// Buffers waiting in the queues or in flight
    pub fn has_queued(&self) -> bool {
        !self.queues.is_empty()
    }

    pub fn has_filter(&self) -> bool {
        self.filter.is_some()
    }

    pub fn push_input(&mut self, buffer: SampleBuffer) {
        self.queues.input.push_back(buffer);
    }

    pub fn pop_output(&mut self) -> Option<SampleBuffer> {
        self.queues.output.pop_front()
    }

    pub fn take_spent(&mut self) -> Vec<SampleBuffer> {
        std::mem::take(&mut self.queues.spent)
    }

    pub fn pool_id(&self) -> PoolId {
        self.queues.pool.id()
    }

    pub fn pool_mut(&mut self) -> &mut BufferPool {
        &mut self.queues.pool
    }

    pub fn into_pool(mut self) -> (BufferPool, Vec<SampleBuffer>) {
        self.queues.flush();
        let spent = std::mem::take(&mut self.queues.spent);
        (self.queues.pool, spent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tempo::create_tempo_filter;
    use crate::types::ChannelLayout;

    fn format(frames: usize) -> AudioFormat {
        AudioFormat::internal(48000, ChannelLayout::stereo(), frames)
    }

    fn input_pool(frames: usize) -> BufferPool {
        let mut pool = BufferPool::new(format(frames));
        pool.create(1000);
        pool
    }

    fn run(stage: &mut TempoStage, input: &mut BufferPool) -> usize {
        let mut total = 0;
        for _ in 0..500 {
            stage.process();
            for spent in stage.take_spent() {
                input.return_buffer(spent).unwrap();
            }
            while let Some(buffer) = stage.pop_output() {
                total += buffer.frames();
                if stage.pool_mut().return_buffer(buffer).is_err() {
                    panic!("unexpected foreign buffer");
                }
            }
            if stage.is_drained() {
                break;
            }
        }
        total
    }

    #[test]
    fn test_unity_tempo_bypasses() {
        let mut input = input_pool(256);
        let mut stage = TempoStage::new(format(256), create_tempo_filter);
        stage.create(500);
        for _ in 0..4 {
            let mut buffer = input.get_free_buffer().unwrap();
            buffer.pkt.nb_samples = 256;
            stage.push_input(buffer);
        }
        assert!(stage.process());
        assert!(!stage.has_filter());

        let mut count = 0;
        while let Some(buffer) = stage.pop_output() {
            input.return_buffer(buffer).unwrap();
            count += 1;
        }
        assert_eq!(count, 4);
    }

    #[test]
    fn test_set_tempo_is_clamped_and_deferred() {
        let mut stage = TempoStage::new(format(256), create_tempo_filter);
        stage.create(500);
        stage.set_tempo(4.0);
        assert_eq!(stage.tempo(), MAX_TEMPO);
        assert!(!stage.has_filter());
        stage.process();
        assert!(stage.has_filter());
    }

    #[test]
    fn test_faster_tempo_drains_shorter() {
        let mut input = input_pool(480);
        let mut stage = TempoStage::new(format(480), create_tempo_filter);
        stage.create(500);
        stage.set_tempo(1.25);

        for _ in 0..20 {
            let mut buffer = input.get_free_buffer().unwrap();
            buffer.pkt.nb_samples = 480;
            stage.push_input(buffer);
        }
        stage.set_drain(true);
        let total = run(&mut stage, &mut input);
        assert!(stage.is_drained());
        // 9600 in at 1.25 is 7680 out, plus the filter's flushed tail
        assert!(total >= 7680, "got {}", total);
        assert!(input.is_idle());
    }

    #[test]
    fn test_back_to_unity_removes_filter() {
        let mut input = input_pool(256);
        let mut stage = TempoStage::new(format(256), create_tempo_filter);
        stage.create(500);
        stage.set_tempo(0.8);
        stage.process();
        assert!(stage.has_filter());

        let mut buffer = input.get_free_buffer().unwrap();
        buffer.pkt.nb_samples = 256;
        stage.push_input(buffer);
        stage.process();

        stage.set_tempo(1.0);
        for _ in 0..50 {
            stage.process();
            for spent in stage.take_spent() {
                input.return_buffer(spent).unwrap();
            }
            while let Some(buffer) = stage.pop_output() {
                stage.pool_mut().return_buffer(buffer).unwrap();
            }
            if !stage.has_filter() {
                break;
            }
        }
        assert!(!stage.has_filter());
        assert!(input.is_idle());
    }
}
