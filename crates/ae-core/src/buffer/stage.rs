//! Queue discipline shared by the resample and tempo stages

use std::collections::VecDeque;

use super::{BufferPool, SampleBuffer, SamplePacket};

/// What one conversion step is fed
#[derive(Debug, Clone, Copy)]
pub enum StageInput<'a> {
    /// New frames
    Data(&'a SamplePacket),
    /// Nothing new, only hand out already converted frames
    Pending,
    /// End of segment: push out everything held inside
    Flush,
}

/// Pool plus input/output queues and the one in-flight output buffer
///
/// Input buffers usually belong to another pool (the stream's input pool or
/// the previous stage). Once consumed they are parked in `spent` until the
/// owner of that pool collects them.
#[derive(Debug)]
pub(crate) struct StageQueues {
    pub pool: BufferPool,
    pub input: VecDeque<SampleBuffer>,
    pub output: VecDeque<SampleBuffer>,
    pub proc_sample: Option<SampleBuffer>,
    pub spent: Vec<SampleBuffer>,
    pub drain: bool,
    pub fill_packets: bool,
    /// Last conversion step produced nothing
    pub empty: bool,
}

impl StageQueues {
    pub fn new(pool: BufferPool) -> Self {
        Self {
            pool,
            input: VecDeque::new(),
            output: VecDeque::new(),
            proc_sample: None,
            spent: Vec::new(),
            drain: false,
            fill_packets: false,
            empty: true,
        }
    }

    /// Give a buffer back to this stage's pool, or park it for its owner
    pub fn recycle(&mut self, buffer: SampleBuffer) {
        if let Err(foreign) = self.pool.return_buffer(buffer) {
            self.spent.push(foreign);
        }
    }

    /// Whether an output buffer is available to write into
    pub fn can_produce(&self) -> bool {
        self.proc_sample.is_some() || self.pool.has_free()
    }

    /// In-flight buffer, taking a fresh one from the pool when needed
    pub fn proc_sample(&mut self) -> Option<&mut SampleBuffer> {
        if self.proc_sample.is_none() {
            self.proc_sample = self.pool.get_free_buffer();
        }
        self.proc_sample.as_mut()
    }

    /// Close the in-flight buffer at the end of a drain or before a rebuild
    ///
    /// Returns false when draining produced nothing more, which marks the
    /// drain as finished.
    pub fn finish_proc_sample(&mut self) -> bool {
        let Some(mut proc) = self.proc_sample.take() else {
            return !self.drain;
        };
        if self.fill_packets && proc.pkt.nb_samples != 0 {
            proc.pkt.pad_to_full();
        }
        if proc.pkt.nb_samples == 0 {
            self.recycle(proc);
            return !self.drain;
        }
        self.output.push_back(proc);
        true
    }

    /// Move the in-flight buffer out once it is complete
    ///
    /// Without fixed-size packets any non-empty buffer is complete.
    pub fn emit_if_ready(&mut self) {
        let ready = match &self.proc_sample {
            Some(proc) if self.fill_packets => proc.pkt.is_full(),
            Some(proc) => proc.pkt.nb_samples > 0,
            None => false,
        };
        if ready {
            if let Some(proc) = self.proc_sample.take() {
                self.output.push_back(proc);
            }
        }
    }

    /// Nothing queued and nothing in flight
    pub fn is_empty(&self) -> bool {
        self.input.is_empty() && self.output.is_empty() && self.proc_sample.is_none()
    }

    /// Release every buffer held by the queues
    pub fn flush(&mut self) {
        while let Some(buffer) = self.input.pop_front() {
            self.recycle(buffer);
        }
        while let Some(buffer) = self.output.pop_front() {
            self.recycle(buffer);
        }
        if let Some(buffer) = self.proc_sample.take() {
            self.recycle(buffer);
        }
        self.empty = true;
    }

    /// Frames waiting in the queues (input counted at its own rate)
    pub fn queued_ms(&self) -> f64 {
        let queued: f64 = self
            .input
            .iter()
            .chain(self.output.iter())
            .map(|b| b.duration_ms())
            .sum();
        queued + self.proc_sample.as_ref().map_or(0.0, |b| b.duration_ms())
    }
}
