use std::collections::VecDeque;

/// FIFO of presentation timestamps for frames that entered the transform engine.
///
/// Encoded units come back from the surface path without their original
/// timestamp; each one takes the oldest entry here. Only the pipeline thread
/// touches the queue, so it carries no lock.
#[derive(Debug, Default)]
pub struct TimestampQueue {
    queue: VecDeque<i64>,
    pushed: u64,
    popped: u64,
}

impl TimestampQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, presentation_time_us: i64) {
        self.queue.push_back(presentation_time_us);
        self.pushed += 1;
    }

    pub fn pop(&mut self) -> Option<i64> {
        let ts = self.queue.pop_front()?;
        self.popped += 1;
        Some(ts)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn pushed(&self) -> u64 {
        self.pushed
    }

    pub fn popped(&self) -> u64 {
        self.popped
    }

    /// Drops pending entries; the push/pop counters are kept for reporting.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
