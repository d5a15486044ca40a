use std::collections::VecDeque;

use crate::slicer::ChunkData;

/// Pending chunks of one run, consumed strictly front to back.
#[derive(Debug, Default)]
pub struct ChunkQueue {
    pending: VecDeque<ChunkData>,
    total: usize,
}

impl ChunkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: ChunkData) {
        self.pending.push_back(chunk);
        self.total += 1;
    }

    pub fn pop(&mut self) -> Option<ChunkData> {
        self.pending.pop_front()
    }

    pub fn peek(&self) -> Option<&ChunkData> {
        self.pending.front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of chunks ever enqueued.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn completed(&self) -> usize {
        self.total - self.pending.len()
    }
}

impl FromIterator<ChunkData> for ChunkQueue {
    fn from_iter<I: IntoIterator<Item = ChunkData>>(iter: I) -> Self {
        let mut queue = Self::new();
        for chunk in iter {
            queue.push(chunk);
        }
        queue
    }
}
