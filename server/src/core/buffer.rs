use std::collections::VecDeque;

/// Fixed-capacity ring of decoded output chunks for one session, used both
/// to replay a backlog to a reconnecting client and to reconstruct the
/// `output_tail` persisted alongside each session record.
#[derive(Debug, Clone)]
pub struct CircularBuffer {
    capacity: usize,
    chunks: VecDeque<String>,
}

impl CircularBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            chunks: VecDeque::with_capacity(capacity.min(256)),
        }
    }

    pub fn push(&mut self, chunk: String) {
        if chunk.is_empty() {
            return;
        }
        if self.chunks.len() >= self.capacity {
            self.chunks.pop_front();
        }
        self.chunks.push_back(chunk);
    }

    /// Last `n` chunks, oldest first.
    pub fn slice(&self, n: usize) -> Vec<String> {
        let skip = self.chunks.len().saturating_sub(n);
        self.chunks.iter().skip(skip).cloned().collect()
    }

    pub fn all(&self) -> Vec<String> {
        self.chunks.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl Default for CircularBuffer {
    /// 1000 chunks covers several minutes of typical terminal chatter
    /// without letting a runaway session grow the backlog unbounded.
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_past_capacity() {
        let mut buf = CircularBuffer::new(3);
        for i in 0..5 {
            buf.push(format!("chunk-{i}"));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.all(), vec!["chunk-2", "chunk-3", "chunk-4"]);
    }

    #[test]
    fn slice_returns_last_n_in_order() {
        let mut buf = CircularBuffer::new(10);
        for i in 0..5 {
            buf.push(format!("chunk-{i}"));
        }
        assert_eq!(buf.slice(2), vec!["chunk-3", "chunk-4"]);
        assert_eq!(buf.slice(100), buf.all());
    }

    #[test]
    fn skips_empty_chunks() {
        let mut buf = CircularBuffer::new(10);
        buf.push(String::new());
        assert!(buf.is_empty());
    }
}
