//! Per-session FIFO of remote candidates received before the link was stable

use livecast_signaling::IceCandidate;
use std::collections::VecDeque;

/// Ordered buffer of not-yet-applied remote candidates
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queue: VecDeque<IceCandidate>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    /// Oldest buffered candidate, removed from the buffer
    pub fn pop(&mut self) -> Option<IceCandidate> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut buffer = CandidateBuffer::new();
        for c in ["c1", "c2", "c3"] {
            buffer.push(IceCandidate::new(c));
        }
        assert_eq!(buffer.len(), 3);

        let drained: Vec<String> = std::iter::from_fn(|| buffer.pop())
            .map(|c| c.candidate)
            .collect();
        assert_eq!(drained, vec!["c1", "c2", "c3"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_clear_discards_everything() {
        let mut buffer = CandidateBuffer::new();
        buffer.push(IceCandidate::new("c1"));
        buffer.clear();
        assert_eq!(buffer.pop(), None);
    }
}
