//! Inbound audio accumulation
//!
//! Response audio arrives as many small PCM16 fragments. They are held here
//! until the session decides the response is done (debounce expiry, silence
//! or `turnComplete`) and then handed to playback as one contiguous buffer.

/// Ordered buffer of decoded PCM16 fragments
#[derive(Debug, Clone, Default)]
pub struct AudioAccumulator {
    chunks: Vec<Vec<u8>>,
    /// Total bytes across all chunks
    byte_len: usize,
}

impl AudioAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one decoded fragment; empty fragments are ignored
    pub fn push(&mut self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        self.byte_len += chunk.len();
        self.chunks.push(chunk);

        if self.chunks.len() % 50 == 0 {
            log::debug!(
                "AudioAccumulator: {} chunks, {} bytes pending",
                self.chunks.len(),
                self.byte_len
            );
        }
    }

    /// Drain everything as one buffer, concatenated in arrival order
    ///
    /// Returns `None` when nothing was pending.
    pub fn take(&mut self) -> Option<Vec<u8>> {
        if self.chunks.is_empty() {
            return None;
        }

        let mut merged = Vec::with_capacity(self.byte_len);
        for chunk in self.chunks.drain(..) {
            merged.extend_from_slice(&chunk);
        }
        self.byte_len = 0;
        Some(merged)
    }

    /// Discard pending audio without playing it
    pub fn clear(&mut self) {
        if !self.chunks.is_empty() {
            log::debug!(
                "AudioAccumulator: discarding {} chunks ({} bytes)",
                self.chunks.len(),
                self.byte_len
            );
        }
        self.chunks.clear();
        self.byte_len = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Number of pending fragments
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Total pending bytes
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_accumulator_is_empty() {
        let mut acc = AudioAccumulator::new();
        assert!(acc.is_empty());
        assert_eq!(acc.len(), 0);
        assert_eq!(acc.take(), None);
    }

    #[test]
    fn test_take_concatenates_in_order() {
        let mut acc = AudioAccumulator::new();
        acc.push(vec![1, 2]);
        acc.push(vec![3]);
        acc.push(vec![4, 5, 6]);

        assert_eq!(acc.len(), 3);
        assert_eq!(acc.byte_len(), 6);
        assert_eq!(acc.take(), Some(vec![1, 2, 3, 4, 5, 6]));
        assert!(acc.is_empty());
        assert_eq!(acc.byte_len(), 0);
    }

    #[test]
    fn test_empty_chunk_ignored() {
        let mut acc = AudioAccumulator::new();
        acc.push(vec![]);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_clear_discards() {
        let mut acc = AudioAccumulator::new();
        acc.push(vec![9; 10]);
        acc.clear();

        assert!(acc.is_empty());
        assert_eq!(acc.take(), None);
    }

    #[test]
    fn test_take_twice() {
        let mut acc = AudioAccumulator::new();
        acc.push(vec![7]);
        assert_eq!(acc.take(), Some(vec![7]));
        assert_eq!(acc.take(), None);
    }
}
