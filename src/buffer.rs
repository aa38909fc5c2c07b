use std::collections::VecDeque;

use bytes::Bytes;

/// Most recent terminal output, capped at a fixed number of bytes.
///
/// Appending past the cap discards from the front, so the buffer always holds
/// exactly the last `min(total_written, limit)` bytes.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    data: VecDeque<u8>,
    limit: usize,
}

impl ReplayBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(limit.min(64 * 1024)),
            limit,
        }
    }

    pub fn with_contents(limit: usize, initial: &[u8]) -> Self {
        let mut buf = Self::new(limit);
        buf.append(initial);
        buf
    }

    pub fn append(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.limit {
            self.data.clear();
            self.data.extend(&chunk[chunk.len() - self.limit..]);
            return;
        }
        self.data.extend(chunk);
        let overflow = self.data.len().saturating_sub(self.limit);
        if overflow > 0 {
            self.data.drain(..overflow);
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn to_bytes(&self) -> Bytes {
        let (front, back) = self.data.as_slices();
        let mut out = Vec::with_capacity(self.data.len());
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        Bytes::from(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reference model: the tail of everything written.
    fn expected_tail(chunks: &[&[u8]], limit: usize) -> Vec<u8> {
        let all: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        all[all.len().saturating_sub(limit)..].to_vec()
    }

    #[test]
    fn under_limit_keeps_everything() {
        let mut buf = ReplayBuffer::new(16);
        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(buf.to_bytes(), Bytes::from_static(b"hello world"));
    }

    #[test]
    fn trims_from_head_to_exact_limit() {
        let mut buf = ReplayBuffer::new(8);
        buf.append(b"abcdef");
        buf.append(b"ghij");
        assert_eq!(buf.len(), 8);
        assert_eq!(buf.to_bytes(), Bytes::from_static(b"cdefghij"));
    }

    #[test]
    fn oversized_chunk_keeps_its_tail() {
        let mut buf = ReplayBuffer::new(4);
        buf.append(b"xy");
        buf.append(b"0123456789");
        assert_eq!(buf.to_bytes(), Bytes::from_static(b"6789"));
    }

    #[test]
    fn chunk_exactly_at_limit_replaces_contents() {
        let mut buf = ReplayBuffer::new(4);
        buf.append(b"ab");
        buf.append(b"wxyz");
        assert_eq!(buf.to_bytes(), Bytes::from_static(b"wxyz"));
    }

    #[test]
    fn zero_limit_stays_empty() {
        let mut buf = ReplayBuffer::new(0);
        buf.append(b"anything");
        assert!(buf.is_empty());
    }

    #[test]
    fn matches_suffix_model_for_mixed_sequences() {
        let sequences: &[&[&[u8]]] = &[
            &[b"a", b"bc", b"def", b"ghij", b"klmno"],
            &[b"0123456789abcdef", b"", b"x"],
            &[b"", b"", b""],
            &[b"\x1b[31m", b"red", b"\x1b[0m\r\n", b"$ "],
        ];
        for limit in [1, 3, 7, 10, 64] {
            for chunks in sequences {
                let mut buf = ReplayBuffer::new(limit);
                for c in chunks.iter() {
                    buf.append(c);
                }
                assert_eq!(
                    buf.to_bytes().to_vec(),
                    expected_tail(chunks, limit),
                    "limit {limit}"
                );
            }
        }
    }
}
