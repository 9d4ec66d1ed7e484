//! Size-bounded body capture

use crate::executor::BodySink;
use bytes::{Bytes, BytesMut};

/// Collects body chunks up to `limit` bytes.
///
/// Once the limit is reached the capture is marked truncated and later chunks
/// are dropped, but every chunk is still reported as consumed so the transfer
/// keeps running.
#[derive(Debug)]
pub struct BodyCapture {
    limit: usize,
    buf: BytesMut,
    truncated: bool,
}

impl BodyCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            buf: BytesMut::new(),
            truncated: false,
        }
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_body(self) -> Bytes {
        self.buf.freeze()
    }
}

impl BodySink for BodyCapture {
    fn on_chunk(&mut self, chunk: &[u8]) -> usize {
        if self.truncated {
            return chunk.len();
        }

        let remaining = self.limit - self.buf.len();
        if chunk.len() >= remaining {
            self.buf.extend_from_slice(&chunk[..remaining]);
            self.truncated = true;
        } else {
            self.buf.extend_from_slice(chunk);
        }

        chunk.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(limit: usize, chunks: &[&[u8]]) -> BodyCapture {
        let mut capture = BodyCapture::new(limit);
        for chunk in chunks {
            assert_eq!(capture.on_chunk(chunk), chunk.len());
        }
        capture
    }

    #[test]
    fn test_truncates_exactly_at_limit() {
        let capture = feed(10, &[b"hello", b"world!!!"]);
        assert!(capture.truncated());
        assert_eq!(&capture.into_body()[..], b"helloworld");
    }

    #[test]
    fn test_under_limit_is_untouched() {
        let capture = feed(10, &[b"hello", b"wor"]);
        assert!(!capture.truncated());
        assert_eq!(&capture.into_body()[..], b"hellowor");
    }

    #[test]
    fn test_reaching_limit_counts_as_truncated() {
        let capture = feed(10, &[b"hello", b"world"]);
        assert!(capture.truncated());
        assert_eq!(capture.len(), 10);
    }

    #[test]
    fn test_later_chunks_are_consumed_and_dropped() {
        let capture = feed(4, &[b"abcdef", b"ghij", b"klmn"]);
        assert!(capture.truncated());
        assert_eq!(&capture.into_body()[..], b"abcd");
    }

    #[test]
    fn test_zero_limit() {
        let capture = feed(0, &[b"x"]);
        assert!(capture.truncated());
        assert!(capture.is_empty());
    }

    #[test]
    fn test_limit_larger_than_any_transfer() {
        let chunk: &[u8] = b"0123456789";
        let chunks = vec![chunk; 100];
        let capture = feed(2000, &chunks);
        assert!(!capture.truncated());
        assert_eq!(capture.len(), 1000);
    }
}
