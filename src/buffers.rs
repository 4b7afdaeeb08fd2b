//! Fixed-capacity, pre-allocated buffers for the reliable channel: one read
//! buffer per connection (owned by the reader task) and one write buffer per
//! connection (shared between producers and the writer task under a lock).

use crate::wire::{encode_length_prefix, MAX_LENGTH_PREFIX};

/// Inbound frame assembly buffer. Bytes are read from the socket into the
/// unfilled tail; complete frames are consumed from the front and the
/// remainder compacted down once per read pass.
pub(crate) struct ReadBuffer {
    buf: Vec<u8>,
    consumed: usize,
    filled: usize,
}

impl ReadBuffer {
    /// `object_buffer_size` bounds a single payload; the buffer additionally
    /// holds the largest possible length prefix, so every legal frame fits.
    pub fn new(object_buffer_size: usize) -> ReadBuffer {
        ReadBuffer {
            buf: vec![0; object_buffer_size + MAX_LENGTH_PREFIX],
            consumed: 0,
            filled: 0,
        }
    }

    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.filled..]
    }

    pub fn advance(&mut self, n: usize) {
        assert!(self.filled + n <= self.buf.len());
        self.filled += n;
    }

    pub fn filled(&self) -> &[u8] {
        &self.buf[self.consumed..self.filled]
    }

    pub fn consume(&mut self, n: usize) {
        assert!(self.consumed + n <= self.filled);
        self.consumed += n;
    }

    pub fn compact(&mut self) {
        if self.consumed > 0 {
            self.buf.copy_within(self.consumed..self.filled, 0);
            self.filled -= self.consumed;
            self.consumed = 0;
        }
    }
}

/// Outbound buffer. A send call commits one whole frame (prefix + payload)
/// or fails; the writer task drains pending bytes to the socket, and bytes
/// it could not write yet stay queued.
pub(crate) struct WriteBuffer {
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl WriteBuffer {
    pub fn new(capacity: usize) -> WriteBuffer {
        WriteBuffer {
            buf: vec![0; capacity],
            start: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn pending_len(&self) -> usize {
        self.end - self.start
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.pending_len()
    }

    pub fn free_ratio(&self) -> f32 {
        self.free() as f32 / self.capacity() as f32
    }

    /// Frames `payload` and appends it. Returns the framed length, or the
    /// number of free bytes if the frame does not fit.
    pub fn push_frame(&mut self, payload: &[u8]) -> Result<usize, usize> {
        let mut prefix = [0u8; MAX_LENGTH_PREFIX];
        let prefix_len = encode_length_prefix(payload.len() as u32, &mut prefix);
        let total = prefix_len + payload.len();

        if total > self.free() {
            return Err(self.free());
        }
        if self.buf.len() - self.end < total {
            self.compact();
        }
        self.buf[self.end..self.end + prefix_len].copy_from_slice(&prefix[..prefix_len]);
        self.buf[self.end + prefix_len..self.end + total].copy_from_slice(payload);
        self.end += total;
        Ok(total)
    }

    /// Removes and returns all pending bytes, or `None` if there are none.
    pub fn take_pending(&mut self) -> Option<Vec<u8>> {
        if self.pending_len() == 0 {
            return None;
        }
        let pending = self.buf[self.start..self.end].to_vec();
        self.start = 0;
        self.end = 0;
        Some(pending)
    }

    fn compact(&mut self) {
        self.buf.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_write_buffer_frames_and_drains() {
        let mut buf = WriteBuffer::new(64);
        assert_eq!(buf.push_frame(b"abc"), Ok(4));
        assert_eq!(buf.push_frame(b""), Ok(1));
        assert_eq!(buf.free(), 64 - 5);

        assert_eq!(buf.take_pending().unwrap(), b"\x03abc\x00");
        assert_eq!(buf.free(), 64);
        assert!(buf.take_pending().is_none());
    }

    #[test]
    fn test_write_buffer_rejects_overflow() {
        let mut buf = WriteBuffer::new(16);
        assert_eq!(buf.push_frame(&[7u8; 10]), Ok(11));
        // 5 bytes free, frame would need 7
        assert_eq!(buf.push_frame(&[7u8; 6]), Err(5));
        // the rejected frame left no partial bytes behind
        assert_eq!(buf.take_pending().unwrap().len(), 11);
    }

    #[test]
    fn test_write_buffer_free_ratio() {
        let mut buf = WriteBuffer::new(100);
        assert_eq!(buf.free_ratio(), 1.0);
        buf.push_frame(&[0u8; 49]).unwrap();
        assert!(buf.free_ratio() < 0.51);
        assert!(buf.free_ratio() > 0.49);
    }

    #[test]
    fn test_read_buffer_assembles_across_reads() {
        let mut buf = ReadBuffer::new(64);

        // first chunk: prefix plus part of the payload
        buf.unfilled_mut()[..3].copy_from_slice(b"\x05ab");
        buf.advance(3);
        assert_eq!(buf.filled(), b"\x05ab");

        // second chunk completes the frame
        buf.unfilled_mut()[..3].copy_from_slice(b"cde");
        buf.advance(3);
        assert_eq!(buf.filled(), b"\x05abcde");

        buf.consume(6);
        assert!(buf.filled().is_empty());
        buf.compact();
        assert_eq!(buf.unfilled_mut().len(), 64 + MAX_LENGTH_PREFIX);
    }

    #[test]
    fn test_read_buffer_compaction_keeps_partial_frame() {
        let mut buf = ReadBuffer::new(64);
        buf.unfilled_mut()[..6].copy_from_slice(b"\x02xy\x03ab");
        buf.advance(6);

        buf.consume(3); // first frame processed, second one incomplete
        buf.compact();
        assert_eq!(buf.filled(), b"\x03ab");

        buf.unfilled_mut()[..1].copy_from_slice(b"c");
        buf.advance(1);
        assert_eq!(buf.filled(), b"\x03abc");
    }
}
