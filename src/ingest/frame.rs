use bytes::Bytes;
use std::time::{Duration, Instant};

/// One JPEG image received from the producer.
///
/// The payload is never inspected; it is relayed exactly as it arrived.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across tasks without copying
    pub data: Bytes,

    /// Receiver-wide sequence number, starting at 1
    pub sequence: u64,

    /// When the last payload byte was read
    pub received_at: Instant,
}

impl Frame {
    pub fn new(data: Bytes, sequence: u64) -> Self {
        Self {
            data,
            sequence,
            received_at: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Time spent since the frame was received
    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_reports_payload_length() {
        let frame = Frame::new(Bytes::from_static(b"HELLO"), 1);
        assert_eq!(frame.len(), 5);
        assert!(!frame.is_empty());
        assert_eq!(frame.sequence, 1);

        let empty = Frame::new(Bytes::new(), 2);
        assert!(empty.is_empty());
    }

    #[test]
    fn age_grows_after_receipt() {
        let frame = Frame::new(Bytes::from_static(b"x"), 1);
        std::thread::sleep(Duration::from_millis(5));
        assert!(frame.age() >= Duration::from_millis(5));
    }
}
