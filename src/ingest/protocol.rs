//! Producer wire format
//!
//! Each frame is sent as:
//! - 4 bytes: payload length (big-endian u32)
//! - N bytes: JPEG payload
//!
//! There is no handshake, acknowledgement or checksum. A length over the
//! configured maximum aborts the connection; the stream is never
//! resynchronised.

use std::io;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout, Instant};
use tracing::trace;

use crate::error::{RelayError, Result};

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default upper bound on a single payload
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10_000_000;

/// Largest slice requested from the socket per read call
const READ_CHUNK: usize = 8192;

/// Deadlines applied to every exact-length read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadTimeouts {
    /// Longest wait for any single socket read
    pub idle: Duration,
    /// Longest wait for the whole exact-length read
    pub total: Duration,
}

impl Default for ReadTimeouts {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(5),
            total: Duration::from_secs(10),
        }
    }
}

/// Read exactly `n` bytes, accumulating partial reads.
///
/// An idle read is retried until `total` has elapsed since the call began.
/// EOF before `n` bytes is a lost connection, never a short frame.
pub async fn read_exact_within<R>(reader: &mut R, n: usize, timeouts: ReadTimeouts) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; n];
    let mut filled = 0;
    let deadline = Instant::now() + timeouts.total;

    while filled < n {
        let now = Instant::now();
        if now >= deadline {
            return Err(RelayError::Timeout {
                duration: timeouts.total,
                received: filled,
                expected: n,
            });
        }

        let wait = timeouts.idle.min(deadline - now);
        let end = filled + (n - filled).min(READ_CHUNK);

        match timeout(wait, reader.read(&mut buf[filled..end])).await {
            Err(_) => {
                trace!(filled, expected = n, "socket idle, still waiting");
            }
            Ok(Ok(0)) => {
                return Err(RelayError::ConnectionClosed {
                    received: filled,
                    expected: n,
                });
            }
            Ok(Ok(read)) => filled += read,
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
            Ok(Err(e)) => return Err(RelayError::Io(e)),
        }
    }

    Ok(Bytes::from(buf))
}

/// Read one length-prefixed frame payload.
///
/// A stream that ends exactly on a frame boundary yields
/// [`RelayError::Disconnected`].
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize, timeouts: ReadTimeouts) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = match read_exact_within(reader, LENGTH_PREFIX_SIZE, timeouts).await {
        Err(RelayError::ConnectionClosed { received: 0, .. }) => {
            return Err(RelayError::Disconnected)
        }
        other => other?,
    };

    let len = prefix.get_u32() as usize;
    if len > max_frame_size {
        return Err(RelayError::FrameTooLarge {
            len,
            max: max_frame_size,
        });
    }

    read_exact_within(reader, len, timeouts).await
}

/// Producer side: prepend the length prefix to a payload
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncWriteExt, ReadBuf};

    /// Hands out the wire bytes in fixed-size slices, one slice per read call.
    struct Trickle {
        data: Bytes,
        chunks: Vec<usize>,
        next: usize,
    }

    impl Trickle {
        fn new(data: Bytes, chunks: Vec<usize>) -> Self {
            Self {
                data,
                chunks,
                next: 0,
            }
        }
    }

    impl AsyncRead for Trickle {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.data.is_empty() {
                return Poll::Ready(Ok(()));
            }
            let wanted = if self.chunks.is_empty() {
                1
            } else {
                self.chunks[self.next % self.chunks.len()].max(1)
            };
            self.next += 1;
            let n = wanted.min(buf.remaining()).min(self.data.len());
            let chunk = self.data.split_to(n);
            buf.put_slice(&chunk);
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn reassembles_hello_from_single_byte_reads() {
        let wire = encode_frame(b"HELLO");
        assert_eq!(&wire[..4], &[0, 0, 0, 5]);

        let mut reader = Trickle::new(wire, vec![1; 9]);
        let frame = read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE, ReadTimeouts::default())
            .await
            .unwrap();
        assert_eq!(&frame[..], b"HELLO");

        // exactly once: the stream is now at a clean boundary
        let next = read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE, ReadTimeouts::default()).await;
        assert!(matches!(next, Err(RelayError::Disconnected)));
    }

    #[tokio::test]
    async fn empty_payload_is_a_valid_frame() {
        let mut reader = Trickle::new(encode_frame(b""), vec![4]);
        let frame = read_frame(&mut reader, 16, ReadTimeouts::default()).await.unwrap();
        assert!(frame.is_empty());
    }

    #[tokio::test]
    async fn oversized_length_aborts_before_payload() {
        let mut wire = BytesMut::new();
        wire.put_u32(17);
        wire.put_slice(&encode_frame(b"next"));
        let mut reader = Trickle::new(wire.freeze(), vec![64]);

        let err = read_frame(&mut reader, 16, ReadTimeouts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::FrameTooLarge { len: 17, max: 16 }));
        // the following bytes were left untouched
        assert_eq!(reader.data.len(), 8);
    }

    #[tokio::test]
    async fn length_at_maximum_is_accepted() {
        let payload = vec![0xAB; 32];
        let mut reader = Trickle::new(encode_frame(&payload), vec![7]);
        let frame = read_frame(&mut reader, 32, ReadTimeouts::default()).await.unwrap();
        assert_eq!(&frame[..], &payload[..]);
    }

    #[tokio::test]
    async fn eof_inside_payload_is_connection_loss() {
        let wire = encode_frame(b"HELLO").slice(..7);
        let mut reader = Trickle::new(wire, vec![2]);
        let err = read_frame(&mut reader, 16, ReadTimeouts::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::ConnectionClosed {
                received: 3,
                expected: 5
            }
        ));
    }

    #[tokio::test]
    async fn eof_inside_prefix_is_connection_loss() {
        let mut reader = Trickle::new(Bytes::from_static(&[0, 0]), vec![1]);
        let err = read_frame(&mut reader, 16, ReadTimeouts::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::ConnectionClosed {
                received: 2,
                expected: 4
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_read_times_out_after_total_deadline() {
        let (mut producer, mut consumer) = tokio::io::duplex(64);
        producer.write_all(&[0, 0]).await.unwrap();

        let timeouts = ReadTimeouts {
            idle: Duration::from_secs(5),
            total: Duration::from_secs(10),
        };
        let started = Instant::now();
        let err = read_frame(&mut consumer, 16, timeouts).await.unwrap_err();

        assert!(matches!(
            err,
            RelayError::Timeout {
                received: 2,
                expected: 4,
                ..
            }
        ));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(11));
        drop(producer);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_gap_shorter_than_deadline_is_tolerated() {
        let (mut producer, mut consumer) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            producer.write_all(&[0, 0, 0, 3, b'a']).await.unwrap();
            // longer than one idle window, shorter than the total deadline
            tokio::time::sleep(Duration::from_secs(7)).await;
            producer.write_all(b"bc").await.unwrap();
            producer
        });

        let frame = read_frame(&mut consumer, 16, ReadTimeouts::default())
            .await
            .unwrap();
        assert_eq!(&frame[..], b"abc");
        drop(writer.await.unwrap());
    }

    proptest! {
        #[test]
        fn prop_partial_reads_reconstruct_payload(
            payload in prop::collection::vec(any::<u8>(), 0..4096),
            chunks in prop::collection::vec(1usize..64, 1..16),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let frame = rt.block_on(async {
                let mut reader = Trickle::new(encode_frame(&payload), chunks);
                read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE, ReadTimeouts::default()).await
            });
            prop_assert_eq!(&frame.unwrap()[..], &payload[..]);
        }
    }
}
