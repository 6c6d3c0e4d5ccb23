//! Multipart MJPEG stream adapter
//!
//! Each HTTP client owns one [`MjpegStream`]. The stream never ends on its
//! own: it polls the shared buffer, idling briefly while it is empty, until
//! the HTTP layer drops it because the client went away, or until the
//! server shuts down.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Frame, FrameBuffer};

/// Multipart boundary token
pub const BOUNDARY: &str = "frame";

/// Response content type for the video feed
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
const PART_TRAILER: &[u8] = b"\r\n";

/// Wrap one frame as a multipart body part
pub fn encode_part(frame: &Frame) -> Bytes {
    let mut part = BytesMut::with_capacity(PART_HEADER.len() + frame.len() + PART_TRAILER.len());
    part.put_slice(PART_HEADER);
    part.put_slice(&frame.data);
    part.put_slice(PART_TRAILER);
    part.freeze()
}

/// Per-client cursor over the shared frame buffer
pub struct MjpegStream {
    buffer: Arc<FrameBuffer>,
    poll_interval: Duration,
    shutdown: Option<CancellationToken>,
    parts_sent: u64,
}

impl MjpegStream {
    pub fn new(buffer: Arc<FrameBuffer>, poll_interval: Duration) -> Self {
        debug!("Stream consumer attached");
        Self {
            buffer,
            poll_interval,
            shutdown: None,
            parts_sent: 0,
        }
    }

    /// End the body stream once `token` is cancelled
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Next encoded part if a frame is buffered, `None` while pending
    pub fn pull_next_chunk(&mut self) -> Option<Bytes> {
        let frame = self.buffer.try_pop()?;
        self.parts_sent += 1;
        metrics::histogram!("framerelay_frame_queue_seconds").record(frame.age().as_secs_f64());
        Some(encode_part(&frame))
    }

    /// Wait for the next frame, idling `poll_interval` between polls
    pub async fn next_chunk(&mut self) -> Bytes {
        loop {
            if let Some(chunk) = self.pull_next_chunk() {
                return chunk;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub fn parts_sent(&self) -> u64 {
        self.parts_sent
    }

    /// Body stream; ends only when the consumer drops it or on shutdown
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        futures::stream::unfold(self, |mut stream| async move {
            let chunk = match stream.shutdown.clone() {
                Some(token) => tokio::select! {
                    _ = token.cancelled() => return None,
                    chunk = stream.next_chunk() => chunk,
                },
                None => stream.next_chunk().await,
            };
            Some((Ok::<_, Infallible>(chunk), stream))
        })
    }
}

impl Drop for MjpegStream {
    fn drop(&mut self) {
        debug!(parts_sent = self.parts_sent, "Stream consumer detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn part_wraps_payload_with_boundary() {
        let frame = Frame::new(Bytes::from_static(b"JPEG"), 1);
        let part = encode_part(&frame);
        assert_eq!(
            &part[..],
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\nJPEG\r\n".as_slice()
        );
        assert!(CONTENT_TYPE.ends_with(BOUNDARY));
    }

    #[test]
    fn pull_reports_pending_on_empty_buffer() {
        let buffer = Arc::new(FrameBuffer::new(2));
        let mut stream = MjpegStream::new(Arc::clone(&buffer), Duration::from_millis(10));
        assert!(stream.pull_next_chunk().is_none());

        buffer.push(Frame::new(Bytes::from_static(b"x"), 1));
        assert!(stream.pull_next_chunk().is_some());
        assert!(stream.pull_next_chunk().is_none());
        assert_eq!(stream.parts_sent(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_waits_for_frames_in_order() {
        let buffer = Arc::new(FrameBuffer::new(4));
        let mut body = Box::pin(
            MjpegStream::new(Arc::clone(&buffer), Duration::from_millis(10)).into_stream(),
        );

        let producer = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                buffer.push(Frame::new(Bytes::from_static(b"A"), 1));
                buffer.push(Frame::new(Bytes::from_static(b"B"), 2));
            })
        };

        let first = body.next().await.unwrap().unwrap();
        let second = body.next().await.unwrap().unwrap();
        assert!(first.ends_with(b"\r\n\r\nA\r\n"));
        assert!(second.ends_with(b"\r\n\r\nB\r\n"));
        producer.await.unwrap();

        // still pending, never exhausted
        let pending = tokio::time::timeout(Duration::from_secs(1), body.next()).await;
        assert!(pending.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_ends_the_stream() {
        let buffer = Arc::new(FrameBuffer::new(2));
        let token = CancellationToken::new();
        let mut body = Box::pin(
            MjpegStream::new(buffer, Duration::from_millis(10))
                .with_shutdown(token.clone())
                .into_stream(),
        );

        token.cancel();
        assert!(body.next().await.is_none());
    }
}
