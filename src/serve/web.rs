//! HTTP surface: viewer page, MJPEG feed and status endpoint.
//!
//! - `GET /` — viewer page
//! - `GET /video_feed` — `multipart/x-mixed-replace` MJPEG stream
//! - `GET /status` — buffer depth and producer state as JSON

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{RelayError, Result};
use crate::ingest::ReceiverState;
use crate::serve::stream::{MjpegStream, CONTENT_TYPE};
use crate::{FrameBuffer, StreamConfig};

const INDEX_HTML: &str = include_str!("../../assets/index.html");

/// Shared state handed to every request handler
#[derive(Clone)]
pub struct AppContext {
    pub buffer: Arc<FrameBuffer>,
    pub receiver: Arc<ReceiverState>,
    pub stream: StreamConfig,
    /// Cancelled when the server shuts down; ends open video feeds
    pub shutdown: CancellationToken,
}

/// Body of `GET /status`
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusReport {
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub producer_connected: bool,
    pub server_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    pub frames_received: u64,
    pub frames_dropped: u64,
}

impl AppContext {
    pub fn status(&self) -> StatusReport {
        let receiver = self.receiver.status();
        StatusReport {
            queue_depth: self.buffer.depth(),
            queue_capacity: self.buffer.capacity(),
            producer_connected: receiver.producer_connected,
            server_running: receiver.running,
            peer: receiver.peer.map(|p| p.to_string()),
            frames_received: receiver.frames_received,
            frames_dropped: self.buffer.stats().frames_dropped,
        }
    }
}

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/video_feed", get(video_feed))
        .route("/status", get(status))
        .with_state(ctx)
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| RelayError::Bind { addr, source })
}

/// Serve until `ctx.shutdown` is cancelled
pub async fn serve(listener: TcpListener, ctx: AppContext) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Web server listening on http://{}", addr);
    }

    let shutdown = ctx.shutdown.clone();
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(RelayError::Http)
}

async fn index() -> Html<&'static str> {
    info!("Index page accessed");
    Html(INDEX_HTML)
}

async fn video_feed(State(ctx): State<AppContext>) -> Response {
    info!("Video feed accessed");
    let stream = MjpegStream::new(Arc::clone(&ctx.buffer), ctx.stream.poll_interval())
        .with_shutdown(ctx.shutdown.clone());

    (
        [
            (header::CONTENT_TYPE, CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream.into_stream()),
    )
        .into_response()
}

async fn status(State(ctx): State<AppContext>) -> Json<StatusReport> {
    Json(ctx.status())
}
