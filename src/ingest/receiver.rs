//! TCP frame receiver: accepts one producer at a time and feeds the buffer

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{RelayError, Result};
use crate::ingest::protocol::read_frame;
use crate::utils::sleep_or_cancel;
use crate::{Frame, FrameBuffer, ReceiverConfig};

/// Receiver state visible to the HTTP layer
#[derive(Debug, Default)]
pub struct ReceiverState {
    running: AtomicBool,
    peer: ArcSwapOption<SocketAddr>,
    frames_received: AtomicU64,
    connections_accepted: AtomicU64,
}

/// Point-in-time copy of [`ReceiverState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverStatus {
    pub running: bool,
    pub producer_connected: bool,
    pub peer: Option<SocketAddr>,
    pub frames_received: u64,
    pub connections_accepted: u64,
}

impl ReceiverState {
    pub fn status(&self) -> ReceiverStatus {
        let peer = self.peer.load().as_deref().copied();
        ReceiverStatus {
            running: self.running.load(Ordering::Acquire),
            producer_connected: peer.is_some(),
            peer,
            frames_received: self.frames_received.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
        }
    }

    pub fn producer_connected(&self) -> bool {
        self.peer.load().is_some()
    }

    fn next_sequence(&self) -> u64 {
        self.frames_received.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Why a connection ended
enum Exit {
    Stopped,
    Failed(RelayError),
}

/// Owns the producer listener and the connection read loop.
pub struct FrameReceiver {
    config: ReceiverConfig,
    buffer: Arc<FrameBuffer>,
    state: Arc<ReceiverState>,
    cancel: CancellationToken,
    listening: watch::Sender<Option<SocketAddr>>,
}

impl FrameReceiver {
    pub fn new(config: ReceiverConfig, buffer: Arc<FrameBuffer>) -> Self {
        let (listening, _) = watch::channel(None);
        Self {
            config,
            buffer,
            state: Arc::new(ReceiverState::default()),
            cancel: CancellationToken::new(),
            listening,
        }
    }

    pub fn state(&self) -> Arc<ReceiverState> {
        Arc::clone(&self.state)
    }

    /// Start the receive loop on its own task.
    pub fn spawn(self) -> ReceiverHandle {
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        let listening = self.listening.subscribe();

        state.running.store(true, Ordering::Release);
        let task = tokio::spawn(self.run());
        info!("Frame receiver task started");

        ReceiverHandle {
            state,
            cancel,
            listening,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(self) {
        if let Some(listener) = self.bind_with_retry().await {
            self.accept_loop(&listener).await;
        }

        self.state.peer.store(None);
        self.state.running.store(false, Ordering::Release);
        self.listening.send_replace(None);
        info!("Frame receiver stopped");
    }

    /// Bind failures are retried forever with a fixed backoff.
    async fn bind_with_retry(&self) -> Option<TcpListener> {
        loop {
            let addr = match self.config.listen_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    error!(error = %e, "Invalid listen address, receiver cannot start");
                    return None;
                }
            };

            info!(%addr, "Setting up producer socket");
            match bind_listener(addr) {
                Ok(listener) => {
                    let local = listener.local_addr().unwrap_or(addr);
                    info!(addr = %local, "Listening for producer");
                    self.listening.send_replace(Some(local));
                    return Some(listener);
                }
                Err(e) => {
                    error!(error = %e, source = ?std::error::Error::source(&e), "Failed to bind");
                    if !sleep_or_cancel(self.config.bind_backoff(), &self.cancel).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn accept_loop<L: ProducerListener>(&self, listener: &L) {
        loop {
            info!("Waiting for connection...");
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => return,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let exit = self.serve_connection(stream, peer).await;
                    if let Exit::Stopped = exit {
                        return;
                    }
                    info!("Connection closed, ready for new connection");
                    if !sleep_or_cancel(self.config.error_backoff(), &self.cancel).await {
                        return;
                    }
                }
                Err(e) => {
                    let e = RelayError::Accept(e);
                    warn!(error = %e, source = ?std::error::Error::source(&e), "Accept failed");
                    metrics::counter!("framerelay_connection_errors_total").increment(1);
                    if !sleep_or_cancel(self.config.error_backoff(), &self.cancel).await {
                        return;
                    }
                }
            }
        }
    }

    #[instrument(skip(self, stream))]
    async fn serve_connection(&self, mut stream: TcpStream, peer: SocketAddr) -> Exit {
        info!("Producer connected");
        self.state.peer.store(Some(Arc::new(peer)));
        self.state.connections_accepted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("framerelay_connections_total").increment(1);

        let exit = self.read_loop(&mut stream).await;

        self.state.peer.store(None);
        close_stream(stream).await;

        if let Exit::Failed(e) = &exit {
            log_connection_fault(e);
            if !matches!(e, RelayError::Disconnected) {
                metrics::counter!("framerelay_connection_errors_total").increment(1);
            }
        }
        exit
    }

    async fn read_loop(&self, stream: &mut TcpStream) -> Exit {
        let timeouts = self.config.read_timeouts();
        let max = self.config.max_frame_size;

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return Exit::Stopped,
                read = read_frame(stream, max, timeouts) => read,
            };

            match read {
                Ok(data) => {
                    let len = data.len();
                    let frame = Frame::new(data, self.state.next_sequence());
                    debug!(sequence = frame.sequence, len, "Frame received");

                    metrics::counter!("framerelay_frames_received_total").increment(1);
                    metrics::counter!("framerelay_bytes_received_total").increment(len as u64);
                    metrics::histogram!("framerelay_frame_size_bytes").record(len as f64);

                    self.buffer.push(frame);
                }
                Err(e) => return Exit::Failed(e),
            }
        }
    }
}

fn log_connection_fault(e: &RelayError) {
    match e {
        RelayError::Disconnected => info!("Producer closed the connection"),
        RelayError::Timeout { .. } => {
            warn!(error = %e, "Socket timeout - connection may be dead")
        }
        RelayError::FrameTooLarge { .. } => {
            warn!(error = %e, "Protocol violation, dropping connection")
        }
        other => error!(error = %other, source = ?std::error::Error::source(other), "Connection error"),
    }
}

/// Source of producer connections
trait ProducerListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

impl ProducerListener for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Listener with address reuse and keepalive, backlog of one producer
fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let bind = || -> io::Result<TcpListener> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.set_keepalive(true)?;
        socket.bind(addr)?;
        socket.listen(1)
    };
    bind().map_err(|source| RelayError::Bind { addr, source })
}

/// Shut the socket down; a peer that already went away is not an error.
async fn close_stream(mut stream: TcpStream) {
    match stream.shutdown().await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
        Err(e) => debug!(error = %e, "Socket shutdown failed"),
    }
}

/// Supervises the spawned receiver task.
pub struct ReceiverHandle {
    state: Arc<ReceiverState>,
    cancel: CancellationToken,
    listening: watch::Receiver<Option<SocketAddr>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReceiverHandle {
    pub fn state(&self) -> Arc<ReceiverState> {
        Arc::clone(&self.state)
    }

    pub fn status(&self) -> ReceiverStatus {
        self.state.status()
    }

    /// Wait until the listener is bound. `None` if the receiver stopped first.
    pub async fn listening(&self) -> Option<SocketAddr> {
        let mut rx = self.listening.clone();
        let addr = *rx.wait_for(Option::is_some).await.ok()?;
        addr
    }

    /// Wait up to `limit` for the listener to bind.
    pub async fn listening_within(&self, limit: Duration) -> Option<SocketAddr> {
        tokio::time::timeout(limit, self.listening()).await.ok().flatten()
    }

    /// Abort pending I/O, close the sockets and join the task. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(task) = task {
            info!("Stopping frame receiver");
            if let Err(e) = task.await {
                error!(error = %e, "Frame receiver task failed");
            }
        }
    }
}
