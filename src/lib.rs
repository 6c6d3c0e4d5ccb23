pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod serve;
pub mod utils;

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use error::{RelayError, Result};
pub use ingest::{Frame, FrameReceiver, ReadTimeouts, ReceiverHandle, ReceiverState, ReceiverStatus};
pub use pipeline::{BufferStats, FrameBuffer};
pub use serve::{AppContext, MjpegStream, StatusReport};

/// Prefix for environment overrides, e.g. `FRAMERELAY_RECEIVER__PORT=6000`
pub const ENV_PREFIX: &str = "FRAMERELAY";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub receiver: ReceiverConfig,
    pub buffer: BufferConfig,
    pub stream: StreamConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub bind_addr: String,
    pub port: u16,
    pub max_frame_size: usize,
    pub idle_timeout_ms: u64, // Per socket read
    pub read_timeout_ms: u64, // Per exact-length read
    pub bind_backoff_ms: u64,
    pub error_backoff_ms: u64, // Pause after a dropped connection
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".into(),
            port: 5555,
            max_frame_size: ingest::protocol::DEFAULT_MAX_FRAME_SIZE,
            idle_timeout_ms: 5_000,
            read_timeout_ms: 10_000,
            bind_backoff_ms: 5_000,
            error_backoff_ms: 1_000,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { capacity: 10 }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5000".into(),
        }
    }
}

impl ReceiverConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.bind_addr.parse().map_err(|_| {
            RelayError::invalid_config(format!("receiver.bind_addr {:?} is not an IP address", self.bind_addr))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn read_timeouts(&self) -> ReadTimeouts {
        ReadTimeouts {
            idle: Duration::from_millis(self.idle_timeout_ms),
            total: Duration::from_millis(self.read_timeout_ms),
        }
    }

    pub fn bind_backoff(&self) -> Duration {
        Duration::from_millis(self.bind_backoff_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

impl StreamConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl HttpConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .map_err(|_| RelayError::invalid_config(format!("http.bind {:?} is not a socket address", self.bind)))
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `FRAMERELAY_*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::new(
                &path.to_string_lossy(),
                config::FileFormat::Toml,
            ));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<()> {
        let receiver = &self.receiver;
        receiver.listen_addr()?;
        self.http.bind_addr()?;

        if self.buffer.capacity == 0 {
            return Err(RelayError::invalid_config("buffer.capacity must be at least 1"));
        }
        if receiver.max_frame_size == 0 || receiver.max_frame_size as u64 > u32::MAX as u64 {
            return Err(RelayError::invalid_config(
                "receiver.max_frame_size must be between 1 and 4294967295",
            ));
        }
        if receiver.idle_timeout_ms == 0 || receiver.read_timeout_ms == 0 {
            return Err(RelayError::invalid_config("receiver timeouts must be non-zero"));
        }
        if receiver.idle_timeout_ms > receiver.read_timeout_ms {
            return Err(RelayError::invalid_config(
                "receiver.idle_timeout_ms cannot exceed receiver.read_timeout_ms",
            ));
        }
        if self.stream.poll_interval_ms == 0 {
            return Err(RelayError::invalid_config("stream.poll_interval_ms must be non-zero"));
        }
        Ok(())
    }
}
