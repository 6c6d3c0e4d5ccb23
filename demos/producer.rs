//! Test producer: pushes JPEG files (or synthetic payloads) to a relay.
//!
//! ```bash
//! cargo run --example producer -- 127.0.0.1:5555 ./frames
//! ```

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{info, warn};

use framerelay::ingest::encode_frame;

const FRAME_INTERVAL: Duration = Duration::from_millis(33);

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt().with_env_filter("producer=info").init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:5555".into());
    let frames = match args.next() {
        Some(dir) => load_frames(PathBuf::from(dir))?,
        None => synthetic_frames(),
    };
    info!("Sending {} distinct frames to {}", frames.len(), addr);

    loop {
        match TcpStream::connect(&addr).await {
            Ok(mut stream) => {
                info!("Connected to {}", addr);
                for frame in frames.iter().cycle() {
                    if let Err(e) = stream.write_all(&encode_frame(frame)).await {
                        warn!("Send failed: {}", e);
                        break;
                    }
                    tokio::time::sleep(FRAME_INTERVAL).await;
                }
            }
            Err(e) => warn!("Connect failed: {}", e),
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

fn load_frames(dir: PathBuf) -> Result<Vec<Bytes>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
        })
        .collect();
    paths.sort();

    if paths.is_empty() {
        return Err(eyre!("No JPEG files found in {:?}", dir));
    }

    paths
        .into_iter()
        .map(|p| -> Result<Bytes> { Ok(Bytes::from(std::fs::read(p)?)) })
        .collect()
}

fn synthetic_frames() -> Vec<Bytes> {
    (0u8..30)
        .map(|i| {
            // SOI, counter byte, EOI: not a viewable image, but enough to watch the relay
            Bytes::from(vec![0xFF, 0xD8, i, 0xFF, 0xD9])
        })
        .collect()
}
