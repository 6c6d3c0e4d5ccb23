//! Frame relay: TCP JPEG producer in, MJPEG over HTTP out

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::{eyre::WrapErr, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use framerelay::serve::web;
use framerelay::{utils, AppContext, Config, FrameBuffer, FrameReceiver};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("framerelay=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Frame relay launching...");

    // Load configuration: first argument, else FRAMERELAY_CONFIG
    let config_path = std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("FRAMERELAY_CONFIG"))
        .map(PathBuf::from);
    let config = Config::load(config_path.as_deref()).wrap_err("loading configuration")?;
    config.validate()?;
    info!("Using configuration: {:?}", config);

    let listener = web::bind(config.http.bind_addr()?).await?;
    let buffer = Arc::new(FrameBuffer::new(config.buffer.capacity));

    // Spawn receiver task
    let receiver = FrameReceiver::new(config.receiver.clone(), Arc::clone(&buffer)).spawn();

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            utils::shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let ctx = AppContext {
        buffer,
        receiver: receiver.state(),
        stream: config.stream.clone(),
        shutdown,
    };

    let served = web::serve(listener, ctx).await;

    receiver.stop().await;
    served.wrap_err("serving HTTP")?;

    info!("Frame relay shutting down");
    Ok(())
}
