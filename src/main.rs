//! hdmirx capture service

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use hdmirx::buffer::HeapAllocator;
use hdmirx::capture::V4l2Device;
use hdmirx::display::{LogDisplay, LogNotifier};
use hdmirx::encode::FileEncoderFactory;
use hdmirx::transform::{SoftBlit, SoftDeinterlace, SoftRange};
use hdmirx::{utils, Collaborators, Command, Config, Pipeline};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hdmirx=info"));
    let fmt = tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime());
    let registry = tracing_subscriber::registry().with(filter).with(fmt);

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    info!("hdmirx launching...");

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let mut config = Config::load(path.as_deref())?;
    if config.capture.device.is_empty() {
        config.capture.device = utils::auto_detect_device()?;
    }
    info!("Using capture device: {}", config.capture.device);

    let device = Arc::new(V4l2Device::open(&config.capture.device)?);
    let allocator = Arc::new(HeapAllocator::new());
    let collaborators = Collaborators {
        device,
        allocator: allocator.clone(),
        display: Arc::new(LogDisplay::new()),
        notifier: Arc::new(LogNotifier),
        range: Arc::new(SoftRange::new(allocator.clone())),
        deinterlace: Arc::new(SoftDeinterlace::new(allocator.clone())),
        blit: Arc::new(SoftBlit::new(allocator.clone())),
        encoder: Arc::new(FileEncoderFactory::new(allocator)),
    };

    let pipeline = Arc::new(Pipeline::new(config, collaborators)?);
    pipeline.start()?;

    // Commands arrive one per line on stdin, e.g. `pq status=1 mode=5`.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        // stdin closed; keep streaming until interrupted
                        tokio::signal::ctrl_c().await?;
                        info!("Shutting down...");
                        break;
                    }
                    Err(e) => {
                        error!("command input failed: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let command = match line.parse::<Command>() {
                    Ok(command) => command,
                    Err(e) => {
                        warn!("{}", e);
                        continue;
                    }
                };
                let worker = pipeline.clone();
                match tokio::task::spawn_blocking(move || worker.dispatch(command)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("command failed: {}", e),
                    Err(e) => error!("command task failed: {}", e),
                }
                info!(stats = ?pipeline.stats(), "command applied");
            }
        }
    }

    let report = tokio::task::spawn_blocking(move || pipeline.stop()).await?;
    info!(?report, "hdmirx stopped");
    Ok(())
}
