//! framepipe: synthetic camera -> disk writer -> FFT extraction

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use framepipe::capture::SyntheticCamera;
use framepipe::{Config, ImageQueue, Pipeline, WaitStatus};

const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("framepipe=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("framepipe launching...");

    // Load configuration
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    info!("Configuration: {:?}", config);

    let (control, stream) = SyntheticCamera::open(&config.capture);
    let pipeline = Arc::new(Pipeline::build(&config, control, stream)?);
    pipeline.start()?;

    // The host side of the last stage is a single blocking consumer
    let running = Arc::new(AtomicBool::new(true));
    let mut drain = tokio::task::spawn_blocking({
        let pipeline = Arc::clone(&pipeline);
        let running = Arc::clone(&running);
        let limit = config.capture.frame_limit;
        move || drain_until_done(&pipeline, &running, limit)
    });

    let consumed = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted, stopping");
            running.store(false, Ordering::Release);
            drain.await?
        }
        consumed = &mut drain => consumed?,
    };

    pipeline.stop()?;
    pipeline.shutdown()?;

    let stats = pipeline.stats();
    info!("Consumed {} results", consumed);
    info!(
        "Source: pushed={} dropped={} buffers allocated={} recycled={}",
        stats.source.pushed, stats.source.dropped, stats.pool.allocated, stats.pool.recycled
    );
    if let Some(writer) = stats.writer {
        info!(
            "Disk writer: written={} forwarded={} dropped={}",
            stats.written_images, writer.pushed, writer.dropped
        );
    }
    if let Some(transform) = stats.transform {
        info!(
            "Transform: processed={} dropped={}",
            stats.processed_images, transform.dropped
        );
    }

    info!("framepipe shutting down");
    Ok(())
}

/// Consume the end of the pipeline until stopped or until the source has
/// produced its frame limit and everything downstream has gone quiet.
fn drain_until_done(pipeline: &Pipeline, running: &AtomicBool, limit: Option<u64>) -> u64 {
    let mut consumed = 0;

    while running.load(Ordering::Acquire) {
        let taken = if let Some(transform) = pipeline.transform() {
            take_available(transform)
        } else if let Some(output) = pipeline.frame_output() {
            take_available(output)
        } else {
            std::thread::sleep(DRAIN_TIMEOUT);
            Some(0)
        };

        for (stage, message) in pipeline.errors() {
            warn!(stage, "{}", message);
        }

        match taken {
            Some(0) => {
                let source = pipeline.source().queue_stats();
                let produced_all =
                    limit.is_some_and(|limit| source.pushed + source.dropped >= limit);
                if produced_all && source.popped == source.pushed {
                    break;
                }
            }
            Some(n) => consumed += n,
            None => break,
        }
    }

    consumed
}

/// Pop everything available on `stage`; None once the stage has closed.
fn take_available<Q: ImageQueue + ?Sized>(stage: &Q) -> Option<u64> {
    match stage.wait_images(1, DRAIN_TIMEOUT) {
        WaitStatus::Satisfied => {
            let count = stage.available_images();
            Some(stage.get_images(count).map_or(0, |items| items.len() as u64))
        }
        WaitStatus::TimedOut => Some(0),
        WaitStatus::Failed => None,
    }
}
