//! tapeline - end-of-day trade burst pipeline
//!
//! Process wiring: configuration from the environment, in-process log
//! and side cache, sqlite trade store, filesystem archive. Runs until
//! ctrl-c, then drains every engine inside the bounded shutdown window.
//!
//! Set `TAPELINE_REPLAY_ARCHIVE=<path>` to replay an archived batch file
//! through the inlet at startup (the archive bodies are self-describing,
//! so any `.bin` the sink produced can be fed back).

use std::sync::Arc;

use anyhow::{Context, Result};
use dotenv::dotenv;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tapeline::{
    codec::registry::MemoryRegistry,
    coldpath::{StaticRefData, TradeStore},
    config::Config,
    ingest::archive,
    transport::{cache::MemoryCache, object_store::FsObjectStore},
    Pipeline,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tapeline=info")),
        )
        .init();

    let config = Config::from_env();
    info!(
        gateway = %config.ingest.gateway_id,
        trade_db = %config.trade_db_path,
        archive_root = %config.archive_root,
        "tapeline_starting"
    );

    let cache = Arc::new(MemoryCache::new());
    let object_store = Arc::new(FsObjectStore::new(config.archive_root.clone()));
    let trade_store =
        Arc::new(TradeStore::open(&config.trade_db_path).context("open trade store")?);
    let registry = Arc::new(MemoryRegistry::new(config.codec.compatibility_level.clone()));
    let refdata = Arc::new(StaticRefData::new());

    let pipeline = Pipeline::start(
        config,
        cache,
        object_store,
        trade_store,
        registry,
        refdata,
    )
    .context("start pipeline")?;

    if let Ok(path) = std::env::var("TAPELINE_REPLAY_ARCHIVE") {
        if let Err(e) = replay_archive(&pipeline, &path).await {
            error!(path = %path, error = %e, "replay_failed");
        }
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut summary = tokio::time::interval(std::time::Duration::from_secs(30));
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("listen for ctrl-c")?;
                info!("shutdown_requested");
                break;
            }
            _ = summary.tick() => pipeline.log_summary(),
        }
    }

    pipeline.shutdown().await
}

/// Feed an archived batch file back through the inlet.
async fn replay_archive(pipeline: &Pipeline, path: &str) -> Result<()> {
    let body = tokio::fs::read(path).await.context("read archive file")?;
    let frames =
        archive::deserialize_batch(&body).context("archive file is not a batch body")?;
    let total = frames.len();
    let mut submitted = 0usize;
    for frame in frames {
        if pipeline.ingest.submit(frame.bytes).await.is_err() {
            warn!(submitted, total, "replay_inlet_closed");
            break;
        }
        submitted += 1;
    }
    info!(submitted, total, path = %path, "replay_complete");
    Ok(())
}
