//! Server assembly: index lifecycle, worker pool, signals, transport.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use crate::config::{exit_code, ServerConfig};
use crate::grpc::ClassifierService;
use crate::index_holder::IndexHolder;
use crate::shutdown::ShutdownLatch;
use crate::stats::StatisticsAggregator;
use crate::worker_pool::WorkerPool;

/// Run the classification server until the shutdown latch fires.
///
/// Returns the process exit code: 0 after a clean run with a usable
/// index, `EX_IOERR` when the index never became ready.
///
/// # Errors
///
/// Returns an error for unrecoverable setup problems (bad listen
/// address, port in use, signal handler installation).
pub async fn run(config: ServerConfig) -> Result<i32> {
    let latch = Arc::new(ShutdownLatch::new());
    install_signal_handlers(&latch)?;

    let holder = Arc::new(IndexHolder::new());
    holder.spawn_load(config.db_path.clone(), config.memory_mapping, config.wait);

    let pool = Arc::new(WorkerPool::new(
        config.thread_pool,
        Arc::clone(&holder),
        &config,
    ));
    let stats = Arc::new(StatisticsAggregator::new(!config.no_stats));

    let addr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.host, config.port))?;

    let service = ClassifierService::new(
        Arc::clone(&holder),
        Arc::clone(&pool),
        stats,
        Arc::clone(&latch),
        config.report_options(),
    );

    info!(%addr, workers = config.thread_pool, "server listening");
    service
        .serve(addr, Arc::clone(&latch), config.max_queue)
        .await
        .context("transport failure")?;

    info!("transport stopped; draining worker pool");
    pool.shutdown();

    Ok(if holder.ready() {
        exit_code::OK
    } else {
        exit_code::IOERR
    })
}

/// Route interrupt/terminate/quit onto the shutdown latch.
fn install_signal_handlers(latch: &Arc<ShutdownLatch>) -> Result<()> {
    for kind in [
        SignalKind::interrupt(),
        SignalKind::terminate(),
        SignalKind::quit(),
    ] {
        let mut stream = signal(kind).context("installing signal handler")?;
        let latch = Arc::clone(latch);
        tokio::spawn(async move {
            if stream.recv().await.is_some() {
                info!("termination signal received");
                latch.fire();
            }
        });
    }
    Ok(())
}
