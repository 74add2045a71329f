//! Fixed-size pool of classification workers.
//!
//! Workers are OS threads because classification is CPU-bound; the
//! async side only shuttles frames. Each worker owns its scratch buffers
//! (scanner, taxa vector, hit-count map, translated frames) and shares
//! nothing mutable with its siblings: jobs come in over the bounded
//! queue and results leave over the per-stream channel carried inside
//! each job.

use std::sync::Arc;
use std::thread::JoinHandle;

use k2serve_core::classify::{
    classify_record, ClassificationResult, ClassificationStats, ClassifyOptions, ScratchBuffers,
};
use k2serve_core::counters::TaxonCounts;
use k2serve_core::sequence::SequenceRecord;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, warn};

use crate::config::ServerConfig;
use crate::index_holder::IndexHolder;
use crate::queue::BoundedQueue;

/// Pending job submissions the dispatchers may queue ahead of the
/// workers before backpressure kicks in.
const JOB_QUEUE_DEPTH: usize = 64;

/// Everything a worker produces for one request frame.
#[derive(Debug, Default)]
pub struct BatchResult {
    /// One result per well-formed record, in request order.
    pub results: Vec<ClassificationResult>,
    pub taxon_counters: TaxonCounts,
    pub stats: ClassificationStats,
}

/// One request frame plus the channel its results go back on.
pub struct ClassifyJob {
    pub records: Vec<SequenceRecord>,
    pub reply: UnboundedSender<BatchResult>,
}

/// Fixed pool created at server startup and shared by all streams.
pub struct WorkerPool {
    queue: Arc<BoundedQueue<ClassifyJob>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `num_workers` classification threads.
    #[must_use]
    pub fn new(num_workers: u32, holder: Arc<IndexHolder>, config: &ServerConfig) -> Self {
        let queue = Arc::new(BoundedQueue::new(JOB_QUEUE_DEPTH));
        let mut handles = Vec::with_capacity(num_workers as usize);
        for worker_id in 0..num_workers {
            let queue = Arc::clone(&queue);
            let holder = Arc::clone(&holder);
            let config = config.clone();
            let handle = std::thread::Builder::new()
                .name(format!("classify-worker-{worker_id}"))
                .spawn(move || worker_main(worker_id, &queue, &holder, &config))
                .expect("spawning classification worker thread");
            handles.push(handle);
        }
        Self {
            queue,
            handles: Mutex::new(handles),
        }
    }

    /// The job queue dispatchers submit into.
    #[must_use]
    pub fn queue(&self) -> &Arc<BoundedQueue<ClassifyJob>> {
        &self.queue
    }

    /// Close the job queue and wait for workers to drain it.
    pub fn shutdown(&self) {
        self.queue.close();
        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                warn!("classification worker panicked during shutdown");
            }
        }
    }
}

fn worker_main(
    worker_id: u32,
    queue: &BoundedQueue<ClassifyJob>,
    holder: &IndexHolder,
    config: &ServerConfig,
) {
    // Scratch is built lazily: the scanner geometry comes from the index,
    // which finishes loading after the pool starts.
    let mut scratch: Option<(ScratchBuffers, ClassifyOptions)> = None;

    while let Some(job) = queue.pop() {
        let Some(index) = holder.get() else {
            // Streams are only admitted against a ready index, so a job
            // without one means the dispatcher raced a broken load.
            warn!(worker_id, "dropping job: index not available");
            continue;
        };
        let (scratch, opts) = scratch.get_or_insert_with(|| {
            (
                ScratchBuffers::new(&index.options),
                config.classify_options(&index.options),
            )
        });

        // A panic out of the classification core means the shared index
        // can no longer be trusted; take the whole process down.
        let records = job.records;
        let batch = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            process_records(records, &index, opts, scratch)
        }))
        .unwrap_or_else(|_| {
            error!(worker_id, "unrecoverable classification failure; aborting");
            std::process::exit(crate::config::exit_code::SOFTWARE);
        });

        if job.reply.send(batch).is_err() {
            // Stream already torn down; results are moot.
            debug!(worker_id, "result channel closed before batch delivery");
        }
    }
}

fn process_records(
    records: Vec<SequenceRecord>,
    index: &k2serve_core::Index,
    opts: &ClassifyOptions,
    scratch: &mut ScratchBuffers,
) -> BatchResult {
    let mut batch = BatchResult {
        results: Vec::with_capacity(records.len()),
        ..BatchResult::default()
    };
    for mut record in records {
        if !record.is_well_formed() {
            warn!(
                id = %record.id,
                seq_len = record.seq.len(),
                quals_len = record.quals.len(),
                "invalid record: quality string length mismatch; dropping"
            );
            continue;
        }
        let result = classify_record(
            &mut record,
            index,
            opts,
            &mut batch.stats,
            &mut batch.taxon_counters,
            scratch,
        );
        batch.results.push(result);
    }
    batch
}
