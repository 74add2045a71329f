//! gRPC service implementation for the classification server.
//!
//! The interesting call is `ClassifyStream`: request frames are fanned
//! out to the worker pool while a forwarder task fans completed batches
//! back onto the response stream. Responses may leave in a different
//! order than their requests arrived; within one frame the original
//! record order is preserved.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use k2serve_core::report::ReportOptions;
use k2serve_proto::classify_service_server::{ClassifyService, ClassifyServiceServer};
use k2serve_proto::{
    stream_result, Classification, ReadyReply, ReadyRequest, SequenceBatch, ShutdownReply,
    ShutdownRequest, StreamResult, SummaryReply, SummaryRequest, MAX_FRAME_BYTES,
};
use prost::Message;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::index_holder::IndexHolder;
use crate::queue::TryPushError;
use crate::shutdown::ShutdownLatch;
use crate::stats::{StatisticsAggregator, StreamStats};
use crate::worker_pool::{BatchResult, ClassifyJob, WorkerPool};

/// Outbound frames buffered per stream before the transport applies its
/// own backpressure.
const RESPONSE_BUFFER: usize = 64;

/// Delay between job-queue submission retries while the workers are
/// saturated.
const SUBMIT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// The classification service handed to tonic.
pub struct ClassifierService {
    holder: Arc<IndexHolder>,
    pool: Arc<WorkerPool>,
    stats: Arc<StatisticsAggregator>,
    latch: Arc<ShutdownLatch>,
    report_opts: ReportOptions,
}

impl ClassifierService {
    #[must_use]
    pub fn new(
        holder: Arc<IndexHolder>,
        pool: Arc<WorkerPool>,
        stats: Arc<StatisticsAggregator>,
        latch: Arc<ShutdownLatch>,
        report_opts: ReportOptions,
    ) -> Self {
        Self {
            holder,
            pool,
            stats,
            latch,
            report_opts,
        }
    }

    /// Wrap into the generated server type with the frame cap applied to
    /// both directions.
    #[must_use]
    pub fn into_server(self) -> ClassifyServiceServer<Self> {
        ClassifyServiceServer::new(self)
            .max_decoding_message_size(MAX_FRAME_BYTES)
            .max_encoding_message_size(MAX_FRAME_BYTES)
    }

    /// Serve on `addr` until the shutdown latch fires, then stop
    /// accepting new streams and let in-flight streams finish.
    ///
    /// # Errors
    ///
    /// Returns transport errors (e.g. the port is already taken).
    pub async fn serve(
        self,
        addr: SocketAddr,
        latch: Arc<ShutdownLatch>,
        max_queue: usize,
    ) -> Result<(), tonic::transport::Error> {
        let mut builder = Server::builder();
        if max_queue > 0 {
            builder = builder.concurrency_limit_per_connection(max_queue);
        }
        builder
            .add_service(self.into_server())
            .serve_with_shutdown(addr, async move { latch.wait().await })
            .await
    }
}

#[tonic::async_trait]
impl ClassifyService for ClassifierService {
    /// Readiness probe. The reply only flows once the index is loaded;
    /// until then callers see `UNAVAILABLE` (still loading) or
    /// `FAILED_PRECONDITION` (load failed, terminal).
    async fn server_ready(
        &self,
        _request: Request<ReadyRequest>,
    ) -> Result<Response<ReadyReply>, Status> {
        self.holder.gate()?;
        Ok(Response::new(ReadyReply { ready: true }))
    }

    async fn remote_shutdown(
        &self,
        _request: Request<ShutdownRequest>,
    ) -> Result<Response<ShutdownReply>, Status> {
        info!("received shutdown request");
        self.latch.fire();
        Ok(Response::new(ShutdownReply { successful: true }))
    }

    async fn get_summary(
        &self,
        _request: Request<SummaryRequest>,
    ) -> Result<Response<SummaryReply>, Status> {
        let index = self.holder.gate()?;
        Ok(Response::new(SummaryReply {
            summary: self
                .stats
                .render_summary(&index.taxonomy, &self.report_opts),
        }))
    }

    type ClassifyStreamStream = Pin<Box<dyn Stream<Item = Result<StreamResult, Status>> + Send>>;

    async fn classify_stream(
        &self,
        request: Request<Streaming<SequenceBatch>>,
    ) -> Result<Response<Self::ClassifyStreamStream>, Status> {
        let index = self.holder.gate()?;
        let mut inbound = request.into_inner();

        let (tx, rx) = mpsc::channel::<Result<StreamResult, Status>>(RESPONSE_BUFFER);
        // Fan-in channel: every submitted job holds a sender clone, so
        // the receiver closes exactly when the dispatcher is done and
        // the last worker has delivered its batch.
        let (result_tx, result_rx) = mpsc::unbounded_channel::<BatchResult>();

        let forwarder = tokio::spawn(forward_results(result_rx, tx.clone()));

        let pool = Arc::clone(&self.pool);
        let aggregator = Arc::clone(&self.stats);
        let report_opts = self.report_opts;
        tokio::spawn(async move {
            let started = Instant::now();
            let mut frames: u64 = 0;

            'dispatch: loop {
                match inbound.next().await {
                    Some(Ok(batch)) => {
                        frames += 1;
                        let records = batch.seqs.into_iter().map(Into::into).collect();
                        let mut job = ClassifyJob {
                            records,
                            reply: result_tx.clone(),
                        };
                        loop {
                            // A closed response channel means the peer
                            // cancelled; stop submitting new work.
                            if tx.is_closed() {
                                debug!("peer cancelled; dropping remaining request frames");
                                break 'dispatch;
                            }
                            match pool.queue().try_push(job) {
                                Ok(()) => break,
                                Err(TryPushError::Full(returned)) => {
                                    job = returned;
                                    tokio::time::sleep(SUBMIT_RETRY_DELAY).await;
                                }
                                Err(TryPushError::Closed(_)) => {
                                    // Server shutting down under us.
                                    warn!("worker pool closed mid-stream");
                                    break 'dispatch;
                                }
                            }
                        }
                    }
                    Some(Err(status)) => {
                        debug!(status = %status, "inbound stream error");
                        break;
                    }
                    None => break,
                }
            }

            // No more submissions: once in-flight jobs finish, the
            // forwarder sees the fan-in channel close and returns.
            drop(result_tx);
            let Ok(stream_stats) = forwarder.await else {
                warn!("result forwarder panicked");
                return;
            };

            let elapsed = started.elapsed();
            info!(
                frames,
                sequences = stream_stats.stats.total_sequences,
                classified = stream_stats.stats.total_classified,
                mbp = stream_stats.stats.total_bases / 1_000_000,
                elapsed_ms = elapsed.as_millis() as u64,
                "classify stream finished"
            );

            let report = stream_stats.render_report(&index.taxonomy, &report_opts);
            aggregator.merge(&stream_stats);

            // Skip the summary when the peer has already hung up.
            if !tx.is_closed() {
                let _ = tx.send(Ok(StreamResult::summary(report))).await;
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

/// Drain completed batches onto the response stream, accumulating the
/// per-stream statistics. Keeps draining after peer cancellation so
/// workers never block on a dead stream.
async fn forward_results(
    mut result_rx: mpsc::UnboundedReceiver<BatchResult>,
    tx: mpsc::Sender<Result<StreamResult, Status>>,
) -> StreamStats {
    let mut stream_stats = StreamStats::default();
    let mut peer_gone = false;

    while let Some(batch) = result_rx.recv().await {
        stream_stats.absorb(&batch);
        if peer_gone {
            continue;
        }
        let classes: Vec<Classification> = batch.results.into_iter().map(Into::into).collect();
        for frame in split_result_frames(classes) {
            if tx.send(Ok(frame)).await.is_err() {
                peer_gone = true;
                break;
            }
        }
    }
    stream_stats
}

/// Split a batch of classifications into frames under the wire cap.
/// Splitting responses is rare: it takes a pathological hitlist to push
/// a result batch past the cap.
fn split_result_frames(classes: Vec<Classification>) -> Vec<StreamResult> {
    let frame = StreamResult::classifications(classes);
    if frame.encoded_len() <= MAX_FRAME_BYTES {
        return vec![frame];
    }
    let Some(stream_result::Result::Classifications(batch)) = frame.result else {
        unreachable!("frame was built as a classification batch");
    };
    let mut classes = batch.classes;
    if classes.len() <= 1 {
        warn!(
            id = classes.first().map(|c| c.id.as_str()).unwrap_or(""),
            "classification result exceeds the frame cap; dropping"
        );
        return Vec::new();
    }
    let tail = classes.split_off(classes.len() / 2);
    let mut frames = split_result_frames(classes);
    frames.extend(split_result_frames(tail));
    frames
}
