//! Client side of the classify stream.
//!
//! Three cooperating stages move records from the input file to stdout:
//! a batcher thread reading the file, a writer thread splitting batches
//! into wire frames under the in-flight budget, and the async reader
//! printing results as they arrive. Stages hand off through a bounded
//! queue and the outbound request channel; closing each is the
//! end-of-work signal for the next stage, so no sentinel values or
//! completion sleeps are needed.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use k2serve_core::sequence::SequenceRecord;
use k2serve_core::RecordReader;
use k2serve_proto::classify_service_client::ClassifyServiceClient;
use k2serve_proto::{
    stream_result, ReadyRequest, SequenceBatch, ShutdownRequest, StreamResult, SummaryRequest,
    MAX_FRAME_BYTES,
};
use prost::Message;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status};
use tracing::{debug, error, info, warn};

use crate::config::{exit_code, ClientConfig, EndpointConfig};
use crate::queue::BoundedQueue;

/// Records pulled from the file per batch.
pub const FILE_BATCH: usize = 4000;
/// File batches buffered between the batcher and the writer.
pub const MAX_BATCHES: usize = 64;
/// Records per wire frame before byte-size splitting.
pub const WIRE_BATCH: usize = 2000;
/// Budget of records on the wire awaiting results.
pub const MAX_IN_FLIGHT: u64 = 64_000;

/// Outbound frames buffered towards the transport.
const WIRE_CHANNEL_DEPTH: usize = 8;
/// Poll interval of the writer's in-flight budget check.
const BACKPRESSURE_DELAY: Duration = Duration::from_millis(10);
/// Fixed backoff between readiness probes.
const READY_RETRY_DELAY: Duration = Duration::from_secs(10);

/// What one classify stream amounted to.
#[derive(Debug, Default)]
pub struct StreamOutcome {
    /// Result lines written to the output.
    pub lines_printed: u64,
    /// Classification frames received (excludes the summary frame).
    pub frames_received: u64,
    /// Records yielded by the file reader.
    pub records_read: u64,
    /// Records that went out on the wire.
    pub records_sent: u64,
    /// Records dropped locally for exceeding the frame cap.
    pub records_dropped: u64,
    /// Final summary frame, if the stream ended normally.
    pub summary: Option<String>,
    /// Terminal non-OK status from the server, if any.
    pub status: Option<Status>,
    /// Local file read failure occurred.
    pub read_error: bool,
    /// Local output write failure occurred.
    pub write_error: bool,
    /// Advisory gauge at termination; nonzero when the server dropped
    /// malformed records.
    pub in_flight_at_end: u64,
}

/// Build a lazily-connecting client with the frame cap applied.
///
/// # Errors
///
/// Fails only on an unparsable host/port combination.
pub fn connect(host: &str, port: u16) -> Result<ClassifyServiceClient<Channel>> {
    let endpoint = Endpoint::from_shared(format!("http://{host}:{port}"))
        .with_context(|| format!("invalid server address {host}:{port}"))?;
    let channel = endpoint.connect_lazy();
    Ok(ClassifyServiceClient::new(channel)
        .max_decoding_message_size(MAX_FRAME_BYTES)
        .max_encoding_message_size(MAX_FRAME_BYTES))
}

/// Block until the server reports ready, retrying `UNAVAILABLE` replies
/// every ten seconds. Any other failure is surfaced as an exit code.
///
/// # Errors
///
/// Returns the process exit code for non-transient failures.
pub async fn wait_for_server(client: &mut ClassifyServiceClient<Channel>) -> Result<(), i32> {
    loop {
        match client.server_ready(Request::new(ReadyRequest {})).await {
            Ok(_) => {
                info!("server responded as ready");
                return Ok(());
            }
            Err(status) if status.code() == Code::Unavailable => {
                info!(message = status.message(), "server not ready; waiting 10s");
                tokio::time::sleep(READY_RETRY_DELAY).await;
            }
            Err(status) => {
                error!(
                    code = ?status.code(),
                    message = status.message(),
                    "server is in an error state"
                );
                return Err(status_exit_code(&status));
            }
        }
    }
}

/// Split a run of records into wire frames of at most [`WIRE_BATCH`]
/// records and [`MAX_FRAME_BYTES`] serialized bytes. Oversized frames
/// are re-split one record at a time; a single record that still busts
/// the cap is dropped with a warning.
pub fn split_into_wire_frames(
    records: Vec<k2serve_proto::SequenceRecord>,
) -> (Vec<SequenceBatch>, u64) {
    let mut frames = Vec::new();
    let mut dropped = 0u64;

    let mut iter = records.into_iter().peekable();
    while iter.peek().is_some() {
        let chunk: Vec<_> = iter.by_ref().take(WIRE_BATCH).collect();
        let frame = SequenceBatch { seqs: chunk };
        if frame.encoded_len() <= MAX_FRAME_BYTES {
            frames.push(frame);
            continue;
        }
        for record in frame.seqs {
            let single = SequenceBatch { seqs: vec![record] };
            if single.encoded_len() > MAX_FRAME_BYTES {
                warn!(id = %single.seqs[0].id, "read too large, skipping");
                dropped += 1;
            } else {
                frames.push(single);
            }
        }
    }
    (frames, dropped)
}

/// Run one classify stream end to end, printing result lines to `out`.
///
/// # Errors
///
/// Returns an error only for local plumbing failures (thread panics);
/// server-side failures are reported through [`StreamOutcome::status`].
pub async fn classify_stream_to<W: Write>(
    client: &mut ClassifyServiceClient<Channel>,
    sequence_path: &Path,
    out: &mut W,
) -> Result<StreamOutcome> {
    let mut outcome = StreamOutcome::default();

    let (wire_tx, wire_rx) = mpsc::channel::<SequenceBatch>(WIRE_CHANNEL_DEPTH);
    let mut inbound = match client
        .classify_stream(Request::new(ReceiverStream::new(wire_rx)))
        .await
    {
        Ok(response) => response.into_inner(),
        Err(status) => {
            outcome.status = Some(status);
            return Ok(outcome);
        }
    };

    let in_flight = Arc::new(AtomicU64::new(0));
    let aborted = Arc::new(AtomicBool::new(false));
    let batches: Arc<BoundedQueue<Vec<SequenceRecord>>> =
        Arc::new(BoundedQueue::new(MAX_BATCHES));

    // Batcher: file -> bounded queue, closed at EOF or failure.
    let batcher = {
        let batches = Arc::clone(&batches);
        let path = sequence_path.to_path_buf();
        std::thread::spawn(move || -> (u64, bool) {
            let mut reader = match RecordReader::open(&path) {
                Ok(reader) => reader,
                Err(e) => {
                    error!(error = %e, "failed to open sequence file");
                    batches.close();
                    return (0, true);
                }
            };
            info!(file = %path.display(), "reading sequences from file");
            let mut records_read = 0u64;
            let failed = loop {
                match reader.read_batch(FILE_BATCH) {
                    Ok(batch) if batch.is_empty() => break false,
                    Ok(batch) => {
                        records_read += batch.len() as u64;
                        if batches.push(batch).is_err() {
                            // Writer tore the pipeline down under us.
                            break false;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "failed reading sequence file");
                        break true;
                    }
                }
            };
            batches.close();
            (records_read, failed)
        })
    };

    // Writer: bounded queue -> wire frames, throttled by the in-flight
    // budget. Dropping `wire_tx` at the end signals writes-done.
    let writer = {
        let batches = Arc::clone(&batches);
        let in_flight = Arc::clone(&in_flight);
        let aborted = Arc::clone(&aborted);
        std::thread::spawn(move || -> (u64, u64) {
            let mut sent = 0u64;
            let mut dropped = 0u64;
            'batches: while let Some(batch) = batches.pop() {
                let batch_len = batch.len() as u64;
                while in_flight.load(Ordering::Relaxed) + batch_len > MAX_IN_FLIGHT {
                    if aborted.load(Ordering::Relaxed) {
                        break 'batches;
                    }
                    std::thread::sleep(BACKPRESSURE_DELAY);
                }
                let records: Vec<k2serve_proto::SequenceRecord> =
                    batch.into_iter().map(Into::into).collect();
                let (frames, frame_dropped) = split_into_wire_frames(records);
                dropped += frame_dropped;
                for frame in frames {
                    let frame_len = frame.seqs.len() as u64;
                    // Count the frame before it can possibly be answered,
                    // so the gauge never wraps below zero.
                    in_flight.fetch_add(frame_len, Ordering::Relaxed);
                    if wire_tx.blocking_send(frame).is_err() {
                        // Stream torn down; stop feeding it.
                        in_flight.fetch_sub(frame_len, Ordering::Relaxed);
                        break 'batches;
                    }
                    sent += frame_len;
                }
            }
            // Unblock the batcher if we bailed early.
            batches.close();
            (sent, dropped)
        })
    };

    // Reader: response frames -> result lines and the summary.
    loop {
        match inbound.next().await {
            Some(Ok(StreamResult { result })) => match result {
                Some(stream_result::Result::Classifications(batch)) => {
                    outcome.frames_received += 1;
                    for class in batch.classes {
                        let flag = if class.classified { 'C' } else { 'U' };
                        if writeln!(
                            out,
                            "{flag}\t{}\t{}\t{}\t{}",
                            class.id, class.tax_id, class.size, class.hitlist
                        )
                        .is_err()
                        {
                            outcome.write_error = true;
                            break;
                        }
                        outcome.lines_printed += 1;
                        in_flight.fetch_sub(1, Ordering::Relaxed);
                    }
                    if outcome.write_error {
                        break;
                    }
                }
                Some(stream_result::Result::Summary(text)) => {
                    outcome.summary = Some(text);
                }
                None => {}
            },
            Some(Err(status)) => {
                warn!(code = ?status.code(), message = status.message(), "stream failed");
                outcome.status = Some(status);
                break;
            }
            None => break,
        }
    }
    if out.flush().is_err() {
        outcome.write_error = true;
    }
    aborted.store(true, Ordering::Relaxed);

    let (sent, dropped) = tokio::task::spawn_blocking(move || writer.join())
        .await
        .context("joining writer thread")?
        .map_err(|_| anyhow!("stream writer thread panicked"))?;
    let (records_read, read_error) = tokio::task::spawn_blocking(move || batcher.join())
        .await
        .context("joining batcher thread")?
        .map_err(|_| anyhow!("file reader thread panicked"))?;

    outcome.records_sent = sent;
    outcome.records_dropped = dropped;
    outcome.records_read = records_read;
    outcome.read_error = read_error;
    outcome.in_flight_at_end = in_flight.load(Ordering::Relaxed);
    if outcome.in_flight_at_end != 0 {
        debug!(
            in_flight = outcome.in_flight_at_end,
            "in-flight gauge nonzero at stream end (records dropped server-side?)"
        );
    }
    Ok(outcome)
}

/// `k2serve classify`: stream a file and print per-read results.
///
/// # Errors
///
/// Local plumbing failures only; everything else becomes an exit code.
pub async fn run_classify(config: ClientConfig) -> Result<i32> {
    let mut client = connect(&config.host, config.port)?;
    if let Err(code) = wait_for_server(&mut client).await {
        return Ok(code);
    }

    info!("classifying sequence stream");
    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());
    let outcome = classify_stream_to(&mut client, &config.sequence, &mut out).await?;
    drop(out);

    debug!(
        read = outcome.records_read,
        sent = outcome.records_sent,
        printed = outcome.lines_printed,
        dropped = outcome.records_dropped,
        "stream complete"
    );

    let mut report_failed = false;
    if let (Some(summary), Some(path)) = (&outcome.summary, &config.report) {
        if let Err(e) = std::fs::write(path, summary) {
            error!(error = %e, report = %path.display(), "failed to write report file");
            report_failed = true;
        }
    }

    Ok(if let Some(status) = &outcome.status {
        status_exit_code(status)
    } else if outcome.read_error || outcome.write_error || report_failed {
        exit_code::IOERR
    } else {
        exit_code::OK
    })
}

/// `k2serve summary`: print the server's cumulative summary.
///
/// # Errors
///
/// Local plumbing failures only.
pub async fn run_summary(config: EndpointConfig) -> Result<i32> {
    let mut client = connect(&config.host, config.port)?;
    match client.get_summary(Request::new(SummaryRequest {})).await {
        Ok(reply) => {
            println!("{}", reply.into_inner().summary);
            Ok(exit_code::OK)
        }
        Err(status) => {
            error!(message = status.message(), "could not retrieve server summary");
            Ok(status_exit_code(&status))
        }
    }
}

/// `k2serve shutdown`: ask the server to stop gracefully.
///
/// # Errors
///
/// Local plumbing failures only.
pub async fn run_shutdown(config: EndpointConfig) -> Result<i32> {
    let mut client = connect(&config.host, config.port)?;
    match client.remote_shutdown(Request::new(ShutdownRequest {})).await {
        Ok(reply) => {
            if reply.into_inner().successful {
                info!("shutdown request processed");
                Ok(exit_code::OK)
            } else {
                error!("shutdown request not processed correctly");
                Ok(exit_code::SOFTWARE)
            }
        }
        Err(status) => {
            error!(message = status.message(), "failed to send shutdown request");
            Ok(status_exit_code(&status))
        }
    }
}

/// Map a terminal gRPC status onto a sysexits-style process exit code.
fn status_exit_code(status: &Status) -> i32 {
    match status.code() {
        Code::Unavailable => exit_code::UNAVAILABLE,
        Code::FailedPrecondition => exit_code::CONFIG,
        Code::InvalidArgument | Code::DataLoss | Code::OutOfRange => exit_code::DATAERR,
        _ => exit_code::SOFTWARE,
    }
}
