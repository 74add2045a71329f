//! End-to-end classify-stream scenarios over a loopback transport.

mod support;

use std::collections::HashSet;
use std::io::Write as _;

use k2serve_cli::client;
use k2serve_proto::SummaryRequest;
use tonic::Request;

/// Parse printed result lines into (flag, id, tax_id, size, hitlist).
fn parse_lines(out: &[u8]) -> Vec<(char, String, u64, u64, String)> {
    String::from_utf8(out.to_vec())
        .unwrap()
        .lines()
        .map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            assert_eq!(fields.len(), 5, "malformed result line: {line}");
            (
                fields[0].chars().next().unwrap(),
                fields[1].to_string(),
                fields[2].parse().unwrap(),
                fields[3].parse().unwrap(),
                fields[4].to_string(),
            )
        })
        .collect()
}

#[tokio::test]
async fn small_fastq_stream_returns_every_read() {
    let (dir, server) = support::spawn_default_server().await;
    let mut client = support::connect(&server);
    support::await_ready(&mut client).await;

    // Ten valid FASTQ reads of length 100.
    let seq = format!("{}GATTA{}", "A".repeat(48), "A".repeat(47));
    let quals = "I".repeat(100);
    let reads: Vec<(String, &str, &str)> = (0..10)
        .map(|i| (format!("read_{i}"), seq.as_str(), quals.as_str()))
        .collect();
    let reads_ref: Vec<(&str, &str, &str)> = reads
        .iter()
        .map(|(id, s, q)| (id.as_str(), *s, *q))
        .collect();
    let input = support::write_fastq(dir.path(), "reads.fastq", &reads_ref);

    let mut out = Vec::new();
    let outcome = client::classify_stream_to(&mut client, &input, &mut out)
        .await
        .unwrap();

    assert!(outcome.status.is_none());
    assert_eq!(outcome.records_read, 10);
    assert_eq!(outcome.records_sent, 10);
    assert_eq!(outcome.lines_printed, 10);
    assert_eq!(outcome.in_flight_at_end, 0);

    let lines = parse_lines(&out);
    assert_eq!(lines.len(), 10);
    for (flag, _, tax_id, size, hitlist) in &lines {
        assert!(*flag == 'C' || *flag == 'U');
        assert_eq!(*size, 100);
        assert!(!hitlist.is_empty());
        // This read hits two minimizer groups, so it classifies.
        assert_eq!(*flag, 'C');
        assert_eq!(*tax_id, support::ECOLI_EXT);
    }
    // Single worker: responses preserve request order.
    let ids: Vec<&str> = lines.iter().map(|(_, id, ..)| id.as_str()).collect();
    let expected: Vec<String> = (0..10).map(|i| format!("read_{i}")).collect();
    assert_eq!(ids, expected.iter().map(String::as_str).collect::<Vec<_>>());

    // The per-stream summary is a report over these ten reads.
    let summary = outcome.summary.expect("summary frame on normal end");
    assert!(summary.contains("% of Seqs"));
    assert!(summary.contains("Escherichia coli"));

    // Cumulative totals agree with the stream.
    let cumulative = client
        .get_summary(Request::new(SummaryRequest {}))
        .await
        .unwrap()
        .into_inner()
        .summary;
    assert!(cumulative.contains("10 sequences"));
    assert!(cumulative.contains("10 sequences classified (100.00%)"));

    server.latch.fire();
}

#[tokio::test]
async fn multi_frame_fasta_stream_with_parallel_workers() {
    let dir = tempfile::tempdir().unwrap();
    support::write_test_db(dir.path());
    let mut config = support::base_config(dir.path());
    config.thread_pool = 4;
    let server = support::spawn_server(config).await;
    let mut client = support::connect(&server);
    support::await_ready(&mut client).await;

    // 12 000 reads -> exactly six request frames of 2 000 records.
    let mut text = String::new();
    for i in 0..12_000 {
        text.push_str(&format!(">r{i}\nAAAAAGATTA\n"));
    }
    let input = dir.path().join("reads.fasta");
    std::fs::write(&input, text).unwrap();

    let mut out = Vec::new();
    let outcome = client::classify_stream_to(&mut client, &input, &mut out)
        .await
        .unwrap();

    assert!(outcome.status.is_none());
    assert_eq!(outcome.records_read, 12_000);
    assert_eq!(outcome.records_sent, 12_000);
    assert_eq!(outcome.lines_printed, 12_000);
    assert_eq!(outcome.frames_received, 6);
    assert_eq!(outcome.in_flight_at_end, 0);

    // Frames may arrive out of order, but every id arrives exactly once.
    let lines = parse_lines(&out);
    let ids: HashSet<String> = lines.iter().map(|(_, id, ..)| id.clone()).collect();
    assert_eq!(ids.len(), 12_000);
    for i in 0..12_000 {
        assert!(ids.contains(&format!("r{i}")), "missing id r{i}");
    }

    let summary = outcome.summary.expect("summary frame on normal end");
    assert!(summary.contains("Escherichia coli"));
    server.latch.fire();
}

#[tokio::test]
async fn malformed_fastq_record_is_dropped_and_stream_continues() {
    let (dir, server) = support::spawn_default_server().await;
    let mut client = support::connect(&server);
    support::await_ready(&mut client).await;

    let good_seq = support::ECOLI_READ;
    let good_quals = "I".repeat(good_seq.len());
    let bad_quals = "I".repeat(good_seq.len() / 2);
    let reads = [
        ("ok_1", good_seq, good_quals.as_str()),
        ("ok_2", good_seq, good_quals.as_str()),
        ("broken", good_seq, bad_quals.as_str()),
        ("ok_3", good_seq, good_quals.as_str()),
        ("ok_4", good_seq, good_quals.as_str()),
    ];
    let input = support::write_fastq(dir.path(), "mixed.fastq", &reads);

    let mut out = Vec::new();
    let outcome = client::classify_stream_to(&mut client, &input, &mut out)
        .await
        .unwrap();

    // The stream ends OK; only the malformed record went missing.
    assert!(outcome.status.is_none());
    assert_eq!(outcome.records_sent, 5);
    assert_eq!(outcome.lines_printed, 4);
    assert_eq!(outcome.in_flight_at_end, 1);
    assert!(outcome.summary.is_some());

    let lines = parse_lines(&out);
    let ids: HashSet<String> = lines.iter().map(|(_, id, ..)| id.clone()).collect();
    assert!(!ids.contains("broken"));
    assert!(ids.contains("ok_1") && ids.contains("ok_4"));
    server.latch.fire();
}

#[tokio::test]
async fn gzipped_input_streams_transparently() {
    let (dir, server) = support::spawn_default_server().await;
    let mut client = support::connect(&server);
    support::await_ready(&mut client).await;

    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    for i in 0..5 {
        encoder
            .write_all(format!(">gz{i}\n{}\n", support::ECOLI_READ).as_bytes())
            .unwrap();
    }
    // Named without .gz on purpose: detection is by content.
    let input = dir.path().join("reads.fasta");
    std::fs::write(&input, encoder.finish().unwrap()).unwrap();

    let mut out = Vec::new();
    let outcome = client::classify_stream_to(&mut client, &input, &mut out)
        .await
        .unwrap();

    assert!(outcome.status.is_none());
    assert_eq!(outcome.lines_printed, 5);
    let lines = parse_lines(&out);
    assert!(lines.iter().all(|(flag, ..)| *flag == 'C'));
    server.latch.fire();
}

#[tokio::test]
async fn stream_against_loading_index_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    support::write_test_db(dir.path());
    let mut config = support::base_config(dir.path());
    config.wait = 30; // stays in Loading for the whole test
    let server = support::spawn_server(config).await;
    let mut client = support::connect(&server);

    let input = support::write_fasta(dir.path(), "reads.fasta", &[("r1", "AAAAAGATTA")]);
    let mut out = Vec::new();
    let outcome = client::classify_stream_to(&mut client, &input, &mut out)
        .await
        .unwrap();

    let status = outcome.status.expect("loading index must reject streams");
    assert_eq!(status.code(), tonic::Code::Unavailable);
    assert_eq!(outcome.lines_printed, 0);
    server.latch.fire();
}

#[tokio::test]
async fn cumulative_summary_spans_streams() {
    let (dir, server) = support::spawn_default_server().await;
    let mut client = support::connect(&server);
    support::await_ready(&mut client).await;

    for (name, count) in [("a.fasta", 4usize), ("b.fasta", 6usize)] {
        let reads: Vec<(String, &str)> = (0..count)
            .map(|i| (format!("{name}_{i}"), support::ECOLI_READ))
            .collect();
        let reads_ref: Vec<(&str, &str)> =
            reads.iter().map(|(id, s)| (id.as_str(), *s)).collect();
        let input = support::write_fasta(dir.path(), name, &reads_ref);

        let mut out = Vec::new();
        let outcome = client::classify_stream_to(&mut client, &input, &mut out)
            .await
            .unwrap();
        assert!(outcome.status.is_none());
        assert_eq!(outcome.lines_printed, count as u64);
    }

    let summary = client
        .get_summary(Request::new(SummaryRequest {}))
        .await
        .unwrap()
        .into_inner()
        .summary;
    assert!(summary.contains("10 sequences (0.00 Mbp) processed."), "{summary}");
    server.latch.fire();
}

#[tokio::test]
async fn unreadable_input_aborts_only_the_local_stream() {
    let (dir, server) = support::spawn_default_server().await;
    let mut client = support::connect(&server);
    support::await_ready(&mut client).await;

    let missing = dir.path().join("does-not-exist.fasta");
    let mut out = Vec::new();
    let outcome = client::classify_stream_to(&mut client, &missing, &mut out)
        .await
        .unwrap();
    assert!(outcome.read_error);
    assert_eq!(outcome.lines_printed, 0);

    // The server keeps serving other streams afterwards.
    let input = support::write_fasta(dir.path(), "ok.fasta", &[("r1", support::ECOLI_READ)]);
    let mut out = Vec::new();
    let outcome = client::classify_stream_to(&mut client, &input, &mut out)
        .await
        .unwrap();
    assert!(outcome.status.is_none());
    assert_eq!(outcome.lines_printed, 1);
    server.latch.fire();
}
