//! Shared fixtures for the integration tests: a synthetic on-disk
//! database small enough to reason about by hand, plus helpers to spin
//! an in-process server on an unused port.

#![allow(dead_code)] // not every test file uses every helper

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use k2serve_cli::config::ServerConfig;
use k2serve_cli::grpc::ClassifierService;
use k2serve_cli::index_holder::IndexHolder;
use k2serve_cli::shutdown::ShutdownLatch;
use k2serve_cli::stats::StatisticsAggregator;
use k2serve_cli::worker_pool::WorkerPool;
use k2serve_core::index::{murmur_hash3, IndexOptions};
use k2serve_proto::classify_service_client::ClassifyServiceClient;
use k2serve_proto::ReadyRequest;
use tonic::transport::Channel;
use tonic::Request;

/// Internal taxon ids of the synthetic taxonomy.
pub const ROOT: u64 = 1;
pub const BACTERIA: u64 = 2;
pub const ECOLI: u64 = 3;
pub const SALMONELLA: u64 = 4;

/// External ids as they appear in results and reports.
pub const ECOLI_EXT: u64 = 562;
pub const SALMONELLA_EXT: u64 = 28901;

/// A read of this sequence classifies as E. coli: the long A-run hits
/// one minimizer group, GATTA a second, satisfying the default
/// minimum of two hit groups.
pub const ECOLI_READ: &str = "AAAAAAAAAAAAAAAAAAAAGATTAAAAAAAAAAAAAAAAAAAA";

pub fn encode_dna(s: &str) -> u64 {
    s.bytes().fold(0, |acc, b| {
        (acc << 2)
            | match b {
                b'A' => 0,
                b'C' => 1,
                b'G' => 2,
                b'T' => 3,
                _ => panic!("bad base"),
            }
    })
}

pub fn canonical(s: &str) -> u64 {
    let rc: String = s
        .chars()
        .rev()
        .map(|c| match c {
            'A' => 'T',
            'C' => 'G',
            'G' => 'C',
            'T' => 'A',
            _ => panic!("bad base"),
        })
        .collect();
    encode_dna(s).min(encode_dna(&rc))
}

/// Write a complete synthetic database into `dir`: k = l = 5, with
/// AAAAA -> E. coli, CCCCC -> Salmonella and GATTA -> Bacteria.
pub fn write_test_db(dir: &Path) {
    let options = IndexOptions {
        k: 5,
        l: 5,
        spaced_seed_mask: 0,
        toggle_mask: 0,
        dna_db: true,
        minimum_acceptable_hash_value: 0,
        revcom_version: 1,
        db_version: 0,
        db_type: 0,
    };
    std::fs::write(dir.join("opts.k2d"), options.to_bytes()).unwrap();
    std::fs::write(dir.join("taxo.k2d"), taxonomy_bytes()).unwrap();
    std::fs::write(
        dir.join("hash.k2d"),
        hash_bytes(
            1024,
            16,
            &[
                (canonical("AAAAA"), ECOLI as u32),
                (canonical("CCCCC"), SALMONELLA as u32),
                (canonical("GATTA"), BACTERIA as u32),
            ],
        ),
    )
    .unwrap();
}

/// Serialized taxonomy: root(1) -> Bacteria(2) -> {E. coli(3), Salmonella(4)}.
fn taxonomy_bytes() -> Vec<u8> {
    let nodes: &[(u64, u64, u64, &str, &str, u64)] = &[
        (0, 0, 0, "", "", 0),
        (0, 2, 1, "root", "no rank", 1),
        (1, 3, 2, "Bacteria", "superkingdom", 2),
        (2, 0, 0, "Escherichia coli", "species", ECOLI_EXT),
        (2, 0, 0, "Salmonella enterica", "species", SALMONELLA_EXT),
    ];

    let mut name_data: Vec<u8> = Vec::new();
    let mut rank_data: Vec<u8> = Vec::new();
    let mut table: Vec<u8> = Vec::new();
    for &(parent, first_child, child_count, name, rank, external) in nodes {
        let name_offset = name_data.len() as u64;
        name_data.extend_from_slice(name.as_bytes());
        name_data.push(0);
        let rank_offset = rank_data.len() as u64;
        rank_data.extend_from_slice(rank.as_bytes());
        rank_data.push(0);
        for value in [
            parent,
            first_child,
            child_count,
            name_offset,
            rank_offset,
            external,
            0,
        ] {
            table.extend_from_slice(&value.to_le_bytes());
        }
    }

    let mut buf = Vec::new();
    buf.extend_from_slice(b"K2TAXDAT");
    buf.extend_from_slice(&(nodes.len() as u64).to_le_bytes());
    buf.extend_from_slice(&(name_data.len() as u64).to_le_bytes());
    buf.extend_from_slice(&(rank_data.len() as u64).to_le_bytes());
    buf.extend_from_slice(&table);
    buf.extend_from_slice(&name_data);
    buf.extend_from_slice(&rank_data);
    buf
}

/// Serialized compact hash table, placed with the same double-hashing
/// probe sequence the reader uses.
fn hash_bytes(capacity: usize, value_bits: u32, entries: &[(u64, u32)]) -> Vec<u8> {
    let mut cells = vec![0u32; capacity];
    for &(key, value) in entries {
        let hc = murmur_hash3(key);
        let compacted_key = (hc >> (32 + value_bits)) as u32;
        let mut idx = (hc % capacity as u64) as usize;
        let mut step = 0usize;
        loop {
            if cells[idx] == 0 {
                cells[idx] = (compacted_key << value_bits) | value;
                break;
            }
            if step == 0 {
                step = (((hc >> 8) | 1) % capacity as u64) as usize;
                if step == 0 {
                    step = 1;
                }
            }
            idx = (idx + step) % capacity;
        }
    }

    let mut buf = Vec::new();
    buf.extend_from_slice(&(capacity as u64).to_le_bytes());
    buf.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    buf.extend_from_slice(&u64::from(32 - value_bits).to_le_bytes());
    buf.extend_from_slice(&u64::from(value_bits).to_le_bytes());
    for cell in cells {
        buf.extend_from_slice(&cell.to_le_bytes());
    }
    buf
}

/// Server configuration pointing at `db_dir` with test-friendly defaults.
pub fn base_config(db_dir: &Path) -> ServerConfig {
    ServerConfig {
        db_path: db_dir.to_path_buf(),
        host: "127.0.0.1".to_string(),
        port: 0,
        max_queue: 0,
        thread_pool: 1,
        no_stats: false,
        report_kmer_data: false,
        report_zero_counts: false,
        translated_search: false,
        confidence_threshold: 0.0,
        min_quality: 0,
        hit_groups: 2,
        memory_mapping: false,
        wait: 0,
    }
}

/// An in-process server plus the handles tests poke at.
pub struct TestServer {
    pub port: u16,
    pub latch: Arc<ShutdownLatch>,
    pub pool: Arc<WorkerPool>,
    pub holder: Arc<IndexHolder>,
}

impl TestServer {
    pub fn client_addr(&self) -> (String, u16) {
        ("127.0.0.1".to_string(), self.port)
    }
}

/// Assemble and start a server on an unused port; the index loads in the
/// background per the config's `wait`.
pub async fn spawn_server(config: ServerConfig) -> TestServer {
    let latch = Arc::new(ShutdownLatch::new());
    let holder = Arc::new(IndexHolder::new());
    holder.spawn_load(config.db_path.clone(), config.memory_mapping, config.wait);

    let pool = Arc::new(WorkerPool::new(
        config.thread_pool,
        Arc::clone(&holder),
        &config,
    ));
    let stats = Arc::new(StatisticsAggregator::new(!config.no_stats));
    let service = ClassifierService::new(
        Arc::clone(&holder),
        Arc::clone(&pool),
        stats,
        Arc::clone(&latch),
        config.report_options(),
    );

    let port = portpicker::pick_unused_port().expect("no available ports");
    let addr = format!("127.0.0.1:{port}").parse().unwrap();
    let serve_latch = Arc::clone(&latch);
    let max_queue = config.max_queue;
    tokio::spawn(async move {
        service.serve(addr, serve_latch, max_queue).await.ok();
    });

    // Give the transport time to bind.
    tokio::time::sleep(Duration::from_millis(100)).await;

    TestServer {
        port,
        latch,
        pool,
        holder,
    }
}

/// Database in a tempdir plus a running server over it.
pub async fn spawn_default_server() -> (tempfile::TempDir, TestServer) {
    let dir = tempfile::tempdir().unwrap();
    write_test_db(dir.path());
    let server = spawn_server(base_config(dir.path())).await;
    (dir, server)
}

pub fn connect(server: &TestServer) -> ClassifyServiceClient<Channel> {
    k2serve_cli::client::connect("127.0.0.1", server.port).expect("client endpoint")
}

/// Poll `ServerReady` until it reports OK; panics after ten seconds.
pub async fn await_ready(client: &mut ClassifyServiceClient<Channel>) {
    for _ in 0..200 {
        if client
            .server_ready(Request::new(ReadyRequest {}))
            .await
            .is_ok()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("server never became ready");
}

/// Write a FASTA file of `reads` into `dir` and return its path.
pub fn write_fasta(dir: &Path, name: &str, reads: &[(&str, &str)]) -> PathBuf {
    let mut text = String::new();
    for (id, seq) in reads {
        text.push_str(&format!(">{id}\n{seq}\n"));
    }
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    path
}

/// Write a FASTQ file of `(id, seq, quals)` records into `dir`.
pub fn write_fastq(dir: &Path, name: &str, reads: &[(&str, &str, &str)]) -> PathBuf {
    let mut text = String::new();
    for (id, seq, quals) in reads {
        text.push_str(&format!("@{id}\n{seq}\n+\n{quals}\n"));
    }
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    path
}
