//! Single-end read classification against a loaded database.
//!
//! The classifier walks a read's minimizers, tallies hash hits per taxon
//! and resolves the call through the taxonomy tree, honoring the
//! confidence threshold and the minimum-hit-groups cutoff. Paired-end
//! and quick-mode paths of the original algorithm are not carried here.

use std::fmt::Write as _;

use ahash::AHashMap;

use crate::counters::TaxonCounts;
use crate::index::taxonomy::{TaxId, Taxonomy};
use crate::index::{murmur_hash3, Index, IndexOptions};
use crate::minimizer::MinimizerScanner;
use crate::sequence::{SequenceFormat, SequenceRecord};
use crate::translate::translate_to_all_frames;

/// Largest representable taxon id; the values just below it are reserved
/// as in-band markers in the per-k-mer call trace.
pub const TAXID_MAX: TaxId = TaxId::MAX;
/// Marker separating reading frames in translated-search call traces.
pub const READING_FRAME_BORDER_TAXON: TaxId = TAXID_MAX - 1;
/// Marker for k-mers containing ambiguous characters.
pub const AMBIGUOUS_SPAN_TAXON: TaxId = TAXID_MAX - 2;

/// Server-side classification knobs.
#[derive(Clone, Copy, Debug)]
pub struct ClassifyOptions {
    /// Fraction of a read's k-mers that must support a call, in `[0, 1]`.
    pub confidence_threshold: f64,
    /// FASTQ bases below this quality are masked out before scanning.
    pub minimum_quality_score: u8,
    /// Calls supported by fewer distinct minimizers than this are voided.
    pub minimum_hit_groups: u64,
    pub use_translated_search: bool,
}

impl Default for ClassifyOptions {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.0,
            minimum_quality_score: 0,
            minimum_hit_groups: 2,
            use_translated_search: false,
        }
    }
}

/// Classification throughput counters for one batch or stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClassificationStats {
    pub total_sequences: u64,
    pub total_bases: u64,
    pub total_classified: u64,
}

impl ClassificationStats {
    pub fn merge(&mut self, other: &Self) {
        self.total_sequences += other.total_sequences;
        self.total_bases += other.total_bases;
        self.total_classified += other.total_classified;
    }
}

/// Per-read classification outcome.
#[derive(Clone, Debug, Default)]
pub struct ClassificationResult {
    pub id: String,
    pub classified: bool,
    /// External taxonomy id of the call; 0 when unclassified.
    pub tax_id: u64,
    /// Scientific name of the call; empty when unclassified.
    pub name: String,
    /// Read length in bases.
    pub size: usize,
    /// Per-k-mer call trace; `"0:0"` when the read had no k-mers.
    pub hitlist: String,
}

/// Scratch state owned by exactly one classification worker.
///
/// The scanner and the collections here are reused across reads; they
/// must never be shared between workers.
pub struct ScratchBuffers {
    scanner: MinimizerScanner,
    taxa: Vec<TaxId>,
    hit_counts: AHashMap<TaxId, u32>,
    translated_frames: Vec<String>,
}

impl ScratchBuffers {
    #[must_use]
    pub fn new(options: &IndexOptions) -> Self {
        Self {
            scanner: MinimizerScanner::from_options(options),
            taxa: Vec::new(),
            hit_counts: AHashMap::new(),
            translated_frames: vec![String::new(); 6],
        }
    }
}

/// Classify one read, updating stats and per-taxon counters.
///
/// The record is taken by mutable reference because quality masking
/// rewrites low-quality bases in place before scanning.
pub fn classify_record(
    record: &mut SequenceRecord,
    index: &Index,
    opts: &ClassifyOptions,
    stats: &mut ClassificationStats,
    taxon_counts: &mut TaxonCounts,
    scratch: &mut ScratchBuffers,
) -> ClassificationResult {
    stats.total_sequences += 1;
    if opts.minimum_quality_score > 0 {
        mask_low_quality_bases(record, opts.minimum_quality_score);
    }
    let result = classify_sequence(record, index, opts, stats, taxon_counts, scratch);
    stats.total_bases += record.seq.len() as u64;
    result
}

/// Replace bases whose quality is below `minimum_quality_score` with `x`,
/// which no scanner alphabet contains.
pub fn mask_low_quality_bases(record: &mut SequenceRecord, minimum_quality_score: u8) {
    if record.format != SequenceFormat::Fastq {
        return;
    }
    let mut bytes = std::mem::take(&mut record.seq).into_bytes();
    for (base, &qual) in bytes.iter_mut().zip(record.quals.as_bytes()) {
        if qual.saturating_sub(b'!') < minimum_quality_score {
            *base = b'x';
        }
    }
    record.seq = String::from_utf8(bytes)
        .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned());
}

fn classify_sequence(
    record: &SequenceRecord,
    index: &Index,
    opts: &ClassifyOptions,
    stats: &mut ClassificationStats,
    taxon_counts: &mut TaxonCounts,
    scratch: &mut ScratchBuffers,
) -> ClassificationResult {
    let ScratchBuffers {
        scanner,
        taxa,
        hit_counts,
        translated_frames,
    } = scratch;
    taxa.clear();
    hit_counts.clear();

    let frame_count = if opts.use_translated_search {
        translate_to_all_frames(&record.seq, translated_frames);
        6
    } else {
        1
    };
    let mut minimizer_hit_groups: u64 = 0;

    for frame_idx in 0..frame_count {
        if opts.use_translated_search {
            scanner.load_sequence(&translated_frames[frame_idx]);
        } else {
            scanner.load_sequence(&record.seq);
        }
        let mut last_minimizer = u64::MAX;
        let mut last_taxon: TaxId = TAXID_MAX;
        while let Some(minimizer) = scanner.next_minimizer() {
            let taxon = if scanner.is_ambiguous() {
                AMBIGUOUS_SPAN_TAXON
            } else {
                let taxon = if minimizer == last_minimizer {
                    last_taxon
                } else {
                    let skip_lookup = index.options.minimum_acceptable_hash_value != 0
                        && murmur_hash3(minimizer) < index.options.minimum_acceptable_hash_value;
                    let taxon = if skip_lookup { 0 } else { index.hash.get(minimizer) };
                    last_taxon = taxon;
                    last_minimizer = minimizer;
                    // Hit groups count once per (hit, new-minimizer) pair;
                    // the same pair registers the minimizer for the
                    // distinct-k-mer estimate.
                    if taxon != 0 {
                        minimizer_hit_groups += 1;
                        taxon_counts.entry(taxon).or_default().add_kmer(minimizer);
                    }
                    taxon
                };
                if taxon != 0 {
                    *hit_counts.entry(taxon).or_insert(0) += 1;
                }
                taxon
            };
            taxa.push(taxon);
        }
        if opts.use_translated_search && frame_idx != 5 {
            taxa.push(READING_FRAME_BORDER_TAXON);
        }
    }

    let mut total_kmers = taxa.len();
    if opts.use_translated_search {
        // account for reading frame markers
        total_kmers = total_kmers.saturating_sub(2);
    }

    let mut call = resolve_tree(hit_counts, &index.taxonomy, total_kmers, opts);
    // Void a call made by too few minimizer groups
    if call != 0 && minimizer_hit_groups < opts.minimum_hit_groups {
        call = 0;
    }

    if call != 0 {
        stats.total_classified += 1;
        taxon_counts.entry(call).or_default().increment_read_count();
    }

    let (classified, tax_id, name) = if call != 0 {
        let name = index
            .taxonomy
            .node(call)
            .map(|node| index.taxonomy.name(node).to_string())
            .unwrap_or_default();
        (true, index.taxonomy.external_id(call), name)
    } else {
        (false, 0, String::new())
    };

    let hitlist = if taxa.is_empty() {
        "0:0".to_string()
    } else {
        hitlist_string(taxa, &index.taxonomy)
    };

    ClassificationResult {
        id: record.id.clone(),
        classified,
        tax_id,
        name,
        size: record.seq.len(),
        hitlist,
    }
}

/// Pick the best-supported taxon from the hit tally.
///
/// Each taxon scores the hits on its leaf-to-root path; the top scorer
/// wins, ties resolve to the LCA. When the winner lacks the required
/// confidence its clade score is re-checked while climbing towards the
/// root, falling off as unclassified if support never suffices.
pub fn resolve_tree(
    hit_counts: &AHashMap<TaxId, u32>,
    taxonomy: &Taxonomy,
    total_minimizers: usize,
    opts: &ClassifyOptions,
) -> TaxId {
    let mut max_taxon: TaxId = 0;
    let mut max_score: u32 = 0;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let required_score = (opts.confidence_threshold * total_minimizers as f64).ceil() as u32;

    // Fixed iteration order keeps tie-breaking deterministic.
    let mut taxa: Vec<(TaxId, u32)> = hit_counts.iter().map(|(&t, &c)| (t, c)).collect();
    taxa.sort_unstable_by_key(|&(taxon, _)| taxon);

    for &(taxon, _) in &taxa {
        let mut score = 0u32;
        for &(taxon2, count2) in &taxa {
            if taxonomy.is_a_ancestor_of_b(taxon2, taxon) {
                score += count2;
            }
        }
        if score > max_score {
            max_score = score;
            max_taxon = taxon;
        } else if score == max_score {
            max_taxon = taxonomy.lowest_common_ancestor(max_taxon, taxon);
        }
    }

    // Reset the score to hits at the called taxon alone; the LCA of a tie
    // may not satisfy the threshold on its own.
    max_score = hit_counts.get(&max_taxon).copied().unwrap_or(0);
    while max_taxon != 0 && max_score < required_score {
        max_score = 0;
        for &(taxon, count) in &taxa {
            if taxonomy.is_a_ancestor_of_b(max_taxon, taxon) {
                max_score += count;
            }
        }
        if max_score >= required_score {
            return max_taxon;
        }
        // Not enough support here; climb towards the root.
        max_taxon = taxonomy.node(max_taxon).map_or(0, |n| n.parent_id);
    }

    max_taxon
}

/// Render the per-k-mer call trace as `taxid:count` runs.
fn hitlist_string(taxa: &[TaxId], taxonomy: &Taxonomy) -> String {
    let mut out = String::new();
    let mut last_code = taxa[0];
    let mut code_count = 1usize;

    for &code in &taxa[1..] {
        if code == last_code {
            code_count += 1;
        } else {
            write_run(&mut out, last_code, code_count, taxonomy);
            out.push(' ');
            code_count = 1;
            last_code = code;
        }
    }
    write_run(&mut out, last_code, code_count, taxonomy);
    out
}

fn write_run(out: &mut String, code: TaxId, count: usize, taxonomy: &Taxonomy) {
    if code == READING_FRAME_BORDER_TAXON {
        out.push_str("-:-");
    } else if code == AMBIGUOUS_SPAN_TAXON {
        let _ = write!(out, "A:{count}");
    } else {
        let _ = write!(out, "{}:{count}", taxonomy.external_id(code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::compact_hash::tests::build_hash_table;
    use crate::index::taxonomy::tests::sample_taxonomy;

    fn encode_dna(s: &str) -> u64 {
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

    /// k = l = 5 index over the sample taxonomy: AAAAA -> E. coli (3),
    /// CCCCC -> Salmonella (4), GATTA -> Bacteria (2).
    fn test_index() -> Index {
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
        // Keys are canonical 5-mers (k == l, toggle 0).
        let canon = |s: &str| {
            let rc: String = s
                .chars()
                .rev()
                .map(|c| match c {
                    'A' => 'T',
                    'C' => 'G',
                    'G' => 'C',
                    'T' => 'A',
                    _ => unreachable!(),
                })
                .collect();
            encode_dna(s).min(encode_dna(&rc))
        };
        let hash = build_hash_table(
            1024,
            16,
            &[
                (canon("AAAAA"), 3),
                (canon("CCCCC"), 4),
                (canon("GATTA"), 2),
            ],
        );
        Index::from_parts(options, sample_taxonomy(), hash)
    }

    fn record(id: &str, seq: &str) -> SequenceRecord {
        SequenceRecord {
            id: id.to_string(),
            header: format!(">{id}"),
            seq: seq.to_string(),
            quals: String::new(),
            format: SequenceFormat::Fasta,
        }
    }

    fn classify_one(
        record: &mut SequenceRecord,
        index: &Index,
        opts: &ClassifyOptions,
    ) -> (ClassificationResult, ClassificationStats, TaxonCounts) {
        let mut stats = ClassificationStats::default();
        let mut counts = TaxonCounts::default();
        let mut scratch = ScratchBuffers::new(&index.options);
        let result = classify_record(record, index, opts, &mut stats, &mut counts, &mut scratch);
        (result, stats, counts)
    }

    #[test]
    fn classifies_a_read_with_distinct_hits() {
        let index = test_index();
        // AAAAA and CCCCC clades tie at 2 hits each... avoid that: one
        // clear winner with two distinct minimizer groups.
        let mut rec = record("r1", "AAAAAGATTA");
        let opts = ClassifyOptions::default();
        let (result, stats, counts) = classify_one(&mut rec, &index, &opts);

        assert!(result.classified);
        // Hits on 3 (E. coli) and 2 (Bacteria): path score favors 3.
        assert_eq!(result.tax_id, 562);
        assert_eq!(result.name, "Escherichia coli");
        assert_eq!(result.size, 10);
        assert_eq!(stats.total_sequences, 1);
        assert_eq!(stats.total_bases, 10);
        assert_eq!(stats.total_classified, 1);
        assert_eq!(counts[&3].read_count(), 1);
    }

    #[test]
    fn voids_calls_with_too_few_hit_groups() {
        let index = test_index();
        // Single run of A's: every k-mer shares one minimizer, so there
        // is exactly one hit group.
        let mut rec = record("r2", "AAAAAAAA");
        let opts = ClassifyOptions::default(); // minimum_hit_groups = 2
        let (result, stats, _) = classify_one(&mut rec, &index, &opts);
        assert!(!result.classified);
        assert_eq!(result.tax_id, 0);
        assert_eq!(stats.total_classified, 0);

        let opts = ClassifyOptions {
            minimum_hit_groups: 1,
            ..ClassifyOptions::default()
        };
        let (result, _, _) = classify_one(&mut rec.clone(), &index, &opts);
        assert!(result.classified);
        assert_eq!(result.tax_id, 562);
    }

    #[test]
    fn unmatched_read_is_unclassified_with_zero_hitlist_runs() {
        let index = test_index();
        let mut rec = record("r3", "TGTGTGTG");
        let opts = ClassifyOptions {
            minimum_hit_groups: 1,
            ..ClassifyOptions::default()
        };
        let (result, _, _) = classify_one(&mut rec, &index, &opts);
        assert!(!result.classified);
        assert_eq!(result.name, "");
        // 4 k-mers, none matching.
        assert_eq!(result.hitlist, "0:4");
    }

    #[test]
    fn short_read_renders_empty_hitlist_sentinel() {
        let index = test_index();
        let mut rec = record("tiny", "ACG");
        let opts = ClassifyOptions::default();
        let (result, _, _) = classify_one(&mut rec, &index, &opts);
        assert!(!result.classified);
        assert_eq!(result.hitlist, "0:0");
    }

    #[test]
    fn hitlist_reports_runs_and_ambiguous_spans() {
        let index = test_index();
        // 5 A-kmers, then windows crossing the N are ambiguous, then
        // one unmatched k-mer.
        let mut rec = record("r4", "AAAAAAAAANACGTA");
        let opts = ClassifyOptions {
            minimum_hit_groups: 1,
            ..ClassifyOptions::default()
        };
        let (result, _, _) = classify_one(&mut rec, &index, &opts);
        assert_eq!(result.hitlist, "562:5 A:5 0:1");
    }

    #[test]
    fn confidence_threshold_climbs_to_the_lca() {
        let index = test_index();
        // 3 hits on E. coli (562), 2 on Salmonella (28901): with no
        // threshold the call is E. coli.
        let mut rec = record("r5", "AAAAAAACCCCCC");
        let relaxed = ClassifyOptions {
            minimum_hit_groups: 1,
            ..ClassifyOptions::default()
        };
        let (result, _, _) = classify_one(&mut rec.clone(), &index, &relaxed);
        assert_eq!(result.tax_id, 562);

        // Requiring half of the 9 k-mers (5 after rounding up) exceeds
        // E. coli's 3 hits and forces the call up to Bacteria, whose
        // clade holds all 5.
        let strict = ClassifyOptions {
            confidence_threshold: 0.5,
            minimum_hit_groups: 1,
            ..ClassifyOptions::default()
        };
        let (result, _, _) = classify_one(&mut rec, &index, &strict);
        assert_eq!(result.tax_id, 2);
        assert_eq!(result.name, "Bacteria");
    }

    #[test]
    fn quality_masking_blanks_weak_bases() {
        let mut rec = SequenceRecord {
            id: "q1".into(),
            header: "@q1".into(),
            seq: "ACGT".into(),
            quals: "!I!I".into(),
            format: SequenceFormat::Fastq,
        };
        mask_low_quality_bases(&mut rec, 10);
        assert_eq!(rec.seq, "xCxT");

        // FASTA records are untouched.
        let mut rec = record("f", "ACGT");
        mask_low_quality_bases(&mut rec, 10);
        assert_eq!(rec.seq, "ACGT");
    }

    #[test]
    fn resolve_tree_prefers_deepest_sufficient_score() {
        let index = test_index();
        let mut hits: AHashMap<TaxId, u32> = AHashMap::new();
        hits.insert(3, 3);
        hits.insert(4, 2);
        let opts = ClassifyOptions::default();
        assert_eq!(resolve_tree(&hits, &index.taxonomy, 5, &opts), 3);

        // A tie resolves to the LCA.
        let mut hits: AHashMap<TaxId, u32> = AHashMap::new();
        hits.insert(3, 2);
        hits.insert(4, 2);
        assert_eq!(resolve_tree(&hits, &index.taxonomy, 4, &opts), 2);
    }
}
