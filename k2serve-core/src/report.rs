//! Kraken-style summary report rendering.
//!
//! The report is a depth-first walk of the taxonomy from the root,
//! printing one line per taxon with a clade count (reads in the subtree)
//! and a node count (reads called exactly there). Children are visited
//! in descending clade-read order so the most abundant lineages lead.

use std::fmt::Write as _;

use crate::classify::ClassificationStats;
use crate::counters::{TaxonCounter, TaxonCounts};
use crate::index::taxonomy::{TaxId, Taxonomy};

/// Rendering knobs for the summary report.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReportOptions {
    /// Emit rows for taxa with zero reads.
    pub report_zero_counts: bool,
    /// Add the k-mer and distinct-k-mer columns.
    pub report_kmer_data: bool,
}

/// Sum call counters over every ancestor chain, producing per-clade
/// counters keyed by taxon.
#[must_use]
pub fn clade_counters(taxonomy: &Taxonomy, call_counters: &TaxonCounts) -> TaxonCounts {
    let mut clades = TaxonCounts::default();
    for (&taxid, counter) in call_counters {
        let mut current = taxid;
        while current != 0 {
            clades.entry(current).or_default().merge(counter);
            current = taxonomy.node(current).map_or(0, |n| n.parent_id);
        }
    }
    clades
}

/// Render the full report for one set of call counters.
#[must_use]
pub fn render_report(
    taxonomy: &Taxonomy,
    call_counters: &TaxonCounts,
    total_seqs: u64,
    total_unclassified: u64,
    opts: &ReportOptions,
) -> String {
    let clades = clade_counters(taxonomy, call_counters);

    let mut out = String::new();
    out.push_str("% of Seqs\tClades\tTaxonomies\t");
    if opts.report_kmer_data {
        out.push_str("Kmers\tDistinct Kmers\t");
    }
    out.push_str("Rank\tTaxonomy ID\tScientific Name\n");

    // Special handling of the unclassified sequences
    if total_unclassified != 0 || opts.report_zero_counts {
        let counter = TaxonCounter::with_read_count(total_unclassified);
        report_line(
            &mut out,
            opts,
            total_seqs,
            &counter,
            &counter,
            "U",
            0,
            "unclassified",
            0,
        );
    }

    report_dfs(
        1,
        &mut out,
        opts,
        taxonomy,
        &clades,
        call_counters,
        total_seqs,
        'R',
        -1,
        0,
    );
    out
}

#[allow(clippy::too_many_arguments)]
fn report_dfs(
    taxid: TaxId,
    out: &mut String,
    opts: &ReportOptions,
    taxonomy: &Taxonomy,
    clade_counters: &TaxonCounts,
    call_counters: &TaxonCounts,
    total_seqs: u64,
    rank_code: char,
    rank_depth: i32,
    depth: usize,
) {
    let clade_reads = clade_counters.get(&taxid).map_or(0, TaxonCounter::read_count);
    // Clade count of 0 means all subtree nodes have clade count of 0
    if !opts.report_zero_counts && clade_reads == 0 {
        return;
    }
    let Some(node) = taxonomy.node(taxid) else {
        return;
    };

    let (rank_code, rank_depth) = match taxonomy.rank(node) {
        "superkingdom" => ('D', 0),
        "kingdom" => ('K', 0),
        "phylum" => ('P', 0),
        "class" => ('C', 0),
        "order" => ('O', 0),
        "family" => ('F', 0),
        "genus" => ('G', 0),
        "species" => ('S', 0),
        _ => (rank_code, rank_depth + 1),
    };
    let mut rank_str = rank_code.to_string();
    if rank_depth != 0 {
        let _ = write!(rank_str, "{rank_depth}");
    }

    let empty = TaxonCounter::default();
    report_line(
        out,
        opts,
        total_seqs,
        clade_counters.get(&taxid).unwrap_or(&empty),
        call_counters.get(&taxid).unwrap_or(&empty),
        &rank_str,
        node.external_id,
        taxonomy.name(node),
        depth,
    );

    // Sorting child IDs by descending order of clade read counts; the
    // stable sort keeps sibling ties in id order.
    let mut children: Vec<TaxId> =
        (node.first_child..node.first_child + node.child_count).collect();
    children.sort_by_key(|child| {
        std::cmp::Reverse(clade_counters.get(child).map_or(0, TaxonCounter::read_count))
    });
    for child in children {
        report_dfs(
            child,
            out,
            opts,
            taxonomy,
            clade_counters,
            call_counters,
            total_seqs,
            rank_code,
            rank_depth,
            depth + 1,
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn report_line(
    out: &mut String,
    opts: &ReportOptions,
    total_seqs: u64,
    clade_counter: &TaxonCounter,
    taxon_counter: &TaxonCounter,
    rank_str: &str,
    taxid: u64,
    sci_name: &str,
    depth: usize,
) {
    #[allow(clippy::cast_precision_loss)]
    let pct = if total_seqs == 0 {
        0.0
    } else {
        100.0 * clade_counter.read_count() as f64 / total_seqs as f64
    };
    let _ = write!(
        out,
        "{pct:6.2}\t{}\t{}\t",
        clade_counter.read_count(),
        taxon_counter.read_count()
    );
    if opts.report_kmer_data {
        let _ = write!(
            out,
            "{}\t{}\t",
            clade_counter.kmer_count(),
            clade_counter.distinct_kmer_count()
        );
    }
    let _ = write!(out, "{rank_str}\t{taxid}\t");
    for _ in 0..depth {
        out.push_str("  ");
    }
    out.push_str(sci_name);
    out.push('\n');
}

/// Human totals block appended to cumulative summaries.
#[must_use]
pub fn render_totals(stats: &ClassificationStats) -> String {
    let total_unclassified = stats.total_sequences - stats.total_classified;
    #[allow(clippy::cast_precision_loss)]
    let pct = |n: u64| {
        if stats.total_sequences == 0 {
            0.0
        } else {
            100.0 * n as f64 / stats.total_sequences as f64
        }
    };
    #[allow(clippy::cast_precision_loss)]
    let mbp = stats.total_bases as f64 / 1.0e6;
    format!(
        "{} sequences ({:.2} Mbp) processed.\n{} sequences classified ({:.2}%).\n{} sequences unclassified ({:.2}%).\n",
        stats.total_sequences,
        mbp,
        stats.total_classified,
        pct(stats.total_classified),
        total_unclassified,
        pct(total_unclassified),
    )
}
