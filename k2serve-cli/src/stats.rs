//! Per-stream and cumulative classification statistics.

use k2serve_core::classify::ClassificationStats;
use k2serve_core::counters::{merge_taxon_counts, TaxonCounts};
use k2serve_core::index::Taxonomy;
use k2serve_core::report::{self, ReportOptions};
use parking_lot::Mutex;

use crate::worker_pool::BatchResult;

/// Counters accumulated over one classify stream.
#[derive(Debug, Default)]
pub struct StreamStats {
    pub stats: ClassificationStats,
    pub taxon_counters: TaxonCounts,
}

impl StreamStats {
    /// Fold one batch result in.
    pub fn absorb(&mut self, batch: &BatchResult) {
        self.stats.merge(&batch.stats);
        merge_taxon_counts(&mut self.taxon_counters, &batch.taxon_counters);
    }

    /// Render this stream's summary report.
    #[must_use]
    pub fn render_report(&self, taxonomy: &Taxonomy, opts: &ReportOptions) -> String {
        let unclassified = self.stats.total_sequences - self.stats.total_classified;
        report::render_report(
            taxonomy,
            &self.taxon_counters,
            self.stats.total_sequences,
            unclassified,
            opts,
        )
    }
}

/// Server-wide totals, merged into at end-of-stream under a single lock.
///
/// This block and the shutdown latch are the only process-scoped mutable
/// state in the server.
pub struct StatisticsAggregator {
    enabled: bool,
    cumulative: Mutex<StreamStats>,
}

impl StatisticsAggregator {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            cumulative: Mutex::new(StreamStats::default()),
        }
    }

    /// Fold a finished stream into the cumulative totals. A no-op when
    /// statistics tracking is disabled.
    pub fn merge(&self, stream: &StreamStats) {
        if !self.enabled {
            return;
        }
        let mut cumulative = self.cumulative.lock();
        cumulative.stats.merge(&stream.stats);
        merge_taxon_counts(&mut cumulative.taxon_counters, &stream.taxon_counters);
    }

    /// Snapshot of the cumulative throughput counters.
    #[must_use]
    pub fn totals(&self) -> ClassificationStats {
        self.cumulative.lock().stats
    }

    /// Render the cumulative summary: the report plus the totals block.
    #[must_use]
    pub fn render_summary(&self, taxonomy: &Taxonomy, opts: &ReportOptions) -> String {
        if !self.enabled {
            return "Summary not available on this server.".to_string();
        }
        let cumulative = self.cumulative.lock();
        let report = cumulative.render_report(taxonomy, opts);
        format!("{report}\n{}", report::render_totals(&cumulative.stats))
    }
}
