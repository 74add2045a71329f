//! Per-taxon read and k-mer counters.

use ahash::AHashMap;

use crate::hll::HyperLogLog;
use crate::index::taxonomy::TaxId;

/// Counters kept per taxon: reads called at the taxon, k-mers mapped to
/// it, and an estimate of how many of those k-mers were distinct.
#[derive(Clone, Debug, Default)]
pub struct TaxonCounter {
    read_count: u64,
    kmer_count: u64,
    distinct: HyperLogLog,
}

impl TaxonCounter {
    /// Counter holding only reads; used for the synthetic rows of the
    /// report that no k-mer ever maps to.
    #[must_use]
    pub fn with_read_count(read_count: u64) -> Self {
        Self {
            read_count,
            ..Self::default()
        }
    }

    pub fn increment_read_count(&mut self) {
        self.read_count += 1;
    }

    /// Record one k-mer hit (identified by its minimizer).
    pub fn add_kmer(&mut self, minimizer: u64) {
        self.kmer_count += 1;
        self.distinct.insert(minimizer);
    }

    #[must_use]
    pub const fn read_count(&self) -> u64 {
        self.read_count
    }

    #[must_use]
    pub const fn kmer_count(&self) -> u64 {
        self.kmer_count
    }

    #[must_use]
    pub fn distinct_kmer_count(&self) -> u64 {
        self.distinct.cardinality()
    }

    /// Field-wise merge; distinct estimates combine by sketch union.
    pub fn merge(&mut self, other: &Self) {
        self.read_count += other.read_count;
        self.kmer_count += other.kmer_count;
        self.distinct.merge(&other.distinct);
    }
}

/// Taxon-keyed counter map, as accumulated per batch, per stream and
/// cumulatively per server.
pub type TaxonCounts = AHashMap<TaxId, TaxonCounter>;

/// Merge `from` into `into`, taxon by taxon.
pub fn merge_taxon_counts(into: &mut TaxonCounts, from: &TaxonCounts) {
    for (&taxon, counter) in from {
        into.entry(taxon).or_default().merge(counter);
    }
}
