//! The immutable on-disk classification database.
//!
//! A database directory holds three files with fixed names: the
//! parameter block (`opts.k2d`), the taxonomy tree (`taxo.k2d`) and the
//! compact minimizer-to-taxon hash table (`hash.k2d`). All three are
//! loaded once, never mutated, and shared by every classification worker
//! for the life of the process.

pub(crate) mod compact_hash;
mod options;
pub(crate) mod taxonomy;

pub use compact_hash::{murmur_hash3, CompactHashTable};
pub use options::IndexOptions;
pub use taxonomy::{TaxId, Taxonomy, TaxonomyNode};

use std::path::Path;

use tracing::info;

use crate::error::Result;

/// File name of the hash table within a database directory.
pub const HASH_FILENAME: &str = "hash.k2d";
/// File name of the taxonomy within a database directory.
pub const TAXONOMY_FILENAME: &str = "taxo.k2d";
/// File name of the parameter block within a database directory.
pub const OPTIONS_FILENAME: &str = "opts.k2d";

/// A fully loaded database: parameters, taxonomy and hash table.
#[derive(Debug)]
pub struct Index {
    pub options: IndexOptions,
    pub taxonomy: Taxonomy,
    pub hash: CompactHashTable,
}

impl Index {
    /// Load all three database files from `db_dir`.
    ///
    /// With `memory_mapping` the hash table (by far the largest file) is
    /// served straight from the page cache instead of being read into an
    /// owned buffer.
    ///
    /// # Errors
    ///
    /// Any unreadable or malformed file fails the load; the caller is
    /// expected to mark the index broken and refuse service.
    pub fn open(db_dir: impl AsRef<Path>, memory_mapping: bool) -> Result<Self> {
        let db_dir = db_dir.as_ref();

        let options = IndexOptions::open(db_dir.join(OPTIONS_FILENAME))?;
        let taxonomy = Taxonomy::open(db_dir.join(TAXONOMY_FILENAME))?;
        let hash = CompactHashTable::open(db_dir.join(HASH_FILENAME), memory_mapping)?;

        info!(
            db = %db_dir.display(),
            k = options.k,
            l = options.l,
            nodes = taxonomy.node_count(),
            capacity = hash.capacity(),
            "database loaded"
        );

        Ok(Self {
            options,
            taxonomy,
            hash,
        })
    }

    /// Assemble an index from already-parsed parts; used by tests.
    #[must_use]
    pub fn from_parts(options: IndexOptions, taxonomy: Taxonomy, hash: CompactHashTable) -> Self {
        Self {
            options,
            taxonomy,
            hash,
        }
    }
}
