//! The taxonomy tree stored in `taxo.k2d`.
//!
//! File layout: an 8-byte magic, three u64 counts (nodes, name bytes,
//! rank bytes), the node table, the name string pool and the rank string
//! pool. Node ids are array indices assigned so that every child id is
//! greater than its parent id; id 0 is a sentinel that never names a
//! real taxon.

use std::path::Path;

use crate::error::{CoreError, Result};

/// Magic bytes at the head of `taxo.k2d`.
pub const TAXONOMY_MAGIC: &[u8; 8] = b"K2TAXDAT";

/// Internal taxon identifier: an index into the node table.
pub type TaxId = u64;

const NODE_BYTES: usize = 56;
const HEADER_BYTES: usize = 32;

/// One node of the taxonomy tree.
#[derive(Clone, Copy, Debug, Default)]
pub struct TaxonomyNode {
    pub parent_id: TaxId,
    /// Children occupy the id range `[first_child, first_child + child_count)`.
    pub first_child: TaxId,
    pub child_count: u64,
    /// Offset of the NUL-terminated scientific name in the name pool.
    pub name_offset: u64,
    /// Offset of the NUL-terminated rank string in the rank pool.
    pub rank_offset: u64,
    /// External (NCBI-style) taxonomy id.
    pub external_id: u64,
    pub godparent_id: TaxId,
}

/// Immutable taxonomy tree with string pools for names and ranks.
#[derive(Debug)]
pub struct Taxonomy {
    nodes: Vec<TaxonomyNode>,
    name_data: Vec<u8>,
    rank_data: Vec<u8>,
}

impl Taxonomy {
    /// Load the taxonomy from a file.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, a bad magic, or counts inconsistent with the
    /// file size.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let buf = std::fs::read(path).map_err(|e| CoreError::io(path, e))?;
        Self::from_bytes(&buf).map_err(|reason| CoreError::invalid(path, "taxonomy", reason))
    }

    /// Parse a complete in-memory image of `taxo.k2d`.
    ///
    /// # Errors
    ///
    /// Returns a human-readable description of the first inconsistency.
    pub fn from_bytes(buf: &[u8]) -> std::result::Result<Self, String> {
        if buf.len() < HEADER_BYTES {
            return Err(format!("file holds {} bytes, header needs {HEADER_BYTES}", buf.len()));
        }
        if &buf[0..8] != TAXONOMY_MAGIC {
            return Err("bad magic".to_string());
        }
        let node_count = read_u64(buf, 8) as usize;
        let name_data_len = read_u64(buf, 16) as usize;
        let rank_data_len = read_u64(buf, 24) as usize;

        let nodes_end = HEADER_BYTES + node_count * NODE_BYTES;
        let names_end = nodes_end + name_data_len;
        let ranks_end = names_end + rank_data_len;
        if buf.len() < ranks_end {
            return Err(format!(
                "file holds {} bytes but header promises {ranks_end}",
                buf.len()
            ));
        }

        let mut nodes = Vec::with_capacity(node_count);
        for i in 0..node_count {
            let base = HEADER_BYTES + i * NODE_BYTES;
            nodes.push(TaxonomyNode {
                parent_id: read_u64(buf, base),
                first_child: read_u64(buf, base + 8),
                child_count: read_u64(buf, base + 16),
                name_offset: read_u64(buf, base + 24),
                rank_offset: read_u64(buf, base + 32),
                external_id: read_u64(buf, base + 40),
                godparent_id: read_u64(buf, base + 48),
            });
        }

        Ok(Self {
            nodes,
            name_data: buf[nodes_end..names_end].to_vec(),
            rank_data: buf[names_end..ranks_end].to_vec(),
        })
    }

    #[must_use]
    pub fn node_count(&self) -> u64 {
        self.nodes.len() as u64
    }

    #[must_use]
    pub fn nodes(&self) -> &[TaxonomyNode] {
        &self.nodes
    }

    /// Node for `taxon`, or `None` for the 0 sentinel and out-of-range ids.
    #[must_use]
    pub fn node(&self, taxon: TaxId) -> Option<&TaxonomyNode> {
        if taxon == 0 {
            return None;
        }
        self.nodes.get(taxon as usize)
    }

    /// Scientific name of a node; empty when the offset is out of range.
    #[must_use]
    pub fn name(&self, node: &TaxonomyNode) -> &str {
        pool_str(&self.name_data, node.name_offset as usize)
    }

    /// Rank string of a node; empty when the offset is out of range.
    #[must_use]
    pub fn rank(&self, node: &TaxonomyNode) -> &str {
        pool_str(&self.rank_data, node.rank_offset as usize)
    }

    /// External id of `taxon`, or 0 for the sentinel.
    #[must_use]
    pub fn external_id(&self, taxon: TaxId) -> u64 {
        self.node(taxon).map_or(0, |n| n.external_id)
    }

    /// Is `a` an ancestor of (or equal to) `b`?
    ///
    /// Relies on ids being assigned parent-before-child, so the walk from
    /// `b` towards the root can stop as soon as the id drops below `a`.
    #[must_use]
    pub fn is_a_ancestor_of_b(&self, a: TaxId, b: TaxId) -> bool {
        if a == 0 || b == 0 {
            return false;
        }
        let mut b = b;
        while b > a {
            b = match self.node(b) {
                Some(node) => node.parent_id,
                None => return false,
            };
        }
        b == a
    }

    /// Lowest common ancestor of `a` and `b`; the sentinel 0 acts as an
    /// identity so `lca(0, x) == x`.
    #[must_use]
    pub fn lowest_common_ancestor(&self, a: TaxId, b: TaxId) -> TaxId {
        if a == 0 || b == 0 {
            return if a == 0 { b } else { a };
        }
        let (mut a, mut b) = (a, b);
        while a != b {
            if a > b {
                a = self.node(a).map_or(0, |n| n.parent_id);
            } else {
                b = self.node(b).map_or(0, |n| n.parent_id);
            }
            if a == 0 || b == 0 {
                return 0;
            }
        }
        a
    }
}

fn pool_str(pool: &[u8], offset: usize) -> &str {
    if offset >= pool.len() {
        return "";
    }
    let tail = &pool[offset..];
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    std::str::from_utf8(&tail[..end]).unwrap_or("")
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().expect("8-byte slice"))
}
