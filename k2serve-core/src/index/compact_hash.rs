//! The compact minimizer-to-taxon hash table stored in `hash.k2d`.
//!
//! The table is open-addressed with double hashing. Each cell is 32 bits:
//! the low `value_bits` hold the taxon value, the rest hold a compacted
//! fragment of the key's hash. A value of 0 marks an empty cell, which is
//! also why taxon 0 can never be stored.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{CoreError, Result};
use crate::index::taxonomy::TaxId;

const HEADER_BYTES: usize = 32;
const CELL_BYTES: usize = 4;

/// Finalizer of MurmurHash3 (fmix64); the hash used both for probing the
/// table and for the minimizer-subsampling cutoff.
#[inline]
#[must_use]
pub const fn murmur_hash3(key: u64) -> u64 {
    let mut k = key;
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

#[derive(Debug)]
enum Backing {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl Backing {
    fn data(&self) -> &[u8] {
        match self {
            Self::Owned(buf) => buf,
            Self::Mapped(map) => map,
        }
    }
}

/// Read-only compact hash table over minimizers.
#[derive(Debug)]
pub struct CompactHashTable {
    backing: Backing,
    capacity: usize,
    size: usize,
    key_bits: u32,
    value_bits: u32,
}

impl CompactHashTable {
    /// Load the table from a file, optionally memory-mapped.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or a header inconsistent with the file size.
    pub fn open(path: impl AsRef<Path>, memory_mapping: bool) -> Result<Self> {
        let path = path.as_ref();
        let backing = if memory_mapping {
            let file = File::open(path).map_err(|e| CoreError::io(path, e))?;
            // SAFETY: the file is opened read-only and the database
            // contract is that nothing rewrites it while the server runs.
            let map = unsafe { Mmap::map(&file) }.map_err(|e| CoreError::io(path, e))?;
            Backing::Mapped(map)
        } else {
            Backing::Owned(std::fs::read(path).map_err(|e| CoreError::io(path, e))?)
        };
        Self::from_backing(backing)
            .map_err(|reason| CoreError::invalid(path, "hash table", reason))
    }

    /// Parse a complete in-memory image of `hash.k2d`; used by tests.
    ///
    /// # Errors
    ///
    /// Returns a description of the first inconsistency found.
    pub fn from_bytes(buf: Vec<u8>) -> std::result::Result<Self, String> {
        Self::from_backing(Backing::Owned(buf))
    }

    fn from_backing(backing: Backing) -> std::result::Result<Self, String> {
        let data = backing.data();
        if data.len() < HEADER_BYTES {
            return Err(format!(
                "file holds {} bytes, header needs {HEADER_BYTES}",
                data.len()
            ));
        }
        let capacity = read_u64(data, 0) as usize;
        let size = read_u64(data, 8) as usize;
        let key_bits = read_u64(data, 16) as u32;
        let value_bits = read_u64(data, 24) as u32;

        if value_bits == 0 || value_bits >= 32 {
            return Err(format!("implausible value_bits {value_bits}"));
        }
        let expected = HEADER_BYTES + capacity * CELL_BYTES;
        if data.len() < expected {
            return Err(format!(
                "file holds {} bytes but capacity {capacity} needs {expected}",
                data.len()
            ));
        }

        Ok(Self {
            backing,
            capacity,
            size,
            key_bits,
            value_bits,
        })
    }

    /// Number of cells in the table.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of occupied cells.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn key_bits(&self) -> u32 {
        self.key_bits
    }

    #[must_use]
    pub const fn value_bits(&self) -> u32 {
        self.value_bits
    }

    #[inline]
    fn cell(&self, idx: usize) -> u32 {
        let off = HEADER_BYTES + idx * CELL_BYTES;
        let bytes = &self.backing.data()[off..off + CELL_BYTES];
        u32::from_le_bytes(bytes.try_into().expect("4-byte slice"))
    }

    /// Look up the taxon stored for `key`, or 0 when absent.
    ///
    /// Probes with the key's hash, stepping by `(hash >> 8) | 1` and
    /// stopping at an empty cell or after a full cycle.
    #[must_use]
    pub fn get(&self, key: u64) -> TaxId {
        if self.capacity == 0 {
            return 0;
        }
        let hc = murmur_hash3(key);
        let compacted_key = (hc >> (32 + self.value_bits)) as u32;
        let value_mask = (1u32 << self.value_bits) - 1;

        let mut idx = (hc % self.capacity as u64) as usize;
        let first_idx = idx;
        let mut step = 0usize;
        loop {
            let cell = self.cell(idx);
            let value = cell & value_mask;
            if value == 0 {
                // empty cell ends the probe
                return 0;
            }
            if cell >> self.value_bits == compacted_key {
                return TaxId::from(value);
            }
            if step == 0 {
                step = (((hc >> 8) | 1) % self.capacity as u64) as usize;
                if step == 0 {
                    step = 1;
                }
            }
            idx = (idx + step) % self.capacity;
            if idx == first_idx {
                return 0;
            }
        }
    }
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().expect("8-byte slice"))
}
