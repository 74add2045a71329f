//! The fixed-layout parameter block stored in `opts.k2d`.

use std::path::Path;

use crate::error::{CoreError, Result};

/// Database-wide scanning parameters, read verbatim from `opts.k2d`.
///
/// The file is a dump of a C struct with natural alignment, so the layout
/// below mirrors that struct field for field, little-endian, including
/// the padding after the `dna_db` flag.
#[derive(Clone, Copy, Debug)]
pub struct IndexOptions {
    /// k-mer length.
    pub k: usize,
    /// Minimizer (l-mer) length; `l <= k`.
    pub l: usize,
    pub spaced_seed_mask: u64,
    pub toggle_mask: u64,
    /// True for nucleotide databases, false for protein databases.
    pub dna_db: bool,
    /// Minimizers hashing below this value are skipped during lookup;
    /// 0 disables the subsampling.
    pub minimum_acceptable_hash_value: u64,
    /// Version of the reverse-complement canonicalization scheme.
    pub revcom_version: u32,
    pub db_version: u32,
    pub db_type: u32,
}

/// Bytes of `opts.k2d` that must be present; trailing struct padding
/// beyond this is tolerated and ignored.
const OPTIONS_MIN_LEN: usize = 60;

impl IndexOptions {
    /// Read the parameter block from a file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or is too short to hold the
    /// struct.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let buf = std::fs::read(path).map_err(|e| CoreError::io(path, e))?;
        Self::from_bytes(&buf).ok_or_else(|| {
            CoreError::invalid(
                path,
                "index options",
                format!("file holds {} bytes, need at least {OPTIONS_MIN_LEN}", buf.len()),
            )
        })
    }

    /// Parse the struct image; `None` if `buf` is too short.
    #[must_use]
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < OPTIONS_MIN_LEN {
            return None;
        }
        Some(Self {
            k: read_u64(buf, 0) as usize,
            l: read_u64(buf, 8) as usize,
            spaced_seed_mask: read_u64(buf, 16),
            toggle_mask: read_u64(buf, 24),
            dna_db: buf[32] != 0,
            minimum_acceptable_hash_value: read_u64(buf, 40),
            revcom_version: read_u32(buf, 48),
            db_version: read_u32(buf, 52),
            db_type: read_u32(buf, 56),
        })
    }

    /// Serialize back into the on-disk layout. Only needed to fabricate
    /// databases in tests, but kept here so the layout knowledge lives in
    /// one place.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 64];
        buf[0..8].copy_from_slice(&(self.k as u64).to_le_bytes());
        buf[8..16].copy_from_slice(&(self.l as u64).to_le_bytes());
        buf[16..24].copy_from_slice(&self.spaced_seed_mask.to_le_bytes());
        buf[24..32].copy_from_slice(&self.toggle_mask.to_le_bytes());
        buf[32] = u8::from(self.dna_db);
        buf[40..48].copy_from_slice(&self.minimum_acceptable_hash_value.to_le_bytes());
        buf[48..52].copy_from_slice(&self.revcom_version.to_le_bytes());
        buf[52..56].copy_from_slice(&self.db_version.to_le_bytes());
        buf[56..60].copy_from_slice(&self.db_type.to_le_bytes());
        buf
    }
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().expect("8-byte slice"))
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().expect("4-byte slice"))
}
