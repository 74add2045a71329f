//! Sequence records and the FASTA/FASTQ file reader.
//!
//! `RecordReader` produces a lazy, finite, non-restartable stream of
//! [`SequenceRecord`]s from a single input file. Gzip compression is
//! detected by content (the two-byte magic), never by file extension, so
//! `reads.fastq` and `reads.fastq.gz` both work regardless of how they
//! were named.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use tracing::warn;

use crate::error::{CoreError, Result};

/// On-disk format of a sequence record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SequenceFormat {
    /// Format not yet determined.
    #[default]
    AutoDetect,
    Fasta,
    Fastq,
}

/// A single read as it appears in a FASTA/FASTQ file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceRecord {
    /// First whitespace-delimited token of the header line.
    pub id: String,
    /// Original header line including the leading `>` or `@`.
    pub header: String,
    /// Base string.
    pub seq: String,
    /// Quality string; empty for FASTA, one char per base for FASTQ.
    pub quals: String,
    pub format: SequenceFormat,
}

impl SequenceRecord {
    /// Check the FASTQ invariant: the quality string covers every base.
    ///
    /// Returns `false` for FASTQ records whose quality string length does
    /// not match the sequence length; such records must not be classified.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        match self.format {
            SequenceFormat::Fastq => self.quals.len() == self.seq.len(),
            _ => true,
        }
    }
}

/// Gzip stream magic.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Lazy reader over the records of one (possibly gzip-compressed) file.
pub struct RecordReader {
    input: Box<dyn BufRead + Send>,
    path: PathBuf,
    /// Header line read while scanning for the end of the previous record.
    pending: Option<String>,
    eof: bool,
}

impl RecordReader {
    /// Open `path`, sniffing the gzip magic from the file's first bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Io`] if the file cannot be opened or its first
    /// block cannot be read.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| CoreError::io(&path, e))?;
        let mut buffered = BufReader::new(file);

        let head = buffered
            .fill_buf()
            .map_err(|e| CoreError::io(&path, e))?;
        let gzipped = head.len() >= 2 && head[..2] == GZIP_MAGIC;

        let input: Box<dyn BufRead + Send> = if gzipped {
            Box::new(BufReader::new(MultiGzDecoder::new(buffered)))
        } else {
            Box::new(buffered)
        };

        Ok(Self {
            input,
            path,
            pending: None,
            eof: false,
        })
    }

    /// Build a reader over an arbitrary source; used by unit tests.
    #[must_use]
    pub fn from_reader(reader: impl Read + Send + 'static, label: impl Into<PathBuf>) -> Self {
        Self {
            input: Box::new(BufReader::new(reader)),
            path: label.into(),
            pending: None,
            eof: false,
        }
    }

    /// Read up to `max` records. Returns fewer than `max` only at end of
    /// file, and an empty vector only once the file is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Io`] on any read failure other than EOF.
    pub fn read_batch(&mut self, max: usize) -> Result<Vec<SequenceRecord>> {
        let mut batch = Vec::with_capacity(max.min(4096));
        while batch.len() < max {
            match self.next_record()? {
                Some(record) => batch.push(record),
                None => break,
            }
        }
        Ok(batch)
    }

    /// Parse the next record, skipping lines that start neither a FASTA
    /// nor a FASTQ record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Io`] on any read failure other than EOF.
    pub fn next_record(&mut self) -> Result<Option<SequenceRecord>> {
        loop {
            let header = match self.take_line()? {
                Some(line) => line,
                None => return Ok(None),
            };
            if header.is_empty() {
                continue;
            }
            match header.as_bytes()[0] {
                b'>' => return self.finish_fasta(header),
                b'@' => return self.finish_fastq(header),
                _ => {
                    warn!(
                        file = %self.path.display(),
                        line = %truncate_for_log(&header),
                        "skipping line with unrecognized record format"
                    );
                }
            }
        }
    }

    fn finish_fasta(&mut self, header: String) -> Result<Option<SequenceRecord>> {
        let mut seq = String::new();
        loop {
            match self.take_line()? {
                Some(line) if line.starts_with('>') || line.starts_with('@') => {
                    self.pending = Some(line);
                    break;
                }
                Some(line) => seq.push_str(line.trim_end()),
                None => break,
            }
        }
        Ok(Some(make_record(header, seq, String::new(), SequenceFormat::Fasta)))
    }

    fn finish_fastq(&mut self, header: String) -> Result<Option<SequenceRecord>> {
        let Some(seq) = self.take_line()? else {
            warn!(file = %self.path.display(), "truncated FASTQ record at end of file");
            return Ok(None);
        };
        let Some(plus) = self.take_line()? else {
            warn!(file = %self.path.display(), "truncated FASTQ record at end of file");
            return Ok(None);
        };
        if !plus.starts_with('+') {
            warn!(
                file = %self.path.display(),
                id = %header,
                "skipping FASTQ record without separator line"
            );
            // The line we mistook for the separator may start a new record.
            if plus.starts_with('>') || plus.starts_with('@') {
                self.pending = Some(plus);
            }
            return self.next_record();
        }
        let Some(quals) = self.take_line()? else {
            warn!(file = %self.path.display(), "truncated FASTQ record at end of file");
            return Ok(None);
        };
        Ok(Some(make_record(header, seq, quals, SequenceFormat::Fastq)))
    }

    /// Next line with the trailing newline stripped, or `None` at EOF.
    fn take_line(&mut self) -> Result<Option<String>> {
        if let Some(line) = self.pending.take() {
            return Ok(Some(line));
        }
        if self.eof {
            return Ok(None);
        }
        let mut line = String::new();
        let n = self
            .input
            .read_line(&mut line)
            .map_err(|e| CoreError::io(&self.path, e))?;
        if n == 0 {
            self.eof = true;
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }
}

fn make_record(
    header: String,
    seq: String,
    quals: String,
    format: SequenceFormat,
) -> SequenceRecord {
    let id = header[1..]
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_string();
    SequenceRecord {
        id,
        header,
        seq,
        quals,
        format,
    }
}

fn truncate_for_log(line: &str) -> &str {
    let end = line
        .char_indices()
        .nth(40)
        .map_or(line.len(), |(idx, _)| idx);
    &line[..end]
}
