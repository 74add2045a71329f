//! Protocol buffer definitions for the k2serve classification service.
//!
//! This crate holds the generated tonic/prost types for the wire protocol
//! plus the conversions between wire messages and the native record types
//! of `k2serve-core`.

// Include the generated protobuf code
tonic::include_proto!("k2serve.v1");

use k2serve_core::classify::ClassificationResult;
use k2serve_core::sequence::{self, SequenceFormat};

/// Hard cap on the serialized size of a single frame, enforced by both
/// sides of the stream. Senders split frames that would exceed it.
pub const MAX_FRAME_BYTES: usize = 128 * 1024 * 1024;

impl From<SequenceFormat> for sequence_record::Format {
    fn from(format: SequenceFormat) -> Self {
        match format {
            SequenceFormat::AutoDetect => Self::AutoDetect,
            SequenceFormat::Fasta => Self::Fasta,
            SequenceFormat::Fastq => Self::Fastq,
        }
    }
}

impl From<sequence_record::Format> for SequenceFormat {
    fn from(format: sequence_record::Format) -> Self {
        match format {
            sequence_record::Format::AutoDetect => Self::AutoDetect,
            sequence_record::Format::Fasta => Self::Fasta,
            sequence_record::Format::Fastq => Self::Fastq,
        }
    }
}

impl From<sequence::SequenceRecord> for SequenceRecord {
    fn from(record: sequence::SequenceRecord) -> Self {
        let format: sequence_record::Format = record.format.into();
        Self {
            id: record.id,
            header: record.header,
            seq: record.seq,
            quals: record.quals,
            format: format as i32,
        }
    }
}

impl From<SequenceRecord> for sequence::SequenceRecord {
    fn from(record: SequenceRecord) -> Self {
        let format = record.format();
        Self {
            id: record.id,
            header: record.header,
            seq: record.seq,
            quals: record.quals,
            format: format.into(),
        }
    }
}

impl From<ClassificationResult> for Classification {
    fn from(result: ClassificationResult) -> Self {
        Self {
            id: result.id,
            classified: result.classified,
            tax_id: result.tax_id,
            name: result.name,
            size: result.size as u64,
            hitlist: result.hitlist,
        }
    }
}

impl StreamResult {
    /// Wrap a batch of classifications in a response frame.
    #[must_use]
    pub fn classifications(classes: Vec<Classification>) -> Self {
        Self {
            result: Some(stream_result::Result::Classifications(
                ClassificationBatch { classes },
            )),
        }
    }

    /// Wrap the final summary text in a response frame.
    #[must_use]
    pub fn summary(text: impl Into<String>) -> Self {
        Self {
            result: Some(stream_result::Result::Summary(text.into())),
        }
    }
}
