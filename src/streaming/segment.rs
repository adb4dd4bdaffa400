//! Segment File Format
//!
//! A segment is the immutable unit of flushed data: one write-buffer batch
//! of a single shard. The manifest references segments by key and never
//! looks inside them.
//!
//! ## File Layout
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ Header (32 bytes)                │
//! │ - magic: "SVSG"                  │
//! │ - version: u8, flags: u8         │
//! │ - record_count: u32              │
//! │ - min_sequence, max_sequence     │
//! │ - header_checksum: u32           │
//! ├──────────────────────────────────┤
//! │ Records                          │
//! │ - length: u32                    │
//! │ - data: bincode(Record)          │
//! ├──────────────────────────────────┤
//! │ Footer (16 bytes)                │
//! │ - data_checksum: u32             │
//! │ - data_size: u64                 │
//! │ - footer_magic: "GSVS"           │
//! └──────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

pub const SEGMENT_MAGIC: [u8; 4] = *b"SVSG";
pub const FOOTER_MAGIC: [u8; 4] = *b"GSVS";
pub const SEGMENT_VERSION: u8 = 1;

const HEADER_SIZE: usize = 32;
const FOOTER_SIZE: usize = 16;

/// One ingested record.
///
/// Records are ordered by `(epoch, sequence)`: sequences restart from the
/// manifest's `next_sequence` whenever a new leader epoch begins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub epoch: u64,
    pub sequence: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Record {
    /// Approximate in-memory footprint used for size-triggered flushes
    pub fn size_bytes(&self) -> usize {
        self.key.len() + self.value.len() + 16
    }
}

#[derive(Debug)]
pub enum SegmentError {
    InvalidMagic,
    UnsupportedVersion(u8),
    ChecksumMismatch { expected: u32, actual: u32 },
    Truncated(&'static str),
    Serialization(String),
    Io(std::io::Error),
    Empty,
}

impl std::fmt::Display for SegmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentError::InvalidMagic => write!(f, "Invalid segment magic number"),
            SegmentError::UnsupportedVersion(v) => write!(f, "Unsupported segment version: {}", v),
            SegmentError::ChecksumMismatch { expected, actual } => {
                write!(f, "Checksum mismatch: expected {}, got {}", expected, actual)
            }
            SegmentError::Truncated(what) => write!(f, "Segment truncated in {}", what),
            SegmentError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            SegmentError::Io(e) => write!(f, "I/O error: {}", e),
            SegmentError::Empty => write!(f, "Segment is empty"),
        }
    }
}

impl std::error::Error for SegmentError {}

impl From<std::io::Error> for SegmentError {
    fn from(e: std::io::Error) -> Self {
        SegmentError::Io(e)
    }
}

impl From<bincode::Error> for SegmentError {
    fn from(e: bincode::Error) -> Self {
        SegmentError::Serialization(e.to_string())
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(buf)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub version: u8,
    pub flags: u8,
    pub record_count: u32,
    pub min_sequence: u64,
    pub max_sequence: u64,
}

impl SegmentHeader {
    fn checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&SEGMENT_MAGIC);
        hasher.update(&[self.version, self.flags]);
        hasher.update(&self.record_count.to_le_bytes());
        hasher.update(&self.min_sequence.to_le_bytes());
        hasher.update(&self.max_sequence.to_le_bytes());
        hasher.finalize()
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        buf.extend_from_slice(&SEGMENT_MAGIC);
        buf.push(self.version);
        buf.push(self.flags);
        buf.extend_from_slice(&self.record_count.to_le_bytes());
        buf.extend_from_slice(&self.min_sequence.to_le_bytes());
        buf.extend_from_slice(&self.max_sequence.to_le_bytes());
        buf.extend_from_slice(&self.checksum().to_le_bytes());
        buf.resize(start + HEADER_SIZE, 0);
    }

    fn decode(data: &[u8]) -> Result<Self, SegmentError> {
        if data.len() < HEADER_SIZE {
            return Err(SegmentError::Truncated("header"));
        }
        if data[0..4] != SEGMENT_MAGIC {
            return Err(SegmentError::InvalidMagic);
        }
        let header = SegmentHeader {
            version: data[4],
            flags: data[5],
            record_count: read_u32(data, 6),
            min_sequence: read_u64(data, 10),
            max_sequence: read_u64(data, 18),
        };
        if header.version != SEGMENT_VERSION {
            return Err(SegmentError::UnsupportedVersion(header.version));
        }
        let stored = read_u32(data, 26);
        let expected = header.checksum();
        if stored != expected {
            return Err(SegmentError::ChecksumMismatch {
                expected,
                actual: stored,
            });
        }
        Ok(header)
    }
}

/// Accumulates records and produces segment bytes.
#[derive(Debug, Default)]
pub struct SegmentWriter {
    body: Vec<u8>,
    record_count: u32,
    min_sequence: u64,
    max_sequence: u64,
}

impl SegmentWriter {
    pub fn new() -> Self {
        SegmentWriter {
            body: Vec::new(),
            record_count: 0,
            min_sequence: u64::MAX,
            max_sequence: 0,
        }
    }

    pub fn write_record(&mut self, record: &Record) -> Result<(), SegmentError> {
        let data = bincode::serialize(record)?;
        self.body.extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.body.extend_from_slice(&data);
        self.record_count += 1;
        self.min_sequence = self.min_sequence.min(record.sequence);
        self.max_sequence = self.max_sequence.max(record.sequence);
        Ok(())
    }

    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    pub fn estimated_size(&self) -> usize {
        HEADER_SIZE + self.body.len() + FOOTER_SIZE
    }

    pub fn finish(self) -> Result<Vec<u8>, SegmentError> {
        if self.is_empty() {
            return Err(SegmentError::Empty);
        }
        let header = SegmentHeader {
            version: SEGMENT_VERSION,
            flags: 0,
            record_count: self.record_count,
            min_sequence: self.min_sequence,
            max_sequence: self.max_sequence,
        };
        let mut out = Vec::with_capacity(self.estimated_size());
        header.encode(&mut out);
        out.extend_from_slice(&self.body);
        out.extend_from_slice(&crc32fast::hash(&self.body).to_le_bytes());
        out.extend_from_slice(&(self.body.len() as u64).to_le_bytes());
        out.extend_from_slice(&FOOTER_MAGIC);
        Ok(out)
    }
}

/// Validates and decodes segment bytes.
#[derive(Debug)]
pub struct SegmentReader<'a> {
    header: SegmentHeader,
    body: &'a [u8],
}

impl<'a> SegmentReader<'a> {
    pub fn open(data: &'a [u8]) -> Result<Self, SegmentError> {
        let header = SegmentHeader::decode(data)?;
        if data.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(SegmentError::Truncated("footer"));
        }
        let footer = &data[data.len() - FOOTER_SIZE..];
        if footer[12..16] != FOOTER_MAGIC {
            return Err(SegmentError::InvalidMagic);
        }
        let body = &data[HEADER_SIZE..data.len() - FOOTER_SIZE];
        if read_u64(footer, 4) != body.len() as u64 {
            return Err(SegmentError::Truncated("records"));
        }
        let expected = read_u32(footer, 0);
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(SegmentError::ChecksumMismatch { expected, actual });
        }
        Ok(SegmentReader { header, body })
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub fn records(&self) -> Result<Vec<Record>, SegmentError> {
        let mut records = Vec::with_capacity(self.header.record_count as usize);
        let mut pos = 0;
        while pos < self.body.len() {
            if pos + 4 > self.body.len() {
                return Err(SegmentError::Truncated("record length"));
            }
            let len = read_u32(self.body, pos) as usize;
            pos += 4;
            if pos + len > self.body.len() {
                return Err(SegmentError::Truncated("record"));
            }
            records.push(bincode::deserialize(&self.body[pos..pos + len])?);
            pos += len;
        }
        if records.len() != self.header.record_count as usize {
            return Err(SegmentError::Serialization(format!(
                "header says {} records, found {}",
                self.header.record_count,
                records.len()
            )));
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: u64) -> Record {
        Record {
            epoch: 3,
            sequence: seq,
            key: format!("key{}", seq).into_bytes(),
            value: format!("value{}", seq).into_bytes(),
        }
    }

    fn encode(records: &[Record]) -> Vec<u8> {
        let mut writer = SegmentWriter::new();
        for r in records {
            writer.write_record(r).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn test_write_and_read() {
        let records: Vec<_> = (5..15).map(record).collect();
        let bytes = encode(&records);

        let reader = SegmentReader::open(&bytes).unwrap();
        assert_eq!(reader.header().record_count, 10);
        assert_eq!(reader.header().min_sequence, 5);
        assert_eq!(reader.header().max_sequence, 14);
        assert_eq!(reader.records().unwrap(), records);
    }

    #[test]
    fn test_empty_segment_rejected() {
        assert!(matches!(SegmentWriter::new().finish(), Err(SegmentError::Empty)));
    }

    #[test]
    fn test_corrupted_body_detected() {
        let mut bytes = encode(&[record(1), record(2)]);
        bytes[HEADER_SIZE + 6] ^= 0xFF;
        assert!(matches!(
            SegmentReader::open(&bytes),
            Err(SegmentError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_corrupted_header_detected() {
        let mut bytes = encode(&[record(1)]);
        bytes[8] ^= 0x01;
        assert!(matches!(
            SegmentReader::open(&bytes),
            Err(SegmentError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_segment() {
        let bytes = encode(&[record(1), record(2)]);
        let truncated = &bytes[..bytes.len() - 3];
        assert!(SegmentReader::open(truncated).is_err());
        assert!(SegmentReader::open(&bytes[..10]).is_err());
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = encode(&[record(1)]);
        bytes[0] = b'X';
        assert!(matches!(
            SegmentReader::open(&bytes),
            Err(SegmentError::InvalidMagic)
        ));
    }
}
