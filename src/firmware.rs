//! Firmware images in Intel HEX format.
//!
//! An image goes `Parsed -> PreWriteVerified -> Written -> PostWriteVerified`. Only a
//! [VerifiedImage] can be handed to the [Flasher](crate::flash::Flasher), so nothing is ever
//! written from an image that has not passed its pre-write checks.

use crate::error::ImageError;
use serde::Serialize;
use std::collections::BTreeMap;

/// Record types understood by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Data = 0x00,
    EndOfFile = 0x01,
    ExtendedSegmentAddress = 0x02,
    StartSegmentAddress = 0x03,
    ExtendedLinearAddress = 0x04,
    StartLinearAddress = 0x05,
}

impl TryFrom<u8> for RecordType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(RecordType::Data),
            0x01 => Ok(RecordType::EndOfFile),
            0x02 => Ok(RecordType::ExtendedSegmentAddress),
            0x03 => Ok(RecordType::StartSegmentAddress),
            0x04 => Ok(RecordType::ExtendedLinearAddress),
            0x05 => Ok(RecordType::StartLinearAddress),
            other => Err(other),
        }
    }
}

/// One line of a HEX file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    /// 1 based line number in the source.
    pub line: usize,
    pub record_type: RecordType,
    pub address: u16,
    pub data: Vec<u8>,
    pub checksum: u8,
    pub checksum_valid: bool,
}

/// Two's complement of the sum of every byte before the checksum.
pub fn record_checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
        .wrapping_neg()
}

/// Parse one `:LLAAAATT<data>CC` line. The checksum is checked but not enforced here.
pub fn parse_record(line_number: usize, line: &str) -> Result<HexRecord, ImageError> {
    let line = line.trim();
    let body = line
        .strip_prefix(':')
        .ok_or(ImageError::MissingStartCode { line: line_number })?;
    if body.len() % 2 != 0 || !body.is_ascii() {
        return Err(ImageError::InvalidHex { line: line_number });
    }
    let bytes = (0..body.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&body[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|_| ImageError::InvalidHex { line: line_number })?;

    // Length, two address bytes, type and checksum.
    if bytes.len() < 5 || bytes.len() != bytes[0] as usize + 5 {
        return Err(ImageError::LengthMismatch { line: line_number });
    }
    let record_type = RecordType::try_from(bytes[3]).map_err(|record_type| ImageError::UnsupportedRecord {
        line: line_number,
        record_type,
    })?;
    let (content, checksum) = bytes.split_at(bytes.len() - 1);
    let checksum = checksum[0];

    Ok(HexRecord {
        line: line_number,
        record_type,
        address: u16::from_be_bytes([bytes[1], bytes[2]]),
        data: content[4..].to_vec(),
        checksum,
        checksum_valid: record_checksum(content) == checksum,
    })
}

/// A run of data at an absolute address, as it appeared in one data record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageSegment {
    /// Source line of the data record.
    pub line: usize,
    pub address: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageState {
    Parsed,
    PreWriteVerified,
    Written,
    PostWriteVerified,
}

/// A parsed image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    segments: Vec<ImageSegment>,
    state: ImageState,
}

impl FirmwareImage {
    /// Parse a whole HEX file.
    ///
    /// Any record with a bad checksum rejects the whole image.
    pub fn parse(source: &str) -> Result<Self, ImageError> {
        let mut segments = Vec::new();
        let mut upper: u32 = 0;
        let mut seen_eof = false;

        for (index, line) in source.lines().enumerate() {
            let line_number = index + 1;
            if line.trim().is_empty() {
                continue;
            }
            if seen_eof {
                return Err(ImageError::DataAfterEof { line: line_number });
            }
            let record = parse_record(line_number, line)?;
            if !record.checksum_valid {
                tracing::warn!(line = line_number, "firmware record checksum mismatch, rejecting image");
                let content_sum = record_checksum(&record_bytes(&record));
                return Err(ImageError::Checksum {
                    line: line_number,
                    expected: content_sum,
                    actual: record.checksum,
                });
            }

            match record.record_type {
                RecordType::Data => segments.push(ImageSegment {
                    line: record.line,
                    address: upper + record.address as u32,
                    data: record.data,
                }),
                RecordType::EndOfFile => seen_eof = true,
                RecordType::ExtendedSegmentAddress => {
                    upper = address_word(&record)? << 4;
                }
                RecordType::ExtendedLinearAddress => {
                    upper = address_word(&record)? << 16;
                }
                RecordType::StartSegmentAddress | RecordType::StartLinearAddress => {}
            }
        }

        if !seen_eof {
            return Err(ImageError::MissingEof);
        }
        tracing::debug!(segments = segments.len(), "parsed firmware image");
        Ok(Self {
            segments,
            state: ImageState::Parsed,
        })
    }

    pub fn segments(&self) -> &[ImageSegment] {
        &self.segments
    }

    pub fn state(&self) -> ImageState {
        self.state
    }

    /// Total data bytes.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.data.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pre-write verification: some data, and no two records writing the same address.
    ///
    /// Record checksums were already enforced by [FirmwareImage::parse].
    pub fn verify(self) -> Result<VerifiedImage, ImageError> {
        if self.is_empty() {
            return Err(ImageError::Empty);
        }
        let mut memory = BTreeMap::new();
        for segment in &self.segments {
            for (offset, byte) in segment.data.iter().enumerate() {
                let address = segment.address.wrapping_add(offset as u32);
                if memory.insert(address, *byte).is_some() {
                    return Err(ImageError::Overlap { address });
                }
            }
        }
        Ok(VerifiedImage {
            memory,
            state: ImageState::PreWriteVerified,
        })
    }
}

fn record_bytes(record: &HexRecord) -> Vec<u8> {
    let [hi, lo] = record.address.to_be_bytes();
    let mut bytes = vec![record.data.len() as u8, hi, lo, record.record_type as u8];
    bytes.extend_from_slice(&record.data);
    bytes
}

fn address_word(record: &HexRecord) -> Result<u32, ImageError> {
    match record.data.as_slice() {
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo]) as u32),
        _ => Err(ImageError::BadAddressRecord { line: record.line }),
    }
}

/// One fixed size unit of programming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashBlock {
    pub index: usize,
    pub address: u32,
    /// Always the full block size, gaps padded with `0xFF`.
    pub data: Vec<u8>,
}

/// An image which has passed pre-write verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedImage {
    memory: BTreeMap<u32, u8>,
    state: ImageState,
}

impl VerifiedImage {
    pub const PAD: u8 = 0xFF;

    pub fn state(&self) -> ImageState {
        self.state
    }

    pub(crate) fn mark_written(&mut self) {
        self.state = ImageState::Written;
    }

    pub(crate) fn mark_post_write_verified(&mut self) {
        self.state = ImageState::PostWriteVerified;
    }

    /// Lowest and highest address holding data.
    pub fn address_range(&self) -> Option<(u32, u32)> {
        let first = self.memory.keys().next()?;
        let last = self.memory.keys().next_back()?;
        Some((*first, *last))
    }

    /// Split into aligned blocks of `block_size` bytes. Blocks with no data are skipped.
    pub fn blocks(&self, block_size: usize) -> Vec<FlashBlock> {
        let size = block_size.max(1) as u32;
        let mut blocks: Vec<FlashBlock> = Vec::new();
        for (&address, &byte) in &self.memory {
            let base = address - address % size;
            if blocks.last().is_none_or(|b| b.address != base) {
                blocks.push(FlashBlock {
                    index: blocks.len(),
                    address: base,
                    data: vec![Self::PAD; size as usize],
                });
            }
            if let Some(block) = blocks.last_mut() {
                block.data[(address - base) as usize] = byte;
            }
        }
        blocks
    }
}
