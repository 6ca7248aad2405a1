//! The frame format shared by diagnostic reads and firmware programming.
//!
//! ```text
//! [START][command][addr hi][addr lo][len][payload .. len][checksum][END]
//! ```
//!
//! The checksum covers `command` through the last payload byte. Whether it is an additive or XOR
//! checksum is decided by the register map of the pack being talked to.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};

/// Start of frame marker.
pub const START: u8 = 0xA5;
/// End of frame marker.
pub const END: u8 = 0x5A;
/// Bytes before the payload: start, command, two address bytes and the length.
pub const HEADER_LEN: usize = 5;
/// Every frame is this many bytes plus its payload.
pub const OVERHEAD: usize = HEADER_LEN + 2;
pub const MAX_PAYLOAD: usize = u8::MAX as usize;
pub const MAX_FRAME: usize = MAX_PAYLOAD + OVERHEAD;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumKind {
    /// Wrapping sum of the covered bytes.
    #[default]
    Additive,
    /// XOR of the covered bytes.
    Xor,
}

impl ChecksumKind {
    pub fn compute(self, bytes: &[u8]) -> u8 {
        match self {
            ChecksumKind::Additive => bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)),
            ChecksumKind::Xor => bytes.iter().fold(0u8, |acc, b| acc ^ b),
        }
    }
}

/// Why an inbound frame was not accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Well formed, but the checksum does not match. Retried like a missing response.
    Checksum { expected: u8, actual: u8 },
    /// Structurally wrong. Not retried.
    Malformed(ProtocolError),
}

impl From<ProtocolError> for FrameError {
    fn from(err: ProtocolError) -> Self {
        FrameError::Malformed(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub address: u16,
    pub payload: heapless::Vec<u8, MAX_PAYLOAD>,
}

impl Frame {
    pub fn new(command: u8, address: u16, payload: &[u8]) -> Result<Self, ProtocolError> {
        let payload = heapless::Vec::from_slice(payload)
            .map_err(|_| ProtocolError::PayloadTooLarge(payload.len()))?;
        Ok(Self {
            command,
            address,
            payload,
        })
    }

    /// Total number of bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        self.payload.len() + OVERHEAD
    }

    /// Serialise into `out`, replacing anything already there.
    pub fn encode<const L: usize>(
        &self,
        checksum: ChecksumKind,
        out: &mut heapless::Vec<u8, L>,
    ) -> Result<(), ProtocolError> {
        out.clear();
        let [addr_hi, addr_lo] = self.address.to_be_bytes();
        let header = [START, self.command, addr_hi, addr_lo, self.payload.len() as u8];
        out.extend_from_slice(&header)
            .map_err(|_| ProtocolError::BufferTooSmall)?;
        out.extend_from_slice(&self.payload)
            .map_err(|_| ProtocolError::BufferTooSmall)?;
        let sum = checksum.compute(&out[1..]);
        out.extend_from_slice(&[sum, END])
            .map_err(|_| ProtocolError::BufferTooSmall)?;
        Ok(())
    }

    /// Once the header has arrived, the full length of the frame it starts.
    pub fn expected_len(header: &[u8]) -> Option<usize> {
        header.get(4).map(|len| *len as usize + OVERHEAD)
    }

    /// Parse exactly one frame.
    ///
    /// Structure is checked before the checksum so a garbled frame is never mistaken for a
    /// merely corrupted one.
    pub fn decode(bytes: &[u8], checksum: ChecksumKind) -> Result<Self, FrameError> {
        match bytes.first() {
            Some(&START) => {}
            Some(&other) => return Err(ProtocolError::BadStartMarker(other).into()),
            None => {
                return Err(ProtocolError::LengthMismatch {
                    declared: 0,
                    actual: 0,
                }
                .into());
            }
        }
        let declared = bytes.get(4).map(|len| *len as usize).unwrap_or(0);
        if bytes.len() < OVERHEAD || bytes.len() != declared + OVERHEAD {
            return Err(ProtocolError::LengthMismatch {
                declared,
                actual: bytes.len(),
            }
            .into());
        }
        let end = bytes[bytes.len() - 1];
        if end != END {
            return Err(ProtocolError::BadEndMarker(end).into());
        }

        let body = &bytes[1..HEADER_LEN + declared];
        let expected = checksum.compute(body);
        let actual = bytes[HEADER_LEN + declared];
        if expected != actual {
            return Err(FrameError::Checksum { expected, actual });
        }

        Ok(Self::new(
            bytes[1],
            u16::from_be_bytes([bytes[2], bytes[3]]),
            &bytes[HEADER_LEN..HEADER_LEN + declared],
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(frame: &Frame, checksum: ChecksumKind) -> heapless::Vec<u8, MAX_FRAME> {
        let mut out = heapless::Vec::new();
        frame.encode(checksum, &mut out).unwrap();
        out
    }

    #[test]
    fn encode_read_request() {
        let frame = Frame::new(0x01, 0x000C, &[0x02]).unwrap();
        let bytes = encoded(&frame, ChecksumKind::Additive);
        // 0x01 + 0x00 + 0x0C + 0x01 + 0x02 = 0x10
        assert_eq!(bytes.as_slice(), &[0xA5, 0x01, 0x00, 0x0C, 0x01, 0x02, 0x10, 0x5A]);
        assert_eq!(frame.wire_len(), bytes.len());
    }

    #[test]
    fn xor_checksum() {
        let frame = Frame::new(0x81, 0x0021, &[0x0E, 0xA6]).unwrap();
        let bytes = encoded(&frame, ChecksumKind::Xor);
        let expected: u8 = 0x81 ^ 0x00 ^ 0x21 ^ 0x02 ^ 0x0E ^ 0xA6;
        assert_eq!(bytes[7], expected);
        assert_eq!(Frame::decode(&bytes, ChecksumKind::Xor), Ok(frame));
    }

    #[test]
    fn decode_detects_checksum_mismatch() {
        let frame = Frame::new(0x81, 0x0010, &[0x12, 0x34]).unwrap();
        let mut bytes = encoded(&frame, ChecksumKind::Additive);
        bytes[5] ^= 0xFF;
        assert!(matches!(
            Frame::decode(&bytes, ChecksumKind::Additive),
            Err(FrameError::Checksum { .. })
        ));
    }

    #[test]
    fn decode_rejects_bad_markers() {
        let frame = Frame::new(0x81, 0x0010, &[0x01]).unwrap();
        let mut bytes = encoded(&frame, ChecksumKind::Additive);
        bytes[0] = 0x00;
        assert_eq!(
            Frame::decode(&bytes, ChecksumKind::Additive),
            Err(FrameError::Malformed(ProtocolError::BadStartMarker(0x00)))
        );

        let mut bytes = encoded(&frame, ChecksumKind::Additive);
        let last = bytes.len() - 1;
        bytes[last] = 0xEE;
        assert_eq!(
            Frame::decode(&bytes, ChecksumKind::Additive),
            Err(FrameError::Malformed(ProtocolError::BadEndMarker(0xEE)))
        );
    }

    #[test]
    fn decode_rejects_truncated_frame() {
        let frame = Frame::new(0x81, 0x0010, &[0x01, 0x02, 0x03]).unwrap();
        let bytes = encoded(&frame, ChecksumKind::Additive);
        let result = Frame::decode(&bytes[..bytes.len() - 2], ChecksumKind::Additive);
        assert!(matches!(
            result,
            Err(FrameError::Malformed(ProtocolError::LengthMismatch { declared: 3, .. }))
        ));
    }

    #[test]
    fn expected_len_needs_header() {
        assert_eq!(Frame::expected_len(&[START, 0x81, 0x00]), None);
        assert_eq!(Frame::expected_len(&[START, 0x81, 0x00, 0x10, 0x04]), Some(11));
    }

    #[test]
    fn encode_into_small_buffer_fails() {
        let frame = Frame::new(0x40, 0x0000, &[0xFF; 16]).unwrap();
        let mut out: heapless::Vec<u8, 8> = heapless::Vec::new();
        assert_eq!(
            frame.encode(ChecksumKind::Additive, &mut out),
            Err(ProtocolError::BufferTooSmall)
        );
    }
}
