//! Our error types for pack diagnostics.
//!
//! [Error] is what transport-touching calls return. The other enums are the concerns it wraps, and
//! they are kept non-generic so they can be stored in sessions and flash results.

use serde::{Serialize, Serializer};
use thiserror::Error;

pub type Result<T, I> = core::result::Result<T, Error<I>>;

/// Top level error for anything which talks to a pack over a [Transport](crate::transport::Transport).
#[derive(Error, Debug)]
pub enum Error<I: embedded_io::Error> {
    /// The port itself failed (closed, unplugged). Never retried.
    #[error("Serial communication error")]
    SerialError(I),
    #[error(transparent)]
    Communication(#[from] CommunicationError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Flash(#[from] FlashError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl<I: embedded_io::Error> Error<I> {
    /// True when the error means the port can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::SerialError(_))
    }
}

/// How a single request/response exchange failed.
#[derive(Error, Debug)]
pub enum ExchangeError<I: embedded_io::Error> {
    #[error("Serial communication error")]
    Transport(I),
    #[error(transparent)]
    Communication(#[from] CommunicationError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl<I: embedded_io::Error> ExchangeError<I> {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExchangeError::Transport(_))
    }
}

impl<I: embedded_io::Error> From<ExchangeError<I>> for Error<I> {
    fn from(err: ExchangeError<I>) -> Self {
        match err {
            ExchangeError::Transport(e) => Error::SerialError(e),
            ExchangeError::Communication(e) => Error::Communication(e),
            ExchangeError::Protocol(e) => Error::Protocol(e),
        }
    }
}

/// A request could not be completed after all attempts.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationError {
    #[error("No response after {attempts} attempts ({timeout_ms} ms timeout)")]
    Timeout { attempts: u8, timeout_ms: u32 },
    #[error("Checksum failure after {attempts} attempts")]
    ChecksumFailure { attempts: u8 },
}

/// The device answered with something structurally wrong.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolError {
    #[error("Bad start marker 0x{0:02X}")]
    BadStartMarker(u8),
    #[error("Bad end marker 0x{0:02X}")]
    BadEndMarker(u8),
    #[error("Frame declares {declared} payload bytes but {actual} frame bytes were received")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("Payload of {0} bytes does not fit in a frame")]
    PayloadTooLarge(usize),
    #[error("Frame buffer too small")]
    BufferTooSmall,
    #[error("Expected command 0x{expected:02X}, got 0x{actual:02X}")]
    UnexpectedCommand { expected: u8, actual: u8 },
    #[error("Expected address 0x{expected:04X}, got 0x{actual:04X}")]
    UnexpectedAddress { expected: u16, actual: u16 },
    #[error("Empty payload")]
    EmptyPayload,
}

/// Raw bytes could not be turned into a value. Recorded against the register, never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeError {
    #[error("Register declares {expected} bytes but {actual} were read")]
    WidthMismatch { expected: u8, actual: usize },
    #[error("Register text is not ASCII")]
    InvalidText,
}

/// Status codes reported by the MCU boot loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display, strum_macros::EnumIter)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DeviceStatus {
    Ack = 0x06,
    Nack = 0x15,
    CommandError = 0x04,
    ParameterError = 0x05,
    ChecksumError = 0x07,
    VerifyError = 0x0F,
    ProtectError = 0x10,
    WriteError = 0x1C,
    ReadError = 0x20,
    Busy = 0xFF,
}

impl TryFrom<u8> for DeviceStatus {
    type Error = u8;

    fn try_from(value: u8) -> core::result::Result<Self, Self::Error> {
        match value {
            0x06 => Ok(DeviceStatus::Ack),
            0x15 => Ok(DeviceStatus::Nack),
            0x04 => Ok(DeviceStatus::CommandError),
            0x05 => Ok(DeviceStatus::ParameterError),
            0x07 => Ok(DeviceStatus::ChecksumError),
            0x0F => Ok(DeviceStatus::VerifyError),
            0x10 => Ok(DeviceStatus::ProtectError),
            0x1C => Ok(DeviceStatus::WriteError),
            0x20 => Ok(DeviceStatus::ReadError),
            0xFF => Ok(DeviceStatus::Busy),
            other => Err(other),
        }
    }
}

/// Firmware programming was aborted.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashError {
    #[error("Device did not acknowledge the handshake: {0}")]
    Handshake(DeviceStatus),
    #[error("Erase failed: {0}")]
    Erase(DeviceStatus),
    #[error("Device rejected block {block}: {status}")]
    Rejected { block: usize, status: DeviceStatus },
    #[error("Unknown device status 0x{0:02X}")]
    UnknownStatus(u8),
    #[error("Block {block} read back differently after {attempts} attempts")]
    VerifyMismatch { block: usize, attempts: u8 },
    #[error("Block {block} failed the final verification pass")]
    FinalVerify { block: usize },
    #[error("Block {block} does not fit the 16 bit frame address")]
    BlockIndex { block: usize },
    #[error(transparent)]
    Communication(#[from] CommunicationError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Serial port failed ({kind:?})")]
    Transport {
        #[serde(serialize_with = "serialize_kind")]
        kind: embedded_io::ErrorKind,
    },
    #[error("Cancelled")]
    Cancelled,
}

/// Intel HEX images are rejected whole, before any device I/O.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageError {
    #[error("Line {line}: missing ':' start code")]
    MissingStartCode { line: usize },
    #[error("Line {line}: invalid hex digits")]
    InvalidHex { line: usize },
    #[error("Line {line}: record length does not match its byte count")]
    LengthMismatch { line: usize },
    #[error("Line {line}: checksum 0x{actual:02X} should be 0x{expected:02X}")]
    Checksum { line: usize, expected: u8, actual: u8 },
    #[error("Line {line}: unsupported record type 0x{record_type:02X}")]
    UnsupportedRecord { line: usize, record_type: u8 },
    #[error("Line {line}: malformed address record")]
    BadAddressRecord { line: usize },
    #[error("Line {line}: data after end-of-file record")]
    DataAfterEof { line: usize },
    #[error("Missing end-of-file record")]
    MissingEof,
    #[error("Data overlaps at address 0x{address:08X}")]
    Overlap { address: u32 },
    #[error("Image contains no data")]
    Empty,
}

/// Invalid register maps or settings, detected before any I/O.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Duplicate register address 0x{0:04X}")]
    DuplicateAddress(u16),
    #[error("Register 0x{address:04X} has unsupported width {width}")]
    InvalidWidth { address: u16, width: u8 },
    #[error("Register 0x{address:04X} has a non-finite scale or offset")]
    InvalidScale { address: u16 },
    #[error("Register 0x{address:04X} flag bit {bit} is outside its width")]
    FlagOutOfRange { address: u16, bit: u8 },
    #[error("Register 0x{address:04X} has an empty plausibility range")]
    InvalidRange { address: u16 },
    #[error("Register map has no registers")]
    EmptyMap,
    #[error("Scoring weights sum to {0}, expected 1.0")]
    WeightSum(f64),
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: &'static str },
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// A background worker could not deliver its result.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Worker exited without a result")]
    Disconnected,
}

/// Why a sealed session did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The port failed mid-sweep.
    Transport {
        #[serde(serialize_with = "serialize_kind")]
        kind: embedded_io::ErrorKind,
    },
    Cancelled,
}

impl core::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FailureReason::Transport { kind } => write!(f, "transport failure ({kind:?})"),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

fn serialize_kind<S: Serializer>(
    kind: &embedded_io::ErrorKind,
    serializer: S,
) -> core::result::Result<S::Ok, S::Error> {
    serializer.collect_str(&format_args!("{kind:?}"))
}
