//! Firmware programming for pack MCUs, over the same frame codec as diagnostics.
//!
//! The run goes `Connect -> Erase -> Program -> Verify -> Complete`, and can end in `Aborted` from
//! any step. Every block is read back and compared straight after it is written, and written
//! again (up to the configured attempts) on a mismatch. Once everything is written, a final pass
//! asks the device to verify each block.
//!
//! Requests carry the block index in the frame address field. Payloads are:
//! * Program: `[address: u32 BE][data..]`
//! * Read back: `[address: u32 BE][length]`, answered with `[status][data..]`
//! * Verify: `[address: u32 BE][data..]`, answered with `[status]`
//!
//! Every other answer is just `[status]`.

use crate::{
    error::{DeviceStatus, ExchangeError, FlashError, ImageError, ProtocolError},
    firmware::{FirmwareImage, FlashBlock, ImageState, VerifiedImage},
    frame::{ChecksumKind, Frame, MAX_FRAME, MAX_PAYLOAD},
    link::{Link, RetryPolicy, expect_reply},
    transport::Transport,
    worker::CancelToken,
};
use embedded_io::Error as _;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

/// Boot loader commands. Responses echo the command with the top bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
#[repr(u8)]
pub enum FlashCommand {
    /// Also serves as the connect handshake.
    Reset = 0x00,
    Verify = 0x13,
    ChipErase = 0x20,
    BlankCheck = 0x32,
    Program = 0x40,
    ReadBack = 0x50,
}

impl FlashCommand {
    pub fn reply(self) -> u8 {
        self as u8 | 0x80
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashState {
    Connect,
    Erase,
    Program,
    Verify,
    Complete,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    /// Not attempted.
    Pending,
    /// Written, read back not yet confirmed.
    Written,
    Verified,
    Failed,
}

/// What the caller should assume about the device after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCondition {
    /// Nothing was erased or written.
    Unchanged,
    /// Erased or partially written. The device needs flashing again before it is usable.
    Indeterminate,
    Programmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockReport {
    pub index: usize,
    pub address: u32,
    pub status: BlockStatus,
    /// Write attempts made.
    pub attempts: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlashResult {
    /// `Complete`, or `Aborted` with the step it was in recorded in `aborted_in`.
    pub state: FlashState,
    pub aborted_in: Option<FlashState>,
    pub blocks: Vec<BlockReport>,
    pub error: Option<FlashError>,
    pub device: DeviceCondition,
    pub image_state: ImageState,
}

impl FlashResult {
    pub fn is_complete(&self) -> bool {
        self.state == FlashState::Complete
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashSettings {
    /// Bytes per programming block, at most [FlashSettings::MAX_BLOCK_SIZE].
    pub block_size: usize,
    /// Write + read back attempts per block.
    pub max_block_attempts: u8,
    pub checksum: ChecksumKind,
}

impl FlashSettings {
    /// Largest block which fits in a frame next to its address.
    pub const MAX_BLOCK_SIZE: usize = 250;
}

impl Default for FlashSettings {
    fn default() -> Self {
        Self {
            block_size: 128,
            max_block_attempts: 3,
            checksum: ChecksumKind::Additive,
        }
    }
}

/// Drives one device through a flash run. Owns the port.
pub struct Flasher<S: Transport, const L: usize = MAX_FRAME> {
    link: Link<S, L>,
    settings: FlashSettings,
    cancel: CancelToken,
}

struct Run {
    state: FlashState,
    blocks: Vec<BlockReport>,
    erased: bool,
}

impl Run {
    fn abort(self, error: FlashError, image: &VerifiedImage) -> FlashResult {
        tracing::error!(state = ?self.state, %error, "firmware flash aborted");
        FlashResult {
            state: FlashState::Aborted,
            aborted_in: Some(self.state),
            blocks: self.blocks,
            error: Some(error),
            device: if self.erased {
                DeviceCondition::Indeterminate
            } else {
                DeviceCondition::Unchanged
            },
            image_state: image.state(),
        }
    }
}

impl<S: Transport, const L: usize> Flasher<S, L> {
    pub fn new(
        interface: S,
        settings: FlashSettings,
        policy: RetryPolicy,
    ) -> crate::error::Result<Self, S::Error> {
        if settings.block_size == 0 || settings.block_size > FlashSettings::MAX_BLOCK_SIZE {
            return Err(crate::error::ConfigError::InvalidValue {
                field: "block_size",
                reason: "must be between 1 and 250",
            }
            .into());
        }
        let link = Link::new(interface, settings.checksum, policy)?;
        Ok(Self {
            link,
            settings,
            cancel: CancelToken::new(),
        })
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn interface(&self) -> &S {
        self.link.interface()
    }

    pub fn into_inner(self) -> S {
        self.link.into_inner()
    }

    /// Parse, verify and flash a HEX source. A bad image is rejected before the port is touched.
    pub fn flash_hex(&mut self, source: &str) -> Result<FlashResult, ImageError> {
        let image = FirmwareImage::parse(source)?.verify()?;
        Ok(self.flash(image))
    }

    pub fn flash(&mut self, mut image: VerifiedImage) -> FlashResult {
        let blocks = image.blocks(self.settings.block_size);
        let mut run = Run {
            state: FlashState::Connect,
            blocks: blocks
                .iter()
                .map(|b| BlockReport {
                    index: b.index,
                    address: b.address,
                    status: BlockStatus::Pending,
                    attempts: 0,
                })
                .collect(),
            erased: false,
        };
        tracing::info!(blocks = blocks.len(), block_size = self.settings.block_size, "starting firmware flash");

        if let Err(err) = self.expect_ack(FlashCommand::Reset, 0, &[]).map_err(|e| match e {
            FlashError::Rejected { status, .. } => FlashError::Handshake(status),
            other => other,
        }) {
            return run.abort(err, &image);
        }

        run.state = FlashState::Erase;
        run.erased = true;
        if let Err(err) = self.expect_ack(FlashCommand::ChipErase, 0, &[]).map_err(|e| match e {
            FlashError::Rejected { status, .. } => FlashError::Erase(status),
            other => other,
        }) {
            return run.abort(err, &image);
        }

        run.state = FlashState::Program;
        for block in &blocks {
            if self.cancel.is_cancelled() {
                return run.abort(FlashError::Cancelled, &image);
            }
            if let Err(err) = self.program_block(block, &mut run.blocks[block.index]) {
                return run.abort(err, &image);
            }
        }
        image.mark_written();

        run.state = FlashState::Verify;
        for block in &blocks {
            if self.cancel.is_cancelled() {
                return run.abort(FlashError::Cancelled, &image);
            }
            let payload = addressed(block.address, &block.data);
            let result = self.expect_ack(FlashCommand::Verify, block.index, &payload);
            match result {
                Ok(()) => {}
                Err(FlashError::Rejected { block: index, .. }) => {
                    run.blocks[block.index].status = BlockStatus::Failed;
                    return run.abort(FlashError::FinalVerify { block: index }, &image);
                }
                Err(err) => return run.abort(err, &image),
            }
        }
        image.mark_post_write_verified();

        tracing::info!(blocks = blocks.len(), "firmware flash complete");
        FlashResult {
            state: FlashState::Complete,
            aborted_in: None,
            blocks: run.blocks,
            error: None,
            device: DeviceCondition::Programmed,
            image_state: image.state(),
        }
    }

    /// Write a block and read it back until they match or attempts run out.
    fn program_block(&mut self, block: &FlashBlock, report: &mut BlockReport) -> Result<(), FlashError> {
        let write = addressed(block.address, &block.data);
        let read = addressed(block.address, &[block.data.len() as u8]);

        for attempt in 1..=self.settings.max_block_attempts.max(1) {
            report.attempts = attempt;
            if let Err(err) = self.expect_ack(FlashCommand::Program, block.index, &write) {
                report.status = BlockStatus::Failed;
                return Err(err);
            }
            report.status = BlockStatus::Written;

            let response = match self.command(FlashCommand::ReadBack, block.index, &read) {
                Ok(response) => response,
                Err(err) => {
                    report.status = BlockStatus::Failed;
                    return Err(err);
                }
            };
            if response.get(1..) == Some(block.data.as_slice()) {
                report.status = BlockStatus::Verified;
                tracing::debug!(block = block.index, attempt, "block verified");
                return Ok(());
            }
            tracing::warn!(block = block.index, attempt, "read back does not match written block");
        }

        report.status = BlockStatus::Failed;
        Err(FlashError::VerifyMismatch {
            block: block.index,
            attempts: report.attempts,
        })
    }

    /// Send a command which must be answered with a bare ACK.
    fn expect_ack(&mut self, command: FlashCommand, block: usize, payload: &[u8]) -> Result<(), FlashError> {
        self.command(command, block, payload).map(|_| ())
    }

    /// Send a command and return the response payload once its status is ACK.
    fn command(&mut self, command: FlashCommand, block: usize, payload: &[u8]) -> Result<Vec<u8>, FlashError> {
        let address = u16::try_from(block).map_err(|_| FlashError::BlockIndex { block })?;
        let request = Frame::new(command as u8, address, payload)?;
        let exchange = self.link.send_request(&request);
        let response = match exchange.result {
            Ok(response) => response,
            Err(ExchangeError::Transport(err)) => return Err(FlashError::Transport { kind: err.kind() }),
            Err(ExchangeError::Communication(err)) => return Err(err.into()),
            Err(ExchangeError::Protocol(err)) => return Err(err.into()),
        };
        expect_reply(&response, command.reply(), address)?;

        let status = response.payload.first().ok_or(ProtocolError::EmptyPayload)?;
        match DeviceStatus::try_from(*status) {
            Ok(DeviceStatus::Ack) => Ok(response.payload.to_vec()),
            Ok(status) => {
                tracing::warn!(%command, block, %status, "device refused command");
                Err(FlashError::Rejected { block, status })
            }
            Err(unknown) => Err(FlashError::UnknownStatus(unknown)),
        }
    }
}

fn addressed(address: u32, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + data.len());
    payload.extend_from_slice(&address.to_be_bytes());
    payload.extend_from_slice(data);
    debug_assert!(payload.len() <= MAX_PAYLOAD);
    payload
}
