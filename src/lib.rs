//! This crate provides diagnostics for power-tool battery packs, talking to the pack's onboard
//! microcontroller over a serial link.
//!
//! It reads every register in a manufacturer register map, decodes the raw bytes into typed values,
//! and analyses them into a health score, a discharge usage histogram and a cell balance report.
//! It can also reprogram the pack MCU from an Intel HEX image.
//!
//! Pack families with built-in register maps:
//! * Milwaukee M18
//! * Makita LXT
//!
//! Other packs can be described by a [RegisterMap](register::RegisterMap) loaded from TOML.
//!
//! Frames on the wire look like `[0xA5, command, address_hi, address_lo, length, payload.., checksum, 0x5A]`,
//! with an additive or XOR checksum over command to payload depending on the pack family.
//!
//! The serial port used for pack comms should be configured like so:
//! * Default baud rate: 9600
//! * Data bits: 8
//! * Stop bits: 1
//! * Parity: None
//!
//! Enable the `serial` feature for a `serialport` backed [Transport](transport::Transport).

pub mod analysis;
pub mod cells;
pub mod config;
pub mod decoder;
pub mod error;
pub mod firmware;
pub mod flash;
pub mod frame;
pub mod health;
pub mod link;
pub mod register;
pub mod registers;
pub mod session;
pub mod storage;
pub mod transport;
pub mod usage;
pub mod worker;

#[cfg(test)]
mod mock_serial;
