//! Request/response exchange over a [Transport], with retries.
//!
//! One request is outstanding at a time. A response which never arrives, arrives incomplete, or
//! fails its checksum is retried by resending the identical request. Structurally wrong frames are
//! not retried. Unread input is discarded before every write, so a late or partly read reply
//! cannot be taken for the answer to a later request.

use crate::{
    error::{CommunicationError, Error, ExchangeError, ProtocolError},
    frame::{ChecksumKind, Frame, FrameError, HEADER_LEN, MAX_FRAME},
    transport::{Transport, is_transient},
};
use embedded_io::Error as _;
use fugit::MillisDurationU32;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// How hard to try before giving up on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Per attempt read timeout.
    pub timeout: MillisDurationU32,
    /// Total attempts, including the first.
    pub max_attempts: u8,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: MillisDurationU32::millis(2000),
            max_attempts: 3,
        }
    }
}

/// What happened on a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Valid,
    /// Nothing, or only part of a frame, arrived before the timeout.
    NoResponse,
    ChecksumMismatch,
    Malformed,
}

/// One attempt at a request, kept for audit whatever its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// 1 based.
    pub attempt: u8,
    /// Bytes received, possibly empty or partial.
    pub raw: Vec<u8>,
    pub checksum_valid: bool,
    /// Milliseconds since the link was opened, taken when the attempt finished.
    pub elapsed_ms: u64,
    pub outcome: AttemptOutcome,
}

/// Every attempt made for one request and how it ended.
#[derive(Debug)]
pub struct Exchange<I: embedded_io::Error> {
    pub attempts: Vec<AttemptRecord>,
    pub result: Result<Frame, ExchangeError<I>>,
}

enum Received {
    Complete,
    Incomplete,
}

/// Owns the port for its lifetime.
pub struct Link<S: Transport, const L: usize = MAX_FRAME> {
    interface: S,
    checksum: ChecksumKind,
    policy: RetryPolicy,
    opened: Instant,
}

impl<S: Transport, const L: usize> Link<S, L> {
    /// Take ownership of `interface` and apply the policy's timeout to it.
    pub fn new(
        mut interface: S,
        checksum: ChecksumKind,
        policy: RetryPolicy,
    ) -> crate::error::Result<Self, S::Error> {
        interface
            .set_timeout(policy.timeout)
            .map_err(Error::SerialError)?;
        Ok(Self {
            interface,
            checksum,
            policy,
            opened: Instant::now(),
        })
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn checksum(&self) -> ChecksumKind {
        self.checksum
    }

    /// Milliseconds since this link was opened.
    pub fn elapsed_ms(&self) -> u64 {
        self.opened.elapsed().as_millis() as u64
    }

    pub fn interface(&self) -> &S {
        &self.interface
    }

    /// Give the port back.
    pub fn into_inner(self) -> S {
        self.interface
    }

    /// Send `request` and wait for a valid response, retrying as the policy allows.
    ///
    /// Only the frame structure and checksum are checked here. Whether the response is the one
    /// that was asked for is up to the caller, see [expect_reply].
    pub fn send_request(&mut self, request: &Frame) -> Exchange<S::Error> {
        let mut attempts = Vec::new();

        let mut tx: heapless::Vec<u8, L> = heapless::Vec::new();
        if let Err(err) = request.encode(self.checksum, &mut tx) {
            return Exchange {
                attempts,
                result: Err(err.into()),
            };
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_outcome = AttemptOutcome::NoResponse;
        for attempt in 1..=max_attempts {
            tracing::debug!(attempt, tx = ?HexBytes(&tx), "sending request");
            if let Err(err) = self
                .interface
                .discard_input()
                .and_then(|()| self.interface.write_all(&tx))
            {
                attempts.push(self.record(attempt, &[], AttemptOutcome::NoResponse));
                return Exchange {
                    attempts,
                    result: Err(ExchangeError::Transport(err)),
                };
            }

            let mut rx: heapless::Vec<u8, L> = heapless::Vec::new();
            let received = match self.read_response(&mut rx) {
                Ok(received) => received,
                Err(err) => {
                    let outcome = match &err {
                        ExchangeError::Transport(_) => AttemptOutcome::NoResponse,
                        _ => AttemptOutcome::Malformed,
                    };
                    attempts.push(self.record(attempt, &rx, outcome));
                    return Exchange {
                        attempts,
                        result: Err(err),
                    };
                }
            };
            tracing::debug!(attempt, rx = ?HexBytes(&rx), "received response");

            let decoded = match received {
                Received::Complete => Some(Frame::decode(&rx, self.checksum)),
                Received::Incomplete => None,
            };
            let outcome = match &decoded {
                Some(Ok(_)) => AttemptOutcome::Valid,
                Some(Err(FrameError::Checksum { .. })) => AttemptOutcome::ChecksumMismatch,
                Some(Err(FrameError::Malformed(_))) => AttemptOutcome::Malformed,
                None => AttemptOutcome::NoResponse,
            };
            attempts.push(self.record(attempt, &rx, outcome));

            match decoded {
                Some(Ok(frame)) => {
                    return Exchange {
                        attempts,
                        result: Ok(frame),
                    };
                }
                Some(Err(FrameError::Malformed(err))) => {
                    tracing::warn!(attempt, address = request.address, %err, "malformed response");
                    return Exchange {
                        attempts,
                        result: Err(err.into()),
                    };
                }
                Some(Err(FrameError::Checksum { expected, actual })) => {
                    tracing::warn!(attempt, address = request.address, expected, actual, "checksum mismatch");
                }
                None => {
                    tracing::warn!(attempt, address = request.address, "no response");
                }
            }
            last_outcome = outcome;
        }

        let err = match last_outcome {
            AttemptOutcome::ChecksumMismatch => CommunicationError::ChecksumFailure {
                attempts: max_attempts,
            },
            _ => CommunicationError::Timeout {
                attempts: max_attempts,
                timeout_ms: self.policy.timeout.to_millis(),
            },
        };
        Exchange {
            attempts,
            result: Err(err.into()),
        }
    }

    fn record(&self, attempt: u8, raw: &[u8], outcome: AttemptOutcome) -> AttemptRecord {
        AttemptRecord {
            attempt,
            raw: raw.to_vec(),
            checksum_valid: outcome == AttemptOutcome::Valid,
            elapsed_ms: self.elapsed_ms(),
            outcome,
        }
    }

    /// Read one frame into `buff`, reading no further than the frame's declared length.
    fn read_response(
        &mut self,
        buff: &mut heapless::Vec<u8, L>,
    ) -> Result<Received, ExchangeError<S::Error>> {
        let mut temp_buf = [0u8; 16];
        loop {
            let wanted = match Frame::expected_len(buff) {
                Some(total) if buff.len() >= total => return Ok(Received::Complete),
                Some(total) => total - buff.len(),
                None => HEADER_LEN - buff.len(),
            };
            if buff.first().is_some_and(|b| *b != crate::frame::START) {
                // Garbage, hand it over to be rejected as malformed.
                return Ok(Received::Complete);
            }
            let chunk = wanted.min(temp_buf.len());
            match self.interface.read(&mut temp_buf[..chunk]) {
                Ok(0) => return Ok(Received::Incomplete),
                Ok(bytes_read) => {
                    if buff.extend_from_slice(&temp_buf[..bytes_read]).is_err() {
                        return Err(ProtocolError::BufferTooSmall.into());
                    }
                }
                Err(e) if is_transient(e.kind()) => return Ok(Received::Incomplete),
                Err(e) => return Err(ExchangeError::Transport(e)),
            }
        }
    }
}

/// Check a response answers the request it was paired with.
pub fn expect_reply(response: &Frame, command: u8, address: u16) -> Result<(), ProtocolError> {
    if response.command != command {
        return Err(ProtocolError::UnexpectedCommand {
            expected: command,
            actual: response.command,
        });
    }
    if response.address != address {
        return Err(ProtocolError::UnexpectedAddress {
            expected: address,
            actual: response.address,
        });
    }
    Ok(())
}

/// Formats bytes as space separated hex for logs.
pub(crate) struct HexBytes<'a>(pub &'a [u8]);

impl core::fmt::Debug for HexBytes<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}
