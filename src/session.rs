//! Diagnostic sessions and the controller which runs a register sweep.
//!
//! A session moves `Created -> Reading(i) -> Sealed`. While the sweep runs it is an
//! [ActiveSession] owned by the [SessionController]. Sealing consumes it and hands back an immutable
//! [DiagnosticSession], so nothing can change a session after it has been reported.

use crate::{
    decoder::{DecodedValue, Decoder, ValidationStatus},
    error::{CommunicationError, DecodeError, ExchangeError, FailureReason, ProtocolError},
    frame::{Frame, MAX_FRAME},
    link::{Link, RetryPolicy, expect_reply},
    register::{RegisterMap, Role},
    registers::m18_type_and_serial,
    transport::Transport,
    worker::CancelToken,
};
use embedded_io::Error as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Command byte of a register read. Responses set the top bit.
pub const READ_COMMAND: u8 = 0x01;
pub const READ_REPLY: u8 = READ_COMMAND | 0x80;

pub type SessionId = Uuid;

/// What is on the other end of the port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub manufacturer: String,
    pub model: String,
    /// Port the pack was read through, e.g. `/dev/ttyUSB0`.
    pub port: String,
    /// Filled in from the pack after a sweep when the caller did not supply it.
    pub serial: Option<String>,
}

/// One read attempt, kept whether or not it succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawReading {
    pub session_id: SessionId,
    pub address: u16,
    pub raw: Vec<u8>,
    /// Milliseconds since the session started.
    pub elapsed_ms: u64,
    pub checksum_valid: bool,
    pub attempt: u8,
}

/// Why a register has no usable value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadFailure {
    Communication(CommunicationError),
    Protocol(ProtocolError),
    Decode(DecodeError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterFailure {
    pub address: u16,
    pub failure: ReadFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    /// Reading the register at this position in the map.
    Reading(usize),
}

/// A session being filled in by a sweep.
#[derive(Debug)]
pub(crate) struct ActiveSession {
    id: SessionId,
    device: DeviceIdentity,
    expected_registers: usize,
    readings: Vec<RawReading>,
    values: Vec<DecodedValue>,
    failures: Vec<RegisterFailure>,
    state: SessionState,
}

impl ActiveSession {
    pub(crate) fn new(device: DeviceIdentity, expected_registers: usize) -> Self {
        Self {
            id: Uuid::now_v7(),
            device,
            expected_registers,
            readings: Vec::new(),
            values: Vec::new(),
            failures: Vec::new(),
            state: SessionState::Created,
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    fn begin_register(&mut self, index: usize) {
        self.state = SessionState::Reading(index);
    }

    fn record_reading(&mut self, reading: RawReading) {
        self.readings.push(reading);
    }

    fn record_value(&mut self, value: DecodedValue) {
        self.values.push(value);
    }

    fn record_failure(&mut self, address: u16, failure: ReadFailure) {
        self.failures.push(RegisterFailure { address, failure });
    }

    pub(crate) fn seal(self, failure_reason: Option<FailureReason>, duration_ms: u64) -> DiagnosticSession {
        DiagnosticSession {
            id: self.id,
            device: self.device,
            expected_registers: self.expected_registers,
            readings: self.readings,
            values: self.values,
            failures: self.failures,
            completed: failure_reason.is_none(),
            failure_reason,
            duration_ms,
        }
    }
}

/// A sealed, read-only session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticSession {
    id: SessionId,
    device: DeviceIdentity,
    expected_registers: usize,
    readings: Vec<RawReading>,
    values: Vec<DecodedValue>,
    failures: Vec<RegisterFailure>,
    completed: bool,
    failure_reason: Option<FailureReason>,
    duration_ms: u64,
}

impl DiagnosticSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    /// Every read attempt, in the order it was made.
    pub fn readings(&self) -> &[RawReading] {
        &self.readings
    }

    /// Decoded values in register order, including ones whose decode failed.
    pub fn values(&self) -> &[DecodedValue] {
        &self.values
    }

    pub fn failures(&self) -> &[RegisterFailure] {
        &self.failures
    }

    pub fn value(&self, address: u16) -> Option<&DecodedValue> {
        self.values.iter().find(|v| v.address == address)
    }

    /// True when the sweep visited every register, even if some of them failed.
    pub fn is_complete(&self) -> bool {
        self.completed
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        self.failure_reason
    }

    pub fn expected_registers(&self) -> usize {
        self.expected_registers
    }

    /// Registers successfully decoded over registers expected, 0 to 1.
    pub fn completeness(&self) -> f64 {
        if self.expected_registers == 0 {
            return 0.0;
        }
        let decoded = self.values.iter().filter(|v| v.is_decoded()).count();
        decoded as f64 / self.expected_registers as f64
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }
}

/// Runs register sweeps over one port.
///
/// A failed register lowers completeness and the sweep moves on. Only the port failing, or a
/// cancel request, stops a sweep early.
pub struct SessionController<S: Transport, const L: usize = MAX_FRAME> {
    link: Link<S, L>,
    map: Arc<RegisterMap>,
    decoder: Decoder,
    device: DeviceIdentity,
    cancel: CancelToken,
}

impl<S: Transport, const L: usize> SessionController<S, L> {
    pub fn new(
        interface: S,
        map: Arc<RegisterMap>,
        policy: RetryPolicy,
        decoder: Decoder,
    ) -> crate::error::Result<Self, S::Error> {
        let link = Link::new(interface, map.checksum(), policy)?;
        let device = DeviceIdentity {
            manufacturer: map.manufacturer().to_string(),
            model: map.model().to_string(),
            ..DeviceIdentity::default()
        };
        Ok(Self {
            link,
            map,
            decoder,
            device,
            cancel: CancelToken::new(),
        })
    }

    pub fn with_device(mut self, device: DeviceIdentity) -> Self {
        self.device = device;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn map(&self) -> &Arc<RegisterMap> {
        &self.map
    }

    pub fn interface(&self) -> &S {
        self.link.interface()
    }

    pub fn into_inner(self) -> S {
        self.link.into_inner()
    }

    /// Read every register in the map, in address order.
    pub fn run(&mut self) -> DiagnosticSession {
        let map = Arc::clone(&self.map);
        let mut session = ActiveSession::new(self.device.clone(), map.len());
        let started_ms = self.link.elapsed_ms();
        tracing::info!(
            session_id = %session.id(),
            manufacturer = map.manufacturer(),
            model = map.model(),
            registers = map.len(),
            "starting diagnostic sweep"
        );

        for (index, def) in map.iter().enumerate() {
            if self.cancel.is_cancelled() {
                tracing::warn!(session_id = %session.id(), index, "sweep cancelled");
                return self.seal(session, Some(FailureReason::Cancelled), started_ms);
            }
            session.begin_register(index);
            tracing::trace!(state = ?session.state(), address = def.address, "reading register");

            let request = match Frame::new(READ_COMMAND, def.address, &[def.width]) {
                Ok(request) => request,
                Err(err) => {
                    session.record_failure(def.address, ReadFailure::Protocol(err));
                    continue;
                }
            };
            let exchange = self.link.send_request(&request);
            for attempt in &exchange.attempts {
                session.record_reading(RawReading {
                    session_id: session.id(),
                    address: def.address,
                    raw: attempt.raw.clone(),
                    elapsed_ms: attempt.elapsed_ms.saturating_sub(started_ms),
                    checksum_valid: attempt.checksum_valid,
                    attempt: attempt.attempt,
                });
            }

            let frame = match exchange.result {
                Ok(frame) => frame,
                Err(ExchangeError::Transport(err)) => {
                    let kind = err.kind();
                    tracing::error!(session_id = %session.id(), address = def.address, ?kind, "port failed, aborting sweep");
                    return self.seal(session, Some(FailureReason::Transport { kind }), started_ms);
                }
                Err(ExchangeError::Communication(err)) => {
                    tracing::warn!(address = def.address, name = %def.name, %err, "register read failed");
                    session.record_failure(def.address, ReadFailure::Communication(err));
                    continue;
                }
                Err(ExchangeError::Protocol(err)) => {
                    tracing::warn!(address = def.address, name = %def.name, %err, "unexpected response");
                    session.record_failure(def.address, ReadFailure::Protocol(err));
                    continue;
                }
            };
            if let Err(err) = expect_reply(&frame, READ_REPLY, def.address) {
                tracing::warn!(address = def.address, name = %def.name, %err, "response does not match request");
                session.record_failure(def.address, ReadFailure::Protocol(err));
                continue;
            }

            let value = self.decoder.decode(&frame.payload, def);
            if let ValidationStatus::Error(err) = &value.status {
                tracing::warn!(address = def.address, name = %def.name, %err, "register decode failed");
                session.record_failure(def.address, ReadFailure::Decode(err.clone()));
            }
            session.record_value(value);
        }

        self.seal(session, None, started_ms)
    }

    fn seal(&self, mut session: ActiveSession, reason: Option<FailureReason>, started_ms: u64) -> DiagnosticSession {
        if session.device.serial.is_none() {
            session.device.serial = reported_serial(&self.map, &session.values);
        }
        let sealed = session.seal(reason, self.link.elapsed_ms().saturating_sub(started_ms));
        tracing::info!(
            session_id = %sealed.id(),
            complete = sealed.is_complete(),
            completeness = sealed.completeness(),
            failures = sealed.failures().len(),
            "diagnostic session sealed"
        );
        sealed
    }
}

/// The serial the pack reported about itself, from a [Role::SerialNumber] register or, failing
/// that, M18 style `type-serial` text in the [Role::BatteryType] register.
fn reported_serial(map: &RegisterMap, values: &[DecodedValue]) -> Option<String> {
    let value_of = |role: Role| {
        let def = map.find_role(role)?;
        values.iter().find(|v| v.address == def.address && v.is_decoded())
    };
    if let Some(value) = value_of(Role::SerialNumber) {
        return match (&value.text, value.value) {
            (Some(text), _) => Some(text.trim().to_string()).filter(|s| !s.is_empty()),
            (None, Some(number)) => Some(format!("{number:.0}")),
            (None, None) => None,
        };
    }
    let text = value_of(Role::BatteryType)?.text.as_deref()?;
    m18_type_and_serial(text).map(|(_, serial)| serial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frame::ChecksumKind,
        mock_serial::{MockSerial, Reply, encode_frame, register_responder},
        register::{Category, RegisterDefinition, RegisterMapBuilder},
    };
    use std::collections::HashMap;

    fn test_map() -> Arc<RegisterMap> {
        Arc::new(
            RegisterMapBuilder::new("Acme", "X1")
                .with_register(
                    RegisterDefinition::unsigned(0x10, "cell_1", Category::Voltage, 2)
                        .with_scale(0.001)
                        .with_unit("V"),
                )
                .with_register(
                    RegisterDefinition::unsigned(0x11, "cell_2", Category::Voltage, 2)
                        .with_scale(0.001)
                        .with_unit("V"),
                )
                .with_register(RegisterDefinition::unsigned(0x12, "cycles", Category::Counter, 2))
                .build()
                .unwrap(),
        )
    }

    fn all_registers() -> HashMap<u16, Vec<u8>> {
        HashMap::from([
            (0x10, 3750u16.to_be_bytes().to_vec()),
            (0x11, 3720u16.to_be_bytes().to_vec()),
            (0x12, 42u16.to_be_bytes().to_vec()),
        ])
    }

    fn controller(mock: MockSerial) -> SessionController<MockSerial> {
        SessionController::new(mock, test_map(), RetryPolicy::default(), Decoder::default()).unwrap()
    }

    #[test]
    fn full_sweep() {
        let mock = MockSerial::responding(register_responder(ChecksumKind::Additive, all_registers()));
        let mut controller = controller(mock);

        let session = controller.run();
        assert!(session.is_complete());
        assert_eq!(session.failure_reason(), None);
        assert_eq!(session.completeness(), 1.0);
        assert_eq!(session.readings().len(), 3);
        assert!(session.readings().iter().all(|r| r.session_id == session.id()));
        assert_eq!(session.value(0x12).unwrap().value, Some(42.0));
        assert_eq!(session.device().manufacturer, "Acme");

        // Requests go out in address order.
        let addresses: Vec<u16> = controller
            .interface()
            .requests()
            .iter()
            .map(|r| u16::from_be_bytes([r[2], r[3]]))
            .collect();
        assert_eq!(addresses, vec![0x10, 0x11, 0x12]);
    }

    #[test]
    fn retry_exhaustion_fails_only_that_register() {
        let mut registers = all_registers();
        registers.remove(&0x11);
        let mock = MockSerial::responding(register_responder(ChecksumKind::Additive, registers));
        let mut controller = controller(mock);

        let session = controller.run();
        let attempts: Vec<&RawReading> = session.readings().iter().filter(|r| r.address == 0x11).collect();
        assert_eq!(attempts.len(), 3);
        assert_eq!(
            attempts.iter().map(|r| r.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(attempts.iter().all(|r| !r.checksum_valid));

        assert_eq!(
            session.failures(),
            &[RegisterFailure {
                address: 0x11,
                failure: ReadFailure::Communication(CommunicationError::Timeout {
                    attempts: 3,
                    timeout_ms: 2000
                }),
            }]
        );
        // The sweep carried on to the last register.
        assert!(session.value(0x12).is_some());
        assert!(session.is_complete());
        assert!((session.completeness() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn checksum_failure_then_success() {
        let good = |address: u16, value: u16| {
            encode_frame(
                &Frame::new(READ_REPLY, address, &value.to_be_bytes()).unwrap(),
                ChecksumKind::Additive,
            )
        };
        let mut corrupt = good(0x10, 3750);
        corrupt[6] ^= 0x40;
        let mock = MockSerial::scripted([
            Reply::Bytes(corrupt),
            Reply::Bytes(good(0x10, 3750)),
            Reply::Bytes(good(0x11, 3720)),
            Reply::Bytes(good(0x12, 1)),
        ]);
        let mut controller = controller(mock);

        let session = controller.run();
        let first: Vec<&RawReading> = session.readings().iter().filter(|r| r.address == 0x10).collect();
        assert_eq!(first.len(), 2);
        assert!(!first[0].checksum_valid);
        assert!(first[1].checksum_valid);
        assert_eq!(session.completeness(), 1.0);
    }

    #[test]
    fn disconnect_aborts_with_partial_data() {
        let mut respond = register_responder(ChecksumKind::Additive, all_registers());
        let mut count = 0;
        let mock = MockSerial::responding(move |request| {
            count += 1;
            if count == 2 { Reply::Disconnect } else { respond(request) }
        });
        let mut controller = controller(mock);

        let session = controller.run();
        assert!(!session.is_complete());
        assert_eq!(
            session.failure_reason(),
            Some(FailureReason::Transport {
                kind: embedded_io::ErrorKind::BrokenPipe
            })
        );
        assert_eq!(session.values().len(), 1);
        assert!((session.completeness() - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(controller.interface().write_count(), 2);
        // The attempt the port died on is still on record.
        let lost: Vec<&RawReading> = session.readings().iter().filter(|r| r.address == 0x11).collect();
        assert_eq!(lost.len(), 1);
        assert!(lost[0].raw.is_empty());
    }

    #[test]
    fn late_reply_does_not_desync_sweep() {
        let mut respond = register_responder(ChecksumKind::Additive, all_registers());
        let mut first = true;
        let mock = MockSerial::responding(move |request| match respond(request) {
            Reply::Bytes(bytes) if first => {
                first = false;
                Reply::Late(bytes)
            }
            reply => reply,
        })
        .keep_unread();
        let mut controller = controller(mock);

        let session = controller.run();
        assert!(session.failures().is_empty());
        assert_eq!(session.completeness(), 1.0);
        assert_eq!(session.readings().iter().filter(|r| r.address == 0x10).count(), 2);
    }

    #[test]
    fn serial_is_read_from_the_pack() {
        let map = Arc::new(
            RegisterMapBuilder::new("Acme", "X1")
                .with_register(
                    RegisterDefinition::unsigned(0x20, "serial_number", Category::Identity, 4)
                        .with_role(Role::SerialNumber),
                )
                .build()
                .unwrap(),
        );
        let registers = HashMap::from([(0x20, 4521734u32.to_be_bytes().to_vec())]);
        let pack = || MockSerial::responding(register_responder(ChecksumKind::Additive, registers.clone()));

        let session =
            SessionController::<MockSerial>::new(pack(), Arc::clone(&map), RetryPolicy::default(), Decoder::default())
                .unwrap()
                .run();
        assert_eq!(session.device().serial.as_deref(), Some("4521734"));

        let supplied = DeviceIdentity {
            serial: Some("label-42".to_string()),
            ..DeviceIdentity::default()
        };
        let session = SessionController::<MockSerial>::new(pack(), map, RetryPolicy::default(), Decoder::default())
            .unwrap()
            .with_device(supplied)
            .run();
        assert_eq!(session.device().serial.as_deref(), Some("label-42"));
    }

    #[test]
    fn decode_error_is_recorded_and_sweep_continues() {
        let mut registers = all_registers();
        registers.insert(0x10, vec![0x0E]);
        let mock = MockSerial::responding(register_responder(ChecksumKind::Additive, registers));
        let mut controller = controller(mock);

        let session = controller.run();
        assert!(session.is_complete());
        assert_eq!(session.values().len(), 3);
        assert!(!session.value(0x10).unwrap().is_decoded());
        assert_eq!(
            session.failures()[0].failure,
            ReadFailure::Decode(DecodeError::WidthMismatch { expected: 2, actual: 1 })
        );
        assert!((session.completeness() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn wrong_address_is_a_protocol_failure() {
        let reply = encode_frame(
            &Frame::new(READ_REPLY, 0x99, &[0, 1]).unwrap(),
            ChecksumKind::Additive,
        );
        let mock = MockSerial::scripted([Reply::Bytes(reply)]);
        let mut controller = controller(mock);

        let session = controller.run();
        assert_eq!(
            session.failures()[0],
            RegisterFailure {
                address: 0x10,
                failure: ReadFailure::Protocol(ProtocolError::UnexpectedAddress {
                    expected: 0x10,
                    actual: 0x99
                }),
            }
        );
        // A protocol failure is not retried.
        assert_eq!(session.readings().iter().filter(|r| r.address == 0x10).count(), 1);
    }

    #[test]
    fn cancelled_before_start() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mock = MockSerial::responding(register_responder(ChecksumKind::Additive, all_registers()));
        let mut controller = controller(mock).with_cancel(cancel);

        let session = controller.run();
        assert!(!session.is_complete());
        assert_eq!(session.failure_reason(), Some(FailureReason::Cancelled));
        assert_eq!(controller.interface().write_count(), 0);
        assert_eq!(session.completeness(), 0.0);
    }

    #[test]
    fn active_session_states() {
        let mut session = ActiveSession::new(DeviceIdentity::default(), 2);
        assert_eq!(session.state(), SessionState::Created);
        session.begin_register(1);
        assert_eq!(session.state(), SessionState::Reading(1));

        let sealed = session.seal(None, 5);
        assert!(sealed.is_complete());
        assert_eq!(sealed.duration_ms(), 5);
        assert_eq!(sealed.completeness(), 0.0);
    }
}
