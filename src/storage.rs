//! Interface to whatever persists sessions. Nothing here stores data itself.

use crate::{
    decoder::DecodedValue,
    health::HealthScore,
    session::{DeviceIdentity, DiagnosticSession, RawReading, SessionId},
};

/// A persistence backend for diagnostic results.
pub trait SessionStore {
    type Error: core::error::Error;
    /// Backend key for a device.
    type DeviceId;
    /// Backend key for a session.
    type SessionKey: Clone;

    fn register_device(&mut self, identity: &DeviceIdentity) -> Result<Self::DeviceId, Self::Error>;

    fn start_session(&mut self, device_id: &Self::DeviceId, session_id: SessionId) -> Result<Self::SessionKey, Self::Error>;

    fn store_raw_reading(&mut self, session: &Self::SessionKey, reading: &RawReading) -> Result<(), Self::Error>;

    fn store_decoded_value(&mut self, session: &Self::SessionKey, value: &DecodedValue) -> Result<(), Self::Error>;

    fn store_health_metrics(&mut self, session: &Self::SessionKey, score: &HealthScore) -> Result<(), Self::Error>;

    fn complete_session(&mut self, session: &Self::SessionKey, success: bool, completeness: f64) -> Result<(), Self::Error>;
}

/// Push a sealed session through `store`: device, session, readings, values, health, completion.
///
/// Stops at the first store error.
pub fn persist_session<T: SessionStore>(
    store: &mut T,
    session: &DiagnosticSession,
    health: Option<&HealthScore>,
) -> Result<T::SessionKey, T::Error> {
    let device_id = store.register_device(session.device())?;
    let key = store.start_session(&device_id, session.id())?;
    for reading in session.readings() {
        store.store_raw_reading(&key, reading)?;
    }
    for value in session.values() {
        store.store_decoded_value(&key, value)?;
    }
    if let Some(score) = health {
        store.store_health_metrics(&key, score)?;
    }
    store.complete_session(&key, session.is_complete(), session.completeness())?;
    tracing::debug!(
        session_id = %session.id(),
        readings = session.readings().len(),
        values = session.values().len(),
        "session persisted"
    );
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decoder::Decoder,
        frame::ChecksumKind,
        health::{Rating, SafetyStatus, SubScores},
        link::RetryPolicy,
        mock_serial::{MockSerial, register_responder},
        register::{Category, RegisterDefinition, RegisterMapBuilder},
        session::SessionController,
    };
    use std::{collections::HashMap, sync::Arc};
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("store is full")]
    struct Full;

    /// Records every call, optionally failing after `limit` calls.
    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        limit: Option<usize>,
    }

    impl Recorder {
        fn log(&mut self, call: String) -> Result<(), Full> {
            if self.limit.is_some_and(|limit| self.calls.len() >= limit) {
                return Err(Full);
            }
            self.calls.push(call);
            Ok(())
        }
    }

    impl SessionStore for Recorder {
        type Error = Full;
        type DeviceId = u32;
        type SessionKey = String;

        fn register_device(&mut self, identity: &DeviceIdentity) -> Result<u32, Full> {
            self.log(format!("device {}", identity.manufacturer))?;
            Ok(7)
        }

        fn start_session(&mut self, device_id: &u32, session_id: SessionId) -> Result<String, Full> {
            self.log(format!("start {device_id}"))?;
            Ok(session_id.to_string())
        }

        fn store_raw_reading(&mut self, _: &String, reading: &RawReading) -> Result<(), Full> {
            self.log(format!("raw {:#06x} #{}", reading.address, reading.attempt))
        }

        fn store_decoded_value(&mut self, _: &String, value: &DecodedValue) -> Result<(), Full> {
            self.log(format!("value {}", value.name))
        }

        fn store_health_metrics(&mut self, _: &String, score: &HealthScore) -> Result<(), Full> {
            self.log(format!("health {}", score.score))
        }

        fn complete_session(&mut self, _: &String, success: bool, completeness: f64) -> Result<(), Full> {
            self.log(format!("complete {success} {completeness:.2}"))
        }
    }

    fn session() -> DiagnosticSession {
        let map = Arc::new(
            RegisterMapBuilder::new("Acme", "X1")
                .with_register(RegisterDefinition::unsigned(0x10, "cycles", Category::Counter, 2))
                .with_register(RegisterDefinition::unsigned(0x11, "events", Category::Counter, 2))
                .build()
                .unwrap(),
        );
        let registers = HashMap::from([(0x10, vec![0, 5])]);
        let mock = MockSerial::responding(register_responder(ChecksumKind::Additive, registers));
        SessionController::<MockSerial>::new(mock, map, RetryPolicy::default(), Decoder::default())
            .unwrap()
            .run()
    }

    fn health() -> HealthScore {
        HealthScore {
            score: 92,
            sub_scores: SubScores {
                capacity: 95.0,
                resistance: 100.0,
                imbalance: 100.0,
                thermal: 80.0,
                safety: 70.0,
            },
            rating: Rating::Excellent,
            capacity_rating: Rating::Excellent,
            safety_status: SafetyStatus::Warning,
        }
    }

    #[test]
    fn persists_in_order() {
        let session = session();
        let mut store = Recorder::default();
        let key = persist_session(&mut store, &session, Some(&health())).unwrap();
        assert_eq!(key, session.id().to_string());
        assert_eq!(
            store.calls,
            vec![
                "device Acme",
                "start 7",
                "raw 0x0010 #1",
                "raw 0x0011 #1",
                "raw 0x0011 #2",
                "raw 0x0011 #3",
                "value cycles",
                "health 92",
                "complete true 0.50",
            ]
        );
    }

    #[test]
    fn no_health_without_score() {
        let mut store = Recorder::default();
        persist_session(&mut store, &session(), None).unwrap();
        assert!(!store.calls.iter().any(|c| c.starts_with("health")));
    }

    #[test]
    fn stops_at_first_error() {
        let mut store = Recorder {
            limit: Some(3),
            ..Recorder::default()
        };
        assert!(persist_session(&mut store, &session(), None).is_err());
        assert_eq!(store.calls.len(), 3);
        assert!(!store.calls.iter().any(|c| c.starts_with("complete")));
    }
}
