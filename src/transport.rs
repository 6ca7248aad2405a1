//! Byte level access to a pack's serial link.
//!
//! Any interface which implements [embedded_io::Read] & [embedded_io::Write] can be used, it just
//! needs to also accept a read timeout via [Transport]. With the `serial` feature enabled
//! [SerialPortTransport] wraps a host serial port.
//!
//! The serial port used for pack comms should be configured like so:
//! * Default baud rate: 9600
//! * Data bits: 8
//! * Stop bits: 1
//! * Parity: None

use embedded_io::{Error as _, ErrorKind};
use fugit::MillisDurationU32;

/// Default baud rate for pack adapters.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Most bytes [Transport::discard_input] will drain by reading before it gives up.
pub const MAX_DISCARD: usize = 1024;

/// A serial link to one pack. Closing is dropping.
pub trait Transport: embedded_io::Read + embedded_io::Write {
    /// Maximum time a single read may block before giving up with [ErrorKind::TimedOut].
    fn set_timeout(&mut self, timeout: MillisDurationU32) -> Result<(), Self::Error>;

    /// Throw away anything received but not yet read, e.g. a reply which turned up after its
    /// read timed out.
    ///
    /// The default reads until the port times out, so it costs one read timeout per call. Ports
    /// which can flush their receive buffer should do that instead.
    fn discard_input(&mut self) -> Result<(), Self::Error> {
        let mut scratch = [0u8; 32];
        let mut discarded = 0;
        while discarded < MAX_DISCARD {
            match self.read(&mut scratch) {
                Ok(0) => break,
                Ok(bytes_read) => discarded += bytes_read,
                Err(e) if is_transient(e.kind()) => break,
                Err(e) => return Err(e),
            }
        }
        if discarded > 0 {
            tracing::debug!(discarded, "discarded stale input");
        }
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn set_timeout(&mut self, timeout: MillisDurationU32) -> Result<(), Self::Error> {
        T::set_timeout(self, timeout)
    }

    fn discard_input(&mut self) -> Result<(), Self::Error> {
        T::discard_input(self)
    }
}

/// Read errors of these kinds mean "nothing (valid) arrived in time" and may be retried.
///
/// Everything else means the port is gone.
pub fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::InvalidData
    )
}

#[cfg(feature = "serial")]
pub use self::serial::{SerialIoError, SerialPortTransport};

#[cfg(feature = "serial")]
mod serial {
    use super::Transport;
    use fugit::MillisDurationU32;
    use serialport::SerialPort;
    use std::time::Duration;

    /// A host serial port.
    pub struct SerialPortTransport(Box<dyn SerialPort>);

    #[derive(Debug)]
    pub struct SerialIoError(std::io::Error);

    impl SerialPortTransport {
        /// Open `path` at `baud_rate`, 8N1, with the given read timeout.
        pub fn open(
            path: &str,
            baud_rate: u32,
            timeout: MillisDurationU32,
        ) -> Result<Self, serialport::Error> {
            let port = serialport::new(path, baud_rate)
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None)
                .timeout(Duration::from_millis(timeout.to_millis() as u64))
                .open()?;
            tracing::debug!(path, baud_rate, "opened serial port");
            Ok(Self(port))
        }

        /// Name of the underlying port, if the OS reports one.
        pub fn name(&self) -> Option<String> {
            self.0.name()
        }
    }

    impl core::fmt::Display for SerialIoError {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for SerialIoError {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    impl embedded_io::Error for SerialIoError {
        fn kind(&self) -> embedded_io::ErrorKind {
            match self.0.kind() {
                std::io::ErrorKind::NotFound => embedded_io::ErrorKind::NotFound,
                std::io::ErrorKind::PermissionDenied => embedded_io::ErrorKind::PermissionDenied,
                std::io::ErrorKind::ConnectionReset => embedded_io::ErrorKind::ConnectionReset,
                std::io::ErrorKind::ConnectionAborted => embedded_io::ErrorKind::ConnectionAborted,
                std::io::ErrorKind::NotConnected => embedded_io::ErrorKind::NotConnected,
                std::io::ErrorKind::BrokenPipe => embedded_io::ErrorKind::BrokenPipe,
                std::io::ErrorKind::InvalidInput => embedded_io::ErrorKind::InvalidInput,
                std::io::ErrorKind::InvalidData => embedded_io::ErrorKind::InvalidData,
                std::io::ErrorKind::TimedOut => embedded_io::ErrorKind::TimedOut,
                // serialport reports an expired read timeout as WouldBlock on some platforms.
                std::io::ErrorKind::WouldBlock => embedded_io::ErrorKind::TimedOut,
                std::io::ErrorKind::Interrupted => embedded_io::ErrorKind::Interrupted,
                std::io::ErrorKind::Unsupported => embedded_io::ErrorKind::Unsupported,
                std::io::ErrorKind::OutOfMemory => embedded_io::ErrorKind::OutOfMemory,
                _ => embedded_io::ErrorKind::Other,
            }
        }
    }

    impl embedded_io::ErrorType for SerialPortTransport {
        type Error = SerialIoError;
    }

    impl embedded_io::Read for SerialPortTransport {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            std::io::Read::read(&mut self.0, buf).map_err(SerialIoError)
        }
    }

    impl embedded_io::Write for SerialPortTransport {
        fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            std::io::Write::write(&mut self.0, buf).map_err(SerialIoError)
        }

        fn flush(&mut self) -> Result<(), Self::Error> {
            std::io::Write::flush(&mut self.0).map_err(SerialIoError)
        }
    }

    impl Transport for SerialPortTransport {
        fn set_timeout(&mut self, timeout: MillisDurationU32) -> Result<(), Self::Error> {
            self.0
                .set_timeout(Duration::from_millis(timeout.to_millis() as u64))
                .map_err(|e| SerialIoError(e.into()))
        }

        fn discard_input(&mut self) -> Result<(), Self::Error> {
            self.0
                .clear(serialport::ClearBuffer::Input)
                .map_err(|e| SerialIoError(e.into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_serial::{MockSerial, Reply};
    use embedded_io::{Error as _, Read, Write};

    #[test]
    fn timeouts_are_transient() {
        assert!(is_transient(ErrorKind::TimedOut));
        assert!(is_transient(ErrorKind::Interrupted));
        assert!(is_transient(ErrorKind::InvalidData));
    }

    #[test]
    fn discard_drops_unread_bytes() {
        let mut mock = MockSerial::scripted([Reply::Bytes(vec![0xA5, 0x81, 0x00])]).keep_unread();
        mock.write_all(&[0x01]).unwrap();
        mock.discard_input().unwrap();

        let mut buffer = [0u8; 4];
        assert_eq!(mock.read(&mut buffer).unwrap_err().kind(), ErrorKind::TimedOut);
    }

    #[test]
    fn discard_on_dead_port_fails() {
        let mut mock = MockSerial::scripted([Reply::Disconnect]);
        mock.write_all(&[0x01]).unwrap();
        assert_eq!(mock.discard_input().unwrap_err().kind(), ErrorKind::BrokenPipe);
    }

    #[test]
    fn disconnects_are_fatal() {
        assert!(!is_transient(ErrorKind::BrokenPipe));
        assert!(!is_transient(ErrorKind::NotConnected));
        assert!(!is_transient(ErrorKind::Other));
    }
}
