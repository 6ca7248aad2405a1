//! We use this mocking module in unit tests to emulate a pack on the end of a serial port.
//!
//! Each write is treated as one request. The reply to it is taken from a script queue, or produced
//! by a responder closure which sees the request bytes.
//!
//! By default a write drops any unread reply bytes. [MockSerial::keep_unread] keeps them instead,
//! like a real UART receive buffer.

use crate::{
    frame::{ChecksumKind, Frame, MAX_FRAME},
    transport::Transport,
};
use fugit::MillisDurationU32;
use std::collections::{HashMap, VecDeque};

/// What the emulated pack does after a request is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Answer with these bytes.
    Bytes(Vec<u8>),
    /// Stay silent, reads time out.
    Timeout,
    /// Answer with these bytes, but only once the next request has been written.
    Late(Vec<u8>),
    /// The port goes away, every later call fails.
    Disconnect,
}

type Responder = Box<dyn FnMut(&[u8]) -> Reply + Send>;

/// Our mock type used to emulate a serial port.
pub struct MockSerial {
    /// Everything written to the port.
    write_buffer: Vec<u8>,
    /// Each write call, kept separately.
    requests: Vec<Vec<u8>>,
    /// Bytes waiting to be read.
    read_buffer: Vec<u8>,
    /// Current position in the read buffer
    read_position: usize,
    /// Keep unread bytes across writes.
    keep_unread: bool,
    /// A late reply, delivered on the next write.
    late: Vec<u8>,
    script: VecDeque<Reply>,
    responder: Option<Responder>,
    disconnected: bool,
    /// Flag to simulate write errors
    should_error_on_write: bool,
    timeout: Option<MillisDurationU32>,
}

#[derive(Debug)]
pub enum MockSerialError {
    /// Simulated timeout error
    Timeout,
    /// Simulated unplugged adapter
    Disconnected,
    /// Generic simulated error for testing
    SimulatedError,
}

impl core::fmt::Display for MockSerialError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl core::error::Error for MockSerialError {}

impl embedded_io::Error for MockSerialError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            MockSerialError::Timeout => embedded_io::ErrorKind::TimedOut,
            MockSerialError::Disconnected => embedded_io::ErrorKind::BrokenPipe,
            MockSerialError::SimulatedError => embedded_io::ErrorKind::Other,
        }
    }
}

impl embedded_io::ErrorType for MockSerial {
    type Error = MockSerialError;
}

impl embedded_io::Write for MockSerial {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if self.disconnected {
            return Err(MockSerialError::Disconnected);
        }
        if self.should_error_on_write {
            return Err(MockSerialError::SimulatedError);
        }

        self.write_buffer.extend_from_slice(buf);
        self.requests.push(buf.to_vec());

        let reply = match self.responder.as_mut() {
            Some(responder) => responder(buf),
            None => self.script.pop_front().unwrap_or(Reply::Timeout),
        };
        if self.keep_unread {
            self.read_buffer.drain(..self.read_position);
        } else {
            self.read_buffer.clear();
        }
        self.read_position = 0;
        self.read_buffer.append(&mut self.late);
        match reply {
            Reply::Bytes(bytes) => self.read_buffer.extend_from_slice(&bytes),
            Reply::Late(bytes) => self.late = bytes,
            Reply::Timeout => {}
            Reply::Disconnect => self.disconnected = true,
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        if self.should_error_on_write {
            return Err(MockSerialError::SimulatedError);
        }
        Ok(())
    }
}

impl embedded_io::Read for MockSerial {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.disconnected {
            return Err(MockSerialError::Disconnected);
        }

        if self.read_position >= self.read_buffer.len() {
            return Err(MockSerialError::Timeout);
        }

        let available_bytes = self.read_buffer.len() - self.read_position;
        let bytes_to_read = core::cmp::min(buf.len(), available_bytes);

        buf[..bytes_to_read]
            .copy_from_slice(&self.read_buffer[self.read_position..self.read_position + bytes_to_read]);

        self.read_position += bytes_to_read;
        Ok(bytes_to_read)
    }
}

impl Transport for MockSerial {
    fn set_timeout(&mut self, timeout: MillisDurationU32) -> Result<(), Self::Error> {
        self.timeout = Some(timeout);
        Ok(())
    }
}

impl MockSerial {
    /// Create a new MockSerial instance which never answers.
    pub fn new() -> Self {
        Self {
            write_buffer: Vec::new(),
            requests: Vec::new(),
            read_buffer: Vec::new(),
            read_position: 0,
            keep_unread: false,
            late: Vec::new(),
            script: VecDeque::new(),
            responder: None,
            disconnected: false,
            should_error_on_write: false,
            timeout: None,
        }
    }

    /// Answer successive requests with `replies`, then time out.
    pub fn scripted(replies: impl IntoIterator<Item = Reply>) -> Self {
        let mut mock = Self::new();
        mock.script.extend(replies);
        mock
    }

    /// Answer every request by calling `responder` with the request bytes.
    pub fn responding(responder: impl FnMut(&[u8]) -> Reply + Send + 'static) -> Self {
        let mut mock = Self::new();
        mock.responder = Some(Box::new(responder));
        mock
    }

    /// Keep reply bytes nobody read when the next request is written.
    pub fn keep_unread(mut self) -> Self {
        self.keep_unread = true;
        self
    }

    /// Get a reference to the data that was written to this mock serial port
    pub fn written_data(&self) -> &[u8] {
        &self.write_buffer
    }

    /// Each write call made so far.
    pub fn requests(&self) -> &[Vec<u8>] {
        &self.requests
    }

    pub fn write_count(&self) -> usize {
        self.requests.len()
    }

    /// The last timeout configured through [Transport::set_timeout].
    pub fn timeout(&self) -> Option<MillisDurationU32> {
        self.timeout
    }

    /// Configure whether write operations should fail with an error
    pub fn set_write_error(&mut self, should_error: bool) {
        self.should_error_on_write = should_error;
    }
}

/// Serialise a frame the way a pack would send it.
pub fn encode_frame(frame: &Frame, checksum: ChecksumKind) -> Vec<u8> {
    let mut out: heapless::Vec<u8, MAX_FRAME> = heapless::Vec::new();
    frame.encode(checksum, &mut out).unwrap();
    out.to_vec()
}

/// Emulates a pack answering register reads from `registers`. Unknown addresses stay silent.
pub fn register_responder(
    checksum: ChecksumKind,
    registers: HashMap<u16, Vec<u8>>,
) -> impl FnMut(&[u8]) -> Reply + Send + 'static {
    move |request| {
        let Ok(frame) = Frame::decode(request, checksum) else {
            return Reply::Timeout;
        };
        match registers.get(&frame.address) {
            Some(bytes) => {
                let reply = Frame::new(frame.command | 0x80, frame.address, bytes).unwrap();
                Reply::Bytes(encode_frame(&reply, checksum))
            }
            None => Reply::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_io::{Error, Read, Write};

    #[test]
    fn test_new_mock_serial() {
        let mock = MockSerial::new();
        assert_eq!(mock.written_data().len(), 0);
        assert_eq!(mock.read_position, 0);
        assert_eq!(mock.write_count(), 0);
        assert!(!mock.disconnected);
    }

    #[test]
    fn test_write_records_requests() {
        let mut mock = MockSerial::new();
        mock.write(b"Hello, ").unwrap();
        mock.write(b"World!").unwrap();

        assert_eq!(mock.written_data(), b"Hello, World!");
        assert_eq!(mock.write_count(), 2);
        assert_eq!(mock.requests()[1], b"World!".to_vec());
    }

    #[test]
    fn test_scripted_replies_in_order() {
        let mut mock = MockSerial::scripted([Reply::Bytes(vec![1, 2, 3]), Reply::Timeout]);
        let mut buffer = [0u8; 8];

        mock.write(&[0xAA]).unwrap();
        assert_eq!(mock.read(&mut buffer).unwrap(), 3);
        assert_eq!(&buffer[..3], &[1, 2, 3]);

        mock.write(&[0xAA]).unwrap();
        let err = mock.read(&mut buffer).unwrap_err();
        assert_eq!(err.kind(), embedded_io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_read_partial_data() {
        let mut mock = MockSerial::scripted([Reply::Bytes(vec![1, 2, 3, 4, 5])]);
        mock.write(&[0x00]).unwrap();

        let mut buffer = [0u8; 2];
        assert_eq!(mock.read(&mut buffer).unwrap(), 2);
        assert_eq!(buffer, [1, 2]);
        assert_eq!(mock.read(&mut buffer).unwrap(), 2);
        assert_eq!(buffer, [3, 4]);
        assert_eq!(mock.read(&mut buffer).unwrap(), 1);
        assert_eq!(buffer[0], 5);
    }

    #[test]
    fn test_keep_unread_across_writes() {
        let mut mock = MockSerial::scripted([Reply::Bytes(vec![1, 2, 3]), Reply::Bytes(vec![4])]).keep_unread();
        let mut buffer = [0u8; 8];

        mock.write(&[0xAA]).unwrap();
        assert_eq!(mock.read(&mut buffer[..2]).unwrap(), 2);
        mock.write(&[0xAA]).unwrap();
        assert_eq!(mock.read(&mut buffer).unwrap(), 2);
        assert_eq!(&buffer[..2], &[3, 4]);
    }

    #[test]
    fn test_late_reply_arrives_on_next_write() {
        let mut mock = MockSerial::scripted([Reply::Late(vec![9]), Reply::Timeout]);
        let mut buffer = [0u8; 4];

        mock.write(&[0xAA]).unwrap();
        assert!(matches!(mock.read(&mut buffer), Err(MockSerialError::Timeout)));
        mock.write(&[0xAA]).unwrap();
        assert_eq!(mock.read(&mut buffer).unwrap(), 1);
        assert_eq!(buffer[0], 9);
    }

    #[test]
    fn test_unanswered_read_times_out() {
        let mut mock = MockSerial::new();
        let mut buffer = [0u8; 4];
        let err = mock.read(&mut buffer).unwrap_err();
        assert!(matches!(err, MockSerialError::Timeout));
    }

    #[test]
    fn test_responder_sees_request() {
        let mut mock = MockSerial::responding(|request| Reply::Bytes(request.iter().rev().copied().collect()));
        mock.write(&[1, 2, 3]).unwrap();

        let mut buffer = [0u8; 3];
        mock.read(&mut buffer).unwrap();
        assert_eq!(buffer, [3, 2, 1]);
    }

    #[test]
    fn test_disconnect_is_permanent() {
        let mut mock = MockSerial::scripted([Reply::Disconnect]);
        mock.write(&[0x01]).unwrap();

        let mut buffer = [0u8; 4];
        let err = mock.read(&mut buffer).unwrap_err();
        assert_eq!(err.kind(), embedded_io::ErrorKind::BrokenPipe);
        assert!(mock.write(&[0x01]).is_err());
    }

    #[test]
    fn test_write_error() {
        let mut mock = MockSerial::new();
        mock.set_write_error(true);
        assert!(matches!(mock.write(b"test"), Err(MockSerialError::SimulatedError)));
        assert!(mock.flush().is_err());
        assert_eq!(mock.write_count(), 0);
    }

    #[test]
    fn test_register_responder() {
        let registers = HashMap::from([(0x0010, vec![0x12, 0x34])]);
        let mut mock = MockSerial::responding(register_responder(ChecksumKind::Additive, registers));

        let request = Frame::new(0x01, 0x0010, &[2]).unwrap();
        mock.write(&encode_frame(&request, ChecksumKind::Additive)).unwrap();
        let mut buffer = [0u8; 16];
        let n = mock.read(&mut buffer).unwrap();
        let reply = Frame::decode(&buffer[..n], ChecksumKind::Additive).unwrap();
        assert_eq!(reply.command, 0x81);
        assert_eq!(reply.payload.as_slice(), &[0x12, 0x34]);

        let request = Frame::new(0x01, 0x0011, &[2]).unwrap();
        mock.write(&encode_frame(&request, ChecksumKind::Additive)).unwrap();
        assert!(mock.read(&mut buffer).is_err());
    }

    #[test]
    fn test_set_timeout() {
        let mut mock = MockSerial::new();
        mock.set_timeout(MillisDurationU32::millis(250)).unwrap();
        assert_eq!(mock.timeout(), Some(MillisDurationU32::millis(250)));
    }
}
