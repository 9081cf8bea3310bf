use crate::error::DecodeError;
use crate::protocol::{self, HEADER_SIZE, MAGIC, MAX_PAYLOAD};
use crate::types::HandshakeStatus;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

const READ_CHUNK: usize = 4096;
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Splits a TCP byte stream into complete device messages.
///
/// On junk or an impossible length the reader reports one `InvalidFormat`
/// and resynchronises on the next `VC` marker.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(READ_CHUNK),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Buffered bytes not yet returned as a message.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete message. `None` means more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Result<Vec<u8>, DecodeError>> {
        if self.buf.is_empty() {
            return None;
        }

        match self.buf.windows(MAGIC.len()).position(|w| w == MAGIC) {
            Some(0) => {}
            Some(offset) => {
                self.buf.drain(..offset);
                return Some(Err(DecodeError::InvalidFormat(format!(
                    "skipped {} bytes before frame marker",
                    offset
                ))));
            }
            None => {
                // A trailing first marker byte may start the next frame.
                let keep = usize::from(self.buf.last() == Some(&MAGIC[0]));
                let skipped = self.buf.len() - keep;
                if skipped == 0 {
                    return None;
                }
                self.buf.drain(..skipped);
                return Some(Err(DecodeError::InvalidFormat(format!(
                    "skipped {} bytes without frame marker",
                    skipped
                ))));
            }
        }

        if self.buf.len() < HEADER_SIZE {
            return None;
        }
        let len = protocol::payload_len(&self.buf);
        if len > MAX_PAYLOAD {
            self.buf.drain(..MAGIC.len());
            return Some(Err(DecodeError::InvalidFormat(format!(
                "payload length {} exceeds {}",
                len, MAX_PAYLOAD
            ))));
        }
        let total = HEADER_SIZE + len;
        if self.buf.len() < total {
            return None;
        }
        Some(Ok(self.buf.drain(..total).collect()))
    }
}

/// Result of one bounded read on the device socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were buffered.
    Data(usize),
    /// The poll interval elapsed with nothing to read.
    Idle,
    /// The peer closed its side.
    Closed,
}

/// TCP connection to the device.
///
/// Reads block for at most the poll interval so the session loop can observe
/// cancellation and idle deadlines between reads.
pub struct DeviceConnection {
    stream: TcpStream,
    peer: SocketAddr,
    reader: FrameReader,
    chunk: [u8; READ_CHUNK],
}

impl DeviceConnection {
    pub fn new(stream: TcpStream, poll_interval: Duration) -> io::Result<Self> {
        // Accepted sockets may inherit non-blocking mode from the listener on some platforms.
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(poll_interval))?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        stream.set_nodelay(true).ok();
        let peer = stream.peer_addr()?;
        Ok(Self {
            stream,
            peer,
            reader: FrameReader::new(),
            chunk: [0u8; READ_CHUNK],
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Read once from the socket into the frame buffer.
    pub fn poll(&mut self) -> io::Result<ReadOutcome> {
        match self.stream.read(&mut self.chunk) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => {
                self.reader.push(&self.chunk[..n]);
                Ok(ReadOutcome::Data(n))
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(ReadOutcome::Idle)
            }
            Err(e) => Err(e),
        }
    }

    pub fn next_frame(&mut self) -> Option<Result<Vec<u8>, DecodeError>> {
        self.reader.next_frame()
    }

    pub fn send(&mut self, message: &[u8]) -> io::Result<()> {
        self.stream.write_all(message)?;
        self.stream.flush()
    }

    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Refuse a connection with HELLO_ACK(busy) and close it.
pub fn reject_busy(mut stream: TcpStream, platform: &str) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_write_timeout(Some(WRITE_TIMEOUT));
    let ack = protocol::build_hello_ack(HandshakeStatus::Busy, platform);
    if let Err(e) = stream.write_all(&ack) {
        log::debug!("Failed to send busy reply to {}: {}", peer, e);
    }
    let _ = stream.shutdown(Shutdown::Both);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_goodbye, build_heartbeat, decode_message, DeviceMessage};
    use std::net::TcpListener;

    #[test]
    fn test_reader_splits_coalesced_messages() {
        let mut reader = FrameReader::new();
        let mut bytes = build_heartbeat();
        bytes.extend(build_goodbye());
        reader.push(&bytes);

        let first = reader.next_frame().unwrap().unwrap();
        assert_eq!(decode_message(&first).unwrap(), DeviceMessage::Heartbeat);
        let second = reader.next_frame().unwrap().unwrap();
        assert_eq!(decode_message(&second).unwrap(), DeviceMessage::Goodbye);
        assert!(reader.next_frame().is_none());
        assert_eq!(reader.pending(), 0);
    }

    #[test]
    fn test_reader_waits_for_partial_message() {
        let mut reader = FrameReader::new();
        let msg = build_goodbye();
        reader.push(&msg[..3]);
        assert!(reader.next_frame().is_none());
        reader.push(&msg[3..]);
        assert_eq!(reader.next_frame().unwrap().unwrap(), msg);
    }

    #[test]
    fn test_reader_resyncs_after_junk() {
        let mut reader = FrameReader::new();
        reader.push(&[0x00, 0x13, 0x37]);
        reader.push(&build_heartbeat());

        assert!(matches!(
            reader.next_frame(),
            Some(Err(DecodeError::InvalidFormat(_)))
        ));
        assert_eq!(reader.next_frame().unwrap().unwrap(), build_heartbeat());
    }

    #[test]
    fn test_reader_keeps_trailing_marker_byte() {
        let mut reader = FrameReader::new();
        reader.push(&[0xAA, 0xBB, MAGIC[0]]);
        assert!(matches!(
            reader.next_frame(),
            Some(Err(DecodeError::InvalidFormat(_)))
        ));
        assert_eq!(reader.pending(), 1);
        reader.push(&build_heartbeat()[1..]);
        assert_eq!(reader.next_frame().unwrap().unwrap(), build_heartbeat());
    }

    #[test]
    fn test_reader_rejects_oversize_length() {
        let mut reader = FrameReader::new();
        reader.push(&[MAGIC[0], MAGIC[1], 0x10, 0xFF, 0xFF]);
        reader.push(&build_heartbeat());
        assert!(matches!(
            reader.next_frame(),
            Some(Err(DecodeError::InvalidFormat(_)))
        ));
        // Remaining junk is skipped, then the heartbeat comes through.
        assert!(matches!(
            reader.next_frame(),
            Some(Err(DecodeError::InvalidFormat(_)))
        ));
        assert_eq!(reader.next_frame().unwrap().unwrap(), build_heartbeat());
    }

    #[test]
    fn test_connection_poll_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let mut conn = DeviceConnection::new(server, Duration::from_millis(20)).unwrap();

        assert_eq!(conn.poll().unwrap(), ReadOutcome::Idle);

        client.write_all(&build_heartbeat()).unwrap();
        let mut got = None;
        for _ in 0..50 {
            if let ReadOutcome::Data(_) = conn.poll().unwrap() {
                got = conn.next_frame();
                break;
            }
        }
        assert_eq!(got.unwrap().unwrap(), build_heartbeat());

        drop(client);
        let mut closed = false;
        for _ in 0..50 {
            if conn.poll().unwrap() == ReadOutcome::Closed {
                closed = true;
                break;
            }
        }
        assert!(closed);
    }
}
