use crate::types::Capabilities;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Startup errors returned to callers.
///
/// [`HandshakeError`], [`DecodeError`] and [`PublishError`] never reach this
/// level: they are contained inside the session and publish loops and reported
/// via logs and [`crate::BridgeStatus`] counters.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("No usable non-loopback network address: {0}")]
    AddressResolution(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Failed to spawn {0} thread: {1}")]
    Thread(&'static str, std::io::Error),
}

/// Frame-local decode failures. The offending frame is dropped and the session
/// keeps streaming.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Truncated frame: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Invalid frame format: {0}")]
    InvalidFormat(String),

    #[error("Field {field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
}

/// Session-local handshake failures. The connection is closed and the listener
/// returns to LISTENING.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("No HELLO within {0:?}")]
    Timeout(Duration),

    #[error("Peer closed the connection during handshake")]
    PeerClosed,

    #[error("Bridge is shutting down")]
    Cancelled,

    #[error("Expected HELLO, got message type 0x{0:02x}")]
    UnexpectedMessage(u8),

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("Device is missing required capabilities {0:?}")]
    MissingCapabilities(Capabilities),

    #[error("Pairing token mismatch")]
    TokenMismatch,

    #[error("Malformed HELLO: {0}")]
    Malformed(#[from] DecodeError),

    #[error("I/O during handshake: {0}")]
    Io(#[from] std::io::Error),
}

/// Tick-local outbound failures. Logged; the next tick proceeds normally.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Failed to encode datagram: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Send to {target} failed: {source}")]
    Send {
        target: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Short send to {target}: {sent} of {len} bytes")]
    ShortSend {
        target: SocketAddr,
        sent: usize,
        len: usize,
    },
}

/// Thread-safe last-error storage for the C FFI layer.
pub(crate) struct LastError {
    message: std::sync::Mutex<String>,
}

impl LastError {
    pub const fn new() -> Self {
        Self {
            message: std::sync::Mutex::new(String::new()),
        }
    }

    pub fn set(&self, err: &BridgeError) {
        if let Ok(mut msg) = self.message.lock() {
            *msg = fmt::format(format_args!("{}\0", err));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut msg) = self.message.lock() {
            msg.clear();
        }
    }

    pub fn as_ptr(&self) -> *const std::ffi::c_char {
        match self.message.lock() {
            Ok(msg) if !msg.is_empty() => msg.as_ptr() as *const std::ffi::c_char,
            _ => std::ptr::null(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_error_is_nul_terminated() {
        let slot = LastError::new();
        assert!(slot.as_ptr().is_null());

        slot.set(&BridgeError::Config("target_rate_hz must be positive".into()));
        let msg = unsafe { std::ffi::CStr::from_ptr(slot.as_ptr()) };
        assert_eq!(
            msg.to_str().unwrap(),
            "Invalid configuration: target_rate_hz must be positive"
        );

        slot.clear();
        assert!(slot.as_ptr().is_null());
    }

    #[test]
    fn test_startup_io_error_is_transport() {
        let err: BridgeError =
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "port taken").into();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert_eq!(err.to_string(), "Transport error: port taken");
    }

    #[test]
    fn test_decode_error_converts_into_handshake_error() {
        let err: HandshakeError = DecodeError::InvalidFormat("bad marker".into()).into();
        assert!(matches!(err, HandshakeError::Malformed(_)));
    }
}
