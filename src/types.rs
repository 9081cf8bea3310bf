use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::SystemTime;

/// One decoded camera pose from the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseFrame {
    /// Device-assigned sequence number. May have gaps.
    pub sequence: u32,
    /// Translation [x, y, z] in scene units.
    pub translation: [f64; 3],
    /// Euler angles [x, y, z] in degrees.
    pub rotation: [f64; 3],
    /// Focal length in millimetres.
    pub focal_length: f64,
    /// Device capture timestamp in microseconds.
    pub timestamp_us: u64,
}

/// Connection details handed to the device out-of-band (scannable code).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingDescriptor {
    pub host: IpAddr,
    pub port: u16,
    /// Token the device must echo in its HELLO, if pairing requires one.
    pub token: Option<String>,
}

pub const PAIRING_SCHEME: &str = "vcam://";

impl PairingDescriptor {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// The string encoded into the pairing code.
    pub fn payload(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PairingDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PAIRING_SCHEME, self.socket_addr())?;
        if let Some(token) = &self.token {
            write!(f, "?token={}", token)?;
        }
        Ok(())
    }
}

impl FromStr for PairingDescriptor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(PAIRING_SCHEME)
            .ok_or_else(|| format!("missing {} prefix", PAIRING_SCHEME))?;
        let (addr, query) = match rest.split_once('?') {
            Some((addr, query)) => (addr, Some(query)),
            None => (rest, None),
        };
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| format!("invalid address '{}': {}", addr, e))?;
        let token = match query {
            Some(q) => Some(
                q.strip_prefix("token=")
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| format!("unsupported query '{}'", q))?
                    .to_string(),
            ),
            None => None,
        };
        Ok(PairingDescriptor {
            host: addr.ip(),
            port: addr.port(),
            token,
        })
    }
}

/// Session lifecycle as seen by the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Listening,
    Handshaking,
    Streaming,
    Closing,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Listening => "listening",
            SessionState::Handshaking => "handshaking",
            SessionState::Streaming => "streaming",
            SessionState::Closing => "closing",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags::bitflags! {
    /// Capability bitmap announced by the device in its HELLO.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(C)]
    pub struct Capabilities: u32 {
        const CAMERA_TRACKING  = 1 << 0;
        const FOCAL_LENGTH     = 1 << 1;
        const HEARTBEAT        = 1 << 2;
        const MATRIX_TRANSFORM = 1 << 3;
    }
}

/// HELLO_ACK status codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Accepted = 0,
    UnsupportedVersion = 1,
    MissingCapabilities = 2,
    TokenMismatch = 3,
    Busy = 4,
}

impl HandshakeStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(HandshakeStatus::Accepted),
            1 => Some(HandshakeStatus::UnsupportedVersion),
            2 => Some(HandshakeStatus::MissingCapabilities),
            3 => Some(HandshakeStatus::TokenMismatch),
            4 => Some(HandshakeStatus::Busy),
            _ => None,
        }
    }
}

/// Connection lifecycle notifications forwarded downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
}

/// Point-in-time view of the bridge for operator tooling.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BridgeStatus {
    pub state: SessionState,
    pub peer: Option<SocketAddr>,
    pub device_name: Option<String>,
    /// Host time at which the last valid frame arrived.
    pub last_frame_at: Option<SystemTime>,
    pub last_frame_sequence: Option<u32>,
    pub sessions_accepted: u64,
    pub sessions_rejected: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub frames_stale: u64,
    pub frames_published: u64,
    pub publish_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_pairing_payload_without_token() {
        let d = PairingDescriptor {
            host: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            port: 23354,
            token: None,
        };
        assert_eq!(d.payload(), "vcam://192.168.1.20:23354");
        assert_eq!(d.payload().parse::<PairingDescriptor>().unwrap(), d);
    }

    #[test]
    fn test_pairing_payload_with_token() {
        let d = PairingDescriptor {
            host: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)),
            port: 5000,
            token: Some("abc123".into()),
        };
        assert_eq!(d.payload(), "vcam://10.0.0.7:5000?token=abc123");
        assert_eq!(d.payload().parse::<PairingDescriptor>().unwrap(), d);
    }

    #[test]
    fn test_pairing_parse_rejects_garbage() {
        assert!("http://10.0.0.7:5000".parse::<PairingDescriptor>().is_err());
        assert!("vcam://10.0.0.7".parse::<PairingDescriptor>().is_err());
        assert!("vcam://10.0.0.7:5000?token=".parse::<PairingDescriptor>().is_err());
    }

    #[test]
    fn test_handshake_status_codes() {
        for code in 0..=4u8 {
            assert_eq!(HandshakeStatus::from_u8(code).unwrap() as u8, code);
        }
        assert!(HandshakeStatus::from_u8(5).is_none());
    }
}
