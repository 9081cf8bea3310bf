//! Device wire protocol.
//!
//! Every message is a length-prefixed envelope, all integers little-endian:
//!
//! ```text
//! [0x56 'V'][0x43 'C'][type u8][payload_len u16][payload ...]
//! ```

use crate::error::DecodeError;
use crate::types::{Capabilities, HandshakeStatus, PoseFrame};

// -- Envelope --
pub const MAGIC: [u8; 2] = [0x56, 0x43];
pub const HEADER_SIZE: usize = 5;
pub const MAX_PAYLOAD: usize = 1024;

pub const PROTOCOL_VERSION: u8 = 1;
pub const PLUGIN_VERSION: [u8; 3] = [1, 0, 0];
pub const PLATFORM_FIELD_LEN: usize = 10;

// -- Message types --
pub const MSG_HELLO: u8 = 0x01;
pub const MSG_POSE: u8 = 0x10;
pub const MSG_TRANSFORM: u8 = 0x11;
pub const MSG_HEARTBEAT: u8 = 0x20;
pub const MSG_GOODBYE: u8 = 0x7F;
pub const MSG_HELLO_ACK: u8 = 0x81;

// -- Fixed payload sizes --
/// seq u32 + timestamp u64 + 7x f64
pub const POSE_PAYLOAD_SIZE: usize = 4 + 8 + 7 * 8;
/// seq u32 + timestamp u64 + 16x f32 matrix + f32 focal length
pub const TRANSFORM_PAYLOAD_SIZE: usize = 4 + 8 + 16 * 4 + 4;
/// version + status + platform + plugin version
pub const HELLO_ACK_PAYLOAD_SIZE: usize = 1 + 1 + PLATFORM_FIELD_LEN + 3;
/// version + capabilities + token_len + name_len
const HELLO_MIN_PAYLOAD_SIZE: usize = 1 + 4 + 1 + 1;
/// Token and device name are each length-prefixed by a u8.
pub const MAX_SHORT_STRING: usize = u8::MAX as usize;
pub const HELLO_MAX_PAYLOAD_SIZE: usize = HELLO_MIN_PAYLOAD_SIZE + 2 * MAX_SHORT_STRING;

const _: () = assert!(HELLO_MAX_PAYLOAD_SIZE <= MAX_PAYLOAD);

// -- Plausibility limits --
pub const MAX_TRANSLATION: f64 = 100_000.0;
pub const MAX_ROTATION_DEG: f64 = 720.0;
pub const MAX_FOCAL_LENGTH: f64 = 5_000.0;

/// Device announcement sent as the first message of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u8,
    pub capabilities: Capabilities,
    pub token: Option<String>,
    pub device_name: String,
}

/// Bridge reply to a HELLO (or unsolicited, to refuse a connection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloAck {
    pub version: u8,
    pub status: HandshakeStatus,
    pub platform: String,
    pub plugin_version: [u8; 3],
}

/// A fully decoded device message.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    Hello(Hello),
    HelloAck(HelloAck),
    Pose(PoseFrame),
    Heartbeat,
    Goodbye,
}

/// Build an envelope around `payload`.
pub fn build_message(msg_type: u8, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= MAX_PAYLOAD);
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&MAGIC);
    buf.push(msg_type);
    buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub fn build_hello(hello: &Hello) -> Vec<u8> {
    let token = truncate_utf8(hello.token.as_deref().unwrap_or(""), MAX_SHORT_STRING).as_bytes();
    let name = truncate_utf8(&hello.device_name, MAX_SHORT_STRING).as_bytes();

    let mut payload = Vec::with_capacity(HELLO_MIN_PAYLOAD_SIZE + token.len() + name.len());
    payload.push(hello.version);
    payload.extend_from_slice(&hello.capabilities.bits().to_le_bytes());
    payload.push(token.len() as u8);
    payload.extend_from_slice(token);
    payload.push(name.len() as u8);
    payload.extend_from_slice(name);
    build_message(MSG_HELLO, &payload)
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a character.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Build a HELLO_ACK. The platform name is truncated/NUL-padded to 10 bytes.
pub fn build_hello_ack(status: HandshakeStatus, platform: &str) -> Vec<u8> {
    let mut payload = [0u8; HELLO_ACK_PAYLOAD_SIZE];
    payload[0] = PROTOCOL_VERSION;
    payload[1] = status as u8;
    let name = platform.as_bytes();
    let len = name.len().min(PLATFORM_FIELD_LEN);
    payload[2..2 + len].copy_from_slice(&name[..len]);
    payload[2 + PLATFORM_FIELD_LEN..].copy_from_slice(&PLUGIN_VERSION);
    build_message(MSG_HELLO_ACK, &payload)
}

pub fn build_pose(frame: &PoseFrame) -> Vec<u8> {
    let mut payload = Vec::with_capacity(POSE_PAYLOAD_SIZE);
    payload.extend_from_slice(&frame.sequence.to_le_bytes());
    payload.extend_from_slice(&frame.timestamp_us.to_le_bytes());
    for v in frame.translation.iter().chain(frame.rotation.iter()) {
        payload.extend_from_slice(&v.to_le_bytes());
    }
    payload.extend_from_slice(&frame.focal_length.to_le_bytes());
    build_message(MSG_POSE, &payload)
}

/// Build a TRANSFORM frame from a 4x4 matrix (translation in elements 12..14).
pub fn build_transform(
    sequence: u32,
    timestamp_us: u64,
    matrix: &[f32; 16],
    focal_length: f32,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(TRANSFORM_PAYLOAD_SIZE);
    payload.extend_from_slice(&sequence.to_le_bytes());
    payload.extend_from_slice(&timestamp_us.to_le_bytes());
    for v in matrix {
        payload.extend_from_slice(&v.to_le_bytes());
    }
    payload.extend_from_slice(&focal_length.to_le_bytes());
    build_message(MSG_TRANSFORM, &payload)
}

pub fn build_heartbeat() -> Vec<u8> {
    build_message(MSG_HEARTBEAT, &[])
}

pub fn build_goodbye() -> Vec<u8> {
    build_message(MSG_GOODBYE, &[])
}

/// Validate the envelope and return `(msg_type, payload)`.
///
/// `raw` must hold exactly one message.
pub fn split_envelope(raw: &[u8]) -> Result<(u8, &[u8]), DecodeError> {
    if raw.len() < HEADER_SIZE {
        return Err(DecodeError::Truncated {
            needed: HEADER_SIZE,
            available: raw.len(),
        });
    }
    if raw[0..2] != MAGIC {
        return Err(DecodeError::InvalidFormat(format!(
            "bad frame marker {:02x?}",
            &raw[0..2]
        )));
    }
    let msg_type = raw[2];
    let len = payload_len(raw);
    if len > MAX_PAYLOAD {
        return Err(DecodeError::InvalidFormat(format!(
            "payload length {} exceeds {}",
            len, MAX_PAYLOAD
        )));
    }
    let total = HEADER_SIZE + len;
    if raw.len() < total {
        return Err(DecodeError::Truncated {
            needed: total,
            available: raw.len(),
        });
    }
    if raw.len() > total {
        return Err(DecodeError::InvalidFormat(format!(
            "{} trailing bytes after message",
            raw.len() - total
        )));
    }
    Ok((msg_type, &raw[HEADER_SIZE..]))
}

/// Declared payload length of a buffer that holds at least a header.
pub fn payload_len(header: &[u8]) -> usize {
    u16::from_le_bytes([header[3], header[4]]) as usize
}

/// Decode one complete device message.
pub fn decode_message(raw: &[u8]) -> Result<DeviceMessage, DecodeError> {
    let (msg_type, payload) = split_envelope(raw)?;
    match msg_type {
        MSG_HELLO => parse_hello(payload).map(DeviceMessage::Hello),
        MSG_HELLO_ACK => parse_hello_ack(payload).map(DeviceMessage::HelloAck),
        MSG_POSE => parse_pose(payload).map(DeviceMessage::Pose),
        MSG_TRANSFORM => parse_transform(payload).map(DeviceMessage::Pose),
        MSG_HEARTBEAT => expect_empty(payload, "HEARTBEAT").map(|_| DeviceMessage::Heartbeat),
        MSG_GOODBYE => expect_empty(payload, "GOODBYE").map(|_| DeviceMessage::Goodbye),
        other => Err(DecodeError::InvalidFormat(format!(
            "unknown message type 0x{:02x}",
            other
        ))),
    }
}

fn expect_empty(payload: &[u8], what: &str) -> Result<(), DecodeError> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(DecodeError::InvalidFormat(format!(
            "{} carries {} unexpected payload bytes",
            what,
            payload.len()
        )))
    }
}

fn expect_size(payload: &[u8], size: usize, what: &str) -> Result<(), DecodeError> {
    if payload.len() < size {
        return Err(DecodeError::Truncated {
            needed: size,
            available: payload.len(),
        });
    }
    if payload.len() > size {
        return Err(DecodeError::InvalidFormat(format!(
            "{} payload is {} bytes, expected {}",
            what,
            payload.len(),
            size
        )));
    }
    Ok(())
}

/// Read a u8-length-prefixed UTF-8 string at `offset`, returning it and the next offset.
fn read_short_string(
    payload: &[u8],
    offset: usize,
    field: &str,
) -> Result<(String, usize), DecodeError> {
    let len = *payload.get(offset).ok_or(DecodeError::Truncated {
        needed: offset + 1,
        available: payload.len(),
    })? as usize;
    let start = offset + 1;
    let end = start + len;
    let bytes = payload.get(start..end).ok_or(DecodeError::Truncated {
        needed: end,
        available: payload.len(),
    })?;
    let s = std::str::from_utf8(bytes)
        .map_err(|_| DecodeError::InvalidFormat(format!("{} is not valid UTF-8", field)))?;
    Ok((s.to_string(), end))
}

pub fn parse_hello(payload: &[u8]) -> Result<Hello, DecodeError> {
    if payload.len() < HELLO_MIN_PAYLOAD_SIZE {
        return Err(DecodeError::Truncated {
            needed: HELLO_MIN_PAYLOAD_SIZE,
            available: payload.len(),
        });
    }
    let version = payload[0];
    let bits = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
    let capabilities = Capabilities::from_bits_truncate(bits);
    let (token, next) = read_short_string(payload, 5, "token")?;
    let (device_name, end) = read_short_string(payload, next, "device name")?;
    if end != payload.len() {
        return Err(DecodeError::InvalidFormat(format!(
            "{} trailing bytes in HELLO",
            payload.len() - end
        )));
    }
    Ok(Hello {
        version,
        capabilities,
        token: if token.is_empty() { None } else { Some(token) },
        device_name,
    })
}

pub fn parse_hello_ack(payload: &[u8]) -> Result<HelloAck, DecodeError> {
    expect_size(payload, HELLO_ACK_PAYLOAD_SIZE, "HELLO_ACK")?;
    let status = HandshakeStatus::from_u8(payload[1]).ok_or_else(|| {
        DecodeError::InvalidFormat(format!("unknown handshake status {}", payload[1]))
    })?;
    let platform = extract_string(&payload[2..2 + PLATFORM_FIELD_LEN]);
    let mut plugin_version = [0u8; 3];
    plugin_version.copy_from_slice(&payload[2 + PLATFORM_FIELD_LEN..]);
    Ok(HelloAck {
        version: payload[0],
        status,
        platform,
        plugin_version,
    })
}

/// Parse a POSE payload.
///
/// Layout:
/// - `[0..4]`: u32 sequence
/// - `[4..12]`: u64 timestamp (microseconds)
/// - `[12..68]`: f64 tx, ty, tz, rx, ry, rz, fl
pub fn parse_pose(payload: &[u8]) -> Result<PoseFrame, DecodeError> {
    expect_size(payload, POSE_PAYLOAD_SIZE, "POSE")?;
    let (sequence, timestamp_us) = read_stamp(payload);

    let mut values = [0f64; 7];
    for (i, v) in values.iter_mut().enumerate() {
        let off = 12 + i * 8;
        let mut b = [0u8; 8];
        b.copy_from_slice(&payload[off..off + 8]);
        *v = f64::from_le_bytes(b);
    }

    let frame = PoseFrame {
        sequence,
        translation: [values[0], values[1], values[2]],
        rotation: [values[3], values[4], values[5]],
        focal_length: values[6],
        timestamp_us,
    };
    validate_pose(&frame)?;
    Ok(frame)
}

/// Parse a TRANSFORM payload into a pose.
///
/// Layout:
/// - `[0..4]`: u32 sequence
/// - `[4..12]`: u64 timestamp (microseconds)
/// - `[12..76]`: 16x f32 transform matrix
/// - `[76..80]`: f32 focal length
pub fn parse_transform(payload: &[u8]) -> Result<PoseFrame, DecodeError> {
    expect_size(payload, TRANSFORM_PAYLOAD_SIZE, "TRANSFORM")?;
    let (sequence, timestamp_us) = read_stamp(payload);

    let mut m = [0f64; 16];
    for (i, v) in m.iter_mut().enumerate() {
        let off = 12 + i * 4;
        *v = read_f32(payload, off);
    }
    let focal_length = read_f32(payload, 76);

    // Non-finite matrix entries would otherwise vanish inside atan2.
    if let Some(bad) = m.iter().find(|v| !v.is_finite()) {
        return Err(DecodeError::OutOfRange {
            field: "matrix",
            value: *bad,
        });
    }

    let frame = PoseFrame {
        sequence,
        translation: [m[12], m[13], m[14]],
        rotation: transform_to_euler(&m),
        focal_length,
        timestamp_us,
    };
    validate_pose(&frame)?;
    Ok(frame)
}

fn read_f32(payload: &[u8], off: usize) -> f64 {
    f32::from_le_bytes([payload[off], payload[off + 1], payload[off + 2], payload[off + 3]]) as f64
}

fn read_stamp(payload: &[u8]) -> (u32, u64) {
    let sequence = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&payload[4..12]);
    (sequence, u64::from_le_bytes(ts))
}

/// Reject non-finite or implausible pose values.
pub fn validate_pose(frame: &PoseFrame) -> Result<(), DecodeError> {
    const TRANSLATION: [&str; 3] = ["tx", "ty", "tz"];
    const ROTATION: [&str; 3] = ["rx", "ry", "rz"];

    for (&field, &value) in TRANSLATION.iter().zip(frame.translation.iter()) {
        if !value.is_finite() || value.abs() > MAX_TRANSLATION {
            return Err(DecodeError::OutOfRange { field, value });
        }
    }
    for (&field, &value) in ROTATION.iter().zip(frame.rotation.iter()) {
        if !value.is_finite() || value.abs() > MAX_ROTATION_DEG {
            return Err(DecodeError::OutOfRange { field, value });
        }
    }
    let fl = frame.focal_length;
    if !fl.is_finite() || fl <= 0.0 || fl > MAX_FOCAL_LENGTH {
        return Err(DecodeError::OutOfRange {
            field: "fl",
            value: fl,
        });
    }
    Ok(())
}

/// Extract XYZ Euler angles in degrees from a 4x4 transform matrix.
///
/// Rotation terms are read from elements 0..2, 4..6 and 8..10. When
/// `|m[8]| >= 1` the pose is in gimbal lock: `ry` is pinned to +/-90 and `rz`
/// is folded into `rx`.
pub fn transform_to_euler(m: &[f64; 16]) -> [f64; 3] {
    let (rxx, ryx, ryy, ryz) = (m[0], m[4], m[5], m[6]);
    let (rzx, rzy, rzz) = (m[8], m[9], m[10]);

    let (rx, ry, rz) = if rzx.abs() >= 1.0 {
        let ry = std::f64::consts::FRAC_PI_2.copysign(-rzx);
        let rx = (-ryz).atan2(ryy);
        (rx, ry, 0.0)
    } else {
        let ry = (-rzx).asin();
        let rx = rzy.atan2(rzz);
        let rz = ryx.atan2(rxx);
        (rx, ry, rz)
    };
    [rx.to_degrees(), ry.to_degrees(), rz.to_degrees()]
}

/// Extract a NUL-terminated string from a byte slice.
pub fn extract_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).to_string()
}
