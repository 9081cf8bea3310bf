//! Frame codec: device pose messages in, engine datagrams out.
//!
//! Pure functions, no shared state.

use crate::error::{DecodeError, PublishError};
use crate::protocol::{self, MSG_POSE, MSG_TRANSFORM};
use crate::types::{PoseFrame, SessionEvent};
use serde::{Deserialize, Serialize};

/// Downstream pose record. Field names are the engine-side contract.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoseRecord {
    pub tx: f64,
    pub ty: f64,
    pub tz: f64,
    pub rx: f64,
    pub ry: f64,
    pub rz: f64,
    pub fl: f64,
}

impl From<&PoseFrame> for PoseRecord {
    fn from(f: &PoseFrame) -> Self {
        PoseRecord {
            tx: f.translation[0],
            ty: f.translation[1],
            tz: f.translation[2],
            rx: f.rotation[0],
            ry: f.rotation[1],
            rz: f.rotation[2],
            fl: f.focal_length,
        }
    }
}

/// Downstream connection status record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub connected: bool,
    pub event: String,
}

impl From<SessionEvent> for EventRecord {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::Connected => EventRecord {
                connected: true,
                event: "connected".into(),
            },
            SessionEvent::Disconnected => EventRecord {
                connected: false,
                event: "disconnected".into(),
            },
        }
    }
}

/// Decode one complete device pose message (POSE or TRANSFORM).
pub fn decode(raw: &[u8]) -> Result<PoseFrame, DecodeError> {
    let (msg_type, payload) = protocol::split_envelope(raw)?;
    match msg_type {
        MSG_POSE => protocol::parse_pose(payload),
        MSG_TRANSFORM => protocol::parse_transform(payload),
        other => Err(DecodeError::InvalidFormat(format!(
            "message type 0x{:02x} is not a pose frame",
            other
        ))),
    }
}

/// Encode a frame as one self-contained engine datagram.
pub fn encode(frame: &PoseFrame) -> Result<Vec<u8>, PublishError> {
    Ok(serde_json::to_vec(&PoseRecord::from(frame))?)
}

/// Encode a frame in the device's POSE wire format.
pub fn encode_device(frame: &PoseFrame) -> Vec<u8> {
    protocol::build_pose(frame)
}

/// Parse an engine datagram back into its record.
pub fn decode_datagram(datagram: &[u8]) -> Result<PoseRecord, DecodeError> {
    serde_json::from_slice(datagram).map_err(|e| DecodeError::InvalidFormat(e.to_string()))
}

pub fn encode_event(event: SessionEvent) -> Result<Vec<u8>, PublishError> {
    Ok(serde_json::to_vec(&EventRecord::from(event))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame(seq: u32) -> PoseFrame {
        PoseFrame {
            sequence: seq,
            translation: [1.0, 2.0, 3.0],
            rotation: [0.0, 0.0, 0.0],
            focal_length: 35.0,
            timestamp_us: 42,
        }
    }

    #[test]
    fn test_encode_has_exactly_seven_named_fields() {
        let datagram = encode(&frame(1)).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&datagram).unwrap();
        let obj = value.as_object().unwrap();

        let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["fl", "rx", "ry", "rz", "tx", "ty", "tz"]);
        assert_eq!(obj["tx"], 1.0);
        assert_eq!(obj["ty"], 2.0);
        assert_eq!(obj["tz"], 3.0);
        assert_eq!(obj["fl"], 35.0);
    }

    #[test]
    fn test_decode_rejects_non_pose_messages() {
        let err = decode(&protocol::build_heartbeat()).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidFormat(_)));
    }

    #[test]
    fn test_decode_datagram_rejects_extra_fields() {
        let err = decode_datagram(
            br#"{"tx":0,"ty":0,"tz":0,"rx":0,"ry":0,"rz":0,"fl":35,"connected":true}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DecodeError::InvalidFormat(_)));
    }

    #[test]
    fn test_encode_event() {
        let connected: serde_json::Value =
            serde_json::from_slice(&encode_event(SessionEvent::Connected).unwrap()).unwrap();
        assert_eq!(connected, serde_json::json!({"connected": true, "event": "connected"}));

        let gone: serde_json::Value =
            serde_json::from_slice(&encode_event(SessionEvent::Disconnected).unwrap()).unwrap();
        assert_eq!(gone, serde_json::json!({"connected": false, "event": "disconnected"}));
    }

    fn arb_frame() -> impl Strategy<Value = PoseFrame> {
        let t = -protocol::MAX_TRANSLATION..=protocol::MAX_TRANSLATION;
        let r = -protocol::MAX_ROTATION_DEG..=protocol::MAX_ROTATION_DEG;
        (
            any::<u32>(),
            [t.clone(), t.clone(), t],
            [r.clone(), r.clone(), r],
            0.001f64..=protocol::MAX_FOCAL_LENGTH,
            any::<u64>(),
        )
            .prop_map(|(sequence, translation, rotation, focal_length, timestamp_us)| PoseFrame {
                sequence,
                translation,
                rotation,
                focal_length,
                timestamp_us,
            })
    }

    proptest! {
        #[test]
        fn prop_device_round_trip(f in arb_frame()) {
            prop_assert_eq!(decode(&encode_device(&f)).unwrap(), f);
        }

        #[test]
        fn prop_datagram_round_trip(f in arb_frame()) {
            let datagram = encode(&f).unwrap();
            prop_assert_eq!(decode_datagram(&datagram).unwrap(), PoseRecord::from(&f));
        }
    }
}
