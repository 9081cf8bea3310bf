//! Simulated tracking device: handshakes with a bridge and streams an
//! orbiting camera at 120 Hz.
//!
//! Usage: cargo run --example fake_device [vcam://host:port[?token=...]]

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};
use vcam_bridge::protocol::{self, DeviceMessage, Hello, HEADER_SIZE, HELLO_ACK_PAYLOAD_SIZE};
use vcam_bridge::{Capabilities, HandshakeStatus, PairingDescriptor, PoseFrame};

const FRAME_INTERVAL: Duration = Duration::from_micros(8_333);
const RADIUS: f64 = 3.0;

fn main() {
    env_logger::init();

    let payload = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "vcam://127.0.0.1:23354".into());
    let pairing: PairingDescriptor = match payload.parse() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Bad pairing payload '{}': {}", payload, e);
            std::process::exit(1);
        }
    };

    let mut stream = match TcpStream::connect(pairing.socket_addr()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to connect to {}: {}", pairing.socket_addr(), e);
            std::process::exit(1);
        }
    };

    let hello = Hello {
        version: protocol::PROTOCOL_VERSION,
        capabilities: Capabilities::CAMERA_TRACKING
            | Capabilities::FOCAL_LENGTH
            | Capabilities::HEARTBEAT,
        token: pairing.token.clone(),
        device_name: "fake-device".into(),
    };
    let mut ack = [0u8; HEADER_SIZE + HELLO_ACK_PAYLOAD_SIZE];
    let handshake = stream
        .write_all(&protocol::build_hello(&hello))
        .and_then(|_| stream.read_exact(&mut ack));
    if let Err(e) = handshake {
        eprintln!("Handshake I/O failed: {}", e);
        std::process::exit(1);
    }
    match protocol::decode_message(&ack) {
        Ok(DeviceMessage::HelloAck(a)) if a.status == HandshakeStatus::Accepted => {
            println!("Connected to '{}' (plugin {:?})", a.platform, a.plugin_version);
        }
        Ok(DeviceMessage::HelloAck(a)) => {
            eprintln!("Bridge refused session: {:?}", a.status);
            std::process::exit(1);
        }
        other => {
            eprintln!("Unexpected handshake reply: {:?}", other);
            std::process::exit(1);
        }
    }

    println!("Streaming (Ctrl+C to stop)...");
    let start = Instant::now();
    let mut sequence: u32 = 0;
    loop {
        sequence += 1;
        let t = start.elapsed().as_secs_f64();
        let angle = t * 0.5;
        let frame = PoseFrame {
            sequence,
            translation: [RADIUS * angle.cos(), 1.5, RADIUS * angle.sin()],
            rotation: [-10.0, -angle.to_degrees() % 360.0, 0.0],
            focal_length: 35.0,
            timestamp_us: start.elapsed().as_micros() as u64,
        };
        let mut bytes = protocol::build_pose(&frame);
        if sequence % 120 == 0 {
            bytes.extend(protocol::build_heartbeat());
        }
        if let Err(e) = stream.write_all(&bytes) {
            eprintln!("Bridge connection lost: {}", e);
            break;
        }
        std::thread::sleep(FRAME_INTERVAL);
    }
}
