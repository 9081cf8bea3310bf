//! # vcam-bridge - camera pose bridge for VirtuCamera-style devices
//!
//! Accepts one phone/tablet tracking session over TCP and republishes its
//! camera pose to a 3D engine (TouchDesigner, Blender, ...) as UDP datagrams
//! at a fixed rate. Provides:
//! - Pairing descriptor generation for out-of-band (QR code) delivery
//! - Device framing, handshake and pose decoding with range checks
//! - Single-slot latest-value republishing at `target_rate_hz`
//! - C FFI for embedding in a host application
//!
//! ## Quick Start
//! ```no_run
//! use vcam_bridge::{Bridge, BridgeConfig};
//! use std::time::Duration;
//!
//! let bridge = Bridge::start(BridgeConfig::from_env()).unwrap();
//! println!("Scan: {}", bridge.pairing().payload());
//!
//! loop {
//!     std::thread::sleep(Duration::from_secs(1));
//!     println!("state: {}", bridge.status().state);
//! }
//! ```

pub mod error;
pub mod types;
pub mod config;
pub mod protocol;
pub mod codec;
pub mod transport;
pub mod pairing;
pub mod scheduler;
pub mod session;
pub mod bridge;
pub mod ffi;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use error::{BridgeError, DecodeError, HandshakeError, PublishError};
pub use scheduler::{PublishScheduler, Publisher, UdpPublisher};
pub use types::*;

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
