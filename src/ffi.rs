//! C FFI layer for the bridge.
//!
//! Opaque handle-based API for hosts that embed the bridge in-process
//! (e.g. a TouchDesigner C++ operator). The generated C header is written to
//! `include/vcam_bridge.h` by cbindgen.

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::error::LastError;
use crate::types::SessionState;
use crate::BridgeError;
use std::ffi::{c_char, c_int, CStr, CString};
use std::time::{Duration, UNIX_EPOCH};

/// Last error message for C consumers.
static LAST_ERROR: LastError = LastError::new();

/// Opaque bridge handle for C consumers.
pub struct VcbBridge {
    bridge: Bridge,
    pairing_payload: CString,
}

/// Startup options in C-compatible layout.
///
/// Options not listed here keep their `VCAM_*` environment or default values.
#[repr(C)]
pub struct VcbConfig {
    /// TCP port for device sessions. 0 picks an ephemeral port.
    pub listen_port: u16,
    /// Null-terminated UDP target host, or NULL for the default.
    pub publish_host: *const c_char,
    pub publish_port: u16,
    /// Outbound cadence in Hz.
    pub target_rate_hz: f64,
    /// Idle timeout in milliseconds.
    pub idle_timeout_ms: u32,
    /// Generate a pairing token and require devices to echo it.
    pub require_token: bool,
}

/// Bridge status in C-compatible layout.
#[repr(C)]
pub struct VcbStatus {
    /// 0 = listening, 1 = handshaking, 2 = streaming, 3 = closing.
    pub state: c_int,
    /// Host time of the last valid frame in microseconds since the Unix epoch, 0 if none.
    pub last_frame_unix_us: u64,
    /// Sequence of the last valid frame. Only meaningful if `last_frame_unix_us != 0`.
    pub last_frame_sequence: u32,
    pub sessions_accepted: u64,
    pub sessions_rejected: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub frames_stale: u64,
    pub frames_published: u64,
    pub publish_errors: u64,
}

fn state_code(state: SessionState) -> c_int {
    match state {
        SessionState::Listening => 0,
        SessionState::Handshaking => 1,
        SessionState::Streaming => 2,
        SessionState::Closing => 3,
    }
}

unsafe fn config_from_c(config: *const VcbConfig) -> Result<BridgeConfig, BridgeError> {
    let mut resolved = BridgeConfig::from_env();
    if config.is_null() {
        return Ok(resolved);
    }
    let config = &*config;
    resolved.listen_port = config.listen_port;
    if !config.publish_host.is_null() {
        resolved.publish_host = CStr::from_ptr(config.publish_host)
            .to_str()
            .map_err(|_| BridgeError::Config("publish_host is not valid UTF-8".into()))?
            .to_string();
    }
    resolved.publish_port = config.publish_port;
    resolved.target_rate_hz = config.target_rate_hz;
    resolved.idle_timeout = Duration::from_millis(config.idle_timeout_ms as u64);
    resolved.require_token = config.require_token;
    Ok(resolved)
}

/// Start a bridge.
/// `config` may be NULL to use `VCAM_*` environment variables and defaults.
/// Returns NULL on error (check vcb_last_error()).
///
/// # Safety
/// `config` must point to a valid `VcbConfig`, or be null.
#[no_mangle]
pub unsafe extern "C" fn vcb_bridge_start(config: *const VcbConfig) -> *mut VcbBridge {
    let started = config_from_c(config).and_then(Bridge::start).and_then(|bridge| {
        let pairing_payload = CString::new(bridge.pairing().payload())
            .map_err(|_| BridgeError::Config("pairing payload contains NUL".into()))?;
        Ok(VcbBridge {
            bridge,
            pairing_payload,
        })
    });
    match started {
        Ok(handle) => {
            LAST_ERROR.clear();
            Box::into_raw(Box::new(handle))
        }
        Err(e) => {
            LAST_ERROR.set(&e);
            std::ptr::null_mut()
        }
    }
}

/// Get the pairing payload (e.g. `vcam://192.168.1.20:23354`) to render as a
/// scannable code. Valid for the lifetime of the bridge.
///
/// # Safety
/// `bridge` must be a valid bridge pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn vcb_bridge_pairing_payload(bridge: *const VcbBridge) -> *const c_char {
    if bridge.is_null() {
        return std::ptr::null();
    }
    let bridge = &*bridge;
    bridge.pairing_payload.as_ptr()
}

/// Fill `out` with the current status.
/// Returns 0 on success, -1 if a pointer is null.
///
/// # Safety
/// `bridge` and `out` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn vcb_bridge_status(bridge: *const VcbBridge, out: *mut VcbStatus) -> c_int {
    if bridge.is_null() || out.is_null() {
        return -1;
    }
    let status = (*bridge).bridge.status();
    let last_frame_unix_us = status
        .last_frame_at
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    out.write(VcbStatus {
        state: state_code(status.state),
        last_frame_unix_us,
        last_frame_sequence: status.last_frame_sequence.unwrap_or(0),
        sessions_accepted: status.sessions_accepted,
        sessions_rejected: status.sessions_rejected,
        frames_received: status.frames_received,
        frames_dropped: status.frames_dropped,
        frames_stale: status.frames_stale,
        frames_published: status.frames_published,
        publish_errors: status.publish_errors,
    });
    0
}

/// Stop a bridge and free its resources.
///
/// # Safety
/// `bridge` must be a pointer returned by `vcb_bridge_start`, or null.
#[no_mangle]
pub unsafe extern "C" fn vcb_bridge_stop(bridge: *mut VcbBridge) {
    if !bridge.is_null() {
        drop(Box::from_raw(bridge));
    }
}

/// Get the last error message. Returns NULL if no error.
/// The returned pointer is valid until the next vcb_bridge_start call.
#[no_mangle]
pub extern "C" fn vcb_last_error() -> *const c_char {
    LAST_ERROR.as_ptr()
}
