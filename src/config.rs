//! Bridge configuration.
//!
//! The core only consumes a resolved [`BridgeConfig`]. Defaults match the
//! stock VirtuCamera/TouchDesigner setup; [`BridgeConfig::from_env`] overlays
//! `VCAM_*` environment variables for deployments without a config layer.

use crate::{BridgeError, Result};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

pub const DEFAULT_LISTEN_PORT: u16 = 23354;
pub const DEFAULT_PUBLISH_HOST: &str = "127.0.0.1";
pub const DEFAULT_PUBLISH_PORT: u16 = 7000;
pub const DEFAULT_RATE_HZ: f64 = 60.0;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_PLATFORM_NAME: &str = "TD-Bridge";

/// The device shows at most this many bytes of the platform name.
pub const MAX_PLATFORM_NAME_LEN: usize = 10;

/// Upper bound on how long a blocking socket call may hold the session thread
/// before it re-checks the stop flag and idle deadline.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// Interface the session listener binds.
    pub listen_host: IpAddr,
    /// TCP port the session listener binds. 0 picks an ephemeral port.
    pub listen_port: u16,
    /// UDP target host for republished frames.
    pub publish_host: String,
    pub publish_port: u16,
    /// Outbound cadence.
    pub target_rate_hz: f64,
    /// A streaming session with no inbound bytes for this long is dropped.
    pub idle_timeout: Duration,
    /// Maximum time between accept and a valid HELLO.
    pub handshake_timeout: Duration,
    /// Address put in the pairing code. Auto-detected when `None`.
    pub advertise_host: Option<IpAddr>,
    /// Generate a pairing token and require devices to echo it.
    pub require_token: bool,
    /// Name reported to the device in HELLO_ACK.
    pub platform_name: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: DEFAULT_LISTEN_PORT,
            publish_host: DEFAULT_PUBLISH_HOST.to_string(),
            publish_port: DEFAULT_PUBLISH_PORT,
            target_rate_hz: DEFAULT_RATE_HZ,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            advertise_host: None,
            require_token: false,
            platform_name: DEFAULT_PLATFORM_NAME.to_string(),
        }
    }
}

impl BridgeConfig {
    /// Defaults overlaid with `VCAM_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen_host: read_env_parse("VCAM_LISTEN_HOST", defaults.listen_host),
            listen_port: read_env_parse("VCAM_LISTEN_PORT", defaults.listen_port),
            publish_host: read_env_string("VCAM_PUBLISH_HOST", &defaults.publish_host),
            publish_port: read_env_parse("VCAM_PUBLISH_PORT", defaults.publish_port),
            target_rate_hz: read_env_parse("VCAM_RATE_HZ", defaults.target_rate_hz),
            idle_timeout: read_env_millis("VCAM_IDLE_TIMEOUT_MS", defaults.idle_timeout),
            handshake_timeout: read_env_millis(
                "VCAM_HANDSHAKE_TIMEOUT_MS",
                defaults.handshake_timeout,
            ),
            advertise_host: std::env::var("VCAM_ADVERTISE_HOST")
                .ok()
                .and_then(|v| match v.trim().parse::<IpAddr>() {
                    Ok(ip) => Some(ip),
                    Err(_) => {
                        log::warn!("Ignoring VCAM_ADVERTISE_HOST='{}' (not an IP address)", v);
                        None
                    }
                }),
            require_token: read_env_bool("VCAM_REQUIRE_TOKEN", defaults.require_token),
            platform_name: read_env_string("VCAM_PLATFORM", &defaults.platform_name),
        }
    }

    /// Reject values the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.target_rate_hz.is_finite() || self.target_rate_hz <= 0.0 {
            return Err(BridgeError::Config(format!(
                "target_rate_hz must be positive, got {}",
                self.target_rate_hz
            )));
        }
        if self.target_rate_hz > 1000.0 {
            return Err(BridgeError::Config(format!(
                "target_rate_hz above 1000 Hz is not supported, got {}",
                self.target_rate_hz
            )));
        }
        if self.idle_timeout.is_zero() {
            return Err(BridgeError::Config("idle_timeout must be non-zero".into()));
        }
        if self.handshake_timeout.is_zero() {
            return Err(BridgeError::Config("handshake_timeout must be non-zero".into()));
        }
        if self.publish_host.trim().is_empty() {
            return Err(BridgeError::Config("publish_host must not be empty".into()));
        }
        if self.publish_port == 0 {
            return Err(BridgeError::Config("publish_port must be non-zero".into()));
        }
        if self.platform_name.len() > MAX_PLATFORM_NAME_LEN {
            return Err(BridgeError::Config(format!(
                "platform_name '{}' exceeds {} bytes",
                self.platform_name, MAX_PLATFORM_NAME_LEN
            )));
        }
        Ok(())
    }

    /// Interval between scheduler ticks.
    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.target_rate_hz)
    }

    /// Read timeout used by the session thread between stop/idle checks.
    pub fn poll_interval(&self) -> Duration {
        (self.idle_timeout / 4)
            .min(MAX_POLL_INTERVAL)
            .max(Duration::from_millis(1))
    }
}

fn read_env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| {
            let v = v.trim().to_ascii_lowercase();
            match v.as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            }
        })
        .unwrap_or(default)
}

fn read_env_parse<T>(name: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display,
{
    match std::env::var(name) {
        Ok(v) => match v.trim().parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                log::warn!("Ignoring {}='{}', using {}", name, v, default);
                default
            }
        },
        Err(_) => default,
    }
}

fn read_env_millis(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(v) => match v.trim().parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                log::warn!("Ignoring {}='{}', using {:?}", name, v, default);
                default
            }
        },
        Err(_) => default,
    }
}

fn read_env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}
