use crate::config::BridgeConfig;
use crate::pairing;
use crate::scheduler::{PublishScheduler, PublishTimer, Publisher, UdpPublisher};
use crate::session::{SessionManager, StatusBoard};
use crate::types::{BridgeStatus, PairingDescriptor};
use crate::{BridgeError, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A running bridge: session listener, publish timer and pairing descriptor.
///
/// Dropping the bridge stops it.
pub struct Bridge {
    pairing: PairingDescriptor,
    local_addr: SocketAddr,
    scheduler: Arc<PublishScheduler>,
    status: Arc<StatusBoard>,
    timer: Option<PublishTimer>,
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Bridge {
    /// Start a bridge publishing over UDP to `publish_host:publish_port`.
    pub fn start(config: BridgeConfig) -> Result<Bridge> {
        config.validate()?;
        let publisher = UdpPublisher::connect(&config.publish_host, config.publish_port)?;
        log::info!("Publishing to udp://{}", publisher.target());
        Self::start_with_publisher(config, Box::new(publisher))
    }

    /// Start a bridge with a caller-supplied outbound channel.
    pub fn start_with_publisher(
        config: BridgeConfig,
        publisher: Box<dyn Publisher>,
    ) -> Result<Bridge> {
        config.validate()?;

        let scheduler = Arc::new(PublishScheduler::new(publisher));
        let status = Arc::new(StatusBoard::default());

        // Pairing needs the bound port, so the listener goes first.
        let manager = SessionManager::bind(config.clone(), scheduler.clone(), status.clone())?;
        let local_addr = manager.local_addr()?;
        let pairing = pairing::describe_port(&config, local_addr.port())?;
        let manager = manager.with_token(pairing.token.clone());

        let timer = PublishTimer::start(scheduler.clone(), config.publish_interval())?;

        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_clone = stop_flag.clone();
        let thread = std::thread::Builder::new()
            .name("vcam-session".into())
            .spawn(move || manager.run(&stop_clone))
            .map_err(|e| BridgeError::Thread("session", e))?;

        log::info!(
            "Bridge started: listening on {}, {} Hz",
            local_addr,
            config.target_rate_hz
        );

        Ok(Bridge {
            pairing,
            local_addr,
            scheduler,
            status,
            timer: Some(timer),
            stop_flag,
            thread: Some(thread),
        })
    }

    /// Descriptor to hand to the device out-of-band.
    pub fn pairing(&self) -> &PairingDescriptor {
        &self.pairing
    }

    /// Address the session listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn status(&self) -> BridgeStatus {
        let mut status = self.status.snapshot();
        let stats = self.scheduler.stats();
        status.frames_stale = stats.stale;
        status.frames_published = stats.published;
        status.publish_errors = stats.publish_errors;
        status
    }

    /// Stop the bridge and wait for both threads to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Session thread panicked");
            }
        }
        if let Some(timer) = self.timer.take() {
            timer.stop();
            log::info!("Bridge stopped");
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests::RecordingPublisher;
    use crate::types::SessionState;
    use std::net::{IpAddr, Ipv4Addr, TcpStream};
    use std::time::{Duration, Instant};

    fn loopback_config() -> BridgeConfig {
        BridgeConfig {
            listen_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: 0,
            advertise_host: Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50))),
            ..Default::default()
        }
    }

    #[test]
    fn test_pairing_advertises_bound_port() {
        let bridge =
            Bridge::start_with_publisher(loopback_config(), Box::new(RecordingPublisher::default()))
                .unwrap();
        let port = bridge.local_addr().port();
        assert_ne!(port, 0);
        assert_eq!(bridge.pairing().port, port);
        assert_eq!(
            bridge.pairing().payload(),
            format!("vcam://192.168.1.50:{}", port)
        );
        assert_eq!(bridge.status().state, SessionState::Listening);
    }

    #[test]
    fn test_invalid_rate_is_rejected() {
        let config = BridgeConfig {
            target_rate_hz: 0.0,
            ..loopback_config()
        };
        let result = Bridge::start_with_publisher(config, Box::new(RecordingPublisher::default()));
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_unreachable_listener_fails_startup() {
        let config = BridgeConfig {
            advertise_host: None,
            ..loopback_config()
        };
        let result = Bridge::start_with_publisher(config, Box::new(RecordingPublisher::default()));
        assert!(matches!(result, Err(BridgeError::AddressResolution(_))));
    }

    #[test]
    fn test_stop_releases_listener() {
        let bridge =
            Bridge::start_with_publisher(loopback_config(), Box::new(RecordingPublisher::default()))
                .unwrap();
        let addr = bridge.local_addr();
        let started = Instant::now();
        bridge.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_err());
    }
}
