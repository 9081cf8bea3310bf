//! Device session lifecycle.
//!
//! One thread owns the listener and at most one device connection:
//!
//! ```text
//! LISTENING --accept--> HANDSHAKING --HELLO ok--> STREAMING
//!     ^                      |                        |
//!     |                 bad HELLO /              EOF / error /
//!     |                  timeout                 idle / GOODBYE
//!     |                      v                        v
//!     +--------------------------------------- CLOSING
//! ```
//!
//! Connections that arrive while a session is handshaking or streaming are
//! answered with HELLO_ACK(busy) and closed; the active session is never
//! preempted.

use crate::codec;
use crate::config::BridgeConfig;
use crate::error::{DecodeError, HandshakeError};
use crate::protocol::{
    self, Hello, MSG_GOODBYE, MSG_HEARTBEAT, MSG_HELLO, MSG_POSE, MSG_TRANSFORM,
};
use crate::scheduler::PublishScheduler;
use crate::transport::{self, DeviceConnection, ReadOutcome};
use crate::types::{BridgeStatus, Capabilities, HandshakeStatus, SessionEvent, SessionState};
use crate::Result;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

/// Shared, externally observable session status.
#[derive(Debug, Default)]
pub(crate) struct StatusBoard {
    inner: Mutex<BridgeStatus>,
}

impl StatusBoard {
    pub fn snapshot(&self) -> BridgeStatus {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn update<F: FnOnce(&mut BridgeStatus)>(&self, f: F) {
        f(&mut self.inner.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

/// Why a streaming session ended.
#[derive(Debug)]
enum SessionEnd {
    PeerClosed,
    Goodbye,
    IdleTimeout,
    Transport(io::Error),
    Cancelled,
}

pub struct SessionManager {
    listener: TcpListener,
    config: BridgeConfig,
    token: Option<String>,
    scheduler: Arc<PublishScheduler>,
    status: Arc<StatusBoard>,
}

impl SessionManager {
    /// Bind the session listener on `listen_host:listen_port`.
    pub(crate) fn bind(
        config: BridgeConfig,
        scheduler: Arc<PublishScheduler>,
        status: Arc<StatusBoard>,
    ) -> Result<SessionManager> {
        let listener = TcpListener::bind((config.listen_host, config.listen_port))?;
        listener.set_nonblocking(true)?;
        log::info!("Session listener bound on {}", listener.local_addr()?);
        Ok(SessionManager {
            listener,
            config,
            token: None,
            scheduler,
            status,
        })
    }

    /// Require devices to echo `token` in their HELLO.
    pub(crate) fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve device sessions until `stop` is set.
    ///
    /// Consumes the manager so the listener closes when this returns.
    pub fn run(self, stop: &AtomicBool) {
        log::info!("Session manager started");

        while let Some(stream) = self.accept_next(stop) {
            self.serve(stream, stop);
        }

        self.status.update(|s| {
            s.state = SessionState::Listening;
            s.peer = None;
            s.device_name = None;
        });
        log::info!("Session manager stopped");
    }

    /// LISTENING: wait for the next connection. `None` once cancelled.
    fn accept_next(&self, stop: &AtomicBool) -> Option<TcpStream> {
        self.status.update(|s| s.state = SessionState::Listening);
        let poll = self.config.poll_interval();
        loop {
            if stop.load(Ordering::Relaxed) {
                return None;
            }
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    log::info!("Connection from {}", addr);
                    return Some(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(poll),
                Err(e) => {
                    log::warn!("Accept failed: {}", e);
                    std::thread::sleep(poll);
                }
            }
        }
    }

    /// HANDSHAKING -> STREAMING -> CLOSING for one connection.
    fn serve(&self, stream: TcpStream, stop: &AtomicBool) {
        let mut conn = match DeviceConnection::new(stream, self.config.poll_interval()) {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("Failed to set up device socket: {}", e);
                return;
            }
        };
        let peer = conn.peer_addr();
        self.status.update(|s| {
            s.state = SessionState::Handshaking;
            s.peer = Some(peer);
        });

        let hello = match self.handshake(&mut conn, stop) {
            Ok(hello) => hello,
            Err(e) => {
                log::warn!("Handshake with {} failed: {}", peer, e);
                conn.shutdown();
                self.status.update(|s| {
                    s.sessions_rejected += 1;
                    s.peer = None;
                });
                return;
            }
        };

        log::info!(
            "Device '{}' at {} streaming (capabilities {:?})",
            hello.device_name,
            peer,
            hello.capabilities
        );
        self.scheduler.begin_session();
        self.status.update(|s| {
            s.state = SessionState::Streaming;
            s.device_name = Some(hello.device_name.clone());
            s.sessions_accepted += 1;
        });
        self.scheduler.publish_event(SessionEvent::Connected);

        let end = self.stream(&mut conn, stop);

        self.status.update(|s| s.state = SessionState::Closing);
        conn.shutdown();
        self.scheduler.end_session();
        self.scheduler.publish_event(SessionEvent::Disconnected);
        match &end {
            SessionEnd::Transport(e) => log::warn!("Session with {} lost: {}", peer, e),
            SessionEnd::IdleTimeout => log::warn!(
                "Session with {} idle for {:?}, dropping",
                peer,
                self.config.idle_timeout
            ),
            SessionEnd::PeerClosed => log::info!("Device at {} disconnected", peer),
            SessionEnd::Goodbye => log::info!("Device at {} said goodbye", peer),
            SessionEnd::Cancelled => log::info!("Closing session with {} for shutdown", peer),
        }
        self.status.update(|s| {
            s.peer = None;
            s.device_name = None;
        });
    }

    fn handshake(
        &self,
        conn: &mut DeviceConnection,
        stop: &AtomicBool,
    ) -> std::result::Result<Hello, HandshakeError> {
        let deadline = Instant::now() + self.config.handshake_timeout;
        loop {
            if let Some(next) = conn.next_frame() {
                let raw = next?;
                let (msg_type, payload) = protocol::split_envelope(&raw)?;
                if msg_type != MSG_HELLO {
                    return Err(HandshakeError::UnexpectedMessage(msg_type));
                }
                let hello = protocol::parse_hello(payload)?;
                return self.answer_hello(conn, hello);
            }
            if stop.load(Ordering::Relaxed) {
                return Err(HandshakeError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(HandshakeError::Timeout(self.config.handshake_timeout));
            }
            self.reject_intruders();
            if conn.poll()? == ReadOutcome::Closed {
                return Err(HandshakeError::PeerClosed);
            }
        }
    }

    /// Validate a HELLO and send the matching HELLO_ACK.
    fn answer_hello(
        &self,
        conn: &mut DeviceConnection,
        hello: Hello,
    ) -> std::result::Result<Hello, HandshakeError> {
        let (status, error) = if hello.version != protocol::PROTOCOL_VERSION {
            (
                HandshakeStatus::UnsupportedVersion,
                Some(HandshakeError::UnsupportedVersion(hello.version)),
            )
        } else if !hello.capabilities.contains(Capabilities::CAMERA_TRACKING) {
            (
                HandshakeStatus::MissingCapabilities,
                Some(HandshakeError::MissingCapabilities(
                    Capabilities::CAMERA_TRACKING - hello.capabilities,
                )),
            )
        } else if self.token.is_some() && hello.token != self.token {
            (
                HandshakeStatus::TokenMismatch,
                Some(HandshakeError::TokenMismatch),
            )
        } else {
            (HandshakeStatus::Accepted, None)
        };

        let ack = protocol::build_hello_ack(status, &self.config.platform_name);
        let sent = conn.send(&ack);
        if let Some(e) = error {
            return Err(e);
        }
        sent?;
        Ok(hello)
    }

    fn stream(&self, conn: &mut DeviceConnection, stop: &AtomicBool) -> SessionEnd {
        let peer = conn.peer_addr();
        let mut last_activity = Instant::now();
        loop {
            while let Some(next) = conn.next_frame() {
                match next {
                    Ok(raw) => {
                        if let Some(end) = self.handle_message(&raw, peer) {
                            return end;
                        }
                    }
                    Err(e) => self.drop_frame(peer, &e),
                }
            }
            if stop.load(Ordering::Relaxed) {
                return SessionEnd::Cancelled;
            }
            self.reject_intruders();

            match conn.poll() {
                Ok(ReadOutcome::Data(_)) => last_activity = Instant::now(),
                Ok(ReadOutcome::Idle) => {
                    if last_activity.elapsed() >= self.config.idle_timeout {
                        return SessionEnd::IdleTimeout;
                    }
                }
                Ok(ReadOutcome::Closed) => return SessionEnd::PeerClosed,
                Err(e) => return SessionEnd::Transport(e),
            }
        }
    }

    /// Handle one complete message while streaming.
    fn handle_message(&self, raw: &[u8], peer: SocketAddr) -> Option<SessionEnd> {
        match raw[2] {
            MSG_POSE | MSG_TRANSFORM => match codec::decode(raw) {
                Ok(frame) => {
                    self.scheduler.submit(frame);
                    self.status.update(|s| {
                        s.frames_received += 1;
                        s.last_frame_at = Some(SystemTime::now());
                        s.last_frame_sequence = Some(frame.sequence);
                    });
                    log::debug!(
                        "seq={} t=[{:.3}, {:.3}, {:.3}] r=[{:.2}, {:.2}, {:.2}] fl={:.1}",
                        frame.sequence,
                        frame.translation[0],
                        frame.translation[1],
                        frame.translation[2],
                        frame.rotation[0],
                        frame.rotation[1],
                        frame.rotation[2],
                        frame.focal_length
                    );
                }
                Err(e) => self.drop_frame(peer, &e),
            },
            MSG_HEARTBEAT => log::trace!("Heartbeat from {}", peer),
            MSG_GOODBYE => return Some(SessionEnd::Goodbye),
            other => self.drop_frame(
                peer,
                &DecodeError::InvalidFormat(format!(
                    "unexpected message type 0x{:02x} while streaming",
                    other
                )),
            ),
        }
        None
    }

    fn drop_frame(&self, peer: SocketAddr, err: &DecodeError) {
        log::warn!("Dropping frame from {}: {}", peer, err);
        self.status.update(|s| s.frames_dropped += 1);
    }

    /// Refuse every pending connection; only one device may be active.
    fn reject_intruders(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    log::warn!("Refusing {}: a device session is already active", addr);
                    transport::reject_busy(stream, &self.config.platform_name);
                    self.status.update(|s| s.sessions_rejected += 1);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("Accept while busy failed: {}", e);
                    break;
                }
            }
        }
    }
}
