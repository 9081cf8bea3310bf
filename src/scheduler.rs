//! Rate-controlled republishing.
//!
//! The session thread hands frames to [`PublishScheduler::submit`]; the timer
//! thread calls [`PublishScheduler::tick`] at `target_rate_hz`. The two meet in
//! a single-slot "latest value" exchange, so memory stays O(1) no matter how
//! fast the device sends:
//!
//! - faster than the target rate: last write wins, older poses are dropped
//! - slower than the target rate: ticks with no new frame send nothing
//! - a frame whose sequence is not above the last accepted one is discarded

use crate::codec;
use crate::error::PublishError;
use crate::types::{PoseFrame, SessionEvent};
use crate::{BridgeError, Result};
use crossbeam_channel::{select, Sender};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

/// Outbound datagram channel.
pub trait Publisher: Send + Sync {
    /// Send one complete datagram. Fire-and-forget, no acknowledgement.
    fn send(&self, datagram: &[u8]) -> std::result::Result<(), PublishError>;
}

/// UDP unicast to the engine.
pub struct UdpPublisher {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpPublisher {
    /// Resolve `host:port` and bind an ephemeral local socket of the same family.
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let target = (host, port)
            .to_socket_addrs()
            .map_err(|e| BridgeError::Config(format!("cannot resolve {}:{}: {}", host, port, e)))?
            .next()
            .ok_or_else(|| BridgeError::Config(format!("{}:{} resolved to nothing", host, port)))?;
        let bind_addr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr)?;
        Ok(Self { socket, target })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl Publisher for UdpPublisher {
    fn send(&self, datagram: &[u8]) -> std::result::Result<(), PublishError> {
        let sent = self
            .socket
            .send_to(datagram, self.target)
            .map_err(|source| PublishError::Send {
                target: self.target,
                source,
            })?;
        if sent != datagram.len() {
            return Err(PublishError::ShortSend {
                target: self.target,
                sent,
                len: datagram.len(),
            });
        }
        Ok(())
    }
}

/// What `submit` did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// Sequence not above the last accepted one; discarded.
    Stale,
}

/// What a `tick` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing new since the previous tick.
    Idle,
    /// Sent the frame with this sequence.
    Published(u32),
    /// Had a frame but the send failed; it is not retried.
    Failed(u32),
}

#[derive(Debug, Default)]
struct Slot {
    pending: Option<PoseFrame>,
    last_accepted: Option<u32>,
    last_emitted: Option<u32>,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    stale: AtomicU64,
    published: AtomicU64,
    publish_errors: AtomicU64,
}

/// Scheduler counters for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub accepted: u64,
    pub stale: u64,
    pub published: u64,
    pub publish_errors: u64,
}

pub struct PublishScheduler {
    slot: Mutex<Slot>,
    publisher: Box<dyn Publisher>,
    counters: Counters,
}

impl PublishScheduler {
    pub fn new(publisher: Box<dyn Publisher>) -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            publisher,
            counters: Counters::default(),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Offer a frame for the next tick. Never blocks on I/O.
    pub fn submit(&self, frame: PoseFrame) -> SubmitOutcome {
        let mut slot = self.slot();
        if slot.last_accepted.is_some_and(|last| frame.sequence <= last) {
            drop(slot);
            self.counters.stale.fetch_add(1, Ordering::Relaxed);
            log::debug!("Discarding stale frame seq={}", frame.sequence);
            return SubmitOutcome::Stale;
        }
        slot.last_accepted = Some(frame.sequence);
        slot.pending = Some(frame);
        drop(slot);
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        SubmitOutcome::Accepted
    }

    /// Emit the latest accepted frame, if any arrived since the last tick.
    pub fn tick(&self) -> TickOutcome {
        let frame = {
            let mut slot = self.slot();
            let Some(frame) = slot.pending.take() else {
                return TickOutcome::Idle;
            };
            if slot.last_emitted.is_some_and(|last| frame.sequence <= last) {
                return TickOutcome::Idle;
            }
            slot.last_emitted = Some(frame.sequence);
            frame
        };

        let result = codec::encode(&frame).and_then(|datagram| self.publisher.send(&datagram));
        match result {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                log::trace!("Published seq={}", frame.sequence);
                TickOutcome::Published(frame.sequence)
            }
            Err(e) => {
                self.counters.publish_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("Publish of seq={} failed: {}", frame.sequence, e);
                TickOutcome::Failed(frame.sequence)
            }
        }
    }

    /// Reset ordering state for a new device session.
    pub fn begin_session(&self) {
        *self.slot() = Slot::default();
    }

    /// Drop any frame not yet published so nothing stale goes out after disconnect.
    pub fn end_session(&self) {
        self.slot().pending = None;
    }

    /// Send a connection event immediately, outside the tick cadence.
    pub fn publish_event(&self, event: SessionEvent) {
        let result = codec::encode_event(event).and_then(|datagram| self.publisher.send(&datagram));
        if let Err(e) = result {
            self.counters.publish_errors.fetch_add(1, Ordering::Relaxed);
            log::warn!("Failed to publish {:?} event: {}", event, e);
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            stale: self.counters.stale.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
            publish_errors: self.counters.publish_errors.load(Ordering::Relaxed),
        }
    }
}

/// Timer thread driving [`PublishScheduler::tick`] at a fixed interval.
pub struct PublishTimer {
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PublishTimer {
    pub fn start(scheduler: Arc<PublishScheduler>, interval: Duration) -> Result<PublishTimer> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);

        let thread = std::thread::Builder::new()
            .name("vcam-publish".into())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(interval);
                log::info!("Publish timer started ({:?} interval)", interval);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            scheduler.tick();
                        }
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                log::info!("Publish timer stopped");
            })
            .map_err(|e| BridgeError::Thread("publish timer", e))?;

        Ok(PublishTimer {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender disconnects the channel, which wakes the select.
        drop(self.shutdown.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PublishTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::PoseRecord;
    use proptest::prelude::*;

    /// Captures datagrams instead of sending them.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingPublisher {
        pub sent: Arc<Mutex<Vec<Vec<u8>>>>,
        pub fail: Arc<std::sync::atomic::AtomicBool>,
    }

    impl Publisher for RecordingPublisher {
        fn send(&self, datagram: &[u8]) -> std::result::Result<(), PublishError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(PublishError::Send {
                    target: "127.0.0.1:7000".parse().unwrap(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "network unreachable"),
                });
            }
            self.sent.lock().unwrap().push(datagram.to_vec());
            Ok(())
        }
    }

    fn frame(seq: u32) -> PoseFrame {
        PoseFrame {
            sequence: seq,
            translation: [seq as f64, 0.0, 0.0],
            rotation: [0.0, 0.0, 0.0],
            focal_length: 35.0,
            timestamp_us: seq as u64 * 1000,
        }
    }

    fn scheduler() -> (PublishScheduler, RecordingPublisher) {
        let publisher = RecordingPublisher::default();
        (PublishScheduler::new(Box::new(publisher.clone())), publisher)
    }

    #[test]
    fn test_tick_without_submission_sends_nothing() {
        let (s, publisher) = scheduler();
        assert_eq!(s.tick(), TickOutcome::Idle);

        s.submit(frame(1));
        assert_eq!(s.tick(), TickOutcome::Published(1));
        // No hold-last-value: the same pose is not repeated.
        assert_eq!(s.tick(), TickOutcome::Idle);
        assert_eq!(s.tick(), TickOutcome::Idle);
        assert_eq!(publisher.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_last_write_wins() {
        let (s, publisher) = scheduler();
        for seq in 1..=5 {
            assert_eq!(s.submit(frame(seq)), SubmitOutcome::Accepted);
        }
        assert_eq!(s.tick(), TickOutcome::Published(5));

        let sent = publisher.sent.lock().unwrap();
        let record: PoseRecord = serde_json::from_slice(&sent[0]).unwrap();
        assert_eq!(record.tx, 5.0);
    }

    #[test]
    fn test_stale_and_duplicate_frames_are_discarded() {
        let (s, _) = scheduler();
        assert_eq!(s.submit(frame(10)), SubmitOutcome::Accepted);
        assert_eq!(s.submit(frame(10)), SubmitOutcome::Stale);
        assert_eq!(s.submit(frame(4)), SubmitOutcome::Stale);
        assert_eq!(s.tick(), TickOutcome::Published(10));
        assert_eq!(s.submit(frame(9)), SubmitOutcome::Stale);
        assert_eq!(s.tick(), TickOutcome::Idle);

        let stats = s.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.stale, 3);
        assert_eq!(stats.published, 1);
    }

    #[test]
    fn test_begin_session_resets_sequence_guard() {
        let (s, _) = scheduler();
        s.submit(frame(500));
        assert_eq!(s.tick(), TickOutcome::Published(500));

        s.begin_session();
        assert_eq!(s.submit(frame(1)), SubmitOutcome::Accepted);
        assert_eq!(s.tick(), TickOutcome::Published(1));
    }

    #[test]
    fn test_end_session_drops_pending_frame() {
        let (s, publisher) = scheduler();
        s.submit(frame(1));
        s.end_session();
        assert_eq!(s.tick(), TickOutcome::Idle);
        assert!(publisher.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_publish_failure_is_tick_local() {
        let (s, publisher) = scheduler();
        publisher.fail.store(true, Ordering::Relaxed);
        s.submit(frame(1));
        assert_eq!(s.tick(), TickOutcome::Failed(1));

        publisher.fail.store(false, Ordering::Relaxed);
        s.submit(frame(2));
        assert_eq!(s.tick(), TickOutcome::Published(2));

        let stats = s.stats();
        assert_eq!(stats.publish_errors, 1);
        assert_eq!(stats.published, 1);
    }

    #[test]
    fn test_rate_bound_with_fast_device() {
        // Device at 200 Hz, ticks at 60 Hz, on a simulated clock (microseconds).
        let (s, publisher) = scheduler();
        let seconds = 3u64;
        let end = seconds * 1_000_000;
        let tick_period = 1_000_000 / 60;
        let frame_period = 1_000_000 / 200;

        let mut next_tick = tick_period;
        let mut next_frame = 0;
        let mut seq = 0;
        while next_tick <= end {
            while next_frame < next_tick {
                seq += 1;
                s.submit(frame(seq));
                next_frame += frame_period;
            }
            s.tick();
            next_tick += tick_period;
        }

        let emitted = publisher.sent.lock().unwrap().len() as i64;
        let expected = (seconds * 60) as i64;
        assert!((emitted - expected).abs() <= 1, "emitted {}", emitted);
        assert!(emitted <= expected + 1);
    }

    #[test]
    fn test_publish_event() {
        let (s, publisher) = scheduler();
        s.publish_event(SessionEvent::Connected);
        let sent = publisher.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let v: serde_json::Value = serde_json::from_slice(&sent[0]).unwrap();
        assert_eq!(v["event"], "connected");
    }

    #[test]
    fn test_timer_ticks_and_stops() {
        let publisher = RecordingPublisher::default();
        let s = Arc::new(PublishScheduler::new(Box::new(publisher.clone())));
        let timer = PublishTimer::start(s.clone(), Duration::from_millis(5)).unwrap();

        s.submit(frame(1));
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while publisher.sent.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        timer.stop();

        assert_eq!(publisher.sent.lock().unwrap().len(), 1);
        assert_eq!(s.stats().published, 1);
    }

    #[test]
    fn test_udp_publisher_delivers_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let publisher = UdpPublisher::connect("127.0.0.1", port).unwrap();
        publisher.send(b"{\"tx\":1}").unwrap();

        let mut buf = [0u8; 64];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"{\"tx\":1}");
    }

    proptest! {
        #[test]
        fn prop_emitted_sequences_strictly_increase(
            batches in proptest::collection::vec(proptest::collection::vec(0u32..50, 0..6), 1..40)
        ) {
            let (s, _) = scheduler();
            let mut last: Option<u32> = None;
            for batch in batches {
                for seq in batch {
                    s.submit(frame(seq));
                }
                if let TickOutcome::Published(seq) = s.tick() {
                    if let Some(prev) = last {
                        prop_assert!(seq > prev);
                    }
                    last = Some(seq);
                }
            }
        }
    }
}
