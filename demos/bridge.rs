//! Run the bridge with `VCAM_*` environment configuration.
//!
//! Usage: RUST_LOG=info cargo run --example bridge
//! Press Ctrl+C to stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() {
    env_logger::init();

    let config = vcam_bridge::BridgeConfig::from_env();
    let bridge = match vcam_bridge::Bridge::start(config.clone()) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Failed to start bridge: {}", e);
            std::process::exit(1);
        }
    };

    println!("Pairing:   {}", bridge.pairing().payload());
    println!("Listening: {}", bridge.local_addr());
    println!(
        "Publish:   udp://{}:{} at {} Hz",
        config.publish_host, config.publish_port, config.target_rate_hz
    );
    println!();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || r.store(false, Ordering::SeqCst)) {
        eprintln!("Failed to install Ctrl+C handler: {}", e);
    }

    let mut last_report = Instant::now();
    let mut last_published = 0;
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));

        // Report every 3 seconds
        if last_report.elapsed() >= Duration::from_secs(3) {
            let s = bridge.status();
            let hz = (s.frames_published - last_published) as f64
                / last_report.elapsed().as_secs_f64();
            println!(
                "--- {} peer={} rx={} dropped={} stale={} published={} ({:.1} Hz) errors={} ---",
                s.state,
                s.peer.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                s.frames_received,
                s.frames_dropped,
                s.frames_stale,
                s.frames_published,
                hz,
                s.publish_errors,
            );
            last_published = s.frames_published;
            last_report = Instant::now();
        }
    }

    println!("Stopping...");
    bridge.stop();
}
