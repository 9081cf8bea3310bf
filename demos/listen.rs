//! Print datagrams the bridge publishes, standing in for the 3D engine.
//!
//! Usage: cargo run --example listen [port]

use std::net::UdpSocket;

fn main() {
    env_logger::init();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(vcam_bridge::config::DEFAULT_PUBLISH_PORT);

    let socket = match UdpSocket::bind(("0.0.0.0", port)) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to bind UDP port {}: {}", port, e);
            std::process::exit(1);
        }
    };
    println!("Listening for datagrams on udp://0.0.0.0:{} (Ctrl+C to stop)...", port);

    let mut buf = [0u8; 2048];
    let mut count: u64 = 0;
    loop {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("Receive error: {}", e);
                break;
            }
        };
        count += 1;
        match vcam_bridge::codec::decode_datagram(&buf[..len]) {
            Ok(r) => {
                // Print every ~30th pose to avoid flooding the terminal
                if count % 30 == 1 {
                    println!(
                        "{}  t=[{:+.3}, {:+.3}, {:+.3}]  r=[{:+.2}, {:+.2}, {:+.2}]  fl={:.1}",
                        from, r.tx, r.ty, r.tz, r.rx, r.ry, r.rz, r.fl
                    );
                }
            }
            Err(_) => println!("{}  {}", from, String::from_utf8_lossy(&buf[..len])),
        }
    }
}
