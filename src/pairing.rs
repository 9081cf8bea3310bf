use crate::config::BridgeConfig;
use crate::types::PairingDescriptor;
use crate::{BridgeError, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

pub const TOKEN_LEN: usize = 16;

/// Used only to ask the OS which local interface routes outbound traffic when
/// several are up. Connecting a UDP socket sends no packets.
const ROUTE_PROBE: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 80);

/// Build the descriptor the device must be given out-of-band.
pub fn describe(config: &BridgeConfig) -> Result<PairingDescriptor> {
    describe_port(config, config.listen_port)
}

/// Like [`describe`], advertising `port` instead of `config.listen_port`.
/// Used once the listener is bound, since port 0 resolves to an ephemeral port.
pub fn describe_port(config: &BridgeConfig, port: u16) -> Result<PairingDescriptor> {
    let host = match config.advertise_host {
        Some(host) => host,
        None => resolve_local_address(config.listen_host)?,
    };
    let token = config.require_token.then(generate_token);
    let descriptor = PairingDescriptor { host, port, token };
    log::info!("Pairing descriptor: {}", descriptor);
    Ok(descriptor)
}

/// Pick the address a device on the LAN can reach.
fn resolve_local_address(listen_host: IpAddr) -> Result<IpAddr> {
    if is_usable(listen_host) {
        return Ok(listen_host);
    }
    if !listen_host.is_unspecified() {
        return Err(BridgeError::AddressResolution(format!(
            "listener is bound to {} which a remote device cannot reach",
            listen_host
        )));
    }

    let candidates: Vec<IpAddr> = if_addrs::get_if_addrs()?
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .map(|iface| iface.ip())
        .filter(|ip| is_lan_candidate(*ip))
        .collect();
    for ip in &candidates {
        log::debug!("LAN address candidate: {}", ip);
    }
    let preferred = if candidates.len() > 1 { routed_address() } else { None };
    select_address(&candidates, preferred)
}

/// First candidate, unless the routed address is among them.
fn select_address(candidates: &[IpAddr], preferred: Option<IpAddr>) -> Result<IpAddr> {
    if let Some(ip) = preferred.filter(|ip| candidates.contains(ip)) {
        return Ok(ip);
    }
    candidates.first().copied().ok_or_else(|| {
        BridgeError::AddressResolution("no non-loopback IPv4 interface found".into())
    })
}

/// Local address the OS routes outbound traffic from, if there is a route.
fn routed_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(ROUTE_PROBE).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

fn is_usable(ip: IpAddr) -> bool {
    !ip.is_loopback() && !ip.is_unspecified() && !ip.is_multicast()
}

fn is_lan_candidate(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_usable(ip) && !v4.is_link_local(),
        IpAddr::V6(_) => false,
    }
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}
