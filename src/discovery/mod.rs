//! LAN service discovery over mDNS: the master advertises itself so
//! workers started without an explicit URL can find it, and workers
//! optionally advertise themselves in turn for operator tooling.
//!
//! No dependency in this workspace's lineage speaks mDNS, so this
//! module is built on `mdns-sd` — see DESIGN.md for why that crate was
//! chosen over rolling a raw-socket implementation.

mod mdns;

pub use mdns::{MasterAdvertiser, WorkerAdvertiser, advertise_worker, discover_master};

/// Service type the master advertises under and workers browse for.
pub const MASTER_SERVICE_TYPE: &str = "_ffarm-master._tcp.local.";

/// Service type workers advertise under.
pub const WORKER_SERVICE_TYPE: &str = "_ffarm._tcp.local.";

/// Best-effort outbound IPv4 address to advertise, found the same way
/// the original implementation resolves `0.0.0.0`/`::` bind addresses:
/// open a UDP "connection" to a public address and read back the local
/// endpoint the kernel picked, without sending any packet.
/// `local_ipv4` with a loopback fallback, for callers (the master CLI's
/// `base_url` derivation) that need an address even when no outbound
/// route exists.
pub fn local_ipv4_or_loopback() -> String {
    local_ipv4().map(|ip| ip.to_string()).unwrap_or_else(|_| "127.0.0.1".to_string())
}

pub(crate) fn local_ipv4() -> Result<std::net::Ipv4Addr, crate::error::DiscoveryError> {
    use std::net::{SocketAddr, UdpSocket};
    let socket = UdpSocket::bind("0.0.0.0:0").map_err(|_| crate::error::DiscoveryError::NoAdvertisableAddress)?;
    socket
        .connect("8.8.8.8:80")
        .map_err(|_| crate::error::DiscoveryError::NoAdvertisableAddress)?;
    match socket.local_addr() {
        Ok(SocketAddr::V4(addr)) => Ok(*addr.ip()),
        _ => Err(crate::error::DiscoveryError::NoAdvertisableAddress),
    }
}
