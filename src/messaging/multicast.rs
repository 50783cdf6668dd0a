use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::messaging::peer_id::PeerId;
use crate::messaging::transport::{Transport, TransportError};

/// Datagrams at or above this size are assumed truncated and discarded. The
/// protocol's largest payload (framing + nick + text id + text) stays well
/// below one MTU.
const MAX_DATAGRAM_SIZE: usize = 2048;

/// Settings of the multicast channel.
#[derive(Debug, Clone)]
pub struct MulticastConfig {
    /// must be in 224.0.0.0/4
    pub group_address: Ipv4Addr,
    pub port: u16,
    /// Name of the network interface to use. With `None` the interface is
    /// chosen automatically, which requires that exactly one interface with a
    /// non-loopback IPv4 address exists.
    pub interface: Option<String>,
    /// Debug: a non-zero value N silently drops every Nth outgoing datagram,
    /// simulating UDP loss for the retry / dedup logic. 0 disables.
    pub debug_waste_each_nth_sent: u64,
    /// Debug: same as [MulticastConfig::debug_waste_each_nth_sent], for
    /// incoming datagrams.
    pub debug_waste_each_nth_received: u64,
}

impl Default for MulticastConfig {
    fn default() -> MulticastConfig {
        MulticastConfig {
            group_address: Ipv4Addr::new(239, 255, 42, 42),
            port: 42424,
            interface: None,
            debug_waste_each_nth_sent: 7,
            debug_waste_each_nth_received: 7,
        }
    }
}

/// [Transport] implementation over a UDP multicast group.
///
/// All peers configured with the same group address and port form a single chat
/// channel. The socket is bound with address sharing enabled so several
/// instances can coexist on one host, and the multicast TTL is 1 so datagrams
/// never leave the local segment.
pub struct MulticastTransport {
    config: MulticastConfig,
    own_ip: Ipv4Addr,
    group: SocketAddr,
    socket: UdpSocket,
    sent_count: AtomicU64,
    received_count: AtomicU64,
}

impl MulticastTransport {
    /// Chooses the network interface, binds to `(own_ip, port)` and joins the
    /// multicast group. Must be called from within a tokio runtime.
    pub fn new(config: MulticastConfig) -> Result<MulticastTransport, TransportError> {
        if !config.group_address.is_multicast() {
            return Err(TransportError::Network(format!(
                "group address {} is not an IPv4 multicast address",
                config.group_address
            )));
        }

        let own_ip = choose_own_ip(&config)?;

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| network_error("socket()", e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| network_error("SO_REUSEADDR", e))?;
        socket
            .bind(&SockAddr::from(SocketAddrV4::new(own_ip, config.port)))
            .map_err(|e| {
                network_error(&format!("binding to {}:{}", own_ip, config.port), e)
            })?;
        socket
            .join_multicast_v4(&config.group_address, &own_ip)
            .map_err(|e| {
                network_error(&format!("joining group {}", config.group_address), e)
            })?;
        socket
            .set_multicast_if_v4(&own_ip)
            .map_err(|e| network_error("IP_MULTICAST_IF", e))?;
        // TTL 1: link-local only, never routed beyond this segment
        socket
            .set_multicast_ttl_v4(1)
            .map_err(|e| network_error("IP_MULTICAST_TTL", e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| network_error("O_NONBLOCK", e))?;

        let socket = UdpSocket::from_std(socket.into())
            .map_err(|e| network_error("registering socket with the runtime", e))?;

        info!(own_ip = %own_ip, group = %config.group_address, port = config.port, "multicast transport ready");

        Ok(MulticastTransport {
            group: SocketAddr::new(config.group_address.into(), config.port),
            config,
            own_ip,
            socket,
            sent_count: AtomicU64::new(0),
            received_count: AtomicU64::new(0),
        })
    }
}

#[async_trait::async_trait]
impl Transport for MulticastTransport {
    fn own_id(&self) -> PeerId {
        PeerId::from(self.own_ip.to_string())
    }

    async fn send(&self, datagram: &[u8]) -> Result<(), TransportError> {
        if self.config.debug_waste_each_nth_sent > 0 {
            let count = self.sent_count.fetch_add(1, Ordering::Relaxed) + 1;
            if count % self.config.debug_waste_each_nth_sent == 0 {
                debug!("-x-> {}", String::from_utf8_lossy(datagram));
                return Ok(());
            }
        }

        let written = self
            .socket
            .send_to(datagram, self.group)
            .await
            .map_err(|e| network_error("unable to send datagram", e))?;
        if written != datagram.len() {
            return Err(TransportError::Network(format!(
                "unable to send datagram of {} bytes, only {} were written",
                datagram.len(),
                written
            )));
        }
        Ok(())
    }

    async fn recv(&self) -> Result<(BytesMut, PeerId), TransportError> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, from) = self
                .socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| network_error("unable to receive datagram", e))?;

            if len == buf.len() {
                // a read filling the whole buffer may be truncated: treat as lost
                warn!(%from, "received datagram of {} bytes or more - discarding", MAX_DATAGRAM_SIZE);
                continue;
            }
            if from.port() != self.config.port {
                debug!(%from, expected = self.config.port, "datagram from unexpected port - discarding");
                continue;
            }
            if from.ip() == IpAddr::V4(self.own_ip) {
                // our own datagram looped back by the group
                continue;
            }

            if self.config.debug_waste_each_nth_received > 0 {
                let count = self.received_count.fetch_add(1, Ordering::Relaxed) + 1;
                if count % self.config.debug_waste_each_nth_received == 0 {
                    debug!("{} <-x- {}", String::from_utf8_lossy(&buf[..len]), from.ip());
                    continue;
                }
            }

            return Ok((
                BytesMut::from(&buf[..len]),
                PeerId::from(from.ip().to_string()),
            ));
        }
    }
}

fn network_error(what: &str, e: std::io::Error) -> TransportError {
    TransportError::Network(format!("{}: {}", what, e))
}

/// Picks the local IPv4 address to bind to. With an explicitly configured
/// interface name, that interface's IPv4 address is used as given. Otherwise
/// exactly one interface that is up, running and has a non-loopback IPv4
/// address must exist; zero or several candidates fail with
/// [TransportError::NoSuitableInterface].
fn choose_own_ip(config: &MulticastConfig) -> Result<Ipv4Addr, TransportError> {
    let interfaces = if_addrs::get_if_addrs().map_err(|e| {
        TransportError::Network(format!("unable to enumerate network interfaces: {}", e))
    })?;

    if let Some(name) = &config.interface {
        return interfaces
            .iter()
            .filter(|iface| &iface.name == name)
            .find_map(|iface| match iface.addr.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(_) => None,
            })
            .ok_or_else(|| {
                TransportError::NoSuitableInterface(format!(
                    "interface {:?} does not exist or has no IPv4 address",
                    name
                ))
            });
    }

    let mut candidates = interfaces
        .iter()
        .filter_map(|iface| match (iface.is_loopback(), iface.addr.ip()) {
            (false, IpAddr::V4(ip)) => Some((iface.name.as_str(), ip)),
            _ => None,
        })
        .filter(|(name, _)| is_up_and_running(name));

    let Some((name, own_ip)) = candidates.next() else {
        return Err(TransportError::NoSuitableInterface(
            "no interface with a non-loopback IPv4 address found".to_owned(),
        ));
    };
    if let Some((other_name, _)) = candidates.next() {
        return Err(TransportError::NoSuitableInterface(format!(
            "more than one suitable interface found ({}, {}) - configure one explicitly",
            name, other_name
        )));
    }

    debug!(interface = name, ip = %own_ip, "chose network interface");
    Ok(own_ip)
}

/// An interface qualifies only while it is administratively up and
/// operationally running: an unplugged port keeps its configured address but
/// must not be chosen. Queried with SIOCGIFFLAGS; interfaces whose flags cannot
/// be read are not candidates.
#[cfg(unix)]
fn is_up_and_running(name: &str) -> bool {
    let Ok(name) = std::ffi::CString::new(name) else {
        return false;
    };
    let name = name.as_bytes_with_nul();

    let mut request: libc::ifreq = unsafe { std::mem::zeroed() };
    if name.len() > request.ifr_name.len() {
        return false;
    }
    for (dst, src) in request.ifr_name.iter_mut().zip(name) {
        *dst = *src as libc::c_char;
    }

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return false;
    }
    let result = unsafe { libc::ioctl(fd, libc::SIOCGIFFLAGS as _, &mut request) };
    unsafe { libc::close(fd) };
    if result != 0 {
        return false;
    }

    let flags = unsafe { request.ifr_ifru.ifru_flags } as libc::c_int;
    flags & libc::IFF_UP != 0 && flags & libc::IFF_RUNNING != 0
}

/// Interface flags are not portably available here; off unix every interface
/// with a configured address counts as running.
#[cfg(not(unix))]
fn is_up_and_running(_name: &str) -> bool {
    true
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_rejects_non_multicast_group() {
        let config = MulticastConfig {
            group_address: Ipv4Addr::new(10, 1, 2, 3),
            ..MulticastConfig::default()
        };

        match MulticastTransport::new(config) {
            Err(TransportError::Network(msg)) => {
                assert!(msg.contains("not an IPv4 multicast address"))
            }
            other => panic!("expected a network error, got {:?}", other.map(|_| ())),
        }
    }
}
