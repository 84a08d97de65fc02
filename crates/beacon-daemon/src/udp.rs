//! UDP multicast transport.
//!
//! Every peer on a host or LAN segment joins the same multicast group. Each
//! datagram is framed as `beacon1:<channel>\n<json>` so several channels can
//! share one group; datagrams for other channels are ignored on receipt.
//!
//! Multicast loopback is enabled so peers in separate processes on the same
//! machine hear each other. That also means we hear ourselves; the
//! coordinator discards self-originated messages.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use beacon_core::protocol::MAX_MESSAGE_SIZE;
use beacon_core::{MessageCallback, Transport, TransportError, TransportSubscription};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Default multicast group (organization-local scope).
pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 42, 99);

/// Default port.
pub const DEFAULT_PORT: u16 = 45_454;

const FRAME_MAGIC: &[u8] = b"beacon1:";

/// Prepend the frame header for `channel`.
pub fn frame(channel: &str, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_MAGIC.len() + channel.len() + 1 + data.len());
    out.extend_from_slice(FRAME_MAGIC);
    out.extend_from_slice(channel.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(data);
    out
}

/// Strip the frame header, returning the body if it is addressed to `channel`.
pub fn unframe<'a>(channel: &str, datagram: &'a [u8]) -> Option<&'a [u8]> {
    let rest = datagram.strip_prefix(FRAME_MAGIC)?;
    let newline = rest.iter().position(|b| *b == b'\n')?;
    let (name, body) = rest.split_at(newline);
    if name != channel.as_bytes() {
        return None;
    }
    Some(&body[1..])
}

/// Multicast group membership settings.
#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    /// Local interface to join on (unspecified = let the OS pick)
    pub interface: Ipv4Addr,
    pub ttl: u32,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP,
            port: DEFAULT_PORT,
            interface: Ipv4Addr::UNSPECIFIED,
            ttl: 1,
        }
    }
}

/// Broadcast medium over IPv4 multicast.
pub struct UdpMulticastTransport {
    channel: String,
    socket: Arc<UdpSocket>,
    target: SocketAddr,
}

impl UdpMulticastTransport {
    /// Open a socket, join the group and bind the port.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(channel: impl Into<String>, config: &UdpConfig) -> Result<Self, TransportError> {
        if !config.group.is_multicast() {
            return Err(TransportError::Unavailable(format!(
                "{} is not a multicast address",
                config.group
            )));
        }

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.bind(&SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), config.port).into())?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(config.ttl)?;
        socket.join_multicast_v4(&config.group, &config.interface)?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        let channel = channel.into();
        debug!(
            "Joined multicast group {}:{} for channel {:?}",
            config.group, config.port, channel
        );

        Ok(Self {
            channel,
            socket: Arc::new(socket),
            target: SocketAddrV4::new(config.group, config.port).into(),
        })
    }
}

impl Transport for UdpMulticastTransport {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let datagram = frame(&self.channel, data);
        match self.socket.try_send_to(&datagram, self.target) {
            Ok(_) => Ok(()),
            // The datagram is dropped; the caller logs and carries on
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                Err(TransportError::SendFailed("socket send buffer full".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn subscribe(&self, on_message: MessageCallback) -> Result<TransportSubscription, TransportError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        let socket = Arc::clone(&self.socket);
        let channel = self.channel.clone();
        let task = runtime.spawn(async move {
            let mut buf = vec![0u8; MAX_MESSAGE_SIZE + FRAME_MAGIC.len() + channel.len() + 1];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => match unframe(&channel, &buf[..len]) {
                        Some(body) => on_message(body),
                        None => debug!("Ignoring {} byte datagram from {}", len, from),
                    },
                    Err(e) => {
                        warn!("Multicast receive failed: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok(TransportSubscription::new(move || task.abort()))
    }
}
