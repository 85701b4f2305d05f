//! `embassy-net` backends for the poll session.

use core::net::Ipv4Addr;

use alphaess_core::backend::{DhcpStatus, NetworkInterface, SntpSocket, SocketState, Transport};
use alphaess_core::clock::Clock;
use alphaess_core::config::{Lease, NetworkConfig, NetworkOverrides, SNTP_PORT, prefix_to_netmask};
use alphaess_core::error::SocketError;
use defmt::*;
use embassy_net::{
    Config as NetConfig, DhcpConfig, IpAddress, IpEndpoint, Ipv4Cidr, Stack, StaticConfigV4,
    dns::DnsQueryType,
    tcp::{self, TcpSocket},
    udp::{BindError, PacketMetadata, UdpSocket},
};
use embassy_time::{Duration, Instant, Timer, with_timeout};
use heapless::Vec;

use crate::{POLLER_DNS, POLLER_GATEWAY, POLLER_MAC, POLLER_NETMASK, POLLER_STATIC_IP};

/// One DHCP attempt; after this without a lease the attempt counts as failed.
const DHCP_ATTEMPT_WINDOW: Duration = Duration::from_secs(10);
const SNTP_REPLY_WAIT: Duration = Duration::from_millis(500);
const TCP_TIMEOUT: Duration = Duration::from_secs(10);

/// Build-time network settings.
pub fn network_config_from_env() -> NetworkConfig {
    NetworkOverrides {
        mac: POLLER_MAC,
        static_ip: POLLER_STATIC_IP,
        netmask: POLLER_NETMASK,
        gateway: POLLER_GATEWAY,
        dns: POLLER_DNS,
    }
    .resolve()
}

pub fn stack_config(net: &NetworkConfig) -> NetConfig {
    if net.dhcp {
        return NetConfig::dhcpv4(DhcpConfig::default());
    }
    let Some(prefix) = net.prefix_len() else {
        warn!("static netmask not contiguous; falling back to DHCP");
        return NetConfig::dhcpv4(DhcpConfig::default());
    };

    let mut dns_servers: Vec<Ipv4Addr, 3> = Vec::new();
    let _ = dns_servers.push(net.dns);

    NetConfig::ipv4_static(StaticConfigV4 {
        address: Ipv4Cidr::new(net.ip, prefix),
        gateway: Some(net.gateway),
        dns_servers,
    })
}

/// Monotonic time from the embassy time driver.
pub struct EmbassyClock;

impl Clock for EmbassyClock {
    fn now_ms(&self) -> u64 {
        Instant::now().as_millis()
    }

    async fn sleep_ms(&mut self, ms: u32) {
        Timer::after_millis(u64::from(ms)).await;
    }
}

/// Link state, DHCP and DNS of the stack.
pub struct StackInterface {
    stack: Stack<'static>,
    attempt_started: Option<Instant>,
}

impl StackInterface {
    pub fn new(stack: Stack<'static>) -> Self {
        Self {
            stack,
            attempt_started: None,
        }
    }
}

impl NetworkInterface for StackInterface {
    fn is_link_up(&self) -> bool {
        self.stack.is_link_up()
    }

    async fn poll_dhcp(&mut self) -> DhcpStatus {
        if let Some(cfg) = self.stack.config_v4() {
            self.attempt_started = None;
            return DhcpStatus::Leased(lease_from(&cfg));
        }

        let started = *self.attempt_started.get_or_insert_with(Instant::now);
        if started.elapsed() >= DHCP_ATTEMPT_WINDOW {
            // The stack keeps discovering on its own; only the count restarts.
            self.attempt_started = None;
            return DhcpStatus::Failed;
        }
        DhcpStatus::Running
    }

    async fn resolve(&mut self, dns_server: Ipv4Addr, host: &str) -> Option<Ipv4Addr> {
        // The stack queries the servers of its own IPv4 config, which was
        // built from the same NetworkConfig.
        let o = dns_server.octets();
        debug!("DNS query {=str} via {}.{}.{}.{}", host, o[0], o[1], o[2], o[3]);

        match self.stack.dns_query(host, DnsQueryType::A).await {
            Ok(addrs) => addrs.iter().find_map(|addr| match addr {
                IpAddress::Ipv4(ip) => Some(*ip),
                #[allow(unreachable_patterns)]
                _ => None,
            }),
            Err(e) => {
                warn!("DNS query error: {:?}", e);
                None
            }
        }
    }
}

fn lease_from(cfg: &StaticConfigV4) -> Lease {
    Lease {
        address: cfg.address.address(),
        subnet: prefix_to_netmask(cfg.address.prefix_len()),
        gateway: cfg.gateway.unwrap_or(Ipv4Addr::UNSPECIFIED),
        dns: cfg
            .dns_servers
            .first()
            .copied()
            .unwrap_or(Ipv4Addr::UNSPECIFIED),
        // Not exposed by embassy-net.
        lease_secs: None,
    }
}

/// UDP socket bound to an ephemeral port for SNTP.
pub struct SntpUdp<'a> {
    socket: UdpSocket<'a>,
}

impl<'a> SntpUdp<'a> {
    pub fn new(
        stack: Stack<'a>,
        rx_meta: &'a mut [PacketMetadata],
        rx_buffer: &'a mut [u8],
        tx_meta: &'a mut [PacketMetadata],
        tx_buffer: &'a mut [u8],
    ) -> Result<Self, BindError> {
        let mut socket = UdpSocket::new(stack, rx_meta, rx_buffer, tx_meta, tx_buffer);
        socket.bind(0)?;
        Ok(Self { socket })
    }
}

impl SntpSocket for SntpUdp<'_> {
    async fn exchange(
        &mut self,
        server: Ipv4Addr,
        request: &[u8],
        reply: &mut [u8],
    ) -> Option<usize> {
        let remote = IpEndpoint::new(IpAddress::Ipv4(server), SNTP_PORT);
        if let Err(e) = self.socket.send_to(request, remote).await {
            warn!("SNTP send failed: {:?}", e);
            return None;
        }

        match with_timeout(SNTP_REPLY_WAIT, self.socket.recv_from(reply)).await {
            Ok(Ok((len, meta))) if meta.endpoint == remote => Some(len),
            Ok(Ok(_)) => {
                debug!("SNTP reply from unexpected peer dropped");
                None
            }
            Ok(Err(e)) => {
                warn!("SNTP receive failed: {:?}", e);
                None
            }
            Err(_) => None,
        }
    }
}

/// TCP socket for the single HTTP exchange.
pub struct TcpTransport<'a> {
    socket: TcpSocket<'a>,
}

impl<'a> TcpTransport<'a> {
    pub fn new(stack: Stack<'a>, rx_buffer: &'a mut [u8], tx_buffer: &'a mut [u8]) -> Self {
        let mut socket = TcpSocket::new(stack, rx_buffer, tx_buffer);
        socket.set_timeout(Some(TCP_TIMEOUT));
        Self { socket }
    }
}

impl Transport for TcpTransport<'_> {
    fn state(&self) -> SocketState {
        match self.socket.state() {
            tcp::State::Established => SocketState::Established,
            tcp::State::Closed
            | tcp::State::CloseWait
            | tcp::State::LastAck
            | tcp::State::Closing
            | tcp::State::TimeWait => SocketState::Closed,
            _ => SocketState::Open,
        }
    }

    fn open(&mut self) -> Result<(), SocketError> {
        // embassy-net sockets are ready once constructed.
        Ok(())
    }

    async fn connect(&mut self, remote: Ipv4Addr, port: u16) -> Result<(), SocketError> {
        self.socket
            .connect(IpEndpoint::new(IpAddress::Ipv4(remote), port))
            .await
            .map_err(|e| match e {
                tcp::ConnectError::InvalidState => SocketError::InvalidState,
                tcp::ConnectError::ConnectionReset => SocketError::ConnectionReset,
                tcp::ConnectError::TimedOut => SocketError::TimedOut,
                tcp::ConnectError::NoRoute => SocketError::NoRoute,
            })
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), SocketError> {
        let mut rest = data;
        while !rest.is_empty() {
            let n = self.socket.write(rest).await.map_err(socket_error)?;
            if n == 0 {
                return Err(SocketError::ConnectionReset);
            }
            rest = &rest[n..];
        }
        self.socket.flush().await.map_err(socket_error)
    }

    fn pending(&self) -> usize {
        self.socket.recv_queue()
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
        self.socket.read(buf).await.map_err(socket_error)
    }
}

fn socket_error(e: tcp::Error) -> SocketError {
    match e {
        tcp::Error::ConnectionReset => SocketError::ConnectionReset,
    }
}
