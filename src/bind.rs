//! # Transport Binds
//!
//! One small interface over the two wire transports:
//!
//! | Bind | Carrier | Receive fan-out |
//! |------|---------|-----------------|
//! | [`UdpBind`] | dual-stack UDP sockets | one source per socket |
//! | [`FakeTcpBind`] | pseudo-TCP over the tunnel device | shared queue drained by up to 4 sources |
//!
//! A bind yields [`PacketSource`]s on open; every source is an equivalent
//! worker handle producing `(buffer, source endpoint)` pairs. The device
//! spawns one receive pump per source and treats UDP and pseudo-TCP
//! uniformly from there on.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::endpoint::{self, EnabledAf, Endpoint, EndpointError};
use crate::faketcp::{FakeTcpError, Socket as FtSocket, Stack};
use crate::tun::{Tun, TunConfig};

/// Depth of the multiplexed receive queue a pseudo-TCP bind feeds.
const RECV_QUEUE_SIZE: usize = 1024;

/// Upper bound on pseudo-TCP receive sources handed to the device.
const MAX_RECV_SOURCES: usize = 4;

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

/// Failures of bind operations.
#[derive(Debug)]
pub enum BindError {
    /// The bind is closed (or was never opened).
    Closed,
    /// `open` called twice.
    AlreadyOpen,
    /// The endpoint string did not parse/resolve.
    InvalidEndpoint(EndpointError),
    /// No socket matches the endpoint's address family.
    WrongFamily,
    /// Socket or tunnel I/O failure.
    Io(std::io::Error),
    /// Pseudo-TCP connect/send failure.
    FakeTcp(FakeTcpError),
    /// Tunnel interface creation failed.
    Tun(String),
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindError::Closed => write!(f, "bind is closed"),
            BindError::AlreadyOpen => write!(f, "bind is already open"),
            BindError::InvalidEndpoint(e) => write!(f, "invalid endpoint: {e}"),
            BindError::WrongFamily => write!(f, "no socket for that address family"),
            BindError::Io(e) => write!(f, "bind I/O error: {e}"),
            BindError::FakeTcp(e) => write!(f, "pseudo-tcp error: {e}"),
            BindError::Tun(e) => write!(f, "tunnel setup failed: {e}"),
        }
    }
}

impl std::error::Error for BindError {}

impl From<std::io::Error> for BindError {
    fn from(e: std::io::Error) -> Self {
        BindError::Io(e)
    }
}

impl From<FakeTcpError> for BindError {
    fn from(e: FakeTcpError) -> Self {
        BindError::FakeTcp(e)
    }
}

impl From<EndpointError> for BindError {
    fn from(e: EndpointError) -> Self {
        BindError::InvalidEndpoint(e)
    }
}

// ----------------------------------------------------------------------------
// Traits
// ----------------------------------------------------------------------------

/// One receive worker handle. All sources of a bind are equivalent; draining
/// any of them yields the next available packet.
#[async_trait]
pub trait PacketSource: Send + Sync {
    /// Fill `buf` with the next packet; returns its length and source.
    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, Endpoint), BindError>;
}

/// Uniform send/receive/parse facade over a wire transport.
#[async_trait]
pub trait Bind: Send + Sync {
    /// Bind to `port` (0 picks one) and return the receive sources plus the
    /// actual port.
    async fn open(&self, port: u16) -> Result<(Vec<Arc<dyn PacketSource>>, u16), BindError>;

    /// Send one packet to `endpoint`.
    async fn send(&self, buf: &[u8], endpoint: &Endpoint) -> Result<(), BindError>;

    /// Parse (and if needed resolve) an endpoint string.
    fn parse_endpoint(&self, s: &str) -> Result<Endpoint, BindError>;

    /// Release sockets and stop workers. Idempotent.
    async fn close(&self);

    /// Apply a routing mark to the underlying sockets. No-op where the
    /// transport has no socket to mark.
    fn set_mark(&self, mark: u32) -> Result<(), BindError>;

    /// Address families this bind can reach.
    fn enabled_af(&self) -> EnabledAf;
}

// ----------------------------------------------------------------------------
// UDP bind
// ----------------------------------------------------------------------------

struct UdpSockets {
    v4: Option<Arc<UdpSocket>>,
    v6: Option<Arc<UdpSocket>>,
}

/// Conventional dual-socket UDP bind: one IPv4 socket and one v6-only IPv6
/// socket sharing a port.
pub struct UdpBind {
    af: EnabledAf,
    sockets: RwLock<Option<UdpSockets>>,
    stop_tx: watch::Sender<bool>,
}

impl UdpBind {
    pub fn new(af: EnabledAf) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            af,
            sockets: RwLock::new(None),
            stop_tx,
        }
    }

    fn bind_socket(domain: Domain, addr: SocketAddr) -> std::io::Result<Arc<UdpSocket>> {
        let raw = RawSocket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if domain == Domain::IPV6 {
            raw.set_only_v6(true)?;
        }
        raw.set_nonblocking(true)?;
        raw.bind(&addr.into())?;
        Ok(Arc::new(UdpSocket::from_std(raw.into())?))
    }
}

#[async_trait]
impl Bind for UdpBind {
    async fn open(&self, port: u16) -> Result<(Vec<Arc<dyn PacketSource>>, u16), BindError> {
        let mut guard = self.sockets.write().expect("udp bind lock");
        if guard.is_some() {
            return Err(BindError::AlreadyOpen);
        }

        let mut actual_port = port;
        let v4 = if self.af.v4 {
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), actual_port);
            let sock = Self::bind_socket(Domain::IPV4, addr)?;
            actual_port = sock.local_addr()?.port();
            Some(sock)
        } else {
            None
        };
        let v6 = if self.af.v6 {
            let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), actual_port);
            match Self::bind_socket(Domain::IPV6, addr) {
                Ok(sock) => {
                    actual_port = sock.local_addr()?.port();
                    Some(sock)
                }
                // A host without IPv6 still gets a working v4 bind.
                Err(e) if v4.is_some() => {
                    debug!(error = %e, "ipv6 socket unavailable, continuing v4-only");
                    None
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };

        let mut sources: Vec<Arc<dyn PacketSource>> = Vec::new();
        for sock in [&v4, &v6].into_iter().flatten() {
            sources.push(Arc::new(UdpSource {
                sock: sock.clone(),
                stop: self.stop_tx.subscribe(),
            }));
        }

        *guard = Some(UdpSockets { v4, v6 });
        debug!(port = actual_port, v4 = self.af.v4, v6 = self.af.v6, "udp bind opened");
        Ok((sources, actual_port))
    }

    async fn send(&self, buf: &[u8], endpoint: &Endpoint) -> Result<(), BindError> {
        let sock = {
            let guard = self.sockets.read().expect("udp bind lock");
            let sockets = guard.as_ref().ok_or(BindError::Closed)?;
            match endpoint.dst() {
                SocketAddr::V4(_) => sockets.v4.clone(),
                SocketAddr::V6(_) => sockets.v6.clone(),
            }
            .ok_or(BindError::WrongFamily)?
        };
        sock.send_to(buf, endpoint.dst()).await?;
        Ok(())
    }

    fn parse_endpoint(&self, s: &str) -> Result<Endpoint, BindError> {
        Ok(endpoint::parse_endpoint(s)?)
    }

    async fn close(&self) {
        let _ = self.stop_tx.send(true);
        *self.sockets.write().expect("udp bind lock") = None;
    }

    fn set_mark(&self, mark: u32) -> Result<(), BindError> {
        let guard = self.sockets.read().expect("udp bind lock");
        let Some(sockets) = guard.as_ref() else {
            return Ok(());
        };
        for sock in [&sockets.v4, &sockets.v6].into_iter().flatten() {
            socket2::SockRef::from(&**sock).set_mark(mark)?;
        }
        Ok(())
    }

    fn enabled_af(&self) -> EnabledAf {
        self.af
    }
}

struct UdpSource {
    sock: Arc<UdpSocket>,
    stop: watch::Receiver<bool>,
}

#[async_trait]
impl PacketSource for UdpSource {
    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, Endpoint), BindError> {
        let mut stop = self.stop.clone();
        if *stop.borrow() {
            return Err(BindError::Closed);
        }
        tokio::select! {
            _ = stop.changed() => Err(BindError::Closed),
            res = self.sock.recv_from(buf) => {
                let (n, from) = res?;
                Ok((n, Endpoint::new(from)))
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Pseudo-TCP bind
// ----------------------------------------------------------------------------

struct FtState {
    stack: Arc<Stack>,
    accept_loop: JoinHandle<()>,
}

/// Bind over the pseudo-TCP stack. Accepted and dialed sockets feed one
/// multiplexed receive queue; `send` dials on first use per remote.
pub struct FakeTcpBind {
    af: EnabledAf,
    tun_config: TunConfig,
    state: RwLock<Option<FtState>>,
    sockets: Arc<RwLock<HashMap<SocketAddr, Arc<FtSocket>>>>,
    recv_tx: mpsc::Sender<(Vec<u8>, Endpoint)>,
    recv_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<(Vec<u8>, Endpoint)>>>,
    stop_tx: watch::Sender<bool>,
    port: AtomicU16,
    closed: AtomicBool,
}

impl FakeTcpBind {
    pub fn new(af: EnabledAf, tun_config: TunConfig) -> Self {
        let (recv_tx, recv_rx) = mpsc::channel(RECV_QUEUE_SIZE);
        let (stop_tx, _) = watch::channel(false);
        Self {
            af,
            tun_config,
            state: RwLock::new(None),
            sockets: Arc::new(RwLock::new(HashMap::new())),
            recv_tx,
            recv_rx: Arc::new(tokio::sync::Mutex::new(recv_rx)),
            stop_tx,
            port: AtomicU16::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Strip an optional prefix length from a configured address.
    fn parse_local_ip(addr: &str) -> Option<IpAddr> {
        let host = addr.split('/').next().unwrap_or(addr);
        host.parse().ok()
    }
}

#[async_trait]
impl Bind for FakeTcpBind {
    async fn open(&self, port: u16) -> Result<(Vec<Arc<dyn PacketSource>>, u16), BindError> {
        if self.state.read().expect("ft bind lock").is_some() {
            return Err(BindError::AlreadyOpen);
        }

        let local_v4 = if self.af.v4 {
            self.tun_config.ipv4_addr.as_deref().and_then(Self::parse_local_ip)
        } else {
            None
        };
        let local_v6 = if self.af.v6 {
            self.tun_config.ipv6_addr.as_deref().and_then(Self::parse_local_ip)
        } else {
            None
        };

        let mut config = self.tun_config.clone();
        if config.queues == 0 {
            config.queues = std::thread::available_parallelism().map_or(1, |n| n.get());
        }

        let tuns = Tun::create(&config).map_err(|e| BindError::Tun(e.to_string()))?;
        let stack = Stack::new(tuns, local_v4, local_v6);
        if let Err(e) = stack.listen(port) {
            stack.close().await;
            return Err(e.into());
        }
        self.port.store(port, Ordering::Release);

        // Accept loop: every inbound connection gets a receiver that feeds
        // the shared queue.
        let accept_stack = stack.clone();
        let sockets = self.sockets.clone();
        let recv_tx = self.recv_tx.clone();
        let stop_tx = self.stop_tx.clone();
        let accept_loop = tokio::spawn(async move {
            loop {
                let sock = match accept_stack.accept().await {
                    Ok(sock) => sock,
                    Err(_) => return,
                };
                debug!(remote = %sock.remote_addr(), "accepted pseudo-tcp connection");
                sockets
                    .write()
                    .expect("ft sockets lock")
                    .insert(sock.remote_addr(), sock.clone());
                spawn_socket_receiver(sock, recv_tx.clone(), sockets.clone(), stop_tx.subscribe());
            }
        });

        let n_sources = stack.queue_count().min(MAX_RECV_SOURCES);
        let sources: Vec<Arc<dyn PacketSource>> = (0..n_sources)
            .map(|_| {
                Arc::new(FakeTcpSource {
                    rx: self.recv_rx.clone(),
                    stop: self.stop_tx.subscribe(),
                }) as Arc<dyn PacketSource>
            })
            .collect();

        *self.state.write().expect("ft bind lock") = Some(FtState { stack, accept_loop });
        debug!(port, "pseudo-tcp bind opened");
        Ok((sources, port))
    }

    async fn send(&self, buf: &[u8], endpoint: &Endpoint) -> Result<(), BindError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BindError::Closed);
        }

        let existing = self
            .sockets
            .read()
            .expect("ft sockets lock")
            .get(&endpoint.dst())
            .cloned();

        let sock = match existing {
            Some(sock) => sock,
            None => {
                let stack = {
                    let guard = self.state.read().expect("ft bind lock");
                    guard.as_ref().ok_or(BindError::Closed)?.stack.clone()
                };
                let sock = stack
                    .connect(self.port.load(Ordering::Acquire), endpoint.dst())
                    .await?;
                self.sockets
                    .write()
                    .expect("ft sockets lock")
                    .insert(endpoint.dst(), sock.clone());
                spawn_socket_receiver(
                    sock.clone(),
                    self.recv_tx.clone(),
                    self.sockets.clone(),
                    self.stop_tx.subscribe(),
                );
                sock
            }
        };

        sock.send(buf).await?;
        Ok(())
    }

    fn parse_endpoint(&self, s: &str) -> Result<Endpoint, BindError> {
        Ok(endpoint::parse_endpoint(s)?)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stop_tx.send(true);

        let state = self.state.write().expect("ft bind lock").take();
        if let Some(state) = state {
            state.accept_loop.abort();
            state.stack.close().await;
        }

        let sockets: Vec<Arc<FtSocket>> = self
            .sockets
            .write()
            .expect("ft sockets lock")
            .drain()
            .map(|(_, s)| s)
            .collect();
        for sock in sockets {
            sock.close();
        }
        debug!("pseudo-tcp bind closed");
    }

    fn set_mark(&self, _mark: u32) -> Result<(), BindError> {
        // The tunnel device has no socket to mark.
        Ok(())
    }

    fn enabled_af(&self) -> EnabledAf {
        self.af
    }
}

/// Drain one socket into the bind's shared receive queue until it closes.
fn spawn_socket_receiver(
    sock: Arc<FtSocket>,
    recv_tx: mpsc::Sender<(Vec<u8>, Endpoint)>,
    sockets: Arc<RwLock<HashMap<SocketAddr, Arc<FtSocket>>>>,
    mut stop: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let endpoint = Endpoint::new(sock.remote_addr());
        let mut buf = vec![0u8; 2048];
        loop {
            let n = tokio::select! {
                _ = stop.changed() => return,
                res = sock.recv(&mut buf) => match res {
                    Ok(n) => n,
                    Err(e) => {
                        debug!(remote = %endpoint, error = %e, "pseudo-tcp receiver exiting");
                        sock.close();
                        sockets.write().expect("ft sockets lock").remove(&sock.remote_addr());
                        return;
                    }
                },
            };
            let packet = buf[..n].to_vec();
            tokio::select! {
                _ = stop.changed() => return,
                res = recv_tx.send((packet, endpoint)) => {
                    if res.is_err() {
                        return;
                    }
                }
            }
        }
    });
}

struct FakeTcpSource {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<(Vec<u8>, Endpoint)>>>,
    stop: watch::Receiver<bool>,
}

#[async_trait]
impl PacketSource for FakeTcpSource {
    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, Endpoint), BindError> {
        let mut stop = self.stop.clone();
        if *stop.borrow() {
            return Err(BindError::Closed);
        }
        let mut rx = tokio::select! {
            _ = stop.changed() => return Err(BindError::Closed),
            guard = self.rx.lock() => guard,
        };
        tokio::select! {
            _ = stop.changed() => Err(BindError::Closed),
            pkt = rx.recv() => {
                let (data, from) = pkt.ok_or(BindError::Closed)?;
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok((n, from))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_bind_round_trip_on_loopback() {
        let a = UdpBind::new(EnabledAf::V4_ONLY);
        let b = UdpBind::new(EnabledAf::V4_ONLY);

        let (sources_a, port_a) = a.open(0).await.expect("open a");
        let (_sources_b, port_b) = b.open(0).await.expect("open b");
        assert_eq!(sources_a.len(), 1);
        assert_ne!(port_a, 0);

        let dest = a.parse_endpoint(&format!("127.0.0.1:{port_a}")).unwrap();
        b.send(b"ping", &dest).await.expect("send");

        let mut buf = [0u8; 64];
        let (n, from) = sources_a[0].recv(&mut buf).await.expect("recv");
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from.dst().port(), port_b);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn udp_bind_dual_stack_yields_two_sources() {
        let bind = UdpBind::new(EnabledAf::BOTH);
        let (sources, port) = bind.open(0).await.expect("open");
        // One source per bound family; hosts without IPv6 yield just one.
        assert!((1..=2).contains(&sources.len()));
        assert_ne!(port, 0);
        assert!(bind.open(0).await.is_err(), "second open must fail");
        bind.close().await;
    }

    #[tokio::test]
    async fn udp_send_to_wrong_family_fails() {
        let bind = UdpBind::new(EnabledAf::V4_ONLY);
        let (_s, _p) = bind.open(0).await.unwrap();
        let v6 = bind.parse_endpoint("[::1]:9999").unwrap();
        assert!(matches!(
            bind.send(b"x", &v6).await,
            Err(BindError::WrongFamily)
        ));
        bind.close().await;
    }

    #[tokio::test]
    async fn closed_udp_bind_rejects_send_and_wakes_sources() {
        let bind = UdpBind::new(EnabledAf::V4_ONLY);
        let (sources, port) = bind.open(0).await.unwrap();
        let dest = bind.parse_endpoint(&format!("127.0.0.1:{port}")).unwrap();

        let source = sources[0].clone();
        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            source.recv(&mut buf).await
        });

        bind.close().await;
        assert!(matches!(bind.send(b"x", &dest).await, Err(BindError::Closed)));
        assert!(matches!(pending.await.unwrap(), Err(BindError::Closed)));
    }

    #[tokio::test]
    async fn faketcp_bind_send_before_open_is_closed() {
        let bind = FakeTcpBind::new(EnabledAf::V4_ONLY, TunConfig::default());
        let ep = bind.parse_endpoint("192.0.2.1:443").unwrap();
        // Never opened: no stack, treated as closed.
        assert!(bind.send(b"x", &ep).await.is_err());
        assert!(bind.set_mark(7).is_ok(), "mark is a no-op for pseudo-tcp");
    }

    #[test]
    fn local_ip_parsing_strips_prefix() {
        assert_eq!(
            FakeTcpBind::parse_local_ip("192.168.200.1/24"),
            Some("192.168.200.1".parse().unwrap())
        );
        assert_eq!(
            FakeTcpBind::parse_local_ip("192.168.200.1"),
            Some("192.168.200.1".parse().unwrap())
        );
        assert_eq!(FakeTcpBind::parse_local_ip("bogus"), None);
    }
}
