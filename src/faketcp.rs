//! # Pseudo-TCP Carrier
//!
//! A user-space TCP lookalike running over the layer-3 tunnel device. It
//! performs a real three-way handshake and emits segments that parse as TCP,
//! but it is a *datagram* carrier: `send` never retransmits, `recv` delivers
//! in arrival order, and loss is left to the session layer above, which
//! already tolerates UDP-grade loss. The point is purely to traverse
//! middleboxes that throttle or drop UDP.
//!
//! ## Components
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`Socket`] | Per-connection state machine (handshake, send, receive) |
//! | [`Stack`] | Demultiplexes tunnel reads into sockets; listens and accepts |
//!
//! ## Connection state machine
//!
//! ```text
//! Idle ── send SYN ─────────────► SynSent ── recv SYN|ACK, send ACK ──► Established
//! Idle ── recv SYN, send SYN|ACK ► SynReceived ── recv ACK ───────────► Established
//! any  ── close() ──────────────► Closed
//! SynSent/SynReceived ── timeout (RETRY_COUNT attempts) ──► Closed
//! ```
//!
//! No FIN or RST is ever sent; a closed peer is noticed by the session
//! timeout upstream.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tracing::{debug, trace, warn};

use crate::codec::{self, ACK, MAX_PACKET_LEN, SYN};
use crate::tun::Tun;

/// How long one handshake attempt waits before resending.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Handshake attempts before giving up.
pub const RETRY_COUNT: usize = 6;

/// Unacknowledged-byte threshold that triggers a bare ACK on the receive
/// path. Modulo-2^32 byte arithmetic.
pub const MAX_UNACKED_LEN: u32 = 128 * 1024 * 1024;

/// Per-socket incoming queue depth; overflow drops the packet.
pub const INCOMING_QUEUE_SIZE: usize = 512;

/// Pending not-yet-accepted connections.
pub const ACCEPT_QUEUE_SIZE: usize = 128;

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

/// Failures of the pseudo-TCP socket and stack operations.
#[derive(Debug)]
pub enum FakeTcpError {
    /// Handshake attempted on a socket that already left `Idle`.
    NotIdle(ConnState),
    /// Data operation on a socket that is not `Established`.
    NotEstablished(ConnState),
    /// The socket or stack was closed.
    Closed,
    /// The handshake exhausted all retries.
    Timeout,
    /// `listen` called twice for the same port.
    AlreadyListening(u16),
    /// No local address is configured for the remote's address family.
    NoLocalAddress,
    /// Tunnel device I/O failed.
    Io(std::io::Error),
}

impl std::fmt::Display for FakeTcpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FakeTcpError::NotIdle(s) => write!(f, "socket not in idle state (state: {s})"),
            FakeTcpError::NotEstablished(s) => write!(f, "socket not established (state: {s})"),
            FakeTcpError::Closed => write!(f, "socket closed"),
            FakeTcpError::Timeout => write!(f, "connection timeout after {RETRY_COUNT} retries"),
            FakeTcpError::AlreadyListening(p) => write!(f, "already listening on port {p}"),
            FakeTcpError::NoLocalAddress => write!(f, "no local address for that family"),
            FakeTcpError::Io(e) => write!(f, "tunnel I/O error: {e}"),
        }
    }
}

impl std::error::Error for FakeTcpError {}

impl From<std::io::Error> for FakeTcpError {
    fn from(e: std::io::Error) -> Self {
        FakeTcpError::Io(e)
    }
}

// ----------------------------------------------------------------------------
// Packet link
// ----------------------------------------------------------------------------

/// Where a socket writes its framed segments. Implemented by [`Tun`]; tests
/// substitute an in-memory link.
#[async_trait]
pub trait PacketLink: Send + Sync {
    async fn send_packet(&self, packet: &[u8]) -> std::io::Result<usize>;
}

#[async_trait]
impl PacketLink for Tun {
    async fn send_packet(&self, packet: &[u8]) -> std::io::Result<usize> {
        self.send(packet).await
    }
}

// ----------------------------------------------------------------------------
// Connection state
// ----------------------------------------------------------------------------

/// Pseudo-TCP connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    SynSent,
    SynReceived,
    Established,
    Closed,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnState::Idle => "Idle",
            ConnState::SynSent => "SynSent",
            ConnState::SynReceived => "SynReceived",
            ConnState::Established => "Established",
            ConnState::Closed => "Closed",
        };
        write!(f, "{s}")
    }
}

// ----------------------------------------------------------------------------
// Socket
// ----------------------------------------------------------------------------

/// One pseudo-TCP connection.
///
/// `seq`, `ack` and `last_ack` are 32-bit byte counters with wraparound
/// semantics, accessed atomically. The incoming queue carries raw IP packets
/// as read from the tunnel; the socket re-parses them on receive.
pub struct Socket {
    stack: Weak<StackInner>,
    link: Arc<dyn PacketLink>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    seq: AtomicU32,
    ack: AtomicU32,
    last_ack: AtomicU32,
    state: RwLock<ConnState>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    incoming_tx: mpsc::Sender<Vec<u8>>,
    incoming_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl Socket {
    fn new(
        stack: Weak<StackInner>,
        link: Arc<dyn PacketLink>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        initial_ack: u32,
    ) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE_SIZE);
        let (close_tx, _) = watch::channel(false);
        Arc::new(Self {
            stack,
            link,
            local_addr,
            remote_addr,
            seq: AtomicU32::new(rand::random()),
            ack: AtomicU32::new(initial_ack),
            last_ack: AtomicU32::new(initial_ack),
            state: RwLock::new(ConnState::Idle),
            closed: AtomicBool::new(false),
            close_tx,
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
        })
    }

    /// Active open: send SYN, wait for SYN|ACK, reply ACK.
    pub async fn connect(&self) -> Result<(), FakeTcpError> {
        self.transition_from_idle(ConnState::SynSent)?;

        let mut closed = self.close_tx.subscribe();
        let mut rx = self.incoming_rx.lock().await;

        for _ in 0..RETRY_COUNT {
            if let Err(e) = self.send_segment(SYN, &[]).await {
                warn!(remote = %self.remote_addr, error = %e, "failed to send SYN");
                tokio::time::sleep(CONNECT_TIMEOUT).await;
                continue;
            }

            tokio::select! {
                _ = closed.changed() => return Err(FakeTcpError::Closed),
                res = timeout(CONNECT_TIMEOUT, rx.recv()) => {
                    let Ok(Some(data)) = res else { continue };
                    let Some(pkt) = codec::parse_tcp_packet(&data) else { continue };
                    if pkt.flags != SYN | ACK {
                        continue;
                    }

                    self.seq.fetch_add(1, Ordering::SeqCst);
                    self.ack.store(pkt.seq.wrapping_add(1), Ordering::SeqCst);
                    self.last_ack.store(pkt.seq.wrapping_add(1), Ordering::SeqCst);

                    if let Err(e) = self.send_segment(ACK, &[]).await {
                        warn!(remote = %self.remote_addr, error = %e, "failed to send ACK");
                        continue;
                    }

                    self.set_state(ConnState::Established);
                    debug!(local = %self.local_addr, remote = %self.remote_addr,
                           "pseudo-tcp connection established");
                    return Ok(());
                }
            }
        }

        self.set_state(ConnState::Closed);
        Err(FakeTcpError::Timeout)
    }

    /// Passive open: the stack matched a SYN to a listening port and created
    /// this socket; answer SYN|ACK and wait for the final ACK.
    pub async fn accept(&self, syn_seq: u32) -> Result<(), FakeTcpError> {
        self.transition_from_idle(ConnState::SynReceived)?;

        self.ack.store(syn_seq.wrapping_add(1), Ordering::SeqCst);
        self.last_ack.store(syn_seq.wrapping_add(1), Ordering::SeqCst);

        if let Err(e) = self.send_segment(SYN | ACK, &[]).await {
            self.set_state(ConnState::Closed);
            return Err(e.into());
        }

        let mut closed = self.close_tx.subscribe();
        let mut rx = self.incoming_rx.lock().await;

        for _ in 0..RETRY_COUNT {
            tokio::select! {
                _ = closed.changed() => return Err(FakeTcpError::Closed),
                res = timeout(CONNECT_TIMEOUT, rx.recv()) => {
                    match res {
                        Ok(Some(data)) => {
                            let Some(pkt) = codec::parse_tcp_packet(&data) else { continue };
                            if pkt.flags & ACK == 0 {
                                continue;
                            }

                            self.seq.fetch_add(1, Ordering::SeqCst);
                            self.set_state(ConnState::Established);
                            debug!(local = %self.local_addr, remote = %self.remote_addr,
                                   "pseudo-tcp connection accepted");
                            return Ok(());
                        }
                        Ok(None) => return Err(FakeTcpError::Closed),
                        Err(_elapsed) => {
                            if let Err(e) = self.send_segment(SYN | ACK, &[]).await {
                                warn!(remote = %self.remote_addr, error = %e,
                                      "failed to resend SYN|ACK");
                            }
                        }
                    }
                }
            }
        }

        self.set_state(ConnState::Closed);
        Err(FakeTcpError::Timeout)
    }

    /// Send one datagram framed as a TCP segment. Advances `seq` by the
    /// payload length after the write; there is no retransmission.
    pub async fn send(&self, data: &[u8]) -> Result<(), FakeTcpError> {
        let state = self.state();
        if state != ConnState::Established {
            return Err(FakeTcpError::NotEstablished(state));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(FakeTcpError::Closed);
        }

        self.send_segment(ACK, data).await?;
        self.seq.fetch_add(data.len() as u32, Ordering::SeqCst);
        Ok(())
    }

    /// Receive the next non-empty payload in arrival order.
    ///
    /// Pure ACKs are silently skipped. Once the unacknowledged span exceeds
    /// [`MAX_UNACKED_LEN`] a bare ACK is sent so middlebox state stays warm.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize, FakeTcpError> {
        let mut closed = self.close_tx.subscribe();
        let mut rx = self.incoming_rx.lock().await;

        loop {
            let state = self.state();
            if state != ConnState::Established {
                return Err(FakeTcpError::NotEstablished(state));
            }

            let data = tokio::select! {
                _ = closed.changed() => return Err(FakeTcpError::Closed),
                data = rx.recv() => data.ok_or(FakeTcpError::Closed)?,
            };

            let Some(pkt) = codec::parse_tcp_packet(&data) else {
                trace!(remote = %self.remote_addr, "dropping unparseable packet");
                continue;
            };
            if pkt.payload.is_empty() {
                continue;
            }

            let new_ack = pkt.seq.wrapping_add(pkt.payload.len() as u32);
            self.ack.store(new_ack, Ordering::SeqCst);

            let last_ack = self.last_ack.load(Ordering::SeqCst);
            if new_ack.wrapping_sub(last_ack) > MAX_UNACKED_LEN {
                self.last_ack.store(new_ack, Ordering::SeqCst);
                if let Err(e) = self.send_segment(ACK, &[]).await {
                    warn!(remote = %self.remote_addr, error = %e, "failed to send bare ACK");
                }
            }

            let n = pkt.payload.len().min(buf.len());
            buf[..n].copy_from_slice(&pkt.payload[..n]);
            return Ok(n);
        }
    }

    /// Close the socket. Idempotent; unregisters from the stack and wakes
    /// every pending operation. No FIN or RST is emitted.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(ConnState::Closed);
        let _ = self.close_tx.send(true);

        if let Some(stack) = self.stack.upgrade() {
            stack.unregister(self.local_addr, self.remote_addr);
        }
        debug!(local = %self.local_addr, remote = %self.remote_addr, "pseudo-tcp socket closed");
    }

    /// Local side of the connection tuple.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remote side of the connection tuple.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        *self.state.read().expect("state lock")
    }

    /// Current send sequence number.
    pub fn seq(&self) -> u32 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Current receive acknowledgement number.
    pub fn ack(&self) -> u32 {
        self.ack.load(Ordering::SeqCst)
    }

    /// Enqueue a raw packet read from the tunnel. Drops with a warning when
    /// the queue is full; never blocks the stack reader.
    pub(crate) fn handle_incoming(&self, data: &[u8]) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self.incoming_tx.try_send(data.to_vec()).is_err() {
            warn!(local = %self.local_addr, remote = %self.remote_addr,
                  "incoming queue full, dropping packet");
        }
    }

    fn transition_from_idle(&self, next: ConnState) -> Result<(), FakeTcpError> {
        let mut state = self.state.write().expect("state lock");
        if *state != ConnState::Idle {
            return Err(FakeTcpError::NotIdle(*state));
        }
        *state = next;
        Ok(())
    }

    fn set_state(&self, next: ConnState) {
        *self.state.write().expect("state lock") = next;
    }

    async fn send_segment(&self, flags: u8, payload: &[u8]) -> std::io::Result<()> {
        let seq = self.seq.load(Ordering::SeqCst);
        let ack = self.ack.load(Ordering::SeqCst);
        let packet =
            codec::build_tcp_packet(self.local_addr, self.remote_addr, seq, ack, flags, payload);
        self.link.send_packet(&packet).await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Stack
// ----------------------------------------------------------------------------

struct StackInner {
    tuns: Vec<Arc<Tun>>,
    local_v4: Option<IpAddr>,
    local_v6: Option<IpAddr>,
    listening: RwLock<HashSet<u16>>,
    sockets: RwLock<HashMap<(SocketAddr, SocketAddr), Arc<Socket>>>,
    accept_tx: mpsc::Sender<Arc<Socket>>,
    stop_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl StackInner {
    fn unregister(&self, local: SocketAddr, remote: SocketAddr) {
        self.sockets
            .write()
            .expect("sockets lock")
            .remove(&(local, remote));
    }
}

/// Owns the tunnel queues and demultiplexes inbound packets into sockets.
///
/// The connection identifier is the `(local, remote)` address tuple from the
/// local node's perspective: the destination of an arriving packet is the
/// local side.
pub struct Stack {
    inner: Arc<StackInner>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Socket>>>,
    readers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Stack {
    /// Start a stack over the given tunnel queues, spawning one reader task
    /// per queue.
    pub fn new(tuns: Vec<Tun>, local_v4: Option<IpAddr>, local_v6: Option<IpAddr>) -> Arc<Self> {
        let tuns: Vec<Arc<Tun>> = tuns.into_iter().map(Arc::new).collect();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_SIZE);
        let (stop_tx, _) = watch::channel(false);

        let inner = Arc::new(StackInner {
            tuns: tuns.clone(),
            local_v4,
            local_v6,
            listening: RwLock::new(HashSet::new()),
            sockets: RwLock::new(HashMap::new()),
            accept_tx,
            stop_tx,
            closed: AtomicBool::new(false),
        });

        let mut readers = Vec::with_capacity(tuns.len());
        for tun in &tuns {
            let inner = inner.clone();
            let tun = tun.clone();
            readers.push(tokio::spawn(async move {
                packet_reader(inner, tun).await;
            }));
        }

        Arc::new(Self {
            inner,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            readers: std::sync::Mutex::new(readers),
        })
    }

    /// Number of tunnel queues backing this stack.
    pub fn queue_count(&self) -> usize {
        self.inner.tuns.len()
    }

    /// Start accepting SYNs addressed to `port`.
    pub fn listen(&self, port: u16) -> Result<(), FakeTcpError> {
        let mut listening = self.inner.listening.write().expect("listening lock");
        if !listening.insert(port) {
            return Err(FakeTcpError::AlreadyListening(port));
        }
        debug!(port, "pseudo-tcp stack listening");
        Ok(())
    }

    /// Wait for the next fully-handshaken inbound connection.
    pub async fn accept(&self) -> Result<Arc<Socket>, FakeTcpError> {
        let mut stop = self.inner.stop_tx.subscribe();
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            _ = stop.changed() => Err(FakeTcpError::Closed),
            sock = rx.recv() => sock.ok_or(FakeTcpError::Closed),
        }
    }

    /// Active open to `remote` from `local_port`, using the local address of
    /// the matching family.
    pub async fn connect(
        self: &Arc<Self>,
        local_port: u16,
        remote: SocketAddr,
    ) -> Result<Arc<Socket>, FakeTcpError> {
        let local_ip = if remote.is_ipv4() {
            self.inner.local_v4
        } else {
            self.inner.local_v6
        }
        .ok_or(FakeTcpError::NoLocalAddress)?;
        let local = SocketAddr::new(local_ip, local_port);

        let link: Arc<dyn PacketLink> = self.inner.tuns[0].clone();
        let sock = Socket::new(Arc::downgrade(&self.inner), link, local, remote, 0);

        self.inner
            .sockets
            .write()
            .expect("sockets lock")
            .insert((local, remote), sock.clone());

        if let Err(e) = sock.connect().await {
            self.inner.unregister(local, remote);
            return Err(e);
        }
        Ok(sock)
    }

    /// Close the stack: stop the readers, close the tunnel queues, then
    /// close every socket. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.stop_tx.send(true);

        for tun in &self.inner.tuns {
            tun.close();
        }

        let readers: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.readers.lock().expect("readers lock"));
        for handle in readers {
            let _ = handle.await;
        }

        let sockets: Vec<Arc<Socket>> = self
            .inner
            .sockets
            .write()
            .expect("sockets lock")
            .drain()
            .map(|(_, s)| s)
            .collect();
        for sock in sockets {
            sock.close();
        }
        debug!("pseudo-tcp stack closed");
    }
}

async fn packet_reader(inner: Arc<StackInner>, tun: Arc<Tun>) {
    let mut stop = inner.stop_tx.subscribe();
    let mut buf = vec![0u8; MAX_PACKET_LEN];

    loop {
        let n = tokio::select! {
            _ = stop.changed() => return,
            res = tun.recv(&mut buf) => match res {
                Ok(n) => n,
                Err(e) => {
                    if inner.closed.load(Ordering::Acquire) {
                        return;
                    }
                    warn!(error = %e, "tunnel read error");
                    continue;
                }
            },
        };
        if n == 0 {
            continue;
        }
        handle_packet(&inner, &buf[..n]);
    }
}

fn handle_packet(inner: &Arc<StackInner>, raw: &[u8]) {
    let Some(pkt) = codec::parse_tcp_packet(raw) else {
        return;
    };

    // Destination of the arriving packet is our side of the tuple.
    let local = pkt.dst_addr();
    let remote = pkt.src_addr();

    let existing = inner
        .sockets
        .read()
        .expect("sockets lock")
        .get(&(local, remote))
        .cloned();
    if let Some(sock) = existing {
        sock.handle_incoming(raw);
        return;
    }

    // New connection: a pure SYN aimed at a listening port.
    if pkt.flags != SYN {
        return;
    }
    if !inner
        .listening
        .read()
        .expect("listening lock")
        .contains(&pkt.dst_port)
    {
        return;
    }

    let link: Arc<dyn PacketLink> = inner.tuns[0].clone();
    let sock = Socket::new(Arc::downgrade(inner), link, local, remote, 0);
    inner
        .sockets
        .write()
        .expect("sockets lock")
        .insert((local, remote), sock.clone());

    let syn_seq = pkt.seq;
    let accept_tx = inner.accept_tx.clone();
    let mut stop = inner.stop_tx.subscribe();
    tokio::spawn(async move {
        if let Err(e) = sock.accept(syn_seq).await {
            warn!(remote = %sock.remote_addr(), error = %e, "failed to accept connection");
            sock.close();
            return;
        }
        tokio::select! {
            _ = stop.changed() => {}
            _ = accept_tx.send(sock) => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    /// In-memory link that forwards every built segment into the far
    /// socket's incoming queue, optionally dropping packets.
    struct TestLink {
        peer: std::sync::Mutex<Option<Arc<Socket>>>,
        drop_all: AtomicBool,
    }

    impl TestLink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                peer: std::sync::Mutex::new(None),
                drop_all: AtomicBool::new(false),
            })
        }

        fn attach(&self, peer: Arc<Socket>) {
            *self.peer.lock().unwrap() = Some(peer);
        }
    }

    #[async_trait]
    impl PacketLink for TestLink {
        async fn send_packet(&self, packet: &[u8]) -> std::io::Result<usize> {
            if self.drop_all.load(Ordering::Relaxed) {
                return Ok(packet.len());
            }
            if let Some(peer) = self.peer.lock().unwrap().clone() {
                peer.handle_incoming(packet);
            }
            Ok(packet.len())
        }
    }

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 200, last)), port)
    }

    fn socket_pair() -> (Arc<Socket>, Arc<Socket>, Arc<TestLink>, Arc<TestLink>) {
        let client_link = TestLink::new();
        let server_link = TestLink::new();

        let client = Socket::new(
            Weak::new(),
            client_link.clone() as Arc<dyn PacketLink>,
            addr(1, 40000),
            addr(2, 443),
            0,
        );
        let server = Socket::new(
            Weak::new(),
            server_link.clone() as Arc<dyn PacketLink>,
            addr(2, 443),
            addr(1, 40000),
            0,
        );

        client_link.attach(server.clone());
        server_link.attach(client.clone());
        (client, server, client_link, server_link)
    }

    #[tokio::test]
    async fn handshake_establishes_both_sides() {
        let (client, server, _cl, _sl) = socket_pair();

        let client_isn = client.seq();

        // Server side: pull the SYN out of its queue the way the stack
        // reader would, then run accept concurrently with connect.
        let server2 = server.clone();
        let accept = tokio::spawn(async move { server2.accept(client_isn).await });
        client.connect().await.expect("connect");
        accept.await.unwrap().expect("accept");

        assert_eq!(client.state(), ConnState::Established);
        assert_eq!(server.state(), ConnState::Established);
        assert_eq!(client.seq(), client_isn.wrapping_add(1));
        assert_eq!(server.ack(), client_isn.wrapping_add(1));
        assert_eq!(client.ack(), server.seq());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out_after_all_retries() {
        let (client, _server, client_link, _sl) = socket_pair();
        client_link.drop_all.store(true, Ordering::Relaxed);

        let started = tokio::time::Instant::now();
        let err = client.connect().await.expect_err("must time out");
        assert!(matches!(err, FakeTcpError::Timeout));
        assert_eq!(client.state(), ConnState::Closed);
        assert_eq!(
            started.elapsed(),
            CONNECT_TIMEOUT * RETRY_COUNT as u32,
            "timeout must be exactly RETRY_COUNT attempts"
        );
    }

    #[tokio::test]
    async fn send_and_recv_carry_datagrams() {
        let (client, server, _cl, _sl) = socket_pair();
        let client_isn = client.seq();

        let server2 = server.clone();
        let accept = tokio::spawn(async move { server2.accept(client_isn).await });
        client.connect().await.unwrap();
        accept.await.unwrap().unwrap();

        let seq_before = client.seq();
        client.send(b"hello").await.unwrap();
        client.send(b"world!").await.unwrap();
        assert_eq!(client.seq(), seq_before.wrapping_add(11));

        let mut buf = [0u8; 64];
        let n = server.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        let n = server.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world!");
    }

    #[tokio::test]
    async fn recv_skips_pure_acks() {
        let (client, server, _cl, _sl) = socket_pair();
        let client_isn = client.seq();

        let server2 = server.clone();
        let accept = tokio::spawn(async move { server2.accept(client_isn).await });
        client.connect().await.unwrap();
        accept.await.unwrap().unwrap();

        // A bare ACK followed by data: recv must deliver only the data.
        client.send_segment(ACK, &[]).await.unwrap();
        client.send(b"payload").await.unwrap();

        let mut buf = [0u8; 16];
        let n = server.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"payload");
    }

    #[tokio::test]
    async fn send_requires_established() {
        let (client, _server, _cl, _sl) = socket_pair();
        let err = client.send(b"nope").await.expect_err("must fail");
        assert!(matches!(err, FakeTcpError::NotEstablished(ConnState::Idle)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_operations() {
        let (client, _server, _cl, _sl) = socket_pair();
        client.close();
        client.close();
        assert_eq!(client.state(), ConnState::Closed);

        let err = client.connect().await.expect_err("closed socket");
        assert!(matches!(err, FakeTcpError::NotIdle(ConnState::Closed)));
    }

    #[tokio::test]
    async fn queue_overflow_drops_without_blocking() {
        let (client, _server, _cl, _sl) = socket_pair();
        let pkt = codec::build_tcp_packet(addr(2, 443), addr(1, 40000), 1, 1, ACK, b"x");
        for _ in 0..INCOMING_QUEUE_SIZE + 10 {
            client.handle_incoming(&pkt);
        }
        // No deadlock, no panic; the excess packets were discarded.
    }

    #[tokio::test]
    async fn seq_wraps_modulo_2_32() {
        let (client, server, _cl, _sl) = socket_pair();
        let client_isn = client.seq();

        let server2 = server.clone();
        let accept = tokio::spawn(async move { server2.accept(client_isn).await });
        client.connect().await.unwrap();
        accept.await.unwrap().unwrap();

        client.seq.store(u32::MAX - 1, Ordering::SeqCst);
        client.send(b"abcd").await.unwrap();
        assert_eq!(client.seq(), 2); // wrapped
    }
}
