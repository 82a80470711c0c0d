//! # Peer Send Engine
//!
//! A peer owns up to four wire endpoints — UDP and pseudo-TCP, each in both
//! address families — and [`Peer::send_buffer`] picks among them:
//!
//! ```text
//! active_af == 6:  UDP v6 ──fail──► UDP v4 ──fail──► pseudo-TCP
//! active_af == 4:  UDP v4 ──fail──► UDP v6 (recovery probe) ──► pseudo-TCP
//! ```
//!
//! IPv6 is the preferred family; a failed v6 send flips `active_af` to 4 and
//! repoints the legacy single-endpoint aliases so direct consumers see a
//! consistent view. While on v4, a v6 attempt runs only after v4 itself
//! fails, and the first v6 success flips the peer back.
//!
//! Endpoint admission (connect URLs and roaming packets) enforces the
//! private-address policy from [`crate::endpoint`]; static endpoints are
//! never overwritten by roaming, and non-static roamed endpoints are handed
//! to the configured [`EndpointStore`] for persistence.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::bind::{BindError, Bind};
use crate::config::EndpointStore;
use crate::device::{BindSlots, NetTable};
use crate::endpoint::{EnabledAf, Endpoint, EndpointError, is_private_ip, resolve_url};
use crate::trylist::EndpointTryList;

/// Staged outbound packets per peer before the sequential sender drains
/// them.
pub const OUTBOUND_QUEUE_SIZE: usize = 1024;

/// Sentinel for "no latency measurement yet".
pub const LATENCY_INFINITY: f64 = f64::INFINITY;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ----------------------------------------------------------------------------
// Node identity
// ----------------------------------------------------------------------------

/// Small integer identifying a node within the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    /// The supernode's reserved identifier.
    pub const SUPERNODE: NodeId = NodeId(u32::MAX);
    /// IDs at or above this value are reserved for infrastructure roles.
    pub const SPECIAL: NodeId = NodeId(u32::MAX - 1000);

    pub fn is_supernode(self) -> bool {
        self == Self::SUPERNODE
    }

    /// True for ordinary edge nodes.
    pub fn is_normal(self) -> bool {
        self.0 < Self::SPECIAL.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_supernode() {
            write!(f, "supernode")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

/// Failures of peer operations.
#[derive(Debug)]
pub enum PeerError {
    /// Send attempted before any endpoint was installed.
    NoEndpoint,
    /// Admission rejected every resolved address for a connect URL.
    NoValidEndpoint(String),
    /// Every transport leg failed for this packet.
    SendFailed(String),
    /// The staged outbound queue is full.
    QueueFull,
    /// The connect URL did not resolve.
    Resolve(EndpointError),
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerError::NoEndpoint => write!(f, "no known endpoint for peer"),
            PeerError::NoValidEndpoint(url) => {
                write!(f, "no valid endpoint admitted for {url:?}")
            }
            PeerError::SendFailed(e) => write!(f, "failed to send packet: {e}"),
            PeerError::QueueFull => write!(f, "outbound queue full"),
            PeerError::Resolve(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PeerError {}

impl From<EndpointError> for PeerError {
    fn from(e: EndpointError) -> Self {
        PeerError::Resolve(e)
    }
}

// ----------------------------------------------------------------------------
// Latency damping filter
// ----------------------------------------------------------------------------

/// Median-of-window filter smoothing single-way latency samples. A window
/// smaller than three, or an infinite sample, bypasses the filter entirely.
pub struct LatencyFilter {
    inner: Mutex<FilterState>,
}

struct FilterState {
    size: usize,
    window: Vec<f64>,
    value: f64,
}

impl LatencyFilter {
    pub fn new(size: usize) -> Self {
        Self {
            inner: Mutex::new(FilterState {
                size,
                window: Vec::new(),
                value: LATENCY_INFINITY,
            }),
        }
    }

    /// Feed one sample, returning the filtered value.
    pub fn push(&self, sample: f64) -> f64 {
        let mut state = self.inner.lock().expect("filter lock");
        if state.size < 3 || sample >= LATENCY_INFINITY {
            state.value = sample;
            return state.value;
        }

        state.window.push(sample);
        let size = state.size;
        if state.window.len() > size {
            state.window.remove(0);
        }

        // Median over an odd-sized suffix of the window.
        let mut window = state.window.as_slice();
        if window.len() % 2 == 0 {
            window = &window[1..];
        }
        if window.len() < 3 {
            state.value = sample;
            return state.value;
        }

        let mut sorted = window.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        state.value = sorted[(sorted.len() + 1) / 2 - 1];
        state.value
    }

    /// Adjust the window size, trimming the oldest samples.
    pub fn resize(&self, size: usize) {
        let mut state = self.inner.lock().expect("filter lock");
        if state.size == size {
            return;
        }
        state.size = size;
        let len = state.window.len();
        if len > size {
            state.window.drain(..len - size);
        }
    }

    /// Current filtered value.
    pub fn value(&self) -> f64 {
        self.inner.lock().expect("filter lock").value
    }
}

// ----------------------------------------------------------------------------
// Peer
// ----------------------------------------------------------------------------

/// The endpoint quartet plus the legacy single-endpoint aliases that track
/// the active address family.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointSet {
    pub endpoint: Option<Endpoint>,
    pub faketcp_endpoint: Option<Endpoint>,
    pub v4: Option<Endpoint>,
    pub v6: Option<Endpoint>,
    pub faketcp_v4: Option<Endpoint>,
    pub faketcp_v6: Option<Endpoint>,
}

impl EndpointSet {
    fn is_empty(&self) -> bool {
        self.endpoint.is_none()
            && self.faketcp_endpoint.is_none()
            && self.v4.is_none()
            && self.v6.is_none()
    }
}

/// Behavioral knobs captured from the device configuration at peer creation.
#[derive(Debug, Clone)]
pub struct PeerOpts {
    pub dual_stack: bool,
    pub allow_private_ip: bool,
    pub disable_roaming: bool,
    pub use_p2p: bool,
    pub peer_alive_timeout: Duration,
    pub enabled_af: EnabledAf,
}

impl Default for PeerOpts {
    fn default() -> Self {
        Self {
            dual_stack: false,
            allow_private_ip: false,
            disable_roaming: false,
            use_p2p: true,
            peer_alive_timeout: Duration::from_secs(30),
            enabled_af: EnabledAf::BOTH,
        }
    }
}

/// One remote mesh node.
pub struct Peer {
    pub id: NodeId,
    net: Arc<NetTable>,
    opts: PeerOpts,

    endpoints: RwLock<EndpointSet>,
    /// Candidate URLs feeding the connect loop.
    pub trylist: EndpointTryList,

    // Per-family health. Millisecond timestamps; 0 means "never".
    v4_failed: AtomicBool,
    v6_failed: AtomicBool,
    udp_failed: AtomicBool,
    last_v4_success_ms: AtomicU64,
    last_v6_success_ms: AtomicU64,
    last_udp_success_ms: AtomicU64,
    /// 0 = unset, otherwise 4 or 6.
    active_af: AtomicU8,
    v6_recovery_start_ms: AtomicU64,

    last_packet_received_ms: AtomicU64,
    pub latency: LatencyFilter,

    static_conn: AtomicBool,
    conn_url: Mutex<String>,

    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,

    store: Option<Arc<dyn EndpointStore>>,

    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    sender_task: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    pub fn new(
        id: NodeId,
        net: Arc<NetTable>,
        opts: PeerOpts,
        store: Option<Arc<dyn EndpointStore>>,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let (stop_tx, _) = watch::channel(false);
        let trylist = EndpointTryList::new(opts.peer_alive_timeout, opts.enabled_af);
        let latency = LatencyFilter::new(0);
        latency.push(LATENCY_INFINITY);

        Arc::new(Self {
            id,
            net,
            opts,
            endpoints: RwLock::new(EndpointSet::default()),
            trylist,
            v4_failed: AtomicBool::new(false),
            v6_failed: AtomicBool::new(false),
            udp_failed: AtomicBool::new(false),
            last_v4_success_ms: AtomicU64::new(0),
            last_v6_success_ms: AtomicU64::new(0),
            last_udp_success_ms: AtomicU64::new(0),
            active_af: AtomicU8::new(0),
            v6_recovery_start_ms: AtomicU64::new(0),
            last_packet_received_ms: AtomicU64::new(0),
            latency,
            static_conn: AtomicBool::new(false),
            conn_url: Mutex::new(String::new()),
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            store,
            running: AtomicBool::new(false),
            stop_tx,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            sender_task: Mutex::new(None),
        })
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Send one wire packet, choosing a transport per the failover engine.
    /// Returns `Ok` iff exactly one underlying send succeeded.
    pub async fn send_buffer(&self, buf: &[u8]) -> Result<(), PeerError> {
        let binds = self.net.binds().read().await;
        let snapshot = *self.endpoints.read().expect("endpoints lock");
        if snapshot.is_empty() {
            return Err(PeerError::NoEndpoint);
        }

        let dual = self.opts.dual_stack && snapshot.v4.is_some() && snapshot.v6.is_some();
        let mut last_err: Option<BindError> = None;
        let sent = if dual {
            self.send_dual_stack(&binds, &snapshot, buf, &mut last_err)
                .await
        } else {
            self.send_legacy(&binds, &snapshot, buf, &mut last_err).await
        };

        if sent {
            self.tx_bytes.fetch_add(buf.len() as u64, Ordering::Relaxed);
            Ok(())
        } else {
            Err(PeerError::SendFailed(
                last_err.map_or_else(|| "no transport attempted".into(), |e| e.to_string()),
            ))
        }
    }

    async fn send_dual_stack(
        &self,
        binds: &BindSlots,
        snapshot: &EndpointSet,
        buf: &[u8],
        last_err: &mut Option<BindError>,
    ) -> bool {
        let active_af = match self.active_af.load(Ordering::Acquire) {
            0 => {
                self.active_af.store(6, Ordering::Release);
                6
            }
            af => af,
        };

        if active_af == 6 {
            if self.try_v6_send(binds, snapshot, buf, false, last_err).await {
                return true;
            }
            if self.try_v4_send(binds, snapshot, buf, last_err).await {
                return true;
            }
        } else {
            if self.try_v4_send(binds, snapshot, buf, last_err).await {
                return true;
            }
            // Recovery probe: bypass the failed flag while demoted.
            if self.try_v6_send(binds, snapshot, buf, true, last_err).await {
                debug!(peer = %self.id, "ipv6 recovered");
                return true;
            }
        }
        self.try_faketcp_send(binds, snapshot, buf, last_err).await
    }

    async fn try_v6_send(
        &self,
        binds: &BindSlots,
        snapshot: &EndpointSet,
        buf: &[u8],
        recovery_probe: bool,
        last_err: &mut Option<BindError>,
    ) -> bool {
        let Some(endpoint) = snapshot.v6 else {
            return false;
        };
        if !recovery_probe && self.v6_failed.load(Ordering::Acquire) {
            return false;
        }
        let Some(bind) = &binds.udp else {
            return false;
        };

        match bind.send(buf, &endpoint).await {
            Ok(()) => {
                self.last_v6_success_ms.store(now_millis(), Ordering::Release);
                self.v6_failed.store(false, Ordering::Release);
                self.v6_recovery_start_ms.store(0, Ordering::Release);
                if self.active_af.swap(6, Ordering::AcqRel) != 6 {
                    let mut eps = self.endpoints.write().expect("endpoints lock");
                    eps.endpoint = eps.v6;
                    eps.faketcp_endpoint = eps.faketcp_v6;
                }
                trace!(peer = %self.id, "sent over udp v6");
                true
            }
            Err(e) => {
                debug!(peer = %self.id, error = %e, "udp v6 send failed");
                self.v6_failed.store(true, Ordering::Release);
                if recovery_probe && self.v6_recovery_start_ms.load(Ordering::Acquire) == 0 {
                    self.v6_recovery_start_ms.store(now_millis(), Ordering::Release);
                }
                if snapshot.v4.is_some() && self.active_af.swap(4, Ordering::AcqRel) != 4 {
                    let mut eps = self.endpoints.write().expect("endpoints lock");
                    eps.endpoint = eps.v4;
                    eps.faketcp_endpoint = eps.faketcp_v4;
                    debug!(peer = %self.id, "failed over to ipv4");
                }
                *last_err = Some(e);
                false
            }
        }
    }

    async fn try_v4_send(
        &self,
        binds: &BindSlots,
        snapshot: &EndpointSet,
        buf: &[u8],
        last_err: &mut Option<BindError>,
    ) -> bool {
        let Some(endpoint) = snapshot.v4 else {
            return false;
        };
        if self.v4_failed.load(Ordering::Acquire) {
            return false;
        }
        let Some(bind) = &binds.udp else {
            return false;
        };

        match bind.send(buf, &endpoint).await {
            Ok(()) => {
                self.last_v4_success_ms.store(now_millis(), Ordering::Release);
                self.v4_failed.store(false, Ordering::Release);
                trace!(peer = %self.id, "sent over udp v4");
                true
            }
            Err(e) => {
                debug!(peer = %self.id, error = %e, "udp v4 send failed");
                self.v4_failed.store(true, Ordering::Release);
                *last_err = Some(e);
                false
            }
        }
    }

    async fn try_faketcp_send(
        &self,
        binds: &BindSlots,
        snapshot: &EndpointSet,
        buf: &[u8],
        last_err: &mut Option<BindError>,
    ) -> bool {
        let Some(bind) = &binds.faketcp else {
            return false;
        };

        // Active family first, then whatever is configured.
        let endpoint = match self.active_af.load(Ordering::Acquire) {
            6 => snapshot.faketcp_v6.or(snapshot.faketcp_v4),
            4 => snapshot.faketcp_v4.or(snapshot.faketcp_v6),
            _ => snapshot.faketcp_v4.or(snapshot.faketcp_v6),
        }
        .or(snapshot.faketcp_endpoint);
        let Some(endpoint) = endpoint else {
            return false;
        };

        match bind.send(buf, &endpoint).await {
            Ok(()) => {
                debug!(peer = %self.id, endpoint = %endpoint, "sent over pseudo-tcp");
                true
            }
            Err(e) => {
                warn!(peer = %self.id, endpoint = %endpoint, error = %e, "pseudo-tcp send failed");
                *last_err = Some(e);
                false
            }
        }
    }

    async fn send_legacy(
        &self,
        binds: &BindSlots,
        snapshot: &EndpointSet,
        buf: &[u8],
        last_err: &mut Option<BindError>,
    ) -> bool {
        if let (Some(endpoint), Some(bind)) = (snapshot.endpoint, &binds.udp) {
            if !self.udp_failed.load(Ordering::Acquire) {
                match bind.send(buf, &endpoint).await {
                    Ok(()) => {
                        self.last_udp_success_ms.store(now_millis(), Ordering::Release);
                        self.udp_failed.store(false, Ordering::Release);
                        return true;
                    }
                    Err(e) => {
                        debug!(peer = %self.id, error = %e, "udp send failed, trying pseudo-tcp");
                        self.udp_failed.store(true, Ordering::Release);
                        *last_err = Some(e);
                    }
                }
            }
        }

        self.try_faketcp_send(binds, snapshot, buf, last_err).await
    }

    // ------------------------------------------------------------------
    // Endpoint admission
    // ------------------------------------------------------------------

    /// Resolve `url` and install every address that passes the private-IP
    /// policy, in both transports. Fails if nothing survives admission.
    pub async fn set_endpoint_from_conn_url(
        &self,
        url: &str,
        af: EnabledAf,
        af_prefer: u8,
        static_conn: bool,
    ) -> Result<(), PeerError> {
        debug!(peer = %self.id, url, static_conn, "setting endpoint from connect URL");

        let resolved = resolve_url(url, af).await?;
        let binds = self.net.binds().read().await;
        let has_faketcp = binds.faketcp.is_some();

        let admit = |addr: SocketAddr| -> Option<Endpoint> {
            if self.opts.allow_private_ip || !is_private_ip(addr.ip()) {
                Some(Endpoint::new(addr))
            } else {
                info!(peer = %self.id, addr = %addr,
                      "skipped private endpoint (set allow_private_ip to allow)");
                None
            }
        };

        let v4 = resolved.v4.and_then(admit);
        let v6 = resolved.v6.and_then(admit);
        if v4.is_none() && v6.is_none() {
            return Err(PeerError::NoValidEndpoint(url.to_string()));
        }

        let primary_af = match af_prefer {
            6 if v6.is_some() => 6,
            4 if v4.is_some() => 4,
            _ if v6.is_some() => 6,
            _ => 4,
        };

        {
            let mut eps = self.endpoints.write().expect("endpoints lock");
            if let Some(endpoint) = v4 {
                eps.v4 = Some(endpoint);
                if has_faketcp {
                    eps.faketcp_v4 = Some(endpoint);
                }
                self.v4_failed.store(false, Ordering::Release);
            }
            if let Some(endpoint) = v6 {
                eps.v6 = Some(endpoint);
                if has_faketcp {
                    eps.faketcp_v6 = Some(endpoint);
                }
                self.v6_failed.store(false, Ordering::Release);
            }
            if primary_af == 6 {
                eps.endpoint = eps.v6;
                eps.faketcp_endpoint = eps.faketcp_v6;
            } else {
                eps.endpoint = eps.v4;
                eps.faketcp_endpoint = eps.faketcp_v4;
            }
            self.udp_failed.store(false, Ordering::Release);
        }

        self.active_af.store(primary_af, Ordering::Release);
        self.static_conn.store(static_conn, Ordering::Release);
        *self.conn_url.lock().expect("conn url lock") = url.to_string();
        debug!(peer = %self.id, active_af = primary_af, "endpoint installed");
        Ok(())
    }

    /// Roaming: adopt the source endpoint of an authenticated inbound
    /// packet. Gated on the roaming flag and the private-IP policy; the
    /// supernode additionally teaches us which local address routes out.
    pub fn set_endpoint_from_packet(&self, endpoint: Endpoint) {
        if self.opts.disable_roaming {
            return;
        }

        let source_ip = endpoint.dst_ip();
        if !self.opts.allow_private_ip && is_private_ip(source_ip) {
            info!(peer = %self.id, endpoint = %endpoint,
                  "rejected roaming update from private address (set allow_private_ip to allow)");
            return;
        }

        if self.id.is_supernode() {
            match local_ip_toward(endpoint.dst()) {
                Some(local) => self.net.set_local_ip(local),
                None => {
                    info!(peer = %self.id, endpoint = %endpoint,
                          "could not learn local address toward supernode");
                    return;
                }
            }
        }

        let changed = {
            let eps = self.endpoints.read().expect("endpoints lock");
            eps.endpoint.map(|e| e.dst_ip()) != Some(source_ip)
        };

        if changed
            && !self.static_conn.load(Ordering::Acquire)
            && self.opts.use_p2p
            && let Some(store) = &self.store
        {
            let store = store.clone();
            let id = self.id;
            let url = endpoint.to_string();
            // Persistence rewrites a file; keep it off the packet path.
            tokio::task::spawn_blocking(move || store.endpoint_changed(id, &url));
        }

        let mut eps = self.endpoints.write().expect("endpoints lock");
        eps.endpoint = Some(endpoint);
        match endpoint.dst() {
            SocketAddr::V4(_) => {
                eps.v4 = Some(endpoint);
                self.v4_failed.store(false, Ordering::Release);
            }
            SocketAddr::V6(_) => {
                eps.v6 = Some(endpoint);
                self.v6_failed.store(false, Ordering::Release);
            }
        }
        trace!(peer = %self.id, endpoint = %endpoint, "roamed endpoint");
    }

    // ------------------------------------------------------------------
    // Liveness and accounting
    // ------------------------------------------------------------------

    /// Record an authenticated inbound packet from this peer.
    pub fn note_packet_received(&self, bytes: usize) {
        self.last_packet_received_ms.store(now_millis(), Ordering::Release);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// A peer is alive when it has an endpoint and produced traffic within
    /// the alive timeout.
    pub fn is_peer_alive(&self) -> bool {
        if self.endpoints.read().expect("endpoints lock").is_empty() {
            return false;
        }
        let last = self.last_packet_received_ms.load(Ordering::Acquire);
        if last == 0 {
            return false;
        }
        let timeout_ms = self.opts.peer_alive_timeout.as_millis() as u64;
        now_millis() <= last + timeout_ms
    }

    /// Currently active address family (0 while unset).
    pub fn active_af(&self) -> u8 {
        self.active_af.load(Ordering::Acquire)
    }

    /// Snapshot of the installed endpoints.
    pub fn endpoints(&self) -> EndpointSet {
        *self.endpoints.read().expect("endpoints lock")
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    pub fn is_static(&self) -> bool {
        self.static_conn.load(Ordering::Acquire)
    }

    /// The connect URL this peer was last configured with.
    pub fn conn_url(&self) -> String {
        self.conn_url.lock().expect("conn url lock").clone()
    }

    /// Millisecond timestamps of the last successful UDP send per family
    /// (`(v4, v6)`, 0 = never).
    pub fn last_success_ms(&self) -> (u64, u64) {
        (
            self.last_v4_success_ms.load(Ordering::Acquire),
            self.last_v6_success_ms.load(Ordering::Acquire),
        )
    }

    /// Millisecond timestamp of the last successful legacy-path UDP send.
    pub fn last_udp_success_ms(&self) -> u64 {
        self.last_udp_success_ms.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Stage one packet for the sequential sender.
    pub fn queue_packet(&self, packet: Vec<u8>) -> Result<(), PeerError> {
        self.outbound_tx.try_send(packet).map_err(|_| {
            warn!(peer = %self.id, "outbound queue full, dropping packet");
            PeerError::QueueFull
        })
    }

    /// Start the sequential sender. Outbound packets observe the order they
    /// were staged.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(mut rx) = self.outbound_rx.lock().expect("outbound rx lock").take() else {
            return;
        };
        debug!(peer = %self.id, "starting");

        let peer = self.clone();
        let mut stop = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                let packet = tokio::select! {
                    _ = stop.changed() => return,
                    pkt = rx.recv() => match pkt {
                        Some(pkt) => pkt,
                        None => return,
                    },
                };
                if let Err(e) = peer.send_buffer(&packet).await {
                    debug!(peer = %peer.id, error = %e, "staged packet not sent");
                }
            }
        });
        *self.sender_task.lock().expect("sender task lock") = Some(handle);
    }

    /// Stop the sequential sender and wait for it to exit.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!(peer = %self.id, "stopping");
        let _ = self.stop_tx.send(true);
        let handle = self.sender_task.lock().expect("sender task lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Learn which local address the kernel routes toward `dst`, by connecting
/// an ephemeral UDP socket (no packet is sent).
fn local_ip_toward(dst: SocketAddr) -> Option<IpAddr> {
    let wildcard: SocketAddr = match dst {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    let sock = std::net::UdpSocket::bind(wildcard).ok()?;
    sock.connect(dst).ok()?;
    Some(sock.local_addr().ok()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::UdpBind;
    use crate::device::NetTable;

    async fn net_with_udp(af: EnabledAf) -> (Arc<NetTable>, u16) {
        let bind: Arc<dyn Bind> = Arc::new(UdpBind::new(af));
        let (_sources, port) = bind.open(0).await.expect("open udp bind");
        let net = NetTable::new(BindSlots {
            udp: Some(bind),
            faketcp: None,
        });
        (net, port)
    }

    fn test_peer(net: Arc<NetTable>, opts: PeerOpts) -> Arc<Peer> {
        Peer::new(NodeId(2), net, opts, None)
    }

    #[tokio::test]
    async fn send_without_endpoint_is_an_error() {
        let (net, _) = net_with_udp(EnabledAf::V4_ONLY).await;
        let peer = test_peer(net, PeerOpts::default());
        assert!(matches!(
            peer.send_buffer(b"x").await,
            Err(PeerError::NoEndpoint)
        ));
    }

    #[tokio::test]
    async fn private_endpoint_is_rejected_by_admission() {
        let (net, _) = net_with_udp(EnabledAf::BOTH).await;
        let peer = test_peer(net, PeerOpts::default());

        let err = peer
            .set_endpoint_from_conn_url("192.168.1.5:3001", EnabledAf::BOTH, 4, false)
            .await
            .expect_err("private address must be rejected");
        assert!(matches!(err, PeerError::NoValidEndpoint(_)));
        assert!(peer.endpoints().is_empty(), "nothing may be installed");
    }

    #[tokio::test]
    async fn private_endpoint_is_admitted_when_allowed() {
        let (net, _) = net_with_udp(EnabledAf::BOTH).await;
        let opts = PeerOpts { allow_private_ip: true, ..PeerOpts::default() };
        let peer = test_peer(net, opts);

        peer.set_endpoint_from_conn_url("192.168.1.5:3001", EnabledAf::BOTH, 4, true)
            .await
            .expect("allowed private address");
        let eps = peer.endpoints();
        assert_eq!(eps.v4.unwrap().to_string(), "192.168.1.5:3001");
        assert_eq!(eps.endpoint.unwrap().to_string(), "192.168.1.5:3001");
        assert_eq!(peer.active_af(), 4);
        assert!(peer.is_static());
    }

    #[tokio::test]
    async fn dual_stack_fails_over_to_v4_and_recovers_state() {
        // The bind is v4-only, so the v6 leg deterministically fails with
        // "no socket for that address family" and the engine must fall
        // through to v4.
        let (net, port) = net_with_udp(EnabledAf::V4_ONLY).await;
        let opts = PeerOpts {
            dual_stack: true,
            allow_private_ip: true,
            ..PeerOpts::default()
        };
        let peer = test_peer(net, opts);

        {
            let mut eps = peer.endpoints.write().unwrap();
            eps.v6 = Some(Endpoint::new("[2001:db8::1]:9".parse().unwrap()));
            eps.v4 = Some(Endpoint::new(format!("127.0.0.1:{port}").parse().unwrap()));
            eps.endpoint = eps.v6;
        }

        peer.send_buffer(b"first").await.expect("v4 leg must succeed");
        assert_eq!(peer.active_af(), 4);
        assert!(peer.v6_failed.load(Ordering::Acquire));
        assert!(!peer.v4_failed.load(Ordering::Acquire));
        // Legacy alias repointed to the surviving family.
        assert!(peer.endpoints().endpoint.unwrap().dst().is_ipv4());

        peer.send_buffer(b"second").await.expect("stays on v4");
        assert_eq!(peer.active_af(), 4);
        assert_eq!(peer.tx_bytes(), 11);
        let (v4_ok, v6_ok) = peer.last_success_ms();
        assert!(v4_ok > 0);
        assert_eq!(v6_ok, 0);
    }

    #[tokio::test]
    async fn legacy_path_marks_udp_failed_once() {
        let (net, _) = net_with_udp(EnabledAf::V4_ONLY).await;
        let opts = PeerOpts { allow_private_ip: true, ..PeerOpts::default() };
        let peer = test_peer(net, opts);

        {
            // v6 destination on a v4-only bind: the single UDP leg fails and
            // there is no pseudo-tcp bind to fall back to.
            let mut eps = peer.endpoints.write().unwrap();
            eps.endpoint = Some(Endpoint::new("[2001:db8::1]:9".parse().unwrap()));
        }

        assert!(peer.send_buffer(b"x").await.is_err());
        assert!(peer.udp_failed.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn roaming_respects_policy_and_static_flag() {
        let (net, _) = net_with_udp(EnabledAf::BOTH).await;
        let peer = test_peer(net.clone(), PeerOpts::default());

        // Private source rejected outright.
        peer.set_endpoint_from_packet(Endpoint::new("10.0.0.9:7".parse().unwrap()));
        assert!(peer.endpoints().endpoint.is_none());

        // Public source adopted.
        peer.set_endpoint_from_packet(Endpoint::new("8.8.8.8:7".parse().unwrap()));
        assert_eq!(peer.endpoints().endpoint.unwrap().to_string(), "8.8.8.8:7");
        assert!(peer.endpoints().v4.is_some());

        // Roaming disabled: nothing moves.
        let frozen = test_peer(
            net,
            PeerOpts { disable_roaming: true, ..PeerOpts::default() },
        );
        frozen.set_endpoint_from_packet(Endpoint::new("8.8.4.4:7".parse().unwrap()));
        assert!(frozen.endpoints().endpoint.is_none());
    }

    #[tokio::test]
    async fn peer_alive_tracks_recent_traffic() {
        let (net, _) = net_with_udp(EnabledAf::BOTH).await;
        let opts = PeerOpts {
            allow_private_ip: true,
            peer_alive_timeout: Duration::from_secs(30),
            ..PeerOpts::default()
        };
        let peer = test_peer(net, opts);
        assert!(!peer.is_peer_alive(), "no endpoint, no traffic");

        peer.set_endpoint_from_packet(Endpoint::new("192.0.2.5:7".parse().unwrap()));
        assert!(!peer.is_peer_alive(), "endpoint but no traffic yet");

        peer.note_packet_received(100);
        assert!(peer.is_peer_alive());
        assert_eq!(peer.rx_bytes(), 100);
    }

    #[tokio::test]
    async fn sequential_sender_drains_the_staged_queue() {
        let (net, port) = net_with_udp(EnabledAf::V4_ONLY).await;
        let opts = PeerOpts { allow_private_ip: true, ..PeerOpts::default() };
        let peer = test_peer(net, opts);
        peer.set_endpoint_from_conn_url(
            &format!("127.0.0.1:{port}"),
            EnabledAf::V4_ONLY,
            4,
            false,
        )
        .await
        .unwrap();

        peer.start();
        peer.start(); // idempotent
        peer.queue_packet(b"one".to_vec()).unwrap();
        peer.queue_packet(b"two".to_vec()).unwrap();

        // Give the sender a moment, then stop and verify accounting.
        tokio::time::sleep(Duration::from_millis(50)).await;
        peer.stop().await;
        assert_eq!(peer.tx_bytes(), 6);
    }

    #[test]
    fn latency_filter_medians_over_the_window() {
        let filter = LatencyFilter::new(5);
        for sample in [10.0, 50.0, 20.0] {
            filter.push(sample);
        }
        assert_eq!(filter.value(), 20.0, "median of three");

        filter.push(1000.0); // spike is damped away
        filter.push(30.0);
        assert!(filter.value() < 1000.0);
    }

    #[test]
    fn latency_filter_small_window_passes_through() {
        let filter = LatencyFilter::new(0);
        assert_eq!(filter.push(42.0), 42.0);
        assert_eq!(filter.push(LATENCY_INFINITY), LATENCY_INFINITY);
    }
}
