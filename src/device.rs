//! # Device
//!
//! Ties the dataplane together: the bind slot table (UDP plus optional
//! pseudo-TCP) behind a single reader/writer lock, the peer table, the
//! shared obfuscator, and one inbound pump per receive source.
//!
//! ## Data flow
//!
//! ```text
//! outbound: send_to_peer ─► obfuscator.encrypt ─► peer queue ─► send engine ─► bind
//! inbound:  bind source ─► admission ─► obfuscator.decrypt ─► InboundHandler
//! ```
//!
//! The session layer (handshake, transport decryption, TAP writes) is an
//! external collaborator behind [`InboundHandler`]; roaming decisions flow
//! back into the core through [`crate::peer::Peer::set_endpoint_from_packet`].
//!
//! Locking discipline: every send takes the bind read lock, a bind swap
//! takes the write lock. The peer table lock is never held across I/O.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::bind::{Bind, BindError, FakeTcpBind, PacketSource, UdpBind};
use crate::config::{EdgeConfig, EndpointStore};
use crate::endpoint::{EnabledAf, Endpoint, is_private_ip};
use crate::monitor::ActivityMonitor;
use crate::obfuscation::ZeroOverhead;
use crate::peer::{NodeId, Peer, PeerOpts};

/// Hard cap on the peer table.
pub const MAX_PEERS: usize = 1 << 16;

/// Wire packet size the obfuscator is dimensioned for (conservative MTU
/// minus the session-layer framing).
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1452;

/// Receive buffer handed to every pump.
const RECV_BUFFER_SIZE: usize = 65536;

/// Which bind produced an inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Udp,
    FakeTcp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Udp => write!(f, "udp"),
            TransportKind::FakeTcp => write!(f, "faketcp"),
        }
    }
}

/// Upstream consumer of deobfuscated inbound packets (the session layer).
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_packet(&self, packet: Vec<u8>, from: Endpoint, transport: TransportKind);
}

// ----------------------------------------------------------------------------
// Bind table
// ----------------------------------------------------------------------------

/// The two transport slots. Either may be absent.
#[derive(Default)]
pub struct BindSlots {
    pub udp: Option<Arc<dyn Bind>>,
    pub faketcp: Option<Arc<dyn Bind>>,
}

/// Shared network state: the bind table plus the local addresses learned
/// from supernode roaming. Peers hold this instead of the whole device,
/// which keeps the ownership graph acyclic.
pub struct NetTable {
    binds: tokio::sync::RwLock<BindSlots>,
    local_v4: Mutex<Option<IpAddr>>,
    local_v6: Mutex<Option<IpAddr>>,
}

impl NetTable {
    pub fn new(slots: BindSlots) -> Arc<Self> {
        Arc::new(Self {
            binds: tokio::sync::RwLock::new(slots),
            local_v4: Mutex::new(None),
            local_v6: Mutex::new(None),
        })
    }

    /// The bind slot table. Senders take the read side; bind updates take
    /// the write side.
    pub fn binds(&self) -> &tokio::sync::RwLock<BindSlots> {
        &self.binds
    }

    /// Record the local address that routes toward the supernode.
    pub fn set_local_ip(&self, ip: IpAddr) {
        match ip {
            IpAddr::V4(_) => *self.local_v4.lock().expect("local v4 lock") = Some(ip),
            IpAddr::V6(_) => *self.local_v6.lock().expect("local v6 lock") = Some(ip),
        }
        debug!(local = %ip, "learned local address");
    }

    pub fn local_v4(&self) -> Option<IpAddr> {
        *self.local_v4.lock().expect("local v4 lock")
    }

    pub fn local_v6(&self) -> Option<IpAddr> {
        *self.local_v6.lock().expect("local v6 lock")
    }
}

// ----------------------------------------------------------------------------
// Device
// ----------------------------------------------------------------------------

/// The dataplane root object. Owns every peer and both binds.
pub struct Device {
    pub id: NodeId,
    config: EdgeConfig,
    net: Arc<NetTable>,
    obfuscator: Arc<ZeroOverhead>,
    monitor: Arc<ActivityMonitor>,
    handler: Arc<dyn InboundHandler>,
    store: Option<Arc<dyn EndpointStore>>,
    peers: RwLock<HashMap<NodeId, Arc<Peer>>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    listen_port: AtomicU16,
    closed: AtomicBool,
}

impl Device {
    pub fn new(
        config: EdgeConfig,
        handler: Arc<dyn InboundHandler>,
        monitor: Arc<ActivityMonitor>,
        store: Option<Arc<dyn EndpointStore>>,
    ) -> Result<Arc<Self>> {
        let obfuscator = if config.obfuscation.enabled {
            let psk = config.obfuscation.decode_psk()?;
            ZeroOverhead::new(&psk, DEFAULT_MAX_PACKET_SIZE, true)
        } else {
            ZeroOverhead::new(&[], DEFAULT_MAX_PACKET_SIZE, false)
        }
        .context("construct obfuscator")?;

        let af = EnabledAf::BOTH;
        let udp: Arc<dyn Bind> = Arc::new(UdpBind::new(af));
        let faketcp: Option<Arc<dyn Bind>> = config
            .fake_tcp
            .enabled
            .then(|| Arc::new(FakeTcpBind::new(af, config.fake_tcp.to_tun_config())) as _);

        let net = NetTable::new(BindSlots { udp: Some(udp), faketcp });

        Ok(Arc::new(Self {
            id: NodeId(config.node_id),
            net,
            obfuscator: Arc::new(obfuscator),
            monitor,
            handler,
            store,
            peers: RwLock::new(HashMap::new()),
            pumps: Mutex::new(Vec::new()),
            listen_port: AtomicU16::new(config.listen_port),
            closed: AtomicBool::new(false),
            config,
        }))
    }

    /// Open the binds and start the inbound pumps. Returns the actual UDP
    /// listen port.
    pub async fn up(self: &Arc<Self>) -> Result<u16> {
        let port = self.listen_port.load(Ordering::Acquire);
        let binds = self.net.binds().read().await;

        let udp = binds.udp.as_ref().context("device has no udp bind")?;
        let (sources, actual_port) = udp
            .open(port)
            .await
            .with_context(|| format!("open udp bind on port {port}"))?;
        if self.config.fwmark != 0
            && let Err(e) = udp.set_mark(self.config.fwmark)
        {
            warn!(fwmark = self.config.fwmark, error = %e, "failed to set routing mark");
        }
        for source in sources {
            self.spawn_pump(source, TransportKind::Udp);
        }

        if let Some(faketcp) = &binds.faketcp {
            let (sources, _) = faketcp
                .open(actual_port)
                .await
                .context("open pseudo-tcp bind")?;
            for source in sources {
                self.spawn_pump(source, TransportKind::FakeTcp);
            }
        }

        self.listen_port.store(actual_port, Ordering::Release);
        info!(port = actual_port, node = %self.id, "device up");
        Ok(actual_port)
    }

    fn spawn_pump(self: &Arc<Self>, source: Arc<dyn PacketSource>, transport: TransportKind) {
        let device = self.clone();
        let handle = self.monitor.spawn_protected("inbound-pump", async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                let (n, from) = match source.recv(&mut buf).await {
                    Ok(pair) => pair,
                    Err(BindError::Closed) => return,
                    Err(e) => {
                        debug!(%transport, error = %e, "receive error");
                        continue;
                    }
                };
                device.monitor.update_activity();

                // Admission: refuse traffic from non-routable sources
                // before spending any crypto on it.
                if !device.config.allow_private_ip && is_private_ip(from.dst_ip()) {
                    trace!(%transport, from = %from, "dropping packet from private source");
                    continue;
                }

                let packet = match device.obfuscator.decrypt(&buf[..n]) {
                    Ok(packet) => packet,
                    Err(e) => {
                        debug!(%transport, from = %from, error = %e, "dropping undecryptable packet");
                        continue;
                    }
                };

                device.handler.handle_packet(packet, from, transport).await;
            }
        });
        self.pumps.lock().expect("pumps lock").push(handle);
    }

    // ------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------

    /// Create and start a peer. Fails for reserved IDs, duplicates, a full
    /// table, or a closed device.
    pub fn new_peer(&self, id: NodeId) -> Result<Arc<Peer>> {
        if self.closed.load(Ordering::Acquire) {
            bail!("device closed");
        }
        if !id.is_normal() && !id.is_supernode() {
            bail!("{} is a reserved NodeID", id.0);
        }

        let mut peers = self.peers.write().expect("peers lock");
        if peers.len() >= MAX_PEERS {
            bail!("too many peers");
        }
        if peers.contains_key(&id) {
            bail!("adding existing peer id: {id}");
        }

        debug!(node = %id, "creating peer");
        let opts = PeerOpts {
            dual_stack: self.config.dual_stack.enabled,
            allow_private_ip: self.config.allow_private_ip,
            disable_roaming: false,
            use_p2p: self.config.dynamic_route.use_p2p,
            peer_alive_timeout: Duration::from_secs(self.config.dynamic_route.peer_alive_timeout),
            enabled_af: EnabledAf::BOTH,
        };
        let peer = Peer::new(id, self.net.clone(), opts, self.store.clone());
        peer.start();
        peers.insert(id, peer.clone());
        Ok(peer)
    }

    pub fn get_peer(&self, id: NodeId) -> Option<Arc<Peer>> {
        self.peers.read().expect("peers lock").get(&id).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().expect("peers lock").len()
    }

    /// Stop and drop a peer.
    pub async fn remove_peer(&self, id: NodeId) {
        let peer = self.peers.write().expect("peers lock").remove(&id);
        if let Some(peer) = peer {
            peer.stop().await;
            debug!(node = %id, "peer removed");
        }
    }

    // ------------------------------------------------------------------
    // Send path and relay policy
    // ------------------------------------------------------------------

    /// Obfuscate a wire packet and stage it on the peer's sequential
    /// sender.
    pub fn send_to_peer(&self, id: NodeId, packet: &[u8]) -> Result<()> {
        let peer = self
            .get_peer(id)
            .with_context(|| format!("no such peer: {id}"))?;
        let wire = self
            .obfuscator
            .encrypt(packet)
            .context("obfuscate outbound packet")?;
        peer.queue_packet(wire)?;
        Ok(())
    }

    /// Whether a packet addressed to `dst` may pass through this node.
    /// With relaying disabled, transit traffic is dropped here; the routing
    /// collaborator computes next hops only for permitted packets.
    pub fn permit_transit(&self, dst: NodeId) -> bool {
        if dst == self.id {
            return true;
        }
        if self.config.disable_relay {
            info!(node = %self.id, dst = %dst, "relay disabled, dropping transit packet");
            return false;
        }
        true
    }

    /// Shared packet obfuscator.
    pub fn obfuscator(&self) -> &Arc<ZeroOverhead> {
        &self.obfuscator
    }

    /// Shared network state handed to peers.
    pub fn net(&self) -> &Arc<NetTable> {
        &self.net
    }

    /// The UDP port the device is listening on.
    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Reconfiguration and shutdown
    // ------------------------------------------------------------------

    /// Replace both binds with fresh instances and reopen them. Sends
    /// in flight finish on the old sockets; new sends use the new ones.
    pub async fn bind_update(self: &Arc<Self>) -> Result<u16> {
        info!(node = %self.id, "bind update");
        {
            let mut slots = self.net.binds().write().await;
            if let Some(bind) = &slots.udp {
                bind.close().await;
            }
            if let Some(bind) = &slots.faketcp {
                bind.close().await;
            }
            let af = EnabledAf::BOTH;
            slots.udp = Some(Arc::new(UdpBind::new(af)));
            slots.faketcp = self
                .config
                .fake_tcp
                .enabled
                .then(|| Arc::new(FakeTcpBind::new(af, self.config.fake_tcp.to_tun_config())) as _);
        }

        // Old pumps exit as their sources report Closed.
        self.reap_pumps();
        self.up().await
    }

    fn reap_pumps(&self) {
        self.pumps
            .lock()
            .expect("pumps lock")
            .retain(|handle| !handle.is_finished());
    }

    /// Stop every peer, close both binds, and join the pumps. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(node = %self.id, "device closing");

        let peers: Vec<Arc<Peer>> = self
            .peers
            .write()
            .expect("peers lock")
            .drain()
            .map(|(_, p)| p)
            .collect();
        for peer in peers {
            peer.stop().await;
        }

        {
            let binds = self.net.binds().read().await;
            if let Some(bind) = &binds.udp {
                bind.close().await;
            }
            if let Some(bind) = &binds.faketcp {
                bind.close().await;
            }
        }

        let pumps: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.pumps.lock().expect("pumps lock"));
        for handle in pumps {
            let _ = handle.await;
        }
        debug!(node = %self.id, "device closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
