//! # EtherGuard - Mesh VPN Dataplane
//!
//! EtherGuard carries Ethernet frames between mesh nodes over authenticated,
//! encrypted tunnels. This crate is the dataplane core: everything between
//! the session layer above and the wire below.
//!
//! - **Multi-transport send path**: per-peer dual-stack UDP with automatic
//!   IPv4/IPv6 failover and a pseudo-TCP fallback for UDP-hostile networks
//! - **Pseudo-TCP carrier**: a user-space TCP-shaped datagram transport over
//!   a layer-3 tunnel device
//! - **Zero-overhead obfuscation**: every wire packet is transformed so data
//!   packets gain no bytes while control packets are padded and sealed
//! - **Endpoint scheduling**: ranked candidate lists from supernode
//!   discovery and P2P gossip drive the connect loop
//! - **Liveness monitoring**: a deadlock watchdog that turns a wedged event
//!   loop into a supervisor restart
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `device` | Bind table, peer table, inbound pumps, relay policy |
//! | `peer` | Per-peer send engine: failover, admission, roaming |
//! | `bind` | Uniform transport facade: UDP and pseudo-TCP binds |
//! | `faketcp` | Pseudo-TCP socket state machine and stack |
//! | `codec` | IPv4/IPv6 + TCP header builder/parser with checksums |
//! | `tun` | Layer-3 tunnel device and interface bring-up |
//! | `obfuscation` | Two-mode packet transform keyed by a pre-shared key |
//! | `trylist` | Ranked endpoint-candidate scheduler |
//! | `endpoint` | Endpoint value type, resolution, private-IP policy |
//! | `monitor` | Activity heartbeat and deadlock detector |
//! | `config` | YAML configuration and endpoint persistence |
//!
//! The Noise handshake, the userland Ethernet device, route computation and
//! the admin API are collaborators behind the [`InboundHandler`] and
//! [`EndpointStore`] traits; this crate never implements them.

mod bind;
mod codec;
mod config;
mod device;
mod endpoint;
mod faketcp;
mod monitor;
mod obfuscation;
mod peer;
mod trylist;
mod tun;

pub use bind::{Bind, BindError, FakeTcpBind, PacketSource, UdpBind};
pub use config::{
    DualStackConfig, DynamicRouteConfig, EdgeConfig, EndpointStore, FakeTcpConfig,
    ObfuscationConfig, PeerConfig, YamlEndpointStore,
};
pub use device::{
    BindSlots, DEFAULT_MAX_PACKET_SIZE, Device, InboundHandler, NetTable, TransportKind,
};
pub use endpoint::{
    EnabledAf, Endpoint, EndpointError, is_private_ip, is_public_ip, parse_endpoint, resolve_url,
};
pub use faketcp::{ConnState, FakeTcpError, Socket, Stack};
pub use monitor::ActivityMonitor;
pub use obfuscation::{ObfuscationError, ZeroOverhead, is_control_kind};
pub use peer::{LatencyFilter, NodeId, Peer, PeerError, PeerOpts};
pub use trylist::{AF_PREFER_BIAS, EndpointTryList};
pub use tun::{Tun, TunConfig};
