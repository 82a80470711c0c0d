//! # Edge Node Configuration
//!
//! Serde-backed configuration for the dataplane, persisted as one YAML
//! document. Roaming can rewrite the peer endpoints: whenever a non-static
//! endpoint changes and `dynamic_route.save_new_peers` is on, the whole
//! document is written back so a restart reconnects where the mesh last
//! saw each peer.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::peer::NodeId;
use crate::tun::TunConfig;

/// Top-level edge node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub node_id: u32,
    pub listen_port: u16,
    /// Routing mark applied to the UDP sockets; 0 leaves them unmarked.
    pub fwmark: u32,
    /// Admit private/non-routable endpoint addresses.
    pub allow_private_ip: bool,
    /// Refuse to forward packets whose destination is another node.
    pub disable_relay: bool,
    pub dual_stack: DualStackConfig,
    pub obfuscation: ObfuscationConfig,
    pub fake_tcp: FakeTcpConfig,
    pub dynamic_route: DynamicRouteConfig,
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DualStackConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObfuscationConfig {
    pub enabled: bool,
    /// 32-byte pre-shared key, base64 encoded.
    pub psk: String,
}

impl ObfuscationConfig {
    /// Decode and validate the PSK.
    pub fn decode_psk(&self) -> Result<[u8; 32]> {
        let bytes = BASE64
            .decode(self.psk.trim())
            .context("obfuscation PSK is not valid base64")?;
        let len = bytes.len();
        bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("obfuscation PSK must decode to 32 bytes, got {len}"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FakeTcpConfig {
    pub enabled: bool,
    pub tun_name: String,
    pub tun_ipv4: Option<String>,
    pub tun_peer_ipv4: Option<String>,
    pub tun_ipv6: Option<String>,
    pub tun_peer_ipv6: Option<String>,
    pub tun_mtu: usize,
    /// Tunnel queues; 0 means one per CPU.
    pub queues: usize,
}

impl FakeTcpConfig {
    pub fn to_tun_config(&self) -> TunConfig {
        TunConfig {
            name: self.tun_name.clone(),
            mtu: self.tun_mtu,
            queues: self.queues,
            ipv4_addr: self.tun_ipv4.clone(),
            ipv4_peer: self.tun_peer_ipv4.clone(),
            ipv6_addr: self.tun_ipv6.clone(),
            ipv6_peer: self.tun_peer_ipv6.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicRouteConfig {
    /// Seconds without traffic before a peer is considered gone.
    pub peer_alive_timeout: u64,
    /// Persist endpoints learned by roaming back to the config file.
    pub save_new_peers: bool,
    /// Whether peer-to-peer endpoint discovery is active.
    pub use_p2p: bool,
}

impl Default for DynamicRouteConfig {
    fn default() -> Self {
        Self {
            peer_alive_timeout: 30,
            save_new_peers: false,
            use_p2p: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub node_id: u32,
    pub pub_key: String,
    pub endpoint: Option<String>,
    /// Static endpoints are never overwritten by roaming.
    #[serde(rename = "static")]
    pub static_conn: bool,
}

impl EdgeConfig {
    /// Load the YAML document at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        if config.obfuscation.enabled {
            config.obfuscation.decode_psk()?;
        }
        if config.fake_tcp.enabled && config.fake_tcp.tun_name.is_empty() {
            bail!("fake_tcp.tun_name is required when fake_tcp is enabled");
        }
        Ok(config)
    }

    /// Serialise the whole document back to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_yaml::to_string(self).context("serialise config")?;
        std::fs::write(path, raw).with_context(|| format!("write config {}", path.display()))
    }
}

// ----------------------------------------------------------------------------
// Endpoint persistence
// ----------------------------------------------------------------------------

/// Collaborator notified when roaming moves a non-static endpoint.
pub trait EndpointStore: Send + Sync {
    fn endpoint_changed(&self, node_id: NodeId, endpoint: &str);
}

/// Rewrites the YAML config document whenever `save_new_peers` is enabled
/// and a tracked peer's endpoint moved.
pub struct YamlEndpointStore {
    path: PathBuf,
    config: Mutex<EdgeConfig>,
}

impl YamlEndpointStore {
    pub fn new(path: PathBuf, config: EdgeConfig) -> Self {
        Self {
            path,
            config: Mutex::new(config),
        }
    }
}

impl EndpointStore for YamlEndpointStore {
    fn endpoint_changed(&self, node_id: NodeId, endpoint: &str) {
        let mut config = self.config.lock().expect("config lock");
        if !config.dynamic_route.save_new_peers {
            return;
        }

        let mut found = false;
        for peer in &mut config.peers {
            if NodeId(peer.node_id) == node_id {
                found = true;
                if !peer.static_conn {
                    peer.endpoint = Some(endpoint.to_string());
                }
            }
        }
        if !found {
            config.peers.push(PeerConfig {
                node_id: node_id.0,
                pub_key: String::new(),
                endpoint: Some(endpoint.to_string()),
                static_conn: false,
            });
        }

        match config.save(&self.path) {
            Ok(()) => debug!(node = %node_id, endpoint, "persisted roamed endpoint"),
            Err(e) => warn!(node = %node_id, error = %e, "failed to persist endpoint"),
        }
    }
}
