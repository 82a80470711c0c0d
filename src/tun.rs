//! # Layer-3 Tunnel Device
//!
//! Opens the multi-queue TUN interface that carries pseudo-TCP frames and
//! configures it through the host `ip` utility (`link set ... up`,
//! `link set ... mtu`, `addr add ... peer ...`). The device file descriptors
//! are switched to non-blocking mode and driven through tokio's `AsyncFd`,
//! so every queue reader is an ordinary async task that can be cancelled at
//! shutdown.
//!
//! Only packet I/O and interface bring-up live here; all TCP semantics are
//! in [`crate::faketcp`].

use std::os::fd::{AsRawFd, RawFd};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

const CLONE_DEVICE_PATH: &str = "/dev/net/tun";

const IFF_TUN: i16 = 0x0001;
const IFF_NO_PI: i16 = 0x1000;
const IFF_MULTI_QUEUE: i16 = 0x0100;
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

#[repr(C)]
struct IfReq {
    name: [u8; libc::IFNAMSIZ],
    flags: i16,
    _pad: [u8; 64 - libc::IFNAMSIZ - 2],
}

/// Configuration for creating the pseudo-TCP tunnel interface.
#[derive(Debug, Clone, Default)]
pub struct TunConfig {
    /// Interface name, e.g. `egtcp0`.
    pub name: String,
    /// Interface MTU; 0 means the 1500 default.
    pub mtu: usize,
    /// Number of multi-queue file descriptors; 0 means one.
    pub queues: usize,
    /// Local IPv4 address assigned to the interface.
    pub ipv4_addr: Option<String>,
    /// Point-to-point IPv4 peer address.
    pub ipv4_peer: Option<String>,
    /// Local IPv6 address assigned to the interface.
    pub ipv6_addr: Option<String>,
    /// Point-to-point IPv6 peer address.
    pub ipv6_peer: Option<String>,
}

/// One queue of the tunnel interface.
pub struct Tun {
    fd: AsyncFd<TunFd>,
    name: String,
    mtu: usize,
    closed: AtomicBool,
}

struct TunFd(RawFd);

impl AsRawFd for TunFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for TunFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

impl Tun {
    /// Open `config.queues` file descriptors on one multi-queue TUN
    /// interface, bring the link up and assign addresses.
    pub fn create(config: &TunConfig) -> Result<Vec<Tun>> {
        let mtu = if config.mtu == 0 { 1500 } else { config.mtu };
        let queues = config.queues.max(1);

        if config.name.len() >= libc::IFNAMSIZ {
            bail!("tun interface name {:?} is too long", config.name);
        }

        let mut tuns = Vec::with_capacity(queues);
        for _ in 0..queues {
            tuns.push(open_queue(&config.name, queues > 1, mtu)?);
        }

        // The queues share one interface; configure it once.
        let name = tuns[0].name.clone();
        run_ip(&["link", "set", "dev", &name, "up"])?;
        run_ip(&["link", "set", "dev", &name, "mtu", &mtu.to_string()])?;
        if let (Some(local), Some(peer)) = (&config.ipv4_addr, &config.ipv4_peer) {
            run_ip(&["addr", "add", local, "peer", peer, "dev", &name])?;
        }
        if let (Some(local), Some(peer)) = (&config.ipv6_addr, &config.ipv6_peer) {
            run_ip(&["-6", "addr", "add", local, "peer", peer, "dev", &name])?;
        }

        Ok(tuns)
    }

    /// Interface name as reported by the kernel.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured MTU.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Read one IP packet from this queue.
    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(std::io::ErrorKind::NotConnected.into());
            }
            let mut guard = self.fd.ready(Interest::READABLE).await?;
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr().cast::<libc::c_void>(),
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write one IP packet to this queue.
    pub async fn send(&self, buf: &[u8]) -> std::io::Result<usize> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(std::io::ErrorKind::NotConnected.into());
            }
            let mut guard = self.fd.ready(Interest::WRITABLE).await?;
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::write(
                        inner.as_raw_fd(),
                        buf.as_ptr().cast::<libc::c_void>(),
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Mark the queue closed. Idempotent; the descriptor itself is released
    /// on drop.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn open_queue(name: &str, multi_queue: bool, mtu: usize) -> Result<Tun> {
    let raw = unsafe {
        libc::open(
            c"/dev/net/tun".as_ptr().cast::<libc::c_char>(),
            libc::O_RDWR | libc::O_NONBLOCK,
        )
    };
    if raw < 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("open {CLONE_DEVICE_PATH}"));
    }
    let fd = TunFd(raw);

    let mut flags = IFF_TUN | IFF_NO_PI;
    if multi_queue {
        flags |= IFF_MULTI_QUEUE;
    }

    let mut req = IfReq {
        name: [0; libc::IFNAMSIZ],
        flags,
        _pad: [0; 64 - libc::IFNAMSIZ - 2],
    };
    req.name[..name.len()].copy_from_slice(name.as_bytes());

    let rc = unsafe { libc::ioctl(fd.0, TUNSETIFF as _, &req) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("ioctl(TUNSETIFF) for {name:?}"));
    }

    // The kernel fills in the final name (relevant for pattern names).
    let end = req.name.iter().position(|&b| b == 0).unwrap_or(req.name.len());
    let device_name = String::from_utf8_lossy(&req.name[..end]).into_owned();

    let fd = AsyncFd::new(fd).context("register tun fd with the reactor")?;

    Ok(Tun {
        fd,
        name: device_name,
        mtu,
        closed: AtomicBool::new(false),
    })
}

fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .with_context(|| format!("spawn ip {args:?}"))?;
    if !output.status.success() {
        bail!(
            "ip {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
