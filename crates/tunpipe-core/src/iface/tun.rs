//! TUN/TAP interface module.
//!
//! Linux opens `/dev/net/tun` and attaches with `TUNSETIFF`; the kernel
//! prepends the 4-byte protocol-info header (flags + EtherType) which is
//! carried through the tunnel as-is. macOS opens a utun control socket;
//! utun frames start with a 4-byte protocol family instead, so a compat
//! layer rewrites the prefix to the generic TUN form on the way in and
//! back on the way out. TAP devices exist only on Linux.

use std::os::fd::AsRawFd;
use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::io::set_nonblocking;
use crate::module::{Module, ModuleInfo, ModuleKind};
use crate::packet::{Direction, Packet, PacketPool};

use super::fd::{EofAction, FdEndpoint, FrameRead};
use super::IF_MTU;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunKind {
    Tun,
    Tap,
}

static TUN_INFO: ModuleInfo = ModuleInfo {
    name: "tun",
    descr: "TUN interface",
    kind: ModuleKind::Interface,
    blocking: true,
};

static TAP_INFO: ModuleInfo = ModuleInfo {
    name: "tap",
    descr: "TAP interface",
    kind: ModuleKind::Interface,
    blocking: true,
};

pub struct TunInterface {
    kind: TunKind,
    ifname: String,
    ep: FdEndpoint,
}

impl TunInterface {
    pub fn tun(conf: &Config, pool: Arc<PacketPool>) -> Result<Self> {
        Self::open(conf, pool, TunKind::Tun)
    }

    pub fn tap(conf: &Config, pool: Arc<PacketPool>) -> Result<Self> {
        Self::open(conf, pool, TunKind::Tap)
    }

    fn open(_conf: &Config, pool: Arc<PacketPool>, kind: TunKind) -> Result<Self> {
        let (fd, ifname) = platform::open_device(kind)?;
        set_nonblocking(fd.as_raw_fd(), true)?;
        let raw = fd.as_raw_fd();
        let ep = FdEndpoint::new(pool, raw, raw, vec![fd])?;
        tracing::debug!(ifname = %ifname, ?kind, "created interface");
        Ok(TunInterface { kind, ifname, ep })
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }
}

impl Module for TunInterface {
    fn info(&self) -> &'static ModuleInfo {
        match self.kind {
            TunKind::Tun => &TUN_INFO,
            TunKind::Tap => &TAP_INFO,
        }
    }

    fn run(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.ep.stop();
        Ok(())
    }

    fn process(&self, input: Option<Packet>) -> Result<Option<Packet>> {
        match input {
            None => match self.ep.read_frame(IF_MTU, EofAction::Fatal)? {
                FrameRead::Frame(mut pkt) => {
                    platform::compat_layer(&mut pkt, true);
                    Ok(Some(pkt))
                }
                FrameRead::Stopped => Ok(None),
            },
            Some(mut pkt) => {
                debug_assert_eq!(pkt.direction(), Direction::Recv);
                platform::compat_layer(&mut pkt, false);
                self.ep.write_frame(pkt)?;
                Ok(None)
            }
        }
    }

    fn mtu(&self) -> usize {
        IF_MTU
    }
}

// ─── Linux backend ──────────────────────────────────────────────────────────

#[cfg(target_os = "linux")]
mod platform {
    use super::TunKind;
    use crate::error::Result;
    use crate::packet::Packet;
    use std::fs::OpenOptions;
    use std::io;
    use std::os::fd::{AsRawFd, OwnedFd};

    const TUNSETIFF: libc::c_ulong = 0x4004_54CA;
    const IFF_TUN: libc::c_short = 0x0001;
    const IFF_TAP: libc::c_short = 0x0002;
    const IFNAMSIZ: usize = 16;

    /// The flags view of `struct ifreq` (16-byte name + 24-byte union).
    #[repr(C)]
    struct IfReq {
        name: [u8; IFNAMSIZ],
        flags: libc::c_short,
        _pad: [u8; 22],
    }

    pub(super) fn open_device(kind: TunKind) -> Result<(OwnedFd, String)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")?;
        let fd: OwnedFd = file.into();

        let mut ifr = IfReq {
            name: [0; IFNAMSIZ],
            flags: match kind {
                TunKind::Tun => IFF_TUN,
                TunKind::Tap => IFF_TAP,
            },
            _pad: [0; 22],
        };
        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF as _, &mut ifr) };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let len = ifr.name.iter().position(|&b| b == 0).unwrap_or(IFNAMSIZ);
        let ifname = String::from_utf8_lossy(&ifr.name[..len]).into_owned();
        Ok((fd, ifname))
    }

    /// Frames already carry the generic TUN/TAP header on Linux.
    pub(super) fn compat_layer(_pkt: &mut Packet, _send: bool) {}
}

// ─── macOS backend (utun) ───────────────────────────────────────────────────

#[cfg(target_os = "macos")]
mod platform {
    use super::TunKind;
    use crate::error::{Error, Result};
    use crate::packet::Packet;
    use std::io;
    use std::os::fd::{FromRawFd, OwnedFd, RawFd};

    const CTLIOCGINFO: libc::c_ulong = 0xC064_4E03;
    const UTUN_CONTROL_NAME: &[u8] = b"com.apple.net.utun_control";
    const UTUN_OPT_IFNAME: libc::c_int = 2;
    const MAX_KCTL_NAME: usize = 96;

    #[repr(C)]
    struct CtlInfo {
        ctl_id: u32,
        ctl_name: [u8; MAX_KCTL_NAME],
    }

    #[repr(C)]
    struct SockaddrCtl {
        sc_len: u8,
        sc_family: u8,
        ss_sysaddr: u16,
        sc_id: u32,
        sc_unit: u32,
        sc_reserved: [u32; 5],
    }

    pub(super) fn open_device(kind: TunKind) -> Result<(OwnedFd, String)> {
        if kind == TunKind::Tap {
            return Err(Error::Config("TAP devices are not supported on macOS".into()));
        }

        let raw: RawFd = unsafe {
            libc::socket(libc::PF_SYSTEM, libc::SOCK_DGRAM, libc::SYSPROTO_CONTROL)
        };
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut info = CtlInfo {
            ctl_id: 0,
            ctl_name: [0; MAX_KCTL_NAME],
        };
        info.ctl_name[..UTUN_CONTROL_NAME.len()].copy_from_slice(UTUN_CONTROL_NAME);
        if unsafe { libc::ioctl(raw, CTLIOCGINFO as _, &mut info) } < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let addr = SockaddrCtl {
            sc_len: std::mem::size_of::<SockaddrCtl>() as u8,
            sc_family: libc::AF_SYSTEM as u8,
            ss_sysaddr: libc::AF_SYS_CONTROL as u16,
            sc_id: info.ctl_id,
            sc_unit: 0,
            sc_reserved: [0; 5],
        };
        let rc = unsafe {
            libc::connect(
                raw,
                &addr as *const SockaddrCtl as *const libc::sockaddr,
                std::mem::size_of::<SockaddrCtl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut ifname = [0u8; 16];
        let mut len = ifname.len() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                raw,
                libc::SYSPROTO_CONTROL,
                UTUN_OPT_IFNAME,
                ifname.as_mut_ptr().cast(),
                &mut len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let end = ifname.iter().position(|&b| b == 0).unwrap_or(ifname.len());
        Ok((fd, String::from_utf8_lossy(&ifname[..end]).into_owned()))
    }

    const TUN_TYPE_IP4: u16 = 0x0800;
    const TUN_TYPE_IP6: u16 = 0x86dd;
    const TUN_TYPE_IPX: u16 = 0x8137;

    /// Convert the utun 4-byte protocol-family prefix to the generic
    /// TUN/TAP header (flags 0 + EtherType) and back, in place.
    /// `send = true` converts utun → TUN.
    pub(super) fn compat_layer(pkt: &mut Packet, send: bool) {
        if pkt.len() < 4 {
            return;
        }
        let buf = pkt.payload_mut();
        if send {
            let ty = match buf[3] as libc::c_int {
                libc::PF_INET => TUN_TYPE_IP4,
                libc::PF_INET6 => TUN_TYPE_IP6,
                libc::PF_IPX => TUN_TYPE_IPX,
                pf => {
                    tracing::debug!(pf, "unknown protocol family");
                    0
                }
            };
            buf[0] = 0;
            buf[1] = 0;
            buf[2] = (ty >> 8) as u8;
            buf[3] = (ty & 0xff) as u8;
        } else {
            let ty = u16::from_be_bytes([buf[2], buf[3]]);
            let pf = match ty {
                TUN_TYPE_IP4 => libc::AF_INET,
                TUN_TYPE_IP6 => libc::AF_INET6,
                TUN_TYPE_IPX => libc::AF_IPX,
                _ => {
                    tracing::debug!(ethertype = ty, "unknown protocol type");
                    libc::AF_UNSPEC
                }
            };
            buf[0] = 0;
            buf[1] = 0;
            buf[2] = 0;
            buf[3] = pf as u8;
        }
    }
}
