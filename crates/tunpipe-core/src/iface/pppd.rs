//! PPP interface via a spawned `pppd` daemon.
//!
//! `run()` forks the daemon with `nodetach noauth notty passive
//! [ip-spec]` and wires its stdio to two pipes set non-blocking. Frames
//! the daemon writes become SEND packets; RECV packets are written back
//! into its stdin. `stop()` sends SIGTERM and waits for the child.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, OnceLock};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::io::set_nonblocking;
use crate::module::{Module, ModuleInfo, ModuleKind};
use crate::packet::{Direction, Packet, PacketPool};

use super::fd::{EofAction, FdEndpoint, FrameRead};
use super::IF_MTU;

const CONF_IP: &str = "pppd.ip";
const CONF_PATH: &str = "pppd.path";

/// Probed in order when `pppd.path` is not configured.
const PPPD_PATHS: &[&str] = &[
    "/sbin/pppd",
    "/usr/sbin/pppd",
    "/usr/local/sbin/pppd",
    "/usr/bin/pppd",
    "/usr/local/bin/pppd",
];

static PPPD_INFO: ModuleInfo = ModuleInfo {
    name: "pppd",
    descr: "PPP interface via pppd",
    kind: ModuleKind::Interface,
    blocking: true,
};

fn is_executable(path: &str) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn discover_pppd(conf: &Config) -> Result<String> {
    if let Some(path) = conf.find_str(CONF_PATH) {
        if is_executable(&path) {
            return Ok(path);
        }
        return Err(Error::Config(format!("'{path}' is not an executable pppd")));
    }
    for path in PPPD_PATHS {
        if is_executable(path) {
            return Ok((*path).to_string());
        }
    }
    Err(Error::Config(
        "pppd binary not found; install ppp or set pppd.path".into(),
    ))
}

pub struct PppdInterface {
    pool: Arc<PacketPool>,
    pppd_path: String,
    /// "local:remote" address pair handed to pppd verbatim.
    ip: Option<String>,
    child: Mutex<Option<Child>>,
    ep: OnceLock<FdEndpoint>,
}

impl PppdInterface {
    pub fn new(conf: &Config, pool: Arc<PacketPool>) -> Result<Self> {
        Ok(PppdInterface {
            pool,
            pppd_path: discover_pppd(conf)?,
            ip: conf.find_str(CONF_IP),
            child: Mutex::new(None),
            ep: OnceLock::new(),
        })
    }

    fn endpoint(&self) -> Result<&FdEndpoint> {
        self.ep.get().ok_or(Error::Stopped)
    }
}

impl Module for PppdInterface {
    fn info(&self) -> &'static ModuleInfo {
        &PPPD_INFO
    }

    fn run(&self) -> Result<()> {
        let mut cmd = Command::new(&self.pppd_path);
        cmd.args(["nodetach", "noauth", "notty", "passive"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());
        if let Some(ip) = &self.ip {
            cmd.arg(ip);
        }
        tracing::debug!(path = %self.pppd_path, ip = ?self.ip, "spawning pppd");
        let mut child = cmd.spawn()?;

        let to_pppd: OwnedFd = child.stdin.take().expect("piped stdin").into();
        let from_pppd: OwnedFd = child.stdout.take().expect("piped stdout").into();
        set_nonblocking(to_pppd.as_raw_fd(), true)?;
        set_nonblocking(from_pppd.as_raw_fd(), true)?;

        let ep = FdEndpoint::new(
            self.pool.clone(),
            from_pppd.as_raw_fd(),
            to_pppd.as_raw_fd(),
            vec![from_pppd, to_pppd],
        )?;
        self.ep
            .set(ep)
            .unwrap_or_else(|_| panic!("pppd module run twice"));
        *self.child.lock().unwrap() = Some(child);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if let Some(ep) = self.ep.get() {
            ep.stop();
        }
        if let Some(mut child) = self.child.lock().unwrap().take() {
            unsafe {
                libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
            }
            match child.wait() {
                Ok(status) => tracing::debug!(%status, "pppd exited"),
                Err(err) => tracing::warn!(error = %err, "waiting for pppd failed"),
            }
        }
        Ok(())
    }

    fn process(&self, input: Option<Packet>) -> Result<Option<Packet>> {
        let ep = match self.endpoint() {
            Ok(ep) => ep,
            Err(err) => {
                if let Some(pkt) = input {
                    self.pool.put(pkt);
                }
                return Err(err);
            }
        };
        match input {
            // EOF from the daemon means it died; the reader worker exits.
            None => match ep.read_frame(IF_MTU, EofAction::Fatal)? {
                FrameRead::Frame(pkt) => Ok(Some(pkt)),
                FrameRead::Stopped => Ok(None),
            },
            Some(pkt) => {
                debug_assert_eq!(pkt.direction(), Direction::Recv);
                ep.write_frame(pkt)?;
                Ok(None)
            }
        }
    }

    fn mtu(&self) -> usize {
        IF_MTU
    }
}

impl Drop for PppdInterface {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
