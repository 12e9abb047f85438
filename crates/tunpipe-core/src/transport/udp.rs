//! UDP transport: one raw frame per datagram.
//!
//! Config: `udp.port` sets both sides, `udp.sport`/`udp.dport` override
//! per direction, `udp.host` names the remote (mandatory for the
//! client; a server without it locks onto the source of the first
//! datagram it receives).

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::config::Config;
use crate::error::{io_recoverable, Error, Result};
use crate::io::{poll_read, poll_write, PollEvent, Waker};
use crate::module::{Module, ModuleInfo, ModuleKind};
use crate::packet::{Direction, Packet, PacketPool};

const CONF_PORT: &str = "udp.port";
const CONF_SPORT: &str = "udp.sport";
const CONF_DPORT: &str = "udp.dport";
const CONF_HOST: &str = "udp.host";

const UDP_MTU: usize = 1500;

static UDP_INFO: ModuleInfo = ModuleInfo {
    name: "udp",
    descr: "UDP transport",
    kind: ModuleKind::Transport,
    blocking: true,
};

/// Resolve `host:port`, IPv4-only on macOS by design.
fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|_| Error::Resolve(format!("{host}:{port}")))?;
    let mut addrs = addrs.filter(|a| !cfg!(target_os = "macos") || a.is_ipv4());
    addrs
        .next()
        .ok_or_else(|| Error::Resolve(format!("{host}:{port}")))
}

pub struct UdpTransport {
    pool: Arc<PacketPool>,
    sport: u16,
    dport: u16,
    host: Option<String>,
    socket: OnceLock<UdpSocket>,
    remote: Mutex<Option<SocketAddr>>,
    waker: Waker,
    stopped: AtomicBool,
}

impl UdpTransport {
    pub fn new(conf: &Config, pool: Arc<PacketPool>) -> Result<Self> {
        let port = conf.find_i64(CONF_PORT)?;
        let sport = conf.find_i64(CONF_SPORT)?.or(port);
        let dport = conf.find_i64(CONF_DPORT)?.or(port);
        let (Some(sport), Some(dport)) = (sport, dport) else {
            return Err(Error::ConfigMissing(CONF_PORT.into()));
        };
        let host = conf.find_str(CONF_HOST);
        if host.is_none() && !conf.find_bool("server") {
            return Err(Error::ConfigMissing(CONF_HOST.into()));
        }
        Ok(UdpTransport {
            pool,
            sport: sport as u16,
            dport: dport as u16,
            host,
            socket: OnceLock::new(),
            remote: Mutex::new(None),
            waker: Waker::new()?,
            stopped: AtomicBool::new(false),
        })
    }

    fn sock(&self) -> Result<&UdpSocket> {
        self.socket.get().ok_or(Error::Stopped)
    }
}

impl Module for UdpTransport {
    fn info(&self) -> &'static ModuleInfo {
        &UDP_INFO
    }

    fn run(&self) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", self.sport))?;
        socket.set_nonblocking(true)?;
        if let Some(host) = &self.host {
            let addr = resolve(host, self.dport)?;
            *self.remote.lock().unwrap() = Some(addr);
            tracing::debug!(%addr, "remote resolved");
        }
        self.socket
            .set(socket)
            .unwrap_or_else(|_| panic!("udp module run twice"));
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::Release);
        self.waker.wake();
        Ok(())
    }

    fn process(&self, input: Option<Packet>) -> Result<Option<Packet>> {
        match input {
            None => self.produce(),
            Some(pkt) => self.consume(pkt),
        }
    }

    fn mtu(&self) -> usize {
        UDP_MTU
    }
}

impl UdpTransport {
    /// Wait for a datagram and return it as a RECV packet. Recoverable
    /// errors yield no packet and no error.
    fn produce(&self) -> Result<Option<Packet>> {
        let socket = self.sock()?;
        if self.stopped.load(Ordering::Acquire) {
            return Ok(None);
        }
        if poll_read(socket.as_raw_fd(), &self.waker)? == PollEvent::Woken {
            return Ok(None);
        }
        // Backpressure: without a packet this cycle is dropped and the
        // worker tries again on the next iteration.
        let mut pkt = match self.pool.get(UDP_MTU) {
            Ok(pkt) => pkt,
            Err(err) => {
                tracing::warn!(error = %err, "no packet for datagram, dropping cycle");
                std::thread::sleep(std::time::Duration::from_millis(10));
                return Ok(None);
            }
        };
        match socket.recv_from(pkt.payload_mut()) {
            Ok((n, from)) => {
                // A server without udp.host locks onto the first peer.
                let mut remote = self.remote.lock().unwrap();
                if remote.is_none() {
                    tracing::info!(peer = %from, "learned remote address");
                    *remote = Some(from);
                }
                pkt.set_len(n);
                pkt.set_direction(Direction::Recv);
                tracing::trace!(size = n, "recv pkt");
                Ok(Some(pkt))
            }
            Err(err) if io_recoverable(&err) => {
                self.pool.put(pkt);
                Ok(None)
            }
            Err(err) => {
                self.pool.put(pkt);
                Err(err.into())
            }
        }
    }

    /// Emit a SEND packet, retrying over recoverable errors.
    fn consume(&self, pkt: Packet) -> Result<Option<Packet>> {
        debug_assert_eq!(pkt.direction(), Direction::Send);
        let socket = match self.sock() {
            Ok(socket) => socket,
            Err(err) => {
                self.pool.put(pkt);
                return Err(err);
            }
        };
        let Some(remote) = *self.remote.lock().unwrap() else {
            tracing::debug!("no peer address yet, dropping frame");
            self.pool.put(pkt);
            return Ok(None);
        };

        tracing::trace!(size = pkt.len(), "send pkt");
        loop {
            match socket.send_to(pkt.payload(), remote) {
                Ok(_) => break,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) if io_recoverable(&err) => {
                    match poll_write(socket.as_raw_fd(), &self.waker) {
                        Ok(PollEvent::Ready) => continue,
                        Ok(PollEvent::Woken) => break,
                        Err(err) => {
                            self.pool.put(pkt);
                            return Err(err);
                        }
                    }
                }
                Err(err) => {
                    self.pool.put(pkt);
                    return Err(err.into());
                }
            }
        }
        self.pool.put(pkt);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(entries: &[(&str, &str)]) -> Config {
        let conf = Config::new();
        for (k, v) in entries {
            conf.store(k, v);
        }
        conf
    }

    #[test]
    fn port_sets_both_directions() {
        let pool = Arc::new(PacketPool::new());
        let conf = conf(&[("udp.port", "5000"), ("udp.host", "127.0.0.1")]);
        let tp = UdpTransport::new(&conf, pool).unwrap();
        assert_eq!(tp.sport, 5000);
        assert_eq!(tp.dport, 5000);
    }

    #[test]
    fn sport_dport_override() {
        let pool = Arc::new(PacketPool::new());
        let conf = conf(&[
            ("udp.port", "5000"),
            ("udp.sport", "5001"),
            ("udp.dport", "5002"),
            ("udp.host", "127.0.0.1"),
        ]);
        let tp = UdpTransport::new(&conf, pool).unwrap();
        assert_eq!(tp.sport, 5001);
        assert_eq!(tp.dport, 5002);
    }

    #[test]
    fn host_mandatory_for_client() {
        let pool = Arc::new(PacketPool::new());
        let conf = conf(&[("udp.port", "5000")]);
        assert!(matches!(
            UdpTransport::new(&conf, pool),
            Err(Error::ConfigMissing(_))
        ));
    }

    #[test]
    fn server_may_omit_host() {
        let pool = Arc::new(PacketPool::new());
        let conf = conf(&[("udp.port", "5000"), ("server", "1")]);
        assert!(UdpTransport::new(&conf, pool).is_ok());
    }

    #[test]
    fn missing_port_is_an_error() {
        let pool = Arc::new(PacketPool::new());
        let conf = conf(&[("udp.host", "127.0.0.1")]);
        assert!(matches!(
            UdpTransport::new(&conf, pool),
            Err(Error::ConfigMissing(_))
        ));
    }

    #[test]
    fn datagram_round_trip() {
        let pool = Arc::new(PacketPool::new());
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer_port = peer.local_addr().unwrap().port();

        let conf = conf(&[
            ("udp.sport", "0"),
            ("udp.dport", &peer_port.to_string()),
            ("udp.host", "127.0.0.1"),
        ]);
        let tp = UdpTransport::new(&conf, pool.clone()).unwrap();
        tp.run().unwrap();

        // SEND path: frame arrives at the peer socket.
        let mut pkt = pool.get(3).unwrap();
        pkt.payload_mut().copy_from_slice(b"abc");
        pkt.set_direction(Direction::Send);
        assert!(tp.process(Some(pkt)).unwrap().is_none());

        let mut buf = [0u8; 32];
        peer.set_read_timeout(Some(std::time::Duration::from_secs(1)))
            .unwrap();
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc");

        // RECV path: a datagram becomes a RECV packet.
        let local = tp.sock().unwrap().local_addr().unwrap();
        peer.send_to(b"xyz", ("127.0.0.1", local.port())).unwrap();
        let pkt = tp.process(None).unwrap().unwrap();
        assert_eq!(pkt.direction(), Direction::Recv);
        assert_eq!(pkt.payload(), b"xyz");
        pool.put(pkt);

        tp.stop().unwrap();
        assert_eq!(pool.outstanding(), 0);
    }
}
