//! File-descriptor endpoint shared by the interface modules, plus the
//! generic `fd` interface over an arbitrary descriptor pair (pipes,
//! socketpairs, character devices).

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{io_recoverable, Result};
use crate::io::{self, PollEvent, Waker};
use crate::module::{Module, ModuleInfo, ModuleKind};
use crate::packet::{Direction, Packet, PacketPool};

use super::IF_MTU;

/// What a reader should do when the descriptor reaches end-of-file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EofAction {
    /// Request orderly process shutdown (stdio: the operator closed
    /// stdin), then park until stopped.
    RaiseSigint,
    /// Park until stopped (test pipes and other benign closes).
    Park,
    /// Treat as a dead peer process; the reading worker exits.
    Fatal,
}

/// Result of one frame read.
pub enum FrameRead {
    Frame(Packet),
    /// No frame this cycle: the endpoint was stopped while waiting, or
    /// the cycle was dropped under memory pressure.
    Stopped,
}

/// A read/write descriptor pair with a stop wakeup.
///
/// `rd` and `wr` may be the same descriptor (TUN devices). Owned
/// descriptors are closed when the endpoint drops; borrowed ones
/// (stdin/stdout) are left alone.
pub struct FdEndpoint {
    pool: Arc<PacketPool>,
    rd: RawFd,
    wr: RawFd,
    waker: Waker,
    stopped: AtomicBool,
    _owned: Vec<OwnedFd>,
}

impl FdEndpoint {
    pub fn new(pool: Arc<PacketPool>, rd: RawFd, wr: RawFd, owned: Vec<OwnedFd>) -> Result<Self> {
        Ok(FdEndpoint {
            pool,
            rd,
            wr,
            waker: Waker::new()?,
            stopped: AtomicBool::new(false),
            _owned: owned,
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Wake any suspended read/write and mark the endpoint stopped.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.waker.wake();
    }

    /// Park the calling thread until [`FdEndpoint::stop`] runs.
    pub fn wait_stopped(&self) {
        while !self.is_stopped() {
            io::wait_woken(&self.waker);
        }
    }

    /// Block until a frame of up to `mtu` bytes arrives, EOF is seen, or
    /// the endpoint is stopped. EOF is handled per `eof`; for
    /// `EofAction::Fatal` an `UnexpectedEof` error is returned.
    pub fn read_frame(&self, mtu: usize, eof: EofAction) -> Result<FrameRead> {
        // Backpressure: without a packet this cycle is dropped and the
        // caller retries on its next iteration.
        let mut pkt = match self.pool.get(mtu) {
            Ok(pkt) => pkt,
            Err(err) => {
                tracing::warn!(error = %err, "no packet for frame, dropping cycle");
                std::thread::sleep(std::time::Duration::from_millis(10));
                return Ok(FrameRead::Stopped);
            }
        };
        loop {
            if self.is_stopped() {
                self.pool.put(pkt);
                return Ok(FrameRead::Stopped);
            }
            if io::poll_read(self.rd, &self.waker)? == PollEvent::Woken {
                self.pool.put(pkt);
                return Ok(FrameRead::Stopped);
            }
            // The pool may hand back a larger cached buffer; reads are
            // bounded by the logical length, which get() set to `mtu`.
            match io::read_fd(self.rd, pkt.payload_mut()) {
                Ok(0) => {
                    self.pool.put(pkt);
                    match eof {
                        EofAction::RaiseSigint => {
                            tracing::info!("EOF reached, requesting shutdown");
                            unsafe {
                                libc::raise(libc::SIGINT);
                            }
                            self.wait_stopped();
                            return Ok(FrameRead::Stopped);
                        }
                        EofAction::Park => {
                            self.wait_stopped();
                            return Ok(FrameRead::Stopped);
                        }
                        EofAction::Fatal => {
                            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)
                                .into());
                        }
                    }
                }
                Ok(n) => {
                    pkt.set_len(n);
                    pkt.set_direction(Direction::Send);
                    return Ok(FrameRead::Frame(pkt));
                }
                Err(err) if io_recoverable(&err) => continue,
                Err(err) => {
                    self.pool.put(pkt);
                    return Err(err.into());
                }
            }
        }
    }

    /// Write a frame synchronously and release the packet. On error the
    /// packet is released here (the module is the callee).
    pub fn write_frame(&self, pkt: Packet) -> Result<()> {
        let res = io::write_full(self.wr, pkt.payload(), &self.waker);
        self.pool.put(pkt);
        res.map(|_| ())
    }

    pub fn pool(&self) -> &Arc<PacketPool> {
        &self.pool
    }
}

// ─── Generic fd interface ───────────────────────────────────────────────────

static FD_INFO: ModuleInfo = ModuleInfo {
    name: "fd",
    descr: "File descriptor pair interface",
    kind: ModuleKind::Interface,
    blocking: true,
};

/// Interface over an arbitrary owned descriptor pair.
pub struct FdInterface {
    ep: FdEndpoint,
}

impl FdInterface {
    pub fn new(pool: Arc<PacketPool>, rd: OwnedFd, wr: OwnedFd) -> Result<Self> {
        let (rfd, wfd) = (rd.as_raw_fd(), wr.as_raw_fd());
        let ep = FdEndpoint::new(pool, rfd, wfd, vec![rd, wr])?;
        Ok(FdInterface { ep })
    }
}

impl Module for FdInterface {
    fn info(&self) -> &'static ModuleInfo {
        &FD_INFO
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
            None => match self.ep.read_frame(IF_MTU, EofAction::Park)? {
                FrameRead::Frame(pkt) => Ok(Some(pkt)),
                FrameRead::Stopped => Ok(None),
            },
            Some(pkt) => {
                debug_assert_eq!(pkt.direction(), Direction::Recv);
                self.ep.write_frame(pkt)?;
                Ok(None)
            }
        }
    }

    fn mtu(&self) -> usize {
        IF_MTU
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::FromRawFd;

    fn os_pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn read_tags_send_and_write_round_trips() {
        let pool = Arc::new(PacketPool::new());
        let (in_rd, in_wr) = os_pipe();
        let (out_rd, out_wr) = os_pipe();
        let iface = FdInterface::new(pool.clone(), in_rd, out_wr).unwrap();

        // Inject a frame on the read side.
        assert_eq!(
            unsafe { libc::write(in_wr.as_raw_fd(), b"hello".as_ptr().cast(), 5) },
            5
        );
        let pkt = iface.process(None).unwrap().unwrap();
        assert_eq!(pkt.direction(), Direction::Send);
        assert_eq!(pkt.payload(), b"hello");

        // Feed it back as a RECV frame; it lands on the write side.
        let mut pkt = pkt;
        pkt.set_direction(Direction::Recv);
        assert!(iface.process(Some(pkt)).unwrap().is_none());
        let mut buf = [0u8; 16];
        let n = io::read_fd(out_rd.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn stop_interrupts_blocked_read() {
        let pool = Arc::new(PacketPool::new());
        let (in_rd, _in_wr) = os_pipe();
        let (_out_rd, out_wr) = os_pipe();
        let iface = Arc::new(FdInterface::new(pool, in_rd, out_wr).unwrap());

        let reader = iface.clone();
        let handle = std::thread::spawn(move || reader.process(None));
        std::thread::sleep(std::time::Duration::from_millis(50));
        iface.stop().unwrap();
        let out = handle.join().unwrap().unwrap();
        assert!(out.is_none());
    }
}
