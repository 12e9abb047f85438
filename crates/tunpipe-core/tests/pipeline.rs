//! End-to-end pipeline scenarios: loopback delivery through inverted
//! interfaces, and two in-process instances exchanging frames over the
//! real UDP and HTTP transports on localhost.
//!
//! Each instance's interface is an `fd` module over a pair of pipes, so
//! the tests inject frames by writing to one descriptor and observe
//! delivery by reading another.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tunpipe_core::iface::fd::FdInterface;
use tunpipe_core::transport::http::HttpTransport;
use tunpipe_core::transport::udp::UdpTransport;
use tunpipe_core::{Config, PacketPool, Pipeline};

// ─── Helpers ────────────────────────────────────────────────────────────────

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn os_pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0 as libc::c_int; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

/// One tunnel endpoint: an fd interface plus the descriptors the test
/// uses to feed and observe it.
struct Endpoint {
    iface: Arc<FdInterface>,
    /// Test writes frames here; the interface reads them.
    feed: OwnedFd,
    /// The interface writes delivered frames here; the test reads them.
    sink: OwnedFd,
}

fn endpoint(pool: &Arc<PacketPool>) -> Endpoint {
    let (in_rd, in_wr) = os_pipe();
    let (out_rd, out_wr) = os_pipe();
    let iface = Arc::new(FdInterface::new(pool.clone(), in_rd, out_wr).unwrap());
    Endpoint {
        iface,
        feed: in_wr,
        sink: out_rd,
    }
}

fn feed(endpoint: &Endpoint, data: &[u8]) {
    let n = unsafe {
        libc::write(
            endpoint.feed.as_raw_fd(),
            data.as_ptr().cast(),
            data.len(),
        )
    };
    assert_eq!(n, data.len() as isize);
}

/// Read from `fd` until `want` bytes arrived or the deadline passes.
fn read_exact_timeout(fd: RawFd, want: usize, timeout: Duration) -> Vec<u8> {
    let deadline = Instant::now() + timeout;
    let mut out = Vec::new();
    while out.len() < want {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, left.as_millis() as libc::c_int) };
        if rc <= 0 {
            continue;
        }
        let mut buf = [0u8; 4096];
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n > 0 {
            out.extend_from_slice(&buf[..n as usize]);
        }
    }
    out
}

fn random_blob(len: usize) -> Vec<u8> {
    (0..len).map(|_| rand::random::<u8>()).collect()
}

// ─── Loopback ───────────────────────────────────────────────────────────────

#[test]
fn loopback_delivers_frames_both_ways() {
    init_logging();
    let pool = Arc::new(PacketPool::new());
    let a = endpoint(&pool);
    let b = endpoint(&pool);

    let mut pipeline = Pipeline::new(pool.clone());
    pipeline.add_module(a.iface.clone());
    // Second interface: the pipeline wires it inverted (loopback).
    pipeline.add_module(b.iface.clone());
    pipeline.start().unwrap();

    feed(&a, b"forward frame");
    let got = read_exact_timeout(b.sink.as_raw_fd(), 13, Duration::from_secs(1));
    assert_eq!(got, b"forward frame");

    feed(&b, b"backward frame");
    let got = read_exact_timeout(a.sink.as_raw_fd(), 14, Duration::from_secs(1));
    assert_eq!(got, b"backward frame");

    pipeline.stop();
    assert_eq!(pool.outstanding(), 0);
}

// ─── UDP two-instance echo ──────────────────────────────────────────────────

fn udp_conf(sport: u16, dport: u16) -> Config {
    let conf = Config::new();
    conf.store("udp.sport", &sport.to_string());
    conf.store("udp.dport", &dport.to_string());
    conf.store("udp.host", "127.0.0.1");
    conf
}

#[test]
fn udp_two_instance_echo() {
    init_logging();
    let (port_a, port_b) = (56101, 56102);

    let pool_a = Arc::new(PacketPool::new());
    let a = endpoint(&pool_a);
    let mut inst_a = Pipeline::new(pool_a.clone());
    inst_a.add_module(a.iface.clone());
    inst_a.add_module(Arc::new(
        UdpTransport::new(&udp_conf(port_a, port_b), pool_a.clone()).unwrap(),
    ));

    let pool_b = Arc::new(PacketPool::new());
    let b = endpoint(&pool_b);
    let mut inst_b = Pipeline::new(pool_b.clone());
    inst_b.add_module(b.iface.clone());
    inst_b.add_module(Arc::new(
        UdpTransport::new(&udp_conf(port_b, port_a), pool_b.clone()).unwrap(),
    ));

    inst_a.start().unwrap();
    inst_b.start().unwrap();

    // A payload entered on one side appears verbatim on the other
    // within a second.
    feed(&a, &[0x41, 0x42, 0x43, b'\n']);
    let got = read_exact_timeout(b.sink.as_raw_fd(), 4, Duration::from_secs(1));
    assert_eq!(got, vec![0x41, 0x42, 0x43, b'\n']);

    feed(&b, b"reply");
    let got = read_exact_timeout(a.sink.as_raw_fd(), 5, Duration::from_secs(1));
    assert_eq!(got, b"reply");

    inst_a.stop();
    inst_b.stop();
    assert_eq!(pool_a.outstanding(), 0);
    assert_eq!(pool_b.outstanding(), 0);
}

// ─── HTTP two-instance echo ─────────────────────────────────────────────────

fn http_conf(server: bool, port: u16, side_channel: bool) -> Config {
    let conf = Config::new();
    conf.store("http.port", &port.to_string());
    if server {
        conf.store("server", "1");
    } else {
        conf.store("http.remote", "127.0.0.1");
    }
    if side_channel {
        conf.store("http.side_channel", "1");
    }
    conf
}

/// Peer disconnection makes the HTTP transport request shutdown via
/// SIGINT; in-process tests must not die from it during teardown.
fn ignore_sigint() {
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
    }
}

fn http_echo(port: u16, side_channel: bool, blob_len: usize) {
    init_logging();
    ignore_sigint();

    let pool_srv = Arc::new(PacketPool::new());
    let srv = endpoint(&pool_srv);
    let mut inst_srv = Pipeline::new(pool_srv.clone());
    inst_srv.add_module(srv.iface.clone());
    inst_srv.add_module(Arc::new(
        HttpTransport::new(&http_conf(true, port, side_channel), pool_srv.clone()).unwrap(),
    ));

    // The server blocks in accept() until the client connects twice.
    let server_thread = std::thread::spawn(move || {
        inst_srv.start().unwrap();
        inst_srv
    });
    std::thread::sleep(Duration::from_millis(300));

    let pool_cli = Arc::new(PacketPool::new());
    let cli = endpoint(&pool_cli);
    let mut inst_cli = Pipeline::new(pool_cli.clone());
    inst_cli.add_module(cli.iface.clone());
    inst_cli.add_module(Arc::new(
        HttpTransport::new(&http_conf(false, port, side_channel), pool_cli.clone()).unwrap(),
    ));
    inst_cli.start().unwrap();
    let mut inst_srv = server_thread.join().unwrap();

    // client → server
    let blob = random_blob(blob_len);
    feed(&cli, &blob);
    let got = read_exact_timeout(srv.sink.as_raw_fd(), blob.len(), Duration::from_secs(5));
    assert_eq!(got, blob);

    // server → client
    let blob = random_blob(blob_len);
    feed(&srv, &blob);
    let got = read_exact_timeout(cli.sink.as_raw_fd(), blob.len(), Duration::from_secs(5));
    assert_eq!(got, blob);

    inst_cli.stop();
    inst_srv.stop();
}

#[test]
fn http_normal_two_instance_echo() {
    http_echo(56180, false, 512);
}

#[test]
fn http_side_channel_two_instance_echo() {
    http_echo(56181, true, 512);
}
