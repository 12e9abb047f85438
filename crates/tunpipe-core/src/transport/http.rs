//! HTTP-framed transport.
//!
//! Both peers hold two TCP connections, one per direction of data flow.
//! Messages alternate between data and minimal acks so each lane always
//! has exactly one message in flight.
//!
//! Normal mode: a frame travels base64-encoded as the body of a
//! `POST /` (client→server) or `HTTP/1.1 200 OK` (server→client) with a
//! `Content-Length` header; acks are bare `GET / HTTP/1.1` and
//! `HTTP/1.1 200 OK` messages.
//!
//! Side-channel mode (`http.side_channel`): data hides in header
//! fields. The client announces the frame size in
//! `GET /index.php?s=<b64(size)>` and carries ≤16-byte chunks in
//! `Authorization:` headers; the server announces via
//! `Set-Cookie: H=<b64(size)>;` and carries chunks in `ID=` cookie
//! attributes, padding the response with a decoy HTML body. The
//! receiver reassembles by the announced size.

use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use bytes::BytesMut;
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::codec;
use crate::config::Config;
use crate::error::{io_recoverable, Error, Result};
use crate::io::{self, Waker};
use crate::module::{Module, ModuleInfo, ModuleKind};
use crate::packet::{Direction, Packet, PacketPool};
use crate::queue::PacketQueue;

const CONF_PORT: &str = "http.port";
const CONF_REMOTE: &str = "http.remote";
const CONF_SERVER: &str = "server";
const CONF_SIDE_CHANNEL: &str = "http.side_channel";

const HTTP_MTU: usize = 1500;
const DEFAULT_PORT: u16 = 8080;
/// Per-message payload budget in side-channel mode, both directions.
const CHUNK_MAX: usize = 16;
/// Ceiling for announced side-channel sizes and buffered garbage.
const MSG_MAX: usize = 64 * 1024;

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:12.0) Gecko/20100101 Firefox/12.0";
const DECOY_BODY: &str = "<html><head><title>Default page</title></head><body><center>\
                          <h1>Server works!</h1></center></body></html>\r\n";

static HTTP_INFO: ModuleInfo = ModuleInfo {
    name: "http",
    descr: "HTTP transport",
    kind: ModuleKind::Transport,
    blocking: true,
};

// ─── Message framing ────────────────────────────────────────────────────────

/// One complete HTTP message: head (start line + headers) and raw body.
struct HttpMsg {
    head: String,
    body: Vec<u8>,
}

impl HttpMsg {
    fn content_length(head: &str) -> Option<usize> {
        head.split("\r\n")
            .find_map(|line| line.strip_prefix("Content-Length:"))
            .and_then(|v| v.trim().parse().ok())
    }
}

/// Extract the next complete message from a receive accumulator, if one
/// has fully arrived. Oversized garbage with no header terminator is
/// discarded to keep the connection alive.
fn extract_message(acc: &mut BytesMut) -> Option<HttpMsg> {
    let head_end = acc.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = String::from_utf8_lossy(&acc[..head_end]).into_owned();
    let body_len = HttpMsg::content_length(&head).unwrap_or(0);
    if acc.len() < head_end + 4 + body_len {
        return None;
    }
    let _ = acc.split_to(head_end + 4);
    let body = acc.split_to(body_len).to_vec();
    Some(HttpMsg { head, body })
}

fn drop_oversized(acc: &mut BytesMut) {
    if acc.len() > MSG_MAX {
        tracing::info!(len = acc.len(), "no message boundary found, dropping buffer");
        acc.clear();
    }
}

// ─── Message builders ───────────────────────────────────────────────────────

fn build_data_normal(is_server: bool, payload: &[u8]) -> String {
    let body = codec::encode(payload);
    let start = if is_server {
        "HTTP/1.1 200 OK\r\n"
    } else {
        "POST / HTTP/1.1\r\n"
    };
    format!("{start}Content-Length: {}\r\n\r\n{body}", body.len())
}

fn build_ack(is_server: bool) -> &'static str {
    if is_server {
        "HTTP/1.1 200 OK\r\n\r\n"
    } else {
        "GET / HTTP/1.1\r\n\r\n"
    }
}

/// Client side-channel fragment. Returns the message and the chunk size.
fn build_client_sc(remote: &str, port: u16, payload: &[u8], offset: usize) -> (String, usize) {
    let chunk = &payload[offset..(offset + CHUNK_MAX).min(payload.len())];
    let mut msg = String::from("GET /index.php");
    if offset == 0 {
        let size = (payload.len() as u32).to_be_bytes();
        msg.push_str("?s=");
        msg.push_str(&codec::encode(&size));
    }
    msg.push_str(" HTTP/1.1\r\n");
    msg.push_str(&format!("Host: {remote}:{port}\r\n"));
    msg.push_str(&format!("User-Agent: {USER_AGENT}\r\n"));
    msg.push_str(&format!("Authorization: {}\r\n", codec::encode(chunk)));
    msg.push_str("\r\n");
    (msg, chunk.len())
}

/// Server side-channel fragment.
fn build_server_sc(payload: &[u8], offset: usize) -> (String, usize) {
    let chunk = &payload[offset..(offset + CHUNK_MAX).min(payload.len())];
    let mut msg = String::from("HTTP/1.1 200 OK\r\nSet-Cookie: ");
    if offset == 0 {
        let size = (payload.len() as u32).to_be_bytes();
        msg.push_str(&format!("H={}; ", codec::encode(&size)));
    }
    msg.push_str(&format!(
        "ID={}; Max-Age=3600; Version=1\r\n",
        codec::encode(chunk)
    ));
    msg.push_str("Server: nginx/0.8.54\r\n");
    msg.push_str("Content-Type: text/html\r\n");
    msg.push_str(&format!("Content-Length: {}\r\n", DECOY_BODY.len()));
    msg.push_str("\r\n");
    msg.push_str(DECOY_BODY);
    (msg, chunk.len())
}

// ─── Receive-side reassembly ────────────────────────────────────────────────

/// Decodes inbound messages into packets. Side-channel frames span
/// several messages; the in-progress packet lives here.
struct RecvState {
    pool: Arc<PacketPool>,
    pkt: Option<Packet>,
    offset: usize,
}

impl RecvState {
    fn new(pool: Arc<PacketPool>) -> Self {
        RecvState {
            pool,
            pkt: None,
            offset: 0,
        }
    }

    /// Normal mode: a message with a `Content-Length` and a body carries
    /// exactly one base64 frame. Returns (was_data, completed packet).
    fn on_message_normal(&mut self, msg: &HttpMsg) -> (bool, Option<Packet>) {
        if HttpMsg::content_length(&msg.head).is_none() || msg.body.is_empty() {
            return (false, None);
        }
        let body = String::from_utf8_lossy(&msg.body);
        let data = match codec::decode(body.trim()) {
            Ok(data) => data,
            Err(err) => {
                tracing::info!(error = %err, "dropping malformed data message");
                return (true, None);
            }
        };
        let mut pkt = match self.pool.get(data.len()) {
            Ok(pkt) => pkt,
            Err(_) => return (true, None),
        };
        pkt.payload_mut().copy_from_slice(&data);
        (true, Some(pkt))
    }

    /// Side-channel mode: collect size announcements and chunks from the
    /// header fields. Returns (saw_chunk, completed packet).
    fn on_message_sc(&mut self, msg: &HttpMsg) -> (bool, Option<Packet>) {
        let mut chunk: Option<Vec<u8>> = None;

        for line in msg.head.split("\r\n") {
            if let Some(rest) = line.strip_prefix("GET /index.php?s=") {
                let b64 = rest.split(' ').next().unwrap_or("");
                self.announce(b64);
            } else if let Some(rest) = line.strip_prefix("Set-Cookie: ") {
                for attr in rest.split("; ") {
                    if let Some(b64) = attr.strip_prefix("H=") {
                        self.announce(b64);
                    } else if let Some(b64) = attr.strip_prefix("ID=") {
                        chunk = self.decode_chunk(b64);
                    }
                }
            } else if let Some(b64) = line.strip_prefix("Authorization: ") {
                chunk = self.decode_chunk(b64);
            }
        }

        let Some(chunk) = chunk.filter(|c| !c.is_empty()) else {
            return (false, None);
        };
        let Some(pkt) = self.pkt.as_mut() else {
            tracing::info!("chunk without a size announcement, dropping");
            return (true, None);
        };
        if self.offset + chunk.len() > pkt.len() {
            tracing::info!("chunk overruns announced size, dropping frame");
            let pkt = self.pkt.take().unwrap();
            self.pool.put(pkt);
            self.offset = 0;
            return (true, None);
        }
        pkt.payload_mut()[self.offset..self.offset + chunk.len()].copy_from_slice(&chunk);
        self.offset += chunk.len();

        if self.offset >= self.pkt.as_ref().unwrap().len() {
            self.offset = 0;
            return (true, self.pkt.take());
        }
        (true, None)
    }

    /// Start a new frame from a base64-encoded big-endian u32 size.
    fn announce(&mut self, b64: &str) {
        let size = match codec::decode(b64) {
            Ok(bytes) if bytes.len() == 4 => {
                u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
            }
            _ => {
                tracing::info!("malformed size announcement, ignoring");
                return;
            }
        };
        if size == 0 || size > MSG_MAX {
            tracing::info!(size, "implausible size announcement, ignoring");
            return;
        }
        if let Some(stale) = self.pkt.take() {
            self.pool.put(stale);
        }
        match self.pool.get(size) {
            Ok(pkt) => {
                self.pkt = Some(pkt);
                self.offset = 0;
            }
            Err(err) => tracing::warn!(error = %err, "no packet for inbound frame"),
        }
    }

    fn decode_chunk(&self, b64: &str) -> Option<Vec<u8>> {
        match codec::decode(b64) {
            Ok(chunk) => Some(chunk),
            Err(err) => {
                tracing::info!(error = %err, "dropping malformed chunk");
                None
            }
        }
    }
}

impl Drop for RecvState {
    fn drop(&mut self) {
        if let Some(pkt) = self.pkt.take() {
            self.pool.put(pkt);
        }
    }
}

// ─── Worker ─────────────────────────────────────────────────────────────────

struct HttpWorker {
    pool: Arc<PacketPool>,
    is_server: bool,
    side_channel: bool,
    remote: String,
    port: u16,
    conns: [TcpStream; 2],
    acc: [BytesMut; 2],
    send_q: Arc<PacketQueue>,
    recv_tx: Sender<Packet>,
    recv: RecvState,
    stopw: Arc<Waker>,
    kick: Arc<Waker>,
    /// True when nothing is in flight and a fresh packet may go out
    /// immediately.
    send_ready: bool,
    /// Byte offset into the frame currently fragmented (side channel).
    send_offset: usize,
}

impl HttpWorker {
    fn data_conn(&self) -> usize {
        // The client pushes data on its first connection, the server
        // answers on the second; each lane stays half-duplex.
        if self.is_server {
            1
        } else {
            0
        }
    }

    fn run(mut self) {
        if !self.is_server {
            if let Err(err) = self.write(1, build_ack(false).as_bytes()) {
                tracing::error!(error = %err, "initial request failed");
                return;
            }
        }

        loop {
            let mut fds = [
                libc::pollfd {
                    fd: self.conns[0].as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.conns[1].as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.stopw.fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.kick.fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if io_recoverable(&err) {
                    continue;
                }
                tracing::error!(error = %err, "poll failed");
                return;
            }

            if fds[2].revents != 0 {
                tracing::debug!("worker stopping");
                return;
            }
            if fds[3].revents != 0 {
                self.kick.drain();
                if self.send_ready {
                    if let Err(err) = self.send_next(self.data_conn()) {
                        self.disconnect(err);
                        return;
                    }
                }
            }

            for i in 0..2 {
                if fds[i].revents & (libc::POLLERR | libc::POLLHUP) != 0 {
                    self.disconnect(Error::Protocol("connection closed by peer".into()));
                    return;
                }
                if fds[i].revents & libc::POLLIN == 0 {
                    continue;
                }
                let mut buf = [0u8; 2048];
                match io::read_fd(fds[i].fd, &mut buf) {
                    Ok(0) => {
                        self.disconnect(Error::Protocol("connection closed by peer".into()));
                        return;
                    }
                    Ok(n) => {
                        self.acc[i].extend_from_slice(&buf[..n]);
                        while let Some(msg) = extract_message(&mut self.acc[i]) {
                            if let Err(err) = self.handle_message(&msg, i) {
                                self.disconnect(err);
                                return;
                            }
                        }
                        drop_oversized(&mut self.acc[i]);
                    }
                    Err(err) if io_recoverable(&err) => {}
                    Err(err) => {
                        self.disconnect(err.into());
                        return;
                    }
                }
            }
        }
    }

    /// Peer gone: this transport takes the whole pipeline down and lets
    /// the operator restart.
    fn disconnect(&self, err: Error) {
        tracing::error!(error = %err, "peer disconnected, shutting down");
        unsafe {
            libc::raise(libc::SIGINT);
        }
    }

    fn handle_message(&mut self, msg: &HttpMsg, conn: usize) -> Result<()> {
        let (was_data, completed) = if self.side_channel {
            self.recv.on_message_sc(msg)
        } else {
            self.recv.on_message_normal(msg)
        };
        if let Some(pkt) = completed {
            let _ = self.recv_tx.send(pkt);
        }
        if was_data {
            self.write(conn, build_ack(self.is_server).as_bytes())
        } else {
            self.send_next(conn)
        }
    }

    /// Emit the next queued frame (or its next fragment) on `conn`.
    fn send_next(&mut self, conn: usize) -> Result<()> {
        if self.side_channel {
            self.send_next_sc(conn)
        } else {
            self.send_next_normal(conn)
        }
    }

    fn send_next_normal(&mut self, conn: usize) -> Result<()> {
        let pkt = self.send_q.dequeue();
        self.send_ready = pkt.is_none();
        if let Some(pkt) = pkt {
            let msg = build_data_normal(self.is_server, pkt.payload());
            let res = self.write(conn, msg.as_bytes());
            self.pool.put(pkt);
            res?;
        }
        Ok(())
    }

    fn send_next_sc(&mut self, conn: usize) -> Result<()> {
        let offset = self.send_offset;
        let built = self.send_q.peek(|pkt| {
            if self.is_server {
                build_server_sc(pkt.payload(), offset)
            } else {
                build_client_sc(&self.remote, self.port, pkt.payload(), offset)
            }
        });
        self.send_ready = built.is_none();
        let Some((msg, chunk_len)) = built else {
            return Ok(());
        };
        self.write(conn, msg.as_bytes())?;

        self.send_offset += chunk_len;
        let done = self
            .send_q
            .peek(|pkt| self.send_offset >= pkt.len())
            .unwrap_or(true);
        if done {
            self.send_offset = 0;
            if let Some(pkt) = self.send_q.pop() {
                self.pool.put(pkt);
            }
        }
        Ok(())
    }

    fn write(&self, conn: usize, data: &[u8]) -> Result<()> {
        let fd: RawFd = self.conns[conn].as_raw_fd();
        io::write_full(fd, data, &self.stopw).map(|_| ())
    }
}

// ─── Module ─────────────────────────────────────────────────────────────────

pub struct HttpTransport {
    pool: Arc<PacketPool>,
    is_server: bool,
    side_channel: bool,
    remote: Option<String>,
    port: u16,
    send_q: Arc<PacketQueue>,
    recv_tx: Sender<Packet>,
    recv_rx: Receiver<Packet>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
    stopw: Arc<Waker>,
    kick: Arc<Waker>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl HttpTransport {
    pub fn new(conf: &Config, pool: Arc<PacketPool>) -> Result<Self> {
        let is_server = conf.find_bool(CONF_SERVER);
        let remote = conf.find_str(CONF_REMOTE);
        if remote.is_none() && !is_server {
            return Err(Error::ConfigMissing(CONF_REMOTE.into()));
        }
        let port = conf
            .find_i64(CONF_PORT)?
            .map(|p| p as u16)
            .unwrap_or(DEFAULT_PORT);

        let (recv_tx, recv_rx) = unbounded();
        let (stop_tx, stop_rx) = unbounded();
        Ok(HttpTransport {
            pool,
            is_server,
            side_channel: conf.find_bool(CONF_SIDE_CHANNEL),
            remote,
            port,
            send_q: Arc::new(PacketQueue::new()),
            recv_tx,
            recv_rx,
            stop_tx,
            stop_rx,
            stopw: Arc::new(Waker::new()?),
            kick: Arc::new(Waker::new()?),
            worker: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    fn establish(&self) -> Result<[TcpStream; 2]> {
        let conns = if self.is_server {
            let listener = TcpListener::bind(("0.0.0.0", self.port))?;
            tracing::info!(port = self.port, "waiting for both connections");
            let (first, _) = listener.accept()?;
            let (second, _) = listener.accept()?;
            [first, second]
        } else {
            let remote = self.remote.as_deref().expect("checked in new");
            let first = TcpStream::connect((remote, self.port))?;
            let second = TcpStream::connect((remote, self.port))?;
            [first, second]
        };
        conns[0].set_nonblocking(true)?;
        conns[1].set_nonblocking(true)?;
        tracing::debug!("both TCP connections are established");
        Ok(conns)
    }
}

impl Module for HttpTransport {
    fn info(&self) -> &'static ModuleInfo {
        &HTTP_INFO
    }

    fn run(&self) -> Result<()> {
        let conns = self.establish()?;
        let worker = HttpWorker {
            pool: self.pool.clone(),
            is_server: self.is_server,
            side_channel: self.side_channel,
            remote: self.remote.clone().unwrap_or_default(),
            port: self.port,
            conns,
            acc: [BytesMut::new(), BytesMut::new()],
            send_q: self.send_q.clone(),
            recv_tx: self.recv_tx.clone(),
            recv: RecvState::new(self.pool.clone()),
            stopw: self.stopw.clone(),
            kick: self.kick.clone(),
            send_ready: !self.is_server,
            send_offset: 0,
        };
        let handle = thread::Builder::new()
            .name("http-worker".into())
            .spawn(move || worker.run())?;
        *self.worker.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.stop_tx.send(());
        self.stopw.wake();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        // Release anything still parked in the queues.
        while let Some(pkt) = self.send_q.dequeue() {
            self.pool.put(pkt);
        }
        while let Ok(pkt) = self.recv_rx.try_recv() {
            self.pool.put(pkt);
        }
        Ok(())
    }

    fn process(&self, input: Option<Packet>) -> Result<Option<Packet>> {
        match input {
            Some(pkt) => {
                debug_assert_eq!(pkt.direction(), Direction::Send);
                if self.stopped.load(Ordering::Acquire) {
                    self.pool.put(pkt);
                    return Ok(None);
                }
                self.send_q.enqueue(pkt);
                self.kick.wake();
                Ok(None)
            }
            None => crossbeam_channel::select! {
                recv(self.recv_rx) -> pkt => match pkt {
                    Ok(mut pkt) => {
                        pkt.set_direction(Direction::Recv);
                        Ok(Some(pkt))
                    }
                    Err(_) => Ok(None),
                },
                recv(self.stop_rx) -> _ => Ok(None),
            },
        }
    }

    fn mtu(&self) -> usize {
        HTTP_MTU
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
