//! XMPP transport: frames travel as chat messages with base64 bodies.
//!
//! An internal worker drives the XMPP connection on a current-thread
//! tokio runtime. The connection is established with `xmpp.jid` /
//! `xmpp.passwd`; on loss it is re-attempted on a fixed 5 s timer, and
//! the event loop ticks every 500 ms to flush outbound frames.
//!
//! Delayed-delivery stanzas (XEP-0091/XEP-0203) are history replays and
//! are dropped. All other chat messages are accepted, even when
//! `xmpp.remote` is set; strict peer filtering is future work. A peer
//! jid is locked from the first inbound stanza when `xmpp.remote` is
//! not configured.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use futures_util::StreamExt;
use minidom::Element;
use tokio_xmpp::{AsyncClient, Event};

use crate::codec;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::module::{Module, ModuleInfo, ModuleKind};
use crate::packet::{Direction, Packet, PacketPool};

const CONF_SERVER: &str = "server";
const CONF_JID: &str = "xmpp.jid";
const CONF_PASSWD: &str = "xmpp.passwd";
const CONF_REMOTE: &str = "xmpp.remote";

/// XMPP body budget; well above the interface MTU.
const XMPP_MTU: usize = 3500;

const LOOP_TICK: Duration = Duration::from_millis(500);
const RECONNECT_PERIOD: Duration = Duration::from_secs(5);

const NS_CLIENT: &str = "jabber:client";
const NS_XEP_0091: &str = "jabber:x:delay";
const NS_XEP_0203: &str = "urn:xmpp:delay";

static XMPP_INFO: ModuleInfo = ModuleInfo {
    name: "xmpp",
    descr: "XMPP transport",
    kind: ModuleKind::Transport,
    blocking: true,
};

pub struct XmppTransport {
    pool: Arc<PacketPool>,
    jid: jid::Jid,
    passwd: String,
    remote: Option<String>,
    send_tx: Sender<Packet>,
    send_rx: Receiver<Packet>,
    recv_tx: Sender<Packet>,
    recv_rx: Receiver<Packet>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
    stopping: Arc<AtomicBool>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl XmppTransport {
    pub fn new(conf: &Config, pool: Arc<PacketPool>) -> Result<Self> {
        let is_server = conf.find_bool(CONF_SERVER);
        let remote = conf.find_str(CONF_REMOTE);
        // The remote jid may be omitted on the server side only.
        if remote.is_none() && !is_server {
            return Err(Error::ConfigMissing(CONF_REMOTE.into()));
        }
        let jid = conf
            .find_str(CONF_JID)
            .ok_or_else(|| Error::ConfigMissing(CONF_JID.into()))?;
        let jid: jid::Jid = jid
            .parse()
            .map_err(|_| Error::Config(format!("'{CONF_JID}': '{jid}' is not a valid jid")))?;
        let passwd = conf
            .find_str(CONF_PASSWD)
            .ok_or_else(|| Error::ConfigMissing(CONF_PASSWD.into()))?;

        let (send_tx, send_rx) = unbounded();
        let (recv_tx, recv_rx) = unbounded();
        let (stop_tx, stop_rx) = unbounded();
        Ok(XmppTransport {
            pool,
            jid,
            passwd,
            remote,
            send_tx,
            send_rx,
            recv_tx,
            recv_rx,
            stop_tx,
            stop_rx,
            stopping: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        })
    }
}

impl Module for XmppTransport {
    fn info(&self) -> &'static ModuleInfo {
        &XMPP_INFO
    }

    fn run(&self) -> Result<()> {
        let worker = XmppWorker {
            pool: self.pool.clone(),
            jid: self.jid.clone(),
            passwd: self.passwd.clone(),
            remote: self.remote.clone(),
            send_rx: self.send_rx.clone(),
            recv_tx: self.recv_tx.clone(),
            stopping: self.stopping.clone(),
            pending: VecDeque::new(),
        };
        let handle = thread::Builder::new()
            .name("xmpp-worker".into())
            .spawn(move || worker.run())?;
        *self.worker.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        while let Ok(pkt) = self.send_rx.try_recv() {
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
                if self.stopping.load(Ordering::Acquire) {
                    self.pool.put(pkt);
                    return Ok(None);
                }
                let _ = self.send_tx.send(pkt);
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
        XMPP_MTU
    }
}

impl Drop for XmppTransport {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

// ─── Worker ─────────────────────────────────────────────────────────────────

struct XmppWorker {
    pool: Arc<PacketPool>,
    jid: jid::Jid,
    passwd: String,
    /// Peer jid; locked from the first inbound stanza when unset.
    remote: Option<String>,
    send_rx: Receiver<Packet>,
    recv_tx: Sender<Packet>,
    stopping: Arc<AtomicBool>,
    /// Frames queued while offline or before the peer jid is known.
    pending: VecDeque<Packet>,
}

impl XmppWorker {
    fn run(mut self) {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(err) => {
                tracing::error!(error = %err, "tokio runtime for xmpp failed");
                return;
            }
        };
        rt.block_on(async {
            while !self.stopping.load(Ordering::Acquire) {
                self.session().await;
                if self.stopping.load(Ordering::Acquire) {
                    break;
                }
                tracing::info!(
                    period_s = RECONNECT_PERIOD.as_secs(),
                    "connection lost, reconnecting"
                );
                tokio::time::sleep(RECONNECT_PERIOD).await;
            }
        });
        for pkt in self.pending.drain(..) {
            self.pool.put(pkt);
        }
    }

    /// One connection lifetime: connect, pump events, return on loss.
    async fn session(&mut self) {
        let mut client = AsyncClient::new(self.jid.clone(), self.passwd.clone());
        client.set_reconnect(false);
        let mut online = false;
        let mut tick = tokio::time::interval(LOOP_TICK);

        loop {
            tokio::select! {
                event = client.next() => match event {
                    Some(Event::Online { .. }) => {
                        tracing::info!(jid = %self.jid, "connected");
                        online = true;
                        let presence = Element::builder("presence", NS_CLIENT).build();
                        if client.send_stanza(presence).await.is_err() {
                            return;
                        }
                        self.flush(&mut client).await;
                    }
                    Some(Event::Stanza(stanza)) => {
                        self.on_stanza(&stanza);
                        if online {
                            self.flush(&mut client).await;
                        }
                    }
                    Some(Event::Disconnected(err)) => {
                        tracing::info!(error = %err, "disconnected");
                        return;
                    }
                    None => return,
                },
                _ = tick.tick() => {
                    if self.stopping.load(Ordering::Acquire) {
                        return;
                    }
                    while let Ok(pkt) = self.send_rx.try_recv() {
                        self.pending.push_back(pkt);
                    }
                    if online {
                        self.flush(&mut client).await;
                    }
                }
            }
        }
    }

    /// Send everything queued, once online and the peer jid is known.
    async fn flush(&mut self, client: &mut AsyncClient) {
        while let Ok(pkt) = self.send_rx.try_recv() {
            self.pending.push_back(pkt);
        }
        let Some(to) = self.remote.clone() else {
            return;
        };
        while let Some(pkt) = self.pending.pop_front() {
            let body = codec::encode(pkt.payload());
            tracing::trace!(size = pkt.len(), "send stanza");
            self.pool.put(pkt);
            let message = Element::builder("message", NS_CLIENT)
                .attr("to", to.as_str())
                .attr("type", "chat")
                .append(Element::builder("body", NS_CLIENT).append(body).build())
                .build();
            if client.send_stanza(message).await.is_err() {
                return;
            }
        }
    }

    fn on_stanza(&mut self, stanza: &Element) {
        if stanza.name() != "message" {
            return;
        }
        // Ignore delayed (history replay) messages.
        if stanza.has_child("x", NS_XEP_0091) || stanza.has_child("delay", NS_XEP_0203) {
            tracing::debug!("ignoring delayed message");
            return;
        }
        let Some(body) = stanza.get_child("body", NS_CLIENT) else {
            return;
        };
        if self.remote.is_none() {
            if let Some(from) = stanza.attr("from") {
                tracing::info!(peer = from, "locked remote jid");
                self.remote = Some(from.to_string());
            }
        }
        let text = body.text();
        let data = match codec::decode(text.trim()) {
            Ok(data) => data,
            Err(err) => {
                tracing::info!(error = %err, "dropping malformed stanza body");
                return;
            }
        };
        let mut pkt = match self.pool.get(data.len()) {
            Ok(pkt) => pkt,
            Err(err) => {
                tracing::warn!(error = %err, "no packet for inbound stanza");
                return;
            }
        };
        pkt.payload_mut().copy_from_slice(&data);
        tracing::trace!(size = data.len(), "recv stanza");
        let _ = self.recv_tx.send(pkt);
    }
}
