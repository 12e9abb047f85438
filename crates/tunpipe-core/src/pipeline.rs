//! # Module pipeline
//!
//! An ordered chain of modules driven by up to three workers. Packets
//! tagged `Send` travel head→tail, packets tagged `Recv` travel
//! tail→head; a packet that walks off an edge is released back to the
//! pool exactly once.
//!
//! ## Workers
//!
//! - A blocking head gets a dedicated worker suspended in the head's
//!   `process(None)`.
//! - A blocking tail gets the mirror worker.
//! - All non-blocking modules share one cooperative loop that polls
//!   each of them once per cycle, head→tail.
//!
//! ## Inversion
//!
//! An edge module with the `invert` flag set sees every packet with the
//! opposite direction tag: the driver flips on the way in and flips any
//! produced packet on the way out. An interface at the tail (loopback)
//! or a transport at the head (gateway) is wired this way when added.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::module::{Module, ModuleKind};
use crate::packet::{Direction, Packet, PacketPool};

/// Pause between cooperative-loop cycles that produced nothing.
const LOOP_IDLE_TICK: Duration = Duration::from_millis(5);

// ─── Stage ──────────────────────────────────────────────────────────────────

struct Stage {
    module: Arc<dyn Module>,
    /// Flip the direction tag at this module's boundary.
    invert: bool,
}

impl Stage {
    fn apply_invert(&self, mut pkt: Packet) -> Packet {
        if self.invert {
            pkt.flip();
        }
        pkt
    }
}

// ─── Shared driver state ────────────────────────────────────────────────────

struct Shared {
    stages: Vec<Stage>,
    running: AtomicBool,
    pool: Arc<PacketPool>,
}

impl Shared {
    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Poll a module for a packet, applying inversion to the output.
    fn produce(&self, idx: usize) -> Result<Option<Packet>> {
        let stage = &self.stages[idx];
        let out = stage.module.process(None)?;
        Ok(out.map(|pkt| stage.apply_invert(pkt)))
    }

    /// Hand a packet to a module, applying inversion both ways.
    fn feed(&self, idx: usize, pkt: Packet) -> Result<Option<Packet>> {
        let stage = &self.stages[idx];
        let out = stage.module.process(Some(stage.apply_invert(pkt)))?;
        Ok(out.map(|pkt| stage.apply_invert(pkt)))
    }

    /// Chase a packet produced at `from` through successors (`Send`) or
    /// predecessors (`Recv`) until the chain ends, a module consumes
    /// it, or a module fails (the failing module released it).
    fn route(&self, from: usize, pkt: Packet) {
        let mut idx = from;
        let mut cur = pkt;
        loop {
            debug_assert_ne!(cur.direction(), Direction::Unknown, "untagged packet in flight");
            let next = match cur.direction() {
                Direction::Send if idx + 1 < self.stages.len() => Some(idx + 1),
                Direction::Recv => idx.checked_sub(1),
                _ => None,
            };
            let Some(next) = next else {
                // Edge reached; the frame has been delivered.
                self.pool.put(cur);
                return;
            };
            match self.feed(next, cur) {
                Ok(Some(out)) => {
                    idx = next;
                    cur = out;
                }
                Ok(None) => return,
                Err(err) => {
                    tracing::error!(
                        module = self.stages[next].module.name(),
                        error = %err,
                        "error while processing a packet"
                    );
                    return;
                }
            }
        }
    }

    /// Worker body for a blocking edge module.
    fn blocking_worker(&self, idx: usize) {
        let name = self.stages[idx].module.name();
        while self.running() {
            match self.produce(idx) {
                Ok(Some(pkt)) => self.route(idx, pkt),
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(module = name, error = %err, "worker exiting");
                    return;
                }
            }
        }
        tracing::debug!(module = name, "worker finished");
    }

    /// Worker body for the cooperative loop over non-blocking modules.
    fn loop_worker(&self, indices: &[usize]) {
        while self.running() {
            let mut idle = true;
            for &idx in indices {
                match self.produce(idx) {
                    Ok(Some(pkt)) => {
                        idle = false;
                        self.route(idx, pkt);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::error!(
                            module = self.stages[idx].module.name(),
                            error = %err,
                            "loop worker exiting"
                        );
                        return;
                    }
                }
            }
            if idle {
                thread::sleep(LOOP_IDLE_TICK);
            }
        }
        tracing::debug!("loop worker finished");
    }
}

// ─── Pipeline ───────────────────────────────────────────────────────────────

/// The module chain plus its workers.
pub struct Pipeline {
    pool: Arc<PacketPool>,
    building: Vec<Stage>,
    shared: Option<Arc<Shared>>,
    t_head: Option<thread::JoinHandle<()>>,
    t_tail: Option<thread::JoinHandle<()>>,
    t_loop: Option<thread::JoinHandle<()>>,
}

impl Pipeline {
    pub fn new(pool: Arc<PacketPool>) -> Self {
        Pipeline {
            pool,
            building: Vec::new(),
            shared: None,
            t_head: None,
            t_tail: None,
            t_loop: None,
        }
    }

    /// Append a module to the chain.
    ///
    /// Loopback/gateway wiring happens here: a second-or-later INTERFACE
    /// is added inverted (the tail interface of a loopback), and when
    /// the first module turns out to be a TRANSPORT it is inverted as
    /// soon as a second module arrives (gateway head).
    pub fn add_module(&mut self, module: Arc<dyn Module>) {
        assert!(self.shared.is_none(), "pipeline already started");
        let mut invert = false;
        if !self.building.is_empty() {
            if module.kind() == ModuleKind::Interface {
                invert = true;
            } else if self.building[0].module.kind() == ModuleKind::Transport {
                self.building[0].invert = true;
            }
        }
        self.building.push(Stage { module, invert });
    }

    pub fn modules_nr(&self) -> usize {
        self.building.len()
            + self
                .shared
                .as_ref()
                .map(|s| s.stages.len())
                .unwrap_or(0)
    }

    /// Run every module, then spawn the pipeline workers.
    pub fn start(&mut self) -> Result<()> {
        assert!(self.shared.is_none(), "pipeline already started");
        let stages = std::mem::take(&mut self.building);
        assert!(stages.len() >= 2, "pipeline needs at least two modules");
        assert_ne!(stages.first().unwrap().module.kind(), ModuleKind::Plugin);
        assert_ne!(stages.last().unwrap().module.kind(), ModuleKind::Plugin);
        for stage in &stages[1..stages.len() - 1] {
            assert_eq!(stage.module.kind(), ModuleKind::Plugin);
        }

        let mut armed = 0;
        let mut run_err = None;
        for stage in &stages {
            if let Err(err) = stage.module.run() {
                run_err = Some(err);
                break;
            }
            armed += 1;
        }
        if let Some(err) = run_err {
            // Wind back the modules already armed.
            for stage in &stages[..armed] {
                let _ = stage.module.stop();
            }
            self.building = stages;
            return Err(err);
        }

        let shared = Arc::new(Shared {
            stages,
            running: AtomicBool::new(true),
            pool: self.pool.clone(),
        });

        let last = shared.stages.len() - 1;
        if shared.stages[0].module.is_blocking() {
            let worker = shared.clone();
            self.t_head = Some(
                thread::Builder::new()
                    .name("pipeline-head".into())
                    .spawn(move || worker.blocking_worker(0))?,
            );
        }
        if shared.stages[last].module.is_blocking() {
            let worker = shared.clone();
            self.t_tail = Some(
                thread::Builder::new()
                    .name("pipeline-tail".into())
                    .spawn(move || worker.blocking_worker(last))?,
            );
        }
        let polled: Vec<usize> = shared
            .stages
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.module.is_blocking())
            .map(|(i, _)| i)
            .collect();
        if !polled.is_empty() {
            let worker = shared.clone();
            self.t_loop = Some(
                thread::Builder::new()
                    .name("pipeline-loop".into())
                    .spawn(move || worker.loop_worker(&polled))?,
            );
        }

        self.shared = Some(shared);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .as_ref()
            .map(|s| s.running())
            .unwrap_or(false)
    }

    /// Stop the workers and disarm every module.
    ///
    /// Order: clear the running flag, join the cooperative loop, then
    /// wake and join the tail worker, then the head worker, then stop
    /// the remaining modules. Module `stop` is idempotent, so edges
    /// that were already disarmed to unblock their workers are fine.
    pub fn stop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        shared.running.store(false, Ordering::Release);

        if let Some(t) = self.t_loop.take() {
            let _ = t.join();
        }

        let last = shared.stages.len() - 1;
        if let Some(t) = self.t_tail.take() {
            if let Err(err) = shared.stages[last].module.stop() {
                tracing::warn!(error = %err, "tail module stop failed");
            }
            let _ = t.join();
        }
        if let Some(t) = self.t_head.take() {
            if let Err(err) = shared.stages[0].module.stop() {
                tracing::warn!(error = %err, "head module stop failed");
            }
            let _ = t.join();
        }

        for stage in &shared.stages {
            if let Err(err) = stage.module.stop() {
                tracing::warn!(module = stage.module.name(), error = %err, "module stop failed");
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::module::ModuleInfo;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Non-blocking module that emits scripted frames once and records
    /// everything fed to it.
    struct Scripted {
        info: &'static ModuleInfo,
        pool: Arc<PacketPool>,
        emit: Mutex<Vec<(Direction, Vec<u8>)>>,
        seen: Mutex<Vec<(Direction, Vec<u8>)>>,
        produced: AtomicUsize,
    }

    impl Scripted {
        fn new(info: &'static ModuleInfo, pool: Arc<PacketPool>) -> Arc<Self> {
            Arc::new(Scripted {
                info,
                pool,
                emit: Mutex::new(Vec::new()),
                seen: Mutex::new(Vec::new()),
                produced: AtomicUsize::new(0),
            })
        }

        fn push_frame(&self, dir: Direction, data: &[u8]) {
            self.emit.lock().unwrap().push((dir, data.to_vec()));
        }

        fn seen(&self) -> Vec<(Direction, Vec<u8>)> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl Module for Scripted {
        fn info(&self) -> &'static ModuleInfo {
            self.info
        }
        fn run(&self) -> Result<()> {
            Ok(())
        }
        fn stop(&self) -> Result<()> {
            Ok(())
        }
        fn process(&self, input: Option<Packet>) -> Result<Option<Packet>> {
            match input {
                Some(pkt) => {
                    self.seen
                        .lock()
                        .unwrap()
                        .push((pkt.direction(), pkt.payload().to_vec()));
                    self.pool.put(pkt);
                    Ok(None)
                }
                None => {
                    let mut emit = self.emit.lock().unwrap();
                    if emit.is_empty() {
                        return Ok(None);
                    }
                    let (dir, data) = emit.remove(0);
                    let mut pkt = self.pool.get(data.len())?;
                    pkt.payload_mut().copy_from_slice(&data);
                    pkt.set_direction(dir);
                    self.produced.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(pkt))
                }
            }
        }
        fn mtu(&self) -> usize {
            1500
        }
    }

    static IFACE_INFO: ModuleInfo = ModuleInfo {
        name: "test-iface",
        descr: "scripted interface",
        kind: ModuleKind::Interface,
        blocking: false,
    };
    static TP_INFO: ModuleInfo = ModuleInfo {
        name: "test-tp",
        descr: "scripted transport",
        kind: ModuleKind::Transport,
        blocking: false,
    };
    static PLUGIN_INFO: ModuleInfo = ModuleInfo {
        name: "test-plugin",
        descr: "scripted plugin",
        kind: ModuleKind::Plugin,
        blocking: false,
    };

    fn wait_until(deadline_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn send_routes_head_to_tail() {
        let pool = Arc::new(PacketPool::new());
        let iface = Scripted::new(&IFACE_INFO, pool.clone());
        let tp = Scripted::new(&TP_INFO, pool.clone());
        iface.push_frame(Direction::Send, b"frame-1");

        let mut pipeline = Pipeline::new(pool.clone());
        pipeline.add_module(iface.clone());
        pipeline.add_module(tp.clone());
        pipeline.start().unwrap();

        assert!(wait_until(1000, || !tp.seen().is_empty()));
        pipeline.stop();

        assert_eq!(tp.seen(), vec![(Direction::Send, b"frame-1".to_vec())]);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn recv_routes_tail_to_head() {
        let pool = Arc::new(PacketPool::new());
        let iface = Scripted::new(&IFACE_INFO, pool.clone());
        let tp = Scripted::new(&TP_INFO, pool.clone());
        tp.push_frame(Direction::Recv, b"frame-2");

        let mut pipeline = Pipeline::new(pool.clone());
        pipeline.add_module(iface.clone());
        pipeline.add_module(tp.clone());
        pipeline.start().unwrap();

        assert!(wait_until(1000, || !iface.seen().is_empty()));
        pipeline.stop();

        assert_eq!(iface.seen(), vec![(Direction::Recv, b"frame-2".to_vec())]);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn loopback_tail_interface_is_inverted() {
        let pool = Arc::new(PacketPool::new());
        let head = Scripted::new(&IFACE_INFO, pool.clone());
        let tail = Scripted::new(&IFACE_INFO, pool.clone());
        head.push_frame(Direction::Send, b"ping");

        let mut pipeline = Pipeline::new(pool.clone());
        pipeline.add_module(head.clone());
        pipeline.add_module(tail.clone());
        pipeline.start().unwrap();

        // The tail interface observes the flipped direction: a RECV it
        // can write out, exactly as if a transport had produced it.
        assert!(wait_until(1000, || !tail.seen().is_empty()));
        pipeline.stop();
        assert_eq!(tail.seen(), vec![(Direction::Recv, b"ping".to_vec())]);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn gateway_head_transport_is_inverted() {
        let pool = Arc::new(PacketPool::new());
        let head = Scripted::new(&TP_INFO, pool.clone());
        let tail = Scripted::new(&TP_INFO, pool.clone());
        // A transport naturally tags what it receives as RECV; the
        // inverted head flips it to SEND so it travels to the tail.
        head.push_frame(Direction::Recv, b"relay");

        let mut pipeline = Pipeline::new(pool.clone());
        pipeline.add_module(head.clone());
        pipeline.add_module(tail.clone());
        pipeline.start().unwrap();

        assert!(wait_until(1000, || !tail.seen().is_empty()));
        pipeline.stop();
        assert_eq!(tail.seen(), vec![(Direction::Send, b"relay".to_vec())]);
    }

    #[test]
    fn plugin_sits_in_the_middle() {
        let pool = Arc::new(PacketPool::new());
        let iface = Scripted::new(&IFACE_INFO, pool.clone());
        let plugin = Scripted::new(&PLUGIN_INFO, pool.clone());
        let tp = Scripted::new(&TP_INFO, pool.clone());
        iface.push_frame(Direction::Send, b"x");

        let mut pipeline = Pipeline::new(pool.clone());
        pipeline.add_module(iface);
        pipeline.add_module(plugin.clone());
        pipeline.add_module(tp.clone());
        pipeline.start().unwrap();

        // The plugin consumed the frame; nothing reaches the transport.
        assert!(wait_until(1000, || !plugin.seen().is_empty()));
        pipeline.stop();
        assert!(tp.seen().is_empty());
    }

    #[test]
    fn edge_release_is_exact() {
        let pool = Arc::new(PacketPool::new());
        let iface = Scripted::new(&IFACE_INFO, pool.clone());
        let tp = Scripted::new(&TP_INFO, pool.clone());
        // A RECV produced at the head has no predecessor: released once.
        iface.push_frame(Direction::Recv, b"stray");

        let mut pipeline = Pipeline::new(pool.clone());
        pipeline.add_module(iface.clone());
        pipeline.add_module(tp);
        pipeline.start().unwrap();

        assert!(wait_until(1000, || {
            iface.produced.load(Ordering::SeqCst) == 1 && pool.outstanding() == 0
        }));
        pipeline.stop();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    #[should_panic(expected = "at least two modules")]
    fn start_requires_two_modules() {
        let pool = Arc::new(PacketPool::new());
        let iface = Scripted::new(&IFACE_INFO, pool.clone());
        let mut pipeline = Pipeline::new(pool);
        pipeline.add_module(iface);
        let _ = pipeline.start();
    }
}
