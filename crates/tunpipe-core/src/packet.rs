//! # Packets and the packet pool
//!
//! A [`Packet`] is the unit carried through the pipeline: a byte buffer
//! with a direction tag, a logical length that may be shorter than the
//! buffer, and an opaque per-packet user slot. Ownership is exclusive —
//! a packet is a plain value that moves between stages.
//!
//! The [`PacketPool`] caches released packets so the data plane does not
//! allocate per frame. Two buckets are kept: sized packets, looked up
//! smallest-fit by buffer capacity, and empty descriptors for transports
//! that attach externally-owned buffers.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};

// ─── Direction ──────────────────────────────────────────────────────────────

/// Which way a packet travels through the pipeline.
///
/// `Send` flows head→tail (local endpoint towards the transport), `Recv`
/// flows tail→head. A pooled packet is always `Unknown`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Unknown,
    Send,
    Recv,
}

impl Direction {
    /// The opposite direction. `Unknown` stays `Unknown`.
    pub fn flipped(self) -> Self {
        match self {
            Direction::Send => Direction::Recv,
            Direction::Recv => Direction::Send,
            Direction::Unknown => Direction::Unknown,
        }
    }
}

// ─── Packet ─────────────────────────────────────────────────────────────────

/// Release hook for externally-owned buffers. Runs when the packet is
/// returned to the pool (or dropped), receiving the detached buffer.
pub type ReleaseFn = Box<dyn FnOnce(Vec<u8>) + Send>;

/// A frame travelling through the pipeline.
pub struct Packet {
    dir: Direction,
    /// Backing storage. For pool-owned packets `buf.len() == actual`.
    buf: Vec<u8>,
    /// Logical payload length, always ≤ `buf.len()`.
    len: usize,
    /// Buffer capacity the pool buckets by. Zero for descriptors, even
    /// when an external buffer is attached.
    actual: usize,
    release: Option<ReleaseFn>,
    user: Option<Box<dyn Any + Send>>,
}

impl Packet {
    fn new_sized(size: usize) -> Result<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(size).map_err(|_| Error::OutOfMemory)?;
        buf.resize(size, 0);
        Ok(Packet {
            dir: Direction::Unknown,
            actual: buf.len(),
            len: size,
            buf,
            release: None,
            user: None,
        })
    }

    fn new_empty() -> Self {
        Packet {
            dir: Direction::Unknown,
            buf: Vec::new(),
            len: 0,
            actual: 0,
            release: None,
            user: None,
        }
    }

    pub fn direction(&self) -> Direction {
        self.dir
    }

    pub fn set_direction(&mut self, dir: Direction) {
        self.dir = dir;
    }

    /// Flip the direction tag in place (pipeline invert support).
    pub fn flip(&mut self) {
        self.dir = self.dir.flipped();
    }

    /// Logical payload length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Buffer capacity as seen by the pool. Zero for descriptors.
    pub fn capacity(&self) -> usize {
        self.actual
    }

    /// Shrink or restore the logical length. Must not exceed the buffer.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.buf.len(), "logical size beyond buffer");
        self.len = len;
    }

    /// The logical payload.
    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }

    /// The whole backing buffer, for readers that fill a packet and then
    /// call [`Packet::set_len`].
    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Attach an externally-owned buffer to a descriptor obtained from
    /// [`PacketPool::get_empty`]. The hook, if any, runs with the buffer
    /// when the packet is released.
    pub fn attach(&mut self, data: Vec<u8>, release: Option<ReleaseFn>) {
        debug_assert_eq!(self.actual, 0, "attach on a pool-owned buffer");
        self.len = data.len();
        self.buf = data;
        self.release = release;
    }

    pub fn set_user(&mut self, user: Box<dyn Any + Send>) {
        self.user = Some(user);
    }

    pub fn take_user(&mut self) -> Option<Box<dyn Any + Send>> {
        self.user.take()
    }

    /// Run the release hook (if armed) and detach the buffer.
    fn finalize(&mut self) {
        let data = std::mem::take(&mut self.buf);
        self.len = 0;
        if let Some(release) = self.release.take() {
            release(data);
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("dir", &self.dir)
            .field("len", &self.len)
            .field("actual", &self.actual)
            .finish()
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        // A packet dropped outside the pool (edge release, teardown)
        // must still run its release hook.
        if self.release.is_some() {
            self.finalize();
        }
    }
}

// ─── PacketPool ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct Buckets {
    /// Released sized packets; scanned smallest-fit by capacity.
    sized: Vec<Packet>,
    /// Released bare descriptors.
    empty: Vec<Packet>,
}

/// Process-wide (per context) packet cache.
///
/// All methods are safe for concurrent callers; one internal lock covers
/// both buckets. Cached packets are always in the released state:
/// direction `Unknown`, logical length restored, user slot cleared.
pub struct PacketPool {
    buckets: Mutex<Buckets>,
    /// gets − puts, for conservation checks.
    outstanding: AtomicI64,
}

impl PacketPool {
    pub fn new() -> Self {
        PacketPool {
            buckets: Mutex::new(Buckets::default()),
            outstanding: AtomicI64::new(0),
        }
    }

    /// Obtain a packet whose buffer capacity is at least `size`.
    ///
    /// Preference order: smallest cached packet that fits, then a fresh
    /// allocation. The returned packet's logical length equals `size`.
    pub fn get(&self, size: usize) -> Result<Packet> {
        let cached = {
            let mut buckets = self.buckets.lock().unwrap();
            let best = buckets
                .sized
                .iter()
                .enumerate()
                .filter(|(_, p)| p.actual >= size)
                .min_by_key(|(_, p)| p.actual)
                .map(|(i, _)| i);
            best.map(|i| buckets.sized.swap_remove(i))
        };

        let mut pkt = match cached {
            Some(pkt) => pkt,
            None => Packet::new_sized(size)?,
        };
        pkt.len = size;
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Ok(pkt)
    }

    /// Obtain a bare descriptor with no buffer, for transports that own
    /// their buffer externally (see [`Packet::attach`]).
    pub fn get_empty(&self) -> Packet {
        let cached = self.buckets.lock().unwrap().empty.pop();
        let pkt = cached.unwrap_or_else(Packet::new_empty);
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        pkt
    }

    /// Release a packet back to the pool.
    ///
    /// Sized packets are reset (direction `Unknown`, length restored to
    /// capacity, user slot cleared) and rejoin the sized bucket.
    /// Descriptors run their release hook and rejoin the empty bucket.
    pub fn put(&self, mut pkt: Packet) {
        pkt.dir = Direction::Unknown;
        pkt.user = None;
        if pkt.actual == 0 {
            pkt.finalize();
        } else {
            pkt.len = pkt.actual;
        }
        debug_assert!(pkt.actual != 0 || pkt.buf.is_empty());

        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        let mut buckets = self.buckets.lock().unwrap();
        if pkt.actual == 0 {
            buckets.empty.push(pkt);
        } else {
            buckets.sized.push(pkt);
        }
    }

    /// Packets currently held by consumers (gets − puts).
    pub fn outstanding(&self) -> i64 {
        self.outstanding.load(Ordering::Relaxed)
    }
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn sized_get_and_reuse() {
        let pool = PacketPool::new();
        let mut held = Vec::new();
        for size in 1500..1505 {
            let pkt = pool.get(size).unwrap();
            assert!(pkt.capacity() >= size);
            assert_eq!(pkt.len(), size);
            held.push(pkt);
        }
        for pkt in held {
            pool.put(pkt);
        }

        // Smallest-fit: the original 1500-byte buffer comes back.
        let pkt = pool.get(1500).unwrap();
        assert_eq!(pkt.capacity(), 1500);
        pool.put(pkt);
    }

    #[test]
    fn put_resets_state() {
        let pool = PacketPool::new();
        let mut pkt = pool.get(64).unwrap();
        pkt.set_direction(Direction::Send);
        pkt.set_len(10);
        pkt.set_user(Box::new(42u32));
        pool.put(pkt);

        let mut pkt = pool.get(64).unwrap();
        assert_eq!(pkt.direction(), Direction::Unknown);
        assert_eq!(pkt.len(), 64);
        assert!(pkt.take_user().is_none());
        pool.put(pkt);
    }

    #[test]
    fn conservation() {
        let pool = PacketPool::new();
        let a = pool.get(100).unwrap();
        let b = pool.get(200).unwrap();
        let c = pool.get_empty();
        assert_eq!(pool.outstanding(), 3);
        pool.put(a);
        pool.put(b);
        pool.put(c);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn descriptor_release_hook_runs_on_put() {
        let pool = PacketPool::new();
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();

        let mut pkt = pool.get_empty();
        pkt.attach(
            vec![1, 2, 3],
            Some(Box::new(move |buf| {
                assert_eq!(buf, vec![1, 2, 3]);
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        assert_eq!(pkt.payload(), &[1, 2, 3]);
        assert_eq!(pkt.capacity(), 0);

        pool.put(pkt);
        assert_eq!(released.load(Ordering::SeqCst), 1);

        // The cached descriptor is bare again.
        let pkt = pool.get_empty();
        assert_eq!(pkt.len(), 0);
        pool.put(pkt);
    }

    #[test]
    fn release_hook_runs_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        {
            let pool = PacketPool::new();
            let mut pkt = pool.get_empty();
            pkt.attach(
                vec![9; 8],
                Some(Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            );
            drop(pkt);
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_get_put() {
        let pool = Arc::new(PacketPool::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..500 {
                    let pkt = pool.get(1000 + (i % 16)).unwrap();
                    pool.put(pkt);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn direction_flip() {
        assert_eq!(Direction::Send.flipped(), Direction::Recv);
        assert_eq!(Direction::Recv.flipped(), Direction::Send);
        assert_eq!(Direction::Unknown.flipped(), Direction::Unknown);
    }
}
