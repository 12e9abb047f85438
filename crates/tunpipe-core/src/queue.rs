//! Thread-safe packet queue.
//!
//! A mutex-guarded deque used where one thread produces packets and
//! another consumes them (transport workers feeding the data plane).
//! Pure hand-off storage; blocking waits are built on channels by the
//! modules that need them.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::packet::Packet;

/// FIFO of packets with front/back access.
#[derive(Default)]
pub struct PacketQueue {
    q: Mutex<VecDeque<Packet>>,
}

impl PacketQueue {
    pub fn new() -> Self {
        PacketQueue {
            q: Mutex::new(VecDeque::new()),
        }
    }

    /// Append to the tail.
    pub fn enqueue(&self, pkt: Packet) {
        self.q.lock().unwrap().push_back(pkt);
    }

    /// Remove and return the head.
    pub fn dequeue(&self) -> Option<Packet> {
        self.q.lock().unwrap().pop_front()
    }

    /// Remove and return the tail (reverse order drain).
    pub fn dequeue_last(&self) -> Option<Packet> {
        self.q.lock().unwrap().pop_back()
    }

    /// Inspect the head without removing it.
    pub fn peek<R>(&self, f: impl FnOnce(&Packet) -> R) -> Option<R> {
        self.q.lock().unwrap().front().map(f)
    }

    /// Discard the head, returning it so the caller can release it.
    pub fn pop(&self) -> Option<Packet> {
        self.q.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.q.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketPool;

    #[test]
    fn fifo_order() {
        let pool = PacketPool::new();
        let q = PacketQueue::new();

        let mut p1 = pool.get(4).unwrap();
        p1.payload_mut().copy_from_slice(b"one!");
        let mut p2 = pool.get(4).unwrap();
        p2.payload_mut().copy_from_slice(b"two!");

        q.enqueue(p1);
        q.enqueue(p2);
        assert_eq!(q.len(), 2);

        let p1 = q.dequeue().unwrap();
        assert_eq!(p1.payload(), b"one!");
        let p2 = q.dequeue().unwrap();
        assert_eq!(p2.payload(), b"two!");
        assert!(q.dequeue().is_none());

        // Re-enqueue works after drain.
        q.enqueue(p1);
        assert_eq!(q.dequeue().unwrap().payload(), b"one!");

        pool.put(p2);
    }

    #[test]
    fn dequeue_last_reverses() {
        let pool = PacketPool::new();
        let q = PacketQueue::new();
        for byte in [b'a', b'b', b'c'] {
            let mut pkt = pool.get(1).unwrap();
            pkt.payload_mut()[0] = byte;
            q.enqueue(pkt);
        }
        assert_eq!(q.dequeue_last().unwrap().payload(), b"c");
        assert_eq!(q.dequeue_last().unwrap().payload(), b"b");
        assert_eq!(q.dequeue_last().unwrap().payload(), b"a");
        assert!(q.dequeue_last().is_none());
    }

    #[test]
    fn peek_keeps_head() {
        let pool = PacketPool::new();
        let q = PacketQueue::new();
        let mut pkt = pool.get(2).unwrap();
        pkt.payload_mut().copy_from_slice(b"hi");
        q.enqueue(pkt);

        let len = q.peek(|p| p.len()).unwrap();
        assert_eq!(len, 2);
        assert_eq!(q.len(), 1);

        let pkt = q.pop().unwrap();
        assert!(q.is_empty());
        pool.put(pkt);
    }
}
