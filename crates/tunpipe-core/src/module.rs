//! # Module abstraction
//!
//! A module is a named pipeline stage with a uniform lifecycle and
//! data-plane contract. Kinds: interface (local link-layer endpoint),
//! transport (network carrier), plugin (middle stage).
//!
//! ## Data plane
//!
//! The single data-plane operation is [`Module::process`]:
//!
//! | input     | returns     | meaning                                       |
//! |-----------|-------------|-----------------------------------------------|
//! | `None`    | `Some(pkt)` | produced a packet, direction set (poll hit)   |
//! | `None`    | `None`      | nothing available at this instant             |
//! | `Some(p)` | `Some(q)`   | consumed `p`, produced `q`                    |
//! | `Some(p)` | `None`      | consumed `p` without producing anything       |
//!
//! Ownership: the input moves into the callee. On success any returned
//! packet belongs to the caller and a non-returned input has been
//! consumed or released. On error the callee has already released any
//! input it received — the caller never sees the packet again.
//!
//! A *blocking* module may suspend in `process(None)` and must return
//! promptly once `stop()` is called (every wait includes a stop wakeup).
//! A *non-blocking* module never suspends and reports "nothing ready"
//! by returning `Ok(None)`.
//!
//! ## Lifecycle
//!
//! construct → `run` → (`process`)* → `stop` → drop. `run` arms I/O and
//! may spawn module-internal workers; `stop` disarms, terminates those
//! workers, and is idempotent and callable from a different thread.

use crate::error::Result;
use crate::packet::Packet;

/// Stage kind. Interfaces and transports sit at the pipeline edges;
/// plugins in the middle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Interface,
    Transport,
    Plugin,
}

/// Static descriptor of a module implementation.
#[derive(Debug, Clone, Copy)]
pub struct ModuleInfo {
    /// Registry name (`stdio`, `udp`, ...).
    pub name: &'static str,
    /// One-line description for `--list`.
    pub descr: &'static str,
    pub kind: ModuleKind,
    /// Whether `process(None)` may suspend. Blocking edge modules get a
    /// dedicated pipeline worker; non-blocking ones share the loop.
    pub blocking: bool,
}

/// A pipeline stage. Implementations use interior mutability: `process`
/// may be called concurrently for the two directions (the producing
/// worker polls with `None` while a routing worker feeds `Some`).
pub trait Module: Send + Sync {
    fn info(&self) -> &'static ModuleInfo;

    /// Arm I/O: open devices, connect sockets, spawn internal workers.
    fn run(&self) -> Result<()>;

    /// Disarm: wake any suspended `process`, terminate internal workers,
    /// release held resources. Idempotent.
    fn stop(&self) -> Result<()>;

    /// The data-plane operation; see the module-level semantics table.
    fn process(&self, input: Option<Packet>) -> Result<Option<Packet>>;

    /// Maximum payload this module produces or accepts; sources size
    /// their read buffers with it.
    fn mtu(&self) -> usize;

    fn name(&self) -> &'static str {
        self.info().name
    }

    fn kind(&self) -> ModuleKind {
        self.info().kind
    }

    fn is_blocking(&self) -> bool {
        self.info().blocking
    }
}
