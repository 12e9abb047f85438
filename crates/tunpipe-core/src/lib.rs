//! # tunpipe-core
//!
//! Library behind the `tunpipe` tunnel: frames captured from a local
//! link-layer endpoint travel through an ordered module pipeline and
//! out over a pluggable transport, and vice-versa.
//!
//! ## Crate structure
//!
//! - [`packet`] — packets, direction tags, the packet pool
//! - [`queue`] — thread-safe packet FIFO
//! - [`module`] — the stage lifecycle/data-plane contract
//! - [`pipeline`] — module chain, routing, worker management
//! - [`config`] — key-value store with argv/INI sources
//! - [`io`] — poll helpers and self-pipe stop wakeups
//! - [`codec`] — base64 façade for text-framed transports
//! - [`iface`] — stdio, pppd and TUN/TAP interface modules
//! - [`transport`] — UDP, HTTP and (optional) XMPP transports

pub mod codec;
pub mod config;
pub mod error;
pub mod iface;
pub mod io;
pub mod module;
pub mod packet;
pub mod pipeline;
pub mod queue;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use module::{Module, ModuleInfo, ModuleKind};
pub use packet::{Direction, Packet, PacketPool};
pub use pipeline::Pipeline;
