//! Transport modules: the network carriers of the pipeline.
//!
//! Each transport frames outbound SEND packets in its own wire format
//! and injects inbound data as RECV packets.

pub mod http;
pub mod udp;
#[cfg(feature = "xmpp")]
pub mod xmpp;
