//! Standard in/out interface.
//!
//! Frames arrive on stdin and leave on stdout; closing stdin requests an
//! orderly shutdown of the whole process.

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::module::{Module, ModuleInfo, ModuleKind};
use crate::packet::{Direction, Packet, PacketPool};

use super::fd::{EofAction, FdEndpoint, FrameRead};
use super::IF_MTU;

static STDIO_INFO: ModuleInfo = ModuleInfo {
    name: "stdio",
    descr: "Standard in/out interface",
    kind: ModuleKind::Interface,
    blocking: true,
};

pub struct StdioInterface {
    ep: FdEndpoint,
}

impl StdioInterface {
    pub fn new(_conf: &Config, pool: Arc<PacketPool>) -> Result<Self> {
        let ep = FdEndpoint::new(pool, libc::STDIN_FILENO, libc::STDOUT_FILENO, Vec::new())?;
        Ok(StdioInterface { ep })
    }
}

impl Module for StdioInterface {
    fn info(&self) -> &'static ModuleInfo {
        &STDIO_INFO
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
            None => match self.ep.read_frame(IF_MTU, EofAction::RaiseSigint)? {
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
