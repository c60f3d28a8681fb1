//! Processors own the protocol side of a connection: the driver hands them
//! the raw bytes of every message received on a handle bound to them.
use std::{collections::HashMap, fmt};

use bytes::Bytes;

use crate::{
    driver::{calls::CallRegistry, tasks::TaskSpawner, timer::TimerHandle},
    transport::{Handle, MessageInfo, Transport},
};

/// Key of a processor in the driver's registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessorId(pub u64);

impl fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "processor-{}", self.0)
    }
}

/// Per-message flags set by the dispatch table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags(u8);

impl MessageFlags {
    /// the handle was bound through a router, not a direct attach
    pub const ROUTED: MessageFlags = MessageFlags(0b01);
    /// first message since the handle was bound
    pub const FIRST: MessageFlags = MessageFlags(0b10);

    /// no flags
    pub const fn empty() -> Self {
        MessageFlags(0)
    }

    /// Returns true if every flag in `other` is set.
    pub const fn contains(self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// set `other` on top of `self`
    #[must_use]
    pub const fn with(self, other: MessageFlags) -> Self {
        MessageFlags(self.0 | other.0)
    }
}

/// What a processor may touch while handling a message.
pub struct ProcessorContext<'a> {
    /// send replies or open connections
    pub transport: &'a mut dyn Transport,
    /// complete outstanding calls
    pub calls: &'a CallRegistry,
    /// start timers
    pub timer: &'a TimerHandle,
    /// spawn cooperative tasks
    pub spawner: &'a TaskSpawner,
}

impl fmt::Debug for ProcessorContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorContext")
            .field("transport", &self.transport)
            .field("calls", &self.calls.len())
            .finish()
    }
}

/// A wire-protocol handler bound to connection handles.
pub trait Processor: fmt::Debug {
    /// short name, used as the prefix of this processor's resource items
    fn name(&self) -> &str;

    /// A message arrived on `remote`.
    fn on_message(
        &mut self,
        ctx: &mut ProcessorContext<'_>,
        remote: Handle,
        payload: Bytes,
        info: &MessageInfo,
        flags: MessageFlags,
    );

    /// Periodic maintenance, run once per tick. Returns how many events it
    /// handled.
    fn update(&mut self) -> usize {
        0
    }

    /// Current resource counters, sampled by the self-stats timer.
    fn resource_used(&self) -> HashMap<String, i64> {
        HashMap::new()
    }
}
