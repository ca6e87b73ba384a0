// src/kernel/capability/mod.rs
//! Capability tokens, messages, and channel endpoints
//!
//! A capability is an unforgeable opaque `u64` naming one endpoint of a
//! bidirectional channel. Holding the token is the entire authority model:
//! there is no way to enumerate tokens, and the kernel checks the caller
//! against the endpoint's receiver on every operation. Each endpoint
//! carries a bounded FIFO of fixed-size messages.

pub mod table;

pub use table::CapabilityTable;

use super::process::Pid;

/// Messages a single endpoint can buffer.
pub const QUEUE_CAPACITY: usize = 8;

/// Message type reserved for interrupt notifications (`data` = IRQ id,
/// `source` = 0).
pub const MESSAGE_INTERRUPT: u32 = 4;

/// Opaque channel-endpoint token.
///
/// Value 0 is never a live endpoint. Tokens are currently allocated
/// monotonically; a real entropy source has to replace that before any
/// untrusted process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capability(u64);

impl Capability {
    /// The never-valid token.
    pub const INVALID: Self = Self(0);

    /// Wrap a raw token.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw token value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// False only for the zero token.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl core::fmt::Display for Capability {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// One IPC message.
///
/// Type 4 ([`MESSAGE_INTERRUPT`]) is reserved; other types are agreed
/// between user processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Message {
    /// Message type.
    pub kind: u32,
    /// Sending PID, or 0 for kernel-originated interrupt messages.
    pub source: u64,
    /// First payload word.
    pub data: u64,
    /// Second payload word.
    pub metadata: u64,
}

impl Message {
    /// Wire size when serialized for `recv` (4 little-endian u64 words).
    pub const WIRE_SIZE: usize = 32;

    /// Serialize into the user-visible layout.
    #[must_use]
    pub fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[..8].copy_from_slice(&u64::from(self.kind).to_le_bytes());
        out[8..16].copy_from_slice(&self.source.to_le_bytes());
        out[16..24].copy_from_slice(&self.data.to_le_bytes());
        out[24..32].copy_from_slice(&self.metadata.to_le_bytes());
        out
    }
}

/// Bounded message FIFO. `len` is the source of truth for full/empty;
/// `start`/`end` wrap at the capacity.
#[derive(Debug)]
pub(crate) struct MessageRing {
    slots: [Message; QUEUE_CAPACITY],
    start: usize,
    end: usize,
    len: usize,
}

impl MessageRing {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [Message {
                kind: 0,
                source: 0,
                data: 0,
                metadata: 0,
            }; QUEUE_CAPACITY],
            start: 0,
            end: 0,
            len: 0,
        }
    }

    pub(crate) const fn is_full(&self) -> bool {
        self.len >= QUEUE_CAPACITY
    }

    /// Push at the tail. Returns false when full, leaving the ring
    /// untouched.
    pub(crate) fn push(&mut self, message: Message) -> bool {
        if self.is_full() {
            return false;
        }
        self.slots[self.end] = message;
        self.end = (self.end + 1) % QUEUE_CAPACITY;
        self.len += 1;
        true
    }

    /// Pop from the head.
    pub(crate) fn pop(&mut self) -> Option<Message> {
        if self.len == 0 {
            return None;
        }
        let message = self.slots[self.start];
        self.start = (self.start + 1) % QUEUE_CAPACITY;
        self.len -= 1;
        Some(message)
    }
}

/// One side of a capability pair.
#[derive(Debug)]
pub(crate) struct Endpoint {
    /// Incoming messages; `None` once the endpoint is closed.
    pub(crate) queue: Option<MessageRing>,
    /// The peer endpoint's token.
    pub(crate) sender: Capability,
    /// Owning process; `None` once the endpoint is closed.
    pub(crate) receiver: Option<Pid>,
}
