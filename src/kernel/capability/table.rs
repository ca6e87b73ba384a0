// src/kernel/capability/table.rs
//! The capability table
//!
//! Maps tokens to channel endpoints and enforces receiver authority on
//! every operation. The whole table sits behind one mutex; the table is
//! small and every operation is a short critical section.
//!
//! A process may operate on an endpoint when the endpoint's receiver is the
//! process itself or shares its address-space leader (the leader, one of
//! its threads, or a sibling thread).
//!
//! When a process dies, every endpoint it receives on is closed in place:
//! the queue is freed and the receiver cleared. The peer endpoint is left
//! in the table so tokens held by the survivor stay unforgeable; writes to
//! it report "closed" from then on.

use core::fmt;

use hashbrown::HashMap;
use spin::Mutex;

use super::{Capability, Endpoint, Message, MessageRing, MESSAGE_INTERRUPT};
use crate::kernel::process::{Pid, ProcessTable};

/// Why a send failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Unknown token or caller not authorised.
    Invalid,
    /// The destination queue is full.
    Full,
    /// The destination endpoint has been closed.
    Closed,
}

impl SendError {
    /// String form for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid capability",
            Self::Full => "queue full",
            Self::Closed => "endpoint closed",
        }
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a receive failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    /// Unknown token or caller not authorised.
    Invalid,
    /// Nothing queued.
    Empty,
    /// The endpoint has been closed.
    Closed,
}

impl RecvError {
    /// String form for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid capability",
            Self::Empty => "queue empty",
            Self::Closed => "endpoint closed",
        }
    }
}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a transfer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    /// Unknown token, wrong current owner, or the move would carry an
    /// init-connected capability outside init's trust line.
    Invalid,
    /// The new owner is not a live process.
    NoSuchOwner,
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid => f.write_str("invalid transfer"),
            Self::NoSuchOwner => f.write_str("no such owner"),
        }
    }
}

/// Unknown token or unauthorised caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidCapability;

impl fmt::Display for InvalidCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid capability")
    }
}

struct Inner {
    endpoints: HashMap<u64, Endpoint>,
    next_token: u64,
}

impl Inner {
    /// Next free token, incrementing past 0 and occupied slots.
    fn allocate_token(&mut self) -> Capability {
        loop {
            let raw = self.next_token;
            self.next_token = self.next_token.wrapping_add(1);
            if raw != 0 && !self.endpoints.contains_key(&raw) {
                return Capability::new(raw);
            }
        }
    }
}

/// Token-keyed table of channel endpoints.
pub struct CapabilityTable {
    inner: Mutex<Inner>,
}

impl CapabilityTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                endpoints: HashMap::new(),
                next_token: 1,
            }),
        }
    }

    /// Number of endpoints in the table, closed stubs included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().endpoints.len()
    }

    /// True when no endpoints exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a linked endpoint pair; `a` receives for `pid_a`, `b` for
    /// `pid_b`, and each stores the other's token as its sender.
    pub fn create_pair(&self, pid_a: Pid, pid_b: Pid) -> (Capability, Capability) {
        let mut inner = self.inner.lock();
        let token_a = inner.allocate_token();
        let token_b = inner.allocate_token();
        inner.endpoints.insert(
            token_a.as_u64(),
            Endpoint {
                queue: Some(MessageRing::new()),
                sender: token_b,
                receiver: Some(pid_a),
            },
        );
        inner.endpoints.insert(
            token_b.as_u64(),
            Endpoint {
                queue: Some(MessageRing::new()),
                sender: token_a,
                receiver: Some(pid_b),
            },
        );
        log::trace!("capability pair {token_a}/{token_b} for {pid_a}/{pid_b}");
        (token_a, token_b)
    }

    /// Clone `original` for `caller`.
    ///
    /// Allowed only when the caller shares authority over the original
    /// endpoint. The clone is a one-way view: it receives for the caller
    /// and its sender is the original token, while the original pair's
    /// linkage is untouched.
    pub fn clone_endpoint(
        &self,
        processes: &ProcessTable,
        caller: Pid,
        original: Capability,
    ) -> Result<Capability, InvalidCapability> {
        let mut inner = self.inner.lock();
        let receiver = inner
            .endpoints
            .get(&original.as_u64())
            .ok_or(InvalidCapability)?
            .receiver;
        if !may_access(processes, caller, receiver) {
            return Err(InvalidCapability);
        }
        let token = inner.allocate_token();
        inner.endpoints.insert(
            token.as_u64(),
            Endpoint {
                queue: Some(MessageRing::new()),
                sender: original,
                receiver: Some(caller),
            },
        );
        Ok(token)
    }

    /// Move `cap` from `old_owner` to `new_owner`.
    ///
    /// The current receiver must be exactly `old_owner`, the new owner must
    /// be live, and a capability connected to init can only be handed to
    /// init or one of its threads.
    pub fn transfer(
        &self,
        processes: &ProcessTable,
        cap: Capability,
        old_owner: Pid,
        new_owner: Pid,
    ) -> Result<(), TransferError> {
        let mut inner = self.inner.lock();
        let endpoint = inner
            .endpoints
            .get(&cap.as_u64())
            .ok_or(TransferError::Invalid)?;
        if endpoint.receiver != Some(old_owner) {
            return Err(TransferError::Invalid);
        }
        if !processes.contains(new_owner) {
            return Err(TransferError::NoSuchOwner);
        }
        if connects_to_init_locked(&inner, processes, cap)
            && !is_init_or_init_thread(processes, new_owner)
        {
            log::warn!("refused transfer of init-connected {cap} to {new_owner}");
            return Err(TransferError::Invalid);
        }
        // Re-borrow mutably; the entry was present above.
        if let Some(endpoint) = inner.endpoints.get_mut(&cap.as_u64()) {
            endpoint.receiver = Some(new_owner);
        }
        Ok(())
    }

    /// Send `message` over `cap`: the push lands in the *peer's* queue.
    pub fn send(
        &self,
        processes: &ProcessTable,
        caller: Pid,
        cap: Capability,
        message: Message,
    ) -> Result<(), SendError> {
        let mut inner = self.inner.lock();
        let endpoint = inner
            .endpoints
            .get(&cap.as_u64())
            .ok_or(SendError::Invalid)?;
        if !may_access(processes, caller, endpoint.receiver) {
            return Err(SendError::Invalid);
        }
        let peer = endpoint.sender;
        let peer_endpoint = inner
            .endpoints
            .get_mut(&peer.as_u64())
            .ok_or(SendError::Invalid)?;
        if peer_endpoint.receiver.is_none() {
            return Err(SendError::Closed);
        }
        match peer_endpoint.queue.as_mut() {
            Some(queue) => {
                if queue.push(message) {
                    Ok(())
                } else {
                    Err(SendError::Full)
                }
            }
            None => Err(SendError::Closed),
        }
    }

    /// Deliver an interrupt notification directly into `cap`'s own queue.
    ///
    /// Used by the trap glue to hand IRQs to the driver process holding the
    /// endpoint.
    pub fn send_interrupt(&self, cap: Capability, irq: u64) -> Result<(), SendError> {
        let mut inner = self.inner.lock();
        let endpoint = inner
            .endpoints
            .get_mut(&cap.as_u64())
            .ok_or(SendError::Invalid)?;
        if endpoint.receiver.is_none() {
            return Err(SendError::Closed);
        }
        match endpoint.queue.as_mut() {
            Some(queue) => {
                let message = Message {
                    kind: MESSAGE_INTERRUPT,
                    source: 0,
                    data: irq,
                    metadata: 0,
                };
                if queue.push(message) {
                    Ok(())
                } else {
                    log::warn!("interrupt {irq} dropped: queue full on {cap}");
                    Err(SendError::Full)
                }
            }
            None => Err(SendError::Closed),
        }
    }

    /// Pop the next message from `cap`'s own queue.
    pub fn recv(
        &self,
        processes: &ProcessTable,
        caller: Pid,
        cap: Capability,
    ) -> Result<Message, RecvError> {
        let mut inner = self.inner.lock();
        let endpoint = inner
            .endpoints
            .get_mut(&cap.as_u64())
            .ok_or(RecvError::Invalid)?;
        if !may_access(processes, caller, endpoint.receiver) {
            return Err(RecvError::Invalid);
        }
        match endpoint.queue.as_mut() {
            Some(queue) => queue.pop().ok_or(RecvError::Empty),
            None => Err(RecvError::Closed),
        }
    }

    /// Whether either side of `cap`'s pair is received by init or an init
    /// thread. Used to spot privileged channels during syscall
    /// authorisation.
    #[must_use]
    pub fn connects_to_init(&self, processes: &ProcessTable, cap: Capability) -> bool {
        let inner = self.inner.lock();
        connects_to_init_locked(&inner, processes, cap)
    }

    /// Close every endpoint received by `pid`: free the queue and clear the
    /// receiver. Peer endpoints survive and observe "closed" on their next
    /// send.
    pub fn close_for(&self, pid: Pid) {
        let mut inner = self.inner.lock();
        let mut closed = 0usize;
        for endpoint in inner.endpoints.values_mut() {
            if endpoint.receiver == Some(pid) {
                endpoint.queue = None;
                endpoint.receiver = None;
                closed += 1;
            }
        }
        if closed > 0 {
            log::debug!("closed {closed} endpoints of dead process {pid}");
        }
    }
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::new()
    }
}

fn connects_to_init_locked(inner: &Inner, processes: &ProcessTable, cap: Capability) -> bool {
    let Some(endpoint) = inner.endpoints.get(&cap.as_u64()) else {
        return false;
    };
    let here = endpoint
        .receiver
        .is_some_and(|pid| is_init_or_init_thread(processes, pid));
    let there = inner
        .endpoints
        .get(&endpoint.sender.as_u64())
        .and_then(|peer| peer.receiver)
        .is_some_and(|pid| is_init_or_init_thread(processes, pid));
    here || there
}

fn is_init_or_init_thread(processes: &ProcessTable, pid: Pid) -> bool {
    if pid == Pid::INIT {
        return true;
    }
    processes
        .get(pid)
        .map(|record| record.leader() == Pid::INIT)
        .unwrap_or(false)
}

/// Authority check: the caller may operate on an endpoint when it is the
/// receiver or shares the receiver's address-space leader.
fn may_access(processes: &ProcessTable, caller: Pid, receiver: Option<Pid>) -> bool {
    let Some(receiver) = receiver else {
        return false;
    };
    if caller == receiver {
        return true;
    }
    let Some(caller_leader) = processes.get(caller).map(|record| record.leader()) else {
        return false;
    };
    let Some(receiver_leader) = processes.get(receiver).map(|record| record.leader()) else {
        return false;
    };
    caller_leader == receiver_leader
}
