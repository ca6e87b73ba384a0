// src/kernel/process/mod.rs
//! Process records and the process state machine

use alloc::string::String;

use super::mm::{AddressSpace, VirtAddr};
use super::time::Instant;
use crate::abi;
use crate::arch::{REG_FP, REG_SP};

pub mod lifecycle;
pub mod table;

pub use table::{ProcessRef, ProcessTable, MAX_PID};

/// Process identifier.
///
/// `u64::MAX` is reserved at the ABI edge as the "no thread parent"
/// sentinel and is never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u64);

impl Pid {
    /// The first user process. Its address space is never reclaimed while
    /// other processes exist, and it is the fallback table when the MMU must
    /// be switched away from a dying process.
    pub const INIT: Self = Self(0);

    /// Wrap a raw PID.
    #[must_use]
    pub const fn new(pid: u64) -> Self {
        Self(pid)
    }

    /// Raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Futex-style predicate a blocked process waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Block while `*ref == value`.
    WaitIfEqual,
    /// Block while `*ref != value`.
    WaitIfNotEqual,
}

impl LockKind {
    /// Decode the ABI selector.
    #[must_use]
    pub const fn from_abi(raw: u64) -> Option<Self> {
        match raw {
            abi::LOCK_WAIT_IF_EQ => Some(Self::WaitIfEqual),
            abi::LOCK_WAIT_IF_NE => Some(Self::WaitIfNotEqual),
            _ => None,
        }
    }

    /// Whether the process keeps blocking given the current word value.
    #[must_use]
    pub const fn still_blocks(self, current: u64, value: u64) -> bool {
        match self {
            Self::WaitIfEqual => current == value,
            Self::WaitIfNotEqual => current != value,
        }
    }
}

/// Scheduling state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Runnable, waiting for a dispatch.
    Wait,
    /// Currently on the hart.
    Running,
    /// Blocked until an absolute wake time.
    Sleeping {
        /// Absolute time at which the process becomes runnable.
        until: Instant,
    },
    /// Blocked on a user lock word.
    WaitingLock {
        /// User-virtual address of the lock word.
        lock_ref: VirtAddr,
        /// Predicate selector.
        kind: LockKind,
        /// Comparison value.
        value: u64,
    },
    /// Terminated; the record is about to disappear.
    Dead,
}

/// One process record.
///
/// Records live in the [`ProcessTable`] and are only reachable through its
/// locking handles, so the fields are plain data.
#[derive(Debug)]
pub struct Process {
    /// This record's PID; always equals its table key.
    pub pid: Pid,
    /// Address-space leader when this record is a thread.
    pub thread_source: Option<Pid>,
    /// Authority tag inherited from the parent at spawn.
    pub user: u64,
    /// Display name.
    pub name: String,
    /// Integer register file.
    pub xs: [u64; 32],
    /// Floating-point register file.
    pub fs: [u64; 32],
    /// Program counter to resume at.
    pub pc: VirtAddr,
    /// Top-level page table handle.
    pub address_space: AddressSpace,
    /// Bump pointer for the next mapping the kernel places on this
    /// process's behalf (arguments, `page_alloc`, per-thread stacks).
    pub last_virtual_page: VirtAddr,
    /// Scheduling state.
    pub state: ProcessState,
    /// User fault handler entry, when installed.
    pub fault_handler: Option<VirtAddr>,
}

impl Process {
    /// A fresh record in `Wait` with zeroed registers.
    #[must_use]
    pub fn new(pid: Pid, name: String, address_space: AddressSpace) -> Self {
        Self {
            pid,
            thread_source: None,
            user: 0,
            name,
            xs: [0; 32],
            fs: [0; 32],
            pc: VirtAddr::zero(),
            address_space,
            last_virtual_page: VirtAddr::zero(),
            state: ProcessState::Wait,
            fault_handler: None,
        }
    }

    /// The PID owning this record's address space: `thread_source` for a
    /// thread, the record's own PID otherwise.
    #[must_use]
    pub fn leader(&self) -> Pid {
        self.thread_source.unwrap_or(self.pid)
    }

    /// True when this record is a thread of some leader.
    #[must_use]
    pub fn is_thread(&self) -> bool {
        self.thread_source.is_some()
    }

    /// Point SP and FP at `top`.
    pub fn set_stack(&mut self, top: VirtAddr) {
        self.xs[REG_SP] = top.as_u64();
        self.xs[REG_FP] = top.as_u64();
    }
}
