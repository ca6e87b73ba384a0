// src/kernel/scheduler/mod.rs
//! Ready queue and cooperative dispatch
//!
//! Single hart, cooperative within the kernel: the only suspension points
//! are trap entry and the explicit calls below. [`next_runnable`] sweeps the
//! ready queue once per call, polling blocked processes' wake conditions on
//! the way; [`switch_to`] moves the register files between the trap frame
//! and process records and installs the target's page table.

use crossbeam_queue::SegQueue;

use super::mm::{user, MmuDriver};
use super::process::{Pid, ProcessState, ProcessTable};
use super::time::Clock;
use crate::arch::{TrapFrame, REG_A0, REG_A1};

/// FIFO of runnable (or pollable-blocked) PIDs.
///
/// A PID is present at most once per residency; a sweep that dequeues a
/// still-blocked PID puts it back at the tail.
pub struct ReadyQueue {
    queue: SegQueue<Pid>,
}

impl ReadyQueue {
    /// An empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
        }
    }

    /// Enqueue at the tail.
    pub fn push(&self, pid: Pid) {
        self.queue.push(pid);
    }

    /// Dequeue from the head.
    pub fn pop(&self) -> Option<Pid> {
        self.queue.pop()
    }

    /// Current number of queued PIDs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Pick the next PID to dispatch.
///
/// Sweeps the ready queue exactly as many entries as it held on entry.
/// For each dequeued PID:
///
/// - the current PID is skipped (its own wake conditions are checked in the
///   fallback below),
/// - a `Wait` process is returned,
/// - a `Sleeping` process past its wake time gets the actual time written
///   to its a0/a1 and is returned,
/// - a `WaitingLock` process whose predicate no longer holds gets 0 in a0
///   and is returned,
/// - anything still blocked is re-enqueued; PIDs with no record are
///   discarded.
///
/// If the sweep finds nothing and the current process can continue (still
/// running, or its own sleep/lock wait is over), it is returned. Otherwise
/// the sweep repeats — the hart busy-waits until time or another process's
/// store makes something runnable.
pub fn next_runnable<M: MmuDriver, C: Clock>(
    processes: &ProcessTable,
    ready: &ReadyQueue,
    mmu: &M,
    clock: &C,
    current: Pid,
) -> Pid {
    loop {
        let pending = ready.len();
        for _ in 0..pending {
            let Some(pid) = ready.pop() else {
                break;
            };
            if pid == current {
                continue;
            }
            let Some(mut record) = processes.get(pid) else {
                // Dead PID drained from the queue.
                continue;
            };
            match record.state {
                ProcessState::Wait => {
                    drop(record);
                    return pid;
                }
                ProcessState::Sleeping { until } => {
                    let now = clock.now();
                    if until <= now {
                        record.xs[REG_A0] = now.seconds;
                        record.xs[REG_A1] = now.micros;
                        drop(record);
                        return pid;
                    }
                    drop(record);
                    ready.push(pid);
                }
                ProcessState::WaitingLock {
                    lock_ref,
                    kind,
                    value,
                } => {
                    let space = record.address_space;
                    match user::read_user_u64(mmu, space, lock_ref) {
                        Ok(word) if !kind.still_blocks(word, value) => {
                            record.xs[REG_A0] = 0;
                            drop(record);
                            return pid;
                        }
                        Ok(_) => {
                            drop(record);
                            ready.push(pid);
                        }
                        Err(err) => {
                            // Unreadable lock word; the process stays
                            // blocked rather than waking into garbage.
                            log::warn!("lock word of {pid} unreadable: {err}");
                            drop(record);
                            ready.push(pid);
                        }
                    }
                }
                ProcessState::Running | ProcessState::Dead => {
                    drop(record);
                    ready.push(pid);
                }
            }
        }

        // Nothing else can run; see whether the current process may simply
        // continue or has itself woken up.
        if let Some(mut record) = processes.get(current) {
            match record.state {
                ProcessState::Running => return current,
                ProcessState::Sleeping { until } => {
                    let now = clock.now();
                    if until <= now {
                        record.xs[REG_A0] = now.seconds;
                        record.xs[REG_A1] = now.micros;
                        return current;
                    }
                }
                ProcessState::WaitingLock {
                    lock_ref,
                    kind,
                    value,
                } => {
                    let space = record.address_space;
                    if let Ok(word) = user::read_user_u64(mmu, space, lock_ref) {
                        if !kind.still_blocks(word, value) {
                            record.xs[REG_A0] = 0;
                            return current;
                        }
                    }
                }
                ProcessState::Wait | ProcessState::Dead => {}
            }
        }
        core::hint::spin_loop();
    }
}

/// Context-switch through the trap frame to `target`.
///
/// When the frame belongs to a different process, that process's registers
/// and pc are saved back to its record, a `Running` state is demoted to
/// `Wait`, and its PID re-enters the ready queue (blocked processes are
/// enqueued too, so every dispatch polls them). Then the target's registers
/// are loaded, its page table installed, and its state set to `Running`.
///
/// When `target` is the frame's own process there is nothing to save: a
/// still-running process keeps its live frame untouched, while a process
/// waking from its own block is reloaded from its record (blocking syscalls
/// save the frame there, and the wake-up values were written there too).
///
/// Switching to a PID without a record leaves the frame unchanged.
pub fn switch_to<M: MmuDriver>(
    processes: &ProcessTable,
    ready: &ReadyQueue,
    mmu: &mut M,
    trap: &mut TrapFrame,
    target: Pid,
) {
    if trap.pid != target {
        if let Some(mut outgoing) = processes.get(trap.pid) {
            outgoing.pc = trap.pc;
            outgoing.xs = trap.xs;
            outgoing.fs = trap.fs;
            if outgoing.state == ProcessState::Running {
                outgoing.state = ProcessState::Wait;
            }
            drop(outgoing);
            ready.push(trap.pid);
        }
    }

    let Some(mut record) = processes.get(target) else {
        log::warn!("switch to missing process {target}");
        return;
    };
    if trap.pid == target && record.state == ProcessState::Running {
        // Continue case: the frame already holds the live registers.
        return;
    }
    trap.pid = target;
    trap.pc = record.pc;
    trap.xs = record.xs;
    trap.fs = record.fs;
    mmu.set_current_table(record.address_space);
    record.state = ProcessState::Running;
}
