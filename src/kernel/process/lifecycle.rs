// src/kernel/process/lifecycle.rs
//! Process teardown and fault delivery

use alloc::vec::Vec;

use super::{Pid, ProcessTable};
use crate::arch::{TrapFrame, REG_A0, REG_A1, REG_A2, REG_A3, REG_FP, REG_SP};
use crate::kernel::capability::CapabilityTable;
use crate::kernel::mm::MmuDriver;

/// Kill `pid`: close its capabilities, remove its record, and reclaim its
/// address space.
///
/// Killing a leader takes its threads with it, since they share the dying
/// page table. Killing a thread leaves the leader's address space intact.
/// If the dying table is the one the hardware is translating through, the
/// MMU is switched to init's table first; init's own table is never
/// destroyed.
///
/// Returns false when `pid` has no record.
pub fn kill<M: MmuDriver>(
    processes: &ProcessTable,
    capabilities: &CapabilityTable,
    mmu: &mut M,
    pid: Pid,
) -> bool {
    let (space, is_thread) = match processes.get(pid) {
        Some(record) => (record.address_space, record.is_thread()),
        None => return false,
    };

    let mut doomed: Vec<Pid> = Vec::new();
    doomed.push(pid);
    if !is_thread {
        for other in processes.pids() {
            if other == pid {
                continue;
            }
            if let Some(record) = processes.get(other) {
                if record.thread_source == Some(pid) {
                    doomed.push(other);
                }
            }
        }
    }

    for &dying in &doomed {
        capabilities.close_for(dying);
    }

    if mmu.current_table() == space && pid != Pid::INIT {
        if let Some(init) = processes.get(Pid::INIT) {
            let init_space = init.address_space;
            drop(init);
            mmu.set_current_table(init_space);
        }
    }

    for &dying in &doomed {
        processes.remove(dying);
        log::info!("killed process {dying}");
    }

    if !is_thread && pid != Pid::INIT {
        mmu.destroy_table(space);
    }
    true
}

/// What became of a faulting process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The trap frame now re-enters the process at its fault handler.
    Handled,
    /// No handler was installed; the process is gone and the caller must
    /// schedule something else.
    Killed,
}

/// Route an unhandled fault to the current process.
///
/// With a handler installed, the process resumes at the handler with
/// `(cause, pc, sp, fp)` in a0–a3. Otherwise the process is killed.
pub fn deliver_fault<M: MmuDriver>(
    processes: &ProcessTable,
    capabilities: &CapabilityTable,
    mmu: &mut M,
    trap: &mut TrapFrame,
    cause: u64,
) -> FaultOutcome {
    let handler = processes
        .get(trap.pid)
        .and_then(|record| record.fault_handler);
    match handler {
        Some(handler) => {
            trap.xs[REG_A0] = cause;
            trap.xs[REG_A1] = trap.pc.as_u64();
            trap.xs[REG_A2] = trap.xs[REG_SP];
            trap.xs[REG_A3] = trap.xs[REG_FP];
            trap.pc = handler;
            FaultOutcome::Handled
        }
        None => {
            log::warn!(
                "process {} faulted (cause {cause}) with no handler at {}",
                trap.pid,
                trap.pc
            );
            kill(processes, capabilities, mmu, trap.pid);
            FaultOutcome::Killed
        }
    }
}
