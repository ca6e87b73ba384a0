// src/kernel/process/table.rs
//! The process table and PID allocator
//!
//! A hash map keyed by PID behind a [`TableLock`], with a per-record boolean
//! mutex. [`ProcessTable::get`] takes a shared reference on the table *and*
//! the record's mutex, so a held [`ProcessRef`] both pins the record
//! (removal needs the exclusive lock, which waits out readers) and excludes
//! other mutators of the same record.
//!
//! Holding a `ProcessRef` while calling `insert`, `remove`, or
//! `allocate_pid` deadlocks, as does taking two refs to the same PID.
//! Callers drop their handles before table-shape operations.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use hashbrown::HashMap;

use super::{Pid, Process};
use crate::kernel::sync::{RecordLock, TableLock};

/// PIDs are allocated below this bound.
pub const MAX_PID: u64 = 1024;

struct Slot {
    busy: RecordLock,
    record: UnsafeCell<Process>,
}

// Safety: the record cell is only dereferenced while `busy` is held, and
// the table lock serialises slot creation/removal against readers.
unsafe impl Send for Slot {}
unsafe impl Sync for Slot {}

/// PID-keyed table of live process records.
pub struct ProcessTable {
    lock: TableLock,
    slots: UnsafeCell<HashMap<u64, Arc<Slot>>>,
}

// Safety: the map is only touched under `lock` (shared for lookup,
// exclusive for shape changes).
unsafe impl Send for ProcessTable {}
unsafe impl Sync for ProcessTable {}

impl ProcessTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            lock: TableLock::new(),
            slots: UnsafeCell::new(HashMap::new()),
        }
    }

    /// Look up `pid`, pinning the record and taking its mutex.
    ///
    /// Returns `None` if no such record exists. The shared table reference
    /// and the record mutex are released when the returned handle drops.
    pub fn get(&self, pid: Pid) -> Option<ProcessRef<'_>> {
        self.lock.lock_shared();
        // Safety: shared lock held; writers are excluded.
        let slot = unsafe { (*self.slots.get()).get(&pid.as_u64()).cloned() };
        match slot {
            Some(slot) => {
                slot.busy.lock();
                Some(ProcessRef { table: self, slot })
            }
            None => {
                self.lock.unlock_shared();
                None
            }
        }
    }

    /// Insert a record under the exclusive lock. The record's `pid` becomes
    /// its key; an existing record under that key is replaced.
    pub fn insert(&self, record: Process) -> Pid {
        let pid = record.pid;
        self.lock.lock_exclusive();
        // Safety: exclusive lock held.
        unsafe {
            let slots = &mut *self.slots.get();
            debug_assert!(
                !slots.contains_key(&pid.as_u64()),
                "insert over live record {pid}"
            );
            slots.insert(
                pid.as_u64(),
                Arc::new(Slot {
                    busy: RecordLock::new(),
                    record: UnsafeCell::new(record),
                }),
            );
        }
        self.lock.unlock_exclusive();
        pid
    }

    /// Remove `pid` under the exclusive lock. Returns whether a record was
    /// removed.
    pub fn remove(&self, pid: Pid) -> bool {
        self.lock.lock_exclusive();
        // Safety: exclusive lock held.
        let removed = unsafe { (*self.slots.get()).remove(&pid.as_u64()).is_some() };
        self.lock.unlock_exclusive();
        removed
    }

    /// Lowest unused PID, scanning from 0. The all-ones sentinel is outside
    /// the scanned range and is never produced.
    ///
    /// The scan runs under the exclusive lock. Allocation does not reserve:
    /// the kernel is non-preemptible between allocation and the matching
    /// `insert`, so no second spawn can observe the gap.
    pub fn allocate_pid(&self) -> Option<Pid> {
        self.lock.lock_exclusive();
        // Safety: exclusive lock held.
        let slots = unsafe { &*self.slots.get() };
        let mut found = None;
        for candidate in 0..MAX_PID {
            if !slots.contains_key(&candidate) {
                found = Some(Pid::new(candidate));
                break;
            }
        }
        self.lock.unlock_exclusive();
        found
    }

    /// Whether `pid` has a live record.
    #[must_use]
    pub fn contains(&self, pid: Pid) -> bool {
        self.lock.lock_shared();
        // Safety: shared lock held.
        let present = unsafe { (*self.slots.get()).contains_key(&pid.as_u64()) };
        self.lock.unlock_shared();
        present
    }

    /// Snapshot of the live PIDs, sorted.
    #[must_use]
    pub fn pids(&self) -> Vec<Pid> {
        self.lock.lock_shared();
        // Safety: shared lock held.
        let mut pids: Vec<Pid> = unsafe {
            (*self.slots.get())
                .keys()
                .map(|&pid| Pid::new(pid))
                .collect()
        };
        self.lock.unlock_shared();
        pids.sort();
        pids
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock.lock_shared();
        // Safety: shared lock held.
        let len = unsafe { (*self.slots.get()).len() };
        self.lock.unlock_shared();
        len
    }

    /// True when no records exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Locked handle to one process record.
///
/// Dereferences to [`Process`]. Dropping it releases the record mutex and
/// the shared table reference, in that order.
pub struct ProcessRef<'t> {
    table: &'t ProcessTable,
    slot: Arc<Slot>,
}

impl Deref for ProcessRef<'_> {
    type Target = Process;

    fn deref(&self) -> &Process {
        // Safety: the record mutex is held for the life of this handle.
        unsafe { &*self.slot.record.get() }
    }
}

impl DerefMut for ProcessRef<'_> {
    fn deref_mut(&mut self) -> &mut Process {
        // Safety: the record mutex is held, so this is the only live
        // reference into the cell.
        unsafe { &mut *self.slot.record.get() }
    }
}

impl Drop for ProcessRef<'_> {
    fn drop(&mut self) {
        self.slot.busy.unlock();
        self.table.lock.unlock_shared();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mm::AddressSpace;
    use alloc::string::String;

    fn record(pid: u64) -> Process {
        Process::new(Pid::new(pid), String::from("proc"), AddressSpace::new(0))
    }

    #[test]
    fn test_insert_get_remove() {
        let table = ProcessTable::new();
        table.insert(record(0));
        table.insert(record(3));

        {
            let mut p = table.get(Pid::new(3)).expect("record exists");
            assert_eq!(p.pid, Pid::new(3));
            p.user = 7;
        }
        assert_eq!(table.get(Pid::new(3)).unwrap().user, 7);
        assert!(table.get(Pid::new(1)).is_none());

        assert!(table.remove(Pid::new(3)));
        assert!(!table.remove(Pid::new(3)));
        assert!(table.get(Pid::new(3)).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_allocate_pid_lowest_free() {
        let table = ProcessTable::new();
        assert_eq!(table.allocate_pid(), Some(Pid::new(0)));
        table.insert(record(0));
        table.insert(record(1));
        table.insert(record(2));
        assert_eq!(table.allocate_pid(), Some(Pid::new(3)));

        // Freed PIDs are recycled from the bottom.
        table.remove(Pid::new(1));
        assert_eq!(table.allocate_pid(), Some(Pid::new(1)));
    }

    #[test]
    fn test_pid_exhaustion() {
        let table = ProcessTable::new();
        for pid in 0..MAX_PID {
            table.insert(record(pid));
        }
        assert_eq!(table.allocate_pid(), None);
    }

    #[test]
    fn test_concurrent_readers_of_distinct_records() {
        let table = ProcessTable::new();
        table.insert(record(1));
        table.insert(record(2));
        let a = table.get(Pid::new(1)).unwrap();
        let b = table.get(Pid::new(2)).unwrap();
        assert_eq!(a.pid, Pid::new(1));
        assert_eq!(b.pid, Pid::new(2));
    }

    #[test]
    fn test_pids_snapshot_sorted() {
        let table = ProcessTable::new();
        for pid in [5u64, 1, 9] {
            table.insert(record(pid));
        }
        assert_eq!(
            table.pids(),
            alloc::vec![Pid::new(1), Pid::new(5), Pid::new(9)]
        );
    }
}
