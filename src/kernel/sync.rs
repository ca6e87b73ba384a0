// src/kernel/sync.rs
//! Table locking primitives
//!
//! The process table is guarded by a single-word reader/writer lock:
//! bit 0 is the exclusive-writer flag, bits 1 and up count concurrent
//! readers (each reader adds 2). Records carry their own boolean mutex so a
//! reader of the table can still mutate one record exclusively.
//!
//! The kernel is single-hart and non-preemptible, so these never contend in
//! practice today; the atomics keep the discipline honest for a later
//! multi-core port, where the whole scheme will need revisiting anyway.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const WRITER_BIT: u64 = 1;
const READER_UNIT: u64 = 2;

/// Count-with-writer-bit reader/writer lock.
#[derive(Debug)]
pub struct TableLock {
    word: AtomicU64,
}

impl TableLock {
    /// An unlocked lock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    /// Acquire a shared (read) reference. Spins while a writer holds the
    /// word; retries if a writer slips in between the check and the add.
    pub fn lock_shared(&self) {
        loop {
            let current = self.word.load(Ordering::Acquire);
            if current & WRITER_BIT != 0 {
                core::hint::spin_loop();
                continue;
            }
            if self
                .word
                .compare_exchange_weak(
                    current,
                    current + READER_UNIT,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    /// Release a shared reference.
    pub fn unlock_shared(&self) {
        let previous = self.word.fetch_sub(READER_UNIT, Ordering::Release);
        debug_assert!(previous >= READER_UNIT, "shared unlock without lock");
    }

    /// Acquire the exclusive (write) reference. Spins until the word is
    /// completely free, then claims the writer bit.
    pub fn lock_exclusive(&self) {
        loop {
            match self.word.compare_exchange_weak(
                0,
                WRITER_BIT,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(_) => core::hint::spin_loop(),
            }
        }
    }

    /// Release the exclusive reference.
    pub fn unlock_exclusive(&self) {
        debug_assert_eq!(
            self.word.load(Ordering::Relaxed) & WRITER_BIT,
            WRITER_BIT,
            "exclusive unlock without lock"
        );
        self.word.store(0, Ordering::Release);
    }
}

impl Default for TableLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Boolean mutex guarding a single record. Not reentrant.
#[derive(Debug)]
pub struct RecordLock {
    held: AtomicBool,
}

impl RecordLock {
    /// An unlocked record lock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Spin until the record is free and claim it.
    pub fn lock(&self) {
        while self
            .held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    /// Release the record.
    pub fn unlock(&self) {
        self.held.store(false, Ordering::Release);
    }
}

impl Default for RecordLock {
    fn default() -> Self {
        Self::new()
    }
}
