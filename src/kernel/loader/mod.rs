// src/kernel/loader/mod.rs
//! Building processes from executable images
//!
//! [`spawn_from_image`] maps an image's loadable segments into a fresh
//! address space, places a stack and the argument buffer above them, and
//! inserts the finished record. [`spawn_thread`] carves a stack out of an
//! existing address space instead.
//!
//! Address-space layout after a spawn, page by page:
//!
//! ```text
//! segments .. max_page | stack (stack_pages) | guard | args | guard | ...
//! ```
//!
//! SP and FP start at the top of the stack minus 8; `last_virtual_page`
//! ends up just past the trailing guard, ready for the next kernel-placed
//! mapping.

use alloc::string::String;
use alloc::vec::Vec;

use super::image::{ExecutableImage, ImageKind, SegmentFlags};
use super::mm::{user, AddressSpace, MmuDriver, MmuError, PageFlags, VirtAddr, PAGE_SIZE};
use super::process::{Pid, Process, ProcessTable};
use super::scheduler::ReadyQueue;
use crate::arch::{REG_A0, REG_A1};

/// Why a spawn failed. No process record is left behind on any of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// The image header does not describe an executable.
    NotExecutable,
    /// Every PID below the limit is taken.
    PidExhausted,
    /// The MMU could not allocate a page or table.
    OutOfMemory,
    /// `spawn_thread` was given a PID with no record.
    NoSuchParent,
}

impl SpawnError {
    /// String form for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotExecutable => "image is not executable",
            Self::PidExhausted => "no free pid",
            Self::OutOfMemory => "out of memory",
            Self::NoSuchParent => "no such parent",
        }
    }
}

impl core::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<MmuError> for SpawnError {
    fn from(_: MmuError) -> Self {
        Self::OutOfMemory
    }
}

/// Translate image segment flags to page flags.
///
/// The write bit is only honoured when the segment is not executable; a
/// W+X segment maps execute-only. Existing user binaries are linked against
/// this precedence, so it stays.
fn segment_page_flags(flags: SegmentFlags) -> PageFlags {
    let mut page_flags = PageFlags::USER;
    if flags.contains(SegmentFlags::EXECUTE) {
        page_flags |= PageFlags::EXECUTE;
    } else if flags.contains(SegmentFlags::WRITE) {
        page_flags |= PageFlags::WRITE;
    }
    if flags.contains(SegmentFlags::READ) {
        page_flags |= PageFlags::READ;
    }
    page_flags
}

/// Build a process from `image` and enqueue it.
///
/// The new record inherits `user` from `parent` when given. PID 0 reuses
/// the boot page table and is not enqueued; init is dispatched by the first
/// trap. On failure nothing is inserted and a created table is destroyed.
pub fn spawn_from_image<M: MmuDriver, I: ExecutableImage>(
    processes: &ProcessTable,
    ready: &ReadyQueue,
    mmu: &mut M,
    name: &str,
    parent: Option<Pid>,
    image: &I,
    stack_pages: u64,
    args: &[u8],
) -> Result<Pid, SpawnError> {
    if image.header().kind != ImageKind::Executable {
        log::warn!("spawn {name:?}: image is not executable");
        return Err(SpawnError::NotExecutable);
    }

    let pid = processes.allocate_pid().ok_or(SpawnError::PidExhausted)?;

    // Init keeps the boot table; everything else gets a fresh table with
    // the kernel mapped so traps need no table switch.
    let space = if pid == Pid::INIT {
        mmu.current_table()
    } else {
        let space = mmu.create_table()?;
        mmu.identity_map_kernel(space);
        space
    };

    match build_process(processes, mmu, name, parent, image, stack_pages, args, pid, space) {
        Ok(record) => {
            processes.insert(record);
            if pid != Pid::INIT {
                ready.push(pid);
            }
            log::info!("spawned {name:?} as {pid}");
            Ok(pid)
        }
        Err(err) => {
            if pid != Pid::INIT {
                mmu.destroy_table(space);
            }
            log::warn!("spawn {name:?} failed: {err}");
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_process<M: MmuDriver, I: ExecutableImage>(
    processes: &ProcessTable,
    mmu: &mut M,
    name: &str,
    parent: Option<Pid>,
    image: &I,
    stack_pages: u64,
    args: &[u8],
    pid: Pid,
    space: AddressSpace,
) -> Result<Process, SpawnError> {
    let mut record = Process::new(pid, String::from(name), space);
    record.pc = image.header().entry;

    // Map every segment page, reusing pages already mapped to user memory
    // where segments overlap, and track the highest page touched.
    let mut max_page = VirtAddr::zero();
    for index in 0..image.segment_count() {
        let Some(segment) = image.segment(index) else {
            break;
        };
        let flags = segment_page_flags(segment.flags);
        let base = segment.vaddr.page_base();
        let span = segment.vaddr.page_offset() + segment.memory_size;
        let page_count = span.div_ceil(PAGE_SIZE);
        for page in 0..page_count {
            let page_va = base.add(page * PAGE_SIZE);
            let already_user = mmu
                .walk(space, page_va)
                .is_some_and(|(_, entry)| entry.contains(PageFlags::USER));
            if !already_user {
                mmu.alloc(space, page_va, flags)?;
            }
            if page_va > max_page {
                max_page = page_va;
            }
        }
        // File-backed bytes; pages past them stay zero fill.
        user::copy_to_user(mmu, space, segment.vaddr, segment.file_data)?;
    }

    // Stack directly above the image, one guard page after it.
    for page in 1..=stack_pages {
        mmu.alloc(
            space,
            max_page.add(page * PAGE_SIZE),
            PageFlags::READ | PageFlags::WRITE | PageFlags::USER,
        )?;
    }
    let stack_end = max_page.add((stack_pages + 1) * PAGE_SIZE);
    record.set_stack(VirtAddr::new(stack_end.as_u64() - 8));
    record.last_virtual_page = stack_end.add(PAGE_SIZE);

    // Argument buffer, mapped page by page at the bump pointer.
    if !args.is_empty() {
        let args_va = record.last_virtual_page;
        let arg_pages = (args.len() as u64).div_ceil(PAGE_SIZE);
        for page in 0..arg_pages {
            mmu.alloc(
                space,
                args_va.add(page * PAGE_SIZE),
                PageFlags::READ | PageFlags::WRITE | PageFlags::USER,
            )?;
        }
        user::copy_to_user(mmu, space, args_va, args)?;
        record.xs[REG_A0] = args_va.as_u64();
        record.xs[REG_A1] = args.len() as u64;
        record.last_virtual_page = args_va.add(arg_pages * PAGE_SIZE + PAGE_SIZE);
    }

    record.user = parent
        .and_then(|parent| processes.get(parent).map(|record| record.user))
        .unwrap_or(0);

    Ok(record)
}

/// Spawn a thread sharing the address space of `parent`'s leader.
///
/// The stack is carved out of the leader's bump pointer, the entry point is
/// `entry`, and `(a0, a1) = (args, args_len)` verbatim; the pointer already
/// means the right thing because the address space is shared.
pub fn spawn_thread<M: MmuDriver>(
    processes: &ProcessTable,
    ready: &ReadyQueue,
    mmu: &mut M,
    parent: Pid,
    entry: VirtAddr,
    stack_pages: u64,
    args: VirtAddr,
    args_len: u64,
) -> Result<Pid, SpawnError> {
    let leader_pid = processes
        .get(parent)
        .map(|record| record.leader())
        .ok_or(SpawnError::NoSuchParent)?;

    let pid = processes.allocate_pid().ok_or(SpawnError::PidExhausted)?;

    let mut leader = processes.get(leader_pid).ok_or(SpawnError::NoSuchParent)?;
    let space = leader.address_space;
    let stack_base = leader.last_virtual_page;
    for page in 0..stack_pages {
        mmu.alloc(
            space,
            stack_base.add(page * PAGE_SIZE),
            PageFlags::READ | PageFlags::WRITE | PageFlags::USER,
        )?;
    }
    let stack_top = stack_base.add(stack_pages * PAGE_SIZE);
    leader.last_virtual_page = stack_top.add(PAGE_SIZE);

    let mut record = Process::new(pid, leader.name.clone(), space);
    record.thread_source = Some(leader_pid);
    record.user = leader.user;
    record.pc = entry;
    record.set_stack(VirtAddr::new(stack_top.as_u64() - 8));
    record.last_virtual_page = leader.last_virtual_page;
    record.xs[REG_A0] = args.as_u64();
    record.xs[REG_A1] = args_len;
    drop(leader);

    processes.insert(record);
    ready.push(pid);
    log::info!("spawned thread {pid} of {leader_pid}");
    Ok(pid)
}

/// Pack argv-style arguments into the NUL-separated buffer the loader maps
/// for the new process.
#[must_use]
pub fn pack_args(argv: &[&[u8]]) -> Vec<u8> {
    let mut packed = Vec::new();
    for arg in argv {
        packed.extend_from_slice(arg);
        packed.push(0);
    }
    packed
}
