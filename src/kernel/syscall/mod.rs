// src/kernel/syscall/mod.rs
//! System call dispatch and handlers
//!
//! The trap glue decodes a syscall trap into a [`TrapFrame`] (call number in
//! a0, arguments in a1..a6, pc already advanced past the trap instruction)
//! and calls [`dispatch`]. The result tells the glue what to do next:
//!
//! - [`SyscallOutcome::Return`]: the return value is already in the frame's
//!   a0; resume the caller.
//! - [`SyscallOutcome::Schedule`]: the caller blocked or died; pick the
//!   next runnable process and switch to it.
//!
//! Every user-supplied pointer is resolved through the caller's own page
//! table with the `mm::user` primitives, and every length is capped before
//! any copy. Failures come back as the status codes in [`crate::abi`]; no
//! handler panics on user input.

use alloc::string::String;
use alloc::vec::Vec;

use super::capability::{Capability, CapabilityTable, Message};
use super::image::ImageParser;
use super::loader;
use super::mm::{user, MmuDriver, PageFlags, PhysAddr, VirtAddr, PAGE_SIZE};
use super::process::{lifecycle, LockKind, Pid, ProcessState, ProcessTable};
use super::scheduler::ReadyQueue;
use super::time::Clock;
use crate::abi::{self, AllowedMemory};
use crate::arch::TrapFrame;

/// Stack size for processes and threads created through syscalls.
pub const USER_STACK_PAGES: u64 = 8;

/// Longest string `uart_puts` will print in one call.
const MAX_PUTS_BYTES: usize = 4096;
/// Largest image `spawn` accepts.
const MAX_IMAGE_BYTES: usize = 16 * 1024 * 1024;
/// Longest process name.
const MAX_NAME_BYTES: usize = 256;
/// Most argv entries `spawn` will read.
const MAX_ARGC: u64 = 64;
/// Longest single argv entry.
const MAX_ARG_BYTES: usize = 4096;

/// UART console collaborator.
pub trait Uart {
    /// Write raw bytes to the console.
    fn write_bytes(&mut self, bytes: &[u8]);
}

/// Everything a syscall handler may touch.
pub struct SyscallContext<'a, M: MmuDriver, C: Clock, U: Uart, P: ImageParser> {
    /// Process table.
    pub processes: &'a ProcessTable,
    /// Capability table.
    pub capabilities: &'a CapabilityTable,
    /// Scheduler ready queue.
    pub ready: &'a ReadyQueue,
    /// Platform MMU.
    pub mmu: &'a mut M,
    /// Platform timer.
    pub clock: &'a C,
    /// Console sink.
    pub uart: &'a mut U,
    /// Image-format reader.
    pub images: &'a P,
    /// Device regions user processes may map.
    pub allowed_memory: &'a [AllowedMemory],
}

/// What the trap glue should do after a syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Resume the caller; its a0 holds this value.
    Return(u64),
    /// The caller blocked or exited; run the scheduler.
    Schedule,
}

/// Decode and run one system call.
pub fn dispatch<M: MmuDriver, C: Clock, U: Uart, P: ImageParser>(
    ctx: &mut SyscallContext<'_, M, C, U, P>,
    trap: &mut TrapFrame,
) -> SyscallOutcome {
    let number = trap.syscall_number();
    let caller = trap.pid;
    let args = [
        trap.syscall_arg(0),
        trap.syscall_arg(1),
        trap.syscall_arg(2),
        trap.syscall_arg(3),
        trap.syscall_arg(4),
    ];

    let outcome = match number {
        abi::SYS_UART_PUTS => sys_uart_puts(ctx, caller, args[0]),
        abi::SYS_PAGE_ALLOC => sys_page_alloc(ctx, caller, args[0], args[1]),
        abi::SYS_PAGE_PERMS => sys_page_perms(ctx, caller, args[0], args[1], args[2]),
        abi::SYS_PAGE_DEALLOC => sys_page_dealloc(ctx, caller, args[0], args[1]),
        abi::SYS_SLEEP => sys_sleep(ctx, trap, args[0], args[1]),
        abi::SYS_SPAWN => sys_spawn(ctx, caller, args[0], args[1], args[2], args[3], args[4]),
        abi::SYS_SPAWN_THREAD => sys_spawn_thread(ctx, caller, args[0], args[1]),
        abi::SYS_EXIT => sys_exit(ctx, caller, args[0]),
        abi::SYS_GET_ALLOWED_MEMORY => sys_get_allowed_memory(ctx, caller, args[0], args[1]),
        abi::SYS_MAP_PHYSICAL_MEMORY => {
            sys_map_physical_memory(ctx, caller, args[0], args[1], args[2])
        }
        abi::SYS_SET_FAULT_HANDLER => sys_set_fault_handler(ctx, caller, args[0]),
        abi::SYS_LOCK => sys_lock(ctx, trap, args[0], args[1], args[2]),
        abi::SYS_CREATE_CAPABILITY => sys_create_capability(ctx, caller, args[0], args[1]),
        abi::SYS_CLONE_CAPABILITY => sys_clone_capability(ctx, caller, args[0], args[1]),
        abi::SYS_TRANSFER_CAPABILITY => sys_transfer_capability(ctx, caller, args[0], args[1]),
        abi::SYS_SEND => sys_send(ctx, caller, args[0], args[1], args[2], args[3]),
        abi::SYS_RECV => sys_recv(ctx, caller, args[0], args[1]),
        _ => {
            log::warn!("process {caller}: unknown syscall {number}");
            SyscallOutcome::Return(abi::STATUS_INVALID)
        }
    };

    if let SyscallOutcome::Return(value) = outcome {
        trap.set_return(value);
    }
    outcome
}

/// Address space of the caller, if it still exists.
fn caller_space<M: MmuDriver, C: Clock, U: Uart, P: ImageParser>(
    ctx: &SyscallContext<'_, M, C, U, P>,
    caller: Pid,
) -> Option<super::mm::AddressSpace> {
    ctx.processes
        .get(caller)
        .map(|record| record.address_space)
}

/// Save the live frame into the caller's record and move it to `state`.
/// Blocked records are authoritative: the scheduler writes wake-up values
/// into them and the switch path reloads them.
fn block_current(processes: &ProcessTable, trap: &TrapFrame, state: ProcessState) {
    if let Some(mut record) = processes.get(trap.pid) {
        record.pc = trap.pc;
        record.xs = trap.xs;
        record.fs = trap.fs;
        record.state = state;
    }
}

/// Every page of `[addr, addr + len)` is mapped with the given flags.
fn user_range_has<M: MmuDriver>(
    mmu: &M,
    space: super::mm::AddressSpace,
    addr: VirtAddr,
    len: u64,
    required: PageFlags,
) -> bool {
    if len == 0 {
        return true;
    }
    let mut page = addr.page_base();
    let end = addr.add(len - 1).page_base();
    loop {
        match mmu.walk(space, page) {
            Some((_, flags)) if flags.contains(required) => {}
            _ => return false,
        }
        if page == end {
            return true;
        }
        page = page.add(PAGE_SIZE);
    }
}

fn sys_uart_puts<M: MmuDriver, C: Clock, U: Uart, P: ImageParser>(
    ctx: &mut SyscallContext<'_, M, C, U, P>,
    caller: Pid,
    ptr: u64,
) -> SyscallOutcome {
    let Some(space) = caller_space(ctx, caller) else {
        return SyscallOutcome::Return(abi::STATUS_INVALID);
    };
    match user::read_user_cstr(ctx.mmu, space, VirtAddr::new(ptr), MAX_PUTS_BYTES) {
        Ok(bytes) => {
            ctx.uart.write_bytes(&bytes);
            SyscallOutcome::Return(abi::STATUS_OK)
        }
        Err(err) => {
            log::debug!("uart_puts from {caller}: {err}");
            SyscallOutcome::Return(abi::STATUS_INVALID)
        }
    }
}

fn sys_page_alloc<M: MmuDriver, C: Clock, U: Uart, P: ImageParser>(
    ctx: &mut SyscallContext<'_, M, C, U, P>,
    caller: Pid,
    count: u64,
    perms: u64,
) -> SyscallOutcome {
    if count == 0 {
        return SyscallOutcome::Return(0);
    }
    let Some(mut record) = ctx.processes.get(caller) else {
        return SyscallOutcome::Return(0);
    };
    let space = record.address_space;
    let base = record.last_virtual_page;
    let flags = PageFlags::from_abi(perms);
    for page in 0..count {
        if ctx.mmu.alloc(space, base.add(page * PAGE_SIZE), flags).is_err() {
            for allocated in 0..page {
                ctx.mmu.unmap(space, base.add(allocated * PAGE_SIZE));
            }
            return SyscallOutcome::Return(0);
        }
    }
    record.last_virtual_page = base.add(count * PAGE_SIZE + PAGE_SIZE);
    SyscallOutcome::Return(base.as_u64())
}

fn sys_page_perms<M: MmuDriver, C: Clock, U: Uart, P: ImageParser>(
    ctx: &mut SyscallContext<'_, M, C, U, P>,
    caller: Pid,
    vaddr: u64,
    count: u64,
    perms: u64,
) -> SyscallOutcome {
    let Some(space) = caller_space(ctx, caller) else {
        return SyscallOutcome::Return(1);
    };
    let base = VirtAddr::new(vaddr).page_base();
    let flags = PageFlags::from_abi(perms);
    // Only user-owned pages may be retagged; refuse if any page of the run
    // is missing or not user memory.
    for page in 0..count {
        let va = base.add(page * PAGE_SIZE);
        match ctx.mmu.walk(space, va) {
            Some((_, entry)) if entry.contains(PageFlags::USER) => {}
            _ => return SyscallOutcome::Return(1),
        }
    }
    for page in 0..count {
        ctx.mmu.change_flags(space, base.add(page * PAGE_SIZE), flags);
    }
    SyscallOutcome::Return(0)
}

fn sys_page_dealloc<M: MmuDriver, C: Clock, U: Uart, P: ImageParser>(
    ctx: &mut SyscallContext<'_, M, C, U, P>,
    caller: Pid,
    vaddr: u64,
    count: u64,
) -> SyscallOutcome {
    let Some(space) = caller_space(ctx, caller) else {
        return SyscallOutcome::Return(1);
    };
    let base = VirtAddr::new(vaddr).page_base();
    for page in 0..count {
        let va = base.add(page * PAGE_SIZE);
        match ctx.mmu.walk(space, va) {
            Some((_, entry)) if entry.contains(PageFlags::USER) => {}
            _ => return SyscallOutcome::Return(1),
        }
    }
    for page in 0..count {
        ctx.mmu.unmap(space, base.add(page * PAGE_SIZE));
    }
    SyscallOutcome::Return(0)
}

fn sys_sleep<M: MmuDriver, C: Clock, U: Uart, P: ImageParser>(
    ctx: &mut SyscallContext<'_, M, C, U, P>,
    trap: &TrapFrame,
    seconds: u64,
    micros: u64,
) -> SyscallOutcome {
    let until = ctx.clock.now().after(seconds, micros);
    block_current(ctx.processes, trap, ProcessState::Sleeping { until });
    SyscallOutcome::Schedule
}

fn sys_spawn<M: MmuDriver, C: Clock, U: Uart, P: ImageParser>(
    ctx: &mut SyscallContext<'_, M, C, U, P>,
    caller: Pid,
    image_ptr: u64,
    image_len: u64,
    name_ptr: u64,
    argc: u64,
    argv_ptr: u64,
) -> SyscallOutcome {
    let Some(space) = caller_space(ctx, caller) else {
        return SyscallOutcome::Return(abi::PID_INVALID);
    };
    if image_len == 0 || image_len as usize > MAX_IMAGE_BYTES {
        return SyscallOutcome::Return(abi::PID_INVALID);
    }

    let mut image_bytes = alloc::vec![0u8; image_len as usize];
    if user::copy_from_user(ctx.mmu, space, VirtAddr::new(image_ptr), &mut image_bytes).is_err() {
        return SyscallOutcome::Return(abi::PID_INVALID);
    }

    let name_bytes =
        match user::read_user_cstr(ctx.mmu, space, VirtAddr::new(name_ptr), MAX_NAME_BYTES) {
            Ok(bytes) => bytes,
            Err(_) => return SyscallOutcome::Return(abi::PID_INVALID),
        };
    let name = String::from_utf8_lossy(&name_bytes).into_owned();

    // argv strings are packed NUL-separated; the child gets the buffer's
    // address and length in a0/a1.
    let mut packed_args: Vec<u8> = Vec::new();
    for index in 0..argc.min(MAX_ARGC) {
        let slot = VirtAddr::new(argv_ptr).add(index * 8);
        let Ok(arg_ptr) = user::read_user_u64(ctx.mmu, space, slot) else {
            return SyscallOutcome::Return(abi::PID_INVALID);
        };
        let Ok(arg) =
            user::read_user_cstr(ctx.mmu, space, VirtAddr::new(arg_ptr), MAX_ARG_BYTES)
        else {
            return SyscallOutcome::Return(abi::PID_INVALID);
        };
        packed_args.extend_from_slice(&arg);
        packed_args.push(0);
    }

    let parsed = match ctx.images.parse(&image_bytes) {
        Ok(parsed) => parsed,
        Err(err) => {
            log::debug!("spawn from {caller}: {err}");
            return SyscallOutcome::Return(abi::PID_INVALID);
        }
    };

    match loader::spawn_from_image(
        ctx.processes,
        ctx.ready,
        ctx.mmu,
        &name,
        Some(caller),
        &parsed,
        USER_STACK_PAGES,
        &packed_args,
    ) {
        Ok(pid) => SyscallOutcome::Return(pid.as_u64()),
        Err(_) => SyscallOutcome::Return(abi::PID_INVALID),
    }
}

fn sys_spawn_thread<M: MmuDriver, C: Clock, U: Uart, P: ImageParser>(
    ctx: &mut SyscallContext<'_, M, C, U, P>,
    caller: Pid,
    entry: u64,
    data: u64,
) -> SyscallOutcome {
    match loader::spawn_thread(
        ctx.processes,
        ctx.ready,
        ctx.mmu,
        caller,
        VirtAddr::new(entry),
        USER_STACK_PAGES,
        VirtAddr::new(data),
        0,
    ) {
        Ok(pid) => SyscallOutcome::Return(pid.as_u64()),
        Err(_) => SyscallOutcome::Return(abi::PID_INVALID),
    }
}

fn sys_exit<M: MmuDriver, C: Clock, U: Uart, P: ImageParser>(
    ctx: &mut SyscallContext<'_, M, C, U, P>,
    caller: Pid,
    code: u64,
) -> SyscallOutcome {
    log::info!("process {caller} exited with code {}", code as i64);
    lifecycle::kill(ctx.processes, ctx.capabilities, ctx.mmu, caller);
    SyscallOutcome::Schedule
}

fn sys_get_allowed_memory<M: MmuDriver, C: Clock, U: Uart, P: ImageParser>(
    ctx: &mut SyscallContext<'_, M, C, U, P>,
    caller: Pid,
    index: u64,
    out_ptr: u64,
) -> SyscallOutcome {
    let Some(space) = caller_space(ctx, caller) else {
        return SyscallOutcome::Return(0);
    };
    let Some(entry) = ctx.allowed_memory.get(index as usize) else {
        return SyscallOutcome::Return(0);
    };
    match user::copy_to_user(ctx.mmu, space, VirtAddr::new(out_ptr), &entry.to_wire()) {
        Ok(()) => SyscallOutcome::Return(1),
        Err(_) => SyscallOutcome::Return(0),
    }
}

fn sys_map_physical_memory<M: MmuDriver, C: Clock, U: Uart, P: ImageParser>(
    ctx: &mut SyscallContext<'_, M, C, U, P>,
    caller: Pid,
    phys: u64,
    size: u64,
    perms: u64,
) -> SyscallOutcome {
    if size == 0 {
        return SyscallOutcome::Return(0);
    }
    if !ctx
        .allowed_memory
        .iter()
        .any(|region| region.covers(phys, size))
    {
        log::warn!("process {caller}: refused mmio map {phys:#x}+{size:#x}");
        return SyscallOutcome::Return(0);
    }
    let Some(mut record) = ctx.processes.get(caller) else {
        return SyscallOutcome::Return(0);
    };
    let space = record.address_space;
    let frame = PhysAddr::new(phys).frame_base();
    let offset = phys - frame.as_u64();
    let pages = (offset + size).div_ceil(PAGE_SIZE);
    let base = record.last_virtual_page;
    let flags = PageFlags::from_abi(perms);
    for page in 0..pages {
        if ctx
            .mmu
            .map(
                space,
                base.add(page * PAGE_SIZE),
                frame.add(page * PAGE_SIZE),
                flags,
            )
            .is_err()
        {
            for mapped in 0..page {
                ctx.mmu.unmap(space, base.add(mapped * PAGE_SIZE));
            }
            return SyscallOutcome::Return(0);
        }
    }
    record.last_virtual_page = base.add(pages * PAGE_SIZE + PAGE_SIZE);
    SyscallOutcome::Return(base.as_u64() + offset)
}

fn sys_set_fault_handler<M: MmuDriver, C: Clock, U: Uart, P: ImageParser>(
    ctx: &mut SyscallContext<'_, M, C, U, P>,
    caller: Pid,
    handler: u64,
) -> SyscallOutcome {
    let Some(mut record) = ctx.processes.get(caller) else {
        return SyscallOutcome::Return(abi::STATUS_INVALID);
    };
    record.fault_handler = if handler == 0 {
        None
    } else {
        Some(VirtAddr::new(handler))
    };
    SyscallOutcome::Return(abi::STATUS_OK)
}

fn sys_lock<M: MmuDriver, C: Clock, U: Uart, P: ImageParser>(
    ctx: &mut SyscallContext<'_, M, C, U, P>,
    trap: &TrapFrame,
    ref_ptr: u64,
    kind: u64,
    value: u64,
) -> SyscallOutcome {
    let Some(kind) = LockKind::from_abi(kind) else {
        return SyscallOutcome::Return(abi::STATUS_INVALID);
    };
    block_current(
        ctx.processes,
        trap,
        ProcessState::WaitingLock {
            lock_ref: VirtAddr::new(ref_ptr),
            kind,
            value,
        },
    );
    SyscallOutcome::Schedule
}

fn sys_create_capability<M: MmuDriver, C: Clock, U: Uart, P: ImageParser>(
    ctx: &mut SyscallContext<'_, M, C, U, P>,
    caller: Pid,
    out_a: u64,
    out_b: u64,
) -> SyscallOutcome {
    let Some(space) = caller_space(ctx, caller) else {
        return SyscallOutcome::Return(abi::STATUS_INVALID);
    };
    let writable = PageFlags::USER | PageFlags::WRITE;
    if !user_range_has(ctx.mmu, space, VirtAddr::new(out_a), 8, writable)
        || !user_range_has(ctx.mmu, space, VirtAddr::new(out_b), 8, writable)
    {
        return SyscallOutcome::Return(abi::STATUS_INVALID);
    }
    let (token_a, token_b) = ctx.capabilities.create_pair(caller, caller);
    if user::write_user_u64(ctx.mmu, space, VirtAddr::new(out_a), token_a.as_u64()).is_err()
        || user::write_user_u64(ctx.mmu, space, VirtAddr::new(out_b), token_b.as_u64()).is_err()
    {
        return SyscallOutcome::Return(abi::STATUS_INVALID);
    }
    SyscallOutcome::Return(abi::STATUS_OK)
}

fn sys_clone_capability<M: MmuDriver, C: Clock, U: Uart, P: ImageParser>(
    ctx: &mut SyscallContext<'_, M, C, U, P>,
    caller: Pid,
    cap: u64,
    out_ptr: u64,
) -> SyscallOutcome {
    let Some(space) = caller_space(ctx, caller) else {
        return SyscallOutcome::Return(abi::STATUS_INVALID);
    };
    let writable = PageFlags::USER | PageFlags::WRITE;
    if !user_range_has(ctx.mmu, space, VirtAddr::new(out_ptr), 8, writable) {
        return SyscallOutcome::Return(abi::STATUS_INVALID);
    }
    match ctx
        .capabilities
        .clone_endpoint(ctx.processes, caller, Capability::new(cap))
    {
        Ok(token) => {
            if user::write_user_u64(ctx.mmu, space, VirtAddr::new(out_ptr), token.as_u64())
                .is_err()
            {
                return SyscallOutcome::Return(abi::STATUS_INVALID);
            }
            SyscallOutcome::Return(abi::STATUS_OK)
        }
        Err(_) => SyscallOutcome::Return(abi::STATUS_INVALID),
    }
}

fn sys_transfer_capability<M: MmuDriver, C: Clock, U: Uart, P: ImageParser>(
    ctx: &mut SyscallContext<'_, M, C, U, P>,
    caller: Pid,
    cap: u64,
    new_owner: u64,
) -> SyscallOutcome {
    use super::capability::table::TransferError;

    match ctx.capabilities.transfer(
        ctx.processes,
        Capability::new(cap),
        caller,
        Pid::new(new_owner),
    ) {
        Ok(()) => SyscallOutcome::Return(abi::STATUS_OK),
        Err(TransferError::Invalid) => SyscallOutcome::Return(abi::STATUS_INVALID),
        Err(TransferError::NoSuchOwner) => SyscallOutcome::Return(abi::STATUS_NO_OWNER),
    }
}

fn sys_send<M: MmuDriver, C: Clock, U: Uart, P: ImageParser>(
    ctx: &mut SyscallContext<'_, M, C, U, P>,
    caller: Pid,
    cap: u64,
    kind: u64,
    data: u64,
    metadata: u64,
) -> SyscallOutcome {
    use super::capability::table::SendError;

    let message = Message {
        kind: kind as u32,
        source: caller.as_u64(),
        data,
        metadata,
    };
    match ctx
        .capabilities
        .send(ctx.processes, caller, Capability::new(cap), message)
    {
        Ok(()) => SyscallOutcome::Return(abi::STATUS_OK),
        Err(SendError::Invalid) => SyscallOutcome::Return(abi::STATUS_INVALID),
        Err(SendError::Full) => SyscallOutcome::Return(abi::STATUS_FULL),
        Err(SendError::Closed) => SyscallOutcome::Return(abi::STATUS_CLOSED),
    }
}

fn sys_recv<M: MmuDriver, C: Clock, U: Uart, P: ImageParser>(
    ctx: &mut SyscallContext<'_, M, C, U, P>,
    caller: Pid,
    cap: u64,
    out_ptr: u64,
) -> SyscallOutcome {
    use super::capability::table::RecvError;

    let Some(space) = caller_space(ctx, caller) else {
        return SyscallOutcome::Return(abi::STATUS_INVALID);
    };
    let writable = PageFlags::USER | PageFlags::WRITE;
    if !user_range_has(
        ctx.mmu,
        space,
        VirtAddr::new(out_ptr),
        Message::WIRE_SIZE as u64,
        writable,
    ) {
        return SyscallOutcome::Return(abi::STATUS_INVALID);
    }
    match ctx
        .capabilities
        .recv(ctx.processes, caller, Capability::new(cap))
    {
        Ok(message) => {
            if user::copy_to_user(ctx.mmu, space, VirtAddr::new(out_ptr), &message.to_wire())
                .is_err()
            {
                return SyscallOutcome::Return(abi::STATUS_INVALID);
            }
            SyscallOutcome::Return(abi::STATUS_OK)
        }
        Err(RecvError::Invalid) => SyscallOutcome::Return(abi::STATUS_INVALID),
        Err(RecvError::Empty) => SyscallOutcome::Return(abi::STATUS_EMPTY),
        Err(RecvError::Closed) => SyscallOutcome::Return(abi::STATUS_CLOSED),
    }
}
