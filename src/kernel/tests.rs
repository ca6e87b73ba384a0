// src/kernel/tests.rs
//! End-to-end scenarios across the loader, scheduler, capability table, and
//! syscall dispatch, driven the way the trap glue drives them.

use alloc::string::String;
use alloc::vec::Vec;

use crate::abi::{self, AllowedMemory};
use crate::arch::{TrapFrame, REG_A0, REG_A1};
use crate::kernel::capability::{CapabilityTable, QUEUE_CAPACITY};
use crate::kernel::image::{ImageHeader, ImageKind, OwnedSegment, ParsedImage, SegmentFlags};
use crate::kernel::loader;
use crate::kernel::mm::mock::MockMmu;
use crate::kernel::mm::{user, MmuDriver, VirtAddr};
use crate::kernel::mock::{CaptureUart, FixedImageParser, ManualClock};
use crate::kernel::process::{Pid, ProcessState, ProcessTable};
use crate::kernel::scheduler::{self, ReadyQueue};
use crate::kernel::syscall::{self, SyscallContext, SyscallOutcome};
use crate::kernel::time::Instant;

fn simple_image() -> ParsedImage {
    ParsedImage {
        header: ImageHeader {
            entry: VirtAddr::new(0x1000),
            kind: ImageKind::Executable,
        },
        segments: alloc::vec![OwnedSegment {
            vaddr: VirtAddr::new(0x1000),
            file_data: alloc::vec![0x13; 256],
            memory_size: 256,
            flags: SegmentFlags::READ | SegmentFlags::EXECUTE,
        }],
    }
}

struct Fixture {
    processes: ProcessTable,
    capabilities: CapabilityTable,
    ready: ReadyQueue,
    mmu: MockMmu,
    clock: ManualClock,
    uart: CaptureUart,
    parser: FixedImageParser,
    allowed: Vec<AllowedMemory>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            processes: ProcessTable::new(),
            capabilities: CapabilityTable::new(),
            ready: ReadyQueue::new(),
            mmu: MockMmu::new(),
            clock: ManualClock::new(Instant::ZERO),
            uart: CaptureUart::new(),
            parser: FixedImageParser::new(simple_image()),
            allowed: Vec::new(),
        }
    }

    fn spawn(&mut self, name: &str, parent: Option<Pid>, args: &[u8]) -> Pid {
        let image = simple_image();
        loader::spawn_from_image(
            &self.processes,
            &self.ready,
            &mut self.mmu,
            name,
            parent,
            &image,
            2,
            args,
        )
        .expect("spawn")
    }

    fn dispatch(&mut self, trap: &mut TrapFrame) -> SyscallOutcome {
        let mut ctx = SyscallContext {
            processes: &self.processes,
            capabilities: &self.capabilities,
            ready: &self.ready,
            mmu: &mut self.mmu,
            clock: &self.clock,
            uart: &mut self.uart,
            images: &self.parser,
            allowed_memory: &self.allowed,
        };
        syscall::dispatch(&mut ctx, trap)
    }

    fn schedule(&mut self, trap: &mut TrapFrame) {
        let next = scheduler::next_runnable(
            &self.processes,
            &self.ready,
            &self.mmu,
            &self.clock,
            trap.pid,
        );
        scheduler::switch_to(&self.processes, &self.ready, &mut self.mmu, trap, next);
    }

    /// Run one syscall from `pid`'s trap, scheduling when asked to.
    fn run_syscall(&mut self, trap: &mut TrapFrame, number: u64, args: &[u64]) -> SyscallOutcome {
        trap.xs[REG_A0] = number;
        for (index, &arg) in args.iter().enumerate() {
            trap.xs[REG_A1 + index] = arg;
        }
        self.dispatch(trap)
    }

    fn page_alloc(&mut self, trap: &mut TrapFrame, count: u64) -> VirtAddr {
        let outcome = self.run_syscall(
            trap,
            abi::SYS_PAGE_ALLOC,
            &[count, abi::PERM_READ | abi::PERM_WRITE],
        );
        assert_eq!(outcome, SyscallOutcome::Return(trap.xs[REG_A0]));
        let va = trap.xs[REG_A0];
        assert_ne!(va, 0, "page_alloc failed");
        VirtAddr::new(va)
    }
}

/// Boot init and hand it the hart through the first trap.
fn boot(fixture: &mut Fixture) -> TrapFrame {
    let init = fixture.spawn("init", None, &[]);
    assert_eq!(init, Pid::INIT);
    let mut trap = TrapFrame::new(Pid::INIT);
    scheduler::switch_to(
        &fixture.processes,
        &fixture.ready,
        &mut fixture.mmu,
        &mut trap,
        Pid::INIT,
    );
    trap
}

#[test]
fn scenario_spawn_and_run() {
    let mut fixture = Fixture::new();
    let init = fixture.spawn("init", None, b"hello");
    assert_eq!(init, Pid::INIT);

    let record = fixture.processes.get(init).unwrap();
    assert_eq!(record.xs[crate::arch::REG_SP], 0x3FF8);
    assert_eq!(record.xs[REG_A0], 0x5000);
    assert_eq!(record.xs[REG_A1], 5);
    assert_eq!(record.pc, VirtAddr::new(0x1000));
    assert_eq!(record.state, ProcessState::Wait);
    drop(record);

    // First trap dispatches init.
    let mut trap = TrapFrame::new(Pid::INIT);
    scheduler::switch_to(
        &fixture.processes,
        &fixture.ready,
        &mut fixture.mmu,
        &mut trap,
        Pid::INIT,
    );
    assert_eq!(trap.pid, Pid::INIT);
    assert_eq!(trap.pc, VirtAddr::new(0x1000));
    assert_eq!(
        fixture.processes.get(init).unwrap().state,
        ProcessState::Running
    );
}

#[test]
fn scenario_ipc_round_trip_via_syscalls() {
    let mut fixture = Fixture::new();
    boot(&mut fixture);
    let p1 = fixture.spawn("sender", None, &[]);
    let p2 = fixture.spawn("receiver", None, &[]);

    // The sender allocates scratch memory and creates a pair.
    let mut trap1 = TrapFrame::new(p1);
    let scratch = fixture.page_alloc(&mut trap1, 1);
    let outcome = fixture.run_syscall(
        &mut trap1,
        abi::SYS_CREATE_CAPABILITY,
        &[scratch.as_u64(), scratch.as_u64() + 8],
    );
    assert_eq!(outcome, SyscallOutcome::Return(abi::STATUS_OK));
    let space1 = fixture.processes.get(p1).unwrap().address_space;
    let cap_a = user::read_user_u64(&fixture.mmu, space1, scratch).unwrap();
    let cap_b = user::read_user_u64(&fixture.mmu, space1, scratch.add(8)).unwrap();
    assert_ne!(cap_a, 0);
    assert_ne!(cap_b, 0);

    // Hand the B side to the receiver, then send on A.
    assert_eq!(
        fixture.run_syscall(&mut trap1, abi::SYS_TRANSFER_CAPABILITY, &[cap_b, p2.as_u64()]),
        SyscallOutcome::Return(abi::STATUS_OK)
    );
    assert_eq!(
        fixture.run_syscall(&mut trap1, abi::SYS_SEND, &[cap_a, 7, 42, 0]),
        SyscallOutcome::Return(abi::STATUS_OK)
    );

    // The receiver pulls the message into its own memory.
    let mut trap2 = TrapFrame::new(p2);
    let inbox = fixture.page_alloc(&mut trap2, 1);
    assert_eq!(
        fixture.run_syscall(&mut trap2, abi::SYS_RECV, &[cap_b, inbox.as_u64()]),
        SyscallOutcome::Return(abi::STATUS_OK)
    );
    let space2 = fixture.processes.get(p2).unwrap().address_space;
    assert_eq!(user::read_user_u64(&fixture.mmu, space2, inbox).unwrap(), 7);
    assert_eq!(
        user::read_user_u64(&fixture.mmu, space2, inbox.add(8)).unwrap(),
        p1.as_u64()
    );
    assert_eq!(
        user::read_user_u64(&fixture.mmu, space2, inbox.add(16)).unwrap(),
        42
    );

    // Nothing else queued.
    assert_eq!(
        fixture.run_syscall(&mut trap2, abi::SYS_RECV, &[cap_b, inbox.as_u64()]),
        SyscallOutcome::Return(abi::STATUS_EMPTY)
    );
}

#[test]
fn scenario_queue_full_after_capacity_sends() {
    let mut fixture = Fixture::new();
    boot(&mut fixture);
    let p1 = fixture.spawn("sender", None, &[]);

    let mut trap1 = TrapFrame::new(p1);
    let scratch = fixture.page_alloc(&mut trap1, 1);
    fixture.run_syscall(
        &mut trap1,
        abi::SYS_CREATE_CAPABILITY,
        &[scratch.as_u64(), scratch.as_u64() + 8],
    );
    let space1 = fixture.processes.get(p1).unwrap().address_space;
    let cap_a = user::read_user_u64(&fixture.mmu, space1, scratch).unwrap();

    for i in 0..QUEUE_CAPACITY as u64 {
        assert_eq!(
            fixture.run_syscall(&mut trap1, abi::SYS_SEND, &[cap_a, 1, i, 0]),
            SyscallOutcome::Return(abi::STATUS_OK)
        );
    }
    assert_eq!(
        fixture.run_syscall(&mut trap1, abi::SYS_SEND, &[cap_a, 1, 99, 0]),
        SyscallOutcome::Return(abi::STATUS_FULL)
    );

    // The peer still drains exactly the first Q messages, in order.
    let cap_b = user::read_user_u64(&fixture.mmu, space1, scratch.add(8)).unwrap();
    for i in 0..QUEUE_CAPACITY as u64 {
        assert_eq!(
            fixture.run_syscall(&mut trap1, abi::SYS_RECV, &[cap_b, scratch.as_u64() + 16]),
            SyscallOutcome::Return(abi::STATUS_OK)
        );
        assert_eq!(
            user::read_user_u64(&fixture.mmu, space1, scratch.add(32)).unwrap(),
            i
        );
    }
}

#[test]
fn scenario_sleep_wakes_with_actual_time() {
    let mut fixture = Fixture::new();
    let mut trap = boot(&mut fixture);

    fixture.clock.set(Instant::new(0, 500));
    let outcome = fixture.run_syscall(&mut trap, abi::SYS_SLEEP, &[0, 1000]);
    assert_eq!(outcome, SyscallOutcome::Schedule);
    assert_eq!(
        fixture.processes.get(Pid::INIT).unwrap().state,
        ProcessState::Sleeping {
            until: Instant::new(0, 1500)
        }
    );

    // The next timer trap finds the wake time reached.
    fixture.clock.set(Instant::new(0, 1500));
    fixture.schedule(&mut trap);
    assert_eq!(trap.pid, Pid::INIT);
    assert_eq!(trap.xs[REG_A0], 0);
    assert_eq!(trap.xs[REG_A1], 1500);
    assert_eq!(
        fixture.processes.get(Pid::INIT).unwrap().state,
        ProcessState::Running
    );
}

#[test]
fn scenario_transfer_cannot_cross_init_line() {
    let mut fixture = Fixture::new();
    let mut trap = boot(&mut fixture);
    fixture.spawn("two", None, &[]);
    let p3 = fixture.spawn("three", None, &[]);

    // Init creates a pair and keeps both ends; handing one end to an
    // unrelated process would move an init-connected capability outside
    // init's trust line.
    let scratch = fixture.page_alloc(&mut trap, 1);
    assert_eq!(
        fixture.run_syscall(
            &mut trap,
            abi::SYS_CREATE_CAPABILITY,
            &[scratch.as_u64(), scratch.as_u64() + 8],
        ),
        SyscallOutcome::Return(abi::STATUS_OK)
    );
    let space0 = fixture.processes.get(Pid::INIT).unwrap().address_space;
    let cap = user::read_user_u64(&fixture.mmu, space0, scratch).unwrap();

    assert_eq!(
        fixture.run_syscall(&mut trap, abi::SYS_TRANSFER_CAPABILITY, &[cap, p3.as_u64()]),
        SyscallOutcome::Return(abi::STATUS_INVALID)
    );
    // The capability still answers to init.
    assert_eq!(
        fixture.run_syscall(&mut trap, abi::SYS_SEND, &[cap, 1, 1, 0]),
        SyscallOutcome::Return(abi::STATUS_OK)
    );
}

#[test]
fn scenario_exit_closes_one_side_and_schedules_on() {
    let mut fixture = Fixture::new();
    boot(&mut fixture);
    let p1 = fixture.spawn("one", None, &[]);
    let p2 = fixture.spawn("two", None, &[]);

    let (cap_a, cap_b) = fixture.capabilities.create_pair(p1, p2);

    // p2 exits on its own trap; the scheduler moves on to someone else.
    let mut trap2 = TrapFrame::new(p2);
    let outcome = fixture.run_syscall(&mut trap2, abi::SYS_EXIT, &[0]);
    assert_eq!(outcome, SyscallOutcome::Schedule);
    assert!(fixture.processes.get(p2).is_none());
    fixture.schedule(&mut trap2);
    assert_ne!(trap2.pid, p2);

    // The survivor sees "closed" on send; the dead side's endpoint is
    // unreachable.
    let mut trap1 = TrapFrame::new(p1);
    assert_eq!(
        fixture.run_syscall(&mut trap1, abi::SYS_SEND, &[cap_a.as_u64(), 1, 2, 3]),
        SyscallOutcome::Return(abi::STATUS_CLOSED)
    );
    assert!(fixture
        .capabilities
        .recv(&fixture.processes, p2, cap_b)
        .is_err());
}

#[test]
fn scenario_lock_blocks_until_store() {
    let mut fixture = Fixture::new();
    let mut trap = boot(&mut fixture);
    let p1 = fixture.spawn("locker", None, &[]);

    // Hand the hart to p1.
    fixture.schedule(&mut trap);
    assert_eq!(trap.pid, p1);

    // p1 allocates its lock word, sets it to 1, and blocks on it.
    let word = fixture.page_alloc(&mut trap, 1);
    let space1 = fixture.processes.get(p1).unwrap().address_space;
    user::write_user_u64(&fixture.mmu, space1, word, 1).unwrap();
    let outcome = fixture.run_syscall(
        &mut trap,
        abi::SYS_LOCK,
        &[word.as_u64(), abi::LOCK_WAIT_IF_EQ, 1],
    );
    assert_eq!(outcome, SyscallOutcome::Schedule);
    fixture.schedule(&mut trap);
    assert_eq!(trap.pid, Pid::INIT, "init takes over while p1 blocks");

    // With the word unchanged, p1 stays blocked across dispatches.
    fixture.schedule(&mut trap);
    assert_eq!(trap.pid, Pid::INIT);

    // Init releases the lock; the next dispatch wakes p1 with 0 in a0.
    user::write_user_u64(&fixture.mmu, space1, word, 0).unwrap();
    fixture.schedule(&mut trap);
    assert_eq!(trap.pid, p1);
    assert_eq!(trap.xs[REG_A0], 0);
}

#[test]
fn scenario_uart_puts_reaches_console() {
    let mut fixture = Fixture::new();
    let mut trap = boot(&mut fixture);

    let page = fixture.page_alloc(&mut trap, 1);
    let space = fixture.processes.get(Pid::INIT).unwrap().address_space;
    user::copy_to_user(&fixture.mmu, space, page, b"hello, petrel\0").unwrap();

    assert_eq!(
        fixture.run_syscall(&mut trap, abi::SYS_UART_PUTS, &[page.as_u64()]),
        SyscallOutcome::Return(abi::STATUS_OK)
    );
    assert_eq!(fixture.uart.take(), b"hello, petrel");
}

#[test]
fn scenario_allowed_memory_gates_mmio() {
    let mut fixture = Fixture::new();
    let mut name = [0u8; 16];
    name[..4].copy_from_slice(b"uart");
    fixture.allowed.push(AllowedMemory {
        name,
        start: 0x1000_0000,
        size: 0x1000,
    });
    let mut trap = boot(&mut fixture);

    // The listed entry is readable through the syscall.
    let out = fixture.page_alloc(&mut trap, 1);
    assert_eq!(
        fixture.run_syscall(&mut trap, abi::SYS_GET_ALLOWED_MEMORY, &[0, out.as_u64()]),
        SyscallOutcome::Return(1)
    );
    let space = fixture.processes.get(Pid::INIT).unwrap().address_space;
    let mut wire = [0u8; 32];
    user::copy_from_user(&fixture.mmu, space, out, &mut wire).unwrap();
    assert_eq!(&wire[..4], b"uart");
    assert_eq!(
        fixture.run_syscall(&mut trap, abi::SYS_GET_ALLOWED_MEMORY, &[1, out.as_u64()]),
        SyscallOutcome::Return(0)
    );

    // Mapping inside the region works, including the sub-page offset.
    let outcome = fixture.run_syscall(
        &mut trap,
        abi::SYS_MAP_PHYSICAL_MEMORY,
        &[0x1000_0010, 0x20, abi::PERM_READ | abi::PERM_WRITE],
    );
    let SyscallOutcome::Return(mapped) = outcome else {
        panic!("map_physical_memory blocked");
    };
    assert_ne!(mapped, 0);
    assert_eq!(mapped & 0xFFF, 0x10);
    let (frame, _) = fixture
        .mmu
        .walk(space, VirtAddr::new(mapped))
        .expect("mapping exists");
    assert_eq!(frame.as_u64(), 0x1000_0000);

    // Outside the region: refused.
    assert_eq!(
        fixture.run_syscall(
            &mut trap,
            abi::SYS_MAP_PHYSICAL_MEMORY,
            &[0x2000_0000, 0x10, abi::PERM_READ],
        ),
        SyscallOutcome::Return(0)
    );
}

#[test]
fn scenario_spawn_syscall_builds_child() {
    let mut fixture = Fixture::new();
    let mut trap = boot(&mut fixture);

    // Stage image bytes, a name, and one argv entry in init's memory.
    let page = fixture.page_alloc(&mut trap, 1);
    let space = fixture.processes.get(Pid::INIT).unwrap().address_space;
    user::copy_to_user(&fixture.mmu, space, page, &[0x7F; 64]).unwrap();
    let name_ptr = page.add(0x100);
    user::copy_to_user(&fixture.mmu, space, name_ptr, b"child\0").unwrap();
    let arg_ptr = page.add(0x200);
    user::copy_to_user(&fixture.mmu, space, arg_ptr, b"-v\0").unwrap();
    let argv_ptr = page.add(0x300);
    user::write_user_u64(&fixture.mmu, space, argv_ptr, arg_ptr.as_u64()).unwrap();

    let outcome = fixture.run_syscall(
        &mut trap,
        abi::SYS_SPAWN,
        &[page.as_u64(), 64, name_ptr.as_u64(), 1, argv_ptr.as_u64()],
    );
    let SyscallOutcome::Return(pid) = outcome else {
        panic!("spawn blocked");
    };
    assert_ne!(pid, abi::PID_INVALID);

    let child = fixture.processes.get(Pid::new(pid)).unwrap();
    assert_eq!(child.name, String::from("child"));
    assert_eq!(child.state, ProcessState::Wait);
    // The packed argv arrived in the child's own address space.
    let child_space = child.address_space;
    let args_va = VirtAddr::new(child.xs[REG_A0]);
    let args_len = child.xs[REG_A1];
    drop(child);
    assert_eq!(args_len, 3);
    let mut packed = [0u8; 3];
    user::copy_from_user(&fixture.mmu, child_space, args_va, &mut packed).unwrap();
    assert_eq!(&packed, b"-v\0");
}

#[test]
fn scenario_spawn_thread_syscall() {
    let mut fixture = Fixture::new();
    let mut trap = boot(&mut fixture);

    let outcome = fixture.run_syscall(&mut trap, abi::SYS_SPAWN_THREAD, &[0x1040, 0xBEEF]);
    let SyscallOutcome::Return(pid) = outcome else {
        panic!("spawn_thread blocked");
    };
    assert_ne!(pid, abi::PID_INVALID);

    let thread = fixture.processes.get(Pid::new(pid)).unwrap();
    assert_eq!(thread.thread_source, Some(Pid::INIT));
    assert_eq!(thread.pc, VirtAddr::new(0x1040));
    assert_eq!(thread.xs[REG_A0], 0xBEEF);
}

#[test]
fn scenario_unknown_syscall_rejected() {
    let mut fixture = Fixture::new();
    let mut trap = boot(&mut fixture);
    assert_eq!(
        fixture.run_syscall(&mut trap, 999, &[]),
        SyscallOutcome::Return(abi::STATUS_INVALID)
    );
}

#[test]
fn ready_queue_holds_no_dead_pids_after_sweep() {
    let mut fixture = Fixture::new();
    boot(&mut fixture);
    let p1 = fixture.spawn("one", None, &[]);
    let p2 = fixture.spawn("two", None, &[]);

    // Kill p1 while it is still queued, then sweep.
    let mut trap1 = TrapFrame::new(p1);
    fixture.run_syscall(&mut trap1, abi::SYS_EXIT, &[0]);

    let mut trap = TrapFrame::new(Pid::INIT);
    fixture.schedule(&mut trap);
    assert_eq!(trap.pid, p2);

    // After one full sweep the dead PID is gone from the queue.
    let mut remaining = Vec::new();
    while let Some(pid) = fixture.ready.pop() {
        remaining.push(pid);
    }
    assert!(!remaining.contains(&p1));
}
