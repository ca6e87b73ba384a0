// src/lib.rs
//! Petrel OS - microkernel core for a 64-bit RISC target
//!
//! This crate is the process, capability-IPC, and scheduling core of a small
//! microkernel. It owns process records, the ready queue, and the capability
//! table, and it builds address-space-isolated processes from executable
//! images. Everything hardware-shaped is consumed through collaborator
//! traits: the MMU driver ([`kernel::mm::MmuDriver`]), the timer
//! ([`kernel::time::Clock`]), the console ([`kernel::syscall::Uart`]), and
//! the executable-image reader ([`kernel::image::ImageParser`]). The
//! embedding kernel binary provides those, plus the trap entry glue that
//! calls [`kernel::syscall::dispatch`] and the scheduler entry points.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![cfg_attr(test, allow(missing_docs))]

extern crate alloc;

pub mod abi;
pub mod arch;
pub mod kernel;
