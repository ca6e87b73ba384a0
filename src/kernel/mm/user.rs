// src/kernel/mm/user.rs
//! User-memory access primitives
//!
//! Kernel code must not dereference user pointers directly: the address only
//! means something inside the owning process's page table. These helpers
//! resolve a user range page by page through [`MmuDriver::walk`] and copy
//! through the kernel-virtual view of each frame, so no table switch is
//! needed to touch another process's memory.
//!
//! These primitives require the pages to be mapped, nothing more; the
//! kernel writes through its own view of the frame, so the loader can fill
//! freshly mapped execute-only text pages. Syscall handlers that hand a
//! user pointer to these functions check the USER and WRITE entry flags
//! first.

use super::{AddressSpace, MmuDriver, MmuError, VirtAddr, PAGE_SIZE};

/// Copy `bytes` into `space` at `dst`.
pub fn copy_to_user<M: MmuDriver>(
    mmu: &M,
    space: AddressSpace,
    dst: VirtAddr,
    bytes: &[u8],
) -> Result<(), MmuError> {
    let mut copied = 0usize;
    while copied < bytes.len() {
        let va = dst.add(copied as u64);
        let (frame, _) = mmu.walk(space, va).ok_or(MmuError::NotMapped)?;
        let offset = va.page_offset();
        let chunk = ((PAGE_SIZE - offset) as usize).min(bytes.len() - copied);
        let ptr = mmu.phys_to_kernel_virt(frame.add(offset));
        // Safety: walk() proved the page is mapped and phys_to_kernel_virt
        // yields a pointer to the whole frame; chunk stays inside it.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes[copied..].as_ptr(), ptr, chunk);
        }
        copied += chunk;
    }
    Ok(())
}

/// Copy `out.len()` bytes out of `space` at `src`.
pub fn copy_from_user<M: MmuDriver>(
    mmu: &M,
    space: AddressSpace,
    src: VirtAddr,
    out: &mut [u8],
) -> Result<(), MmuError> {
    let mut copied = 0usize;
    while copied < out.len() {
        let va = src.add(copied as u64);
        let (frame, _) = mmu.walk(space, va).ok_or(MmuError::NotMapped)?;
        let offset = va.page_offset();
        let chunk = ((PAGE_SIZE - offset) as usize).min(out.len() - copied);
        let ptr = mmu.phys_to_kernel_virt(frame.add(offset));
        // Safety: as in copy_to_user; the source range stays inside the frame.
        unsafe {
            core::ptr::copy_nonoverlapping(ptr, out[copied..].as_mut_ptr(), chunk);
        }
        copied += chunk;
    }
    Ok(())
}

/// Read one little-endian u64 from user memory.
pub fn read_user_u64<M: MmuDriver>(
    mmu: &M,
    space: AddressSpace,
    addr: VirtAddr,
) -> Result<u64, MmuError> {
    let mut buf = [0u8; 8];
    copy_from_user(mmu, space, addr, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Write one little-endian u64 into user memory.
pub fn write_user_u64<M: MmuDriver>(
    mmu: &M,
    space: AddressSpace,
    addr: VirtAddr,
    value: u64,
) -> Result<(), MmuError> {
    copy_to_user(mmu, space, addr, &value.to_le_bytes())
}

/// Read a NUL-terminated byte string, stopping after `max` bytes.
///
/// The terminator is not included in the result. Hitting an unmapped page
/// before the terminator fails the whole read.
pub fn read_user_cstr<M: MmuDriver>(
    mmu: &M,
    space: AddressSpace,
    addr: VirtAddr,
    max: usize,
) -> Result<alloc::vec::Vec<u8>, MmuError> {
    let mut out = alloc::vec::Vec::new();
    let mut offset = 0u64;
    while out.len() < max {
        let va = addr.add(offset);
        let (frame, _) = mmu.walk(space, va).ok_or(MmuError::NotMapped)?;
        let page_offset = va.page_offset();
        let chunk = ((PAGE_SIZE - page_offset) as usize).min(max - out.len());
        let ptr = mmu.phys_to_kernel_virt(frame.add(page_offset));
        for i in 0..chunk {
            // Safety: i < chunk keeps the read inside the mapped frame.
            let byte = unsafe { ptr.add(i).read() };
            if byte == 0 {
                return Ok(out);
            }
            out.push(byte);
        }
        offset += chunk as u64;
    }
    Ok(out)
}
