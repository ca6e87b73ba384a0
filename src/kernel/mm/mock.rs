// src/kernel/mm/mock.rs
//! In-memory MMU used by the test suite
//!
//! Frames are heap-allocated 4 KiB boxes; tables are hash maps from page
//! base to (frame, flags). Frame boxes never move, so
//! `phys_to_kernel_virt` can hand out stable pointers.

use alloc::boxed::Box;
use alloc::vec::Vec;

use hashbrown::HashMap;

use super::{AddressSpace, MmuDriver, MmuError, PageFlags, PhysAddr, VirtAddr, PAGE_SIZE};

const FRAME_BASE: u64 = 0x8000_0000;

struct Frame {
    data: Box<[u8; PAGE_SIZE as usize]>,
}

#[derive(Default)]
struct Table {
    pages: HashMap<u64, (u64, PageFlags)>,
    kernel_mapped: bool,
}

/// Heap-backed [`MmuDriver`] for tests.
pub struct MockMmu {
    frames: HashMap<u64, Frame>,
    tables: HashMap<u64, Table>,
    next_frame: u64,
    next_table: u64,
    current: u64,
    /// Remaining alloc() calls before the mock reports memory exhaustion;
    /// `u64::MAX` means unlimited.
    pub alloc_budget: u64,
}

impl MockMmu {
    /// A mock with one live table installed as current.
    pub fn new() -> Self {
        let mut tables = HashMap::new();
        tables.insert(0, Table::default());
        Self {
            frames: HashMap::new(),
            tables,
            next_frame: FRAME_BASE,
            next_table: 1,
            current: 0,
            alloc_budget: u64::MAX,
        }
    }

    /// Number of live tables (the boot table included).
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Whether `space` still exists.
    pub fn table_alive(&self, space: AddressSpace) -> bool {
        self.tables.contains_key(&space.as_u64())
    }

    /// Pages currently mapped in `space`.
    pub fn mapped_pages(&self, space: AddressSpace) -> Vec<VirtAddr> {
        let mut pages: Vec<VirtAddr> = self.tables[&space.as_u64()]
            .pages
            .keys()
            .map(|&va| VirtAddr::new(va))
            .collect();
        pages.sort();
        pages
    }

    fn new_frame(&mut self) -> u64 {
        let phys = self.next_frame;
        self.next_frame += PAGE_SIZE;
        self.frames.insert(
            phys,
            Frame {
                data: Box::new([0u8; PAGE_SIZE as usize]),
            },
        );
        phys
    }
}

impl MmuDriver for MockMmu {
    fn create_table(&mut self) -> Result<AddressSpace, MmuError> {
        let handle = self.next_table;
        self.next_table += 1;
        self.tables.insert(handle, Table::default());
        Ok(AddressSpace::new(handle))
    }

    fn destroy_table(&mut self, space: AddressSpace) {
        if let Some(table) = self.tables.remove(&space.as_u64()) {
            for (_, (phys, _)) in table.pages {
                self.frames.remove(&phys);
            }
        }
    }

    fn identity_map_kernel(&mut self, space: AddressSpace) {
        if let Some(table) = self.tables.get_mut(&space.as_u64()) {
            table.kernel_mapped = true;
        }
    }

    fn current_table(&self) -> AddressSpace {
        AddressSpace::new(self.current)
    }

    fn set_current_table(&mut self, space: AddressSpace) {
        assert!(
            self.tables.contains_key(&space.as_u64()),
            "switch to dead table {space:?}"
        );
        self.current = space.as_u64();
    }

    fn alloc(
        &mut self,
        space: AddressSpace,
        vaddr: VirtAddr,
        flags: PageFlags,
    ) -> Result<PhysAddr, MmuError> {
        if self.alloc_budget == 0 {
            return Err(MmuError::OutOfMemory);
        }
        if self.alloc_budget != u64::MAX {
            self.alloc_budget -= 1;
        }
        let phys = self.new_frame();
        let table = self
            .tables
            .get_mut(&space.as_u64())
            .ok_or(MmuError::OutOfMemory)?;
        table.pages.insert(vaddr.page_base().as_u64(), (phys, flags));
        Ok(PhysAddr::new(phys))
    }

    fn map(
        &mut self,
        space: AddressSpace,
        vaddr: VirtAddr,
        phys: PhysAddr,
        flags: PageFlags,
    ) -> Result<(), MmuError> {
        let table = self
            .tables
            .get_mut(&space.as_u64())
            .ok_or(MmuError::OutOfMemory)?;
        table
            .pages
            .insert(vaddr.page_base().as_u64(), (phys.frame_base().as_u64(), flags));
        Ok(())
    }

    fn unmap(&mut self, space: AddressSpace, vaddr: VirtAddr) -> bool {
        self.tables
            .get_mut(&space.as_u64())
            .map(|t| t.pages.remove(&vaddr.page_base().as_u64()).is_some())
            .unwrap_or(false)
    }

    fn change_flags(&mut self, space: AddressSpace, vaddr: VirtAddr, flags: PageFlags) -> bool {
        self.tables
            .get_mut(&space.as_u64())
            .and_then(|t| t.pages.get_mut(&vaddr.page_base().as_u64()))
            .map(|entry| {
                entry.1 = flags;
                true
            })
            .unwrap_or(false)
    }

    fn walk(&self, space: AddressSpace, vaddr: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        self.tables
            .get(&space.as_u64())?
            .pages
            .get(&vaddr.page_base().as_u64())
            .map(|&(phys, flags)| (PhysAddr::new(phys), flags))
    }

    fn phys_to_kernel_virt(&self, phys: PhysAddr) -> *mut u8 {
        let frame = &self.frames[&phys.frame_base().as_u64()];
        let base = frame.data.as_ptr() as *mut u8;
        // Safety: page_offset stays within the 4 KiB frame box.
        unsafe { base.add((phys.as_u64() - phys.frame_base().as_u64()) as usize) }
    }
}
