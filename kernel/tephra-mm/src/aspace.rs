//! Address-space construction.
//!
//! Builds the kernel's 4-level page tables out of system-PTE-pool pages.
//! Because every paging-structure page comes from that pool, following a
//! non-leaf entry is a pure base-offset translation — no temporary mappings,
//! no physical-memory window needed while building.
//!
//! At creation time one randomized PML4 slot is pointed back at the PML4
//! itself. The resulting [`SelfMapWindow`] makes every paging-structure page
//! addressable at a computable virtual address once the space is live; the
//! memory manager records each active frame's PTE address through it.

use crate::pt_pool::{PtPool, TablePage};
use log::debug;
use tephra_addr::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use tephra_info::layout::{SELF_MAP_FIRST_SLOT, SELF_MAP_SLOT_COUNT};
use tephra_vmem::{
    PageEntry, PageTable, SelfMapWindow, choose_self_map_slot, pd_index, pdpt_index, pml4_index,
    pt_index,
};

/// Per-level entry counts needed to map a zone, accounting for the base
/// address's misalignment within each level (an unaligned zone can need one
/// more entry per level than its size alone suggests).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TableBudget {
    /// PML4 entries → PDPT pages.
    pub pml4_entries: u64,
    /// PDPT entries → PD pages.
    pub pdpt_entries: u64,
    /// PD entries → PT pages.
    pub pd_entries: u64,
    /// PT entries (one per 4 KiB page).
    pub pt_entries: u64,
}

impl TableBudget {
    /// Upper bound on paging-structure pages a zone can consume.
    #[must_use]
    pub const fn table_pages(&self) -> u64 {
        self.pml4_entries + self.pdpt_entries + self.pd_entries
    }
}

/// Entry counts for mapping `bytes` at `base`.
#[must_use]
pub fn calculate_table_budget(base: VirtualAddress, bytes: u64) -> TableBudget {
    let count = |span: u64| ((base.as_u64() % span) + bytes).div_ceil(span);
    TableBudget {
        pml4_entries: count(1 << 39),
        pdpt_entries: count(1 << 30),
        pd_entries: count(1 << 21),
        pt_entries: count(1 << 12),
    }
}

pub struct AddressSpace {
    pml4: TablePage,
    window: SelfMapWindow,
}

impl AddressSpace {
    /// Allocate the root table and install the self-map entry at a slot
    /// chosen from `entropy`.
    pub fn create(pool: &mut PtPool, entropy: u64) -> Self {
        let pml4 = pool.alloc();
        let slot = choose_self_map_slot(SELF_MAP_FIRST_SLOT, SELF_MAP_SLOT_COUNT, entropy);
        debug!("address space root at {}, self-map slot {slot}", pml4.phys);

        // The self-map entry is a writable data mapping of the PML4 itself;
        // nothing through it may ever be executed.
        Self::table_at(pml4.virt).set(slot, PageEntry::kernel_data(pml4.phys));
        Self {
            pml4,
            window: SelfMapWindow::new(slot),
        }
    }

    #[must_use]
    pub const fn window(&self) -> SelfMapWindow {
        self.window
    }

    #[must_use]
    pub const fn pml4_phys(&self) -> PhysicalAddress {
        self.pml4.phys
    }

    /// Pre-create the top-level link for `slot`, returning the PDPT page.
    ///
    /// Zones under an already-linked slot share the same PDPT.
    pub fn ensure_top_level(&mut self, pool: &mut PtPool, slot: usize) -> VirtualAddress {
        Self::ensure_next(pool, self.pml4.virt, slot)
    }

    /// Install one 4 KiB leaf. `leaf` must be fully formed (address + flags).
    ///
    /// # Panics
    /// In debug builds, when remapping a present entry — the initial address
    /// space is built exactly once and never overlaps itself.
    pub fn map_page(&mut self, pool: &mut PtPool, va: VirtualAddress, leaf: PageEntry) {
        debug_assert!(leaf.present());
        let pdpt = Self::ensure_next(pool, self.pml4.virt, pml4_index(va));
        let pd = Self::ensure_next(pool, pdpt, pdpt_index(va));
        let pt = Self::ensure_next(pool, pd, pd_index(va));

        let table = Self::table_at(pt);
        debug_assert!(
            !table.get(pt_index(va)).present(),
            "remapping an already mapped page"
        );
        table.set(pt_index(va), leaf);
    }

    /// Map a whole zone `virt → phys`, one 4 KiB leaf per page, building
    /// intermediate tables on demand. `leaf_for` supplies the leaf entry for
    /// each physical page.
    pub fn map_zone(
        &mut self,
        pool: &mut PtPool,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        bytes: u64,
        leaf_for: impl Fn(PhysicalAddress) -> PageEntry,
    ) {
        assert!(virt.is_page_aligned() && phys.is_page_aligned());
        assert!(bytes % PAGE_SIZE == 0, "zone size must be whole pages");
        let mut offset = 0;
        while offset < bytes {
            self.map_page(pool, virt + offset, leaf_for(phys + offset));
            offset += PAGE_SIZE;
        }
    }

    /// Translate `va` by walking the tables being built.
    #[must_use]
    pub fn query(&self, pool: &PtPool, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut table_va = self.pml4.virt;
        for index in [pml4_index(va), pdpt_index(va), pd_index(va)] {
            let entry = Self::table_at(table_va).get(index);
            if !entry.present() {
                return None;
            }
            table_va = pool.phys_to_virt(entry.physical_address());
        }
        let leaf = Self::table_at(table_va).get(pt_index(va));
        leaf.present()
            .then(|| leaf.physical_address() + va.page_offset())
    }

    /// Load this space into CR3.
    ///
    /// # Safety
    /// The tables must map the executing code, stack and every live data
    /// structure at their current virtual addresses.
    pub unsafe fn activate(&self) {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: forwarded to the caller.
        unsafe {
            tephra_registers::Cr3::from_pml4_phys(self.pml4.phys).store();
        }
        #[cfg(not(target_arch = "x86_64"))]
        unreachable!("address-space activation is x86-64 only");
    }

    fn ensure_next(pool: &mut PtPool, table_va: VirtualAddress, index: usize) -> VirtualAddress {
        let table = Self::table_at(table_va);
        let entry = table.get(index);
        if entry.present() {
            debug_assert!(!entry.large_page());
            pool.phys_to_virt(entry.physical_address())
        } else {
            let page = pool.alloc();
            table.set(index, PageEntry::nonleaf(page.phys));
            page.virt
        }
    }

    /// View a pool-owned page as a table.
    ///
    /// The lifetime is detached; callers keep at most one live reference per
    /// table and the pool region outlives the address space.
    fn table_at<'a>(va: VirtualAddress) -> &'a mut PageTable {
        // SAFETY: only pool pages (zeroed at alloc, 4 KiB aligned) are ever
        // passed here.
        unsafe { &mut *va.as_mut_ptr::<PageTable>() }
    }
}
