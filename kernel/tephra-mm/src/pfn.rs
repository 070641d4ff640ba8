//! The PFN database: one metadata entry per physical page frame.
//!
//! Populated once from the firmware memory map, then mutated by the page
//! allocator (run markers) and the ROM window code for the kernel's whole
//! lifetime. All linkage is by frame index — the entry array is the arena,
//! and an index either names a valid entry or is `None`; there are no
//! interior pointers to dangle.

use crate::layout::KernelLayout;
use bitflags::bitflags;
use core::ptr::NonNull;
use tephra_addr::{Pfn, PhysicalAddress, VirtualAddress};
use tephra_info::{MemoryDescriptor, MemoryType};

bitflags! {
    /// Run-boundary markers maintained by the page-granular allocator.
    ///
    /// Once a run is handed out, these two bits are the *only* record of its
    /// length: the first page carries `START_OF_RUN`, the last `END_OF_RUN`,
    /// and nothing in between carries either.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct PfnFlags: u8 {
        const START_OF_RUN = 1 << 0;
        const END_OF_RUN = 1 << 1;
    }
}

/// What a frame is currently used for.
///
/// Matches the global list the frame is linked into, or `Active` when the
/// frame is mapped and on no list. `Unused` frames were never described by
/// the firmware map and are never touched.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum PageState {
    #[default]
    Unused,
    Zeroed,
    Free,
    Bad,
    Rom,
    Active,
}

/// List membership and reference counting are mutually exclusive, so the
/// entry stores one or the other — never a reinterpretation of the same
/// word.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PfnUsage {
    /// Linked into the global list matching the entry's state.
    Listed { flink: Option<u32>, blink: Option<u32> },
    /// Held by a mapping; counts users.
    Shared { count: u64 },
}

/// Per-frame metadata.
#[derive(Clone, Debug)]
pub struct PfnEntry {
    pub state: PageState,
    pub usage: PfnUsage,
    pub flags: PfnFlags,
    /// Free-run length; meaningful only at a run head.
    pub run_pages: u32,
    /// Index of the run head for every page inside a free run.
    pub run_owner: Option<u32>,
    /// Bucket-list linkage; meaningful only at a run head.
    pub run_flink: Option<u32>,
    pub run_blink: Option<u32>,
    /// Virtual address of the leaf PTE mapping this frame (Active frames).
    pub pte_addr: VirtualAddress,
    /// Virtual address this frame is visible at through the ROM window.
    pub mapped_at: VirtualAddress,
}

impl PfnEntry {
    #[must_use]
    pub const fn unused() -> Self {
        Self {
            state: PageState::Unused,
            usage: PfnUsage::Shared { count: 0 },
            flags: PfnFlags::empty(),
            run_pages: 0,
            run_owner: None,
            run_flink: None,
            run_blink: None,
            pte_addr: VirtualAddress::zero(),
            mapped_at: VirtualAddress::zero(),
        }
    }
}

/// A global frame list: zeroed, free, bad or ROM frames.
#[derive(Copy, Clone, Debug, Default)]
pub struct PfnList {
    pub total: u64,
    pub head: Option<u32>,
    pub tail: Option<u32>,
}

pub struct PfnDatabase {
    entries: NonNull<PfnEntry>,
    len: usize,
    pub zeroed: PfnList,
    pub free: PfnList,
    pub bad: PfnList,
    pub rom: PfnList,
}

// Safety: exclusive ownership of the entry array; serialized by the manager
// lock.
unsafe impl Send for PfnDatabase {}

impl PfnDatabase {
    /// Adopt `len` entries of storage and reset every one to `Unused`.
    ///
    /// # Safety
    /// `entries` must point to `len` writable `PfnEntry` slots that outlive
    /// the database and are not aliased elsewhere.
    pub unsafe fn from_raw(entries: NonNull<PfnEntry>, len: usize) -> Self {
        for i in 0..len {
            // SAFETY: per contract, slot `i` is valid and exclusively ours.
            unsafe {
                entries.as_ptr().add(i).write(PfnEntry::unused());
            }
        }
        Self {
            entries,
            len,
            zeroed: PfnList::default(),
            free: PfnList::default(),
            bad: PfnList::default(),
            rom: PfnList::default(),
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn entry(&self, pfn: u32) -> &PfnEntry {
        assert!((pfn as usize) < self.len, "frame number outside the database");
        // SAFETY: bounds checked; storage valid per `from_raw` contract.
        unsafe { &*self.entries.as_ptr().add(pfn as usize) }
    }

    #[must_use]
    pub fn entry_mut(&mut self, pfn: u32) -> &mut PfnEntry {
        assert!((pfn as usize) < self.len, "frame number outside the database");
        // SAFETY: bounds checked; `&mut self` guarantees uniqueness.
        unsafe { &mut *self.entries.as_ptr().add(pfn as usize) }
    }

    fn list_mut(&mut self, state: PageState) -> &mut PfnList {
        match state {
            PageState::Zeroed => &mut self.zeroed,
            PageState::Free => &mut self.free,
            PageState::Bad => &mut self.bad,
            PageState::Rom => &mut self.rom,
            PageState::Unused | PageState::Active => {
                panic!("state {state:?} has no global frame list")
            }
        }
    }

    /// Set `pfn`'s state and append it to the matching list's tail.
    pub fn link_tail(&mut self, state: PageState, pfn: u32) {
        let old_tail = self.list_mut(state).tail;
        {
            let entry = self.entry_mut(pfn);
            assert!(
                !matches!(entry.usage, PfnUsage::Listed { .. }),
                "frame {pfn} is already on a list"
            );
            entry.state = state;
            entry.usage = PfnUsage::Listed {
                flink: None,
                blink: old_tail,
            };
        }
        if let Some(tail) = old_tail {
            match &mut self.entry_mut(tail).usage {
                PfnUsage::Listed { flink, .. } => *flink = Some(pfn),
                PfnUsage::Shared { .. } => panic!("list tail {tail} is not linked"),
            }
        }
        let list = self.list_mut(state);
        if list.head.is_none() {
            list.head = Some(pfn);
        }
        list.tail = Some(pfn);
        list.total += 1;
    }

    /// Mark `pfn` active (mapped): off every list, one reference, with the
    /// virtual address of the PTE that maps it.
    pub fn make_active(&mut self, pfn: u32, pte_addr: VirtualAddress) {
        let entry = self.entry_mut(pfn);
        assert!(
            !matches!(entry.usage, PfnUsage::Listed { .. }),
            "frame {pfn} still linked while becoming active"
        );
        entry.state = PageState::Active;
        entry.usage = PfnUsage::Shared { count: 1 };
        entry.pte_addr = pte_addr;
    }

    /// Walk a global list front to back.
    pub fn list_iter(&self, list: &PfnList) -> PfnListIter<'_> {
        PfnListIter {
            db: self,
            next: list.head,
        }
    }

    /// Populate from the firmware memory map (the one-shot `pfn_init`).
    ///
    /// Descriptor types map to frame states as follows:
    /// loader/boot-services memory becomes `Free` (reclaimable);
    /// conventional and persistent memory becomes `Active` inside the
    /// already-allocated kernel space (recording its PTE address) and `Free`
    /// elsewhere; ACPI-reclaim and ACPI-NVS frames become `Rom` so the
    /// tables they hold stay reachable; everything else is left untouched.
    pub fn init_from_map<'a>(
        &mut self,
        descriptors: impl Iterator<Item = &'a MemoryDescriptor>,
        layout: &KernelLayout,
        pte_va_of: impl Fn(PhysicalAddress) -> VirtualAddress,
    ) {
        for desc in descriptors {
            for page in 0..desc.page_count {
                let pa = PhysicalAddress::new(desc.phys_start + page * tephra_addr::PAGE_SIZE);
                let pfn = Pfn::of(pa).as_u64();
                if pfn >= self.len as u64 {
                    continue;
                }
                let pfn = u32::try_from(pfn).expect("frame number exceeds 44-bit physical space");

                match desc.ty {
                    MemoryType::LOADER_CODE
                    | MemoryType::LOADER_DATA
                    | MemoryType::BOOT_SERVICES_CODE
                    | MemoryType::BOOT_SERVICES_DATA => {
                        self.link_tail(PageState::Free, pfn);
                    }
                    MemoryType::CONVENTIONAL | MemoryType::PERSISTENT_MEMORY => {
                        if layout.kernel_space_contains(pa) {
                            self.make_active(pfn, pte_va_of(pa));
                        } else {
                            self.link_tail(PageState::Free, pfn);
                        }
                    }
                    MemoryType::ACPI_RECLAIM | MemoryType::ACPI_NON_VOLATILE => {
                        self.link_tail(PageState::Rom, pfn);
                    }
                    // Reserved, unusable, runtime-services, MMIO, PAL and
                    // anything newer: never touched by this kernel.
                    _ => {}
                }
            }
        }
    }
}

pub struct PfnListIter<'a> {
    db: &'a PfnDatabase,
    next: Option<u32>,
}

impl Iterator for PfnListIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let pfn = self.next?;
        self.next = match self.db.entry(pfn).usage {
            PfnUsage::Listed { flink, .. } => flink,
            PfnUsage::Shared { .. } => panic!("frame {pfn} on a list without link fields"),
        };
        Some(pfn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::KernelLayout;
    use tephra_info::MemoryAttribute;

    fn database(len: usize) -> (PfnDatabase, Vec<PfnEntry>) {
        let mut storage = vec![PfnEntry::unused(); len];
        let db =
            unsafe { PfnDatabase::from_raw(NonNull::new(storage.as_mut_ptr()).unwrap(), len) };
        (db, storage)
    }

    fn descriptor(ty: MemoryType, phys_start: u64, page_count: u64) -> MemoryDescriptor {
        MemoryDescriptor {
            ty,
            phys_start,
            virt_start: 0,
            page_count,
            att: MemoryAttribute::empty(),
        }
    }

    #[test]
    fn link_tail_builds_a_chain() {
        let (mut db, _storage) = database(16);
        db.link_tail(PageState::Free, 3);
        db.link_tail(PageState::Free, 7);
        db.link_tail(PageState::Free, 5);

        assert_eq!(db.free.total, 3);
        assert_eq!(db.free.head, Some(3));
        assert_eq!(db.free.tail, Some(5));
        let free = db.free;
        let order: Vec<u32> = db.list_iter(&free).collect();
        assert_eq!(order, vec![3, 7, 5]);
    }

    #[test]
    fn states_match_lists() {
        let (mut db, _storage) = database(8);
        db.link_tail(PageState::Rom, 2);
        db.make_active(4, VirtualAddress::new(0xFFFF_FF80_0000_1000));

        assert_eq!(db.entry(2).state, PageState::Rom);
        assert!(matches!(db.entry(2).usage, PfnUsage::Listed { .. }));
        assert_eq!(db.entry(4).state, PageState::Active);
        assert!(matches!(db.entry(4).usage, PfnUsage::Shared { count: 1 }));
        assert_eq!(db.entry(0).state, PageState::Unused);
    }

    #[test]
    fn init_from_map_applies_the_state_table() {
        let layout = KernelLayout::for_tests(0x0010_0000, 0x0008_0000);
        let (mut db, _storage) = database(0x400);

        let descs = [
            descriptor(MemoryType::LOADER_DATA, 0x0000_1000, 2),
            descriptor(MemoryType::CONVENTIONAL, 0x0005_0000, 2),
            descriptor(MemoryType::CONVENTIONAL, 0x0010_0000, 2),
            descriptor(MemoryType::ACPI_RECLAIM, 0x0020_0000, 1),
            descriptor(MemoryType::MMIO, 0x0030_0000, 1),
            descriptor(MemoryType::RESERVED, 0x0040_0000, 1),
        ];
        db.init_from_map(descs.iter(), &layout, |pa| {
            VirtualAddress::new(0xFFFF_4000_0000_0000 + pa.as_u64())
        });

        // Loader data and out-of-kernel-space conventional memory: free.
        assert_eq!(db.free.total, 4);
        assert_eq!(db.entry(1).state, PageState::Free);
        assert_eq!(db.entry(0x50).state, PageState::Free);

        // Conventional memory inside kernel space: active with a PTE address.
        let active = db.entry(0x100);
        assert_eq!(active.state, PageState::Active);
        assert!(matches!(active.usage, PfnUsage::Shared { count: 1 }));
        assert_eq!(active.pte_addr.as_u64(), 0xFFFF_4000_0010_0000);

        // ACPI: on the ROM list. MMIO/reserved: untouched.
        assert_eq!(db.rom.total, 1);
        assert_eq!(db.entry(0x200).state, PageState::Rom);
        assert_eq!(db.entry(0x300).state, PageState::Unused);
        assert_eq!(db.entry(0x400 - 1).state, PageState::Unused);
    }
}
