//! Physical carve-up of the kernel-space region.
//!
//! Computed once at `mm_init` entry and never changed: in physical-address
//! order, kernel image (plus the temporary boot stack), PFN database,
//! non-paged pool, system-PTE pool, reserved tail. Every region is
//! page-aligned and starts where its predecessor ends; virtual addresses
//! mirror the physical offsets from the kernel-space base.

use crate::pfn::PfnEntry;
use tephra_addr::{PAGE_SIZE, PhysicalAddress, VirtualAddress, align_down, align_up};
use tephra_info::layout::{BOOT_STACK_BYTES, KERNEL_SPACE_BASE};
use tephra_info::{MachineInfo, SPACE_KERNEL, SPACE_KERNEL_IMAGE};

/// One carved region, with both of its address views.
#[derive(Copy, Clone, Debug)]
pub struct Region {
    pub phys_start: PhysicalAddress,
    pub phys_end: PhysicalAddress,
    pub virt_start: VirtualAddress,
    pub virt_end: VirtualAddress,
}

impl Region {
    #[must_use]
    pub fn size(&self) -> u64 {
        self.phys_end - self.phys_start
    }

    #[must_use]
    pub fn pages(&self) -> u64 {
        self.size() / PAGE_SIZE
    }

    #[must_use]
    pub fn contains_phys(&self, pa: PhysicalAddress) -> bool {
        pa >= self.phys_start && pa < self.phys_end
    }

    /// The virtual alias of a physical address inside this region.
    #[must_use]
    pub fn virt_of_phys(&self, pa: PhysicalAddress) -> VirtualAddress {
        debug_assert!(self.contains_phys(pa));
        self.virt_start + (pa - self.phys_start)
    }
}

/// The fixed partition of kernel space.
#[derive(Copy, Clone, Debug)]
pub struct KernelLayout {
    kernel_space_base: PhysicalAddress,
    kernel_space_size: u64,
    pub image: Region,
    pub pfn_db: Region,
    pub pool: Region,
    pub pte_pool: Region,
    pub reserved: Region,
    /// Frames covered by the PFN database (up to the highest RAM address).
    pub pfn_count: u64,
}

impl KernelLayout {
    /// Carve the kernel-space region reported by the loader.
    ///
    /// # Panics
    /// On unaligned or out-of-order loader descriptors, or when kernel space
    /// is too small to hold the layout — both unrecoverable boot defects.
    #[must_use]
    pub fn compute(mi: &MachineInfo) -> Self {
        let ks = mi.space(SPACE_KERNEL);
        let img = mi.space(SPACE_KERNEL_IMAGE);

        let ks_base = PhysicalAddress::new(ks.base);
        let ks_end = PhysicalAddress::new(ks.base + ks.size);
        assert!(ks_base.is_page_aligned(), "kernel space base not page-aligned");
        assert!(ks.size % PAGE_SIZE == 0, "kernel space size not page-aligned");
        assert!(
            img.base >= ks.base && img.base + img.size <= ks.base + ks.size,
            "kernel image outside kernel space"
        );

        let region = |phys_start: u64, phys_end: u64| {
            debug_assert!(phys_start % PAGE_SIZE == 0 && phys_end % PAGE_SIZE == 0);
            debug_assert!(phys_start >= ks.base);
            Region {
                phys_start: PhysicalAddress::new(phys_start),
                phys_end: PhysicalAddress::new(phys_end),
                virt_start: VirtualAddress::new(KERNEL_SPACE_BASE + (phys_start - ks.base)),
                virt_end: VirtualAddress::new(KERNEL_SPACE_BASE + (phys_end - ks.base)),
            }
        };

        // Image region runs from the kernel-space base to the end of the
        // loaded image plus the temporary boot stack.
        let image_end = align_up(img.base + img.size + BOOT_STACK_BYTES, PAGE_SIZE);
        let image = region(ks.base, image_end);

        let pfn_count = mi.highest_phys_addr.div_ceil(PAGE_SIZE);
        let pfn_db_bytes = align_up(pfn_count * size_of::<PfnEntry>() as u64, PAGE_SIZE);
        let pfn_db = region(image_end, image_end + pfn_db_bytes);

        let pool_bytes = align_down(ks.size / 2, PAGE_SIZE);
        let pool = region(pfn_db.phys_end.as_u64(), pfn_db.phys_end.as_u64() + pool_bytes);

        let pte_bytes = align_down(ks.size / 4, PAGE_SIZE);
        let pte_pool = region(pool.phys_end.as_u64(), pool.phys_end.as_u64() + pte_bytes);

        assert!(
            pte_pool.phys_end <= ks_end,
            "kernel space too small for the memory-manager layout"
        );
        let reserved = region(pte_pool.phys_end.as_u64(), ks_end.as_u64());

        Self {
            kernel_space_base: ks_base,
            kernel_space_size: ks.size,
            image,
            pfn_db,
            pool,
            pte_pool,
            reserved,
            pfn_count,
        }
    }

    #[must_use]
    pub const fn kernel_space_base(&self) -> PhysicalAddress {
        self.kernel_space_base
    }

    #[must_use]
    pub fn kernel_space_contains(&self, pa: PhysicalAddress) -> bool {
        pa >= self.kernel_space_base
            && (pa - self.kernel_space_base) < self.kernel_space_size
    }

    /// The kernel virtual alias of any kernel-space physical address.
    #[must_use]
    pub fn kernel_virt_of(&self, pa: PhysicalAddress) -> VirtualAddress {
        debug_assert!(self.kernel_space_contains(pa));
        VirtualAddress::new(KERNEL_SPACE_BASE + (pa - self.kernel_space_base))
    }
}

#[cfg(test)]
impl KernelLayout {
    /// Degenerate layout for tests that only need kernel-space bounds.
    pub(crate) fn for_tests(kernel_space_base: u64, kernel_space_size: u64) -> Self {
        let empty = Region {
            phys_start: PhysicalAddress::new(kernel_space_base),
            phys_end: PhysicalAddress::new(kernel_space_base),
            virt_start: VirtualAddress::new(KERNEL_SPACE_BASE),
            virt_end: VirtualAddress::new(KERNEL_SPACE_BASE),
        };
        Self {
            kernel_space_base: PhysicalAddress::new(kernel_space_base),
            kernel_space_size,
            image: empty,
            pfn_db: empty,
            pool: empty,
            pte_pool: empty,
            reserved: empty,
            pfn_count: 0,
        }
    }
}
