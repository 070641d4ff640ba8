//! Page-table page allocator over the system-PTE region.
//!
//! Every paging-structure page in the kernel comes from here, which is what
//! keeps physical→virtual translation of table pages a pure base-offset
//! computation. Before the region's bitmap exists (it is itself allocated
//! from the byte pool, which does not exist yet when the first tables are
//! built), allocation is a bump cursor; `finish_bootstrap` installs the
//! bitmap and back-fills the pages the cursor already handed out.
//!
//! Exhaustion here is a boot-time invariant violation with no recovery path,
//! so it panics.

use crate::bitmap::Bitmap;
use core::ptr::NonNull;
use tephra_addr::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

/// One zero-filled page suitable for any paging-structure level.
#[derive(Copy, Clone, Debug)]
pub struct TablePage {
    pub phys: PhysicalAddress,
    pub virt: VirtualAddress,
}

pub struct PtPool {
    phys_base: PhysicalAddress,
    virt_base: VirtualAddress,
    pages: usize,
    /// None until `finish_bootstrap`.
    bitmap: Option<Bitmap>,
    /// Pages consumed before the bitmap existed.
    boot_next: usize,
}

// Safety: owns its region exclusively; serialized by the manager lock.
unsafe impl Send for PtPool {}

impl PtPool {
    /// # Panics
    /// If the bases are not page-aligned.
    #[must_use]
    pub fn new(phys_base: PhysicalAddress, virt_base: VirtualAddress, pages: usize) -> Self {
        assert!(phys_base.is_page_aligned() && virt_base.is_page_aligned());
        Self {
            phys_base,
            virt_base,
            pages,
            bitmap: None,
            boot_next: 0,
        }
    }

    #[must_use]
    pub const fn pages(&self) -> usize {
        self.pages
    }

    /// Pages handed out by the bump cursor so far.
    #[must_use]
    pub const fn bootstrap_pages_used(&self) -> usize {
        self.boot_next
    }

    /// Allocate one zero-filled page.
    ///
    /// # Panics
    /// When the pool is exhausted. This can only happen at boot, before any
    /// recovery machinery exists, so halting is the only correct outcome.
    pub fn alloc(&mut self) -> TablePage {
        let index = match self.bitmap.as_mut() {
            Some(bitmap) => bitmap
                .alloc(1)
                .unwrap_or_else(|| panic!("system page-table pool exhausted")),
            None => {
                assert!(
                    self.boot_next < self.pages,
                    "system page-table pool exhausted during bootstrap"
                );
                let i = self.boot_next;
                self.boot_next += 1;
                i
            }
        };

        let offset = index as u64 * PAGE_SIZE;
        let page = TablePage {
            phys: self.phys_base + offset,
            virt: self.virt_base + offset,
        };
        // SAFETY: the page is inside the pool region, which is mapped
        // writable and owned exclusively by this allocator.
        unsafe {
            core::ptr::write_bytes(page.virt.as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
        }
        page
    }

    /// Return a page. Either address may be zero; the other locates the page.
    pub fn free(&mut self, page: TablePage) {
        let index = if page.virt.is_zero() {
            self.index_of_phys(page.phys)
        } else {
            self.index_of_virt(page.virt)
        };
        let bitmap = self
            .bitmap
            .as_mut()
            .expect("page-table pool freed before its bitmap exists");
        assert!(bitmap.get(index), "page-table page double free");
        bitmap.set(index, false);
    }

    /// Install the bitmap and mark every bootstrap-consumed page allocated.
    ///
    /// # Safety
    /// `words` must satisfy the [`Bitmap::from_raw`] contract for
    /// `self.pages()` bits.
    pub unsafe fn finish_bootstrap(&mut self, words: NonNull<u64>) {
        assert!(self.bitmap.is_none(), "page-table pool initialized twice");
        // SAFETY: forwarded contract.
        let mut bitmap = unsafe { Bitmap::from_raw(words, self.pages) };
        for i in 0..self.boot_next {
            bitmap.set(i, true);
        }
        self.bitmap = Some(bitmap);
    }

    /// Translate a pool-owned physical address into its virtual alias.
    #[must_use]
    pub fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        let offset = pa - self.phys_base;
        assert!(
            offset < self.pages as u64 * PAGE_SIZE,
            "physical address outside the page-table pool"
        );
        self.virt_base + offset
    }

    /// Translate a pool-owned virtual address back to physical.
    #[must_use]
    pub fn virt_to_phys(&self, va: VirtualAddress) -> PhysicalAddress {
        let offset = va - self.virt_base;
        assert!(
            offset < self.pages as u64 * PAGE_SIZE,
            "virtual address outside the page-table pool"
        );
        self.phys_base + offset
    }

    fn index_of_phys(&self, pa: PhysicalAddress) -> usize {
        ((pa - self.phys_base) / PAGE_SIZE) as usize
    }

    fn index_of_virt(&self, va: VirtualAddress) -> usize {
        ((va - self.virt_base) / PAGE_SIZE) as usize
    }
}
