//! # Physical and virtual memory management
//!
//! The bring-up memory stack: it boots with no allocator underneath it,
//! carves its own pools out of raw physical memory, builds the kernel's
//! page tables, and then serves every allocation the rest of the kernel
//! makes.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │  kmalloc / kfree           (segregated-fit, tagged) │
//! └──────────────────────┬──────────────────────────────┘
//! ┌──────────────────────▼──────────────────────────────┐
//! │  alloc_pages / free_pages  (page runs, 4 buckets)   │
//! └──────────────────────┬──────────────────────────────┘
//! ┌──────────────────────▼──────────────────────────────┐
//! │  PFN database              (per-frame state, lists) │
//! └──────────────────────┬──────────────────────────────┘
//! ┌──────────────────────▼──────────────────────────────┐
//! │  address space + PT pool   (self-mapped 4-level)    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! [`init`] runs the whole bootstrap once, on the boot processor, with every
//! failure fatal — there is nothing to fall back to that early. Afterwards
//! the [`MemoryManager`] singleton serves allocations from any core; all
//! allocator state sits behind one spin lock (the tag tracker behind its
//! own), since application processors call in concurrently.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod aspace;
pub mod bitmap;
pub mod byte_pool;
mod error;
pub mod layout;
pub mod page_pool;
pub mod pfn;
pub mod pt_pool;
pub mod tag_trace;

pub use error::MmError;

use crate::aspace::AddressSpace;
use crate::bitmap::Bitmap;
use crate::byte_pool::BytePool;
use crate::layout::KernelLayout;
use crate::page_pool::PagePool;
use crate::pfn::{PageState, PfnDatabase, PfnUsage};
use crate::pt_pool::PtPool;
use crate::tag_trace::{PoolTag, TagRecord, TagTracker};
use core::ptr::NonNull;
use log::info;
use tephra_addr::{PAGE_SIZE, Pfn, PhysicalAddress, VirtualAddress, align_up};
use tephra_info::layout::{KERNEL_SPACE_SLOT, MMIO_WINDOW_BASE, ROM_WINDOW_BASE};
use tephra_info::{MachineInfo, SPACE_AP_TRAMPOLINE, SPACE_KERNEL, SPACE_KERNEL_IMAGE};
use tephra_registers::rdtsc;
use tephra_sync::{SpinLock, SyncOnceCell};
use tephra_vmem::PageEntry;

/// Pool index of the default kernel pool.
pub const KERNEL_POOL: u8 = 0;

/// Everything the allocator entry points mutate, behind one lock: both
/// allocator layers share the PFN database, so they share its lock too.
struct MmCore {
    aspace: AddressSpace,
    pt_pool: PtPool,
    pfn: PfnDatabase,
    page_pool: PagePool,
    kernel_pool: BytePool,
    mmio_next: VirtualAddress,
}

/// The memory-manager context: constructed once by [`init`], then shared.
pub struct MemoryManager {
    core: SpinLock<MmCore>,
    tags: SpinLock<TagTracker>,
    machine: &'static MachineInfo,
}

static MANAGER: SyncOnceCell<MemoryManager> = SyncOnceCell::new();

/// One-shot bootstrap. Must run on the boot processor before any other
/// kernel subsystem allocates; every failure in here is fatal.
///
/// # Safety
/// `mi` must be the loader-provided handoff blob, with kernel space already
/// mapped at its kernel virtual addresses and low memory identity-mapped.
pub unsafe fn init(mi: &'static MachineInfo) -> &'static MemoryManager {
    MANAGER.get_or_init(|| unsafe { bring_up(mi) })
}

/// The initialized singleton.
///
/// # Panics
/// If called before [`init`].
pub fn manager() -> &'static MemoryManager {
    MANAGER.get().expect("memory manager not initialized")
}

unsafe fn bring_up(mi: &MachineInfo) -> MemoryManager {
    // Fix the physical carve-up of kernel space.
    let layout = KernelLayout::compute(mi);
    info!(
        "kernel space: image {} pages, pfn db {} pages, pool {} pages, pte pool {} pages, reserved {} pages",
        layout.image.pages(),
        layout.pfn_db.pages(),
        layout.pool.pages(),
        layout.pte_pool.pages(),
        layout.reserved.pages(),
    );

    // Move the handoff blob into the pool head; the loader-side copy (and
    // the firmware's descriptor buffer) become reclaimable.
    let machine = unsafe { relocate_machine_info(mi, &layout) };
    let blob_pages = machine.relocated_size().div_ceil(PAGE_SIZE);

    // Build the new address space and switch onto it.
    let mut pt_pool = PtPool::new(
        layout.pte_pool.phys_start,
        layout.pte_pool.virt_start,
        layout.pte_pool.pages() as usize,
    );
    let entropy = rdtsc()
        ^ machine.space(SPACE_KERNEL).base.rotate_left(17)
        ^ machine.space(SPACE_KERNEL_IMAGE).base.rotate_left(43);
    let mut aspace = AddressSpace::create(&mut pt_pool, entropy);
    aspace.ensure_top_level(&mut pt_pool, KERNEL_SPACE_SLOT);

    for (region, leaf) in [
        (layout.image, PageEntry::kernel_code as fn(PhysicalAddress) -> PageEntry),
        (layout.pfn_db, PageEntry::kernel_data),
        (layout.pool, PageEntry::kernel_data),
        (layout.pte_pool, PageEntry::kernel_data),
    ] {
        aspace.map_zone(&mut pt_pool, region.virt_start, region.phys_start, region.size(), leaf);
    }

    if machine.fb.ptr != 0 {
        aspace.map_zone(
            &mut pt_pool,
            VirtualAddress::new(tephra_info::layout::FRAMEBUFFER_BASE),
            PhysicalAddress::new(machine.fb.ptr).align_down_page(),
            align_up(machine.fb.size, PAGE_SIZE),
            PageEntry::mmio,
        );
    }

    // The AP startup trampoline runs in real mode at its physical address;
    // keep that page identity-mapped and executable.
    let trampoline = machine.space(SPACE_AP_TRAMPOLINE);
    if trampoline.size != 0 {
        aspace.map_zone(
            &mut pt_pool,
            VirtualAddress::new(trampoline.base),
            PhysicalAddress::new(trampoline.base),
            align_up(trampoline.size, PAGE_SIZE),
            PageEntry::kernel_code,
        );
    }

    // SAFETY: every zone above maps itself at the addresses the kernel is
    // already executing from (the loader used the same layout).
    unsafe {
        aspace.activate();
    }

    // Populate the frame database from the firmware map.
    let pfn_entries = NonNull::new(layout.pfn_db.virt_start.as_mut_ptr())
        .expect("PFN database region has a null base");
    let mut pfn = unsafe { PfnDatabase::from_raw(pfn_entries, layout.pfn_count as usize) };
    let window = aspace.window();
    pfn.init_from_map(
        unsafe { machine.mmap.descriptors() },
        &layout,
        |pa| window.pte_va(layout.kernel_virt_of(pa)),
    );
    info!(
        "pfn census: {} free, {} rom, {} bad frames",
        pfn.free.total, pfn.rom.total, pfn.bad.total
    );

    // Seed the page allocator with the pool region (minus the blob head)
    // and bring up the byte pool on top of it.
    let mut page_pool = PagePool::new(layout.pool.phys_start, layout.pool.virt_start, layout.pool.pages());
    page_pool.seed(&mut pfn, blob_pages);
    let mut kernel_pool = BytePool::new(KERNEL_POOL, layout.pool.virt_start, layout.pool.size());

    // The PTE-pool bitmap lives in the byte pool; back-fill the pages the
    // bootstrap already consumed.
    let words = Bitmap::words_for(pt_pool.pages());
    let storage = kernel_pool
        .malloc(&mut page_pool, &mut pfn, words * size_of::<u64>(), PoolTag::NONE)
        .unwrap_or_else(|_| panic!("no memory for the system-PTE bitmap"));
    unsafe {
        pt_pool.finish_bootstrap(
            NonNull::new(storage.as_mut_ptr()).expect("bitmap storage is null"),
        );
    }
    info!(
        "system-PTE pool: {} of {} pages consumed during bootstrap",
        pt_pool.bootstrap_pages_used(),
        pt_pool.pages()
    );

    // Re-map firmware/ACPI frames read-only so their tables stay reachable.
    map_rom_window(&mut aspace, &mut pt_pool, &mut pfn);

    MemoryManager {
        core: SpinLock::new(MmCore {
            aspace,
            pt_pool,
            pfn,
            page_pool,
            kernel_pool,
            mmio_next: VirtualAddress::new(MMIO_WINDOW_BASE),
        }),
        tags: SpinLock::new(TagTracker::new()),
        machine,
    }
}

/// Copy the handoff blob (struct + descriptor buffer) to the head of the
/// non-paged pool and return the relocated reference.
unsafe fn relocate_machine_info(mi: &MachineInfo, layout: &KernelLayout) -> &'static MachineInfo {
    let dst = layout.pool.virt_start.as_mut_ptr::<u8>();
    let desc_dst = unsafe { dst.add(size_of::<MachineInfo>()) };
    // SAFETY: the pool region is mapped writable and unused; the source
    // buffer is the loader's live descriptor copy.
    unsafe {
        core::ptr::copy_nonoverlapping(
            mi.mmap.ptr as usize as *const u8,
            desc_dst,
            mi.mmap.len as usize,
        );
        let info_dst = dst.cast::<MachineInfo>();
        info_dst.write(mi.clone());
        (*info_dst).mmap.ptr = desc_dst as u64;
        &*info_dst
    }
}

/// Map every ROM-state frame read-only under the dedicated window slot and
/// record where, so physical ACPI pointers can be translated later.
fn map_rom_window(aspace: &mut AddressSpace, pool: &mut PtPool, pfn: &mut PfnDatabase) {
    let mut cursor = pfn.rom.head;
    while let Some(frame) = cursor {
        let pa = Pfn::new(u64::from(frame)).base();
        let va = VirtualAddress::new(ROM_WINDOW_BASE + pa.as_u64());
        aspace.map_page(pool, va, PageEntry::kernel_ro(pa));

        let entry = pfn.entry_mut(frame);
        entry.mapped_at = va;
        cursor = match entry.usage {
            PfnUsage::Listed { flink, .. } => flink,
            PfnUsage::Shared { .. } => panic!("ROM list entry without links"),
        };
    }
}

impl MemoryManager {
    /// The relocated handoff blob.
    #[must_use]
    pub const fn machine(&self) -> &'static MachineInfo {
        self.machine
    }

    /// Allocate from the default kernel pool.
    ///
    /// # Errors
    /// [`MmError::NoMoreFreeMemory`] when the pool is exhausted.
    pub fn kmalloc(&self, size: usize) -> Result<NonNull<u8>, MmError> {
        self.kmalloc_tagged(size, PoolTag::NONE)
    }

    /// Allocate with a leak-tracking tag (zero = untagged).
    ///
    /// # Errors
    /// [`MmError::NoMoreFreeMemory`] on exhaustion; [`MmError::TagTracking`]
    /// when the allocation succeeded but could not be recorded — it is
    /// rolled back before this returns.
    pub fn kmalloc_tagged(&self, size: usize, tag: PoolTag) -> Result<NonNull<u8>, MmError> {
        let block = self
            .core
            .with_lock(|c| c.kernel_pool.malloc(&mut c.page_pool, &mut c.pfn, size, tag))?;

        if !tag.is_none() {
            let record = self.core.with_lock(|c| {
                c.kernel_pool
                    .malloc(&mut c.page_pool, &mut c.pfn, size_of::<TagRecord>(), PoolTag::NONE)
            });
            let Ok(record_va) = record else {
                // Never leave a tagged block untracked: roll the whole
                // allocation back.
                self.core
                    .with_lock(|c| c.kernel_pool.free(&mut c.page_pool, &mut c.pfn, block));
                return Err(MmError::TagTracking);
            };
            let tracked_size = if block.is_page_aligned() {
                align_up(size as u64, PAGE_SIZE) as usize
            } else {
                byte_pool::block_bytes(block)
            };
            // SAFETY: the record block was just allocated for exactly this.
            unsafe {
                record_va
                    .as_mut_ptr::<TagRecord>()
                    .write(TagRecord::new(block, tracked_size, tag));
            }
            self.tags.with_lock(|t| {
                t.insert(NonNull::new(record_va.as_mut_ptr()).expect("record block is null"));
            });
        }

        Ok(NonNull::new(block.as_mut_ptr()).expect("allocator returned a null block"))
    }

    /// Free a block from [`kmalloc`](Self::kmalloc)/[`kmalloc_tagged`](Self::kmalloc_tagged).
    ///
    /// # Panics
    /// If `ptr` is not a live allocation of this manager (double free,
    /// foreign pointer, corruption).
    pub fn kfree(&self, ptr: NonNull<u8>) {
        let va = VirtualAddress::from_ptr(ptr.as_ptr());

        // Oversized allocations carry no header; their tag record (if any)
        // is keyed by pointer alone.
        if va.is_page_aligned() {
            if let Some(record) = self.tags.with_lock(|t| t.remove_by_ptr(va)) {
                self.release_record(record);
            }
            self.core
                .with_lock(|c| c.kernel_pool.free(&mut c.page_pool, &mut c.pfn, va));
            return;
        }

        let tag = byte_pool::block_tag(va);
        if !tag.is_none() {
            let size = byte_pool::block_bytes(va);
            if let Some(record) = self.tags.with_lock(|t| t.remove(tag, va, size)) {
                self.release_record(record);
            }
        }
        self.core
            .with_lock(|c| c.kernel_pool.free(&mut c.page_pool, &mut c.pfn, va));
    }

    /// Allocate a contiguous page run of at least `bytes`.
    ///
    /// # Errors
    /// [`MmError::NoMoreFreeMemory`] when no run can be assembled.
    pub fn alloc_pages(&self, bytes: u64) -> Result<NonNull<u8>, MmError> {
        let va = self
            .core
            .with_lock(|c| c.page_pool.alloc_pages(&mut c.pfn, bytes))?;
        Ok(NonNull::new(va.as_mut_ptr()).expect("page allocator returned null"))
    }

    /// Free a run from [`alloc_pages`](Self::alloc_pages).
    pub fn free_pages(&self, ptr: NonNull<u8>) {
        let va = VirtualAddress::from_ptr(ptr.as_ptr());
        self.core
            .with_lock(|c| c.page_pool.free_pages(&mut c.pfn, va));
    }

    /// Map `page_count` pages of device memory starting at `phys_base` into
    /// the hardware window, growing its tables on demand.
    pub fn set_mmio(&self, phys_base: PhysicalAddress, page_count: u64) -> VirtualAddress {
        assert!(phys_base.is_page_aligned());
        self.core.with_lock(|c| {
            let va = c.mmio_next;
            c.aspace
                .map_zone(&mut c.pt_pool, va, phys_base, page_count * PAGE_SIZE, PageEntry::mmio);
            c.mmio_next = va + page_count * PAGE_SIZE;
            va
        })
    }

    /// Translate a loader-provided physical ACPI pointer into the read-only
    /// window, if the frame was ROM-mapped during bring-up.
    #[must_use]
    pub fn acpi_table_va(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        self.core.with_lock(|c| {
            let frame = u32::try_from(pa.pfn().as_u64()).ok()?;
            if frame as usize >= c.pfn.len() {
                return None;
            }
            let entry = c.pfn.entry(frame);
            (entry.state == PageState::Rom && !entry.mapped_at.is_zero())
                .then(|| entry.mapped_at + pa.page_offset())
        })
    }

    /// Close a tag's lifetime scope.
    ///
    /// # Errors
    /// `Err(count)` when allocations under the tag are still live.
    pub fn close_tag(&self, tag: PoolTag) -> Result<(), usize> {
        self.tags.with_lock(|t| t.close_tag(tag))
    }

    fn release_record(&self, record: NonNull<TagRecord>) {
        let va = VirtualAddress::from_ptr(record.as_ptr().cast::<u8>());
        self.core
            .with_lock(|c| c.kernel_pool.free(&mut c.page_pool, &mut c.pfn, va));
    }
}
