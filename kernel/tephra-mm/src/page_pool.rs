//! Page-granular allocator over the non-paged pool.
//!
//! Free memory is tracked as *runs* — maximal spans of physically and
//! virtually contiguous free pages — bucketed by length into
//! [`RUN_BUCKETS`] lists: bucket 0 collects every run of four or more
//! pages, buckets 1..=3 hold exact-length runs. Run bookkeeping lives in
//! the PFN database (length and bucket links at the run head, an owner
//! back-index on every member page), so the pages themselves carry no
//! allocator metadata.
//!
//! An allocated run is recorded *only* by the `START_OF_RUN`/`END_OF_RUN`
//! marker bits on its boundary frames; `free_pages` rebuilds the length by
//! scanning forward for the end marker. Coalescing is lazy: adjacent free
//! runs are fused during the overflow-bucket scan when a request would
//! otherwise fail.

use crate::error::MmError;
use crate::pfn::{PfnDatabase, PfnFlags};
use tephra_addr::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

/// Bucket count; bucket 0 is the overflow bucket for runs of four or more
/// pages.
pub const RUN_BUCKETS: usize = 4;

#[derive(Copy, Clone, Debug, Default)]
struct RunList {
    total: u64,
    head: Option<u32>,
    tail: Option<u32>,
}

pub struct PagePool {
    base_pfn: u32,
    page_count: u64,
    virt_base: VirtualAddress,
    buckets: [RunList; RUN_BUCKETS],
}

impl PagePool {
    /// # Panics
    /// If the bases are unaligned or the region does not fit 32-bit frame
    /// numbers.
    #[must_use]
    pub fn new(phys_base: PhysicalAddress, virt_base: VirtualAddress, page_count: u64) -> Self {
        assert!(phys_base.is_page_aligned() && virt_base.is_page_aligned());
        let base_pfn = u32::try_from(phys_base.pfn().as_u64())
            .expect("non-paged pool beyond 44-bit physical space");
        assert!(u64::from(base_pfn) + page_count <= u64::from(u32::MAX));
        Self {
            base_pfn,
            page_count,
            virt_base,
            buckets: [RunList::default(); RUN_BUCKETS],
        }
    }

    /// Hand the pool its initial memory: one run covering the region minus
    /// the first `skip_pages` pages (occupied by the relocated boot blob).
    pub fn seed(&mut self, db: &mut PfnDatabase, skip_pages: u64) {
        assert!(skip_pages < self.page_count, "nothing left to seed the pool with");
        let start = self.base_pfn + u32::try_from(skip_pages).unwrap();
        let len = self.page_count - skip_pages;
        self.insert_run(db, start, len);
    }

    #[must_use]
    pub const fn virt_base(&self) -> VirtualAddress {
        self.virt_base
    }

    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        va >= self.virt_base && (va - self.virt_base) < self.page_count * PAGE_SIZE
    }

    /// Runs currently parked in bucket `index`.
    #[must_use]
    pub const fn bucket_total(&self, index: usize) -> u64 {
        self.buckets[index].total
    }

    /// The run at bucket `index`'s rear, as `(first_frame, length)`.
    #[must_use]
    pub fn bucket_rear_run(&self, db: &PfnDatabase, index: usize) -> Option<(u32, u64)> {
        let tail = self.buckets[index].tail?;
        Some((tail, u64::from(db.entry(tail).run_pages)))
    }

    /// Total free pages across all buckets.
    #[must_use]
    pub fn free_pages_total(&self, db: &PfnDatabase) -> u64 {
        let mut total = 0;
        for bucket in &self.buckets {
            let mut cursor = bucket.head;
            while let Some(run) = cursor {
                total += u64::from(db.entry(run).run_pages);
                cursor = db.entry(run).run_flink;
            }
        }
        total
    }

    /// Allocate `bytes` rounded up to whole pages; returns the run's virtual
    /// base.
    ///
    /// # Errors
    /// [`MmError::NoMoreFreeMemory`] when no bucket can satisfy the request
    /// even after backward coalescing.
    pub fn alloc_pages(
        &mut self,
        db: &mut PfnDatabase,
        bytes: u64,
    ) -> Result<VirtualAddress, MmError> {
        assert!(bytes > 0);
        let wanted = bytes.div_ceil(PAGE_SIZE);

        // Exact-length bucket first; pop the rear.
        if wanted < RUN_BUCKETS as u64 {
            if let Some(start) = self.buckets[wanted as usize].tail {
                self.remove_from_bucket(db, wanted as usize, start);
                self.mark_allocated(db, start, wanted);
                return Ok(self.pfn_to_virt(start));
            }
        }

        // Overflow bucket, scanned rear to front. Undersized candidates are
        // fused with their physically adjacent list predecessor and
        // re-examined.
        let mut cursor = self.buckets[0].tail;
        while let Some(start) = cursor {
            let len = u64::from(db.entry(start).run_pages);

            if len > wanted {
                // Split: the caller takes the tail, the head shrinks in
                // place (member owners still point at `start`).
                let remaining = len - wanted;
                let taken = start + u32::try_from(remaining).unwrap();
                db.entry_mut(start).run_pages = u32::try_from(remaining).unwrap();
                if remaining < RUN_BUCKETS as u64 {
                    self.remove_from_bucket(db, 0, start);
                    self.append_to_bucket(db, Self::bucket_index(remaining), start, remaining);
                }
                self.mark_allocated(db, taken, wanted);
                return Ok(self.pfn_to_virt(taken));
            }

            if len == wanted {
                self.remove_from_bucket(db, 0, start);
                self.mark_allocated(db, start, wanted);
                return Ok(self.pfn_to_virt(start));
            }

            let Some(prev) = db.entry(start).run_blink else {
                break;
            };
            let prev_len = u64::from(db.entry(prev).run_pages);
            if u64::from(prev) + prev_len == u64::from(start) {
                // The list predecessor physically precedes the candidate:
                // fuse the candidate into it and re-examine the grown run.
                self.remove_from_bucket(db, 0, start);
                self.absorb_run(db, prev, start, len);
                db.entry_mut(prev).run_pages = u32::try_from(prev_len + len).unwrap();
                cursor = Some(prev);
            } else if u64::from(start) + len == u64::from(prev) {
                // The list predecessor physically follows the candidate:
                // pull it into the candidate and re-examine.
                self.remove_from_bucket(db, 0, prev);
                self.absorb_run(db, start, prev, prev_len);
                db.entry_mut(start).run_pages = u32::try_from(len + prev_len).unwrap();
                cursor = Some(start);
            } else {
                cursor = Some(prev);
            }
        }

        Err(MmError::NoMoreFreeMemory)
    }

    /// Free the run starting at `va`.
    ///
    /// The run length is reconstructed purely from the boundary markers, so
    /// `va` must be the address `alloc_pages` returned — never an interior
    /// page of a run.
    ///
    /// # Panics
    /// On a non-run-start address or a missing end marker (double free or
    /// corruption).
    pub fn free_pages(&mut self, db: &mut PfnDatabase, va: VirtualAddress) {
        assert!(va.is_page_aligned(), "freeing an unaligned page address");
        assert!(self.contains(va), "freeing an address outside the pool");
        let start = self.virt_to_pfn(va);

        {
            let entry = db.entry_mut(start);
            assert!(
                entry.flags.contains(PfnFlags::START_OF_RUN),
                "freeing an address that does not start an allocated run"
            );
            entry.flags.remove(PfnFlags::START_OF_RUN);
        }

        // Walk forward to the end marker, zeroing and re-owning each page.
        let mut len = 0_u64;
        let mut page = start;
        loop {
            // SAFETY: the page is pool-owned and mapped writable; the caller
            // relinquished it.
            unsafe {
                core::ptr::write_bytes(
                    self.pfn_to_virt(page).as_mut_ptr::<u8>(),
                    0,
                    PAGE_SIZE as usize,
                );
            }
            let entry = db.entry_mut(page);
            entry.run_owner = Some(start);
            len += 1;

            if entry.flags.contains(PfnFlags::END_OF_RUN) {
                entry.flags.remove(PfnFlags::END_OF_RUN);
                break;
            }
            page += 1;
            assert!(
                u64::from(page - self.base_pfn) < self.page_count,
                "allocated run has no end marker"
            );
        }

        let start_entry = db.entry_mut(start);
        start_entry.run_pages = u32::try_from(len).unwrap();
        self.append_to_bucket(db, Self::bucket_index(len), start, len);
    }

    #[must_use]
    pub fn pfn_to_virt(&self, pfn: u32) -> VirtualAddress {
        debug_assert!(pfn >= self.base_pfn);
        self.virt_base + u64::from(pfn - self.base_pfn) * PAGE_SIZE
    }

    #[must_use]
    pub fn virt_to_pfn(&self, va: VirtualAddress) -> u32 {
        self.base_pfn + u32::try_from((va - self.virt_base) / PAGE_SIZE).unwrap()
    }

    const fn bucket_index(len: u64) -> usize {
        if len >= RUN_BUCKETS as u64 {
            0
        } else {
            len as usize
        }
    }

    /// Re-own the pages of the (already unlinked) run at `victim` to the run
    /// headed by `survivor` and strip the victim's head fields.
    fn absorb_run(&mut self, db: &mut PfnDatabase, survivor: u32, victim: u32, victim_len: u64) {
        for page in victim..victim + u32::try_from(victim_len).unwrap() {
            let entry = db.entry_mut(page);
            entry.run_owner = Some(survivor);
            entry.run_pages = 0;
            entry.run_flink = None;
            entry.run_blink = None;
        }
    }

    /// Record a fresh free run: owner back-indices on every member, length
    /// at the head, appended at the bucket rear.
    fn insert_run(&mut self, db: &mut PfnDatabase, start: u32, len: u64) {
        for page in start..start + u32::try_from(len).unwrap() {
            db.entry_mut(page).run_owner = Some(start);
        }
        db.entry_mut(start).run_pages = u32::try_from(len).unwrap();
        self.append_to_bucket(db, Self::bucket_index(len), start, len);
    }

    fn append_to_bucket(&mut self, db: &mut PfnDatabase, bucket: usize, start: u32, len: u64) {
        debug_assert_eq!(u64::from(db.entry(start).run_pages), len);
        let old_tail = self.buckets[bucket].tail;
        {
            let entry = db.entry_mut(start);
            entry.run_flink = None;
            entry.run_blink = old_tail;
        }
        if let Some(tail) = old_tail {
            db.entry_mut(tail).run_flink = Some(start);
        }
        let list = &mut self.buckets[bucket];
        if list.head.is_none() {
            list.head = Some(start);
        }
        list.tail = Some(start);
        list.total += 1;
    }

    fn remove_from_bucket(&mut self, db: &mut PfnDatabase, bucket: usize, start: u32) {
        let (flink, blink) = {
            let entry = db.entry(start);
            (entry.run_flink, entry.run_blink)
        };
        match blink {
            Some(prev) => db.entry_mut(prev).run_flink = flink,
            None => {
                assert_eq!(self.buckets[bucket].head, Some(start), "run not on its bucket list");
                self.buckets[bucket].head = flink;
            }
        }
        match flink {
            Some(next) => db.entry_mut(next).run_blink = blink,
            None => {
                assert_eq!(self.buckets[bucket].tail, Some(start), "run not on its bucket list");
                self.buckets[bucket].tail = blink;
            }
        }
        let entry = db.entry_mut(start);
        entry.run_flink = None;
        entry.run_blink = None;
        self.buckets[bucket].total -= 1;
    }

    /// Strip run bookkeeping from an allocated span and stamp its boundary
    /// markers — from here on, those two bits *are* the run.
    fn mark_allocated(&mut self, db: &mut PfnDatabase, start: u32, len: u64) {
        for page in start..start + u32::try_from(len).unwrap() {
            let entry = db.entry_mut(page);
            debug_assert!(
                !entry.flags.intersects(PfnFlags::START_OF_RUN | PfnFlags::END_OF_RUN),
                "free page already carries run markers"
            );
            entry.run_owner = None;
            entry.run_pages = 0;
            entry.run_flink = None;
            entry.run_blink = None;
        }
        db.entry_mut(start).flags.insert(PfnFlags::START_OF_RUN);
        db.entry_mut(start + u32::try_from(len - 1).unwrap())
            .flags
            .insert(PfnFlags::END_OF_RUN);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pfn::PfnEntry;
    use core::ptr::NonNull;

    const POOL_PHYS: u64 = 0x0010_0000;

    struct Fixture {
        pool: PagePool,
        db: PfnDatabase,
        _ram: Vec<Frame>,
        _entries: Vec<PfnEntry>,
    }

    #[repr(align(4096))]
    struct Frame([u8; PAGE_SIZE as usize]);

    fn fixture(pages: u64) -> Fixture {
        let ram: Vec<Frame> = (0..pages).map(|_| Frame([0; 4096])).collect();
        let virt = VirtualAddress::from_ptr(ram.as_ptr());
        let db_len = (POOL_PHYS / PAGE_SIZE) as usize + pages as usize;
        let mut entries = vec![PfnEntry::unused(); db_len];
        let db = unsafe {
            PfnDatabase::from_raw(NonNull::new(entries.as_mut_ptr()).unwrap(), db_len)
        };
        let pool = PagePool::new(PhysicalAddress::new(POOL_PHYS), virt, pages);
        Fixture {
            pool,
            db,
            _ram: ram,
            _entries: entries,
        }
    }

    fn seeded(pages: u64) -> Fixture {
        let mut f = fixture(pages);
        f.pool.seed(&mut f.db, 0);
        f
    }

    #[test]
    fn boundary_markers_delimit_an_allocated_run() {
        let mut f = seeded(16);
        let va = f.pool.alloc_pages(&mut f.db, 5 * PAGE_SIZE).unwrap();
        let first = f.pool.virt_to_pfn(va);

        assert!(f.db.entry(first).flags.contains(PfnFlags::START_OF_RUN));
        assert!(f.db.entry(first + 4).flags.contains(PfnFlags::END_OF_RUN));
        // No page strictly inside the run carries either marker.
        for page in first + 1..first + 4 {
            assert!(f.db.entry(page).flags.is_empty());
        }
        assert!(!f.db.entry(first).flags.contains(PfnFlags::END_OF_RUN));
    }

    #[test]
    fn split_takes_the_tail_and_shrinks_the_head() {
        let mut f = seeded(39);
        let va = f.pool.alloc_pages(&mut f.db, 28 * PAGE_SIZE).unwrap();

        // The remaining 11-page head stays in the overflow bucket.
        assert_eq!(f.pool.bucket_total(0), 1);
        let (head, len) = f.pool.bucket_rear_run(&f.db, 0).unwrap();
        assert_eq!(head, f.pool.virt_to_pfn(f.pool.virt_base()));
        assert_eq!(len, 11);
        // The allocation came from the tail of the original run.
        assert_eq!(f.pool.virt_to_pfn(va), head + 11);

        // An exact-size request then drains the bucket completely.
        let second = f.pool.alloc_pages(&mut f.db, 11 * PAGE_SIZE).unwrap();
        assert_eq!(f.pool.virt_to_pfn(second), head);
        assert_eq!(f.pool.bucket_total(0), 0);
        assert_eq!(f.pool.free_pages_total(&f.db), 0);
    }

    #[test]
    fn small_runs_use_exact_buckets() {
        let mut f = seeded(16);
        // Carve the big run down until a 2-page run lands in bucket 2.
        let a = f.pool.alloc_pages(&mut f.db, 14 * PAGE_SIZE).unwrap();
        assert_eq!(f.pool.bucket_total(2), 1);
        assert_eq!(f.pool.bucket_total(0), 0);

        let b = f.pool.alloc_pages(&mut f.db, 2 * PAGE_SIZE).unwrap();
        assert_eq!(f.pool.bucket_total(2), 0);
        assert_eq!(f.pool.free_pages_total(&f.db), 0);

        f.pool.free_pages(&mut f.db, b);
        assert_eq!(f.pool.bucket_total(2), 1);
        f.pool.free_pages(&mut f.db, a);
        assert_eq!(f.pool.bucket_total(0), 1);
    }

    #[test]
    fn free_reconstructs_length_and_zeroes() {
        let mut f = seeded(8);
        let va = f.pool.alloc_pages(&mut f.db, 3 * PAGE_SIZE).unwrap();

        // Dirty the allocation, then free it.
        unsafe {
            core::ptr::write_bytes(va.as_mut_ptr::<u8>(), 0xCC, 3 * PAGE_SIZE as usize);
        }
        f.pool.free_pages(&mut f.db, va);

        let (run, len) = f.pool.bucket_rear_run(&f.db, 3).unwrap();
        assert_eq!(len, 3);
        // Member pages point back at the reconstructed run head.
        for page in run..run + 3 {
            assert_eq!(f.db.entry(page).run_owner, Some(run));
        }
        // Stale-data defense: contents are zero again.
        let bytes = unsafe {
            core::slice::from_raw_parts(va.as_ptr::<u8>(), 3 * PAGE_SIZE as usize)
        };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn adjacent_runs_fuse_to_satisfy_large_requests() {
        let mut f = seeded(24);
        // Fragment the pool into three adjacent allocated runs, then free
        // them all; each free lands a separate run in bucket 0.
        let a = f.pool.alloc_pages(&mut f.db, 8 * PAGE_SIZE).unwrap();
        let b = f.pool.alloc_pages(&mut f.db, 8 * PAGE_SIZE).unwrap();
        let c = f.pool.alloc_pages(&mut f.db, 8 * PAGE_SIZE).unwrap();
        f.pool.free_pages(&mut f.db, a);
        f.pool.free_pages(&mut f.db, b);
        f.pool.free_pages(&mut f.db, c);
        assert_eq!(f.pool.bucket_total(0), 3);

        // No single run holds 20 pages; the scan must fuse predecessors
        // (two merges) before it can split the request off.
        let big = f.pool.alloc_pages(&mut f.db, 20 * PAGE_SIZE).unwrap();
        assert_eq!(f.pool.bucket_total(0), 1);
        let (_, rest) = f.pool.bucket_rear_run(&f.db, 0).unwrap();
        assert_eq!(rest, 4);
        assert_eq!(f.pool.free_pages_total(&f.db), 4);

        f.pool.free_pages(&mut f.db, big);
        assert_eq!(f.pool.free_pages_total(&f.db), 24);
    }

    #[test]
    fn exhaustion_reports_no_more_free_memory() {
        let mut f = seeded(4);
        assert_eq!(
            f.pool.alloc_pages(&mut f.db, 5 * PAGE_SIZE),
            Err(MmError::NoMoreFreeMemory)
        );
        // The failed request must not have disturbed the pool.
        assert_eq!(f.pool.free_pages_total(&f.db), 4);
        assert!(f.pool.alloc_pages(&mut f.db, 4 * PAGE_SIZE).is_ok());
    }

    #[test]
    #[should_panic(expected = "does not start an allocated run")]
    fn freeing_an_interior_page_panics() {
        let mut f = seeded(8);
        let va = f.pool.alloc_pages(&mut f.db, 4 * PAGE_SIZE).unwrap();
        f.pool.free_pages(&mut f.db, va + PAGE_SIZE);
    }

    #[test]
    #[should_panic(expected = "does not start an allocated run")]
    fn double_free_panics() {
        let mut f = seeded(8);
        let va = f.pool.alloc_pages(&mut f.db, 2 * PAGE_SIZE).unwrap();
        f.pool.free_pages(&mut f.db, va);
        f.pool.free_pages(&mut f.db, va);
    }
}
