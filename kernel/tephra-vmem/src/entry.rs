use bitfield_struct::bitfield;
use tephra_addr::PhysicalAddress;

/// One 64-bit paging-structure entry — the superset layout shared by all
/// four levels (PML4E, PDPTE, PDE, PTE).
///
/// | Bits | Field | Notes |
/// |------|-------|-------|
/// | 0 | P | entry is valid |
/// | 1 | RW | writes allowed |
/// | 2 | US | user-mode access |
/// | 3 | PWT | write-through |
/// | 4 | PCD | cache disable |
/// | 5 | A | set by hardware on access |
/// | 6 | D | set by hardware on write (leaf only) |
/// | 7 | PS | large leaf at PD/PDPT; must be 0 at PML4/PT |
/// | 8 | G | survives CR3 reload (leaf only) |
/// | 12..=51 | address | physical frame bits [51:12] |
/// | 63 | NX | execute disable (needs `EFER.NXE`) |
#[bitfield(u64)]
pub struct PageEntry {
    pub present: bool,
    pub writable: bool,
    pub user_access: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large_page: bool,
    pub global: bool,
    #[bits(3)]
    os_low: u8,
    #[bits(40)]
    addr_51_12: u64,
    #[bits(7)]
    os_high: u8,
    #[bits(4)]
    protection_key: u8,
    pub no_execute: bool,
}

impl PageEntry {
    /// Store a 4 KiB-aligned physical base.
    #[inline]
    pub const fn set_physical_address(&mut self, pa: PhysicalAddress) {
        self.set_addr_51_12(pa.as_u64() >> 12);
    }

    /// The physical base this entry points at (table or leaf).
    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.addr_51_12() << 12)
    }

    /// Non-leaf link to the next table level.
    #[inline]
    #[must_use]
    pub const fn nonleaf(next: PhysicalAddress) -> Self {
        let mut e = Self::new().with_present(true).with_writable(true);
        e.set_physical_address(next);
        e
    }

    /// Kernel data leaf: present, writable, never executable.
    #[inline]
    #[must_use]
    pub const fn kernel_data(pa: PhysicalAddress) -> Self {
        let mut e = Self::new()
            .with_present(true)
            .with_writable(true)
            .with_no_execute(true);
        e.set_physical_address(pa);
        e
    }

    /// Kernel code/data leaf with execution allowed.
    #[inline]
    #[must_use]
    pub const fn kernel_code(pa: PhysicalAddress) -> Self {
        let mut e = Self::new().with_present(true).with_writable(true);
        e.set_physical_address(pa);
        e
    }

    /// Read-only, non-executable leaf (firmware/ACPI window).
    #[inline]
    #[must_use]
    pub const fn kernel_ro(pa: PhysicalAddress) -> Self {
        let mut e = Self::new().with_present(true).with_no_execute(true);
        e.set_physical_address(pa);
        e
    }

    /// Device-memory leaf: uncached, write-through, never executable.
    #[inline]
    #[must_use]
    pub const fn mmio(pa: PhysicalAddress) -> Self {
        let mut e = Self::new()
            .with_present(true)
            .with_writable(true)
            .with_write_through(true)
            .with_cache_disabled(true)
            .with_no_execute(true);
        e.set_physical_address(pa);
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips() {
        let pa = PhysicalAddress::new(0x0000_0001_2345_6000);
        let e = PageEntry::kernel_data(pa);
        assert!(e.present());
        assert!(e.writable());
        assert!(e.no_execute());
        assert!(!e.large_page());
        assert_eq!(e.physical_address(), pa);
    }

    #[test]
    fn mmio_disables_caching() {
        let e = PageEntry::mmio(PhysicalAddress::new(0xFEE0_0000));
        assert!(e.cache_disabled());
        assert!(e.write_through());
        assert!(e.no_execute());
    }

    #[test]
    fn nonleaf_is_plain_link() {
        let e = PageEntry::nonleaf(PhysicalAddress::new(0x5000));
        assert!(e.present());
        assert!(e.writable());
        assert!(!e.no_execute());
        assert_eq!(e.physical_address().as_u64(), 0x5000);
    }
}
