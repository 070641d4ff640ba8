use bitfield_struct::bitfield;
use tephra_addr::PhysicalAddress;

/// CR3 — the PML4 base register (IA-32e paging, PCID disabled).
///
/// Bits 12..=51 hold the physical base of the root table; PWT/PCD control
/// caching of the walk through it.
#[bitfield(u64)]
pub struct Cr3 {
    #[bits(3)]
    reserved0: u8,

    /// Write-through caching for PML4 accesses.
    pub pwt: bool,

    /// Cache disable for PML4 accesses.
    pub pcd: bool,

    #[bits(7)]
    reserved1: u8,

    /// PML4 physical base >> 12.
    #[bits(40)]
    pml4_base_4k: u64,

    #[bits(12)]
    reserved2: u16,
}

impl Cr3 {
    /// Build a CR3 value for a 4 KiB-aligned PML4 base with default caching.
    #[must_use]
    pub fn from_pml4_phys(pml4: PhysicalAddress) -> Self {
        debug_assert!(pml4.is_page_aligned(), "PML4 base must be 4K-aligned");
        Self::new().with_pml4_base_4k(pml4.as_u64() >> 12)
    }

    /// The physical base of the PML4.
    #[must_use]
    pub const fn pml4_phys(self) -> PhysicalAddress {
        PhysicalAddress::new(self.pml4_base_4k() << 12)
    }

    /// Read the live register.
    ///
    /// # Safety
    /// CPL0 with paging enabled.
    #[cfg(target_arch = "x86_64")]
    #[must_use]
    pub unsafe fn load() -> Self {
        let raw: u64;
        // SAFETY: plain register read, no memory effects.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) raw, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(raw)
    }

    /// Write the live register, switching the active address space and
    /// flushing non-global TLB entries.
    ///
    /// # Safety
    /// CPL0; the referenced tables must map the executing code and stack.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn store(self) {
        // SAFETY: caller guarantees the new tables are consistent.
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) self.into_bits(), options(nostack, preserves_flags));
        }
    }
}
