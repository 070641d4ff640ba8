/// Boolean CPU capability answers the rest of the kernel asks for.
///
/// Collected once via `cpuid`; callers never issue `cpuid` themselves.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CpuFeatures {
    /// Execute-disable page protection (`EFER.NXE` usable).
    pub nx: bool,
    /// 1 GiB leaf pages at the PDPT level.
    pub pdpe1gb: bool,
    /// x2APIC operating mode.
    pub x2apic: bool,
}

impl CpuFeatures {
    /// Query the running CPU.
    #[must_use]
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            use core::arch::x86_64::__cpuid;

            // SAFETY: `cpuid` is available on every x86-64 CPU.
            let basic = unsafe { __cpuid(1) };
            let max_ext = unsafe { __cpuid(0x8000_0000) }.eax;
            let (ext_edx, _) = if max_ext >= 0x8000_0001 {
                let l = unsafe { __cpuid(0x8000_0001) };
                (l.edx, l.ecx)
            } else {
                (0, 0)
            };

            Self {
                nx: ext_edx & (1 << 20) != 0,
                pdpe1gb: ext_edx & (1 << 26) != 0,
                x2apic: basic.ecx & (1 << 21) != 0,
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_does_not_fault() {
        // The answers are machine-dependent; this only pins that the query
        // itself is well-formed.
        let _ = CpuFeatures::detect();
    }
}
