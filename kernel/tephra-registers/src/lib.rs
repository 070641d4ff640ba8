//! # CPU register access
//!
//! The thin hardware surface the memory manager needs: CR3 for activating an
//! address space, `rdtsc` as an entropy source, raw MSR access, and boolean
//! CPU capability queries. Everything privileged is `unsafe` and only
//! meaningful at CPL0 on x86-64; the non-asm fallbacks exist so the crate
//! builds (and the rest of the stack unit-tests) on hosted targets.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod cpuid;
mod cr3;
mod msr;

pub use cpuid::CpuFeatures;
pub use cr3::Cr3;
pub use msr::rdtsc;
#[cfg(target_arch = "x86_64")]
pub use msr::{rdmsr, wrmsr};
