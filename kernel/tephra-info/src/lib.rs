//! # Machine Handoff Information
//!
//! The contract between the UEFI loader and the kernel: a single
//! [`MachineInfo`](machine::MachineInfo) blob built before `ExitBootServices`
//! and consumed exactly once by memory-manager bring-up, plus the fixed
//! kernel virtual-address [`layout`].
//!
//! Firmware memory types are the `uefi` crate's own: the loader copies the
//! raw descriptor buffer out of the firmware and the kernel walks it with
//! the descriptor stride the firmware reported (the stride is *not*
//! `size_of::<MemoryDescriptor>()` on real machines).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod layout;
pub mod machine;

pub use machine::{
    AcpiTables, FirmwareMemoryMap, FramebufferInfo, MachineInfo, MemorySpace, SPACE_AP_TRAMPOLINE,
    SPACE_KERNEL, SPACE_KERNEL_IMAGE, SPACE_LOADER_IMAGE,
};

/// Firmware memory map vocabulary, re-exported for the PFN database.
pub use uefi::mem::memory_map::{MemoryAttribute, MemoryDescriptor, MemoryType};
