//! # Synchronization primitives
//!
//! The only cross-core coordination this kernel uses: a TATAS spin lock and a
//! one-shot initialization cell. Critical sections are expected to be short
//! and allocation-free; the lock does not mask interrupts.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;
mod sync_once_cell;

pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
