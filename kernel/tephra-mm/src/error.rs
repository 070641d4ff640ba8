use thiserror::Error;

/// Recoverable allocator failures.
///
/// Everything else this subsystem can hit — list corruption, double frees,
/// bootstrap exhaustion — is a consistency violation and panics instead.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum MmError {
    /// The page-granular allocator has no run large enough.
    #[error("no more free memory")]
    NoMoreFreeMemory,

    /// A tagged allocation could not be recorded; the allocation was rolled
    /// back before this was reported.
    #[error("allocation tag tracking failed")]
    TagTracking,
}
