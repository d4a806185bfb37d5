//! Error kinds produced by the core, plus the HAL statuses that feed into them.
//!
//! Propagation policy (spec Sec 7): benign ECC statuses are converted to
//! success at the NSSM layer; everything else propagates unchanged. The
//! data-drive facade is the only layer that attaches logging context.

use core::fmt;

/// Errors the core itself can produce. HAL-reported faults (`WRITE_FAILED`,
/// `ERASE_FAILED`) are folded in here once they've been handled by
/// `handle_new_bad_block` and need to surface past that point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    NotInitialized,
    AlreadyInitialized,
    SectorOutOfBounds,
    /// No physical block for a virtual address. Expected on cold reads, not a fault.
    InvalidPhyAddr,
    LbaOutOfBounds,
    LbaCorrupted,
    /// Metadata LSI is larger than the block can hold.
    SectorIdxOutOfRange,
    /// Two pages of a rebuilt block disagree on LBA.
    LbasInconsistent,
    /// Every NSSM in the pool is referenced; none can be evicted.
    CantRecycleSectorMap,
    /// Allocation exhausted under the current constraints.
    PhyMapFull,
    /// The reserved-range scan didn't find a block carrying the requested signature.
    FindLbaMapBlockFailed,
    OutOfMemory,
    /// A HAL write returned `WRITE_FAILED` and recovery did not succeed either.
    WriteFailed,
    /// A HAL erase returned `ERASE_FAILED`.
    EraseFailed,
    /// A HAL read returned `ECC_FIX_FAILED` (uncorrectable).
    EccFixFailed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotInitialized => write!(f, "mapper not initialized"),
            Error::AlreadyInitialized => write!(f, "mapper already initialized"),
            Error::SectorOutOfBounds => write!(f, "sector out of bounds"),
            Error::InvalidPhyAddr => write!(f, "no physical block for this virtual address"),
            Error::LbaOutOfBounds => write!(f, "LBA out of bounds"),
            Error::LbaCorrupted => write!(f, "LBA corrupted"),
            Error::SectorIdxOutOfRange => write!(f, "logical sector index out of range"),
            Error::LbasInconsistent => write!(f, "inconsistent LBAs within one virtual block"),
            Error::CantRecycleSectorMap => write!(f, "no NSSM available for recycling"),
            Error::PhyMapFull => write!(f, "no free block satisfies the allocation constraints"),
            Error::FindLbaMapBlockFailed => write!(f, "could not locate a persistent map block"),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::WriteFailed => write!(f, "page write failed"),
            Error::EraseFailed => write!(f, "block erase failed"),
            Error::EccFixFailed => write!(f, "uncorrectable ECC error"),
        }
    }
}

/// Outcome of a HAL page read, mirroring the ECC status shape in spec Sec 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EccStatus {
    Success,
    /// Data valid, bit errors were corrected. Treated as success.
    Fixed,
    /// Data valid but the sector should be rewritten soon; schedules a relocate task.
    FixedRewriteSector,
    /// Uncorrectable. The caller sees [`Error::EccFixFailed`].
    FixFailed,
}

impl EccStatus {
    pub fn is_ok_for_caller(self) -> bool {
        !matches!(self, EccStatus::FixFailed)
    }

    pub fn needs_relocate(self) -> bool {
        matches!(self, EccStatus::FixedRewriteSector)
    }
}

/// Outcome of a HAL page write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Success,
    /// The block is now bad; caller must route through `handle_new_bad_block`.
    WriteFailed,
}

/// Outcome of a HAL block erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseStatus {
    Success,
    /// The block is now bad; caller must route through `handle_new_bad_block`.
    EraseFailed,
}
