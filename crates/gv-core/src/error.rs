//! Error types for gpuvas

use thiserror::Error;

/// Main error type
#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("VM error: {0}")]
    Vm(#[from] VmError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Address space map errors
///
/// Addresses are widened to `u64` regardless of the VA width of the map that
/// produced them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Invalid range: 0x{virt:X} + 0x{size:X} (VA limit 0x{limit:X})")]
    InvalidRange { virt: u64, size: u64, limit: u64 },

    #[error("Unmapped access at 0x{0:X}")]
    UnmappedAccess(u64),

    #[error("Out of address space: no free region of size 0x{0:X}")]
    OutOfSpace(u64),

    #[error("Overlap violation: 0x{virt:X} + 0x{size:X} intersects an allocated region")]
    OverlapViolation { virt: u64, size: u64 },

    #[error("Range 0x{virt:X} + 0x{size:X} is split across {spans} host spans")]
    SplitRange { virt: u64, size: u64, spans: usize },

    #[error("Unknown host region: {0}")]
    UnknownRegion(u32),

    #[error("Host access out of bounds: region {region}, offset 0x{offset:X}, length 0x{len:X}")]
    HostOutOfBounds { region: u32, offset: u64, len: u64 },
}

/// GPU virtual memory context errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("Invalid page size: 0x{0:X}")]
    InvalidPageSize(u32),

    #[error("Invalid big page size: 0x{0:X}")]
    InvalidBigPageSize(u32),

    #[error("Sparse allocations require big pages")]
    SparseRequiresBigPages,

    #[error("No allocation at 0x{0:X}")]
    UnknownAllocation(u64),

    #[error("Allocation at 0x{offset:X} does not match 0x{pages:X} pages of size 0x{page_size:X}")]
    AllocationMismatch { offset: u64, pages: u32, page_size: u32 },

    #[error("No mapping at 0x{0:X}")]
    UnknownMapping(u64),

    #[error("Region 0x{offset:X} + 0x{size:X} is not inside an allocation")]
    UnallocatedRegion { offset: u64, size: u64 },

    #[error("Cannot remap a non-sparse region at 0x{0:X}")]
    NotSparse(u64),

    #[error("Remap of 0x{size:X} bytes exceeds mapping of 0x{mapped:X} bytes at 0x{offset:X}")]
    RemapTooLarge { offset: u64, size: u64, mapped: u64 },

    #[error("Invalid buffer alignment: 0x{0:X}")]
    InvalidAlignment(u32),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, EmulatorError>;
