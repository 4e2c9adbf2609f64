//! GMMU memory map constants

/// Number of VA bits the GMMU translates
pub const GMMU_ADDRESS_SPACE_BITS: u32 = 40;

/// Small page size (4 KB)
pub const SMALL_PAGE_SIZE: u32 = 0x1000;
/// log2 of the small page size
pub const SMALL_PAGE_SIZE_BITS: u32 = 12;

/// Mask of all supported big page sizes (64 KB and 128 KB)
pub const SUPPORTED_BIG_PAGE_SIZES: u32 = 0x3_0000;

/// Page allocators track page numbers in a 32-bit space
pub const PAGE_ALLOCATOR_BITS: u32 = 32;
