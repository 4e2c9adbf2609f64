//! Mapping flags carried by GMMU blocks

use bitflags::bitflags;

bitflags! {
    /// Caller-defined attributes of a GMMU mapping
    ///
    /// The map stores these opaquely alongside each block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MappingFlags: u32 {
        /// Mapped but not host resident, reads as zero and discards writes
        const SPARSE   = 0b001;
        /// Placed at a caller-chosen address
        const FIXED    = 0b010;
        /// Backed by the big page allocator
        const BIG_PAGE = 0b100;
    }
}

impl Default for MappingFlags {
    fn default() -> Self {
        Self::empty()
    }
}
