//! Generic flat VA -> backing map guarded by a single mutex

use gv_core::error::MemoryError;
use parking_lot::{Mutex, MutexGuard};

use crate::address::{va_maximum, Backing, VirtualAddress};
use crate::block::{Block, BlockList};

/// Called with `(virt, size)` after a region's mappings changed
pub type UnmapCallback<Va> = Box<dyn Fn(Va, Va) + Send + Sync>;

/// Check `[virt, virt + size)` is non-empty and ends at or below `limit`
pub(crate) fn check_range<Va: VirtualAddress>(virt: Va, size: Va, limit: Va) -> Result<Va, MemoryError> {
    let invalid = || MemoryError::InvalidRange {
        virt: virt.to_u64(),
        size: size.to_u64(),
        limit: limit.to_u64(),
    };

    if size == Va::ZERO {
        return Err(invalid());
    }

    match virt.checked_add(size) {
        Some(end) if end <= limit => Ok(end),
        _ => Err(invalid()),
    }
}

/// Flat address space map
///
/// Maps an address space of `BITS` bits with VA type `Va` onto backing values
/// of type `Pa`, tagging each run with a caller-defined `X`. Lookups are a
/// binary search over the sorted block list, Map and Unmap splice the list.
/// All mutation and traversal happens with the block lock held; [`lock`]
/// exposes the locked operations so composite sequences run in one critical
/// section.
///
/// [`lock`]: FlatAddressSpaceMap::lock
pub struct FlatAddressSpaceMap<Va, Pa, X, const BITS: u32> {
    blocks: Mutex<BlockList<Va, Pa, X>>,
    va_limit: Va,
    unmap_callback: Option<UnmapCallback<Va>>,
}

impl<Va, Pa, X, const BITS: u32> FlatAddressSpaceMap<Va, Pa, X, BITS>
where
    Va: VirtualAddress,
    Pa: Backing,
    X: Copy + Default,
{
    const BITS_VALID: () = assert!(
        BITS > 0 && BITS <= Va::WIDTH,
        "address space bits must fit in the VA type"
    );

    /// The maximum VA this address space can technically reach
    pub fn va_maximum() -> Va {
        let () = Self::BITS_VALID;
        // BITS <= Va::WIDTH, so this always fits
        Va::from_u64(va_maximum(BITS)).unwrap_or(Va::ZERO)
    }

    /// Create a map with a soft VA limit
    pub fn new(va_limit: Va) -> Result<Self, MemoryError> {
        Self::build(va_limit, None)
    }

    /// Create a map that reports every changed region to `callback`
    pub fn with_unmap_callback(
        va_limit: Va,
        callback: impl Fn(Va, Va) + Send + Sync + 'static,
    ) -> Result<Self, MemoryError> {
        Self::build(va_limit, Some(Box::new(callback)))
    }

    fn build(va_limit: Va, unmap_callback: Option<UnmapCallback<Va>>) -> Result<Self, MemoryError> {
        if va_limit > Self::va_maximum() {
            return Err(MemoryError::InvalidRange {
                virt: 0,
                size: va_limit.to_u64(),
                limit: Self::va_maximum().to_u64(),
            });
        }

        Ok(Self {
            blocks: Mutex::new(BlockList::new()),
            va_limit,
            unmap_callback,
        })
    }

    /// Soft limit on the highest VA of the map
    pub fn va_limit(&self) -> Va {
        self.va_limit
    }

    /// Lock the block list for a sequence of operations
    pub fn lock(&self) -> MapGuard<'_, Va, Pa, X, BITS> {
        MapGuard {
            blocks: self.blocks.lock(),
            map: self,
        }
    }

    /// Map `[virt, virt + size)` linearly onto `phys`
    pub fn map(&self, virt: Va, phys: Pa, size: Va, extra: X) -> Result<(), MemoryError> {
        self.lock().map(virt, phys, size, extra)
    }

    /// Unmap `[virt, virt + size)`
    pub fn unmap(&self, virt: Va, size: Va) -> Result<(), MemoryError> {
        self.lock().unmap(virt, size)
    }

    /// Copy of the current block list
    pub fn blocks(&self) -> Vec<Block<Va, Pa, X>> {
        self.blocks.lock().blocks().to_vec()
    }

    /// The block covering `virt`
    pub fn lookup(&self, virt: Va) -> Block<Va, Pa, X> {
        *self.blocks.lock().lookup(virt).0
    }

    fn notify(&self, virt: Va, size: Va) {
        if let Some(callback) = &self.unmap_callback {
            callback(virt, size);
        }
    }
}

impl<Va, Pa, X, const BITS: u32> Default for FlatAddressSpaceMap<Va, Pa, X, BITS>
where
    Va: VirtualAddress,
    Pa: Backing,
    X: Copy + Default,
{
    fn default() -> Self {
        Self {
            blocks: Mutex::new(BlockList::new()),
            va_limit: Self::va_maximum(),
            unmap_callback: None,
        }
    }
}

/// Exclusive access to a map's block list
pub struct MapGuard<'a, Va, Pa, X, const BITS: u32> {
    blocks: MutexGuard<'a, BlockList<Va, Pa, X>>,
    map: &'a FlatAddressSpaceMap<Va, Pa, X, BITS>,
}

impl<Va, Pa, X, const BITS: u32> MapGuard<'_, Va, Pa, X, BITS>
where
    Va: VirtualAddress,
    Pa: Backing,
    X: Copy + Default,
{
    pub fn va_limit(&self) -> Va {
        self.map.va_limit
    }

    pub fn blocks(&self) -> &BlockList<Va, Pa, X> {
        &self.blocks
    }

    /// Validate `[virt, virt + size)` against the VA limit, returning its end
    pub fn check_range(&self, virt: Va, size: Va) -> Result<Va, MemoryError> {
        check_range(virt, size, self.map.va_limit)
    }

    /// Map `[virt, virt + size)` linearly onto `phys`
    ///
    /// Mapping the `UNMAPPED` backing value is an unmap.
    pub fn map(&mut self, virt: Va, phys: Pa, size: Va, extra: X) -> Result<(), MemoryError> {
        if !phys.is_mapped() {
            return self.unmap(virt, size);
        }

        let end = self.check_range(virt, size)?;
        self.blocks.splice(virt, end, phys, extra);
        self.map.notify(virt, size);
        Ok(())
    }

    /// Unmap `[virt, virt + size)`, merging with adjacent unmapped runs
    pub fn unmap(&mut self, virt: Va, size: Va) -> Result<(), MemoryError> {
        let end = self.check_range(virt, size)?;
        self.blocks.splice_unmapped(virt, end);
        self.map.notify(virt, size);
        Ok(())
    }
}
