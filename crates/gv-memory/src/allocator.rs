//! Virtual address space allocator
//!
//! Carves non-overlapping ranges out of `[va_start, va_limit)`. Allocation
//! first bumps a linear high-water mark; once that runs into the limit (or
//! into a fixed allocation) it falls back to a first-fit scan over the block
//! list, which also finds ranges released by [`FlatAllocator::free`].

use gv_core::error::MemoryError;
use gv_core::{alloc_debug, alloc_trace};
use parking_lot::Mutex;

use crate::address::VirtualAddress;
use crate::map::{FlatAddressSpaceMap, MapGuard};

/// Allocator over an address space of `BITS` bits
pub struct FlatAllocator<Va, const BITS: u32> {
    map: FlatAddressSpaceMap<Va, bool, (), BITS>,
    /// End of the linear allocation pass, only touched with the block lock held
    current_linear_alloc_end: Mutex<Va>,
    va_start: Va,
}

impl<Va: VirtualAddress, const BITS: u32> FlatAllocator<Va, BITS> {
    /// Create an allocator handing out addresses in `[va_start, va_limit)`
    pub fn new(va_start: Va, va_limit: Va) -> Result<Self, MemoryError> {
        if va_start >= va_limit {
            return Err(MemoryError::InvalidRange {
                virt: va_start.to_u64(),
                size: 0,
                limit: va_limit.to_u64(),
            });
        }

        Ok(Self {
            map: FlatAddressSpaceMap::new(va_limit)?,
            current_linear_alloc_end: Mutex::new(va_start),
            va_start,
        })
    }

    /// Lowest address the allocator hands out
    pub fn va_start(&self) -> Va {
        self.va_start
    }

    pub fn va_limit(&self) -> Va {
        self.map.va_limit()
    }

    /// Whether `virt` lies in an allocated range
    pub fn is_allocated(&self, virt: Va) -> bool {
        self.map.lookup(virt).is_mapped()
    }

    /// First free run of at least `size` inside `[va_start, va_limit)`
    fn first_fit(&self, guard: &MapGuard<'_, Va, bool, (), BITS>, size: Va) -> Option<Va> {
        let blocks = guard.blocks().blocks();
        let limit = self.va_limit();

        blocks.iter().enumerate().find_map(|(index, block)| {
            if block.is_mapped() {
                return None;
            }

            let start = std::cmp::max(block.virt, self.va_start);
            let end = blocks
                .get(index + 1)
                .map_or(limit, |next| std::cmp::min(next.virt, limit));

            (end > start && end - start >= size).then_some(start)
        })
    }

    /// Allocate `size` units, returning the start of the range
    pub fn allocate(&self, size: Va) -> Result<Va, MemoryError> {
        let mut guard = self.map.lock();
        let mut linear_end = self.current_linear_alloc_end.lock();

        let start = *linear_end;
        let linear = match start.checked_add(size) {
            Some(end) if size != Va::ZERO && end <= self.va_limit() => {
                guard.blocks().is_free(start, size).then_some(start)
            }
            _ => None,
        };

        let start = match linear {
            Some(start) => {
                *linear_end = start + size;
                start
            }
            None => {
                guard.check_range(self.va_start, size)?;
                alloc_debug!("Linear allocation of 0x{:X} exhausted, scanning for a gap", size);
                self.first_fit(&guard, size)
                    .ok_or(MemoryError::OutOfSpace(size.to_u64()))?
            }
        };

        guard.map(start, true, size, ())?;
        alloc_trace!("Allocated 0x{:X} + 0x{:X}", start, size);
        Ok(start)
    }

    /// Mark a caller-chosen range as allocated, it must currently be free
    pub fn allocate_fixed(&self, virt: Va, size: Va) -> Result<(), MemoryError> {
        let mut guard = self.map.lock();
        guard.check_range(virt, size)?;

        if virt < self.va_start {
            return Err(MemoryError::InvalidRange {
                virt: virt.to_u64(),
                size: size.to_u64(),
                limit: self.va_limit().to_u64(),
            });
        }

        if !guard.blocks().is_free(virt, size) {
            return Err(MemoryError::OverlapViolation {
                virt: virt.to_u64(),
                size: size.to_u64(),
            });
        }

        guard.map(virt, true, size, ())?;
        alloc_trace!("Allocated fixed 0x{:X} + 0x{:X}", virt, size);
        Ok(())
    }

    /// Return a range to the free pool
    pub fn free(&self, virt: Va, size: Va) -> Result<(), MemoryError> {
        self.map.unmap(virt, size)?;
        alloc_trace!("Freed 0x{:X} + 0x{:X}", virt, size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Allocator16 = FlatAllocator<u16, 16>;

    fn overlaps(a: (u16, u16), b: (u16, u16)) -> bool {
        a.0 < b.0 + b.1 && b.0 < a.0 + a.1
    }

    #[test]
    fn test_linear_allocation() {
        let alloc = Allocator16::new(0x100, 0x1000).unwrap();
        assert_eq!(alloc.allocate(0x10).unwrap(), 0x100);
        assert_eq!(alloc.allocate(0x20).unwrap(), 0x110);
        assert_eq!(alloc.allocate(0x10).unwrap(), 0x130);
        assert!(alloc.is_allocated(0x12F));
        assert!(!alloc.is_allocated(0x140));
    }

    #[test]
    fn test_no_double_allocation() {
        let alloc = Allocator16::new(0, 0x400).unwrap();
        let mut live = Vec::new();
        for size in [0x10, 0x33, 0x7, 0x100, 0x21] {
            let start = alloc.allocate(size).unwrap();
            for &other in &live {
                assert!(!overlaps((start, size), other));
            }
            live.push((start, size));
        }
    }

    #[test]
    fn test_allocation_at_limit() {
        let alloc = Allocator16::new(0, 0x100).unwrap();
        assert_eq!(alloc.allocate(0xF0).unwrap(), 0);
        assert_eq!(alloc.allocate(0x10).unwrap(), 0xF0);
        assert_eq!(alloc.allocate(0x1), Err(MemoryError::OutOfSpace(1)));
    }

    #[test]
    fn test_oversized_allocation_is_invalid() {
        let alloc = Allocator16::new(0x10, 0x100).unwrap();
        assert!(matches!(alloc.allocate(0x200), Err(MemoryError::InvalidRange { .. })));
        assert!(matches!(alloc.allocate(0), Err(MemoryError::InvalidRange { .. })));
    }

    #[test]
    fn test_reuse_after_free() {
        let alloc = Allocator16::new(0, 0x100).unwrap();
        let a = alloc.allocate(0x40).unwrap();
        let b = alloc.allocate(0x40).unwrap();
        let c = alloc.allocate(0x40).unwrap();
        let d = alloc.allocate(0x40).unwrap();
        assert_eq!((a, b, c, d), (0, 0x40, 0x80, 0xC0));

        alloc.free(b, 0x40).unwrap();

        // The linear pass is out of room, so the gap left by `b` is found
        assert_eq!(alloc.allocate(0x40).unwrap(), 0x40);
        assert_eq!(alloc.allocate(0x40), Err(MemoryError::OutOfSpace(0x40)));

        alloc.free(a, 0x40).unwrap();
        assert_eq!(alloc.allocate(0x20).unwrap(), 0);
        assert_eq!(alloc.allocate(0x20).unwrap(), 0x20);
    }

    #[test]
    fn test_first_fit_skips_small_gaps() {
        let alloc = Allocator16::new(0, 0x100).unwrap();
        let starts: Vec<u16> = (0..8).map(|_| alloc.allocate(0x20).unwrap()).collect();
        assert_eq!(alloc.allocate(0x1), Err(MemoryError::OutOfSpace(1)));

        alloc.free(starts[1], 0x20).unwrap();
        alloc.free(starts[4], 0x20).unwrap();
        alloc.free(starts[5], 0x20).unwrap();

        // Only the merged gap at 0x80 can hold 0x40
        assert_eq!(alloc.allocate(0x40).unwrap(), 0x80);
        assert_eq!(alloc.allocate(0x20).unwrap(), 0x20);
        assert_eq!(alloc.allocate(0x20), Err(MemoryError::OutOfSpace(0x20)));
    }

    #[test]
    fn test_allocate_fixed() {
        let alloc = Allocator16::new(0x100, 0x1000).unwrap();
        alloc.allocate_fixed(0x200, 0x100).unwrap();

        assert_eq!(
            alloc.allocate_fixed(0x280, 0x100),
            Err(MemoryError::OverlapViolation { virt: 0x280, size: 0x100 })
        );
        assert!(matches!(alloc.allocate_fixed(0x80, 0x10), Err(MemoryError::InvalidRange { .. })));
        assert!(matches!(alloc.allocate_fixed(0xFF0, 0x20), Err(MemoryError::InvalidRange { .. })));

        alloc.free(0x200, 0x100).unwrap();
        alloc.allocate_fixed(0x280, 0x100).unwrap();
    }

    #[test]
    fn test_linear_pass_steps_around_fixed_allocation() {
        let alloc = Allocator16::new(0, 0x100).unwrap();
        alloc.allocate_fixed(0x10, 0x10).unwrap();

        // The linear candidate [0, 0x20) collides with the fixed range
        let start = alloc.allocate(0x20).unwrap();
        assert_eq!(start, 0x20);
        assert!(!overlaps((start, 0x20), (0x10, 0x10)));

        assert_eq!(alloc.allocate(0x10).unwrap(), 0);
    }

    #[test]
    fn test_invalid_window() {
        assert!(Allocator16::new(0x100, 0x100).is_err());
        assert!(FlatAllocator::<u32, 20>::new(0, 0x20_0000).is_err());
    }
}
