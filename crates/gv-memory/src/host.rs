//! Host memory registry
//!
//! GPU mappings never hold raw host pointers. A caller registers a host
//! allocation here and maps `(region, offset)` handles instead; accesses go
//! back through the registry, so a region that was unregistered while still
//! mapped faults with `UnknownRegion` rather than touching freed memory.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use gv_core::error::MemoryError;
use parking_lot::RwLock;

/// Identifier of a registered host region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u32);

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A byte position inside a registered host region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostAddress {
    pub region: RegionId,
    pub offset: u64,
}

impl HostAddress {
    pub const fn new(region: RegionId, offset: u64) -> Self {
        Self { region, offset }
    }

    /// The address `offset` bytes further into the same region
    #[inline]
    pub const fn offset_by(self, offset: u64) -> Self {
        Self {
            region: self.region,
            offset: self.offset + offset,
        }
    }
}

/// A host allocation owned by the registry
pub struct HostRegion {
    id: RegionId,
    data: RwLock<Box<[u8]>>,
}

impl HostRegion {
    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn len(&self) -> u64 {
        self.data.read().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bounds(&self, len_total: usize, offset: u64, len: usize) -> Result<std::ops::Range<usize>, MemoryError> {
        let out_of_bounds = || MemoryError::HostOutOfBounds {
            region: self.id.0,
            offset,
            len: len as u64,
        };

        let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
        let end = start.checked_add(len).ok_or_else(out_of_bounds)?;
        if end > len_total {
            return Err(out_of_bounds());
        }
        Ok(start..end)
    }

    /// Check that `[offset, offset + len)` lies inside the region
    pub fn check(&self, offset: u64, len: u64) -> Result<(), MemoryError> {
        let len = usize::try_from(len).map_err(|_| MemoryError::HostOutOfBounds {
            region: self.id.0,
            offset,
            len,
        })?;
        let total = self.data.read().len();
        self.bounds(total, offset, len).map(|_| ())
    }

    /// Copy bytes starting at `offset` into `destination`
    pub fn read(&self, offset: u64, destination: &mut [u8]) -> Result<(), MemoryError> {
        let data = self.data.read();
        let range = self.bounds(data.len(), offset, destination.len())?;
        destination.copy_from_slice(&data[range]);
        Ok(())
    }

    /// Copy `source` into the region starting at `offset`
    pub fn write(&self, offset: u64, source: &[u8]) -> Result<(), MemoryError> {
        let mut data = self.data.write();
        let range = self.bounds(data.len(), offset, source.len())?;
        data[range].copy_from_slice(source);
        Ok(())
    }

    /// Fill `len` bytes at `offset` with `value`
    pub fn fill(&self, offset: u64, len: usize, value: u8) -> Result<(), MemoryError> {
        let mut data = self.data.write();
        let range = self.bounds(data.len(), offset, len)?;
        data[range].fill(value);
        Ok(())
    }

    /// Run `f` over a shared view of `[offset, offset + len)`
    pub fn with_slice<R>(&self, offset: u64, len: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R, MemoryError> {
        let data = self.data.read();
        let range = self.bounds(data.len(), offset, len)?;
        Ok(f(&data[range]))
    }

    fn copy_within(&self, src: u64, dst: u64, len: usize) -> Result<(), MemoryError> {
        let mut data = self.data.write();
        let src_range = self.bounds(data.len(), src, len)?;
        let dst_range = self.bounds(data.len(), dst, len)?;
        data.copy_within(src_range, dst_range.start);
        Ok(())
    }
}

impl fmt::Debug for HostRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRegion")
            .field("id", &self.id)
            .field("len", &self.len())
            .finish()
    }
}

/// Registry of host allocations that GPU mappings may point into
#[derive(Default)]
pub struct HostMemory {
    regions: RwLock<HashMap<RegionId, Arc<HostRegion>>>,
    next_id: AtomicU32,
}

impl HostMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an existing buffer, returning the address of its first byte
    pub fn register(&self, data: Vec<u8>) -> HostAddress {
        let id = RegionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let len = data.len();
        let region = Arc::new(HostRegion {
            id,
            data: RwLock::new(data.into_boxed_slice()),
        });

        self.regions.write().insert(id, region);
        tracing::debug!("Registered host region {} ({} bytes)", id, len);
        HostAddress::new(id, 0)
    }

    /// Register a zero-filled region of `size` bytes
    pub fn allocate(&self, size: usize) -> HostAddress {
        self.register(vec![0; size])
    }

    /// Remove a region from the registry
    ///
    /// Mappings that still point into it fault on access from now on.
    pub fn unregister(&self, id: RegionId) -> Option<Arc<HostRegion>> {
        let region = self.regions.write().remove(&id);
        if region.is_some() {
            tracing::debug!("Unregistered host region {}", id);
        }
        region
    }

    pub fn region(&self, id: RegionId) -> Result<Arc<HostRegion>, MemoryError> {
        self.regions
            .read()
            .get(&id)
            .cloned()
            .ok_or(MemoryError::UnknownRegion(id.0))
    }

    /// Check that `len` bytes at `address` are inside a registered region
    pub fn check(&self, address: HostAddress, len: u64) -> Result<(), MemoryError> {
        self.region(address.region)?.check(address.offset, len)
    }

    pub fn read(&self, address: HostAddress, destination: &mut [u8]) -> Result<(), MemoryError> {
        self.region(address.region)?.read(address.offset, destination)
    }

    pub fn write(&self, address: HostAddress, source: &[u8]) -> Result<(), MemoryError> {
        self.region(address.region)?.write(address.offset, source)
    }

    /// Copy `len` bytes between two host addresses, which may share a region
    pub fn copy(&self, dst: HostAddress, src: HostAddress, len: usize) -> Result<(), MemoryError> {
        if dst.region == src.region {
            return self.region(src.region)?.copy_within(src.offset, dst.offset, len);
        }

        // Bounce through a buffer so two region locks are never held at once
        let mut bounce = vec![0u8; len];
        self.region(src.region)?.read(src.offset, &mut bounce)?;
        self.region(dst.region)?.write(dst.offset, &bounce)
    }
}
