//! GPU virtual memory context
//!
//! Owns one GMMU and the two page allocators that carve up its VA range:
//! small pages below the VA split, big pages above it. Space is first
//! reserved with [`GpuVm::alloc_space`] (or implicitly by a non-fixed
//! [`GpuVm::map_buffer`]) and then backed by host buffers.

use std::collections::BTreeMap;
use std::sync::Arc;

use bitflags::bitflags;
use gv_core::config::VmConfig;
use gv_core::error::{MemoryError, VmError};
use gv_memory::address::va_maximum;
use gv_memory::constants::*;
use gv_memory::{FlatAllocator, GpuMemoryManager, HostAddress, HostMemory, MappingFlags};
use parking_lot::Mutex;

/// Page-number allocator used for both page sizes
pub type PageAllocator = FlatAllocator<u32, PAGE_ALLOCATOR_BITS>;

bitflags! {
    /// Flags accepted by [`GpuVm::alloc_space`] and [`GpuVm::map_buffer`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AsFlags: u32 {
        /// Use the caller-provided offset
        const FIXED  = 1 << 0;
        /// Back the allocation with the sparse placeholder
        const SPARSE = 1 << 1;
        /// Re-point part of an existing mapping
        const REMAP  = 1 << 8;
    }
}

/// A host buffer that can be mapped into the GPU address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandle {
    pub address: HostAddress,
    pub size: u64,
    pub align: u32,
}

/// One allocator window of the address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaRegion {
    pub offset: u64,
    pub page_size: u32,
    pub pages: u64,
}

/// A big-page remap request inside a sparse allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapEntry {
    /// Buffer to map, `None` returns the range to sparse
    pub handle: Option<BufferHandle>,
    pub handle_offset_big_pages: u32,
    pub as_offset_big_pages: u32,
    pub big_pages: u32,
}

#[derive(Debug, Clone, Copy)]
struct Mapping {
    address: HostAddress,
    /// Bytes mapped in the GMMU, page aligned for allocated mappings
    size: u64,
    fixed: bool,
    big_page: bool,
    sparse_alloc: bool,
}

#[derive(Debug, Clone)]
struct Allocation {
    size: u64,
    mappings: Vec<u64>,
    page_size: u32,
    sparse: bool,
}

#[derive(Debug, Default)]
struct VmState {
    mappings: BTreeMap<u64, Mapping>,
    allocations: BTreeMap<u64, Allocation>,
}

impl VmState {
    /// Offset of the allocation wholly containing `[offset, offset + size)`
    fn allocation_containing(&self, offset: u64, size: u64) -> Option<u64> {
        let (&start, allocation) = self.allocations.range(..=offset).next_back()?;
        ((offset - start).checked_add(size)? <= allocation.size).then_some(start)
    }

    /// Drop `offset` from the mapping list of every allocation
    fn forget_mapping(&mut self, offset: u64) {
        for allocation in self.allocations.values_mut() {
            allocation.mappings.retain(|&mapping| mapping != offset);
        }
    }
}

#[inline]
fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// GPU virtual memory context
pub struct GpuVm {
    gmmu: Arc<GpuMemoryManager>,
    small_page_allocator: Arc<PageAllocator>,
    big_page_allocator: PageAllocator,
    big_page_size: u32,
    big_page_size_bits: u32,
    state: Mutex<VmState>,
}

impl GpuVm {
    /// Build an address space with the given layout
    pub fn new(host: Arc<HostMemory>, config: &VmConfig) -> Result<Self, VmError> {
        let big_page_size = config.big_page_size;
        if !big_page_size.is_power_of_two() || big_page_size & SUPPORTED_BIG_PAGE_SIZES == 0 {
            tracing::error!("Unsupported big page size: 0x{:X}", big_page_size);
            return Err(VmError::InvalidBigPageSize(big_page_size));
        }
        let big_page_size_bits = big_page_size.trailing_zeros();

        let pages = |address: u64, bits: u32| {
            u32::try_from(address >> bits).map_err(|_| MemoryError::InvalidRange {
                virt: address,
                size: 0,
                limit: u64::from(u32::MAX) << bits,
            })
        };

        let small_page_allocator = PageAllocator::new(
            pages(config.va_range_start, SMALL_PAGE_SIZE_BITS)?,
            pages(config.va_range_split, SMALL_PAGE_SIZE_BITS)?,
        )?;
        let big_page_allocator = PageAllocator::new(
            pages(config.va_range_split, big_page_size_bits)?,
            pages(config.va_range_end, big_page_size_bits)?,
        )?;

        let gmmu = GpuMemoryManager::new(host, va_maximum(GMMU_ADDRESS_SPACE_BITS))?;

        tracing::debug!(
            "Created GPU VM: big page 0x{:X}, range 0x{:X}..0x{:X}, split 0x{:X}",
            big_page_size,
            config.va_range_start,
            config.va_range_end,
            config.va_range_split
        );

        Ok(Self {
            gmmu: Arc::new(gmmu),
            small_page_allocator: Arc::new(small_page_allocator),
            big_page_allocator,
            big_page_size,
            big_page_size_bits,
            state: Mutex::new(VmState::default()),
        })
    }

    pub fn gmmu(&self) -> &Arc<GpuMemoryManager> {
        &self.gmmu
    }

    /// The small page allocator, shared with channels bound to this address space
    pub fn small_page_allocator(&self) -> &Arc<PageAllocator> {
        &self.small_page_allocator
    }

    pub fn big_page_size(&self) -> u32 {
        self.big_page_size
    }

    fn allocator(&self, big_page: bool) -> (&PageAllocator, u32, u32) {
        if big_page {
            (&self.big_page_allocator, self.big_page_size, self.big_page_size_bits)
        } else {
            (self.small_page_allocator.as_ref(), SMALL_PAGE_SIZE, SMALL_PAGE_SIZE_BITS)
        }
    }

    fn page_number(offset: u64, bits: u32) -> Result<u32, VmError> {
        u32::try_from(offset >> bits).map_err(|_| {
            VmError::Memory(MemoryError::InvalidRange {
                virt: offset,
                size: 0,
                limit: u64::from(u32::MAX) << bits,
            })
        })
    }

    fn page_count(size: u64, page_size: u32, bits: u32) -> Result<u32, VmError> {
        Self::page_number(align_up(size, u64::from(page_size)), bits)
    }

    /// Reserve `pages` pages of `page_size`, returning the GPU offset of the reservation
    pub fn alloc_space(&self, pages: u32, page_size: u32, flags: AsFlags, offset: u64) -> Result<u64, VmError> {
        tracing::debug!(
            "pages: 0x{:X}, page_size: 0x{:X}, flags: {:?}, offset: 0x{:X}",
            pages,
            page_size,
            flags,
            offset
        );

        let mut state = self.state.lock();

        if page_size != SMALL_PAGE_SIZE && page_size != self.big_page_size {
            return Err(VmError::InvalidPageSize(page_size));
        }

        let sparse = flags.contains(AsFlags::SPARSE);
        if page_size != self.big_page_size && sparse {
            return Err(VmError::SparseRequiresBigPages);
        }

        let (allocator, _, bits) = self.allocator(page_size != SMALL_PAGE_SIZE);

        let offset = if flags.contains(AsFlags::FIXED) {
            allocator.allocate_fixed(Self::page_number(offset, bits)?, pages)?;
            offset
        } else {
            u64::from(allocator.allocate(pages)?) << bits
        };

        let size = u64::from(pages) * u64::from(page_size);

        if sparse {
            self.gmmu.map_sparse(offset, size)?;
        }

        state.allocations.insert(
            offset,
            Allocation {
                size,
                mappings: Vec::new(),
                page_size,
                sparse,
            },
        );

        Ok(offset)
    }

    fn free_mapping_locked(&self, state: &mut VmState, offset: u64) -> Result<(), VmError> {
        let mapping = state.mappings.remove(&offset).ok_or(VmError::UnknownMapping(offset))?;

        if !mapping.fixed {
            let (allocator, _, bits) = self.allocator(mapping.big_page);
            allocator.free(Self::page_number(offset, bits)?, Self::page_number(mapping.size, bits)?)?;
        }

        // Sparse mappings go back to their sparse state, only free_space unmaps them fully
        if mapping.sparse_alloc {
            self.gmmu.map_sparse(offset, mapping.size)?;
        } else {
            self.gmmu.unmap(offset, mapping.size)?;
        }

        Ok(())
    }

    /// Release a reservation made by [`alloc_space`](Self::alloc_space) and every buffer mapped into it
    pub fn free_space(&self, offset: u64, pages: u32, page_size: u32) -> Result<(), VmError> {
        tracing::debug!("offset: 0x{:X}, pages: 0x{:X}, page_size: 0x{:X}", offset, pages, page_size);

        let mut state = self.state.lock();

        let allocation = state
            .allocations
            .get(&offset)
            .cloned()
            .ok_or(VmError::UnknownAllocation(offset))?;

        if allocation.page_size != page_size || allocation.size != u64::from(pages) * u64::from(page_size) {
            return Err(VmError::AllocationMismatch { offset, pages, page_size });
        }

        if let Some(&missing) = allocation
            .mappings
            .iter()
            .find(|mapping| !state.mappings.contains_key(*mapping))
        {
            return Err(VmError::UnknownMapping(missing));
        }

        for mapping in &allocation.mappings {
            self.free_mapping_locked(&mut state, *mapping)?;
        }

        if allocation.sparse {
            self.gmmu.unmap(offset, allocation.size)?;
        }

        let (allocator, _, bits) = self.allocator(page_size != SMALL_PAGE_SIZE);
        allocator.free(Self::page_number(offset, bits)?, Self::page_number(allocation.size, bits)?)?;
        state.allocations.remove(&offset);

        Ok(())
    }

    /// Unmap a buffer previously mapped with [`map_buffer`](Self::map_buffer)
    pub fn unmap_buffer(&self, offset: u64) -> Result<(), VmError> {
        tracing::debug!("offset: 0x{:X}", offset);

        let mut state = self.state.lock();

        if let Err(err) = self.free_mapping_locked(&mut state, offset) {
            tracing::warn!("Couldn't unmap region at 0x{:X}: {}", offset, err);
            return Err(err);
        }

        state.forget_mapping(offset);
        Ok(())
    }

    /// Map `mapping_size` bytes of `handle` (all of it if zero) starting at `buffer_offset`
    ///
    /// With [`AsFlags::FIXED`] the buffer lands at `offset`, which must be inside
    /// an allocation. Otherwise pages are allocated from the window matching
    /// the handle's alignment. With [`AsFlags::REMAP`] a subregion of the
    /// existing mapping at `offset` is re-pointed instead. Returns the GPU
    /// offset of the mapping.
    pub fn map_buffer(
        &self,
        flags: AsFlags,
        handle: &BufferHandle,
        buffer_offset: u64,
        mapping_size: u64,
        offset: u64,
    ) -> Result<u64, VmError> {
        tracing::debug!(
            "flags: {:?}, handle: {:?}, buffer_offset: 0x{:X}, mapping_size: 0x{:X}, offset: 0x{:X}",
            flags,
            handle,
            buffer_offset,
            mapping_size,
            offset
        );

        let mut state = self.state.lock();

        if flags.contains(AsFlags::REMAP) {
            let mapping = state.mappings.get(&offset).copied().ok_or_else(|| {
                tracing::warn!("Cannot remap an unmapped GPU address space region: 0x{:X}", offset);
                VmError::UnknownMapping(offset)
            })?;

            if mapping.size < mapping_size {
                tracing::warn!("Cannot remap a partially mapped GPU address space region: 0x{:X}", offset);
                return Err(VmError::RemapTooLarge {
                    offset,
                    size: mapping_size,
                    mapped: mapping.size,
                });
            }

            self.gmmu.map(
                offset + buffer_offset,
                mapping.address.offset_by(buffer_offset),
                mapping_size,
                MappingFlags::empty(),
            )?;
            return Ok(offset);
        }

        let address = handle.address.offset_by(buffer_offset);
        let size = if mapping_size != 0 { mapping_size } else { handle.size };

        let offset = if flags.contains(AsFlags::FIXED) {
            let allocation_offset = state
                .allocation_containing(offset, size)
                .ok_or(VmError::UnallocatedRegion { offset, size })?;
            self.gmmu.host().check(address, size)?;

            // A fixed mapping replaces whatever buffer was mapped at the same offset
            if state.mappings.contains_key(&offset) {
                tracing::debug!("Replacing mapping at 0x{:X}", offset);
                self.free_mapping_locked(&mut state, offset)?;
                state.forget_mapping(offset);
            }

            self.gmmu.map(offset, address, size, MappingFlags::FIXED)?;

            let allocation = state
                .allocations
                .get_mut(&allocation_offset)
                .ok_or(VmError::UnknownAllocation(allocation_offset))?;
            allocation.mappings.push(offset);
            let sparse_alloc = allocation.sparse;

            state.mappings.insert(
                offset,
                Mapping {
                    address,
                    size,
                    fixed: true,
                    big_page: false,
                    sparse_alloc,
                },
            );
            offset
        } else {
            let big_page = if handle.align % self.big_page_size == 0 {
                true
            } else if handle.align % SMALL_PAGE_SIZE == 0 {
                false
            } else {
                return Err(VmError::InvalidAlignment(handle.align));
            };

            let (allocator, page_size, bits) = self.allocator(big_page);
            let offset = u64::from(allocator.allocate(Self::page_count(size, page_size, bits)?)?) << bits;

            let mapped = align_up(size, u64::from(page_size));
            let map_flags = if big_page { MappingFlags::BIG_PAGE } else { MappingFlags::empty() };
            if let Err(err) = self.gmmu.map(offset, address, mapped, map_flags) {
                allocator.free(Self::page_number(offset, bits)?, Self::page_number(mapped, bits)?)?;
                return Err(err.into());
            }

            state.mappings.insert(
                offset,
                Mapping {
                    address,
                    size: mapped,
                    fixed: false,
                    big_page,
                    sparse_alloc: false,
                },
            );
            offset
        };

        tracing::debug!("Mapped to 0x{:X}", offset);
        Ok(offset)
    }

    /// Re-point big-page ranges of sparse allocations
    pub fn remap(&self, entries: &[RemapEntry]) -> Result<(), VmError> {
        let state = self.state.lock();
        let bits = self.big_page_size_bits;

        for entry in entries {
            let virt = u64::from(entry.as_offset_big_pages) << bits;
            let size = u64::from(entry.big_pages) << bits;

            let allocation_offset = state.allocation_containing(virt, size).ok_or_else(|| {
                tracing::warn!("Cannot remap into an unallocated region!");
                VmError::UnallocatedRegion { offset: virt, size }
            })?;

            if !state.allocations[&allocation_offset].sparse {
                tracing::warn!("Cannot remap a non-sparse mapping!");
                return Err(VmError::NotSparse(virt));
            }

            match &entry.handle {
                None => self.gmmu.map_sparse(virt, size)?,
                Some(handle) => {
                    let address = handle
                        .address
                        .offset_by(u64::from(entry.handle_offset_big_pages) << bits);
                    self.gmmu.map(virt, address, size, MappingFlags::BIG_PAGE)?;
                }
            }
        }

        Ok(())
    }

    /// The small and big page windows of the address space
    pub fn va_regions(&self) -> [VaRegion; 2] {
        let window = |allocator: &PageAllocator, page_size: u32, bits: u32| VaRegion {
            offset: u64::from(allocator.va_start()) << bits,
            page_size,
            pages: u64::from(allocator.va_limit() - allocator.va_start()),
        };

        [
            window(self.small_page_allocator.as_ref(), SMALL_PAGE_SIZE, SMALL_PAGE_SIZE_BITS),
            window(&self.big_page_allocator, self.big_page_size, self.big_page_size_bits),
        ]
    }
}
