//! Flat address space map for the emulated GPU
//!
//! A sorted block list partitions the whole VA space into mapped and
//! unmapped runs. On top of it sit the GMMU ([`FlatMemoryManager`]), which
//! translates GPU VAs into host memory, and the VA allocator
//! ([`FlatAllocator`]).

pub mod address;
pub mod allocator;
pub mod block;
pub mod constants;
pub mod flags;
pub mod host;
pub mod manager;
pub mod map;

pub use address::{Backing, VirtualAddress};
pub use allocator::FlatAllocator;
pub use block::{Block, BlockList};
pub use flags::MappingFlags;
pub use host::{HostAddress, HostMemory, HostRegion, RegionId};
pub use manager::{AccessCallback, FlatMemoryManager, GpuMemoryManager, HostBacking, HostSpan, TranslatedRange};
pub use map::{FlatAddressSpaceMap, MapGuard};
