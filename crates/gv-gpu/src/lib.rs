//! GPU-side consumers of the flat address space map
//!
//! [`GpuVm`] manages one GPU virtual address space, [`DmaEngine`] and
//! [`InlineUploader`] move data through it, and [`GpFifo`] fetches and
//! decodes command push buffers from it.

pub mod dma;
pub mod fifo;
pub mod inline;
pub mod vm;

pub use dma::{DmaCommand, DmaEngine};
pub use fifo::{CommandFifo, GpEntry, GpFifo, MethodCall, MethodHeader, SecOp};
pub use inline::{InlineUploadParams, InlineUploader};
pub use vm::{AsFlags, BufferHandle, GpuVm, PageAllocator, RemapEntry, VaRegion};
