//! gpuvas - GPU address space manager
//!
//! Builds a GPU address space from the user config and runs a short
//! map/translate/unmap cycle through it.

use std::sync::Arc;

use anyhow::Context;
use gv_core::config::Config;
use gv_gpu::{AsFlags, BufferHandle, DmaEngine, GpuVm};
use gv_memory::HostMemory;

fn main() -> anyhow::Result<()> {
    let config = Config::load().unwrap_or_default();

    gv_core::logging::init_with_reload(config.debug.log_level);

    tracing::info!("Starting gpuvas");

    let host = Arc::new(HostMemory::new());
    let vm = GpuVm::new(host.clone(), &config.vm).context("failed to create GPU address space")?;

    for region in vm.va_regions() {
        tracing::info!(
            "VA region: offset 0x{:X}, page size 0x{:X}, {} pages",
            region.offset,
            region.page_size,
            region.pages
        );
    }

    let size = 0x4000usize;
    let source = BufferHandle {
        address: host.register((0..size).map(|i| i as u8).collect()),
        size: size as u64,
        align: 0x1000,
    };
    let target = BufferHandle {
        address: host.allocate(size),
        size: size as u64,
        align: 0x1000,
    };

    let src = vm.map_buffer(AsFlags::empty(), &source, 0, 0, 0)?;
    let dst = vm.map_buffer(AsFlags::empty(), &target, 0, 0, 0)?;
    tracing::info!("Mapped buffers at 0x{:X} and 0x{:X}", src, dst);

    let spans = vm.gmmu().translate_range(src, size as u64)?;
    tracing::info!("0x{:X} translates to {:?}", src, spans);

    DmaEngine::new(vm.gmmu().clone()).copy(dst, src, size as u64)?;
    let check: u32 = vm.gmmu().read_obj(dst + 0x100)?;
    anyhow::ensure!(check == 0x0302_0100, "copy mismatch: 0x{:08X}", check);

    vm.unmap_buffer(src)?;
    vm.unmap_buffer(dst)?;

    match vm.gmmu().read_obj::<u32>(src) {
        Err(err) => tracing::info!("Access after unmap faults as expected: {}", err),
        Ok(value) => anyhow::bail!("unmapped address still readable: 0x{:08X}", value),
    }

    tracing::info!("Address space checks passed");
    Ok(())
}
