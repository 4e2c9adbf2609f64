//! GPU copy engine
//!
//! Copies between two GPU virtual ranges. Either side may translate to any
//! number of host spans, so the copy walks both span lists in lockstep
//! instead of assuming a contiguous backing.

use std::collections::VecDeque;
use std::sync::Arc;

use gv_core::dma_trace;
use gv_core::error::MemoryError;
use gv_memory::{GpuMemoryManager, HostSpan};

/// A queued copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaCommand {
    /// Linear copy of `size` bytes
    Linear { dst: u64, src: u64, size: u64 },
    /// `line_count` lines of `line_length` bytes with independent pitches
    Pitch {
        dst: u64,
        dst_pitch: u64,
        src: u64,
        src_pitch: u64,
        line_length: u64,
        line_count: u32,
    },
}

/// Copy engine bound to one GMMU
pub struct DmaEngine {
    gmmu: Arc<GpuMemoryManager>,
    queue: VecDeque<DmaCommand>,
}

impl DmaEngine {
    pub fn new(gmmu: Arc<GpuMemoryManager>) -> Self {
        Self {
            gmmu,
            queue: VecDeque::with_capacity(16),
        }
    }

    /// Queue a command for [`flush`](Self::flush)
    pub fn queue_command(&mut self, command: DmaCommand) {
        self.queue.push_back(command);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Run every queued command in order, stopping at the first fault
    ///
    /// The faulting command and everything after it stay queued.
    pub fn flush(&mut self) -> Result<(), MemoryError> {
        while let Some(command) = self.queue.front().copied() {
            self.execute(command)?;
            self.queue.pop_front();
        }
        Ok(())
    }

    pub fn execute(&self, command: DmaCommand) -> Result<(), MemoryError> {
        match command {
            DmaCommand::Linear { dst, src, size } => self.copy(dst, src, size),
            DmaCommand::Pitch {
                dst,
                dst_pitch,
                src,
                src_pitch,
                line_length,
                line_count,
            } => self.copy_pitch(dst, dst_pitch, src, src_pitch, line_length, line_count),
        }
    }

    /// Copy `size` bytes from GPU address `src` to `dst`
    ///
    /// Sparse source spans copy as zeros, sparse destination spans drop the
    /// data. Both ranges are translated before any byte moves, so a fault
    /// leaves the destination untouched.
    pub fn copy(&self, dst: u64, src: u64, size: u64) -> Result<(), MemoryError> {
        // Overlapping ranges need memmove semantics, take the bounce path
        if dst < src.saturating_add(size) && src < dst.saturating_add(size) {
            dma_trace!("Overlapping copy 0x{:X} -> 0x{:X} (0x{:X})", src, dst, size);
            return self.gmmu.copy(dst, src, size);
        }

        let src_spans = self.gmmu.translate_range(src, size)?;
        let dst_spans = self.gmmu.translate_range(dst, size)?;

        if src_spans.len() > 1 || dst_spans.len() > 1 {
            dma_trace!(
                "Split copy 0x{:X} -> 0x{:X} (0x{:X}): {} source spans, {} destination spans",
                src,
                dst,
                size,
                src_spans.len(),
                dst_spans.len()
            );
        }

        let host = self.gmmu.host();
        let (mut src_index, mut dst_index) = (0, 0);
        let (mut src_offset, mut dst_offset) = (0u64, 0u64);

        while let (Some(src_span), Some(dst_span)) = (src_spans.get(src_index), dst_spans.get(dst_index)) {
            let chunk = (src_span.len() - src_offset).min(dst_span.len() - dst_offset);

            match (src_span.subspan(src_offset, chunk), dst_span.subspan(dst_offset, chunk)) {
                (HostSpan::Host { address: from, .. }, HostSpan::Host { address: to, .. }) => {
                    host.copy(to, from, chunk as usize)?;
                }
                (HostSpan::Sparse { .. }, HostSpan::Host { address: to, .. }) => {
                    host.region(to.region)?.fill(to.offset, chunk as usize, 0)?;
                }
                (_, HostSpan::Sparse { .. }) => {}
            }

            src_offset += chunk;
            dst_offset += chunk;
            if src_offset == src_span.len() {
                src_index += 1;
                src_offset = 0;
            }
            if dst_offset == dst_span.len() {
                dst_index += 1;
                dst_offset = 0;
            }
        }

        Ok(())
    }

    /// Copy a 2D block line by line
    pub fn copy_pitch(
        &self,
        dst: u64,
        dst_pitch: u64,
        src: u64,
        src_pitch: u64,
        line_length: u64,
        line_count: u32,
    ) -> Result<(), MemoryError> {
        dma_trace!(
            "Pitch copy 0x{:X}/0x{:X} -> 0x{:X}/0x{:X}, {} lines of 0x{:X}",
            src,
            src_pitch,
            dst,
            dst_pitch,
            line_count,
            line_length
        );

        for line in 0..u64::from(line_count) {
            self.copy(dst + line * dst_pitch, src + line * src_pitch, line_length)?;
        }
        Ok(())
    }
}
