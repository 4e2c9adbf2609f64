//! Inline-to-memory uploads
//!
//! The command stream launches an upload with a destination layout and then
//! feeds the payload one word at a time. Once the last word arrives the
//! buffered bytes are written line by line through the GMMU.

use std::sync::Arc;

use gv_core::error::MemoryError;
use gv_memory::GpuMemoryManager;

/// Destination layout of an inline upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InlineUploadParams {
    pub offset_out: u64,
    pub pitch_out: u32,
    pub line_length_in: u32,
    pub line_count: u32,
}

impl InlineUploadParams {
    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.line_length_in as usize * self.line_count as usize
    }
}

pub struct InlineUploader {
    gmmu: Arc<GpuMemoryManager>,
    params: InlineUploadParams,
    buffer: Vec<u8>,
    active: bool,
}

impl InlineUploader {
    pub fn new(gmmu: Arc<GpuMemoryManager>) -> Self {
        Self {
            gmmu,
            params: InlineUploadParams::default(),
            buffer: Vec::new(),
            active: false,
        }
    }

    /// Start a new upload, dropping any unfinished one
    pub fn launch(&mut self, params: InlineUploadParams) {
        if self.active {
            tracing::warn!(
                "Inline upload to 0x{:X} abandoned after {} of {} bytes",
                self.params.offset_out,
                self.buffer.len(),
                self.params.size()
            );
        }

        self.params = params;
        self.buffer.clear();
        self.buffer.reserve(params.size());
        self.active = params.size() != 0;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Feed one payload word, returns true once the upload has been written out
    pub fn load_inline_data(&mut self, word: u32) -> Result<bool, MemoryError> {
        if !self.active {
            tracing::warn!("Inline data 0x{:08X} without a launched upload", word);
            return Ok(false);
        }

        self.buffer.extend_from_slice(&word.to_le_bytes());
        if self.buffer.len() < self.params.size() {
            return Ok(false);
        }

        self.active = false;
        self.complete()?;
        Ok(true)
    }

    fn complete(&mut self) -> Result<(), MemoryError> {
        let InlineUploadParams {
            offset_out,
            pitch_out,
            line_length_in,
            line_count,
        } = self.params;

        // The payload is padded to a whole word
        self.buffer.truncate(self.params.size());

        if line_count == 1 || pitch_out == line_length_in {
            return self.gmmu.write(offset_out, &self.buffer);
        }

        for (line, bytes) in self.buffer.chunks_exact(line_length_in as usize).enumerate() {
            self.gmmu.write(offset_out + line as u64 * u64::from(pitch_out), bytes)?;
        }
        Ok(())
    }
}
