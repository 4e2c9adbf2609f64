//! GMMU: VA translation onto host memory
//!
//! [`FlatMemoryManager`] specialises the flat map for host backing: byte
//! reads and writes, range translation and sparse placeholder mappings.
//!
//! Reads and writes walk the block list with the block lock held, but the
//! host bytes behind a mapping are not pinned beyond that: callers must not
//! remap a range while another thread is relying on a translation of it.
//!
//! An optional access callback sees every host-backed span before it is
//! handed out or touched, so trackers can synchronise the host copy first.

use std::sync::Arc;

use bytemuck::Pod;
use gv_core::error::MemoryError;
use gv_core::{gmmu_debug, gmmu_trace};

use crate::address::{Backing, VirtualAddress};
use crate::block::Block;
use crate::constants::GMMU_ADDRESS_SPACE_BITS;
use crate::flags::MappingFlags;
use crate::host::{HostAddress, HostMemory};
use crate::map::{FlatAddressSpaceMap, MapGuard};

/// What a GMMU block resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostBacking {
    #[default]
    Unmapped,
    /// Sparse placeholder: mapped, but with nothing host resident behind it
    Sparse,
    Host(HostAddress),
}

impl Backing for HostBacking {
    const UNMAPPED: Self = HostBacking::Unmapped;

    #[inline]
    fn advance(self, offset: u64) -> Self {
        match self {
            HostBacking::Host(address) => HostBacking::Host(address.offset_by(offset)),
            other => other,
        }
    }
}

/// A maximal contiguous piece of a translated range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSpan {
    Host { address: HostAddress, len: u64 },
    Sparse { len: u64 },
}

impl HostSpan {
    pub fn len(&self) -> u64 {
        match *self {
            HostSpan::Host { len, .. } | HostSpan::Sparse { len } => len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Host address of the span, `None` for sparse spans
    pub fn address(&self) -> Option<HostAddress> {
        match *self {
            HostSpan::Host { address, .. } => Some(address),
            HostSpan::Sparse { .. } => None,
        }
    }

    /// The span covering `[offset, offset + len)` of this one
    pub fn subspan(&self, offset: u64, len: u64) -> HostSpan {
        match *self {
            HostSpan::Host { address, .. } => HostSpan::Host {
                address: address.offset_by(offset),
                len,
            },
            HostSpan::Sparse { .. } => HostSpan::Sparse { len },
        }
    }

    /// Grow this span by `next` if it continues it
    fn try_extend(&mut self, next: &HostSpan) -> bool {
        match (self, next) {
            (HostSpan::Host { address, len }, HostSpan::Host { address: next_address, len: next_len })
                if *next_address == address.offset_by(*len) =>
            {
                *len += next_len;
                true
            }
            (HostSpan::Sparse { len }, HostSpan::Sparse { len: next_len }) => {
                *len += next_len;
                true
            }
            _ => false,
        }
    }
}

/// Host spans of a translated range in ascending VA order
pub type TranslatedRange = Vec<HostSpan>;

/// A memory-translating address space map
pub struct FlatMemoryManager<Va, const BITS: u32> {
    map: FlatAddressSpaceMap<Va, HostBacking, MappingFlags, BITS>,
    host: Arc<HostMemory>,
    access_callback: Option<AccessCallback>,
}

/// Called with each host-backed span a translation, read or write touches
///
/// Runs with the block lock held, so it must not call back into the manager.
pub type AccessCallback = Box<dyn Fn(HostSpan) + Send + Sync>;

/// The GPU's 40-bit address space
pub type GpuMemoryManager = FlatMemoryManager<u64, GMMU_ADDRESS_SPACE_BITS>;

type Guard<'a, Va, const BITS: u32> = MapGuard<'a, Va, HostBacking, MappingFlags, BITS>;

impl<Va: VirtualAddress, const BITS: u32> FlatMemoryManager<Va, BITS> {
    /// Create a manager translating into `host` with the given VA limit
    pub fn new(host: Arc<HostMemory>, va_limit: Va) -> Result<Self, MemoryError> {
        Ok(Self {
            map: FlatAddressSpaceMap::new(va_limit)?,
            host,
            access_callback: None,
        })
    }

    /// Create a manager that reports every changed region to `callback`
    pub fn with_unmap_callback(
        host: Arc<HostMemory>,
        va_limit: Va,
        callback: impl Fn(Va, Va) + Send + Sync + 'static,
    ) -> Result<Self, MemoryError> {
        Ok(Self {
            map: FlatAddressSpaceMap::with_unmap_callback(va_limit, callback)?,
            host,
            access_callback: None,
        })
    }

    /// Report every host span accessed through this manager to `callback`
    pub fn with_access_callback(mut self, callback: impl Fn(HostSpan) + Send + Sync + 'static) -> Self {
        self.access_callback = Some(Box::new(callback));
        self
    }

    fn notify_access(&self, spans: &[HostSpan]) {
        if let Some(callback) = &self.access_callback {
            spans
                .iter()
                .filter(|span| span.address().is_some())
                .for_each(|span| callback(*span));
        }
    }

    pub fn host(&self) -> &Arc<HostMemory> {
        &self.host
    }

    pub fn va_limit(&self) -> Va {
        self.map.va_limit()
    }

    /// Map `[virt, virt + size)` onto host memory starting at `address`
    pub fn map(&self, virt: Va, address: HostAddress, size: Va, flags: MappingFlags) -> Result<(), MemoryError> {
        self.host.check(address, size.to_u64())?;
        gmmu_trace!("Map 0x{:X} + 0x{:X} -> {:?} ({:?})", virt, size, address, flags);
        self.map.map(virt, HostBacking::Host(address), size, flags)
    }

    /// Map `[virt, virt + size)` to the sparse placeholder
    pub fn map_sparse(&self, virt: Va, size: Va) -> Result<(), MemoryError> {
        gmmu_trace!("Map sparse 0x{:X} + 0x{:X}", virt, size);
        self.map.map(virt, HostBacking::Sparse, size, MappingFlags::SPARSE)
    }

    pub fn unmap(&self, virt: Va, size: Va) -> Result<(), MemoryError> {
        gmmu_trace!("Unmap 0x{:X} + 0x{:X}", virt, size);
        self.map.unmap(virt, size)
    }

    /// Copy of the current block list
    pub fn blocks(&self) -> Vec<Block<Va, HostBacking, MappingFlags>> {
        self.map.blocks()
    }

    /// The block covering `virt`
    pub fn mapping_at(&self, virt: Va) -> Block<Va, HostBacking, MappingFlags> {
        self.map.lookup(virt)
    }

    fn translate_locked(guard: &Guard<'_, Va, BITS>, virt: Va, size: Va) -> Result<TranslatedRange, MemoryError> {
        guard.check_range(virt, size)?;

        let mut spans = TranslatedRange::with_capacity(1);
        for run in guard.blocks().runs(virt, size) {
            let span = match run.phys {
                HostBacking::Unmapped => return Err(MemoryError::UnmappedAccess(run.virt.to_u64())),
                HostBacking::Sparse => HostSpan::Sparse { len: run.size.to_u64() },
                HostBacking::Host(address) => HostSpan::Host {
                    address,
                    len: run.size.to_u64(),
                },
            };

            if !spans.last_mut().is_some_and(|last| last.try_extend(&span)) {
                spans.push(span);
            }
        }

        Ok(spans)
    }

    /// Split `[virt, virt + size)` into maximal contiguous host spans
    pub fn translate_range(&self, virt: Va, size: Va) -> Result<TranslatedRange, MemoryError> {
        let guard = self.map.lock();
        let spans = Self::translate_locked(&guard, virt, size)?;
        self.notify_access(&spans);
        Ok(spans)
    }

    /// Translate a range that must be a single contiguous span
    pub fn translate_contiguous(&self, virt: Va, size: Va) -> Result<HostSpan, MemoryError> {
        let mut spans = self.translate_range(virt, size)?;
        if spans.len() != 1 {
            gmmu_debug!("Range 0x{:X} + 0x{:X} is split across {} spans", virt, size, spans.len());
            return Err(MemoryError::SplitRange {
                virt: virt.to_u64(),
                size: size.to_u64(),
                spans: spans.len(),
            });
        }
        Ok(spans.remove(0))
    }

    fn size_of(virt: Va, len: usize, limit: Va) -> Result<Va, MemoryError> {
        Va::from_u64(len as u64).ok_or(MemoryError::InvalidRange {
            virt: virt.to_u64(),
            size: len as u64,
            limit: limit.to_u64(),
        })
    }

    /// Read `destination.len()` bytes starting at `virt`
    ///
    /// Sparse regions read as zero. Nothing is copied if any byte is unmapped.
    pub fn read(&self, destination: &mut [u8], virt: Va) -> Result<(), MemoryError> {
        let size = Self::size_of(virt, destination.len(), self.va_limit())?;
        let guard = self.map.lock();
        let spans = Self::translate_locked(&guard, virt, size)?;
        self.notify_access(&spans);

        let mut cursor = 0usize;
        for span in &spans {
            let len = span.len() as usize;
            let chunk = &mut destination[cursor..cursor + len];
            match span {
                HostSpan::Host { address, .. } => self.host.read(*address, chunk)?,
                HostSpan::Sparse { .. } => chunk.fill(0),
            }
            cursor += len;
        }

        Ok(())
    }

    /// Write `source` starting at `virt`
    ///
    /// Writes to sparse regions are discarded. Nothing is written if any byte is unmapped.
    pub fn write(&self, virt: Va, source: &[u8]) -> Result<(), MemoryError> {
        let size = Self::size_of(virt, source.len(), self.va_limit())?;
        let guard = self.map.lock();
        let spans = Self::translate_locked(&guard, virt, size)?;
        self.notify_access(&spans);

        let mut cursor = 0usize;
        for span in &spans {
            let len = span.len() as usize;
            if let HostSpan::Host { address, .. } = span {
                self.host.write(*address, &source[cursor..cursor + len])?;
            }
            cursor += len;
        }

        Ok(())
    }

    /// Read a plain-old-data value at `virt`
    pub fn read_obj<T: Pod>(&self, virt: Va) -> Result<T, MemoryError> {
        let mut value = T::zeroed();
        self.read(bytemuck::bytes_of_mut(&mut value), virt)?;
        Ok(value)
    }

    /// Write a plain-old-data value at `virt`
    pub fn write_obj<T: Pod>(&self, virt: Va, value: &T) -> Result<(), MemoryError> {
        self.write(virt, bytemuck::bytes_of(value))
    }

    /// Read from `virt` until `destination` is full, `function` asks to stop or
    /// an unmapped block is reached
    ///
    /// `function` sees each host-backed piece and returns `Some(end)` to stop
    /// after `end` bytes of it. It is not run on sparse pieces, which read as
    /// zero. Returns the number of bytes read.
    ///
    /// `function` runs with the block lock and the region lock held, so it
    /// must not call back into this manager or touch the region's host memory.
    pub fn read_till<F>(&self, destination: &mut [u8], virt: Va, mut function: F) -> Result<usize, MemoryError>
    where
        F: FnMut(&[u8]) -> Option<usize>,
    {
        if destination.is_empty() {
            return Ok(0);
        }

        let size = Self::size_of(virt, destination.len(), self.va_limit())?;
        let guard = self.map.lock();
        guard.check_range(virt, size)?;

        let mut cursor = 0usize;
        for run in guard.blocks().runs(virt, size) {
            let len = run.size.to_u64() as usize;
            let chunk = &mut destination[cursor..cursor + len];

            match run.phys {
                HostBacking::Unmapped => return Ok(cursor),
                HostBacking::Sparse => chunk.fill(0),
                HostBacking::Host(address) => {
                    self.notify_access(&[HostSpan::Host {
                        address,
                        len: len as u64,
                    }]);
                    let region = self.host.region(address.region)?;
                    let stop = region.with_slice(address.offset, len, |bytes| {
                        let end = function(bytes).map(|end| end.min(bytes.len()));
                        let copied = end.unwrap_or(bytes.len());
                        chunk[..copied].copy_from_slice(&bytes[..copied]);
                        end
                    })?;

                    if let Some(end) = stop {
                        return Ok(cursor + end);
                    }
                }
            }

            cursor += len;
        }

        Ok(cursor)
    }

    /// Copy `size` bytes from `src` to `dst`, both virtual
    pub fn copy(&self, dst: Va, src: Va, size: Va) -> Result<(), MemoryError> {
        let len = usize::try_from(size.to_u64()).map_err(|_| MemoryError::InvalidRange {
            virt: src.to_u64(),
            size: size.to_u64(),
            limit: self.va_limit().to_u64(),
        })?;

        let mut bounce = vec![0u8; len];
        self.read(&mut bounce, src)?;
        self.write(dst, &bounce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Gmmu16 = FlatMemoryManager<u16, 16>;

    fn setup() -> (Gmmu16, HostAddress) {
        let host = Arc::new(HostMemory::new());
        let base = host.allocate(0x10000);
        (Gmmu16::new(host, 0xFFFF).unwrap(), base)
    }

    #[test]
    fn test_translate_single_span() {
        let (gmmu, base) = setup();
        gmmu.map(0x1000, base.offset_by(0x2000), 0x100, MappingFlags::empty()).unwrap();

        let spans = gmmu.translate_range(0x1000, 0x10).unwrap();
        assert_eq!(spans, vec![HostSpan::Host { address: base.offset_by(0x2000), len: 0x10 }]);

        gmmu.unmap(0x1000, 0x100).unwrap();
        let mut buf = [0u8; 0x10];
        assert_eq!(gmmu.read(&mut buf, 0x1000), Err(MemoryError::UnmappedAccess(0x1000)));
    }

    #[test]
    fn test_translate_split_range() {
        let (gmmu, base) = setup();
        gmmu.map(0x1000, base.offset_by(0x2000), 0x80, MappingFlags::empty()).unwrap();
        gmmu.map(0x1080, base.offset_by(0x3000), 0x80, MappingFlags::empty()).unwrap();

        let spans = gmmu.translate_range(0x1000, 0x100).unwrap();
        assert_eq!(
            spans,
            vec![
                HostSpan::Host { address: base.offset_by(0x2000), len: 0x80 },
                HostSpan::Host { address: base.offset_by(0x3000), len: 0x80 },
            ]
        );

        assert_eq!(
            gmmu.translate_contiguous(0x1000, 0x100),
            Err(MemoryError::SplitRange { virt: 0x1000, size: 0x100, spans: 2 })
        );
        assert!(gmmu.translate_contiguous(0x1000, 0x80).is_ok());
    }

    #[test]
    fn test_translate_merges_contiguous_blocks() {
        let (gmmu, base) = setup();
        gmmu.map(0x1000, base.offset_by(0x2000), 0x80, MappingFlags::empty()).unwrap();
        gmmu.map(0x1080, base.offset_by(0x2080), 0x80, MappingFlags::FIXED).unwrap();

        assert_eq!(gmmu.blocks().len(), 4);
        let span = gmmu.translate_contiguous(0x1000, 0x100).unwrap();
        assert_eq!(span, HostSpan::Host { address: base.offset_by(0x2000), len: 0x100 });
    }

    #[test]
    fn test_read_write_roundtrip_across_blocks() {
        let (gmmu, base) = setup();
        gmmu.map(0x1000, base.offset_by(0x8000), 0x80, MappingFlags::empty()).unwrap();
        gmmu.map(0x1080, base.offset_by(0x100), 0x80, MappingFlags::empty()).unwrap();

        let data: Vec<u8> = (0..0x100).map(|i| i as u8).collect();
        gmmu.write(0x1000, &data).unwrap();

        let mut out = vec![0u8; 0x100];
        gmmu.read(&mut out, 0x1000).unwrap();
        assert_eq!(out, data);

        // The second half landed at its own backing
        let mut raw = [0u8; 2];
        gmmu.host().read(base.offset_by(0x100), &mut raw).unwrap();
        assert_eq!(raw, [0x80, 0x81]);
    }

    #[test]
    fn test_partially_unmapped_access_faults() {
        let (gmmu, base) = setup();
        gmmu.map(0x1000, base, 0x100, MappingFlags::empty()).unwrap();

        let mut buf = [0xEEu8; 0x20];
        assert_eq!(gmmu.read(&mut buf, 0x10F0), Err(MemoryError::UnmappedAccess(0x1100)));
        // Fault is reported before anything is copied
        assert_eq!(buf, [0xEE; 0x20]);

        assert_eq!(gmmu.write(0x0FF0, &[1u8; 0x20]), Err(MemoryError::UnmappedAccess(0x0FF0)));
        let mut head = [0u8; 0x10];
        gmmu.read(&mut head, 0x1000).unwrap();
        assert_eq!(head, [0; 0x10]);
    }

    #[test]
    fn test_sparse_reads_zero_and_discards_writes() {
        let (gmmu, _) = setup();
        gmmu.map_sparse(0x4000, 0x1000).unwrap();

        gmmu.write(0x4000, &[0xFF; 0x10]).unwrap();
        let mut buf = [0xAAu8; 0x10];
        gmmu.read(&mut buf, 0x4000).unwrap();
        assert_eq!(buf, [0; 0x10]);

        assert_eq!(gmmu.translate_range(0x4000, 0x1000).unwrap(), vec![HostSpan::Sparse { len: 0x1000 }]);
        assert!(gmmu.mapping_at(0x4800).extra.contains(MappingFlags::SPARSE));
    }

    #[test]
    fn test_map_rejects_backing_outside_region() {
        let host = Arc::new(HostMemory::new());
        let small = host.allocate(0x100);
        let gmmu = Gmmu16::new(host, 0xFFFF).unwrap();

        assert!(matches!(
            gmmu.map(0x1000, small, 0x200, MappingFlags::empty()),
            Err(MemoryError::HostOutOfBounds { .. })
        ));
        assert!(!gmmu.mapping_at(0x1000).is_mapped());
    }

    #[test]
    fn test_unregistered_backing_faults() {
        let (gmmu, base) = setup();
        gmmu.map(0x1000, base, 0x100, MappingFlags::empty()).unwrap();
        gmmu.host().unregister(base.region);

        let mut buf = [0u8; 4];
        assert_eq!(gmmu.read(&mut buf, 0x1000), Err(MemoryError::UnknownRegion(base.region.0)));
    }

    #[test]
    fn test_typed_access() {
        let (gmmu, base) = setup();
        gmmu.map(0x2000, base, 0x1000, MappingFlags::empty()).unwrap();

        gmmu.write_obj(0x2010, &0xDEAD_BEEFu32).unwrap();
        assert_eq!(gmmu.read_obj::<u32>(0x2010).unwrap(), 0xDEAD_BEEF);
        assert_eq!(gmmu.read_obj::<u8>(0x2010).unwrap(), 0xEF);
    }

    #[test]
    fn test_read_till() {
        let (gmmu, base) = setup();
        gmmu.map(0x1000, base, 0x10, MappingFlags::empty()).unwrap();
        gmmu.map_sparse(0x1010, 0x10).unwrap();
        gmmu.map(0x1020, base.offset_by(0x10), 0x10, MappingFlags::empty()).unwrap();
        gmmu.write(0x1000, b"hello, world\0...").unwrap();
        gmmu.write(0x1020, b"tail\0").unwrap();

        // Stops at the terminator
        let mut buf = [0u8; 0x40];
        let n = gmmu
            .read_till(&mut buf, 0x1000, |bytes| bytes.iter().position(|&b| b == 0))
            .unwrap();
        assert_eq!(&buf[..n], b"hello, world");

        // Skips the sparse block, stops in the third one
        let mut calls = 0;
        let n = gmmu
            .read_till(&mut buf, 0x1010, |bytes| {
                calls += 1;
                bytes.iter().position(|&b| b == 0)
            })
            .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(n, 0x14);
        assert_eq!(&buf[0x10..0x14], b"tail");

        // Stops at the unmapped block after the mappings
        let n = gmmu.read_till(&mut buf, 0x1028, |_| None).unwrap();
        assert_eq!(n, 8);
    }

    #[test]
    fn test_copy_between_mappings() {
        let (gmmu, base) = setup();
        gmmu.map(0x1000, base, 0x100, MappingFlags::empty()).unwrap();
        gmmu.map(0x3000, base.offset_by(0x4000), 0x100, MappingFlags::empty()).unwrap();

        gmmu.write(0x1000, &[7u8; 0x40]).unwrap();
        gmmu.copy(0x3020, 0x1000, 0x40).unwrap();

        let mut buf = [0u8; 0x60];
        gmmu.read(&mut buf, 0x3000).unwrap();
        assert_eq!(&buf[..0x20], &[0; 0x20]);
        assert_eq!(&buf[0x20..], &[7; 0x40]);

        assert!(gmmu.copy(0x3000, 0x2000, 0x10).is_err());
    }

    #[test]
    fn test_access_callback_sees_host_spans() {
        use parking_lot::Mutex;

        let host = Arc::new(HostMemory::new());
        let base = host.allocate(0x1000);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let gmmu = Gmmu16::new(host, 0xFFFF)
            .unwrap()
            .with_access_callback(move |span| sink.lock().push(span));

        gmmu.map(0x1000, base, 0x80, MappingFlags::empty()).unwrap();
        gmmu.map_sparse(0x1080, 0x80).unwrap();
        gmmu.map(0x1100, base.offset_by(0x800), 0x80, MappingFlags::empty()).unwrap();

        gmmu.translate_range(0x1040, 0x100).unwrap();
        assert_eq!(
            seen.lock().drain(..).collect::<Vec<_>>(),
            vec![
                HostSpan::Host { address: base.offset_by(0x40), len: 0x40 },
                HostSpan::Host { address: base.offset_by(0x800), len: 0x40 },
            ]
        );

        gmmu.write(0x1000, &[1; 0x10]).unwrap();
        let mut buf = [0u8; 0x10];
        gmmu.read(&mut buf, 0x1100).unwrap();
        gmmu.read_till(&mut buf, 0x1000, |_| Some(0)).unwrap();
        assert_eq!(
            seen.lock().drain(..).collect::<Vec<_>>(),
            vec![
                HostSpan::Host { address: base, len: 0x10 },
                HostSpan::Host { address: base.offset_by(0x800), len: 0x10 },
                HostSpan::Host { address: base, len: 0x10 },
            ]
        );

        // Faulting translations report nothing
        assert!(gmmu.read(&mut buf, 0x2000).is_err());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_unmap_callback_invoked() {
        use std::sync::atomic::{AtomicU64, Ordering};

        let host = Arc::new(HostMemory::new());
        let base = host.allocate(0x1000);
        let touched = Arc::new(AtomicU64::new(0));
        let sink = touched.clone();
        let gmmu = Gmmu16::with_unmap_callback(host, 0xFFFF, move |virt, size| {
            sink.fetch_add(u64::from(size), Ordering::Relaxed);
            assert!(virt >= 0x1000);
        })
        .unwrap();

        gmmu.map(0x1000, base, 0x100, MappingFlags::empty()).unwrap();
        gmmu.unmap(0x1000, 0x80).unwrap();
        assert_eq!(touched.load(Ordering::Relaxed), 0x180);
    }
}
