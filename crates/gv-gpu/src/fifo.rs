//! GPFIFO command processing
//!
//! Each GP entry points at a push buffer in GPU virtual memory. The push
//! buffer is fetched through the GMMU (it may span several mappings) and
//! decoded into method calls, which are queued on a [`CommandFifo`]. A
//! method whose arguments run past the end of one push buffer is resumed at
//! the start of the next.

use std::collections::VecDeque;
use std::sync::Arc;

use gv_core::error::MemoryError;
use gv_memory::GpuMemoryManager;

/// A decoded method call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodCall {
    /// Method address in words
    pub method: u32,
    pub argument: u32,
    pub subchannel: u8,
}

/// Queue of decoded method calls
pub struct CommandFifo {
    queue: VecDeque<MethodCall>,
    /// Number of calls ever pushed
    put: u64,
    /// Number of calls ever popped
    get: u64,
}

impl CommandFifo {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::with_capacity(4096),
            put: 0,
            get: 0,
        }
    }

    pub fn push(&mut self, call: MethodCall) {
        self.queue.push_back(call);
        self.put += 1;
    }

    pub fn pop(&mut self) -> Option<MethodCall> {
        let call = self.queue.pop_front();
        if call.is_some() {
            self.get += 1;
        }
        call
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn get_ptr(&self) -> u64 {
        self.get
    }

    pub fn put_ptr(&self) -> u64 {
        self.put
    }
}

impl Default for CommandFifo {
    fn default() -> Self {
        Self::new()
    }
}

/// A GPFIFO entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpEntry(pub u64);

impl GpEntry {
    /// Build an entry for a push buffer of `size` words at `address`
    pub fn new(address: u64, size: u32) -> Self {
        let low = address & 0xFFFF_FFFC;
        let high = (address >> 32) & 0xFF;
        let size = u64::from(size & 0x1F_FFFF) << 10;
        Self(low | ((high | size) << 32))
    }

    fn entry0(self) -> u32 {
        self.0 as u32
    }

    fn entry1(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// GPU address of the push buffer
    pub fn address(self) -> u64 {
        (u64::from(self.entry1() & 0xFF) << 32) | u64::from(self.entry0() & 0xFFFF_FFFC)
    }

    /// Push buffer length in words, zero for control entries
    pub fn size(self) -> u32 {
        (self.entry1() >> 10) & 0x1F_FFFF
    }

    /// Control opcode, only meaningful when [`size`](Self::size) is zero
    pub fn opcode(self) -> u8 {
        (self.entry1() & 0xFF) as u8
    }

    pub fn is_sync(self) -> bool {
        self.entry1() & (1 << 31) != 0
    }
}

/// How a method's arguments map onto method addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SecOp {
    Grp0UseTert = 0,
    /// Each argument goes to the next method
    IncMethod = 1,
    Grp2UseTert = 2,
    /// Every argument goes to the same method
    NonIncMethod = 3,
    /// The argument is encoded in the header
    ImmdDataMethod = 4,
    /// First argument to the method, the rest to the next one
    OneInc = 5,
    Reserved6 = 6,
    EndPbSegment = 7,
}

impl From<u8> for SecOp {
    fn from(value: u8) -> Self {
        match value & 0x7 {
            0 => Self::Grp0UseTert,
            1 => Self::IncMethod,
            2 => Self::Grp2UseTert,
            3 => Self::NonIncMethod,
            4 => Self::ImmdDataMethod,
            5 => Self::OneInc,
            6 => Self::Reserved6,
            _ => Self::EndPbSegment,
        }
    }
}

/// A push buffer method header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodHeader(pub u32);

impl MethodHeader {
    pub fn method_address(self) -> u32 {
        self.0 & 0xFFF
    }

    pub fn subchannel(self) -> u8 {
        ((self.0 >> 13) & 0x7) as u8
    }

    /// Argument count, or the immediate value for [`SecOp::ImmdDataMethod`]
    pub fn method_count(self) -> u32 {
        (self.0 >> 16) & 0x1FFF
    }

    pub fn sec_op(self) -> SecOp {
        SecOp::from((self.0 >> 29) as u8)
    }

    pub fn encode(sec_op: SecOp, subchannel: u8, method_address: u32, count: u32) -> Self {
        Self(
            ((sec_op as u32) << 29)
                | ((count & 0x1FFF) << 16)
                | (u32::from(subchannel & 0x7) << 13)
                | (method_address & 0xFFF),
        )
    }
}

/// Progress through a method whose arguments haven't all been seen yet
#[derive(Debug, Clone, Copy)]
struct MethodResumeState {
    remaining: u32,
    address: u32,
    subchannel: u8,
    sec_op: SecOp,
}

/// GPFIFO processor for one channel
pub struct GpFifo {
    gmmu: Arc<GpuMemoryManager>,
    fifo: CommandFifo,
    resume_state: Option<MethodResumeState>,
}

impl GpFifo {
    pub fn new(gmmu: Arc<GpuMemoryManager>) -> Self {
        Self {
            gmmu,
            fifo: CommandFifo::new(),
            resume_state: None,
        }
    }

    pub fn fifo(&mut self) -> &mut CommandFifo {
        &mut self.fifo
    }

    /// Whether a method is waiting for arguments from the next push buffer
    pub fn is_resuming(&self) -> bool {
        self.resume_state.is_some()
    }

    /// Fetch `words` words of push buffer at `address`
    fn fetch(&self, address: u64, words: u32) -> Result<Vec<u32>, MemoryError> {
        let mut bytes = vec![0u8; words as usize * 4];
        self.gmmu.read(&mut bytes, address)?;

        Ok(bytes
            .chunks_exact(4)
            .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
            .collect())
    }

    /// Feed pending arguments from `words[index..]`, returning the index after the last one consumed
    fn resume(&mut self, words: &[u32], mut index: usize) -> usize {
        while let Some(state) = self.resume_state.as_mut() {
            let Some(&argument) = words.get(index) else {
                break;
            };

            self.fifo.push(MethodCall {
                method: state.address,
                argument,
                subchannel: state.subchannel,
            });
            index += 1;

            match state.sec_op {
                SecOp::IncMethod => state.address += 1,
                SecOp::OneInc => {
                    state.address += 1;
                    state.sec_op = SecOp::NonIncMethod;
                }
                _ => {}
            }

            state.remaining -= 1;
            if state.remaining == 0 {
                self.resume_state = None;
            }
        }

        index
    }

    /// Decode the push buffer behind one GP entry
    pub fn process(&mut self, entry: GpEntry) -> Result<(), MemoryError> {
        if entry.size() == 0 {
            match entry.opcode() {
                0 => tracing::trace!("GPFIFO nop"),
                opcode => tracing::warn!("Unsupported GPFIFO control opcode: {}", opcode),
            }
            return Ok(());
        }

        let words = self.fetch(entry.address(), entry.size())?;
        let mut index = self.resume(&words, 0);

        while index < words.len() {
            let header = MethodHeader(words[index]);
            index += 1;

            match header.sec_op() {
                SecOp::IncMethod | SecOp::NonIncMethod | SecOp::OneInc => {
                    if header.method_count() == 0 {
                        continue;
                    }
                    self.resume_state = Some(MethodResumeState {
                        remaining: header.method_count(),
                        address: header.method_address(),
                        subchannel: header.subchannel(),
                        sec_op: header.sec_op(),
                    });
                    index = self.resume(&words, index);
                }
                SecOp::ImmdDataMethod => self.fifo.push(MethodCall {
                    method: header.method_address(),
                    argument: header.method_count(),
                    subchannel: header.subchannel(),
                }),
                SecOp::EndPbSegment => return Ok(()),
                SecOp::Grp0UseTert if header.0 == 0 => {}
                sec_op => tracing::warn!("Unsupported method header 0x{:08X} ({:?})", header.0, sec_op),
            }
        }

        Ok(())
    }
}
