//! Virtual address and backing value abstractions

use std::fmt::{Debug, UpperHex};
use std::hash::Hash;
use std::ops::{Add, Sub};

/// An unsigned integer usable as a virtual address
pub trait VirtualAddress:
    Copy + Ord + Hash + Debug + UpperHex + Add<Output = Self> + Sub<Output = Self> + Send + Sync + 'static
{
    /// Address zero, where every block list starts
    const ZERO: Self;
    /// Width of the type in bits
    const WIDTH: u32;

    fn checked_add(self, rhs: Self) -> Option<Self>;

    /// Widen to `u64`
    fn to_u64(self) -> u64;

    /// Narrow from `u64`, `None` if the value does not fit
    fn from_u64(value: u64) -> Option<Self>;
}

macro_rules! impl_virtual_address {
    ($($ty:ty),*) => {
        $(
            impl VirtualAddress for $ty {
                const ZERO: Self = 0;
                const WIDTH: u32 = <$ty>::BITS;

                #[inline]
                fn checked_add(self, rhs: Self) -> Option<Self> {
                    <$ty>::checked_add(self, rhs)
                }

                #[inline]
                fn to_u64(self) -> u64 {
                    self as u64
                }

                #[inline]
                fn from_u64(value: u64) -> Option<Self> {
                    <$ty>::try_from(value).ok()
                }
            }
        )*
    };
}

impl_virtual_address!(u16, u32, u64);

/// The value a block's virtual range resolves to
///
/// A backing is either the `UNMAPPED` sentinel or some mapped value. When a
/// block is split, the part after the split point takes `advance(offset)` of
/// the original value: pointer-like backings move forward with the VA while
/// marker backings stay the same.
pub trait Backing: Copy + PartialEq + Debug + Send + Sync + 'static {
    /// Sentinel for "not backed"
    const UNMAPPED: Self;

    #[inline]
    fn is_mapped(&self) -> bool {
        *self != Self::UNMAPPED
    }

    /// The backing value `offset` bytes into a run starting at `self`
    fn advance(self, offset: u64) -> Self;
}

/// Allocation marker used by the VA allocator, `true` means allocated
impl Backing for bool {
    const UNMAPPED: Self = false;

    #[inline]
    fn advance(self, _offset: u64) -> Self {
        self
    }
}

/// Largest VA reachable with `bits` address bits
///
/// Computed as two halves so a full-width address space doesn't overflow.
pub const fn va_maximum(bits: u32) -> u64 {
    (1u64 << (bits - 1)) + ((1u64 << (bits - 1)) - 1)
}
