//! Alignment and allocation result types shared by every allocator layer

use std::fmt;
use std::ptr::NonNull;

/// Rounds `to_be_aligned` up to a multiple of `alignment`.
///
/// `alignment` must be a power of two. Used for page-size rounding of
/// reservation chunks and for header sizes.
pub const fn align(to_be_aligned: usize, alignment: usize) -> usize {
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// Whether `address` is a multiple of the power-of-two `alignment`.
#[inline]
pub fn is_aligned(address: usize, alignment: usize) -> bool {
    address & (alignment - 1) == 0
}

/// Alignment requirement of an allocation.
///
/// An address `a` satisfies it when `a % alignment == alignment_begin`.
/// Most requests use [`Alignment::traditional`], where the begin offset is 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignment {
    pub alignment: usize,
    pub alignment_begin: usize,
}

impl Alignment {
    /// Create an alignment with an explicit begin offset
    pub fn new(alignment: usize, alignment_begin: usize) -> Self {
        assert!(
            alignment.is_power_of_two(),
            "alignment {} is not a power of two",
            alignment
        );
        assert!(alignment_begin < alignment);
        Self {
            alignment,
            alignment_begin,
        }
    }

    /// Plain power-of-two alignment
    pub fn traditional(alignment: usize) -> Self {
        Self::new(alignment, 0)
    }

    /// Check whether `address` satisfies this alignment
    pub fn is_satisfied_by(&self, address: usize) -> bool {
        address & (self.alignment - 1) == self.alignment_begin
    }

    /// Smallest address `>= address` that satisfies this alignment
    pub fn first_satisfying(&self, address: usize) -> usize {
        let base = address - (address & (self.alignment - 1));
        let candidate = base + self.alignment_begin;
        if candidate >= address {
            candidate
        } else {
            candidate + self.alignment
        }
    }
}

impl Default for Alignment {
    fn default() -> Self {
        Self::traditional(1)
    }
}

impl fmt::Display for Alignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.alignment, self.alignment_begin)
    }
}

/// Why an allocation was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationKind {
    /// Memory that will hold objects (pages)
    Object,
    /// Memory handed on to another allocator layer
    Delegate,
}

impl AllocationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationKind::Object => "object",
            AllocationKind::Delegate => "delegate",
        }
    }
}

/// Outcome of a non-throwing allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocationResult {
    /// First byte of the allocation, 0 when it failed
    pub begin: usize,
    pub did_succeed: bool,
}

impl AllocationResult {
    pub fn failed() -> Self {
        Self {
            begin: 0,
            did_succeed: false,
        }
    }

    pub fn succeeded(begin: usize) -> Self {
        debug_assert!(begin != 0);
        Self {
            begin,
            did_succeed: true,
        }
    }

    /// The allocation as a pointer, `None` when it failed
    pub fn as_ptr(&self) -> Option<NonNull<u8>> {
        if self.did_succeed {
            NonNull::new(self.begin as *mut u8)
        } else {
            None
        }
    }
}
