//! Page kinds and the page header
//!
//! A page is a fixed-size, committed block from which objects of one size
//! class are carved. Its header tracks which object slots are live:
//!
//! ```text
//! outline:  PageHeaderTable ─→ PageBase      page: [slot 0][slot 1]...[slot n]
//! inline:   page: [PageBase | pad][slot 0][slot 1]...[slot n]
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Whether a page still holds live objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyMode {
    IsNotEmpty,
    IsEmpty,
}

impl EmptyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmptyMode::IsNotEmpty => "is_not_empty",
            EmptyMode::IsEmpty => "is_empty",
        }
    }
}

impl fmt::Display for EmptyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who owns a page: a single size directory, or a shared directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRole {
    Exclusive,
    Shared,
}

/// Every page flavour a heap configuration may produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    SmallExclusiveSegregated,
    MediumExclusiveSegregated,
    SmallSharedSegregated,
    MediumSharedSegregated,
    SmallBitfit,
    MediumBitfit,
    MarginalBitfit,
}

impl PageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageKind::SmallExclusiveSegregated => "small_exclusive_segregated",
            PageKind::MediumExclusiveSegregated => "medium_exclusive_segregated",
            PageKind::SmallSharedSegregated => "small_shared_segregated",
            PageKind::MediumSharedSegregated => "medium_shared_segregated",
            PageKind::SmallBitfit => "small_bitfit",
            PageKind::MediumBitfit => "medium_bitfit",
            PageKind::MarginalBitfit => "marginal_bitfit",
        }
    }

    /// Directory role of segregated pages; bitfit pages are always exclusive
    pub fn role(&self) -> PageRole {
        match self {
            PageKind::SmallSharedSegregated | PageKind::MediumSharedSegregated => PageRole::Shared,
            _ => PageRole::Exclusive,
        }
    }
}

impl fmt::Display for PageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header of one committed page.
///
/// Slot bookkeeping uses interior mutability so headers can be reached
/// through the raw pointers handed out by header tables.
#[derive(Debug)]
pub struct PageBase {
    boundary: usize,
    kind: PageKind,
    page_size: usize,
    object_size: usize,
    payload_offset: usize,
    num_allocated: AtomicUsize,
    alloc_bits: Mutex<Vec<u64>>,
}

impl PageBase {
    /// Create the header for the page starting at `boundary`
    pub fn new(
        boundary: usize,
        kind: PageKind,
        page_size: usize,
        object_size: usize,
        payload_offset: usize,
    ) -> Self {
        assert!(object_size > 0, "object size must be non-zero");
        assert!(payload_offset < page_size);

        let capacity = (page_size - payload_offset) / object_size;
        Self {
            boundary,
            kind,
            page_size,
            object_size,
            payload_offset,
            num_allocated: AtomicUsize::new(0),
            alloc_bits: Mutex::new(vec![0u64; capacity.div_ceil(64)]),
        }
    }

    pub fn boundary(&self) -> usize {
        self.boundary
    }

    pub fn kind(&self) -> PageKind {
        self.kind
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn payload_offset(&self) -> usize {
        self.payload_offset
    }

    /// Number of object slots on the page
    pub fn object_capacity(&self) -> usize {
        (self.page_size - self.payload_offset) / self.object_size
    }

    pub fn num_allocated(&self) -> usize {
        self.num_allocated.load(Ordering::Acquire)
    }

    pub fn empty_mode(&self) -> EmptyMode {
        if self.num_allocated() == 0 {
            EmptyMode::IsEmpty
        } else {
            EmptyMode::IsNotEmpty
        }
    }

    pub fn is_full(&self) -> bool {
        self.num_allocated() == self.object_capacity()
    }

    /// Whether `address` lies inside the page's byte range
    pub fn contains(&self, address: usize) -> bool {
        address >= self.boundary && address < self.boundary + self.page_size
    }

    /// Claim the lowest free slot and return its address
    pub fn allocate_slot(&self) -> Option<usize> {
        let capacity = self.object_capacity();
        let mut bits = self.alloc_bits.lock();

        for (word_index, word) in bits.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let slot = word_index * 64 + bit;
            if slot >= capacity {
                return None;
            }
            *word |= 1 << bit;
            self.num_allocated.fetch_add(1, Ordering::AcqRel);
            return Some(self.boundary + self.payload_offset + slot * self.object_size);
        }

        None
    }

    /// Release the slot at `address`, reporting whether the page is now empty
    pub fn free_slot(&self, address: usize) -> EmptyMode {
        let payload = self.boundary + self.payload_offset;
        assert!(
            address >= payload && address < self.boundary + self.page_size,
            "address {:#x} is not in the payload of page {:#x}",
            address,
            self.boundary
        );
        let offset = address - payload;
        assert_eq!(offset % self.object_size, 0, "address is not a slot start");

        let slot = offset / self.object_size;
        let mut bits = self.alloc_bits.lock();
        let mask = 1u64 << (slot % 64);
        assert!(bits[slot / 64] & mask != 0, "double free of {:#x}", address);
        bits[slot / 64] &= !mask;

        let remaining = self.num_allocated.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            EmptyMode::IsEmpty
        } else {
            EmptyMode::IsNotEmpty
        }
    }
}
