//! Reservation free heap
//!
//! The single source of address space for every heap configuration.
//!
//! ```text
//! PlatformMemory (mmap / VirtualAlloc)
//!   └─→ ReservationFreeHeap   chunks carved by first fit, never given back piecemeal
//!        └─→ PageSharingCache recycles emptied pages
//!             └─→ HeapConfig::allocate_page
//! ```
//!
//! Allocations are never returned individually. Emptied pages go to the
//! sharing cache one level up; the reserved chunks are released when the heap
//! itself is dropped.

use super::alignment::{AllocationKind, AllocationResult, Alignment};
use super::platform::PlatformMemory;
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Reservation sizing
#[derive(Debug, Clone, Copy)]
pub struct ReservationConfig {
    /// Minimum number of bytes requested from the platform at once
    pub chunk_size: usize,
    /// Upper bound on all reserved bytes
    pub max_reserved_bytes: usize,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024 * 1024,
            max_reserved_bytes: 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRange {
    begin: usize,
    end: usize,
}

impl FreeRange {
    fn len(&self) -> usize {
        self.end - self.begin
    }
}

#[derive(Debug)]
struct Chunk {
    base: usize,
    len: usize,
}

#[derive(Debug, Default)]
struct ReservationState {
    /// Free ranges sorted by address, never overlapping or touching
    free_ranges: Vec<FreeRange>,
    chunks: Vec<Chunk>,
    reserved_bytes: usize,
    allocated_bytes: usize,
}

impl ReservationState {
    /// First-fit carve of `size` bytes satisfying `alignment`
    fn carve(&mut self, size: usize, alignment: Alignment) -> Option<usize> {
        let index = self.free_ranges.iter().position(|range| {
            let start = alignment.first_satisfying(range.begin);
            start
                .checked_add(size)
                .map_or(false, |end| end <= range.end)
        })?;

        let range = self.free_ranges[index];
        let start = alignment.first_satisfying(range.begin);
        let end = start + size;

        let prefix = FreeRange {
            begin: range.begin,
            end: start,
        };
        let suffix = FreeRange {
            begin: end,
            end: range.end,
        };

        let replacement: Vec<FreeRange> = [prefix, suffix]
            .into_iter()
            .filter(|r| r.len() > 0)
            .collect();
        self.free_ranges.splice(index..=index, replacement);

        self.allocated_bytes += size;
        Some(start)
    }

    /// Insert a range, coalescing with its neighbours
    fn insert_free(&mut self, mut range: FreeRange) {
        let index = self
            .free_ranges
            .partition_point(|existing| existing.begin < range.begin);

        if index < self.free_ranges.len() && self.free_ranges[index].begin == range.end {
            range.end = self.free_ranges[index].end;
            self.free_ranges.remove(index);
        }

        if index > 0 && self.free_ranges[index - 1].end == range.begin {
            self.free_ranges[index - 1].end = range.end;
        } else {
            self.free_ranges.insert(index, range);
        }
    }
}

/// The process's large address-space reservation.
///
/// Constructed explicitly and shared by `Arc` with whichever layer needs it.
pub struct ReservationFreeHeap {
    platform: Arc<dyn PlatformMemory>,
    config: ReservationConfig,
    state: Mutex<ReservationState>,
}

impl ReservationFreeHeap {
    /// Create an empty reservation. No memory is reserved until the first
    /// allocation.
    pub fn new(platform: Arc<dyn PlatformMemory>, config: ReservationConfig) -> Self {
        info!(
            chunk_size = config.chunk_size,
            max_reserved_bytes = config.max_reserved_bytes,
            "Initializing reservation free heap"
        );
        Self {
            platform,
            config,
            state: Mutex::new(ReservationState::default()),
        }
    }

    /// OS page size of the backing platform
    pub fn platform_page_size(&self) -> usize {
        self.platform.page_size()
    }

    /// Allocate `size` bytes satisfying `alignment`.
    ///
    /// Returns [`AllocationResult::failed`] when the reservation is exhausted
    /// or the platform refuses more memory.
    pub fn try_allocate_with_alignment(
        &self,
        size: usize,
        alignment: Alignment,
        name: &str,
        kind: AllocationKind,
    ) -> AllocationResult {
        if size == 0 {
            return AllocationResult::failed();
        }

        let mut state = self.state.lock();

        if let Some(begin) = state.carve(size, alignment) {
            debug!(name, kind = kind.as_str(), size, begin, "Carved from reservation");
            return AllocationResult::succeeded(begin);
        }

        // No free range fits, reserve a fresh chunk large enough for the
        // worst-case alignment padding.
        let page_size = self.platform.page_size();
        let wanted = size
            .checked_add(alignment.alignment)
            .map(|needed| needed.max(self.config.chunk_size))
            .and_then(|needed| needed.checked_add(page_size - 1))
            .map(|padded| padded & !(page_size - 1));
        let Some(wanted) = wanted else {
            debug!(name, size, "Request size overflows the address space");
            return AllocationResult::failed();
        };

        let within_limit = state
            .reserved_bytes
            .checked_add(wanted)
            .map_or(false, |total| total <= self.config.max_reserved_bytes);
        if !within_limit {
            debug!(
                name,
                size,
                reserved = state.reserved_bytes,
                "Reservation limit reached"
            );
            return AllocationResult::failed();
        }

        let base = match self.platform.request_memory(wanted) {
            Some(base) => base.as_ptr() as usize,
            None => {
                debug!(name, wanted, "Platform refused reservation chunk");
                return AllocationResult::failed();
            }
        };

        state.chunks.push(Chunk { base, len: wanted });
        state.reserved_bytes += wanted;
        state.insert_free(FreeRange {
            begin: base,
            end: base + wanted,
        });
        debug!(base, len = wanted, "Reserved new chunk");

        match state.carve(size, alignment) {
            Some(begin) => {
                debug!(name, kind = kind.as_str(), size, begin, "Carved from reservation");
                AllocationResult::succeeded(begin)
            }
            None => AllocationResult::failed(),
        }
    }

    /// Like [`Self::try_allocate_with_alignment`], but exhaustion aborts the
    /// process.
    pub fn allocate_with_alignment(
        &self,
        size: usize,
        alignment: Alignment,
        name: &str,
        kind: AllocationKind,
    ) -> AllocationResult {
        let result = self.try_allocate_with_alignment(size, alignment, name, kind);
        if !result.did_succeed {
            error!(
                name,
                size,
                alignment = %alignment,
                "Reservation free heap exhausted"
            );
            std::process::abort();
        }
        result
    }

    /// Get statistics about the reservation
    pub fn stats(&self) -> ReservationStats {
        let state = self.state.lock();
        ReservationStats {
            reserved_bytes: state.reserved_bytes,
            allocated_bytes: state.allocated_bytes,
            free_bytes: state.free_ranges.iter().map(FreeRange::len).sum(),
            chunk_count: state.chunks.len(),
            free_range_count: state.free_ranges.len(),
        }
    }
}

impl Drop for ReservationFreeHeap {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for chunk in state.chunks.drain(..) {
            if let Some(base) = NonNull::new(chunk.base as *mut u8) {
                // SAFETY: every chunk came from this platform and the heap is
                // going away, so no page carved from it is reachable anymore.
                unsafe { self.platform.return_memory(base, chunk.len) };
            }
        }
    }
}

/// Statistics for the reservation free heap
#[derive(Debug, Default, Clone, Copy)]
pub struct ReservationStats {
    pub reserved_bytes: usize,
    pub allocated_bytes: usize,
    pub free_bytes: usize,
    pub chunk_count: usize,
    pub free_range_count: usize,
}
