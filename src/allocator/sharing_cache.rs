//! Page-sharing cache
//!
//! Reuse layer between the reservation and the page directories. Emptied
//! pages land here and are handed out again before the reservation is asked
//! for fresh address space.

use super::alignment::{AllocationKind, AllocationResult, Alignment};
use super::page::EmptyMode;
use super::reservation::ReservationFreeHeap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// What the cache did while servicing one request
#[derive(Debug, Default, Clone, Copy)]
pub struct PhysicalMemoryTransaction {
    pub pages_reused: usize,
    pub pages_carved: usize,
    pub bytes_committed: usize,
}

impl PhysicalMemoryTransaction {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Default)]
struct CacheState {
    /// Emptied pages by size, most recently returned last
    pages: HashMap<usize, Vec<usize>>,
    cached_bytes: usize,
    pages_reused: u64,
    pages_carved: u64,
}

/// Cache of emptied pages shared by every heap configuration
pub struct PageSharingCache {
    reservation: Arc<ReservationFreeHeap>,
    capacity_bytes: usize,
    state: Mutex<CacheState>,
}

impl PageSharingCache {
    pub fn new(reservation: Arc<ReservationFreeHeap>, capacity_bytes: usize) -> Self {
        Self {
            reservation,
            capacity_bytes,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn reservation(&self) -> &Arc<ReservationFreeHeap> {
        &self.reservation
    }

    /// Hand out a committed, zeroed block of `size` bytes.
    ///
    /// Cached pages of the same size that satisfy `alignment` are reused
    /// first; otherwise the block is carved from the reservation. Returns a
    /// failed result on exhaustion.
    pub fn try_allocate_committed_with_alignment(
        &self,
        size: usize,
        alignment: Alignment,
        name: &str,
        transaction: &mut PhysicalMemoryTransaction,
    ) -> AllocationResult {
        let reused = {
            let mut state = self.state.lock();
            let candidate = state.pages.get_mut(&size).and_then(|pages| {
                let position = pages
                    .iter()
                    .rposition(|&begin| alignment.is_satisfied_by(begin))?;
                Some(pages.swap_remove(position))
            });
            if candidate.is_some() {
                state.cached_bytes -= size;
                state.pages_reused += 1;
            }
            candidate
        };

        if let Some(begin) = reused {
            // SAFETY: the page was carved from the reservation with `size`
            // bytes and nobody references it while it sits in the cache.
            unsafe { std::ptr::write_bytes(begin as *mut u8, 0, size) };
            transaction.pages_reused += 1;
            debug!(name, begin, size, "Reused cached page");
            return AllocationResult::succeeded(begin);
        }

        let result = self.reservation.try_allocate_with_alignment(
            size,
            alignment,
            name,
            AllocationKind::Object,
        );
        if result.did_succeed {
            transaction.pages_carved += 1;
            transaction.bytes_committed += size;
            self.state.lock().pages_carved += 1;
        }
        result
    }

    /// Take back an emptied page
    pub fn return_page(&self, begin: usize, size: usize, empty_mode: EmptyMode) {
        assert_eq!(
            empty_mode,
            EmptyMode::IsEmpty,
            "only empty pages can be shared"
        );

        let mut state = self.state.lock();
        state.pages.entry(size).or_default().push(begin);
        state.cached_bytes += size;

        if state.cached_bytes > self.capacity_bytes {
            // The reservation cannot take pages back, so the page stays cached.
            debug!(
                cached_bytes = state.cached_bytes,
                capacity = self.capacity_bytes,
                "Sharing cache above capacity"
            );
        }
    }

    /// Get cache statistics
    pub fn stats(&self) -> SharingCacheStats {
        let state = self.state.lock();
        SharingCacheStats {
            cached_pages: state.pages.values().map(Vec::len).sum(),
            cached_bytes: state.cached_bytes,
            pages_reused: state.pages_reused,
            pages_carved: state.pages_carved,
        }
    }
}

/// Sharing cache statistics
#[derive(Debug, Default, Clone, Copy)]
pub struct SharingCacheStats {
    pub cached_pages: usize,
    pub cached_bytes: usize,
    pub pages_reused: u64,
    pub pages_carved: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::platform::SystemMemory;
    use crate::allocator::reservation::ReservationConfig;

    fn cache() -> PageSharingCache {
        let reservation = Arc::new(ReservationFreeHeap::new(
            Arc::new(SystemMemory::new()),
            ReservationConfig {
                chunk_size: 1 << 20,
                max_reserved_bytes: 8 << 20,
            },
        ));
        PageSharingCache::new(reservation, 1 << 20)
    }

    #[test]
    fn test_returned_page_is_reused() {
        let cache = cache();
        let alignment = Alignment::traditional(16384);
        let mut transaction = PhysicalMemoryTransaction::new();

        let first = cache.try_allocate_committed_with_alignment(
            16384,
            alignment,
            "test/page",
            &mut transaction,
        );
        assert!(first.did_succeed);
        assert_eq!(transaction.pages_carved, 1);

        unsafe { *(first.begin as *mut u8) = 0xAB };
        cache.return_page(first.begin, 16384, EmptyMode::IsEmpty);
        assert_eq!(cache.stats().cached_pages, 1);

        let second = cache.try_allocate_committed_with_alignment(
            16384,
            alignment,
            "test/page",
            &mut transaction,
        );
        assert_eq!(second.begin, first.begin);
        assert_eq!(transaction.pages_reused, 1);
        // Reused pages come back zeroed.
        assert_eq!(unsafe { *(second.begin as *const u8) }, 0);

        let stats = cache.stats();
        assert_eq!(stats.cached_pages, 0);
        assert_eq!(stats.pages_reused, 1);
    }

    #[test]
    fn test_size_mismatch_is_not_reused() {
        let cache = cache();
        let mut transaction = PhysicalMemoryTransaction::new();

        let small = cache.try_allocate_committed_with_alignment(
            4096,
            Alignment::traditional(4096),
            "small",
            &mut transaction,
        );
        cache.return_page(small.begin, 4096, EmptyMode::IsEmpty);

        let large = cache.try_allocate_committed_with_alignment(
            8192,
            Alignment::traditional(8192),
            "large",
            &mut transaction,
        );
        assert!(large.did_succeed);
        assert_ne!(large.begin, small.begin);
        assert_eq!(cache.stats().cached_pages, 1);
    }

    #[test]
    #[should_panic(expected = "only empty pages")]
    fn test_non_empty_page_rejected() {
        let cache = cache();
        cache.return_page(0x1000, 4096, EmptyMode::IsNotEmpty);
    }
}
