//! Segregated heap page configurations
//!
//! # Architecture
//!
//! Every heap configuration carves pages from one shared reservation:
//!
//! ```text
//! AllocatorSubsystem
//!   ├─→ ReservationFreeHeap   (OS chunks → first-fit free ranges)
//!   ├─→ PageSharingCache      (emptied pages, reused before carving)
//!   └─→ HeapLock              (page creation / destruction)
//!
//! HeapConfig
//!   ├─→ OutlineMediumPageHeaderConfig → PageHeaderTable → PageBase
//!   └─→ InlineMediumPageHeaderConfig  → PageBase at the page boundary
//!
//! SegregatedHeap<C: HeapConfig>
//!   └─→ allocate / deallocate objects of one size
//! ```
//!
//! There is no process-wide allocator state: the subsystem owns the
//! reservation, the cache and the lock, and configurations borrow them
//! through a [`HeapEnvironment`].

pub mod alignment;
pub mod header_table;
pub mod heap;
pub mod heap_config;
pub mod inline_medium;
pub mod lock;
pub mod outline_medium;
pub mod page;
pub mod platform;
pub mod reservation;
pub mod sharing_cache;

pub use crate::config::AllocatorConfig;
pub use alignment::{AllocationKind, AllocationResult, Alignment};
pub use header_table::PageHeaderTable;
pub use heap::SegregatedHeap;
pub use heap_config::{
    AlignedAllocationResult, HeapConfig, HeapEnvironment, RuntimeConfig, SharedDirectoryId,
    SharingMode, ViewCacheCapacity,
};
pub use inline_medium::InlineMediumPageHeaderConfig;
pub use lock::{HeapLock, LockHoldMode};
pub use outline_medium::OutlineMediumPageHeaderConfig;
pub use page::{EmptyMode, PageBase, PageKind, PageRole};
pub use platform::{PlatformMemory, SystemMemory};
pub use reservation::{ReservationConfig, ReservationFreeHeap, ReservationStats};
pub use sharing_cache::{PageSharingCache, PhysicalMemoryTransaction, SharingCacheStats};

use std::sync::Arc;
use tracing::info;

/// Owner of the reservation, sharing cache and heap lock
pub struct AllocatorSubsystem {
    reservation: Arc<ReservationFreeHeap>,
    sharing_cache: Arc<PageSharingCache>,
    heap_lock: Arc<HeapLock>,
}

impl AllocatorSubsystem {
    pub fn new(platform: Arc<dyn PlatformMemory>, config: AllocatorConfig) -> Self {
        let reservation = Arc::new(ReservationFreeHeap::new(
            platform,
            ReservationConfig {
                chunk_size: config.reservation_chunk_size,
                max_reserved_bytes: config.max_reserved_bytes,
            },
        ));
        let sharing_cache = Arc::new(PageSharingCache::new(
            Arc::clone(&reservation),
            config.sharing_cache_capacity,
        ));

        info!(
            chunk_size = config.reservation_chunk_size,
            max_reserved_bytes = config.max_reserved_bytes,
            sharing_cache_capacity = config.sharing_cache_capacity,
            "Allocator subsystem initialized"
        );

        Self {
            reservation,
            sharing_cache,
            heap_lock: Arc::new(HeapLock::new()),
        }
    }

    /// Subsystem backed by the operating system's virtual memory
    pub fn with_system_memory(config: AllocatorConfig) -> Self {
        Self::new(Arc::new(SystemMemory::new()), config)
    }

    pub fn environment(&self) -> HeapEnvironment {
        HeapEnvironment {
            sharing_cache: Arc::clone(&self.sharing_cache),
            heap_lock: Arc::clone(&self.heap_lock),
        }
    }

    pub fn reservation(&self) -> &Arc<ReservationFreeHeap> {
        &self.reservation
    }

    pub fn sharing_cache(&self) -> &Arc<PageSharingCache> {
        &self.sharing_cache
    }

    pub fn heap_lock(&self) -> &Arc<HeapLock> {
        &self.heap_lock
    }

    pub fn outline_medium_config(&self) -> OutlineMediumPageHeaderConfig {
        OutlineMediumPageHeaderConfig::new(self.environment())
    }

    pub fn inline_medium_config(&self) -> InlineMediumPageHeaderConfig {
        InlineMediumPageHeaderConfig::new(self.environment())
    }

    /// Get allocator statistics
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            reservation: self.reservation.stats(),
            sharing_cache: self.sharing_cache.stats(),
        }
    }
}

/// Combined reservation and sharing-cache statistics
#[derive(Debug, Clone, Copy)]
pub struct AllocatorStats {
    pub reservation: ReservationStats,
    pub sharing_cache: SharingCacheStats,
}

/// Every heap configuration available on `subsystem`
pub fn all_heap_configs(subsystem: &AllocatorSubsystem) -> Vec<Box<dyn HeapConfig>> {
    vec![
        Box::new(subsystem.outline_medium_config()),
        Box::new(subsystem.inline_medium_config()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_heap_configs() {
        let subsystem = AllocatorSubsystem::with_system_memory(AllocatorConfig::default());
        let configs = all_heap_configs(&subsystem);

        let names: Vec<&str> = configs.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["outline_medium_page_header", "inline_medium_page_header"]);
        for config in &configs {
            assert_eq!(config.page_size(), 128 * 1024);
            assert_eq!(config.page_kind(), PageKind::SmallExclusiveSegregated);
        }
    }

    #[test]
    fn test_configs_share_one_reservation() {
        let subsystem = AllocatorSubsystem::with_system_memory(AllocatorConfig::default());
        let mut transaction = PhysicalMemoryTransaction::new();

        for config in all_heap_configs(&subsystem) {
            let page = config.allocate_page("test", &mut transaction, PageRole::Exclusive);
            assert!(page.is_some());
        }

        let stats = subsystem.stats();
        assert_eq!(stats.reservation.chunk_count, 1);
        assert_eq!(stats.reservation.allocated_bytes, 2 * 128 * 1024);
        assert_eq!(stats.sharing_cache.pages_carved, 2);
    }
}
