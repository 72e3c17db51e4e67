//! Medium-page configuration with out-of-line headers
//!
//! Headers live in a [`PageHeaderTable`], so the whole 128K page is payload.
//! The price is a table lookup to get from an address to its header.
//!
//! Pages are exclusive only: there are no shared page directories and no
//! aligned allocator.

use super::alignment::{align, Alignment};
use super::header_table::PageHeaderTable;
use super::heap_config::{
    allocate_exclusive_page, AlignedAllocationResult, HeapConfig, HeapEnvironment, RuntimeConfig,
    SharedDirectoryId,
};
use super::lock::LockHoldMode;
use super::page::{PageBase, PageKind, PageRole};
use super::sharing_cache::PhysicalMemoryTransaction;
use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;

pub const OUTLINE_MEDIUM_PAGE_HEADER_PAGE_SIZE: usize = 128 * 1024;

/// Header storage per page, rounded to a cache line
pub const OUTLINE_MEDIUM_PAGE_HEADER_HEADER_SIZE: usize = align(mem::size_of::<PageBase>(), 64);

const PAGE_NAME: &str = "outline_medium_page_header_config/page";

/// Outline-header medium page configuration
pub struct OutlineMediumPageHeaderConfig {
    env: HeapEnvironment,
    table: Arc<PageHeaderTable>,
    runtime: RuntimeConfig,
}

impl OutlineMediumPageHeaderConfig {
    pub fn new(env: HeapEnvironment) -> Self {
        Self::with_runtime_config(env, RuntimeConfig::default())
    }

    pub fn with_runtime_config(env: HeapEnvironment, runtime: RuntimeConfig) -> Self {
        Self {
            env,
            table: Arc::new(PageHeaderTable::new(
                OUTLINE_MEDIUM_PAGE_HEADER_PAGE_SIZE,
                OUTLINE_MEDIUM_PAGE_HEADER_HEADER_SIZE,
            )),
            runtime,
        }
    }

    /// The table holding this configuration's headers
    pub fn header_table(&self) -> &Arc<PageHeaderTable> {
        &self.table
    }
}

impl HeapConfig for OutlineMediumPageHeaderConfig {
    fn name(&self) -> &'static str {
        "outline_medium_page_header"
    }

    fn page_size(&self) -> usize {
        OUTLINE_MEDIUM_PAGE_HEADER_PAGE_SIZE
    }

    fn header_size(&self) -> usize {
        OUTLINE_MEDIUM_PAGE_HEADER_HEADER_SIZE
    }

    fn page_kind(&self) -> PageKind {
        PageKind::SmallExclusiveSegregated
    }

    fn runtime_config(&self) -> &RuntimeConfig {
        &self.runtime
    }

    fn environment(&self) -> &HeapEnvironment {
        &self.env
    }

    fn allocate_page(
        &self,
        _heap_name: &str,
        transaction: &mut PhysicalMemoryTransaction,
        role: PageRole,
    ) -> Option<NonNull<u8>> {
        allocate_exclusive_page(
            &self.env,
            OUTLINE_MEDIUM_PAGE_HEADER_PAGE_SIZE,
            PAGE_NAME,
            transaction,
            role,
        )
    }

    fn create_page_header(
        &self,
        boundary: NonNull<u8>,
        kind: PageKind,
        object_size: usize,
        lock_mode: LockHoldMode,
    ) -> NonNull<PageBase> {
        assert_eq!(kind, PageKind::SmallExclusiveSegregated);

        let _guard = self.env.heap_lock.lock_conditionally(lock_mode);
        self.table.add(
            OUTLINE_MEDIUM_PAGE_HEADER_PAGE_SIZE,
            OUTLINE_MEDIUM_PAGE_HEADER_HEADER_SIZE,
            boundary.as_ptr() as usize,
            kind,
            object_size,
        )
    }

    fn destroy_page_header(&self, page: NonNull<PageBase>, lock_mode: LockHoldMode) {
        let _guard = self.env.heap_lock.lock_conditionally(lock_mode);
        self.table.remove(OUTLINE_MEDIUM_PAGE_HEADER_PAGE_SIZE, page);
    }

    fn header_for_boundary(&self, boundary: usize) -> Option<NonNull<PageBase>> {
        self.table.get(boundary)
    }

    fn shared_page_directory_selector(&self, _object_size: usize) -> Option<SharedDirectoryId> {
        unreachable!("outline medium pages are never shared")
    }

    fn for_each_shared_page_directory(
        &self,
        _callback: &mut dyn FnMut(SharedDirectoryId) -> bool,
    ) -> bool {
        true
    }

    fn dump_shared_page_directory_arg(&self, _directory: SharedDirectoryId) -> String {
        unreachable!("outline medium pages are never shared")
    }

    fn aligned_allocator(&self, _size: usize, _alignment: Alignment) -> AlignedAllocationResult {
        AlignedAllocationResult::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{AllocatorConfig, AllocatorSubsystem};

    fn config() -> (AllocatorSubsystem, OutlineMediumPageHeaderConfig) {
        let subsystem = AllocatorSubsystem::with_system_memory(AllocatorConfig::default());
        let config = subsystem.outline_medium_config();
        (subsystem, config)
    }

    #[test]
    fn test_page_geometry() {
        let (_subsystem, config) = config();
        assert_eq!(config.page_size(), 131072);
        assert_eq!(config.header_size() % 64, 0);
        assert!(config.header_size() >= mem::size_of::<PageBase>());
        assert_eq!(config.payload_offset(), 0);
    }

    #[test]
    fn test_allocate_page_is_page_aligned() {
        let (_subsystem, config) = config();
        let mut transaction = PhysicalMemoryTransaction::new();

        let page = config
            .allocate_page("test", &mut transaction, PageRole::Exclusive)
            .expect("allocate_page failed");
        assert_eq!(page.as_ptr() as usize % OUTLINE_MEDIUM_PAGE_HEADER_PAGE_SIZE, 0);
        assert_eq!(transaction.bytes_committed, OUTLINE_MEDIUM_PAGE_HEADER_PAGE_SIZE);
    }

    #[test]
    #[should_panic]
    fn test_shared_role_is_rejected() {
        let (_subsystem, config) = config();
        let mut transaction = PhysicalMemoryTransaction::new();
        config.allocate_page("test", &mut transaction, PageRole::Shared);
    }

    #[test]
    fn test_header_lifecycle() {
        let (_subsystem, config) = config();
        let mut transaction = PhysicalMemoryTransaction::new();
        let page = config
            .allocate_page("test", &mut transaction, PageRole::Exclusive)
            .unwrap();

        let header = config.create_page_header(
            page,
            PageKind::SmallExclusiveSegregated,
            1024,
            LockHoldMode::LockIsNotHeld,
        );
        let boundary = page.as_ptr() as usize;
        assert_eq!(config.header_for_boundary(boundary), Some(header));
        assert_eq!(config.header_table().len(), 1);

        config.destroy_page_header(header, LockHoldMode::LockIsNotHeld);
        assert!(config.header_for_boundary(boundary).is_none());
        assert!(config.header_table().is_empty());
    }

    #[test]
    fn test_create_header_with_lock_held() {
        let (_subsystem, config) = config();
        let mut transaction = PhysicalMemoryTransaction::new();
        let page = config
            .allocate_page("test", &mut transaction, PageRole::Exclusive)
            .unwrap();

        let guard = config.environment().heap_lock.lock();
        let header = config.create_page_header(
            page,
            PageKind::SmallExclusiveSegregated,
            1024,
            LockHoldMode::LockIsHeld,
        );
        config.destroy_page_header(header, LockHoldMode::LockIsHeld);
        drop(guard);

        assert!(config.header_table().is_empty());
    }

    #[test]
    #[should_panic]
    fn test_wrong_page_kind_is_rejected() {
        let (_subsystem, config) = config();
        config.create_page_header(
            NonNull::dangling(),
            PageKind::SmallBitfit,
            64,
            LockHoldMode::LockIsNotHeld,
        );
    }

    #[test]
    fn test_degenerate_hooks() {
        let (_subsystem, config) = config();

        let mut visited = 0;
        assert!(config.for_each_shared_page_directory(&mut |_| {
            visited += 1;
            true
        }));
        assert_eq!(visited, 0);

        let aligned = config.aligned_allocator(1 << 20, Alignment::traditional(4096));
        assert_eq!(aligned, AlignedAllocationResult::default());
    }

    #[test]
    #[should_panic(expected = "never shared")]
    fn test_shared_directory_selector_unreachable() {
        let (_subsystem, config) = config();
        config.shared_page_directory_selector(256);
    }
}
