//! Medium-page configuration with the header inside the page
//!
//! The first `header_size` bytes of every page hold its `PageBase`; object
//! slots start right after. Finding a header is pointer arithmetic, at the
//! cost of one cache line of payload per page.

use super::alignment::{align, Alignment};
use super::heap_config::{
    allocate_exclusive_page, AlignedAllocationResult, HeapConfig, HeapEnvironment, RuntimeConfig,
    SharedDirectoryId,
};
use super::lock::LockHoldMode;
use super::page::{PageBase, PageKind, PageRole};
use super::sharing_cache::PhysicalMemoryTransaction;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::mem;
use std::ptr::{self, NonNull};
use tracing::trace;

pub const INLINE_MEDIUM_PAGE_HEADER_PAGE_SIZE: usize = 128 * 1024;

pub const INLINE_MEDIUM_PAGE_HEADER_HEADER_SIZE: usize = align(mem::size_of::<PageBase>(), 64);

const PAGE_NAME: &str = "inline_medium_page_header_config/page";

/// Inline-header medium page configuration
pub struct InlineMediumPageHeaderConfig {
    env: HeapEnvironment,
    runtime: RuntimeConfig,
    /// Boundaries whose page currently carries a live header
    live: Mutex<HashSet<usize>>,
}

impl InlineMediumPageHeaderConfig {
    pub fn new(env: HeapEnvironment) -> Self {
        Self::with_runtime_config(env, RuntimeConfig::default())
    }

    pub fn with_runtime_config(env: HeapEnvironment, runtime: RuntimeConfig) -> Self {
        Self {
            env,
            runtime,
            live: Mutex::new(HashSet::new()),
        }
    }

    pub fn live_headers(&self) -> usize {
        self.live.lock().len()
    }
}

impl HeapConfig for InlineMediumPageHeaderConfig {
    fn name(&self) -> &'static str {
        "inline_medium_page_header"
    }

    fn page_size(&self) -> usize {
        INLINE_MEDIUM_PAGE_HEADER_PAGE_SIZE
    }

    fn header_size(&self) -> usize {
        INLINE_MEDIUM_PAGE_HEADER_HEADER_SIZE
    }

    fn page_kind(&self) -> PageKind {
        PageKind::SmallExclusiveSegregated
    }

    fn payload_offset(&self) -> usize {
        INLINE_MEDIUM_PAGE_HEADER_HEADER_SIZE
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
            INLINE_MEDIUM_PAGE_HEADER_PAGE_SIZE,
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

        let address = boundary.as_ptr() as usize;
        assert_eq!(
            address % INLINE_MEDIUM_PAGE_HEADER_PAGE_SIZE,
            0,
            "boundary {:#x} is not page aligned",
            address
        );

        let _guard = self.env.heap_lock.lock_conditionally(lock_mode);
        let mut live = self.live.lock();
        assert!(live.insert(address), "page {:#x} already has a header", address);

        let header = PageBase::new(
            address,
            kind,
            INLINE_MEDIUM_PAGE_HEADER_PAGE_SIZE,
            object_size,
            INLINE_MEDIUM_PAGE_HEADER_HEADER_SIZE,
        );
        let page = boundary.cast::<PageBase>();
        // SAFETY: the page is committed, page aligned and at least
        // header_size bytes long; nothing else lives in its header area.
        unsafe { ptr::write(page.as_ptr(), header) };

        trace!(boundary = address, live = live.len(), "Wrote inline page header");
        page
    }

    fn destroy_page_header(&self, page: NonNull<PageBase>, lock_mode: LockHoldMode) {
        let _guard = self.env.heap_lock.lock_conditionally(lock_mode);
        let address = page.as_ptr() as usize;

        let mut live = self.live.lock();
        assert!(live.remove(&address), "page {:#x} has no live header", address);

        // SAFETY: the header was written by create_page_header and is no
        // longer reachable through the live set.
        unsafe { ptr::drop_in_place(page.as_ptr()) };
        trace!(boundary = address, live = live.len(), "Dropped inline page header");
    }

    fn header_for_boundary(&self, boundary: usize) -> Option<NonNull<PageBase>> {
        if self.live.lock().contains(&boundary) {
            NonNull::new(boundary as *mut PageBase)
        } else {
            None
        }
    }

    fn shared_page_directory_selector(&self, _object_size: usize) -> Option<SharedDirectoryId> {
        unreachable!("inline medium pages are never shared")
    }

    fn for_each_shared_page_directory(
        &self,
        _callback: &mut dyn FnMut(SharedDirectoryId) -> bool,
    ) -> bool {
        true
    }

    fn dump_shared_page_directory_arg(&self, _directory: SharedDirectoryId) -> String {
        unreachable!("inline medium pages are never shared")
    }

    fn aligned_allocator(&self, _size: usize, _alignment: Alignment) -> AlignedAllocationResult {
        AlignedAllocationResult::default()
    }
}
