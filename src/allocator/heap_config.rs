//! Heap configuration interface
//!
//! A heap configuration bundles one page geometry with every policy decision
//! a segregated size-class heap needs: where pages come from, where their
//! headers live, and how shared pages and aligned allocations are handled.
//! Heaps are generic over the configuration, so dispatch is static; the
//! trait is also object safe for listing all configurations at runtime.

use super::alignment::Alignment;
use super::lock::{HeapLock, LockHoldMode};
use super::page::{PageBase, PageKind, PageRole};
use super::sharing_cache::{PageSharingCache, PhysicalMemoryTransaction};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Whether emptied pages may be handed to other heaps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharingMode {
    SharePages,
    DoNotSharePages,
}

/// How many views to cache per object size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewCacheCapacity {
    Zero,
    Fixed(u32),
}

impl ViewCacheCapacity {
    pub fn for_object_size(&self, _object_size: usize) -> u32 {
        match self {
            ViewCacheCapacity::Zero => 0,
            ViewCacheCapacity::Fixed(capacity) => *capacity,
        }
    }
}

/// Per-configuration tuning knobs, read-only once a heap is built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub sharing_mode: SharingMode,
    pub statically_allocated: bool,
    pub is_part_of_heap: bool,
    pub directory_size_bound_for_partial_views: u32,
    pub directory_size_bound_for_baseline_allocators: u32,
    pub directory_size_bound_for_no_view_cache: u32,
    pub max_segregated_object_size: u32,
    pub max_bitfit_object_size: u32,
    pub view_cache_capacity: ViewCacheCapacity,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sharing_mode: SharingMode::SharePages,
            statically_allocated: true,
            is_part_of_heap: true,
            directory_size_bound_for_partial_views: 0,
            directory_size_bound_for_baseline_allocators: 0,
            directory_size_bound_for_no_view_cache: 0,
            max_segregated_object_size: u32::MAX,
            max_bitfit_object_size: u32::MAX,
            view_cache_capacity: ViewCacheCapacity::Zero,
        }
    }
}

/// Result of a large aligned allocation
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AlignedAllocationResult {
    pub result: usize,
    pub result_size: usize,
    pub left_padding: usize,
    pub right_padding: usize,
    pub zero_mode: bool,
}

/// Identifier of a shared page directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedDirectoryId(pub u32);

impl fmt::Display for SharedDirectoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedDirectory({})", self.0)
    }
}

/// What a configuration needs from its allocator subsystem
#[derive(Clone)]
pub struct HeapEnvironment {
    pub sharing_cache: Arc<PageSharingCache>,
    pub heap_lock: Arc<HeapLock>,
}

/// Page geometry plus the behaviour hooks of one heap flavour
pub trait HeapConfig: Send + Sync {
    /// Name used in logs and allocation names
    fn name(&self) -> &'static str;

    fn page_size(&self) -> usize;

    fn header_size(&self) -> usize;

    /// The only page kind this configuration produces
    fn page_kind(&self) -> PageKind;

    /// Offset of the first object slot from the page boundary
    fn payload_offset(&self) -> usize {
        0
    }

    fn runtime_config(&self) -> &RuntimeConfig;

    fn environment(&self) -> &HeapEnvironment;

    /// Get a fresh committed page, `None` on exhaustion
    fn allocate_page(
        &self,
        heap_name: &str,
        transaction: &mut PhysicalMemoryTransaction,
        role: PageRole,
    ) -> Option<NonNull<u8>>;

    /// Attach a header to the page at `boundary`
    fn create_page_header(
        &self,
        boundary: NonNull<u8>,
        kind: PageKind,
        object_size: usize,
        lock_mode: LockHoldMode,
    ) -> NonNull<PageBase>;

    /// Tear down a header created by [`HeapConfig::create_page_header`]
    fn destroy_page_header(&self, page: NonNull<PageBase>, lock_mode: LockHoldMode);

    /// Header of the live page starting at `boundary`
    fn header_for_boundary(&self, boundary: usize) -> Option<NonNull<PageBase>>;

    /// Shared directory serving `object_size`, if the configuration shares pages
    fn shared_page_directory_selector(&self, object_size: usize) -> Option<SharedDirectoryId>;

    /// Visit every shared directory until `callback` returns false
    fn for_each_shared_page_directory(
        &self,
        callback: &mut dyn FnMut(SharedDirectoryId) -> bool,
    ) -> bool;

    fn dump_shared_page_directory_arg(&self, directory: SharedDirectoryId) -> String;

    /// Large/aligned allocations served directly by the configuration
    fn aligned_allocator(&self, size: usize, alignment: Alignment) -> AlignedAllocationResult;
}

/// Shared `allocate_page` body of the exclusive-only medium configurations
pub(crate) fn allocate_exclusive_page(
    env: &HeapEnvironment,
    page_size: usize,
    name: &str,
    transaction: &mut PhysicalMemoryTransaction,
    role: PageRole,
) -> Option<NonNull<u8>> {
    assert_eq!(role, PageRole::Exclusive, "{} only has exclusive pages", name);
    env.sharing_cache
        .try_allocate_committed_with_alignment(
            page_size,
            Alignment::traditional(page_size),
            name,
            transaction,
        )
        .as_ptr()
}
