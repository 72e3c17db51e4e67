//! Segregated size-class heap
//!
//! Drives a [`HeapConfig`] through the full page lifecycle:
//!
//! ```text
//! allocate ─→ page with free slot? ─yes─→ claim slot
//!                    │no
//!                    └─→ allocate_page ─→ create_page_header ─→ claim slot
//!
//! deallocate ─→ header_for_boundary ─→ free slot ─→ empty?
//!                                                    └─yes─→ destroy_page_header
//!                                                            ─→ sharing cache
//! ```

use super::alignment::AllocationResult;
use super::heap_config::HeapConfig;
use super::lock::LockHoldMode;
use super::page::{EmptyMode, PageRole};
use super::sharing_cache::PhysicalMemoryTransaction;
use parking_lot::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct HeapState {
    /// Boundaries of pages owned by this heap
    pages: Vec<usize>,
    live_objects: usize,
}

/// Heap serving a single object size from one configuration's pages
pub struct SegregatedHeap<C: HeapConfig> {
    config: C,
    object_size: usize,
    name: String,
    state: Mutex<HeapState>,
}

impl<C: HeapConfig> SegregatedHeap<C> {
    pub fn new(config: C, object_size: usize) -> Self {
        let runtime = config.runtime_config();
        assert!(object_size > 0, "object size must be non-zero");
        assert!(
            object_size <= runtime.max_segregated_object_size as usize,
            "object size {} exceeds the segregated limit {}",
            object_size,
            runtime.max_segregated_object_size
        );
        assert!(
            object_size <= config.page_size() - config.payload_offset(),
            "object size {} does not fit a {} page",
            object_size,
            config.name()
        );

        let name = format!("{}/segregated_{}", config.name(), object_size);
        Self {
            config,
            object_size,
            name,
            state: Mutex::new(HeapState::default()),
        }
    }

    pub fn config(&self) -> &C {
        &self.config
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Allocate one object; fails without crashing when memory runs out
    pub fn allocate(&self) -> AllocationResult {
        let env = self.config.environment();
        let _heap_guard = env.heap_lock.lock();
        let mut state = self.state.lock();

        let existing = state.pages.iter().find_map(|&boundary| {
            let header = self.config.header_for_boundary(boundary)?;
            // SAFETY: headers of owned pages stay live while the heap lock is held.
            unsafe { header.as_ref() }.allocate_slot()
        });
        if let Some(address) = existing {
            state.live_objects += 1;
            return AllocationResult::succeeded(address);
        }

        let mut transaction = PhysicalMemoryTransaction::new();
        let Some(page) = self
            .config
            .allocate_page(&self.name, &mut transaction, PageRole::Exclusive)
        else {
            warn!(heap = %self.name, "Page allocation failed");
            return AllocationResult::failed();
        };

        let header = self.config.create_page_header(
            page,
            self.config.page_kind(),
            self.object_size,
            LockHoldMode::LockIsHeld,
        );
        let boundary = page.as_ptr() as usize;
        state.pages.push(boundary);

        debug!(
            heap = %self.name,
            boundary,
            pages = state.pages.len(),
            reused = transaction.pages_reused,
            carved = transaction.pages_carved,
            "Created page"
        );

        // SAFETY: header was just created and the heap lock is held.
        match unsafe { header.as_ref() }.allocate_slot() {
            Some(address) => {
                state.live_objects += 1;
                AllocationResult::succeeded(address)
            }
            None => AllocationResult::failed(),
        }
    }

    /// Free an object returned by [`Self::allocate`].
    ///
    /// Emptied pages lose their header and go back to the sharing cache.
    pub fn deallocate(&self, address: usize) {
        let env = self.config.environment();
        let _heap_guard = env.heap_lock.lock();
        let mut state = self.state.lock();

        let boundary = address & !(self.config.page_size() - 1);
        let position = state
            .pages
            .iter()
            .position(|&page| page == boundary)
            .unwrap_or_else(|| panic!("{:#x} was not allocated by {}", address, self.name));
        let header = self
            .config
            .header_for_boundary(boundary)
            .unwrap_or_else(|| panic!("page {:#x} has no header", boundary));

        // SAFETY: header is live until destroyed below.
        let empty_mode = unsafe { header.as_ref() }.free_slot(address);
        state.live_objects -= 1;

        if empty_mode == EmptyMode::IsEmpty {
            self.config
                .destroy_page_header(header, LockHoldMode::LockIsHeld);
            state.pages.swap_remove(position);
            env.sharing_cache
                .return_page(boundary, self.config.page_size(), EmptyMode::IsEmpty);
            debug!(heap = %self.name, boundary, pages = state.pages.len(), "Released empty page");
        }
    }

    pub fn page_count(&self) -> usize {
        self.state.lock().pages.len()
    }

    pub fn live_objects(&self) -> usize {
        self.state.lock().live_objects
    }

    /// Whether `address` lies in a page owned by this heap
    pub fn contains(&self, address: usize) -> bool {
        let boundary = address & !(self.config.page_size() - 1);
        self.state.lock().pages.contains(&boundary)
    }
}

impl<C: HeapConfig> Drop for SegregatedHeap<C> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.live_objects > 0 {
            debug!(
                heap = %self.name,
                live_objects = state.live_objects,
                "Dropping heap with live objects"
            );
        }
        let env = self.config.environment();
        let page_size = self.config.page_size();
        for boundary in state.pages.drain(..) {
            if let Some(header) = self.config.header_for_boundary(boundary) {
                self.config
                    .destroy_page_header(header, LockHoldMode::LockIsNotHeld);
            }
            env.sharing_cache
                .return_page(boundary, page_size, EmptyMode::IsEmpty);
        }
    }
}
