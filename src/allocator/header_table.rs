//! Out-of-line page header table
//!
//! Maps page boundaries to headers stored outside the page, so the page's
//! whole byte range is usable for object slots.
//!
//! ```text
//! PageHeaderTable (page_size = 128K)
//!   ├─→ 0x7f00_0000_0000 → PageBase { live: 3 }
//!   ├─→ 0x7f00_0002_0000 → PageBase { live: 17 }
//!   └─→ 0x7f00_0004_0000 → PageBase { live: 1 }
//! ```
//!
//! The table owns its lock; callers do not have to hold the heap lock for
//! the table to stay consistent.

use super::alignment::is_aligned;
use super::page::{PageBase, PageKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ptr::NonNull;
use tracing::trace;

/// Boundary → header map for one page geometry
#[derive(Debug)]
pub struct PageHeaderTable {
    page_size: usize,
    header_size: usize,
    headers: Mutex<HashMap<usize, Box<PageBase>>>,
}

impl PageHeaderTable {
    pub fn new(page_size: usize, header_size: usize) -> Self {
        assert!(page_size.is_power_of_two());
        Self {
            page_size,
            header_size,
            headers: Mutex::new(HashMap::new()),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    /// Create the header for the page at `boundary`.
    ///
    /// The returned pointer stays valid until [`Self::remove`] is called for
    /// the same page. Creating a second live header for a boundary is a
    /// contract violation and panics.
    pub fn add(
        &self,
        page_size: usize,
        header_size: usize,
        boundary: usize,
        kind: PageKind,
        object_size: usize,
    ) -> NonNull<PageBase> {
        assert_eq!(page_size, self.page_size, "page size mismatch");
        assert_eq!(header_size, self.header_size, "header size mismatch");
        assert!(
            is_aligned(boundary, page_size),
            "boundary {:#x} is not page aligned",
            boundary
        );

        let mut headers = self.headers.lock();
        assert!(
            !headers.contains_key(&boundary),
            "page {:#x} already has a header",
            boundary
        );

        let header = Box::new(PageBase::new(boundary, kind, page_size, object_size, 0));
        let ptr = NonNull::from(header.as_ref());
        headers.insert(boundary, header);

        trace!(boundary, live = headers.len(), "Added page header");
        ptr
    }

    /// Release the header of `page`.
    ///
    /// `page` must have come from [`Self::add`] on this table and must not be
    /// used afterwards.
    pub fn remove(&self, page_size: usize, page: NonNull<PageBase>) {
        assert_eq!(page_size, self.page_size, "page size mismatch");

        // SAFETY: caller contract, the header is still live.
        let boundary = unsafe { page.as_ref().boundary() };

        let mut headers = self.headers.lock();
        let removed = headers.remove(&boundary);
        assert!(
            removed.as_deref().map(|h| h as *const PageBase) == Some(page.as_ptr() as *const _),
            "page {:#x} has no header in this table",
            boundary
        );

        trace!(boundary, live = headers.len(), "Removed page header");
    }

    /// Header for an exact page boundary
    pub fn get(&self, boundary: usize) -> Option<NonNull<PageBase>> {
        self.headers
            .lock()
            .get(&boundary)
            .map(|header| NonNull::from(header.as_ref()))
    }

    /// Header of the page containing `address`
    pub fn header_for_address(&self, address: usize) -> Option<NonNull<PageBase>> {
        self.get(address & !(self.page_size - 1))
    }

    pub fn len(&self) -> usize {
        self.headers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.lock().is_empty()
    }

    /// Bytes of header storage held by live entries
    pub fn header_bytes(&self) -> usize {
        self.len() * self.header_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 1 << 17;

    #[test]
    fn test_add_and_remove() {
        let table = PageHeaderTable::new(PAGE, 64);

        let header = table.add(PAGE, 64, 4 * PAGE, PageKind::SmallExclusiveSegregated, 512);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(4 * PAGE), Some(header));
        assert_eq!(table.header_for_address(4 * PAGE + 1000), Some(header));
        assert_eq!(table.header_bytes(), 64);

        unsafe {
            assert_eq!(header.as_ref().boundary(), 4 * PAGE);
            assert_eq!(header.as_ref().object_capacity(), PAGE / 512);
        }

        table.remove(PAGE, header);
        assert!(table.is_empty());
        assert!(table.get(4 * PAGE).is_none());
    }

    #[test]
    #[should_panic(expected = "already has a header")]
    fn test_duplicate_boundary_panics() {
        let table = PageHeaderTable::new(PAGE, 64);
        table.add(PAGE, 64, PAGE, PageKind::SmallExclusiveSegregated, 512);
        table.add(PAGE, 64, PAGE, PageKind::SmallExclusiveSegregated, 512);
    }

    #[test]
    #[should_panic(expected = "not page aligned")]
    fn test_unaligned_boundary_panics() {
        let table = PageHeaderTable::new(PAGE, 64);
        table.add(PAGE, 64, PAGE + 8, PageKind::SmallExclusiveSegregated, 512);
    }

    #[test]
    fn test_readd_after_remove() {
        let table = PageHeaderTable::new(PAGE, 64);

        for _ in 0..10 {
            let header = table.add(PAGE, 64, 2 * PAGE, PageKind::SmallExclusiveSegregated, 256);
            table.remove(PAGE, header);
        }
        assert_eq!(table.len(), 0);
    }
}
