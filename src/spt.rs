//! The supplemental page table.
//!
//! One instance per address space, mapping each page-aligned virtual
//! address to its [`PageRecord`]. The map itself sits behind a `RwLock` so
//! concurrent faults on different pages only contend for the brief lookup;
//! each record is wrapped in its own mutex, which is what serializes two
//! threads faulting on the *same* page. Nothing in this module performs
//! I/O, so neither lock is ever held across a blocking call by this code.

use crate::addr::{VA, VirtRegion};
use crate::error::{Result, VmError};
use crate::page::{PageRecord, PageStatus};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, RwLock};

/// A page record shared between the table and in-flight fault resolutions.
pub type PageHandle = Arc<Mutex<PageRecord>>;

pub struct SuppPageTable {
    entries: RwLock<BTreeMap<VA, PageHandle>>,
}

impl SuppPageTable {
    pub const fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Tracks a new page. Fails if `vaddr`'s page is already tracked;
    /// callers that cannot tolerate that must check first or treat it as a
    /// contract violation.
    pub fn create(&self, vaddr: VA, status: PageStatus, writable: bool) -> Result<PageHandle> {
        let page = vaddr.page_aligned();
        let mut entries = self.entries.write();

        if entries.contains_key(&page) {
            return Err(VmError::AlreadyTracked);
        }

        let handle = Arc::new(Mutex::new(PageRecord::new(page, status, writable)));
        entries.insert(page, handle.clone());

        Ok(handle)
    }

    /// Looks up the record tracking the page containing `addr`.
    ///
    /// This is the fast path taken on every page fault.
    pub fn find(&self, addr: VA) -> Option<PageHandle> {
        self.entries.read().get(&addr.page_aligned()).cloned()
    }

    /// Stops tracking the page containing `addr` and returns its record.
    /// The caller is responsible for releasing the record's frame or swap
    /// slot; the table only owns the bookkeeping.
    pub fn remove(&self, addr: VA) -> Option<PageHandle> {
        self.entries.write().remove(&addr.page_aligned())
    }

    /// Whether no tracked page falls inside `region`.
    pub fn range_is_free(&self, region: VirtRegion) -> bool {
        self.entries
            .read()
            .range(region.start_address()..region.end_address())
            .next()
            .is_none()
    }

    /// Tracked pages inside `region`, in ascending address order.
    pub fn pages_in(&self, region: VirtRegion) -> Vec<(VA, PageHandle)> {
        self.entries
            .read()
            .range(region.start_address()..region.end_address())
            .map(|(addr, handle)| (*addr, handle.clone()))
            .collect()
    }

    /// Removes and returns every tracked page, in ascending address order.
    /// Used by address-space teardown.
    pub fn drain(&self) -> Vec<(VA, PageHandle)> {
        core::mem::take(&mut *self.entries.write()).into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for SuppPageTable {
    fn default() -> Self {
        Self::new()
    }
}
