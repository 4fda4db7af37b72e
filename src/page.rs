//! Per-page state.
//!
//! A [`PageRecord`] tracks one virtual page of one address space: where its
//! authoritative content currently lives and how it may be accessed. The
//! backing location is a closed sum type — a swap slot exists only while
//! the page is swapped out, a file slice only while the content is (or will
//! be) sourced from a file — so an impossible combination of fields cannot
//! be represented.

use crate::addr::{PAGE_SIZE, VA};
use crate::frame::FrameRef;
use crate::fs::SharedFile;
use crate::swap::SwapSlot;
use core::fmt::{self, Debug};

/// One page's backing range within a file.
///
/// `len` is the literal number of file bytes backing the page, anywhere in
/// `0..=PAGE_SIZE`; the remaining `PAGE_SIZE - len` bytes are zero-filled
/// on load. A full-page read is `len == PAGE_SIZE`, a pure zero (BSS) page
/// is `len == 0`, and anything in between is the overhang case where the
/// file region ends partway through the page.
#[derive(Clone)]
pub struct FileSlice {
    pub file: SharedFile,
    pub offset: u64,
    pub len: usize,
}

impl FileSlice {
    pub fn new(file: SharedFile, offset: u64, len: usize) -> Self {
        debug_assert!(len <= PAGE_SIZE);
        Self { file, offset, len }
    }
}

impl PartialEq for FileSlice {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::addr_eq(
            alloc::sync::Arc::as_ptr(&self.file),
            alloc::sync::Arc::as_ptr(&other.file),
        ) && self.offset == other.offset
            && self.len == other.len
    }
}

impl Debug for FileSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSlice")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Where a resident page's content came from, which decides where it goes
/// next: anonymous and exec pages are evicted to swap, mapped pages flow
/// back to their file slice.
#[derive(Clone, Debug, PartialEq)]
pub enum PageOrigin {
    /// Demand-zeroed memory (stack). Private; lives in swap once evicted.
    Anon,
    /// Loaded from an executable segment. The load was a private copy, so
    /// modifications never reach the file; eviction goes to swap.
    Exec(FileSlice),
    /// Part of a user file mapping, shared with the file: dirty content is
    /// eventually written back to the slice.
    Mapped(FileSlice),
}

/// The backing-store state machine for one page.
#[derive(Clone, Debug, PartialEq)]
pub enum PageStatus {
    /// Content is in a physical frame, owned by the frame table and
    /// referenced here. The hardware translation is normally installed.
    Resident { frame: FrameRef, origin: PageOrigin },
    /// Content was evicted to a swap slot. The record owns the slot.
    Swapped { slot: SwapSlot },
    /// Executable-segment page, never yet loaded: `segment.len` file bytes
    /// then zeroes.
    LazyExec { segment: FileSlice },
    /// Mapped-file page with no resident copy; content is read from (up
    /// to) one page of the file on the next fault.
    MappedFile { backing: FileSlice },
    /// Mapped-file page whose dirty content was evicted to swap. The
    /// backing slice is kept so unmap can write the content home.
    SwappedMapped { slot: SwapSlot, backing: FileSlice },
}

/// The unit of supplemental-page-table state for one virtual page.
#[derive(Debug)]
pub struct PageRecord {
    vaddr: VA,
    writable: bool,
    /// Sticky software dirty bit. Hardware dirty bits reset whenever a
    /// translation is reinstalled, so a page that went through swap while
    /// modified stays marked here until its content reaches the file.
    pub(crate) dirty: bool,
    pub(crate) status: PageStatus,
}

impl PageRecord {
    pub fn new(vaddr: VA, status: PageStatus, writable: bool) -> Self {
        debug_assert!(vaddr.is_page_aligned());
        Self {
            vaddr,
            writable,
            dirty: false,
            status,
        }
    }

    pub fn vaddr(&self) -> VA {
        self.vaddr
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn status(&self) -> &PageStatus {
        &self.status
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.status, PageStatus::Resident { .. })
    }

    /// The frame currently holding this page's content, if resident.
    pub fn frame(&self) -> Option<FrameRef> {
        match self.status {
            PageStatus::Resident { frame, .. } => Some(frame),
            _ => None,
        }
    }

    /// The swap slot currently owned by this record, if any.
    pub fn swap_slot(&self) -> Option<SwapSlot> {
        match self.status {
            PageStatus::Swapped { slot } | PageStatus::SwappedMapped { slot, .. } => Some(slot),
            _ => None,
        }
    }
}
