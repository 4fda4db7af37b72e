//! Memory-mapped file lifecycle.
//!
//! `map_file` carves a file into per-page [`MappedFile`] records —
//! all-or-nothing, the attempt rolls back if any page of the range is
//! already taken — and registers a [`MappingRecord`] that keeps the file
//! open for the mapping's lifetime. `unmap_file` writes every modified
//! page home (whether its current content sits in a frame or in a swap
//! slot), releases the records, and drops the file handle. Process exit
//! unmaps every outstanding mapping the same way.
//!
//! [`MappedFile`]: PageStatus::MappedFile

use crate::addr::{PAGE_SIZE, VA, VirtRegion};
use crate::error::{Result, VmError};
use crate::frame::{FrameRef, FrameTable};
use crate::fs::{FileObject, SharedFile};
use crate::mmu::Mmu;
use crate::page::{FileSlice, PageOrigin, PageRecord, PageStatus};
use crate::space::AddressSpace;
use crate::swap::{SwapDevice, SwapSlot};
use alloc::vec;
use core::cmp::min;
use core::sync::atomic::Ordering;
use log::debug;

/// Identifier of one file mapping, unique within its address space and
/// never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MappingId(pub(crate) u64);

/// One successful `map_file` call: a contiguous run of pages backed by one
/// open file. The record owns the file handle; the per-page records only
/// share it.
pub struct MappingRecord {
    pub(crate) id: MappingId,
    pub(crate) file: SharedFile,
    pub(crate) base: VA,
    pub(crate) page_count: usize,
}

impl MappingRecord {
    pub fn id(&self) -> MappingId {
        self.id
    }

    pub fn base(&self) -> VA {
        self.base
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// The contiguous virtual range covered by this mapping.
    pub fn region(&self) -> VirtRegion {
        VirtRegion::new(self.base, self.page_count * PAGE_SIZE)
    }
}

impl AddressSpace {
    /// Maps `file` at `base`, one page per `PAGE_SIZE` chunk of the file;
    /// the tail page covers whatever the file length leaves over.
    ///
    /// Fails with `EmptyFile` for a zero-length file, `InvalidValue` for
    /// an unaligned or null base, and `MappingOverlap` when any page of
    /// the range is already tracked (an existing mapping, an executable
    /// segment, or a materialized stack page). A partially created range
    /// is rolled back completely before the error is returned.
    pub fn map_file(&self, file: SharedFile, base: VA) -> Result<MappingId> {
        if base.is_null() || !base.is_page_aligned() {
            return Err(VmError::InvalidValue);
        }

        let file_len = file.len()?;
        if file_len == 0 {
            return Err(VmError::EmptyFile);
        }

        let page_count = file_len.div_ceil(PAGE_SIZE as u64) as usize;

        if !self.spt.range_is_free(VirtRegion::new(base, page_count * PAGE_SIZE)) {
            return Err(VmError::MappingOverlap);
        }

        for index in 0..page_count {
            let offset = (index * PAGE_SIZE) as u64;
            let len = min((file_len - offset) as usize, PAGE_SIZE);
            let status = PageStatus::MappedFile {
                backing: FileSlice::new(file.clone(), offset, len),
            };

            if self.spt.create(base.add_pages(index), status, true).is_err() {
                for created in 0..index {
                    self.spt.remove(base.add_pages(created));
                }
                return Err(VmError::MappingOverlap);
            }
        }

        let id = MappingId(self.next_mapping_id.fetch_add(1, Ordering::Relaxed));
        self.mappings.lock().insert(
            id,
            MappingRecord {
                id,
                file,
                base,
                page_count,
            },
        );

        debug!("mapping {:?}: {} pages at {}", id, page_count, base);
        Ok(id)
    }

    /// Unmaps a mapping: writes modified pages back to the file, destroys
    /// every covered record and closes the crate's handle on the file.
    ///
    /// Cleanup always runs to completion; if a write-back fails the first
    /// error is reported after every record has been released.
    pub fn unmap_file(&self, id: MappingId) -> Result<()> {
        let mapping = self
            .mappings
            .lock()
            .remove(&id)
            .ok_or(VmError::BadMappingId)?;

        let mut first_err = None;

        for (page, _) in self.spt.pages_in(mapping.region()) {
            let handle = match self.spt.remove(page) {
                Some(handle) => handle,
                // Destroyed individually since mapping time; nothing owed.
                None => continue,
            };

            let mut record = handle.lock();
            if let Err(e) = self.write_back(&mut record) {
                first_err.get_or_insert(e);
            }
            self.release_record(&mut record);
        }

        debug!("mapping {:?} unmapped", id);

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Writes a mapped page's current content back to its file slice if it
    /// has been modified since it was loaded. Caller holds the record
    /// lock.
    pub(crate) fn write_back(&self, record: &mut PageRecord) -> Result<()> {
        enum Source {
            Frame(FrameRef),
            Slot(SwapSlot),
        }

        let job = match record.status() {
            PageStatus::Resident {
                frame,
                origin: PageOrigin::Mapped(backing),
            } => {
                let dirty = record.dirty || self.mmu.is_dirty(record.vaddr());
                if dirty {
                    Some((Source::Frame(*frame), backing.clone()))
                } else {
                    None
                }
            }
            // A mapped page only reaches swap while dirty.
            PageStatus::SwappedMapped { slot, backing } => {
                Some((Source::Slot(*slot), backing.clone()))
            }
            _ => None,
        };

        let Some((source, backing)) = job else {
            return Ok(());
        };

        let mut buf = vec![0u8; PAGE_SIZE];
        match source {
            Source::Frame(frame) => self.frames.read_frame(frame, &mut buf)?,
            Source::Slot(slot) => self.swap.read_slot(slot, &mut buf)?,
        }

        backing.file.write_all_at(backing.offset, &buf[..backing.len])?;
        record.dirty = false;

        Ok(())
    }
}
