//! Per-process address-space state.
//!
//! An [`AddressSpace`] ties the supplemental page table, the mapping table
//! and the stack extent to the collaborators that actually hold memory: the
//! frame table, the swap device and this process's hardware page table.
//! Every operation takes the owning `AddressSpace` explicitly — there is no
//! ambient "current process" lookup anywhere in this crate; the trap stub
//! resolves the faulting thread to its address space and passes the handle
//! down.

use crate::addr::{PAGE_SIZE, VA, VirtRegion};
use crate::error::{Result, VmError};
use crate::frame::FrameTable;
use crate::fs::SharedFile;
use crate::mmap::{MappingId, MappingRecord};
use crate::mmu::Mmu;
use crate::page::{FileSlice, PageRecord, PageStatus};
use crate::spt::{PageHandle, SuppPageTable};
use crate::stack::MAX_STACK_SIZE;
use crate::swap::SwapDevice;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::AtomicU64;
use spin::Mutex;

pub struct AddressSpace {
    pub(crate) spt: SuppPageTable,
    pub(crate) mappings: Mutex<BTreeMap<MappingId, MappingRecord>>,
    pub(crate) next_mapping_id: AtomicU64,
    /// Fixed stack bounds: `[stack_top - MAX_STACK_SIZE, stack_top)`.
    pub(crate) stack: VirtRegion,
    pub(crate) frames: Arc<dyn FrameTable>,
    pub(crate) swap: Arc<dyn SwapDevice>,
    pub(crate) mmu: Arc<dyn Mmu>,
}

impl AddressSpace {
    /// Creates an empty address space whose stack grows down from
    /// `stack_top` (page-aligned, exclusive upper bound).
    pub fn new(
        frames: Arc<dyn FrameTable>,
        swap: Arc<dyn SwapDevice>,
        mmu: Arc<dyn Mmu>,
        stack_top: VA,
    ) -> Self {
        assert!(stack_top.is_page_aligned());
        assert!(stack_top.value() >= MAX_STACK_SIZE);

        Self {
            spt: SuppPageTable::new(),
            mappings: Mutex::new(BTreeMap::new()),
            next_mapping_id: AtomicU64::new(1),
            stack: VirtRegion::new(stack_top.sub_bytes(MAX_STACK_SIZE), MAX_STACK_SIZE),
            frames,
            swap,
            mmu,
        }
    }

    /// Tracks a new page with the given initial status.
    pub fn create_page(&self, vaddr: VA, status: PageStatus, writable: bool) -> Result<PageHandle> {
        self.spt.create(vaddr, status, writable)
    }

    /// Returns the record tracking the page containing `addr`, if any.
    pub fn find_page(&self, addr: VA) -> Option<PageHandle> {
        self.spt.find(addr)
    }

    /// Registers one executable segment for lazy loading.
    ///
    /// The loader hands over the segment geometry it parsed from the
    /// image: `file_bytes` of initialized data at `file_offset`, occupying
    /// `mem_bytes` of memory at `base`. Every covered page gets a
    /// `LazyExec` record whose slice length is however much of the
    /// initialized data reaches into that page — a full page, a partial
    /// overhang, or nothing for pure-BSS pages. Nothing is read until the
    /// first fault.
    pub fn register_exec_segment(
        &self,
        file: SharedFile,
        file_offset: u64,
        file_bytes: usize,
        mem_bytes: usize,
        base: VA,
        writable: bool,
    ) -> Result<()> {
        if !base.is_page_aligned() || mem_bytes == 0 || file_bytes > mem_bytes {
            return Err(VmError::InvalidValue);
        }

        let page_count = mem_bytes.div_ceil(PAGE_SIZE);

        if !self.spt.range_is_free(VirtRegion::new(base, page_count * PAGE_SIZE)) {
            return Err(VmError::MappingOverlap);
        }

        for index in 0..page_count {
            let consumed = index * PAGE_SIZE;
            let len = file_bytes.saturating_sub(consumed).min(PAGE_SIZE);
            let status = PageStatus::LazyExec {
                segment: FileSlice::new(file.clone(), file_offset + consumed as u64, len),
            };

            if self.spt.create(base.add_pages(index), status, writable).is_err() {
                for created in 0..index {
                    self.spt.remove(base.add_pages(created));
                }
                return Err(VmError::MappingOverlap);
            }
        }

        Ok(())
    }

    /// Stops tracking the page containing `addr` and releases everything
    /// it holds: its swap slot, or its frame and hardware translation.
    pub fn destroy_page(&self, addr: VA) -> Result<()> {
        let handle = self.spt.remove(addr).ok_or(VmError::NotTracked)?;

        let mut record = handle.lock();
        self.release_record(&mut record);

        Ok(())
    }

    /// Releases the resources owned by a record that is leaving the table.
    pub(crate) fn release_record(&self, record: &mut PageRecord) {
        match record.status() {
            PageStatus::Resident { frame, .. } => {
                let frame = *frame;
                self.mmu.clear_mapping(record.vaddr());
                self.frames.release_frame(frame);
            }
            PageStatus::Swapped { slot } | PageStatus::SwappedMapped { slot, .. } => {
                self.swap.free_slot(*slot);
            }
            PageStatus::LazyExec { .. } | PageStatus::MappedFile { .. } => {}
        }
    }

    /// Full teardown, mandatory on every process exit path, fatal ones
    /// included: unmaps every outstanding file mapping (writing dirty
    /// pages back), then destroys every remaining record. Cleanup runs to
    /// completion even when a write-back fails; the first error is
    /// reported once everything is released.
    pub fn teardown(&self) -> Result<()> {
        let ids: Vec<MappingId> = self.mappings.lock().keys().copied().collect();

        let mut first_err = None;
        for id in ids {
            if let Err(e) = self.unmap_file(id) {
                log::warn!("teardown: write-back failed for mapping {:?}: {}", id, e);
                first_err.get_or_insert(e);
            }
        }

        for (_, handle) in self.spt.drain() {
            let mut record = handle.lock();
            self.release_record(&mut record);
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::PAGE_SIZE;
    use crate::fault::AccessKind;
    use crate::mock::{TestFixture, USER_STACK_TOP};
    use crate::page::{FileSlice, PageOrigin};

    #[test]
    fn destroy_page_releases_swap_slot_and_frame() {
        let fx = TestFixture::new();
        let space = fx.space();

        // A resident page created through stack growth.
        let sp = VA::from_value(USER_STACK_TOP - 64);
        space.grow_stack(sp, sp).unwrap();
        assert_eq!(fx.frames.outstanding(), 1);

        space.destroy_page(sp).unwrap();
        assert_eq!(fx.frames.outstanding(), 0);
        assert!(!fx.mmu.is_present(sp.page_aligned()));

        // A swapped page frees its slot on destroy.
        let page = VA::from_value(0x4000);
        space.grow_stack_test_page(page);
        space.evict(page).unwrap();
        assert_eq!(fx.swap.allocated(), 1);

        space.destroy_page(page).unwrap();
        assert_eq!(fx.swap.allocated(), 0);
        assert_eq!(fx.frames.outstanding(), 0);

        assert_eq!(space.destroy_page(page).unwrap_err(), VmError::NotTracked);
    }

    #[test]
    fn teardown_releases_every_record_of_mixed_status() {
        let fx = TestFixture::new();
        let space = fx.space();

        // Resident anonymous page.
        let sp = VA::from_value(USER_STACK_TOP - 16);
        space.grow_stack(sp, sp).unwrap();

        // Swapped anonymous page.
        let swapped = VA::from_value(0x4000);
        space.grow_stack_test_page(swapped);
        space.evict(swapped).unwrap();

        // Never-loaded lazy page.
        let file = fx.file_with(&[0xab; 100]);
        space
            .create_page(
                VA::from_value(0x10000),
                PageStatus::LazyExec {
                    segment: FileSlice::new(file.clone(), 0, 100),
                },
                false,
            )
            .unwrap();

        // Resident mapped page, written to, plus its never-touched
        // siblings.
        let mapped_base = VA::from_value(0x20000);
        let map_file = fx.file_with(&[0u8; 2 * PAGE_SIZE + 17]);
        space.map_file(map_file, mapped_base).unwrap();
        space
            .handle_fault(mapped_base, AccessKind::Write, VA::from_value(USER_STACK_TOP))
            .unwrap();

        assert!(fx.frames.outstanding() > 0);
        assert!(fx.swap.allocated() > 0);

        space.teardown().unwrap();

        assert!(space.spt.is_empty());
        assert!(space.mappings.lock().is_empty());
        assert_eq!(fx.frames.outstanding(), 0, "no leaked frames");
        assert_eq!(fx.swap.allocated(), 0, "no leaked swap slots");
    }

    #[test]
    fn explicit_context_no_cross_space_interference() {
        // Two address spaces over the same frame table and swap device;
        // tearing one down must not disturb the other's pages.
        let fx = TestFixture::new();
        let a = fx.space();
        let b = AddressSpace::new(
            fx.frames.clone(),
            fx.swap.clone(),
            fx.mmu2.clone(),
            VA::from_value(USER_STACK_TOP),
        );

        let sp = VA::from_value(USER_STACK_TOP - 8);
        a.grow_stack(sp, sp).unwrap();
        b.grow_stack(sp, sp).unwrap();
        assert_eq!(fx.frames.outstanding(), 2);

        a.teardown().unwrap();
        assert_eq!(fx.frames.outstanding(), 1);

        let handle = b.find_page(sp).expect("b's page survives a's teardown");
        assert!(handle.lock().is_resident());

        b.teardown().unwrap();
        assert_eq!(fx.frames.outstanding(), 0);
    }

    impl AddressSpace {
        /// Test helper: materialize one anonymous resident page outside
        /// the stack checks.
        pub(crate) fn grow_stack_test_page(&self, page: VA) {
            let frame = self.frames.acquire_frame().unwrap();
            self.frames
                .write_frame(frame, &alloc::vec![0u8; PAGE_SIZE])
                .unwrap();
            self.spt
                .create(
                    page,
                    PageStatus::Resident {
                        frame,
                        origin: PageOrigin::Anon,
                    },
                    true,
                )
                .unwrap();
            self.mmu.install_mapping(page.page_aligned(), frame, true).unwrap();
        }
    }
}
