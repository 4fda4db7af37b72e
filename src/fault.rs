//! Page fault resolution.
//!
//! Flow:
//!   1. Hardware traps on a missing or impermissible translation; the arch
//!      stub resolves the faulting thread to its [`AddressSpace`] and calls
//!      [`AddressSpace::handle_fault`] (or [`handle_fault_code`] with the
//!      raw error word).
//!   2. The supplemental page table is consulted for the faulting page.
//!   3. Untracked address → stack-growth policy, then give up.
//!   4. Tracked address → load the content from wherever the record says it
//!      lives (executable file, mapped file, swap slot), bind a frame,
//!      install the translation, and mark the record resident.
//!
//! A `Denied` resolution means the access was a genuine violation and the
//! caller should terminate the faulting process. An `Err` means a
//! collaborator failed (out of frames, out of swap, backing-store I/O);
//! those are equally fatal to the process — the content it expects cannot
//! be produced — but are reported separately so the syscall-facing paths
//! can distinguish exhaustion from violation.
//!
//! [`handle_fault_code`]: AddressSpace::handle_fault_code

use crate::addr::{PAGE_SIZE, VA};
use crate::error::{Result, VmError};
use crate::frame::{FrameRef, FrameTable};
use crate::fs::FileObject;
use crate::mmu::Mmu;
use crate::page::{PageOrigin, PageRecord, PageStatus};
use crate::space::AddressSpace;
use crate::swap::{SwapDevice, SwapSlot};
use alloc::vec;
use bitflags::bitflags;
use log::{debug, warn};

/// The kind of access that trapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// Outcome of a fault handling attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum FaultResolution {
    /// The page is resident and the translation installed; the faulting
    /// instruction can be re-executed.
    Resolved,
    /// The access was denied. The caller should treat this as a fatal
    /// access violation for the owning process.
    Denied,
}

bitflags! {
    /// Hardware page-fault error word, as pushed by the MMU on a trap.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FaultCode: u32 {
        /// The translation was present; the fault is a protection event.
        const PRESENT = 1 << 0;
        /// The faulting access was a write.
        const WRITE = 1 << 1;
        /// The access originated in user mode.
        const USER = 1 << 2;
    }
}

impl FaultCode {
    pub fn access_kind(self) -> AccessKind {
        if self.contains(FaultCode::WRITE) {
            AccessKind::Write
        } else {
            AccessKind::Read
        }
    }
}

impl AddressSpace {
    /// Decodes a raw hardware error word and resolves the fault.
    pub fn handle_fault_code(
        &self,
        code: FaultCode,
        addr: VA,
        stack_pointer: VA,
    ) -> Result<FaultResolution> {
        self.handle_fault(addr, code.access_kind(), stack_pointer)
    }

    /// Resolves a page fault at `addr`.
    ///
    /// `stack_pointer` is the faulting thread's stack pointer at trap time,
    /// consulted only when the address is untracked and might be stack
    /// growth.
    pub fn handle_fault(
        &self,
        addr: VA,
        access: AccessKind,
        stack_pointer: VA,
    ) -> Result<FaultResolution> {
        let page = addr.page_aligned();

        let handle = match self.spt.find(page) {
            Some(handle) => handle,
            None => {
                return match self.grow_stack(addr, stack_pointer) {
                    Ok(()) => Ok(FaultResolution::Resolved),
                    Err(VmError::AccessViolation) => {
                        warn!("fault at untracked {} denied", addr);
                        Ok(FaultResolution::Denied)
                    }
                    // Another thread grew the same page first; its frame
                    // serves this fault too.
                    Err(VmError::AlreadyTracked) => Ok(FaultResolution::Resolved),
                    Err(e) => Err(e),
                };
            }
        };

        // Serializes against any other fault, eviction or teardown
        // touching this page. Held across the backing-store read: that is
        // what makes the non-resident → resident transition atomic for
        // concurrent observers.
        let mut record = handle.lock();

        if access == AccessKind::Write && !record.writable() {
            warn!("write to read-only page {}", page);
            return Ok(FaultResolution::Denied);
        }

        if let PageStatus::Resident { frame, .. } = *record.status() {
            // Re-fault on a resident page. With permissions already
            // checked, a fault while the translation is installed can only
            // be a lost race against the thread that loaded the page (or a
            // stale TLB entry); a missing translation is ours to repair.
            if !self.mmu.is_present(page) {
                self.mmu.install_mapping(page, frame, record.writable())?;
            }
            return Ok(FaultResolution::Resolved);
        }

        self.load_page(page, &mut record)?;

        Ok(FaultResolution::Resolved)
    }

    /// Materializes a non-resident record into a fresh frame and installs
    /// the translation. Caller holds the record lock.
    fn load_page(&self, page: VA, record: &mut PageRecord) -> Result<()> {
        let mut buf = vec![0u8; PAGE_SIZE];

        // Assemble the page content and decide the resident origin. The
        // swap slot, if one is consumed, is freed only after the load has
        // fully succeeded so a failed resolution leaves the record intact.
        let (origin, consumed_slot) = match record.status() {
            PageStatus::LazyExec { segment } => {
                if segment.len > 0 {
                    segment.file.read_exact_at(segment.offset, &mut buf[..segment.len])?;
                }
                (PageOrigin::Exec(segment.clone()), None)
            }
            PageStatus::MappedFile { backing } => {
                if backing.len > 0 {
                    backing.file.read_exact_at(backing.offset, &mut buf[..backing.len])?;
                }
                (PageOrigin::Mapped(backing.clone()), None)
            }
            PageStatus::Swapped { slot } => {
                self.swap.read_slot(*slot, &mut buf)?;
                (PageOrigin::Anon, Some(*slot))
            }
            PageStatus::SwappedMapped { slot, backing } => {
                self.swap.read_slot(*slot, &mut buf)?;
                (PageOrigin::Mapped(backing.clone()), Some(*slot))
            }
            PageStatus::Resident { .. } => {
                unreachable!("resident pages are handled before loading")
            }
        };

        // May block while the frame table evicts some other page.
        let frame = self.frames.acquire_frame()?;

        if let Err(e) = self.frames.write_frame(frame, &buf) {
            self.frames.release_frame(frame);
            return Err(e);
        }

        if let Err(e) = self.mmu.install_mapping(page, frame, record.writable()) {
            self.frames.release_frame(frame);
            return Err(e);
        }

        if let Some(slot) = consumed_slot {
            self.swap.free_slot(slot);
        }

        debug!("page {} resident in frame {:?}", page, frame);
        record.status = PageStatus::Resident { frame, origin };

        Ok(())
    }

    /// Eviction hook, called by the frame table's victim selection once it
    /// has chosen the resident page at `addr`.
    ///
    /// Anonymous and exec-loaded pages always move to a fresh swap slot.
    /// Mapped pages move to swap only while dirty — the file itself is
    /// written at unmap time — and otherwise drop back to `MappedFile`,
    /// re-readable from the file. On success the translation is cleared
    /// and the frame returned to the table; on failure the page stays
    /// resident and untouched.
    pub fn evict(&self, addr: VA) -> Result<()> {
        let page = addr.page_aligned();
        let handle = self.spt.find(page).ok_or(VmError::NotTracked)?;
        let mut record = handle.lock();

        let (frame, origin) = match record.status() {
            PageStatus::Resident { frame, origin } => (*frame, origin.clone()),
            _ => return Err(VmError::NotResident),
        };

        let dirty = record.dirty || self.mmu.is_dirty(page);

        let next = match origin {
            PageOrigin::Anon | PageOrigin::Exec(_) => {
                let slot = self.write_frame_to_swap(frame)?;
                PageStatus::Swapped { slot }
            }
            PageOrigin::Mapped(backing) => {
                if dirty {
                    let slot = self.write_frame_to_swap(frame)?;
                    // The hardware dirty bit dies with the translation;
                    // remember the modification until it reaches the file.
                    record.dirty = true;
                    debug!("dirty mapped page {} evicted to {:?}", page, slot);
                    PageStatus::SwappedMapped { slot, backing }
                } else {
                    PageStatus::MappedFile { backing }
                }
            }
        };

        self.mmu.clear_mapping(page);
        self.frames.release_frame(frame);
        record.status = next;

        Ok(())
    }

    fn write_frame_to_swap(&self, frame: FrameRef) -> Result<SwapSlot> {
        let slot = self.swap.allocate_slot()?;

        let mut buf = vec![0u8; PAGE_SIZE];
        let copied = self
            .frames
            .read_frame(frame, &mut buf)
            .and_then(|()| self.swap.write_slot(slot, &buf));

        if let Err(e) = copied {
            self.swap.free_slot(slot);
            return Err(e);
        }

        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameTable;
    use crate::mmu::Mmu;
    use crate::mock::{BrokenFile, TestFixture, USER_STACK_TOP};
    use crate::page::FileSlice;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    fn sp() -> VA {
        VA::from_value(USER_STACK_TOP - 8)
    }

    fn frame_content(fx: &TestFixture, page: VA) -> Vec<u8> {
        let (frame, _) = fx.mmu.mapping(page).expect("translation installed");
        let mut buf = vec![0u8; PAGE_SIZE];
        fx.frames.read_frame(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn lazy_exec_overhang_loads_prefix_and_zeroes_the_rest() {
        let fx = TestFixture::new();
        let space = fx.space();

        let mut content = vec![0u8; 300];
        for (i, byte) in content.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let file = fx.file_with(&content);

        let page = VA::from_value(0x40000);
        space
            .create_page(
                page,
                PageStatus::LazyExec {
                    segment: FileSlice::new(file, 0, 300),
                },
                false,
            )
            .unwrap();

        let resolution = space.handle_fault(page.add_bytes(0x123), AccessKind::Read, sp()).unwrap();
        assert_eq!(resolution, FaultResolution::Resolved);

        let loaded = frame_content(&fx, page);
        assert_eq!(&loaded[..300], &content[..]);
        assert!(loaded[300..].iter().all(|&b| b == 0), "overhang is zeroed");
    }

    #[test]
    fn pure_bss_page_is_all_zero_without_touching_the_file() {
        let fx = TestFixture::new();
        let space = fx.space();

        // len == 0 means no file bytes at all; a broken file proves the
        // loader never reads it.
        let page = VA::from_value(0x40000);
        space
            .create_page(
                page,
                PageStatus::LazyExec {
                    segment: FileSlice::new(Arc::new(BrokenFile), 0, 0),
                },
                true,
            )
            .unwrap();

        space.handle_fault(page, AccessKind::Write, sp()).unwrap();
        assert!(frame_content(&fx, page).iter().all(|&b| b == 0));
    }

    #[test]
    fn swap_round_trip_preserves_content_and_frees_the_slot_once() {
        let fx = TestFixture::new();
        let space = fx.space();

        // Given: a resident anonymous page with recognizable content.
        let addr = sp();
        let page = addr.page_aligned();
        space.handle_fault(addr, AccessKind::Write, addr).unwrap();

        let (frame, _) = fx.mmu.mapping(page).unwrap();
        let pattern = vec![0x5au8; PAGE_SIZE];
        fx.frames.write_frame(frame, &pattern).unwrap();
        fx.mmu.set_dirty(page);

        // When: the frame table takes the frame back.
        space.evict(page).unwrap();

        assert_eq!(fx.swap.allocated(), 1);
        assert_eq!(fx.frames.outstanding(), 0);
        assert!(!fx.mmu.is_present(page));
        assert_eq!(
            space.find_page(page).unwrap().lock().swap_slot().is_some(),
            true
        );

        // Then: faulting the page back reproduces the content exactly and
        // releases the slot.
        space.handle_fault(addr, AccessKind::Read, addr).unwrap();
        assert_eq!(frame_content(&fx, page), pattern);
        assert_eq!(fx.swap.allocated(), 0, "slot freed exactly once");
        assert!(space.find_page(page).unwrap().lock().is_resident());
    }

    #[test]
    fn resolution_is_idempotent_and_repairs_a_lost_translation() {
        let fx = TestFixture::new();
        let space = fx.space();

        let addr = sp();
        let page = addr.page_aligned();
        space.handle_fault(addr, AccessKind::Write, addr).unwrap();
        let (frame, _) = fx.mmu.mapping(page).unwrap();

        // Re-fault with the translation still installed: no transition, no
        // new frame.
        let r = space.handle_fault(addr, AccessKind::Read, addr).unwrap();
        assert_eq!(r, FaultResolution::Resolved);
        assert_eq!(fx.frames.outstanding(), 1);
        assert_eq!(fx.mmu.mapping(page), Some((frame, true)));

        // Lost translation: the resolver reinstalls the existing frame.
        fx.mmu.clear_mapping(page);
        let r = space.handle_fault(addr, AccessKind::Write, addr).unwrap();
        assert_eq!(r, FaultResolution::Resolved);
        assert_eq!(fx.mmu.mapping(page), Some((frame, true)));
        assert_eq!(fx.frames.outstanding(), 1);
    }

    #[test]
    fn write_to_read_only_page_is_denied_without_loading() {
        let fx = TestFixture::new();
        let space = fx.space();

        let page = VA::from_value(0x40000);
        let file = fx.file_with(&[7u8; 64]);
        space
            .create_page(
                page,
                PageStatus::LazyExec {
                    segment: FileSlice::new(file, 0, 64),
                },
                false,
            )
            .unwrap();

        let r = space.handle_fault(page, AccessKind::Write, sp()).unwrap();
        assert_eq!(r, FaultResolution::Denied);
        assert_eq!(fx.frames.outstanding(), 0, "no frame consumed");
        assert!(!space.find_page(page).unwrap().lock().is_resident());

        // The read path through the same record still works.
        let r = space.handle_fault(page, AccessKind::Read, sp()).unwrap();
        assert_eq!(r, FaultResolution::Resolved);
    }

    #[test]
    fn fault_on_wild_address_is_denied() {
        let fx = TestFixture::new();
        let space = fx.space();

        let r = space
            .handle_fault(VA::from_value(0x1234), AccessKind::Read, sp())
            .unwrap();
        assert_eq!(r, FaultResolution::Denied);
        assert!(space.find_page(VA::from_value(0x1234)).is_none());
    }

    #[test]
    fn frame_exhaustion_is_an_error_not_a_denial() {
        let fx = TestFixture::constrained(0, 64);
        let space = fx.space();

        let err = space
            .handle_fault(sp(), AccessKind::Write, sp())
            .unwrap_err();
        assert_eq!(err, VmError::NoMemory);
        assert!(space.find_page(sp()).is_none(), "no half-created record");
    }

    #[test]
    fn io_failure_is_fatal_and_leaks_nothing() {
        let fx = TestFixture::new();
        let space = fx.space();

        let page = VA::from_value(0x40000);
        space
            .create_page(
                page,
                PageStatus::LazyExec {
                    segment: FileSlice::new(Arc::new(BrokenFile), 0, 128),
                },
                false,
            )
            .unwrap();

        let err = space.handle_fault(page, AccessKind::Read, sp()).unwrap_err();
        assert!(matches!(err, VmError::Io(_)));
        assert_eq!(fx.frames.outstanding(), 0);
        assert!(
            !space.find_page(page).unwrap().lock().is_resident(),
            "record unchanged after failed load"
        );
    }

    #[test]
    fn clean_mapped_page_eviction_skips_swap_and_rereads_the_file() {
        let fx = TestFixture::new();
        let space = fx.space();

        let file = fx.file_with(&[0x11u8; PAGE_SIZE]);
        let base = VA::from_value(0x50000);
        space.map_file(file.clone(), base).unwrap();

        space.handle_fault(base, AccessKind::Read, sp()).unwrap();
        space.evict(base).unwrap();

        assert_eq!(fx.swap.allocated(), 0, "clean page never touches swap");
        assert!(matches!(
            *space.find_page(base).unwrap().lock().status(),
            PageStatus::MappedFile { .. }
        ));

        space.handle_fault(base, AccessKind::Read, sp()).unwrap();
        assert_eq!(frame_content(&fx, base), vec![0x11u8; PAGE_SIZE]);
    }

    #[test]
    fn dirty_mapped_page_evicts_to_swap_with_sticky_dirty() {
        let fx = TestFixture::new();
        let space = fx.space();

        let file = fx.file_with(&[0u8; PAGE_SIZE]);
        let base = VA::from_value(0x50000);
        space.map_file(file.clone(), base).unwrap();

        space.handle_fault(base, AccessKind::Write, sp()).unwrap();
        let (frame, _) = fx.mmu.mapping(base).unwrap();
        fx.frames.write_frame(frame, &vec![0xeeu8; PAGE_SIZE]).unwrap();
        fx.mmu.set_dirty(base);

        space.evict(base).unwrap();
        assert_eq!(fx.swap.allocated(), 1);

        // Reload resets the hardware dirty bit; the record remembers.
        space.handle_fault(base, AccessKind::Read, sp()).unwrap();
        let handle = space.find_page(base).unwrap();
        assert!(handle.lock().dirty, "dirtiness survives the swap cycle");
        assert!(!fx.mmu.is_dirty(base));
        assert_eq!(frame_content(&fx, base), vec![0xeeu8; PAGE_SIZE]);
    }

    #[test]
    fn swap_exhaustion_leaves_the_page_resident() {
        let fx = TestFixture::constrained(64, 0);
        let space = fx.space();

        let addr = sp();
        let page = addr.page_aligned();
        space.handle_fault(addr, AccessKind::Write, addr).unwrap();

        let err = space.evict(page).unwrap_err();
        assert_eq!(err, VmError::SwapExhausted);
        assert!(space.find_page(page).unwrap().lock().is_resident());
        assert!(fx.mmu.is_present(page));
        assert_eq!(fx.frames.outstanding(), 1);
    }

    #[test]
    fn evict_rejects_non_resident_targets() {
        let fx = TestFixture::new();
        let space = fx.space();

        assert_eq!(
            space.evict(VA::from_value(0x1000)).unwrap_err(),
            VmError::NotTracked
        );

        let file = fx.file_with(&[1u8; 32]);
        let page = VA::from_value(0x40000);
        space
            .create_page(
                page,
                PageStatus::LazyExec {
                    segment: FileSlice::new(file, 0, 32),
                },
                false,
            )
            .unwrap();
        assert_eq!(space.evict(page).unwrap_err(), VmError::NotResident);
    }

    #[test]
    fn fault_code_decoding_selects_the_access_kind() {
        let fx = TestFixture::new();
        let space = fx.space();

        let page = VA::from_value(0x40000);
        let file = fx.file_with(&[9u8; 16]);
        space
            .create_page(
                page,
                PageStatus::LazyExec {
                    segment: FileSlice::new(file, 0, 16),
                },
                false,
            )
            .unwrap();

        let write_fault = FaultCode::WRITE | FaultCode::USER;
        assert_eq!(
            space.handle_fault_code(write_fault, page, sp()).unwrap(),
            FaultResolution::Denied
        );

        let read_fault = FaultCode::USER;
        assert_eq!(
            space.handle_fault_code(read_fault, page, sp()).unwrap(),
            FaultResolution::Resolved
        );
    }

    #[test]
    fn concurrent_faults_on_the_same_page_load_once() {
        use std::thread;

        let fx = TestFixture::new();
        let space = Arc::new(fx.space());

        let file = fx.file_with(&[0x42u8; PAGE_SIZE]);
        let page = VA::from_value(0x60000);
        space
            .create_page(
                page,
                PageStatus::LazyExec {
                    segment: FileSlice::new(file, 0, PAGE_SIZE),
                },
                false,
            )
            .unwrap();

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let space = space.clone();
                thread::spawn(move || space.handle_fault(page, AccessKind::Read, sp()).unwrap())
            })
            .collect();

        for t in threads {
            assert_eq!(t.join().unwrap(), FaultResolution::Resolved);
        }

        assert_eq!(fx.frames.outstanding(), 1, "exactly one load happened");
        assert!(space.find_page(page).unwrap().lock().is_resident());
        assert_eq!(frame_content(&fx, page), vec![0x42u8; PAGE_SIZE]);
    }

    #[test]
    fn concurrent_faults_on_different_pages_do_not_interfere() {
        use std::thread;

        let fx = TestFixture::new();
        let space = Arc::new(fx.space());

        for i in 0..4 {
            let file = fx.file_with(&[i as u8 + 1; 64]);
            space
                .create_page(
                    VA::from_value(0x60000 + i * PAGE_SIZE),
                    PageStatus::LazyExec {
                        segment: FileSlice::new(file, 0, 64),
                    },
                    false,
                )
                .unwrap();
        }

        let threads: Vec<_> = (0..4)
            .map(|i| {
                let space = space.clone();
                thread::spawn(move || {
                    let page = VA::from_value(0x60000 + i * PAGE_SIZE);
                    space.handle_fault(page, AccessKind::Read, sp()).unwrap()
                })
            })
            .collect();

        for t in threads {
            assert_eq!(t.join().unwrap(), FaultResolution::Resolved);
        }

        assert_eq!(fx.frames.outstanding(), 4);
        for i in 0..4u8 {
            let page = VA::from_value(0x60000 + i as usize * PAGE_SIZE);
            assert_eq!(&frame_content(&fx, page)[..64], &[i + 1; 64][..]);
        }
    }
}
