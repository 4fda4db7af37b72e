//! On-demand stack growth.
//!
//! A fault below the lowest materialized stack page is either the stack
//! honestly growing downward or a wild pointer that happens to land under
//! it. The policy here accepts the fault only when the address is both
//! inside the fixed stack bounds and at most one page below the faulting
//! thread's stack pointer — anything further is implausible for a
//! push/access pattern and is reported as an access violation.
//!
//! Accepted growth does not go through the lazy path: stack pages have no
//! backing store to defer to, so the page materializes immediately as a
//! zeroed resident frame.

use crate::addr::{PAGE_SIZE, VA};
use crate::error::{Result, VmError};
use crate::frame::FrameTable;
use crate::mmu::Mmu;
use crate::page::{PageOrigin, PageStatus};
use crate::space::AddressSpace;
use alloc::vec;
use log::warn;

/// Upper bound on the stack, matching the usual teaching-kernel default.
pub const MAX_STACK_SIZE: usize = 8 * 1024 * 1024;

/// How far below the stack pointer a fault may land and still be treated
/// as growth.
pub const STACK_SLACK: usize = PAGE_SIZE;

impl AddressSpace {
    /// Grows the stack by materializing the page containing `addr`.
    ///
    /// `stack_pointer` is the faulting thread's stack pointer at trap
    /// time. Returns `AccessViolation` when the address fails the
    /// plausibility checks, `AlreadyTracked` when the page already exists
    /// (a concurrent fault grew it first).
    pub fn grow_stack(&self, addr: VA, stack_pointer: VA) -> Result<()> {
        if !self.stack.contains_address(addr) {
            warn!("stack growth to {} outside stack bounds", addr);
            return Err(VmError::AccessViolation);
        }

        if addr.value() + STACK_SLACK < stack_pointer.value() {
            warn!(
                "stack growth to {} implausibly far below sp {}",
                addr, stack_pointer
            );
            return Err(VmError::AccessViolation);
        }

        let page = addr.page_aligned();

        let frame = self.frames.acquire_frame()?;

        if let Err(e) = self.frames.write_frame(frame, &vec![0u8; PAGE_SIZE]) {
            self.frames.release_frame(frame);
            return Err(e);
        }

        let created = self.spt.create(
            page,
            PageStatus::Resident {
                frame,
                origin: PageOrigin::Anon,
            },
            true,
        );

        if let Err(e) = created {
            self.frames.release_frame(frame);
            return Err(e);
        }

        if let Err(e) = self.mmu.install_mapping(page, frame, true) {
            self.spt.remove(page);
            self.frames.release_frame(frame);
            return Err(e);
        }

        Ok(())
    }
}
