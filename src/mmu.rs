//! Hardware page-table boundary.
//!
//! One instance per address space. The core tells the MMU which
//! virtual→frame translations exist and with what writability; the MMU
//! reports back the accessed-state bits the eviction and write-back paths
//! need.

use crate::addr::VA;
use crate::error::Result;
use crate::frame::FrameRef;

pub trait Mmu: Send + Sync {
    /// Installs the translation `page → frame`. `page` is page-aligned.
    fn install_mapping(&self, page: VA, frame: FrameRef, writable: bool) -> Result<()>;

    /// Removes the translation for `page`, if any.
    fn clear_mapping(&self, page: VA);

    /// Whether a translation for `page` is currently installed.
    fn is_present(&self, page: VA) -> bool;

    /// Whether the hardware has recorded a write through the current
    /// translation of `page`. Cleared when the translation is reinstalled.
    fn is_dirty(&self, page: VA) -> bool;
}
