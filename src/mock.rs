//! Mock collaborators shared by the test modules.
//!
//! Each mock keeps just enough state to let tests assert on resource
//! balance: the frame table counts outstanding frames, the swap device
//! counts live slots, the MMU records installed translations and dirty
//! bits. `MemFile` is a plain growable byte vector behind the
//! [`FileObject`] interface. Mocks panic on contract violations (double
//! release, touching a free frame) so leaks and use-after-free surface as
//! test failures rather than silent corruption.

use crate::addr::{PAGE_SIZE, VA};
use crate::error::{IoError, Result, VmError};
use crate::frame::{FrameRef, FrameTable};
use crate::fs::FileObject;
use crate::mmu::Mmu;
use crate::space::AddressSpace;
use crate::swap::{SwapDevice, SwapSlot};
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::cmp::min;
use spin::Mutex;

/// Exclusive upper bound of the user stack in every test address space.
pub(crate) const USER_STACK_TOP: usize = 0x8000_0000;

pub(crate) struct MemFile {
    data: Mutex<Vec<u8>>,
}

impl MemFile {
    pub fn with_content(bytes: &[u8]) -> Self {
        Self {
            data: Mutex::new(bytes.to_vec()),
        }
    }

    /// Current file content, for write-back assertions.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl FileObject for MemFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.lock();
        let offset = offset as usize;

        if offset >= data.len() {
            return Ok(0);
        }

        let n = min(buf.len(), data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);

        Ok(n)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let mut data = self.data.lock();
        let offset = offset as usize;

        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);

        Ok(buf.len())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.lock().len() as u64)
    }
}

/// A file whose every transfer fails, for fatal-I/O paths.
pub(crate) struct BrokenFile;

impl FileObject for BrokenFile {
    fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize> {
        Err(IoError::Device.into())
    }

    fn write_at(&self, _offset: u64, _buf: &[u8]) -> Result<usize> {
        Err(IoError::Device.into())
    }

    fn len(&self) -> Result<u64> {
        Ok(PAGE_SIZE as u64)
    }
}

pub(crate) struct TestFrameTable {
    frames: Mutex<Vec<Option<Vec<u8>>>>,
    capacity: usize,
}

impl TestFrameTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Frames currently handed out and not yet released.
    pub fn outstanding(&self) -> usize {
        self.frames.lock().iter().filter(|f| f.is_some()).count()
    }
}

impl FrameTable for TestFrameTable {
    fn acquire_frame(&self) -> Result<FrameRef> {
        let mut frames = self.frames.lock();

        if let Some(index) = frames.iter().position(|f| f.is_none()) {
            frames[index] = Some(vec![0u8; PAGE_SIZE]);
            return Ok(FrameRef::from_index(index));
        }

        if frames.len() >= self.capacity {
            return Err(VmError::NoMemory);
        }

        frames.push(Some(vec![0u8; PAGE_SIZE]));
        Ok(FrameRef::from_index(frames.len() - 1))
    }

    fn release_frame(&self, frame: FrameRef) {
        let mut frames = self.frames.lock();
        let slot = frames
            .get_mut(frame.index())
            .expect("released frame was never allocated");
        assert!(slot.take().is_some(), "double release of frame");
    }

    fn read_frame(&self, frame: FrameRef, buf: &mut [u8]) -> Result<()> {
        let frames = self.frames.lock();
        let content = frames[frame.index()].as_ref().expect("read of a free frame");
        buf.copy_from_slice(content);
        Ok(())
    }

    fn write_frame(&self, frame: FrameRef, buf: &[u8]) -> Result<()> {
        let mut frames = self.frames.lock();
        let content = frames[frame.index()]
            .as_mut()
            .expect("write to a free frame");
        content.copy_from_slice(buf);
        Ok(())
    }
}

pub(crate) struct TestSwap {
    slots: Mutex<BTreeMap<usize, Vec<u8>>>,
    next: Mutex<usize>,
    capacity: usize,
}

impl TestSwap {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(BTreeMap::new()),
            next: Mutex::new(0),
            capacity,
        }
    }

    /// Slots currently allocated and not yet freed.
    pub fn allocated(&self) -> usize {
        self.slots.lock().len()
    }
}

impl SwapDevice for TestSwap {
    fn allocate_slot(&self) -> Result<SwapSlot> {
        let mut slots = self.slots.lock();

        if slots.len() >= self.capacity {
            return Err(VmError::SwapExhausted);
        }

        let mut next = self.next.lock();
        let index = *next;
        *next += 1;
        slots.insert(index, vec![0u8; PAGE_SIZE]);

        Ok(SwapSlot::from_index(index))
    }

    fn free_slot(&self, slot: SwapSlot) {
        let removed = self.slots.lock().remove(&slot.index());
        assert!(removed.is_some(), "double free of swap slot");
    }

    fn read_slot(&self, slot: SwapSlot, buf: &mut [u8]) -> Result<()> {
        let slots = self.slots.lock();
        let content = slots.get(&slot.index()).expect("read of a free swap slot");
        buf.copy_from_slice(content);
        Ok(())
    }

    fn write_slot(&self, slot: SwapSlot, buf: &[u8]) -> Result<()> {
        let mut slots = self.slots.lock();
        let content = slots
            .get_mut(&slot.index())
            .expect("write to a free swap slot");
        content.copy_from_slice(buf);
        Ok(())
    }
}

pub(crate) struct TestMmu {
    maps: Mutex<BTreeMap<VA, (FrameRef, bool)>>,
    dirty: Mutex<BTreeSet<VA>>,
}

impl TestMmu {
    pub fn new() -> Self {
        Self {
            maps: Mutex::new(BTreeMap::new()),
            dirty: Mutex::new(BTreeSet::new()),
        }
    }

    /// Simulates a user store through the installed translation.
    pub fn set_dirty(&self, page: VA) {
        assert!(
            self.maps.lock().contains_key(&page),
            "store through a missing translation"
        );
        self.dirty.lock().insert(page);
    }

    pub fn mapping(&self, page: VA) -> Option<(FrameRef, bool)> {
        self.maps.lock().get(&page).copied()
    }
}

impl Mmu for TestMmu {
    fn install_mapping(&self, page: VA, frame: FrameRef, writable: bool) -> Result<()> {
        self.maps.lock().insert(page, (frame, writable));
        // A fresh translation starts with a clear hardware dirty bit.
        self.dirty.lock().remove(&page);
        Ok(())
    }

    fn clear_mapping(&self, page: VA) {
        self.maps.lock().remove(&page);
        self.dirty.lock().remove(&page);
    }

    fn is_present(&self, page: VA) -> bool {
        self.maps.lock().contains_key(&page)
    }

    fn is_dirty(&self, page: VA) -> bool {
        self.dirty.lock().contains(&page)
    }
}

pub(crate) struct TestFixture {
    pub frames: Arc<TestFrameTable>,
    pub swap: Arc<TestSwap>,
    pub mmu: Arc<TestMmu>,
    pub mmu2: Arc<TestMmu>,
}

impl TestFixture {
    pub fn new() -> Self {
        Self::constrained(64, 64)
    }

    pub fn constrained(frame_capacity: usize, swap_capacity: usize) -> Self {
        Self {
            frames: Arc::new(TestFrameTable::with_capacity(frame_capacity)),
            swap: Arc::new(TestSwap::with_capacity(swap_capacity)),
            mmu: Arc::new(TestMmu::new()),
            mmu2: Arc::new(TestMmu::new()),
        }
    }

    pub fn space(&self) -> AddressSpace {
        AddressSpace::new(
            self.frames.clone(),
            self.swap.clone(),
            self.mmu.clone(),
            VA::from_value(USER_STACK_TOP),
        )
    }

    pub fn file_with(&self, bytes: &[u8]) -> Arc<MemFile> {
        Arc::new(MemFile::with_content(bytes))
    }
}
