//! In-memory HAL used only by this crate's own tests. Models an NAND as a
//! flat page array and lets tests inject the failures spec Sec 8's scenarios
//! require (a single bad write, an ECC-marginal read, ...).

use alloc::collections::BTreeMap;
use alloc::collections::BTreeSet;
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;

use crate::error::{EccStatus, EraseStatus, Error, WriteStatus};
use crate::geometry::{BlockAddress, NandGeometry, PageAddress};
use crate::hal::{CopyFilter, NandHal};
use crate::metadata::PageMetadata;

#[derive(Clone)]
struct PageSlot {
    data: Vec<u8>,
    metadata: PageMetadata,
    erased: bool,
}

pub struct FakeHal {
    geometry: NandGeometry,
    pages: Vec<PageSlot>,
    bad_blocks: BTreeSet<u32>,
    fail_write_once: BTreeMap<u32, ()>,
    fail_erase_once: BTreeMap<u32, ()>,
    ecc_status_once: BTreeMap<u32, EccStatus>,
}

impl FakeHal {
    pub fn new(geometry: NandGeometry) -> Self {
        let total_pages = geometry.total_blocks() as usize * geometry.pages_per_block as usize;
        let slot = PageSlot {
            data: vec![0xFFu8; geometry.page_data_size],
            metadata: PageMetadata::erased(),
            erased: true,
        };
        FakeHal {
            geometry,
            pages: vec![slot; total_pages],
            bad_blocks: BTreeSet::new(),
            fail_write_once: BTreeMap::new(),
            fail_erase_once: BTreeMap::new(),
            ecc_status_once: BTreeMap::new(),
        }
    }

    pub fn inject_write_failure(&mut self, page: PageAddress) {
        self.fail_write_once.insert(page.0, ());
    }

    pub fn inject_erase_failure(&mut self, block: BlockAddress) {
        self.fail_erase_once.insert(block.0, ());
    }

    pub fn inject_ecc_status(&mut self, page: PageAddress, status: EccStatus) {
        self.ecc_status_once.insert(page.0, status);
    }

    pub fn bad_block_count(&self) -> usize {
        self.bad_blocks.len()
    }
}

impl NandHal for FakeHal {
    fn geometry(&self) -> NandGeometry {
        self.geometry
    }

    fn read_page(
        &mut self,
        page: PageAddress,
        data: &mut [u8],
        metadata: &mut PageMetadata,
    ) -> Result<EccStatus, Error> {
        let slot = &self.pages[page.0 as usize];
        data[..slot.data.len().min(data.len())].copy_from_slice(&slot.data[..slot.data.len().min(data.len())]);
        *metadata = slot.metadata;
        Ok(self.ecc_status_once.remove(&page.0).unwrap_or(EccStatus::Success))
    }

    fn read_metadata(
        &mut self,
        page: PageAddress,
        metadata: &mut PageMetadata,
    ) -> Result<EccStatus, Error> {
        *metadata = self.pages[page.0 as usize].metadata;
        Ok(self.ecc_status_once.remove(&page.0).unwrap_or(EccStatus::Success))
    }

    fn write_page(
        &mut self,
        page: PageAddress,
        data: &[u8],
        metadata: &PageMetadata,
    ) -> Result<WriteStatus, Error> {
        if self.fail_write_once.remove(&page.0).is_some() {
            return Ok(WriteStatus::WriteFailed);
        }
        let slot = &mut self.pages[page.0 as usize];
        slot.data[..data.len()].copy_from_slice(data);
        slot.metadata = *metadata;
        slot.erased = false;
        Ok(WriteStatus::Success)
    }

    fn erase_block(&mut self, block: BlockAddress) -> Result<EraseStatus, Error> {
        if self.fail_erase_once.remove(&block.0).is_some() {
            return Ok(EraseStatus::EraseFailed);
        }
        let first = block.0 * self.geometry.pages_per_block;
        for i in 0..self.geometry.pages_per_block {
            let slot = &mut self.pages[(first + i) as usize];
            slot.erased = true;
            slot.metadata = PageMetadata::erased();
            for b in slot.data.iter_mut() {
                *b = 0xFF;
            }
        }
        Ok(EraseStatus::Success)
    }

    fn is_block_bad(&mut self, block: BlockAddress, _use_factory_marker: bool) -> bool {
        self.bad_blocks.contains(&block.0)
    }

    fn mark_block_bad(&mut self, block: BlockAddress) {
        self.bad_blocks.insert(block.0);
    }

    fn copy_pages(
        &mut self,
        src: PageAddress,
        dst: PageAddress,
        count: u32,
        filter: &mut dyn CopyFilter,
    ) -> Result<u32, Error> {
        let page_size = self.geometry.page_data_size;
        let mut data = vec![0u8; page_size];
        for i in 0..count {
            let from = PageAddress(src.0 + i);
            let to = PageAddress(dst.0 + i);
            let mut meta = PageMetadata::erased();
            self.read_page(from, &mut data, &mut meta)?;
            filter.apply(from, to, &mut data, &mut meta)?;
            match self.write_page(to, &data, &meta)? {
                WriteStatus::Success => {}
                WriteStatus::WriteFailed => return Ok(i),
            }
        }
        Ok(count)
    }
}

/// A handle to a [`FakeHal`] shared between `Media` (which needs an owned
/// `Box<dyn NandHal>`) and a test (which needs to keep injecting failures
/// after `Media::new` takes ownership of its HAL).
#[derive(Clone)]
pub struct SharedFakeHal(pub Rc<RefCell<FakeHal>>);

impl SharedFakeHal {
    pub fn new(geometry: NandGeometry) -> Self {
        SharedFakeHal(Rc::new(RefCell::new(FakeHal::new(geometry))))
    }
}

impl NandHal for SharedFakeHal {
    fn geometry(&self) -> NandGeometry {
        self.0.borrow().geometry()
    }

    fn read_page(
        &mut self,
        page: PageAddress,
        data: &mut [u8],
        metadata: &mut PageMetadata,
    ) -> Result<EccStatus, Error> {
        self.0.borrow_mut().read_page(page, data, metadata)
    }

    fn read_metadata(&mut self, page: PageAddress, metadata: &mut PageMetadata) -> Result<EccStatus, Error> {
        self.0.borrow_mut().read_metadata(page, metadata)
    }

    fn write_page(&mut self, page: PageAddress, data: &[u8], metadata: &PageMetadata) -> Result<WriteStatus, Error> {
        self.0.borrow_mut().write_page(page, data, metadata)
    }

    fn erase_block(&mut self, block: BlockAddress) -> Result<EraseStatus, Error> {
        self.0.borrow_mut().erase_block(block)
    }

    fn is_block_bad(&mut self, block: BlockAddress, use_factory_marker: bool) -> bool {
        self.0.borrow_mut().is_block_bad(block, use_factory_marker)
    }

    fn mark_block_bad(&mut self, block: BlockAddress) {
        self.0.borrow_mut().mark_block_bad(block)
    }

    fn copy_pages(
        &mut self,
        src: PageAddress,
        dst: PageAddress,
        count: u32,
        filter: &mut dyn CopyFilter,
    ) -> Result<u32, Error> {
        self.0.borrow_mut().copy_pages(src, dst, count, filter)
    }
}
