//! The raw-NAND HAL contract this crate consumes (spec Sec 6).
//!
//! Everything in this module is an interface onto an external collaborator:
//! page read/write/erase, multi-plane commands, ECC, and bad-block
//! detection are implemented by the platform, not by this crate. Only a
//! `#[cfg(test)]` fake (see `fake_hal`) lives in-tree, used to exercise the
//! translation logic in unit and scenario tests.

use crate::error::{EccStatus, EraseStatus, Error, WriteStatus};
use crate::geometry::{BlockAddress, NandGeometry, PageAddress};
use crate::metadata::PageMetadata;

/// Per-plane parameter block for a multi-plane read, mirroring the HAL's
/// `readMultiplePages`/`readMultipleMetadata` array-of-params shape.
pub struct PlaneReadOp<'a> {
    pub page: PageAddress,
    pub data: &'a mut [u8],
    pub metadata: &'a mut PageMetadata,
    pub result: Option<Result<EccStatus, Error>>,
}

/// Per-plane parameter block for a multi-plane write.
pub struct PlaneWriteOp<'a> {
    pub page: PageAddress,
    pub data: &'a [u8],
    pub metadata: &'a PageMetadata,
    pub result: Option<Result<WriteStatus, Error>>,
}

/// Callback shape for `copyPages`: rewrite metadata in flight (LBA fixup,
/// in-order flag) and report whether anything was modified.
pub trait CopyFilter {
    fn apply(
        &mut self,
        from_page: PageAddress,
        to_page: PageAddress,
        data: &mut [u8],
        metadata: &mut PageMetadata,
    ) -> Result<bool, Error>;
}

/// A filter that changes nothing; used by plain relocation copies.
pub struct IdentityFilter;

impl CopyFilter for IdentityFilter {
    fn apply(
        &mut self,
        _from_page: PageAddress,
        _to_page: PageAddress,
        _data: &mut [u8],
        _metadata: &mut PageMetadata,
    ) -> Result<bool, Error> {
        Ok(false)
    }
}

/// Raw-NAND hardware abstraction layer. Object-safe so `Media` can hold it
/// as `Box<dyn NandHal>` without committing to one NAND family at compile time
/// (spec Sec 9's note on replacing the virtual-method `NandPhysicalMedia`
/// hierarchy with one handle plus a dispatch table).
pub trait NandHal {
    fn geometry(&self) -> NandGeometry;

    fn read_page(
        &mut self,
        page: PageAddress,
        data: &mut [u8],
        metadata: &mut PageMetadata,
    ) -> Result<EccStatus, Error>;

    fn read_metadata(
        &mut self,
        page: PageAddress,
        metadata: &mut PageMetadata,
    ) -> Result<EccStatus, Error>;

    fn write_page(
        &mut self,
        page: PageAddress,
        data: &[u8],
        metadata: &PageMetadata,
    ) -> Result<WriteStatus, Error>;

    fn erase_block(&mut self, block: BlockAddress) -> Result<EraseStatus, Error>;

    fn is_block_bad(&mut self, block: BlockAddress, use_factory_marker: bool) -> bool;

    fn mark_block_bad(&mut self, block: BlockAddress);

    /// Copy `count` pages starting at `src` to starting at `dst`, running
    /// `filter` over each page's data/metadata before it is written. Returns
    /// the number of pages actually written before any failure. Default
    /// implementation reads each source page, applies the filter, and
    /// writes it forward one at a time, stopping at the first write that
    /// comes back `WriteFailed` rather than surfacing an `Err`.
    fn copy_pages(
        &mut self,
        src: PageAddress,
        dst: PageAddress,
        count: u32,
        filter: &mut dyn CopyFilter,
    ) -> Result<u32, Error> {
        let page_size = self.geometry().page_data_size;
        let mut data = alloc::vec![0u8; page_size];
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

    /// Multi-plane read. Default implementation loops `read_page` per plane;
    /// a true multi-plane HAL overrides this to issue one combined command.
    fn read_multi(&mut self, ops: &mut [PlaneReadOp<'_>]) {
        for op in ops.iter_mut() {
            op.result = Some(self.read_page(op.page, op.data, op.metadata));
        }
    }

    fn read_metadata_multi(&mut self, ops: &mut [PlaneReadOp<'_>]) {
        for op in ops.iter_mut() {
            op.result = Some(self.read_metadata(op.page, op.metadata));
        }
    }

    fn write_multi(&mut self, ops: &mut [PlaneWriteOp<'_>]) {
        for op in ops.iter_mut() {
            op.result = Some(self.write_page(op.page, op.data, op.metadata));
        }
    }

    fn erase_multi(&mut self, blocks: &[BlockAddress], results: &mut [Option<Result<EraseStatus, Error>>]) {
        for (block, slot) in blocks.iter().zip(results.iter_mut()) {
            *slot = Some(self.erase_block(*block));
        }
    }
}
