//! Shared consolidation engine backing both the zone-map cache and the
//! persistent phy-map (spec Sec 4.3).
//!
//! A persistent map lives in one NAND block; each page in that block is a
//! **section** covering a contiguous run of logical entries. Sections carry
//! an implicit sequence via write order — since pages within a block are
//! always written forward, the last page covering a given entry range is
//! the freshest. When the block fills, [`PersistentMap::consolidate`]
//! copies the freshest copy of every section into a fresh block and frees
//! the old one.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::allocator::BlockAllocator;
use crate::error::{EccStatus, Error};
use crate::geometry::{BlockAddress, NandGeometry, PageAddress};
use crate::hal::NandHal;
use crate::metadata::{MapType, NandMapSectionHeader, PageMetadata, Signature};
use crate::phymap::PhyMap;

/// Lets a subclass override which bytes are written for a section during
/// consolidation — the zone-map cache uses this to flush dirty in-RAM
/// sections instead of re-reading stale on-media copies.
pub trait ConsolidateHook {
    /// Return the bytes that should represent `[first_entry, first_entry + count)`
    /// right now, or `None` to use the freshest on-media copy unchanged.
    fn section_for_consolidate(&mut self, first_entry: u32, count: u32) -> Option<Vec<u8>>;
}

/// A hook that always defers to the on-media copy.
pub struct NoOverride;

impl ConsolidateHook for NoOverride {
    fn section_for_consolidate(&mut self, _first_entry: u32, _count: u32) -> Option<Vec<u8>> {
        None
    }
}

/// Borrowed collaborators a [`PersistentMap`] operation needs. Bundled so
/// methods don't carry a five-parameter signature.
pub struct PersistentMapCtx<'a> {
    pub hal: &'a mut dyn NandHal,
    pub phymap: &'a mut PhyMap,
    pub allocator: &'a mut dyn BlockAllocator,
    pub reserved_low: BlockAddress,
    pub reserved_high: BlockAddress,
}

#[derive(Debug, Clone, Copy)]
struct SectionInfo {
    page_offset: u32,
    count: u32,
    entry_size: u8,
}

pub struct PersistentMap {
    map_type: MapType,
    geometry: NandGeometry,
    current_block: Option<BlockAddress>,
    next_free_page_offset: u32,
    version: u32,
    /// first_entry -> where its freshest section currently lives.
    section_offsets: BTreeMap<u32, SectionInfo>,
}

impl PersistentMap {
    pub fn new(map_type: MapType, geometry: NandGeometry) -> Self {
        PersistentMap {
            map_type,
            geometry,
            current_block: None,
            next_free_page_offset: 0,
            version: 0,
            section_offsets: BTreeMap::new(),
        }
    }

    pub fn current_block(&self) -> Option<BlockAddress> {
        self.current_block
    }

    pub fn set_current_block(&mut self, block: BlockAddress) {
        self.current_block = Some(block);
        self.next_free_page_offset = 0;
        self.section_offsets.clear();
        self.version = 0;
    }

    /// Scan the reserved range for a block whose first-page metadata
    /// signature matches this map's type.
    pub fn find_map_block(&mut self, ctx: &mut PersistentMapCtx<'_>) -> Result<BlockAddress, Error> {
        let mut block = ctx.reserved_low;
        while block < ctx.reserved_high {
            if !ctx.phymap.is_block_used(block) {
                block = BlockAddress(block.0 + 1);
                continue;
            }
            let page = self.geometry.make_page(block, 0);
            let mut meta = PageMetadata::erased();
            let mut scratch = [0u8; 1];
            let _ = ctx.hal.read_metadata(page, &mut meta).or_else(|_| {
                ctx.hal.read_page(page, &mut scratch, &mut meta)
            });
            if meta.signature == self.map_type.signature() {
                self.set_current_block(block);
                return Ok(block);
            }
            block = BlockAddress(block.0 + 1);
        }
        Err(Error::FindLbaMapBlockFailed)
    }

    /// One-shot scan of the current block recording, per section, the page
    /// offset of its newest version. Pages are always written forward, so a
    /// later occurrence of the same `first_entry` simply overwrites the
    /// earlier table entry.
    pub fn build_section_offset_table(&mut self, ctx: &mut PersistentMapCtx<'_>) -> Result<(), Error> {
        let block = self.current_block.ok_or(Error::FindLbaMapBlockFailed)?;
        self.section_offsets.clear();
        let mut offset = 0u32;
        let page_size = ctx.hal.geometry().page_data_size;
        let mut buf = alloc::vec![0u8; page_size];
        loop {
            if offset >= self.geometry.pages_per_block {
                break;
            }
            let page = self.geometry.make_page(block, offset);
            let mut meta = PageMetadata::erased();
            let status = ctx.hal.read_page(page, &mut buf, &mut meta)?;
            if meta.is_erased() {
                break;
            }
            if !status.is_ok_for_caller() {
                offset += 1;
                continue;
            }
            if let Some(header) = NandMapSectionHeader::decode(&buf) {
                self.section_offsets.insert(
                    header.first_entry,
                    SectionInfo {
                        page_offset: offset,
                        count: header.entry_count,
                        entry_size: header.entry_size,
                    },
                );
                self.version = self.version.max(header.version);
            }
            offset += 1;
        }
        self.next_free_page_offset = offset;
        Ok(())
    }

    /// Append a new section, consolidating first if the current block is full.
    pub fn add_section(
        &mut self,
        ctx: &mut PersistentMapCtx<'_>,
        hook: &mut dyn ConsolidateHook,
        first_entry: u32,
        entries: &[u8],
        entry_size: u8,
        entry_count: u32,
    ) -> Result<(), Error> {
        if self.current_block.is_none() || self.next_free_page_offset >= self.geometry.pages_per_block {
            self.consolidate(ctx, hook)?;
        }
        loop {
            match self.write_section_page(ctx, first_entry, entries, entry_size, entry_count) {
                Ok(()) => return Ok(()),
                Err(Error::WriteFailed) => {
                    // Current block just went bad; consolidate onto a fresh
                    // one and retry once.
                    self.consolidate(ctx, hook)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn write_section_page(
        &mut self,
        ctx: &mut PersistentMapCtx<'_>,
        first_entry: u32,
        entries: &[u8],
        entry_size: u8,
        entry_count: u32,
    ) -> Result<(), Error> {
        let block = self.current_block.ok_or(Error::FindLbaMapBlockFailed)?;
        let offset = self.next_free_page_offset;
        let page = self.geometry.make_page(block, offset);
        let page_size = ctx.hal.geometry().page_data_size;
        let mut buf = alloc::vec![0u8; page_size];
        self.version += 1;
        let header = NandMapSectionHeader {
            map_type: self.map_type,
            entry_size,
            first_entry,
            entry_count,
            version: self.version,
        };
        header.encode(&mut buf);
        let header_len = NandMapSectionHeader::ENCODED_LEN;
        buf[header_len..header_len + entries.len()].copy_from_slice(entries);
        let meta = PageMetadata {
            signature: self.map_type.signature(),
            lba: 0,
            lsi: 0,
            flags: crate::metadata::MetaFlags::empty(),
        };
        match ctx.hal.write_page(page, &buf, &meta)? {
            crate::error::WriteStatus::Success => {
                self.section_offsets.insert(first_entry, SectionInfo { page_offset: offset, count: entry_count, entry_size });
                self.next_free_page_offset += 1;
                Ok(())
            }
            crate::error::WriteStatus::WriteFailed => {
                ctx.hal.mark_block_bad(block);
                ctx.phymap.mark_used(block);
                Err(Error::WriteFailed)
            }
        }
    }

    /// Allocate a fresh block, copy every section's freshest content into it
    /// in ascending logical order, then free the old block. Restarts from a
    /// freshly allocated block if a write fails partway through, so callers
    /// never observe a half-populated new block.
    pub fn consolidate(&mut self, ctx: &mut PersistentMapCtx<'_>, hook: &mut dyn ConsolidateHook) -> Result<(), Error> {
        let old_block = self.current_block;
        loop {
            let mut candidate = BlockAddress::INVALID;
            if !ctx.allocator.allocate_block(&self.geometry, ctx.phymap, &mut candidate) {
                return Err(Error::PhyMapFull);
            }
            if ctx.hal.erase_block(candidate)?.ne(&crate::error::EraseStatus::Success) {
                ctx.hal.mark_block_bad(candidate);
                ctx.phymap.mark_used(candidate);
                continue;
            }
            ctx.phymap.mark_used(candidate);

            match self.populate_new_block(ctx, hook, candidate, old_block) {
                Ok(()) => {
                    if let Some(old) = old_block {
                        let _ = ctx.phymap.mark_free_and_erase(ctx.hal, old)?;
                    }
                    return Ok(());
                }
                Err(Error::WriteFailed) => {
                    ctx.hal.mark_block_bad(candidate);
                    ctx.phymap.mark_used(candidate);
                    // restart with a different candidate block
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn populate_new_block(
        &mut self,
        ctx: &mut PersistentMapCtx<'_>,
        hook: &mut dyn ConsolidateHook,
        new_block: BlockAddress,
        old_block: Option<BlockAddress>,
    ) -> Result<(), Error> {
        let page_size = ctx.hal.geometry().page_data_size;
        let header_len = NandMapSectionHeader::ENCODED_LEN;
        let old_sections: Vec<(u32, SectionInfo)> =
            self.section_offsets.iter().map(|(k, v)| (*k, *v)).collect();

        let mut new_offsets = BTreeMap::new();
        let mut offset = 0u32;
        let mut max_version = 0u32;

        for (first_entry, info) in old_sections {
            let bytes = if let Some(overridden) = hook.section_for_consolidate(first_entry, info.count) {
                overridden
            } else if let Some(old) = old_block {
                let page = self.geometry.make_page(old, info.page_offset);
                let mut buf = alloc::vec![0u8; page_size];
                let mut meta = PageMetadata::erased();
                ctx.hal.read_page(page, &mut buf, &mut meta)?;
                buf[header_len..header_len + (info.count as usize * info.entry_size as usize)].to_vec()
            } else {
                continue;
            };

            let mut buf = alloc::vec![0u8; page_size];
            self.version += 1;
            max_version = max_version.max(self.version);
            let header = NandMapSectionHeader {
                map_type: self.map_type,
                entry_size: info.entry_size,
                first_entry,
                entry_count: info.count,
                version: self.version,
            };
            header.encode(&mut buf);
            buf[header_len..header_len + bytes.len()].copy_from_slice(&bytes);
            let meta = PageMetadata {
                signature: self.map_type.signature(),
                lba: 0,
                lsi: 0,
                flags: crate::metadata::MetaFlags::empty(),
            };
            let page = self.geometry.make_page(new_block, offset);
            match ctx.hal.write_page(page, &buf, &meta)? {
                crate::error::WriteStatus::Success => {
                    new_offsets.insert(first_entry, SectionInfo { page_offset: offset, count: info.count, entry_size: info.entry_size });
                    offset += 1;
                }
                crate::error::WriteStatus::WriteFailed => return Err(Error::WriteFailed),
            }
        }

        self.current_block = Some(new_block);
        self.next_free_page_offset = offset;
        self.section_offsets = new_offsets;
        self.version = max_version;
        Ok(())
    }

    /// Locate the newest section covering `entry_index` and read it into
    /// `buffer` (header followed by raw entry bytes). When `auto_consolidate`
    /// is set, an ECC-fixed-but-rewrite-needed read triggers consolidation
    /// before returning.
    pub fn retrieve_section(
        &mut self,
        ctx: &mut PersistentMapCtx<'_>,
        hook: &mut dyn ConsolidateHook,
        entry_index: u32,
        buffer: &mut [u8],
        auto_consolidate: bool,
    ) -> Result<NandMapSectionHeader, Error> {
        let block = self.current_block.ok_or(Error::FindLbaMapBlockFailed)?;
        let (first_entry, info) = self
            .section_offsets
            .range(..=entry_index)
            .next_back()
            .filter(|(first, info)| entry_index < *first + info.count)
            .map(|(f, i)| (*f, *i))
            .ok_or(Error::FindLbaMapBlockFailed)?;

        let page = self.geometry.make_page(block, info.page_offset);
        let status = ctx.hal.read_page(page, buffer, &mut PageMetadata::erased())?;
        if status == EccStatus::FixedRewriteSector && auto_consolidate {
            self.consolidate(ctx, hook)?;
            return self.retrieve_section(ctx, hook, entry_index, buffer, false);
        }
        if !status.is_ok_for_caller() {
            return Err(Error::EccFixFailed);
        }
        Ok(NandMapSectionHeader {
            map_type: self.map_type,
            entry_size: info.entry_size,
            first_entry,
            entry_count: info.count,
            version: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::LinearBlockAllocator;
    use crate::fake_hal::FakeHal;

    fn geo() -> NandGeometry {
        NandGeometry {
            page_data_size: 256,
            pages_per_block: 8,
            planes_per_die: 1,
            blocks_per_chip: 32,
            chip_count: 1,
            reserved_range_good_blocks: 4,
            max_bad_block_percent: 2,
        }
    }

    #[test]
    fn add_section_then_retrieve() {
        let g = geo();
        let mut hal = FakeHal::new(g);
        let mut phymap = PhyMap::new(g.total_blocks());
        let mut alloc = LinearBlockAllocator::new(BlockAddress(0), BlockAddress(8));
        let mut pm = PersistentMap::new(MapType::ZoneMap, g);

        let mut out = BlockAddress::INVALID;
        assert!(alloc.allocate_block(&g, &phymap, &mut out));
        hal.erase_block(out).unwrap();
        phymap.mark_used(out);
        pm.set_current_block(out);

        let entries = [1u8, 2, 3, 4];
        {
            let mut ctx = PersistentMapCtx {
                hal: &mut hal,
                phymap: &mut phymap,
                allocator: &mut alloc,
                reserved_low: BlockAddress(0),
                reserved_high: BlockAddress(8),
            };
            pm.add_section(&mut ctx, &mut NoOverride, 0, &entries, 1, 4).unwrap();
        }

        let mut buf = alloc::vec![0u8; g.page_data_size];
        let mut ctx = PersistentMapCtx {
            hal: &mut hal,
            phymap: &mut phymap,
            allocator: &mut alloc,
            reserved_low: BlockAddress(0),
            reserved_high: BlockAddress(8),
        };
        let header = pm.retrieve_section(&mut ctx, &mut NoOverride, 2, &mut buf, true).unwrap();
        assert_eq!(header.first_entry, 0);
        let hlen = NandMapSectionHeader::ENCODED_LEN;
        assert_eq!(&buf[hlen..hlen + 4], &entries);
    }

    #[test]
    fn consolidate_moves_to_fresh_block_and_frees_old() {
        let g = geo();
        let mut hal = FakeHal::new(g);
        let mut phymap = PhyMap::new(g.total_blocks());
        let mut alloc = LinearBlockAllocator::new(BlockAddress(0), BlockAddress(8));
        let mut pm = PersistentMap::new(MapType::ZoneMap, g);

        let mut out = BlockAddress::INVALID;
        assert!(alloc.allocate_block(&g, &phymap, &mut out));
        hal.erase_block(out).unwrap();
        phymap.mark_used(out);
        pm.set_current_block(out);
        let old_block = out;

        // Fill the block with sections until consolidation is forced.
        for i in 0..(g.pages_per_block + 2) {
            let entries = [(i % 256) as u8];
            let mut ctx = PersistentMapCtx {
                hal: &mut hal,
                phymap: &mut phymap,
                allocator: &mut alloc,
                reserved_low: BlockAddress(0),
                reserved_high: BlockAddress(8),
            };
            pm.add_section(&mut ctx, &mut NoOverride, i, &entries, 1, 1).unwrap();
        }

        assert_ne!(pm.current_block(), Some(old_block));
        assert!(!phymap.is_block_used(old_block));
    }
}
