//! Persists the [`PhyMap`] bitmap across reboots (spec Sec 4.5), built on
//! top of the same section/consolidate machinery as the zone map.
//!
//! Unlike the zone map, the phy-map isn't paged in and out piecemeal: the
//! whole bitmap is written out at once on `save()` and read back whole on
//! `load()`. Each section's "entry" here is one byte of the bitmap (8
//! blocks), not one block.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::Error;
use crate::geometry::{BlockAddress, NandGeometry};
use crate::metadata::{MapType, NandMapSectionHeader};
use crate::persistent_map::{NoOverride, PersistentMap, PersistentMapCtx};
use crate::phymap::PhyMap;

pub struct PersistentPhyMap {
    persistent: PersistentMap,
    geometry: NandGeometry,
    bytes_total: u32,
    bytes_per_section: u32,
}

impl PersistentPhyMap {
    pub fn new(geometry: &NandGeometry) -> Self {
        let bytes_total = (geometry.total_blocks() + 7) / 8;
        let header_len = NandMapSectionHeader::ENCODED_LEN as u32;
        let bytes_per_section = geometry.page_data_size as u32 - header_len;
        PersistentPhyMap {
            persistent: PersistentMap::new(MapType::PhyMap, *geometry),
            geometry: *geometry,
            bytes_total,
            bytes_per_section: bytes_per_section.max(1),
        }
    }

    pub fn persistent_mut(&mut self) -> &mut PersistentMap {
        &mut self.persistent
    }

    fn bitmap_bytes(&self, phymap: &PhyMap) -> Vec<u8> {
        let mut out = vec![0u8; self.bytes_total as usize];
        for block in 0..phymap.block_count() {
            if phymap.is_block_used(BlockAddress(block)) {
                out[(block / 8) as usize] |= 1 << (block % 8);
            }
        }
        out
    }

    /// Write the current bitmap (read from `ctx.phymap`) into the map's
    /// block, consolidating sections already present there as usual.
    pub fn save(&mut self, ctx: &mut PersistentMapCtx<'_>) -> Result<(), Error> {
        let bytes = self.bitmap_bytes(ctx.phymap);
        let mut first = 0u32;
        while first < self.bytes_total {
            let count = self.bytes_per_section.min(self.bytes_total - first);
            let chunk = &bytes[first as usize..(first + count) as usize];
            self.persistent.add_section(ctx, &mut NoOverride, first, chunk, 1, count)?;
            first += count;
        }
        Ok(())
    }

    /// Force a fresh block and rewrite the whole bitmap onto it, used after
    /// recovery when the existing phy-map block is suspect.
    pub fn save_new_copy(&mut self, ctx: &mut PersistentMapCtx<'_>) -> Result<(), Error> {
        let mut candidate = BlockAddress::INVALID;
        if !ctx.allocator.allocate_block(&self.geometry, ctx.phymap, &mut candidate) {
            return Err(Error::PhyMapFull);
        }
        ctx.hal.erase_block(candidate)?;
        ctx.phymap.mark_used(candidate);
        self.persistent.set_current_block(candidate);
        self.save(ctx)
    }

    /// Locate the phy-map block, decode every section, and populate `phymap`.
    pub fn load(&mut self, ctx: &mut PersistentMapCtx<'_>, phymap: &mut PhyMap) -> Result<(), Error> {
        self.persistent.find_map_block(ctx)?;
        self.persistent.build_section_offset_table(ctx)?;

        phymap.mark_all(false);
        let page_size = ctx.hal.geometry().page_data_size;
        let header_len = NandMapSectionHeader::ENCODED_LEN;
        let mut entry = 0u32;
        while entry < self.bytes_total {
            let mut buf = vec![0u8; page_size];
            let header = self.persistent.retrieve_section(ctx, &mut NoOverride, entry, &mut buf, true)?;
            let bytes = &buf[header_len..header_len + header.entry_count as usize];
            for (i, &byte) in bytes.iter().enumerate() {
                let base = (header.first_entry as usize + i) * 8;
                for bit in 0..8 {
                    let block = base + bit;
                    if block >= phymap.block_count() as usize {
                        break;
                    }
                    if byte & (1 << bit) != 0 {
                        phymap.mark_used(BlockAddress(block as u32));
                    }
                }
            }
            entry = header.first_entry + header.entry_count;
        }
        phymap.clear_dirty();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::LinearBlockAllocator;
    use crate::fake_hal::FakeHal;

    fn geo() -> NandGeometry {
        NandGeometry {
            page_data_size: 64,
            pages_per_block: 8,
            planes_per_die: 1,
            blocks_per_chip: 48,
            chip_count: 1,
            reserved_range_good_blocks: 4,
            max_bad_block_percent: 2,
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let g = geo();
        let mut hal = FakeHal::new(g);
        let mut phymap = PhyMap::new(g.total_blocks());
        let mut alloc = LinearBlockAllocator::new(BlockAddress(0), BlockAddress(8));

        let mut map_block = BlockAddress::INVALID;
        assert!(alloc.allocate_block(&g, &phymap, &mut map_block));
        hal.erase_block(map_block).unwrap();
        phymap.mark_used(map_block);

        phymap.mark_used(BlockAddress(10));
        phymap.mark_used(BlockAddress(33));

        let mut ppm = PersistentPhyMap::new(&g);
        ppm.persistent_mut().set_current_block(map_block);
        {
            let mut ctx = PersistentMapCtx {
                hal: &mut hal,
                phymap: &mut phymap,
                allocator: &mut alloc,
                reserved_low: BlockAddress(0),
                reserved_high: BlockAddress(8),
            };
            ppm.save(&mut ctx).unwrap();
        }

        let mut loaded = PhyMap::new(g.total_blocks());
        let mut ppm2 = PersistentPhyMap::new(&g);
        let mut ctx = PersistentMapCtx {
            hal: &mut hal,
            phymap: &mut phymap,
            allocator: &mut alloc,
            reserved_low: BlockAddress(0),
            reserved_high: BlockAddress(8),
        };
        ppm2.load(&mut ctx, &mut loaded).unwrap();
        assert!(loaded.is_block_used(BlockAddress(10)));
        assert!(loaded.is_block_used(BlockAddress(33)));
        assert!(!loaded.is_block_used(BlockAddress(11)));
    }
}
