//! Virtual-to-physical block table, cached in RAM over a [`PersistentMap`]
//! (spec Sec 4.4).
//!
//! Only 1-2 sections are held decoded at a time; everything else lives on
//! the zone-map block and is paged in on demand. A 16-bit entry is used
//! below 32768 total blocks, 24-bit otherwise (little-endian, three bytes).

use alloc::vec;
use alloc::vec::Vec;

use crate::error::Error;
use crate::geometry::{BlockAddress, NandGeometry};
use crate::metadata::{MapType, NandMapSectionHeader};
use crate::persistent_map::{ConsolidateHook, NoOverride, PersistentMap, PersistentMapCtx};

const CACHE_LINES: usize = 2;

struct CacheLine {
    valid: bool,
    dirty: bool,
    timestamp: u64,
    first_entry: u32,
    entry_count: u32,
    entries: Vec<u32>,
}

impl CacheLine {
    fn empty() -> Self {
        CacheLine { valid: false, dirty: false, timestamp: 0, first_entry: 0, entry_count: 0, entries: Vec::new() }
    }
}

pub struct ZoneMapCache {
    lines: [CacheLine; CACHE_LINES],
    entries_per_section: u32,
    entry_size: u8,
    total_entries: u32,
    clock: u64,
    persistent: PersistentMap,
}

fn unallocated_sentinel(entry_size: u8) -> u32 {
    if entry_size == 2 {
        0xFFFF
    } else {
        0xFF_FFFF
    }
}

fn encode_entries(entries: &[u32], entry_size: u8) -> Vec<u8> {
    let mut out = vec![0u8; entries.len() * entry_size as usize];
    for (i, &v) in entries.iter().enumerate() {
        let raw = if v == BlockAddress::INVALID.0 { unallocated_sentinel(entry_size) } else { v };
        assert!(raw <= unallocated_sentinel(entry_size), "zone map entry does not fit the configured width");
        let bytes = raw.to_le_bytes();
        out[i * entry_size as usize..i * entry_size as usize + entry_size as usize]
            .copy_from_slice(&bytes[..entry_size as usize]);
    }
    out
}

fn decode_entries(buf: &[u8], count: u32, entry_size: u8) -> Vec<u32> {
    let mut out = Vec::with_capacity(count as usize);
    let sentinel = unallocated_sentinel(entry_size);
    for i in 0..count as usize {
        let mut raw = [0u8; 4];
        raw[..entry_size as usize].copy_from_slice(&buf[i * entry_size as usize..i * entry_size as usize + entry_size as usize]);
        let v = u32::from_le_bytes(raw);
        out.push(if v == sentinel { BlockAddress::INVALID.0 } else { v });
    }
    out
}

impl ZoneMapCache {
    pub fn new(geometry: &NandGeometry) -> Self {
        let total_entries = geometry.total_blocks();
        let entry_size: u8 = if geometry.needs_wide_zone_entries() { 3 } else { 2 };
        let header_len = NandMapSectionHeader::ENCODED_LEN;
        let entries_per_section =
            ((geometry.page_data_size - header_len) / entry_size as usize) as u32;
        ZoneMapCache {
            lines: [CacheLine::empty(), CacheLine::empty()],
            entries_per_section,
            entry_size,
            total_entries,
            clock: 0,
            persistent: PersistentMap::new(MapType::ZoneMap, *geometry),
        }
    }

    pub fn persistent_mut(&mut self) -> &mut PersistentMap {
        &mut self.persistent
    }

    fn section_of(&self, vbn: u32) -> u32 {
        (vbn / self.entries_per_section) * self.entries_per_section
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn find_line(&self, section_first: u32) -> Option<usize> {
        self.lines.iter().position(|l| l.valid && l.first_entry == section_first)
    }

    fn pick_victim(&self) -> usize {
        if let Some(i) = self.lines.iter().position(|l| !l.valid) {
            return i;
        }
        // Oldest by timestamp, ties broken by scan order.
        let mut victim = 0usize;
        for i in 1..self.lines.len() {
            if self.lines[i].timestamp < self.lines[victim].timestamp {
                victim = i;
            }
        }
        victim
    }

    fn writeback_line(&mut self, ctx: &mut PersistentMapCtx<'_>, idx: usize) -> Result<(), Error> {
        if !self.lines[idx].valid || !self.lines[idx].dirty {
            return Ok(());
        }
        let bytes = encode_entries(&self.lines[idx].entries, self.entry_size);
        let first_entry = self.lines[idx].first_entry;
        let count = self.lines[idx].entry_count;
        let entry_size = self.entry_size;
        self.persistent
            .add_section(ctx, &mut NoOverride, first_entry, &bytes, entry_size, count)?;
        self.lines[idx].dirty = false;
        Ok(())
    }

    fn ensure_line_loaded(
        &mut self,
        ctx: &mut PersistentMapCtx<'_>,
        section_first: u32,
    ) -> Result<usize, Error> {
        if let Some(idx) = self.find_line(section_first) {
            self.lines[idx].timestamp = self.tick();
            return Ok(idx);
        }
        let victim = self.pick_victim();
        self.writeback_line(ctx, victim)?;

        let count = self.entries_per_section.min(self.total_entries.saturating_sub(section_first));
        let mut buf = vec![0u8; ctx.hal.geometry().page_data_size];
        self.persistent
            .retrieve_section(ctx, &mut NoOverride, section_first, &mut buf, true)?;
        let header_len = NandMapSectionHeader::ENCODED_LEN;
        let entries = decode_entries(&buf[header_len..], count, self.entry_size);

        self.lines[victim] = CacheLine {
            valid: true,
            dirty: false,
            timestamp: self.tick(),
            first_entry: section_first,
            entry_count: count,
            entries,
        };
        Ok(victim)
    }

    pub fn get_block_info(&mut self, ctx: &mut PersistentMapCtx<'_>, vbn: u32) -> Result<BlockAddress, Error> {
        let section_first = self.section_of(vbn);
        let idx = self.ensure_line_loaded(ctx, section_first)?;
        let value = self.lines[idx].entries[(vbn - section_first) as usize];
        Ok(BlockAddress(value))
    }

    pub fn set_block_info(&mut self, ctx: &mut PersistentMapCtx<'_>, vbn: u32, pbn: BlockAddress) -> Result<(), Error> {
        assert!(
            pbn == BlockAddress::INVALID || pbn.0 <= unallocated_sentinel(self.entry_size),
            "physical block number does not fit the configured zone map entry width"
        );
        let section_first = self.section_of(vbn);
        let idx = self.ensure_line_loaded(ctx, section_first)?;
        self.lines[idx].entries[(vbn - section_first) as usize] = pbn.0;
        self.lines[idx].dirty = true;
        self.lines[idx].timestamp = self.tick();
        Ok(())
    }

    /// Flush every dirty line. Consolidating one section can, through the
    /// hook below, synchronously re-dirty another cached section, so the
    /// whole pass restarts until one clean sweep finds nothing dirty.
    pub fn flush(&mut self, ctx: &mut PersistentMapCtx<'_>) -> Result<(), Error> {
        loop {
            let mut any_dirty = false;
            for idx in 0..self.lines.len() {
                if self.lines[idx].valid && self.lines[idx].dirty {
                    any_dirty = true;
                    self.writeback_dirty_with_hook(ctx, idx)?;
                }
            }
            if !any_dirty {
                return Ok(());
            }
        }
    }

    fn writeback_dirty_with_hook(&mut self, ctx: &mut PersistentMapCtx<'_>, idx: usize) -> Result<(), Error> {
        let bytes = encode_entries(&self.lines[idx].entries, self.entry_size);
        let first_entry = self.lines[idx].first_entry;
        let count = self.lines[idx].entry_count;
        let entry_size = self.entry_size;
        self.lines[idx].dirty = false;
        let mut hook = ZoneMapConsolidateHook { lines: &self.lines, entry_size };
        self.persistent.add_section(ctx, &mut hook, first_entry, &bytes, entry_size, count)
    }

    /// Write one all-unallocated section per logical section, establishing
    /// a valid anchor at first boot or after a rebuild.
    pub fn write_empty_map(&mut self, ctx: &mut PersistentMapCtx<'_>) -> Result<(), Error> {
        let mut first = 0u32;
        while first < self.total_entries {
            let count = self.entries_per_section.min(self.total_entries - first);
            let entries = vec![BlockAddress::INVALID.0; count as usize];
            let bytes = encode_entries(&entries, self.entry_size);
            self.persistent
                .add_section(ctx, &mut NoOverride, first, &bytes, self.entry_size, count)?;
            first += count;
        }
        for line in self.lines.iter_mut() {
            *line = CacheLine::empty();
        }
        Ok(())
    }
}

/// Implements the `PersistentMap` consolidation hook: if the section being
/// relocated matches a currently-dirty cache line, hand over the in-RAM
/// bytes instead of the (now stale) on-media copy. Borrows only `lines`, so
/// the caller can still hold `&mut self.persistent` at the same time.
struct ZoneMapConsolidateHook<'a> {
    lines: &'a [CacheLine; CACHE_LINES],
    entry_size: u8,
}

impl<'a> ConsolidateHook for ZoneMapConsolidateHook<'a> {
    fn section_for_consolidate(&mut self, first_entry: u32, count: u32) -> Option<Vec<u8>> {
        for line in self.lines.iter() {
            if line.valid && line.first_entry == first_entry && line.entry_count == count {
                return Some(encode_entries(&line.entries, self.entry_size));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::LinearBlockAllocator;
    use crate::fake_hal::FakeHal;
    use crate::phymap::PhyMap;

    fn geo() -> NandGeometry {
        NandGeometry {
            page_data_size: 256,
            pages_per_block: 16,
            planes_per_die: 1,
            blocks_per_chip: 64,
            chip_count: 1,
            reserved_range_good_blocks: 4,
            max_bad_block_percent: 2,
        }
    }

    fn setup() -> (FakeHal, PhyMap, LinearBlockAllocator, ZoneMapCache) {
        let g = geo();
        let hal = FakeHal::new(g);
        let phymap = PhyMap::new(g.total_blocks());
        let alloc = LinearBlockAllocator::new(BlockAddress(0), BlockAddress(8));
        let zmc = ZoneMapCache::new(&g);
        (hal, phymap, alloc, zmc)
    }

    #[test]
    fn write_then_read_back_entry() {
        let (mut hal, mut phymap, mut alloc, mut zmc) = setup();
        let mut out = BlockAddress::INVALID;
        assert!(alloc.allocate_block(&hal.geometry(), &phymap, &mut out));
        hal.erase_block(out).unwrap();
        phymap.mark_used(out);
        zmc.persistent_mut().set_current_block(out);

        let mut ctx = PersistentMapCtx {
            hal: &mut hal,
            phymap: &mut phymap,
            allocator: &mut alloc,
            reserved_low: BlockAddress(0),
            reserved_high: BlockAddress(8),
        };
        zmc.write_empty_map(&mut ctx).unwrap();
        assert_eq!(zmc.get_block_info(&mut ctx, 5).unwrap(), BlockAddress::INVALID);
        zmc.set_block_info(&mut ctx, 5, BlockAddress(42)).unwrap();
        assert_eq!(zmc.get_block_info(&mut ctx, 5).unwrap(), BlockAddress(42));
        zmc.flush(&mut ctx).unwrap();
        assert_eq!(zmc.get_block_info(&mut ctx, 5).unwrap(), BlockAddress(42));
    }
}
