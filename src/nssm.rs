//! Non-sequential sectors map: per-virtual-block write buffering with a
//! primary/backup pair of physical blocks and three merge strategies
//! (spec Sec 4.8).
//!
//! A block fills up with out-of-order rewrites faster than it empties, so
//! once the primary is full a backup absorbs further writes while a merge
//! consolidates the live data back down to one block. Which merge runs is
//! chosen by how much of the backup the primary can still absorb in place.

use alloc::vec::Vec;

use crate::allocator::Constraints;
use crate::error::Error;
use crate::geometry::{NandGeometry, PageAddress};
use crate::hal::CopyFilter;
use crate::metadata::{MetaFlags, PageMetadata};
use crate::page_order_map::PageOrderMap;
use crate::stats::MergeStats;
use crate::virtual_block::{BlockTranslator, VirtualBlock};

/// Lets the NSSM schedule a background relocation without depending on the
/// deferred-task module directly.
pub trait RelocateNotifier {
    fn request_relocate(&mut self, vbn: u32);
}

pub struct NoopNotifier;

impl RelocateNotifier for NoopNotifier {
    fn request_relocate(&mut self, _vbn: u32) {}
}

/// Borrowed collaborators one NSSM operation needs.
pub struct NssmCtx<'a> {
    pub translator: &'a mut dyn BlockTranslator,
    pub notifier: &'a mut dyn RelocateNotifier,
    pub hidden: bool,
}

struct RelabelFilter {
    lba: u32,
    lsi: u32,
    in_order: bool,
    hidden: bool,
}

impl CopyFilter for RelabelFilter {
    fn apply(
        &mut self,
        _from: PageAddress,
        _to: PageAddress,
        _data: &mut [u8],
        metadata: &mut PageMetadata,
    ) -> Result<bool, Error> {
        let mut flags = MetaFlags::empty();
        if self.in_order {
            flags |= MetaFlags::IN_LOGICAL_ORDER;
        }
        if self.hidden {
            flags |= MetaFlags::HIDDEN_BLOCK;
        }
        *metadata = PageMetadata::data(self.lba, self.lsi, flags);
        Ok(true)
    }
}

const MAX_PLANE_RETRY: u32 = 10;
const MAX_METADATA_RETRY: u32 = 2;

pub struct NonsequentialSectorsMap {
    planes: u8,
    geometry: NandGeometry,
    entry_count: u32,
    primary: VirtualBlock,
    primary_map: PageOrderMap,
    backup: Option<VirtualBlock>,
    backup_map: Option<PageOrderMap>,
    current_page_count: u32,
    stats: MergeStats,
}

impl NonsequentialSectorsMap {
    pub fn new(geometry: NandGeometry, planes: u8) -> Self {
        let entry_count = geometry.pages_per_block * planes as u32;
        NonsequentialSectorsMap {
            planes,
            geometry,
            entry_count,
            primary: VirtualBlock::new(0, planes),
            primary_map: PageOrderMap::new(entry_count),
            backup: None,
            backup_map: None,
            current_page_count: 0,
            stats: MergeStats::new(),
        }
    }

    pub fn virtual_block_number(&self) -> u32 {
        self.primary.virtual_block_number()
    }

    pub fn planes(&self) -> u8 {
        self.planes
    }

    /// Virtual pages this block holds: `planes * pages_per_block`.
    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    pub fn has_backup(&self) -> bool {
        self.backup.is_some()
    }

    pub fn stats(&self) -> MergeStats {
        self.stats
    }

    pub fn invalidate(&mut self) {
        self.primary.set_virtual_block_number(u32::MAX);
        self.primary_map.clear();
        self.backup = None;
        self.backup_map = None;
        self.current_page_count = 0;
    }

    pub fn is_valid(&self) -> bool {
        self.primary.virtual_block_number() != u32::MAX
    }

    /// Virtual offset the next call to `get_next_physical_page`/
    /// `get_next_physical_page_and_offset` will land at, absent any
    /// thrashing-prevention merge triggered by being full. Callers that need
    /// the offset actually used (to build page metadata before `add_entry`)
    /// should prefer `get_next_physical_page_and_offset`, which accounts for
    /// a merge that may run first.
    pub fn current_page_count(&self) -> u32 {
        self.current_page_count
    }

    /// True if writing logical offset `lo` to the next free virtual offset
    /// would land on the block's *last* logical page, completing a strictly
    /// sorted identity prefix through it — the on-disk `IN_LOGICAL_ORDER`
    /// flag contract. Only ever true for `lo == entry_count - 1`.
    pub fn completes_sorted_prefix_for_next_write(&self, lo: u32) -> bool {
        self.entry_count > 0
            && lo == self.current_page_count
            && lo == self.entry_count - 1
            && Self::completes_sorted_prefix(&self.primary_map, self.current_page_count)
    }

    /// Rebuild the primary page-order map by reading every occupied page's
    /// metadata, starting over for virtual block `vbn`.
    pub fn prepare_for_block(&mut self, vbn: u32, ctx: &mut NssmCtx<'_>) -> Result<(), Error> {
        self.primary = VirtualBlock::new(vbn, self.planes);
        self.primary_map.clear();
        self.backup = None;
        self.backup_map = None;
        self.current_page_count = 0;

        if self.entry_count == 0 {
            return Ok(());
        }

        if self.try_identity_fast_path(ctx)? {
            return Ok(());
        }

        let mut highest_occupied: Option<u32> = None;
        for voff in 0..self.entry_count {
            let page = self.primary.get_physical_page_for_virtual_offset(voff, &self.geometry, ctx.translator)?;
            if !page.is_valid() {
                break;
            }
            let mut meta = PageMetadata::erased();
            let mut attempts = 0;
            let status = loop {
                match ctx.translator.hal().read_metadata(page, &mut meta) {
                    Ok(status) => break Some(status),
                    Err(_) if attempts < MAX_METADATA_RETRY => {
                        attempts += 1;
                        continue;
                    }
                    Err(_) => break None,
                }
            };
            let status = match status {
                Some(s) => s,
                None => continue,
            };
            if meta.is_erased() {
                break;
            }
            if !status.is_ok_for_caller() {
                continue;
            }

            let plane = (voff % self.planes as u32) as u8;
            let candidate_vbn = meta.lba.wrapping_sub(plane as u32);
            if candidate_vbn != vbn {
                return Err(Error::LbasInconsistent);
            }
            if meta.lsi >= self.entry_count {
                return Err(Error::SectorIdxOutOfRange);
            }

            self.primary_map.set_entry(meta.lsi, voff);
            highest_occupied = Some(voff);

            if status.needs_relocate() {
                ctx.notifier.request_relocate(vbn);
            }
        }
        self.current_page_count = highest_occupied.map(|v| v + 1).unwrap_or(0);
        Ok(())
    }

    /// If the last virtual page is written and flagged in-order, the whole
    /// block is a straight-through sequential write; skip the per-page scan.
    fn try_identity_fast_path(&mut self, ctx: &mut NssmCtx<'_>) -> Result<bool, Error> {
        let last_voff = self.entry_count - 1;
        let page = self
            .primary
            .get_physical_page_for_virtual_offset(last_voff, &self.geometry, ctx.translator)?;
        if !page.is_valid() {
            return Ok(false);
        }
        let mut meta = PageMetadata::erased();
        let status = ctx.translator.hal().read_metadata(page, &mut meta)?;
        if !status.is_ok_for_caller() || meta.is_erased() {
            return Ok(false);
        }
        if !meta.flags.contains(MetaFlags::IN_LOGICAL_ORDER) {
            return Ok(false);
        }
        self.primary_map.set_sorted_order(0, self.entry_count, 0);
        self.current_page_count = self.entry_count;
        Ok(true)
    }

    /// Resolve the primary's currently-allocated physical block for `plane`,
    /// without allocating one if there isn't yet. Used to identify the block
    /// behind a plane that just reported a failed write.
    pub fn physical_block_for_plane(
        &mut self,
        plane: u8,
        translator: &mut dyn BlockTranslator,
    ) -> Result<crate::geometry::BlockAddress, Error> {
        self.primary.get_physical_block_for_plane(plane, translator)
    }

    pub fn get_physical_page_for_logical_offset(
        &mut self,
        lo: u32,
        ctx: &mut NssmCtx<'_>,
    ) -> Result<PageAddress, Error> {
        if self.primary_map.is_occupied(lo) {
            let voff = self.primary_map.get_entry(lo);
            return self.primary.get_physical_page_for_virtual_offset(voff, &self.geometry, ctx.translator);
        }
        if let Some(backup_map) = &self.backup_map {
            if backup_map.is_occupied(lo) {
                let voff = backup_map.get_entry(lo);
                let backup = self.backup.as_mut().expect("backup_map implies backup");
                return backup.get_physical_page_for_virtual_offset(voff, &self.geometry, ctx.translator);
            }
        }
        Ok(PageAddress::INVALID)
    }

    /// Resolve (allocating lazily) the physical page the next write to
    /// logical offset `lo` should land on, running `preventThrashing` first
    /// if the primary is currently full.
    pub fn get_next_physical_page(&mut self, lo: u32, ctx: &mut NssmCtx<'_>) -> Result<PageAddress, Error> {
        self.get_next_physical_page_and_offset(lo, ctx).map(|(page, _)| page)
    }

    /// As `get_next_physical_page`, also returning the virtual offset the
    /// page landed at — the caller needs it to pair with `add_entry` once
    /// the write itself succeeds, since a thrashing-prevention merge run by
    /// this call can change it out from under a caller that read it earlier.
    pub fn get_next_physical_page_and_offset(
        &mut self,
        lo: u32,
        ctx: &mut NssmCtx<'_>,
    ) -> Result<(PageAddress, u32), Error> {
        if self.current_page_count >= self.entry_count {
            self.prevent_thrashing(lo, ctx)?;
        }
        let voff = self.current_page_count;
        let plane = (voff % self.planes as u32) as u8;
        if !self.primary.get_physical_block_for_plane(plane, ctx.translator)?.is_valid() {
            self.primary.allocate_block_for_plane(plane, ctx.translator)?;
        }
        let page = self.primary.get_physical_page_for_virtual_offset(voff, &self.geometry, ctx.translator)?;
        Ok((page, voff))
    }

    pub fn add_entry(&mut self, lo: u32, voff: u32) {
        debug_assert_eq!(voff, self.current_page_count);
        self.primary_map.set_entry(lo, voff);
        self.current_page_count += 1;
    }

    fn prevent_thrashing(&mut self, excluded_lo: u32, ctx: &mut NssmCtx<'_>) -> Result<(), Error> {
        if self.backup.is_none() {
            self.promote(ctx)?;
        } else if self.primary_map.population() >= self.entry_count {
            self.short_circuit_merge(ctx)?;
        } else {
            self.merge(Some(excluded_lo), ctx)?;
            if self.current_page_count >= self.entry_count {
                self.promote(ctx)?;
            }
        }
        Ok(())
    }

    fn promote(&mut self, ctx: &mut NssmCtx<'_>) -> Result<(), Error> {
        let vbn = self.primary.virtual_block_number();
        let old_map = core::mem::replace(&mut self.primary_map, PageOrderMap::new(self.entry_count));
        let old_primary = core::mem::replace(&mut self.primary, VirtualBlock::new(vbn, self.planes));
        self.backup = Some(old_primary);
        self.backup_map = Some(old_map);
        self.current_page_count = 0;
        self.primary.allocate_all_planes(ctx.translator)?;
        Ok(())
    }

    fn short_circuit_merge(&mut self, ctx: &mut NssmCtx<'_>) -> Result<(), Error> {
        if let Some(mut backup) = self.backup.take() {
            backup.free_and_erase_all_planes(ctx.translator)?;
        }
        self.backup_map = None;
        self.stats.record_short_circuit();
        self.promote(ctx)
    }

    /// Whether this entry's write would complete a strictly sorted identity
    /// prefix in `map` through `upto` (exclusive).
    fn completes_sorted_prefix(map: &PageOrderMap, upto: u32) -> bool {
        map.is_in_sorted_order(upto)
    }

    fn merge(&mut self, excluded_lo: Option<u32>, ctx: &mut NssmCtx<'_>) -> Result<(), Error> {
        let backup_map = match &self.backup_map {
            Some(m) => m,
            None => return Ok(()),
        };
        let mut unique_in_backup = backup_map.count_entries_not_in_other(&self.primary_map);
        if let Some(excl) = excluded_lo {
            if backup_map.is_occupied(excl) && !self.primary_map.is_occupied(excl) {
                unique_in_backup = unique_in_backup.saturating_sub(1);
            }
        }
        let free_room = self.entry_count - self.current_page_count;
        if unique_in_backup <= free_room {
            if self.quick_merge(excluded_lo, ctx)? {
                return Ok(());
            }
            // Quick merge aborted on a write failure; fall through to core merge.
        }
        self.core_merge(excluded_lo, ctx)
    }

    /// Returns `Ok(true)` on success, `Ok(false)` if a copy write failed and
    /// the caller should fall back to a core merge.
    fn quick_merge(&mut self, excluded_lo: Option<u32>, ctx: &mut NssmCtx<'_>) -> Result<bool, Error> {
        let vbn = self.primary.virtual_block_number();
        let candidates: Vec<u32> = {
            let backup_map = self.backup_map.as_ref().unwrap();
            (0..self.entry_count)
                .filter(|&lo| Some(lo) != excluded_lo)
                .filter(|&lo| backup_map.is_occupied(lo) && !self.primary_map.is_occupied(lo))
                .collect()
        };

        for lo in candidates {
            let voff = self.current_page_count;
            let plane = (voff % self.planes as u32) as u8;
            if !self.primary.get_physical_block_for_plane(plane, ctx.translator)?.is_valid() {
                self.primary.allocate_block_for_plane(plane, ctx.translator)?;
            }
            let dst_page = self.primary.get_physical_page_for_virtual_offset(voff, &self.geometry, ctx.translator)?;
            let src_voff = self.backup_map.as_ref().unwrap().get_entry(lo);
            let src_page = self
                .backup
                .as_mut()
                .unwrap()
                .get_physical_page_for_virtual_offset(src_voff, &self.geometry, ctx.translator)?;

            let in_order = lo == voff
                && lo == self.entry_count - 1
                && Self::completes_sorted_prefix(&self.primary_map, voff);
            let mut filter = RelabelFilter { lba: vbn + plane as u32, lsi: lo, in_order, hidden: ctx.hidden };
            let copied = ctx.translator.hal().copy_pages(src_page, dst_page, 1, &mut filter)?;
            if copied == 0 {
                return Ok(false);
            }
            self.add_entry(lo, voff);
        }

        if let Some(mut backup) = self.backup.take() {
            backup.free_and_erase_all_planes(ctx.translator)?;
        }
        self.backup_map = None;
        self.stats.record_quick();
        Ok(true)
    }

    fn core_merge(&mut self, excluded_lo: Option<u32>, ctx: &mut NssmCtx<'_>) -> Result<(), Error> {
        let vbn = self.primary.virtual_block_number();
        let mut target = VirtualBlock::new(vbn, self.planes);
        target.allocate_all_planes(ctx.translator)?;
        let mut target_map = PageOrderMap::new(self.entry_count);
        let mut target_voff = 0u32;
        let mut retry_budget = MAX_PLANE_RETRY;

        let mut lo = 0u32;
        loop {
            if lo >= self.entry_count {
                break;
            }
            if Some(lo) == excluded_lo {
                lo += 1;
                continue;
            }
            let from_primary = self.primary_map.is_occupied(lo);
            let from_backup = !from_primary && self.backup_map.as_ref().map_or(false, |m| m.is_occupied(lo));
            if !from_primary && !from_backup {
                lo += 1;
                continue;
            }

            let plane = (target_voff % self.planes as u32) as u8;
            let dst_page = target.get_physical_page_for_virtual_offset(target_voff, &self.geometry, ctx.translator)?;
            let src_page = if from_primary {
                let src_voff = self.primary_map.get_entry(lo);
                self.primary.get_physical_page_for_virtual_offset(src_voff, &self.geometry, ctx.translator)?
            } else {
                let src_voff = self.backup_map.as_ref().unwrap().get_entry(lo);
                self.backup.as_mut().unwrap().get_physical_page_for_virtual_offset(src_voff, &self.geometry, ctx.translator)?
            };

            let in_order = lo == target_voff
                && lo == self.entry_count - 1
                && Self::completes_sorted_prefix(&target_map, target_voff);
            let mut filter = RelabelFilter { lba: vbn + plane as u32, lsi: lo, in_order, hidden: ctx.hidden };
            let copied = ctx.translator.hal().copy_pages(src_page, dst_page, 1, &mut filter)?;
            if copied == 1 {
                target_map.set_entry(lo, target_voff);
                target_voff += 1;
                lo += 1;
                continue;
            }

            // This plane just went bad: report it, erase the surviving
            // target planes in place (same physical blocks, reset write
            // cursor), reallocate only the failed plane, and restart.
            if retry_budget == 0 {
                return Err(Error::WriteFailed);
            }
            retry_budget -= 1;
            let failed_pbn = target.get_physical_block_for_plane(plane, ctx.translator)?;
            ctx.translator.handle_new_bad_block(failed_pbn)?;
            target.free_and_erase_plane(plane, ctx.translator)?;
            for p in 0..self.planes {
                if p != plane {
                    let pbn = target.get_physical_block_for_plane(p, ctx.translator)?;
                    if pbn.is_valid() {
                        ctx.translator.hal().erase_block(pbn)?;
                    }
                }
            }
            target.allocate_block_for_plane(plane, ctx.translator)?;
            target_map.clear();
            target_voff = 0;
            lo = 0;
        }

        let mut old_primary = core::mem::replace(&mut self.primary, target);
        old_primary.free_and_erase_all_planes(ctx.translator)?;
        if let Some(mut backup) = self.backup.take() {
            backup.free_and_erase_all_planes(ctx.translator)?;
        }
        self.backup_map = None;
        self.primary_map = target_map;
        self.current_page_count = target_voff;
        self.stats.record_core();
        Ok(())
    }

    /// Core-merge into a new block excluding `excluded_lo`, then report the
    /// failed block to the mapper so it's flagged bad before anything else
    /// tries to allocate it.
    pub fn recover_from_failed_write(
        &mut self,
        failed_voff: u32,
        excluded_lo: u32,
        ctx: &mut NssmCtx<'_>,
    ) -> Result<(), Error> {
        let plane = (failed_voff % self.planes as u32) as u8;
        let failed_pbn = self.primary.get_physical_block_for_plane(plane, ctx.translator)?;
        if failed_pbn.is_valid() {
            ctx.translator.handle_new_bad_block(failed_pbn)?;
        }
        self.core_merge(Some(excluded_lo), ctx)
    }

    /// Used by the ECC-refresh deferred task: relocate the whole block with
    /// no sector excluded.
    pub fn relocate_virtual_block(&mut self, ctx: &mut NssmCtx<'_>) -> Result<(), Error> {
        self.core_merge(None, ctx)
    }

    pub fn flush(&mut self, ctx: &mut NssmCtx<'_>) -> Result<(), Error> {
        if self.backup.is_some() {
            self.merge(None, ctx)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::LinearBlockAllocator;
    use crate::fake_hal::FakeHal;
    use crate::geometry::BlockAddress;
    use alloc::collections::BTreeMap;

    fn geo() -> NandGeometry {
        NandGeometry {
            page_data_size: 64,
            pages_per_block: 4,
            planes_per_die: 1,
            blocks_per_chip: 64,
            chip_count: 1,
            reserved_range_good_blocks: 4,
            max_bad_block_percent: 2,
        }
    }

    struct SimpleMapper {
        map: BTreeMap<u32, BlockAddress>,
        next_block: u32,
        hal: FakeHal,
    }

    impl SimpleMapper {
        fn new(start: u32, hal: FakeHal) -> Self {
            SimpleMapper { map: BTreeMap::new(), next_block: start, hal }
        }
    }

    impl BlockTranslator for SimpleMapper {
        fn get_block_info(&mut self, vbn: u32) -> Result<BlockAddress, Error> {
            Ok(*self.map.get(&vbn).unwrap_or(&BlockAddress::INVALID))
        }

        fn set_block_info(&mut self, vbn: u32, pbn: BlockAddress) -> Result<(), Error> {
            self.map.insert(vbn, pbn);
            Ok(())
        }

        fn get_block_and_assign(&mut self, vbn: u32, _c: Constraints) -> Result<BlockAddress, Error> {
            let pbn = BlockAddress(self.next_block);
            self.next_block += 1;
            self.map.insert(vbn, pbn);
            Ok(pbn)
        }

        fn free_block(&mut self, vbn: u32, _pbn: BlockAddress) -> Result<(), Error> {
            self.map.remove(&vbn);
            Ok(())
        }

        fn handle_new_bad_block(&mut self, _pbn: BlockAddress) -> Result<(), Error> {
            Ok(())
        }

        fn hal(&mut self) -> &mut dyn crate::hal::NandHal {
            &mut self.hal
        }
    }

    #[test]
    fn write_then_read_back_through_primary() {
        let g = geo();
        let mut translator = SimpleMapper::new(0, FakeHal::new(g));
        let mut notifier = NoopNotifier;
        let mut nssm = NonsequentialSectorsMap::new(g, 1);

        {
            let mut ctx = NssmCtx { translator: &mut translator, notifier: &mut notifier, hidden: false };
            nssm.prepare_for_block(3, &mut ctx).unwrap();
            for lo in 0..4u32 {
                let page = nssm.get_next_physical_page(lo, &mut ctx).unwrap();
                let mut meta = PageMetadata::data(3, lo, MetaFlags::empty());
                if lo == 3 {
                    meta.flags |= MetaFlags::IN_LOGICAL_ORDER;
                }
                ctx.translator.hal().write_page(page, &alloc::vec![0xAAu8; g.page_data_size], &meta).unwrap();
                nssm.add_entry(lo, lo);
            }
        }

        let mut ctx = NssmCtx { translator: &mut translator, notifier: &mut notifier, hidden: false };
        let page = nssm.get_physical_page_for_logical_offset(2, &mut ctx).unwrap();
        assert!(page.is_valid());
    }

    #[test]
    fn promote_then_rebuild_sees_identity_fast_path() {
        let g = geo();
        let mut translator = SimpleMapper::new(0, FakeHal::new(g));
        let mut notifier = NoopNotifier;
        let mut nssm = NonsequentialSectorsMap::new(g, 1);

        {
            let mut ctx = NssmCtx { translator: &mut translator, notifier: &mut notifier, hidden: false };
            nssm.prepare_for_block(7, &mut ctx).unwrap();
            for lo in 0..4u32 {
                let page = nssm.get_next_physical_page(lo, &mut ctx).unwrap();
                let mut flags = MetaFlags::empty();
                if lo == 3 {
                    flags |= MetaFlags::IN_LOGICAL_ORDER;
                }
                let meta = PageMetadata::data(7, lo, flags);
                ctx.translator.hal().write_page(page, &alloc::vec![0x55u8; g.page_data_size], &meta).unwrap();
                nssm.add_entry(lo, lo);
            }
        }

        let mut ctx = NssmCtx { translator: &mut translator, notifier: &mut notifier, hidden: false };
        nssm.prepare_for_block(7, &mut ctx).unwrap();
        assert_eq!(nssm.current_page_count, 4);
        for lo in 0..4u32 {
            assert!(nssm.primary_map.is_occupied(lo));
            assert_eq!(nssm.primary_map.get_entry(lo), lo);
        }
    }
}
