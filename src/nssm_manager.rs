//! Fixed-size pool of [`NonsequentialSectorsMap`]s indexed by virtual block
//! (spec Sec 4.9).
//!
//! The source keeps a red-black tree plus an intrusive LRU list of raw
//! pointers. Both collapse here into a `BTreeMap<u32, usize>` over a `Vec`
//! arena plus a separate `VecDeque<usize>` acting as the LRU list of
//! unreferenced, valid-or-invalid slots (least-recently-used at the front) —
//! the arena/index-based design Sec 9 recommends in place of intrusive
//! nodes, since an intrusive red-black tree has no natural `Send`-safe
//! encoding without unsafe pointer arithmetic.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use crate::error::Error;
use crate::geometry::NandGeometry;
use crate::nssm::{NonsequentialSectorsMap, NssmCtx};

/// Pool size base unit: "128 pages per block" worth of NSSMs at `base_count`,
/// scaled by the actual pages-per-block so cache RAM stays roughly constant
/// across NAND generations.
const BASE_PAGES_PER_BLOCK: u32 = 128;

struct Slot {
    nssm: NonsequentialSectorsMap,
    ref_count: u32,
    in_lru: bool,
}

pub struct NssmManager {
    slots: Vec<Slot>,
    by_vbn: BTreeMap<u32, usize>,
    lru: VecDeque<usize>,
    geometry: NandGeometry,
    planes: u8,
}

impl NssmManager {
    /// Build a pool sized so that `base_count` would be appropriate for a
    /// NAND with `BASE_PAGES_PER_BLOCK` pages per block; the actual slot
    /// count scales inversely with this NAND's `pages_per_block`.
    pub fn new(geometry: NandGeometry, planes: u8, base_count: u32) -> Self {
        let scaled = ((base_count as u64 * BASE_PAGES_PER_BLOCK as u64) / geometry.pages_per_block.max(1) as u64)
            .max(1) as usize;
        let mut slots = Vec::with_capacity(scaled);
        let mut lru = VecDeque::with_capacity(scaled);
        for i in 0..scaled {
            slots.push(Slot { nssm: NonsequentialSectorsMap::new(geometry, planes), ref_count: 0, in_lru: true });
            lru.push_back(i);
        }
        NssmManager { slots, by_vbn: BTreeMap::new(), lru, geometry, planes }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Resize the pool, flushing every current NSSM first so no dirty
    /// backup is silently dropped.
    pub fn resize(&mut self, base_count: u32, ctx: &mut NssmCtx<'_>) -> Result<(), Error> {
        self.flush_all(ctx)?;
        *self = NssmManager::new(self.geometry, self.planes, base_count);
        Ok(())
    }

    fn touch_mru(&mut self, index: usize) {
        if let Some(pos) = self.lru.iter().position(|&i| i == index) {
            self.lru.remove(pos);
        }
        if self.slots[index].ref_count == 0 {
            self.lru.push_back(index);
            self.slots[index].in_lru = true;
        } else {
            self.slots[index].in_lru = false;
        }
    }

    fn evict_lru_unreferenced(&mut self) -> Option<usize> {
        let pos = self.lru.iter().position(|&i| self.slots[i].ref_count == 0)?;
        Some(self.lru.remove(pos).unwrap())
    }

    /// Find (or build, evicting the LRU-most unreferenced slot) the NSSM for
    /// `vbn`. Returns the slot index; callers release with `[release]`.
    pub fn get_map_for_virtual_block(&mut self, vbn: u32, ctx: &mut NssmCtx<'_>) -> Result<usize, Error> {
        if let Some(&index) = self.by_vbn.get(&vbn) {
            self.slots[index].ref_count += 1;
            self.touch_mru(index);
            return Ok(index);
        }

        let index = self.evict_lru_unreferenced().ok_or(Error::CantRecycleSectorMap)?;
        if self.slots[index].nssm.is_valid() {
            self.by_vbn.remove(&self.slots[index].nssm.virtual_block_number());
            if self.slots[index].nssm.has_backup() {
                self.slots[index].nssm.flush(ctx)?;
            }
        }
        self.slots[index].nssm.prepare_for_block(vbn, ctx)?;
        self.by_vbn.insert(vbn, index);
        self.slots[index].ref_count = 1;
        self.slots[index].in_lru = false;
        Ok(index)
    }

    pub fn nssm(&mut self, index: usize) -> &mut NonsequentialSectorsMap {
        &mut self.slots[index].nssm
    }

    /// Release a reference acquired by `get_map_for_virtual_block`. Once the
    /// count reaches zero the slot becomes eligible for eviction again.
    pub fn release(&mut self, index: usize) {
        debug_assert!(self.slots[index].ref_count > 0);
        self.slots[index].ref_count -= 1;
        if self.slots[index].ref_count == 0 {
            self.lru.push_back(index);
            self.slots[index].in_lru = true;
        }
    }

    /// Invalidate every NSSM and rebuild the LRU list, discarding in-RAM
    /// state without flushing — used after a whole-media erase.
    pub fn invalidate_all(&mut self) {
        self.by_vbn.clear();
        self.lru.clear();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.nssm.invalidate();
            slot.ref_count = 0;
            slot.in_lru = true;
            self.lru.push_back(i);
        }
    }

    /// Invalidate only the NSSMs whose virtual block falls in `region`
    /// (`[region_start, region_end)` in vbn space), used when one drive
    /// region is being torn down without touching the rest of the media.
    pub fn invalidate_drive(&mut self, region_start: u32, region_end: u32) {
        let victims: Vec<u32> = self
            .by_vbn
            .range(region_start..region_end)
            .map(|(&vbn, _)| vbn)
            .collect();
        for vbn in victims {
            if let Some(index) = self.by_vbn.remove(&vbn) {
                self.slots[index].nssm.invalidate();
                self.slots[index].ref_count = 0;
                if !self.slots[index].in_lru {
                    self.slots[index].in_lru = true;
                    self.lru.push_back(index);
                }
            }
        }
    }

    pub fn flush_all(&mut self, ctx: &mut NssmCtx<'_>) -> Result<(), Error> {
        for slot in self.slots.iter_mut() {
            if slot.nssm.is_valid() {
                slot.nssm.flush(ctx)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Constraints;
    use crate::fake_hal::FakeHal;
    use crate::geometry::BlockAddress;
    use crate::nssm::NoopNotifier;
    use crate::virtual_block::BlockTranslator;
    use alloc::collections::BTreeMap as Map;

    fn geo() -> NandGeometry {
        NandGeometry {
            page_data_size: 64,
            pages_per_block: 4,
            planes_per_die: 1,
            blocks_per_chip: 256,
            chip_count: 1,
            reserved_range_good_blocks: 4,
            max_bad_block_percent: 2,
        }
    }

    struct SimpleMapper {
        map: Map<u32, BlockAddress>,
        next_block: u32,
        hal: FakeHal,
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
    fn pool_scales_inversely_with_pages_per_block() {
        let mut g = geo();
        g.pages_per_block = 128;
        let mgr = NssmManager::new(g, 1, 4);
        assert_eq!(mgr.capacity(), 4);
        g.pages_per_block = 256;
        let mgr2 = NssmManager::new(g, 1, 4);
        assert_eq!(mgr2.capacity(), 2);
    }

    #[test]
    fn lookup_hit_increments_ref_and_miss_evicts_lru() {
        let g = geo();
        let mut translator = SimpleMapper { map: Map::new(), next_block: 0, hal: FakeHal::new(g) };
        let mut notifier = NoopNotifier;
        let mut mgr = NssmManager::new(g, 1, 1); // capacity 32 at 4 pages/block... large enough

        let cap = mgr.capacity();
        {
            let mut ctx = NssmCtx { translator: &mut translator, notifier: &mut notifier, hidden: false };
            let idx = mgr.get_map_for_virtual_block(1, &mut ctx).unwrap();
            assert_eq!(mgr.nssm(idx).virtual_block_number(), 1);
            mgr.release(idx);

            let idx_again = mgr.get_map_for_virtual_block(1, &mut ctx).unwrap();
            assert_eq!(idx_again, idx);
            mgr.release(idx_again);
        }
        assert!(cap >= 1);
    }
}
