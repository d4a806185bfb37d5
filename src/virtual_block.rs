//! *N*-plane virtual block addressing (spec Sec 4.7).
//!
//! A virtual block is a container of `P x Q` virtual pages, `P` the plane
//! count (1 or 2) and `Q` physical pages per block. Plane `p` of virtual
//! block `v` lives at mapper key `v + p`; physical-block resolution for
//! each plane is lazy and cached, with the mapper as the source of truth.

use alloc::vec;
use alloc::vec::Vec;

use crate::allocator::Constraints;
use crate::error::Error;
use crate::geometry::{BlockAddress, NandGeometry, PageAddress};
use crate::hal::NandHal;

/// What [`VirtualBlock`] needs from the mapper. Kept as a trait so this
/// module doesn't depend on `mapper`'s internals, only its contract.
///
/// Also the sole route to the HAL for anything built on top of a
/// translator (see [`crate::nssm::NssmCtx`]): a real translator's block
/// operations need the HAL too, so rather than have callers hold a second,
/// aliasing `&mut dyn NandHal` alongside the translator, `hal()` hands out
/// reborrows of the one the translator already owns.
pub trait BlockTranslator {
    fn get_block_info(&mut self, vbn: u32) -> Result<BlockAddress, Error>;
    fn set_block_info(&mut self, vbn: u32, pbn: BlockAddress) -> Result<(), Error>;
    fn get_block_and_assign(&mut self, vbn: u32, constraints: Constraints) -> Result<BlockAddress, Error>;
    /// Erase and free `pbn`, clearing the zone-map entry for `vbn`.
    fn free_block(&mut self, vbn: u32, pbn: BlockAddress) -> Result<(), Error>;
    /// Mark `pbn` used-and-bad without touching any zone-map entry that
    /// currently points at it; the caller is expected to reassign that entry.
    fn handle_new_bad_block(&mut self, pbn: BlockAddress) -> Result<(), Error>;
    fn hal(&mut self) -> &mut dyn NandHal;
}

pub struct VirtualBlock {
    vbn: u32,
    planes: u8,
    cached: Vec<BlockAddress>,
}

impl VirtualBlock {
    pub fn new(vbn: u32, planes: u8) -> Self {
        VirtualBlock {
            vbn,
            planes,
            cached: vec![BlockAddress::INVALID; planes as usize],
        }
    }

    pub fn virtual_block_number(&self) -> u32 {
        self.vbn
    }

    pub fn set_virtual_block_number(&mut self, vbn: u32) {
        self.vbn = vbn;
        self.invalidate_cache();
    }

    fn invalidate_cache(&mut self) {
        for c in self.cached.iter_mut() {
            *c = BlockAddress::INVALID;
        }
    }

    fn mapper_key(&self, plane: u8) -> u32 {
        self.vbn + plane as u32
    }

    pub fn allocate_all_planes(&mut self, translator: &mut dyn BlockTranslator) -> Result<(), Error> {
        for plane in 0..self.planes {
            self.allocate_block_for_plane(plane, translator)?;
        }
        Ok(())
    }

    pub fn allocate_block_for_plane(
        &mut self,
        plane: u8,
        translator: &mut dyn BlockTranslator,
    ) -> Result<BlockAddress, Error> {
        let constraints = Constraints { plane: Some(plane), die: None, chip: None };
        let pbn = translator.get_block_and_assign(self.mapper_key(plane), constraints)?;
        self.cached[plane as usize] = pbn;
        Ok(pbn)
    }

    /// Cache-first resolution; consults the mapper only on a cache miss.
    pub fn get_physical_block_for_plane(
        &mut self,
        plane: u8,
        translator: &mut dyn BlockTranslator,
    ) -> Result<BlockAddress, Error> {
        if self.cached[plane as usize].is_valid() {
            return Ok(self.cached[plane as usize]);
        }
        let pbn = translator.get_block_info(self.mapper_key(plane))?;
        self.cached[plane as usize] = pbn;
        Ok(pbn)
    }

    pub fn get_physical_page_for_virtual_offset(
        &mut self,
        voff: u32,
        geometry: &NandGeometry,
        translator: &mut dyn BlockTranslator,
    ) -> Result<PageAddress, Error> {
        let planes = geometry.planes();
        let plane = (voff % planes) as u8;
        let page_in_block = voff / planes;
        let pbn = self.get_physical_block_for_plane(plane, translator)?;
        if !pbn.is_valid() {
            return Ok(PageAddress::INVALID);
        }
        Ok(geometry.make_page(pbn, page_in_block))
    }

    pub fn free_and_erase_all_planes(&mut self, translator: &mut dyn BlockTranslator) -> Result<(), Error> {
        for plane in 0..self.planes {
            self.free_and_erase_plane(plane, translator)?;
        }
        Ok(())
    }

    /// Free just one plane's block, leaving the others cached as-is. Used by
    /// the core merge's per-plane retry path.
    pub fn free_and_erase_plane(&mut self, plane: u8, translator: &mut dyn BlockTranslator) -> Result<(), Error> {
        let pbn = self.cached[plane as usize];
        if pbn.is_valid() {
            translator.free_block(self.mapper_key(plane), pbn)?;
            self.cached[plane as usize] = BlockAddress::INVALID;
        }
        Ok(())
    }

    pub fn is_fully_allocated(&self) -> bool {
        self.cached.iter().all(|b| b.is_valid())
    }

    pub fn is_fully_unallocated(&self) -> bool {
        self.cached.iter().all(|b| !b.is_valid())
    }

    /// True if every allocated plane resolves to the same chip select —
    /// a prerequisite for issuing a combined multi-plane HAL command.
    pub fn is_fully_allocated_on_one_nand(&self, geometry: &NandGeometry) -> bool {
        if !self.is_fully_allocated() {
            return false;
        }
        let first_chip = geometry.chip_of(self.cached[0]);
        self.cached.iter().all(|b| geometry.chip_of(*b) == first_chip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_hal::FakeHal;
    use alloc::collections::BTreeMap;

    struct FakeTranslator {
        map: BTreeMap<u32, BlockAddress>,
        next_block: u32,
        hal: FakeHal,
    }

    impl FakeTranslator {
        fn new(hal: FakeHal) -> Self {
            FakeTranslator { map: BTreeMap::new(), next_block: 0, hal }
        }
    }

    impl BlockTranslator for FakeTranslator {
        fn get_block_info(&mut self, vbn: u32) -> Result<BlockAddress, Error> {
            Ok(*self.map.get(&vbn).unwrap_or(&BlockAddress::INVALID))
        }

        fn set_block_info(&mut self, vbn: u32, pbn: BlockAddress) -> Result<(), Error> {
            self.map.insert(vbn, pbn);
            Ok(())
        }

        fn get_block_and_assign(&mut self, vbn: u32, _constraints: Constraints) -> Result<BlockAddress, Error> {
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

        fn hal(&mut self) -> &mut dyn NandHal {
            &mut self.hal
        }
    }

    fn geo() -> NandGeometry {
        NandGeometry {
            page_data_size: 2048,
            pages_per_block: 256,
            planes_per_die: 2,
            blocks_per_chip: 4096,
            chip_count: 1,
            reserved_range_good_blocks: 12,
            max_bad_block_percent: 2,
        }
    }

    #[test]
    fn allocate_and_resolve_planes() {
        let g = geo();
        let mut t = FakeTranslator::new(FakeHal::new(g));
        let mut vb = VirtualBlock::new(10, 2);
        assert!(vb.is_fully_unallocated());
        vb.allocate_all_planes(&mut t).unwrap();
        assert!(vb.is_fully_allocated());
        let page = vb.get_physical_page_for_virtual_offset(3, &g, &mut t).unwrap();
        assert_eq!(g.page_offset_in_block(page), 1);
    }

    #[test]
    fn free_invalidates_cache() {
        let mut t = FakeTranslator::new(FakeHal::new(geo()));
        let mut vb = VirtualBlock::new(0, 2);
        vb.allocate_all_planes(&mut t).unwrap();
        vb.free_and_erase_all_planes(&mut t).unwrap();
        assert!(vb.is_fully_unallocated());
    }
}
