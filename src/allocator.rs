//! Free-block allocators used by the mapper (spec Sec 4.2).
//!
//! Both allocators hand out a block matching an optional plane/die/chip
//! filter from a configured `[low, high)` range; neither erases the block
//! it returns nor marks it used — the caller does both and handles erase
//! failure by marking the block bad.

use crate::geometry::{BlockAddress, NandGeometry};
use crate::phymap::PhyMap;

/// Optional filters on which block an allocation may return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Constraints {
    pub plane: Option<u8>,
    pub die: Option<u8>,
    pub chip: Option<u8>,
}

impl Constraints {
    fn matches(&self, geometry: &NandGeometry, block: BlockAddress) -> bool {
        if let Some(chip) = self.chip {
            if geometry.chip_of(block) != chip {
                return false;
            }
        }
        // A single die per chip is assumed; `die` further narrows nothing
        // beyond `chip` in that topology but is kept for HALs that expose
        // more than one die per chip select.
        if let Some(die) = self.die {
            if geometry.chip_of(block) != die {
                return false;
            }
        }
        if let Some(plane) = self.plane {
            if geometry.relative_block(block) % geometry.planes() != plane as u32 {
                return false;
            }
        }
        true
    }
}

pub trait BlockAllocator {
    fn set_constraints(&mut self, constraints: Constraints);
    fn clear_constraints(&mut self);
    fn set_range(&mut self, low: BlockAddress, high: BlockAddress);
    fn set_current_position(&mut self, pos: BlockAddress);
    /// Find and return a free block matching the current constraints,
    /// without marking it used. `false` if none exists in range.
    fn allocate_block(&mut self, geometry: &NandGeometry, phymap: &PhyMap, out: &mut BlockAddress) -> bool;
}

/// Scans forward from `current_position`, wrapping once to `range.low`.
/// Used for the reserved range, where allocation order should be stable
/// and predictable.
pub struct LinearBlockAllocator {
    range_low: BlockAddress,
    range_high: BlockAddress,
    current_position: BlockAddress,
    constraints: Constraints,
}

impl LinearBlockAllocator {
    pub fn new(range_low: BlockAddress, range_high: BlockAddress) -> Self {
        LinearBlockAllocator {
            range_low,
            range_high,
            current_position: range_low,
            constraints: Constraints::default(),
        }
    }
}

impl BlockAllocator for LinearBlockAllocator {
    fn set_constraints(&mut self, constraints: Constraints) {
        self.constraints = constraints;
    }

    fn clear_constraints(&mut self) {
        self.constraints = Constraints::default();
    }

    fn set_range(&mut self, low: BlockAddress, high: BlockAddress) {
        self.range_low = low;
        self.range_high = high;
        if self.current_position < low || self.current_position > high {
            self.current_position = low;
        }
    }

    fn set_current_position(&mut self, pos: BlockAddress) {
        self.current_position = pos;
    }

    fn allocate_block(&mut self, geometry: &NandGeometry, phymap: &PhyMap, out: &mut BlockAddress) -> bool {
        let mut pos = self.current_position;
        for _ in 0..2 {
            while pos < self.range_high {
                if !phymap.is_block_used(pos) && self.constraints.matches(geometry, pos) {
                    *out = pos;
                    self.current_position = BlockAddress(pos.0 + 1);
                    return true;
                }
                pos = BlockAddress(pos.0 + 1);
            }
            pos = self.range_low;
        }
        false
    }
}

/// xorshift64* PRNG - fast, decent quality for non-crypto use. Seeds the
/// random block allocator's start position; not cryptographically secure,
/// which is fine for wear spreading.
struct Xorshift64Star {
    state: u64,
}

impl Xorshift64Star {
    fn new(seed: u64) -> Self {
        Self { state: if seed == 0 { 0xdeadbeefcafe1234 } else { seed } }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }
}

/// Starts at a pseudo-random offset in `range` and never resets between
/// calls, spreading data-block writes across the media.
pub struct RandomBlockAllocator {
    range_low: BlockAddress,
    range_high: BlockAddress,
    current_position: BlockAddress,
    constraints: Constraints,
    rng: Xorshift64Star,
}

impl RandomBlockAllocator {
    pub fn new(range_low: BlockAddress, range_high: BlockAddress, seed: u64) -> Self {
        let mut rng = Xorshift64Star::new(seed);
        let span = (range_high.0 - range_low.0).max(1);
        let start = range_low.0 + (rng.next_u64() % span as u64) as u32;
        RandomBlockAllocator {
            range_low,
            range_high,
            current_position: BlockAddress(start),
            constraints: Constraints::default(),
            rng,
        }
    }
}

impl BlockAllocator for RandomBlockAllocator {
    fn set_constraints(&mut self, constraints: Constraints) {
        self.constraints = constraints;
    }

    fn clear_constraints(&mut self) {
        self.constraints = Constraints::default();
    }

    fn set_range(&mut self, low: BlockAddress, high: BlockAddress) {
        self.range_low = low;
        self.range_high = high;
        if self.current_position < low || self.current_position > high {
            let span = (high.0 - low.0).max(1);
            self.current_position = BlockAddress(low.0 + (self.rng.next_u64() % span as u64) as u32);
        }
    }

    fn set_current_position(&mut self, pos: BlockAddress) {
        self.current_position = pos;
    }

    fn allocate_block(&mut self, geometry: &NandGeometry, phymap: &PhyMap, out: &mut BlockAddress) -> bool {
        let mut pos = self.current_position;
        for _ in 0..2 {
            while pos < self.range_high {
                if !phymap.is_block_used(pos) && self.constraints.matches(geometry, pos) {
                    *out = pos;
                    self.current_position = BlockAddress(pos.0 + 1);
                    return true;
                }
                pos = BlockAddress(pos.0 + 1);
            }
            pos = self.range_low;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn linear_allocator_wraps() {
        let g = geo();
        let mut phymap = PhyMap::new(g.total_blocks());
        phymap.mark_all(true);
        phymap.mark_free(BlockAddress(2));
        let mut alloc = LinearBlockAllocator::new(BlockAddress(0), BlockAddress(10));
        alloc.set_current_position(BlockAddress(5));
        let mut out = BlockAddress::INVALID;
        assert!(alloc.allocate_block(&g, &phymap, &mut out));
        assert_eq!(out, BlockAddress(2));
    }

    #[test]
    fn linear_allocator_exhausted_returns_false() {
        let g = geo();
        let mut phymap = PhyMap::new(g.total_blocks());
        phymap.mark_all(true);
        let mut alloc = LinearBlockAllocator::new(BlockAddress(0), BlockAddress(10));
        let mut out = BlockAddress::INVALID;
        assert!(!alloc.allocate_block(&g, &phymap, &mut out));
    }

    #[test]
    fn random_allocator_respects_constraints() {
        let g = geo();
        let mut phymap = PhyMap::new(g.total_blocks());
        phymap.mark_all(true);
        for b in 0..20u32 {
            phymap.mark_free(BlockAddress(b));
        }
        let mut alloc = RandomBlockAllocator::new(BlockAddress(0), BlockAddress(20), 1234);
        alloc.set_constraints(Constraints { plane: Some(1), die: None, chip: None });
        let mut out = BlockAddress::INVALID;
        assert!(alloc.allocate_block(&g, &phymap, &mut out));
        assert_eq!(out.0 % g.planes(), 1);
    }
}
