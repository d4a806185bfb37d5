//! NAND geometry and the absolute block/page address types.
//!
//! Addresses are monotone across chip selects: chip `c`'s blocks occupy
//! `[c * blocks_per_chip, (c + 1) * blocks_per_chip)`. Everything here is
//! pure arithmetic derived from values the HAL reports at [`Media::init`]
//! time; nothing is persisted.
//!
//! [`Media::init`]: crate::media::Media::init

/// Absolute block number, monotone across chip selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockAddress(pub u32);

/// Absolute page number, monotone across chip selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageAddress(pub u32);

impl BlockAddress {
    /// Sentinel for "no physical block allocated".
    pub const INVALID: BlockAddress = BlockAddress(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn offset(self, delta: u32) -> BlockAddress {
        BlockAddress(self.0 + delta)
    }
}

impl PageAddress {
    pub const INVALID: PageAddress = PageAddress(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl Default for BlockAddress {
    fn default() -> Self {
        Self::INVALID
    }
}

impl Default for PageAddress {
    fn default() -> Self {
        Self::INVALID
    }
}

/// NAND parameters fixed at `Media::init` from HAL queries. Everything
/// downstream (reserved-range sizing, virtual block arithmetic, map entry
/// width) derives from these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NandGeometry {
    /// Bytes of user data per page (excludes the out-of-band metadata area).
    pub page_data_size: usize,
    /// Physical pages per block; this is also `Q`, virtual pages per plane.
    pub pages_per_block: u32,
    /// Plane count per die, 1 or 2. This is `N` in the virtual-block address
    /// arithmetic (Sec 4.7).
    pub planes_per_die: u8,
    /// Physical blocks per chip select.
    pub blocks_per_chip: u32,
    /// Number of chip selects in the system.
    pub chip_count: u8,
    /// Number of good blocks the reserved range must contain (`R`, nominally 12).
    pub reserved_range_good_blocks: u32,
    /// Manufacturer ceiling on bad blocks, used only for sizing sanity checks.
    pub max_bad_block_percent: u8,
}

impl NandGeometry {
    pub fn total_blocks(&self) -> u32 {
        self.blocks_per_chip * self.chip_count as u32
    }

    pub fn planes(&self) -> u32 {
        self.planes_per_die as u32
    }

    /// Virtual pages held by one virtual block: `P * Q`.
    pub fn virtual_pages_per_block(&self) -> u32 {
        self.planes() * self.pages_per_block
    }

    pub fn chip_of(&self, b: BlockAddress) -> u8 {
        (b.0 / self.blocks_per_chip) as u8
    }

    /// Block-relative-to-its-chip index. Invariant: `relative == absolute - chip.base`.
    pub fn relative_block(&self, b: BlockAddress) -> u32 {
        b.0 % self.blocks_per_chip
    }

    pub fn chip_base(&self, chip: u8) -> BlockAddress {
        BlockAddress(chip as u32 * self.blocks_per_chip)
    }

    pub fn block_of_page(&self, p: PageAddress) -> BlockAddress {
        BlockAddress(p.0 / self.pages_per_block)
    }

    pub fn page_offset_in_block(&self, p: PageAddress) -> u32 {
        p.0 % self.pages_per_block
    }

    pub fn make_page(&self, block: BlockAddress, offset_in_block: u32) -> PageAddress {
        debug_assert!(offset_in_block < self.pages_per_block);
        PageAddress(block.0 * self.pages_per_block + offset_in_block)
    }

    /// True if `total_blocks()` needs a 24-bit zone-map entry rather than 16.
    pub fn needs_wide_zone_entries(&self) -> bool {
        self.total_blocks() >= 32768
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
            chip_count: 2,
            reserved_range_good_blocks: 12,
            max_bad_block_percent: 2,
        }
    }

    #[test]
    fn chip_arithmetic_round_trips() {
        let g = geo();
        let b = BlockAddress(4096 + 17);
        assert_eq!(g.chip_of(b), 1);
        assert_eq!(g.relative_block(b), 17);
        assert_eq!(g.chip_base(1).offset(g.relative_block(b)), b);
    }

    #[test]
    fn page_arithmetic_round_trips() {
        let g = geo();
        let p = g.make_page(BlockAddress(9), 3);
        assert_eq!(g.block_of_page(p), BlockAddress(9));
        assert_eq!(g.page_offset_in_block(p), 3);
    }

    #[test]
    fn invalid_sentinels() {
        assert!(!BlockAddress::INVALID.is_valid());
        assert!(!PageAddress::default().is_valid());
    }

    #[test]
    fn wide_entries_threshold() {
        let mut g = geo();
        g.blocks_per_chip = 16000;
        g.chip_count = 1;
        assert!(!g.needs_wide_zone_entries());
        g.chip_count = 3;
        assert!(g.needs_wide_zone_entries());
    }
}
