//! On-media page metadata and persistent-map section headers.
//!
//! Metadata accompanies every page and is what lets a scan reconstruct the
//! zone map from scratch: its `signature` discriminates data pages from
//! zone-map and phy-map pages, and (for data pages) `lba`/`lsi` locate the
//! page within the logical address space.

use bitflags::bitflags;

/// Discriminates what a page holds, stored as the page metadata's signature word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    Data,
    ZoneMap,
    PhyMap,
    /// Page metadata reads as all-0xFF: never written.
    Erased,
    /// Bytes present but none of the above — corrupt or foreign.
    Unknown,
}

impl Signature {
    pub const DATA_TAG: u32 = 0x4154_4144; // "DATA"
    pub const ZONE_MAP_TAG: u32 = 0x3150_4142; // "LBA_STRING_PAGE1" folded to 4 bytes: 'BAP1'
    pub const PHY_MAP_TAG: u32 = 0x3150_4850; // "PHYS_STRING_PAGE1" folded: 'PHP1'
    pub const ERASED_TAG: u32 = 0xFFFF_FFFF;

    pub fn from_tag(tag: u32) -> Self {
        match tag {
            Self::DATA_TAG => Signature::Data,
            Self::ZONE_MAP_TAG => Signature::ZoneMap,
            Self::PHY_MAP_TAG => Signature::PhyMap,
            Self::ERASED_TAG => Signature::Erased,
            _ => Signature::Unknown,
        }
    }

    pub fn tag(self) -> u32 {
        match self {
            Signature::Data => Self::DATA_TAG,
            Signature::ZoneMap => Self::ZONE_MAP_TAG,
            Signature::PhyMap => Self::PHY_MAP_TAG,
            Signature::Erased => Self::ERASED_TAG,
            Signature::Unknown => 0,
        }
    }
}

bitflags! {
    /// Data-page metadata flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MetaFlags: u8 {
        /// Set on the last page of a block whose occupied logical pages are
        /// laid out in identity order through page `Q - 1`.
        const IN_LOGICAL_ORDER = 0b0000_0001;
        /// Block belongs to a hidden (system-invisible) drive.
        const HIDDEN_BLOCK     = 0b0000_0010;
    }
}

/// Metadata attached to one physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMetadata {
    pub signature: Signature,
    /// For data pages: the mapper key (virtual-block + plane) this page belongs to.
    pub lba: u32,
    /// For data pages: the logical sector index within the virtual block.
    pub lsi: u32,
    pub flags: MetaFlags,
}

impl PageMetadata {
    pub fn erased() -> Self {
        PageMetadata {
            signature: Signature::Erased,
            lba: u32::MAX,
            lsi: u32::MAX,
            flags: MetaFlags::empty(),
        }
    }

    pub fn data(lba: u32, lsi: u32, flags: MetaFlags) -> Self {
        PageMetadata {
            signature: Signature::Data,
            lba,
            lsi,
            flags,
        }
    }

    pub fn is_erased(&self) -> bool {
        matches!(self.signature, Signature::Erased)
    }
}

/// Which persistent map a [`NandMapSectionHeader`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapType {
    ZoneMap,
    PhyMap,
}

impl MapType {
    pub fn signature(self) -> Signature {
        match self {
            MapType::ZoneMap => Signature::ZoneMap,
            MapType::PhyMap => Signature::PhyMap,
        }
    }
}

/// On-media header at the start of every persistent-map section (page).
///
/// Followed in the page payload by `entry_count * entry_size` raw bytes of
/// map entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NandMapSectionHeader {
    pub map_type: MapType,
    pub entry_size: u8,
    pub first_entry: u32,
    pub entry_count: u32,
    pub version: u32,
}

impl NandMapSectionHeader {
    pub const ENCODED_LEN: usize = 1 + 4 + 4 + 4 + 1;

    pub fn encode(&self, out: &mut [u8]) {
        assert!(out.len() >= Self::ENCODED_LEN);
        out[0] = match self.map_type {
            MapType::ZoneMap => 0,
            MapType::PhyMap => 1,
        };
        out[1..5].copy_from_slice(&self.first_entry.to_le_bytes());
        out[5..9].copy_from_slice(&self.entry_count.to_le_bytes());
        out[9..13].copy_from_slice(&self.version.to_le_bytes());
        out[13] = self.entry_size;
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return None;
        }
        let map_type = match buf[0] {
            0 => MapType::ZoneMap,
            1 => MapType::PhyMap,
            _ => return None,
        };
        let first_entry = u32::from_le_bytes(buf[1..5].try_into().unwrap());
        let entry_count = u32::from_le_bytes(buf[5..9].try_into().unwrap());
        let version = u32::from_le_bytes(buf[9..13].try_into().unwrap());
        let entry_size = buf[13];
        Some(NandMapSectionHeader {
            map_type,
            entry_size,
            first_entry,
            entry_count,
            version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_header_round_trips() {
        let h = NandMapSectionHeader {
            map_type: MapType::ZoneMap,
            entry_size: 2,
            first_entry: 128,
            entry_count: 64,
            version: 7,
        };
        let mut buf = [0u8; NandMapSectionHeader::ENCODED_LEN];
        h.encode(&mut buf);
        assert_eq!(NandMapSectionHeader::decode(&buf), Some(h));
    }

    #[test]
    fn signature_tag_round_trips() {
        for sig in [Signature::Data, Signature::ZoneMap, Signature::PhyMap, Signature::Erased] {
            assert_eq!(Signature::from_tag(sig.tag()), sig);
        }
    }
}
