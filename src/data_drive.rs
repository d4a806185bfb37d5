//! Thin per-sector facade over a shared [`Media`] (spec Sec 4.11).
//!
//! A `DataDrive` is a logical drive carved out of one contiguous range of a
//! `Media`'s virtual-block space — `base_vbn..base_vbn + vbn_count` — the
//! "region" spec Sec 4.2/4.9 refers to. Several `DataDrive`s can share one
//! `Media` behind the same `spin::Mutex`, matching the "NAND driver lock"
//! described in Sec 5: every call here locks it for its entire duration.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::Error;
use crate::geometry::NandGeometry;
use crate::hal::{PlaneReadOp, PlaneWriteOp};
use crate::media::{BufferingNotifier, Media};
use crate::metadata::{MetaFlags, PageMetadata};
use crate::nssm::{NonsequentialSectorsMap, NssmCtx, RelocateNotifier};
use crate::virtual_block::BlockTranslator;

/// Drive-info selectors the facade exposes (spec Sec 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveInfo {
    SizeInSectors,
    NativeSectorSize,
    NssmCount,
    OptimalTransferSectorCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveInfoValue {
    SizeInSectors(u64),
    NativeSectorSize(u32),
    NssmCount(u32),
    OptimalTransferSectorCount(u32),
}

pub struct DataDrive {
    media: Arc<Mutex<Media>>,
    base_vbn: u32,
    vbn_count: u32,
    hidden: bool,
    /// Counting semaphore of one, serializing multi-sector transactions on
    /// this drive (spec Sec 5). A second caller opening a transaction while
    /// one is live blocks on this, not on the driver lock.
    transaction_lock: Mutex<()>,
}

impl DataDrive {
    pub fn new(media: Arc<Mutex<Media>>, base_vbn: u32, vbn_count: u32, hidden: bool) -> Self {
        DataDrive { media, base_vbn, vbn_count, hidden, transaction_lock: Mutex::new(()) }
    }

    fn geometry(&self) -> NandGeometry {
        self.media.lock().geometry()
    }

    /// Map a logical sector to (virtual block, logical offset within it).
    ///
    /// Successive virtual blocks are spaced `planes` mapper keys apart —
    /// block `n`'s planes occupy keys `[base_vbn + n*planes, base_vbn +
    /// (n+1)*planes)` — since `VirtualBlock::mapper_key` is `vbn + plane`
    /// and blocks must not share a key with their neighbour.
    fn locate(&self, sector: u64) -> Result<(u32, u32), Error> {
        let g = self.geometry();
        let vpp = g.virtual_pages_per_block() as u64;
        if sector >= self.vbn_count as u64 * vpp {
            return Err(Error::SectorOutOfBounds);
        }
        let block_index = (sector / vpp) as u32;
        let vbn = self.base_vbn + block_index * g.planes();
        let lo = (sector % vpp) as u32;
        Ok((vbn, lo))
    }

    pub fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<(), Error> {
        let (vbn, lo) = self.locate(sector)?;
        let result = self.media.lock().read_sector(vbn, lo, buf, self.hidden);
        if let Err(e) = &result {
            log::error!("data_drive: read sector {sector} (vbn {vbn} lo {lo}) failed: {e}");
        }
        result
    }

    pub fn write_sector(&self, sector: u64, buf: &[u8]) -> Result<(), Error> {
        let (vbn, lo) = self.locate(sector)?;
        let result = self.media.lock().write_sector(vbn, lo, buf, self.hidden);
        if let Err(e) = &result {
            log::error!("data_drive: write sector {sector} (vbn {vbn} lo {lo}) failed: {e}");
        }
        result
    }

    pub fn get_info(&self, selector: DriveInfo) -> DriveInfoValue {
        let media = self.media.lock();
        let g = media.geometry();
        match selector {
            DriveInfo::SizeInSectors => {
                DriveInfoValue::SizeInSectors(self.vbn_count as u64 * g.virtual_pages_per_block() as u64)
            }
            DriveInfo::NativeSectorSize => DriveInfoValue::NativeSectorSize(g.page_data_size as u32),
            DriveInfo::NssmCount => DriveInfoValue::NssmCount(media.nssm_capacity() as u32),
            DriveInfo::OptimalTransferSectorCount => DriveInfoValue::OptimalTransferSectorCount(g.planes()),
        }
    }

    pub fn set_nssm_count(&self, base_count: u32) -> Result<(), Error> {
        self.media.lock().resize_nssm_pool(base_count)
    }

    /// Multi-sector transaction (spec Sec 4.11). Live only when `bufs.len()`
    /// equals the plane count, the whole range fits inside one virtual
    /// block, and that block's NSSM has room for the write — otherwise falls
    /// back to issuing every sector individually through `read_sector`/
    /// `write_sector`, which is always correct, just slower.
    pub fn transact(&self, start: u64, is_read: bool, bufs: &mut [&mut [u8]]) -> Result<(), Error> {
        let _guard = self.transaction_lock.lock();
        let count = bufs.len() as u32;
        if count == 0 {
            return Ok(());
        }
        let (first_vbn, first_lo) = self.locate(start)?;
        let (last_vbn, _) = self.locate(start + count as u64 - 1)?;

        let mut media = self.media.lock();
        let live = count == media.geometry().planes()
            && first_vbn == last_vbn
            && (is_read || has_room_for_write(&mut media, first_vbn, count, self.hidden));

        if !live {
            drop(media);
            for (i, buf) in bufs.iter_mut().enumerate() {
                let (vbn, lo) = self.locate(start + i as u64)?;
                let mut media = self.media.lock();
                if is_read {
                    media.read_sector(vbn, lo, buf, self.hidden)?;
                } else {
                    media.write_sector(vbn, lo, buf, self.hidden)?;
                }
            }
            return Ok(());
        }

        live_transact(&mut media, first_vbn, first_lo, is_read, self.hidden, bufs)
    }
}

/// Checks the "room in the NSSM" precondition without committing to
/// anything: the block's current write cursor plus `count` must still fit
/// the block, so the live path never needs a thrashing-prevention merge
/// mid-transaction.
fn has_room_for_write(media: &mut Media, vbn: u32, count: u32, hidden: bool) -> bool {
    let mut pending = Vec::new();
    let (mut translator, nssm_mgr) = media.translator_and_nssm();
    let mut notifier = BufferingNotifier { pending: &mut pending };
    let index = {
        let mut ctx = NssmCtx { translator: &mut translator, notifier: &mut notifier, hidden };
        match nssm_mgr.get_map_for_virtual_block(vbn, &mut ctx) {
            Ok(i) => i,
            Err(_) => return false,
        }
    };
    let nssm = nssm_mgr.nssm(index);
    let room = nssm.current_page_count() + count <= nssm.entry_count();
    nssm_mgr.release(index);
    drop(translator);
    media.post_pending(pending);
    room
}

fn live_transact(
    media: &mut Media,
    vbn: u32,
    first_lo: u32,
    is_read: bool,
    hidden: bool,
    bufs: &mut [&mut [u8]],
) -> Result<(), Error> {
    let mut pending = Vec::new();
    let (mut translator, nssm_mgr) = media.translator_and_nssm();
    let mut notifier = BufferingNotifier { pending: &mut pending };

    let index = {
        let mut ctx = NssmCtx { translator: &mut translator, notifier: &mut notifier, hidden };
        match nssm_mgr.get_map_for_virtual_block(vbn, &mut ctx) {
            Ok(i) => i,
            Err(e) => {
                drop(translator);
                media.post_pending(pending);
                return Err(e);
            }
        }
    };

    let result = if is_read {
        live_read(nssm_mgr.nssm(index), first_lo, bufs, &mut translator, &mut notifier)
    } else {
        live_write(nssm_mgr.nssm(index), vbn, first_lo, bufs, hidden, &mut translator, &mut notifier)
    };

    nssm_mgr.release(index);
    drop(translator);
    media.post_pending(pending);
    result
}

fn live_read(
    nssm: &mut NonsequentialSectorsMap,
    first_lo: u32,
    bufs: &mut [&mut [u8]],
    translator: &mut dyn BlockTranslator,
    notifier: &mut dyn RelocateNotifier,
) -> Result<(), Error> {
    let mut pages = Vec::with_capacity(bufs.len());
    for i in 0..bufs.len() as u32 {
        let mut ctx = NssmCtx { translator: &mut *translator, notifier: &mut *notifier, hidden: false };
        pages.push(nssm.get_physical_page_for_logical_offset(first_lo + i, &mut ctx)?);
    }

    if pages.iter().any(|p| !p.is_valid()) {
        // A live envelope's whole point is one combined HAL command; if any
        // sector in it was never written, treat the envelope as unwritten
        // rather than feeding the HAL a mix of valid and sentinel pages.
        for buf in bufs.iter_mut() {
            buf.fill(0xFF);
        }
        return Ok(());
    }

    let mut metas: Vec<PageMetadata> = (0..bufs.len()).map(|_| PageMetadata::erased()).collect();
    let mut ops: Vec<PlaneReadOp<'_>> = Vec::with_capacity(bufs.len());
    for ((buf, meta), &page) in bufs.iter_mut().zip(metas.iter_mut()).zip(pages.iter()) {
        ops.push(PlaneReadOp { page, data: &mut **buf, metadata: meta, result: None });
    }
    translator.hal().read_multi(&mut ops);

    let vbn = nssm.virtual_block_number();
    for op in ops {
        match op.result.expect("read_multi must fill every op's result") {
            Ok(status) if status.is_ok_for_caller() => {
                if status.needs_relocate() {
                    notifier.request_relocate(vbn);
                }
            }
            Ok(_) => return Err(Error::EccFixFailed),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Reserves `bufs.len()` consecutive virtual offsets (one per plane, by the
/// `live` precondition) up front and issues one combined HAL write. A
/// failed plane is flagged bad; unlike the single-sector path this does not
/// attempt an in-place core-merge recovery of the other, successfully
/// written planes — `core_merge` excludes a single logical offset, not a
/// per-plane subset, so a partial multi-plane failure surfaces as an error
/// and the next normal write to this block drives the ordinary recovery.
fn live_write(
    nssm: &mut NonsequentialSectorsMap,
    vbn: u32,
    first_lo: u32,
    bufs: &mut [&mut [u8]],
    hidden: bool,
    translator: &mut dyn BlockTranslator,
    notifier: &mut dyn RelocateNotifier,
) -> Result<(), Error> {
    let mut pages = Vec::with_capacity(bufs.len());
    let mut los = Vec::with_capacity(bufs.len());
    let mut planes = Vec::with_capacity(bufs.len());
    for i in 0..bufs.len() as u32 {
        let lo = first_lo + i;
        let in_order = nssm.completes_sorted_prefix_for_next_write(lo);
        let (page, voff) = {
            let mut ctx = NssmCtx { translator: &mut *translator, notifier: &mut *notifier, hidden };
            nssm.get_next_physical_page_and_offset(lo, &mut ctx)?
        };
        nssm.add_entry(lo, voff);
        let plane = voff % nssm.planes() as u32;
        let mut flags = MetaFlags::empty();
        if in_order {
            flags |= MetaFlags::IN_LOGICAL_ORDER;
        }
        if hidden {
            flags |= MetaFlags::HIDDEN_BLOCK;
        }
        pages.push((page, PageMetadata::data(vbn + plane, lo, flags)));
        los.push(lo);
        planes.push(plane as u8);
    }

    let mut ops: Vec<PlaneWriteOp<'_>> = Vec::with_capacity(bufs.len());
    for (buf, (page, meta)) in bufs.iter_mut().zip(pages.iter()) {
        ops.push(PlaneWriteOp { page: *page, data: &**buf, metadata: meta, result: None });
    }
    translator.hal().write_multi(&mut ops);

    for ((op, &lo), &plane) in ops.into_iter().zip(los.iter()).zip(planes.iter()) {
        match op.result.expect("write_multi must fill every op's result") {
            Ok(crate::error::WriteStatus::Success) => {}
            Ok(crate::error::WriteStatus::WriteFailed) => {
                let failed_pbn = nssm.physical_block_for_plane(plane, translator)?;
                if failed_pbn.is_valid() {
                    translator.handle_new_bad_block(failed_pbn)?;
                }
                log::error!("data_drive: live write to vbn {vbn} lo {lo} failed on plane {plane}");
                return Err(Error::WriteFailed);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_hal::FakeHal;
    use crate::mapper::{InMemoryShutdownFlag, MapperConfig};
    use alloc::boxed::Box;

    fn geo(planes: u8) -> NandGeometry {
        NandGeometry {
            page_data_size: 64,
            pages_per_block: 8,
            planes_per_die: planes,
            blocks_per_chip: 64,
            chip_count: 1,
            reserved_range_good_blocks: 4,
            max_bad_block_percent: 2,
        }
    }

    struct NoopSem;
    impl crate::deferred_task::OsSemaphore for NoopSem {
        fn wait(&mut self) {}
        fn signal(&mut self) {}
    }

    fn new_drive(planes: u8, vbn_count: u32) -> DataDrive {
        let g = geo(planes);
        let mut media = Media::new(
            Box::new(FakeHal::new(g)),
            Box::new(InMemoryShutdownFlag::new(false)),
            Box::new(NoopSem),
            MapperConfig::default(),
            1,
            11,
        );
        media.init().unwrap();
        DataDrive::new(Arc::new(Mutex::new(media)), 0, vbn_count, false)
    }

    #[test]
    fn unwritten_sector_reads_as_erased() {
        let drive = new_drive(1, 4);
        let mut buf = [0u8; 64];
        drive.read_sector(5, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn write_then_read_round_trips() {
        let drive = new_drive(1, 4);
        let data = [0x42u8; 64];
        drive.write_sector(3, &data).unwrap();
        let mut out = [0u8; 64];
        drive.read_sector(3, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn out_of_bounds_sector_is_rejected() {
        let drive = new_drive(1, 1);
        let total = drive.get_info(DriveInfo::SizeInSectors);
        let DriveInfoValue::SizeInSectors(n) = total else { unreachable!() };
        let mut buf = [0u8; 64];
        assert_eq!(drive.read_sector(n, &mut buf), Err(Error::SectorOutOfBounds));
    }

    #[test]
    fn drive_info_reports_plane_count_as_optimal_transfer_size() {
        let drive = new_drive(2, 4);
        assert_eq!(drive.get_info(DriveInfo::OptimalTransferSectorCount), DriveInfoValue::OptimalTransferSectorCount(2));
        assert_eq!(drive.get_info(DriveInfo::NativeSectorSize), DriveInfoValue::NativeSectorSize(64));
    }

    #[test]
    fn live_multi_plane_transaction_round_trips() {
        let drive = new_drive(2, 4);
        let mut a = [0x11u8; 64];
        let mut b = [0x22u8; 64];
        {
            let mut bufs: Vec<&mut [u8]> = alloc::vec![&mut a[..], &mut b[..]];
            drive.transact(0, false, &mut bufs).unwrap();
        }
        let mut ra = [0u8; 64];
        let mut rb = [0u8; 64];
        {
            let mut bufs: Vec<&mut [u8]> = alloc::vec![&mut ra[..], &mut rb[..]];
            drive.transact(0, true, &mut bufs).unwrap();
        }
        assert_eq!(ra, [0x11u8; 64]);
        assert_eq!(rb, [0x22u8; 64]);
    }

    #[test]
    fn non_plane_aligned_transaction_falls_back_to_per_sector() {
        let drive = new_drive(2, 4);
        let mut a = [0xAAu8; 64];
        {
            let mut bufs: Vec<&mut [u8]> = alloc::vec![&mut a[..]];
            drive.transact(0, false, &mut bufs).unwrap();
        }
        let mut out = [0u8; 64];
        drive.read_sector(0, &mut out).unwrap();
        assert_eq!(out, [0xAAu8; 64]);
    }
}
