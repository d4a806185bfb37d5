//! End-to-end scenarios over [`Media`] with [`FakeHal`] (spec Sec 8), plus
//! the round-trip and idempotence laws stated alongside them. Geometries here
//! are scaled down from the spec's illustrative "256 pages/block, 2 planes,
//! 2048-byte page" numbers so the in-memory `FakeHal` backing array stays
//! small; the shape of each scenario (plane count, multi-round merges,
//! reserved-range conflicts) is preserved.

use alloc::boxed::Box;
use alloc::vec;

use crate::allocator::Constraints;
use crate::error::EccStatus;
use crate::fake_hal::{FakeHal, SharedFakeHal};
use crate::geometry::{BlockAddress, NandGeometry};
use crate::hal::NandHal;
use crate::mapper::{InMemoryShutdownFlag, MapperConfig};
use crate::media::Media;
use crate::metadata::{MetaFlags, PageMetadata};
use crate::nssm::NssmCtx;
use crate::virtual_block::BlockTranslator;

struct NoopSem;
impl crate::deferred_task::OsSemaphore for NoopSem {
    fn wait(&mut self) {}
    fn signal(&mut self) {}
}

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

fn new_media(planes: u8) -> Media {
    Media::new(
        Box::new(FakeHal::new(geo(planes))),
        Box::new(InMemoryShutdownFlag::new(false)),
        Box::new(NoopSem),
        MapperConfig::default(),
        1,
        13,
    )
}

/// As `new_media`, but keeps a shared handle to the `FakeHal` so a test can
/// keep injecting failures after `Media` takes ownership of its HAL.
fn new_media_with_shared_hal(planes: u8) -> (Media, SharedFakeHal) {
    let shared = SharedFakeHal::new(geo(planes));
    let media = Media::new(
        Box::new(shared.clone()),
        Box::new(InMemoryShutdownFlag::new(false)),
        Box::new(NoopSem),
        MapperConfig::default(),
        1,
        13,
    );
    (media, shared)
}

/// 1. Sequential fill: write every logical offset of virtual block 0 in
/// order, read every byte back, and confirm the last page lands flagged
/// `IN_LOGICAL_ORDER`.
#[test]
fn sequential_fill_round_trips_and_flags_in_logical_order() {
    let mut media = new_media(2);
    media.init().unwrap();

    let g = media.geometry();
    let vpp = g.virtual_pages_per_block();
    for lo in 0..vpp {
        let pattern = 0xAAu8 ^ (lo as u8);
        media.write_sector(0, lo, &vec![pattern; 64], false).unwrap();
    }
    for lo in 0..vpp {
        let pattern = 0xAAu8 ^ (lo as u8);
        let mut buf = [0u8; 64];
        media.read_sector(0, lo, &mut buf, false).unwrap();
        assert!(buf.iter().all(|&b| b == pattern), "lo {lo} mismatch");
    }

    let (mut translator, nssm_mgr) = media.translator_and_nssm();
    let mut notifier = crate::nssm::NoopNotifier;
    let index = {
        let mut ctx = NssmCtx { translator: &mut translator, notifier: &mut notifier, hidden: false };
        nssm_mgr.get_map_for_virtual_block(0, &mut ctx).unwrap()
    };
    let mut ctx = NssmCtx { translator: &mut translator, notifier: &mut notifier, hidden: false };
    let last_page = nssm_mgr.nssm(index).get_physical_page_for_logical_offset(vpp - 1, &mut ctx).unwrap();
    let mut data = [0u8; 64];
    let mut meta = PageMetadata::erased();
    ctx.translator.hal().read_page(last_page, &mut data, &mut meta).unwrap();
    assert!(meta.flags.contains(MetaFlags::IN_LOGICAL_ORDER));
    nssm_mgr.release(index);
}

/// 2. Hot sector: fill a block distinctly, then overwrite a single sector
/// past the block's capacity. The first overflow promotes (no merge
/// possible, no backup yet); the second overflow must core-merge, since the
/// single hot sector masks only one of the prior block's many distinct
/// entries rather than all of them.
#[test]
fn hot_sector_forces_core_merge_and_keeps_latest_value() {
    let mut media = new_media(2);
    media.init().unwrap();

    let g = media.geometry();
    let vpp = g.virtual_pages_per_block();

    for lo in 0..vpp {
        media.write_sector(0, lo, &vec![0x10u8; 64], false).unwrap();
    }

    let mut last = 0u8;
    for i in 0..(vpp + 1) {
        last = 0x20u8.wrapping_add(i as u8);
        media.write_sector(0, 0, &vec![last; 64], false).unwrap();
    }

    let mut buf = [0u8; 64];
    media.read_sector(0, 0, &mut buf, false).unwrap();
    assert!(buf.iter().all(|&b| b == last));

    let (mut translator, nssm_mgr) = media.translator_and_nssm();
    let mut notifier = crate::nssm::NoopNotifier;
    let index = {
        let mut ctx = NssmCtx { translator: &mut translator, notifier: &mut notifier, hidden: false };
        nssm_mgr.get_map_for_virtual_block(0, &mut ctx).unwrap()
    };
    assert!(nssm_mgr.nssm(index).stats().core_merges >= 1);
    nssm_mgr.release(index);
}

/// 3. Unclean shutdown: write a sector, never flush, then simulate a
/// power-cut remount by tearing down in-RAM state and rescanning the same
/// physical media (`Media::rebuild`, which also clears the shutdown flag,
/// forcing the scan path rather than trusting on-media maps).
#[test]
fn unclean_shutdown_is_recovered_by_rescan() {
    let mut media = new_media(1);
    media.init().unwrap();
    media.write_sector(0, 7, &vec![0x11u8; 64], false).unwrap();

    media.rebuild().unwrap();

    let mut buf = [0u8; 64];
    media.read_sector(0, 7, &mut buf, false).unwrap();
    assert!(buf.iter().all(|&b| b == 0x11));
}

/// 4. Bad-block birth on write: the first page write to a freshly allocated
/// block fails. The write API still returns success (recovered via core
/// merge onto a new block) and the failed block is flagged bad.
#[test]
fn write_failure_on_fresh_block_recovers_and_marks_bad() {
    let (mut media, hal) = new_media_with_shared_hal(1);
    media.init().unwrap();

    let g = media.geometry();
    let failed_pbn = {
        let (mut translator, _) = media.translator_and_nssm();
        BlockTranslator::get_block_and_assign(&mut translator, 0, Constraints { plane: Some(0), die: None, chip: None })
            .unwrap()
    };
    let failed_page = g.make_page(failed_pbn, 0);
    hal.0.borrow_mut().inject_write_failure(failed_page);

    media.write_sector(0, 0, &vec![0x33u8; 64], false).unwrap();

    let mut buf = [0u8; 64];
    media.read_sector(0, 0, &mut buf, false).unwrap();
    assert!(buf.iter().all(|&b| b == 0x33));

    let (mut translator, _) = media.translator_and_nssm();
    assert!(translator.hal().is_block_bad(failed_pbn, true));

    media.write_sector(0, 1, &vec![0x44u8; 64], false).unwrap();
}

/// 5. ECC rewrite threshold: a read reports `FixedRewriteSector`. The read
/// still returns the correct data, and draining the deferred queue relocates
/// the virtual block to a fresh set of physical blocks.
#[test]
fn ecc_marginal_read_schedules_relocate() {
    let (mut media, hal) = new_media_with_shared_hal(1);
    media.init().unwrap();
    media.write_sector(0, 0, &vec![0x55u8; 64], false).unwrap();

    let before = {
        let (mut translator, _) = media.translator_and_nssm();
        translator.get_block_info(0).unwrap()
    };

    let read_page = {
        let (mut translator, _) = media.translator_and_nssm();
        let pbn = translator.get_block_info(0).unwrap();
        media.geometry().make_page(pbn, 0)
    };
    hal.0.borrow_mut().inject_ecc_status(read_page, EccStatus::FixedRewriteSector);

    let mut buf = [0u8; 64];
    media.read_sector(0, 0, &mut buf, false).unwrap();
    assert!(buf.iter().all(|&b| b == 0x55));

    while media.step_deferred().unwrap() {}

    let after = {
        let (mut translator, _) = media.translator_and_nssm();
        translator.get_block_info(0).unwrap()
    };
    assert_ne!(before, after);

    let mut buf2 = [0u8; 64];
    media.read_sector(0, 0, &mut buf2, false).unwrap();
    assert!(buf2.iter().all(|&b| b == 0x55));
}

/// 6. Conflict resolution: two physical blocks both carry page-0 metadata
/// claiming LBA 42. The one with fewer occupied pages in its first half
/// survives in the zone map; the other is erased.
#[test]
fn conflicting_lba_claims_resolve_to_fewer_occupied_pages() {
    let g = geo(1);
    let mut hal = FakeHal::new(g);

    let winner = BlockAddress(10);
    let loser = BlockAddress(11);

    let meta = PageMetadata::data(42, 0, MetaFlags::empty());
    hal.write_page(g.make_page(winner, 0), &[0x66u8; 64], &meta).unwrap();

    hal.write_page(g.make_page(loser, 0), &[0x77u8; 64], &meta).unwrap();
    hal.write_page(g.make_page(loser, 1), &[0x77u8; 64], &meta).unwrap();

    let mut media = Media::new(
        Box::new(hal),
        Box::new(InMemoryShutdownFlag::new(false)),
        Box::new(NoopSem),
        MapperConfig::default(),
        1,
        13,
    );
    media.init().unwrap();

    let resolved = {
        let (mut translator, _) = media.translator_and_nssm();
        translator.get_block_info(42).unwrap()
    };
    assert_eq!(resolved, winner);

    let (mut translator, _) = media.translator_and_nssm();
    assert!(!translator.hal().is_block_bad(loser, true));
    let mut meta_out = PageMetadata::erased();
    translator.hal().read_metadata(g.make_page(loser, 0), &mut meta_out).unwrap();
    assert!(meta_out.is_erased());
}

/// Round-trip / idempotence laws (spec Sec 8 boundary section).
#[test]
fn round_trip_laws_hold() {
    let mut media = new_media(1);
    media.init().unwrap();

    let mut buf = [0u8; 64];
    media.read_sector(0, 3, &mut buf, false).unwrap();
    assert!(buf.iter().all(|&b| b == 0xFF));

    media.write_sector(0, 3, &vec![0x01u8; 64], false).unwrap();
    media.write_sector(0, 3, &vec![0x02u8; 64], false).unwrap();
    media.read_sector(0, 3, &mut buf, false).unwrap();
    assert!(buf.iter().all(|&b| b == 0x02));

    media.flush().unwrap();
    media.rebuild().unwrap();
    media.read_sector(0, 3, &mut buf, false).unwrap();
    assert!(buf.iter().all(|&b| b == 0x02));

    media.erase_drive().unwrap();
    media.read_sector(0, 3, &mut buf, false).unwrap();
    assert!(buf.iter().all(|&b| b == 0xFF));
}
