//! Top-level orchestration: owns the HAL, the [`Mapper`], the [`NssmManager`]
//! pool, and the [`DeferredTaskQueue`] behind one coarse lock (spec Sec 5).
//!
//! `Media` is the thing a host wraps in a `spin::Mutex` and shares between
//! the foreground `DataDrive` API and the one background relocation thread.
//! Everything in this module is single-threaded internally; the mutex at the
//! call site is what gives the "NAND driver lock" spec Sec 5 describes.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::deferred_task::{DeferredTaskQueue, OsSemaphore, RelocateVirtualBlockTask, TaskRunner};
use crate::error::{EraseStatus, Error, WriteStatus};
use crate::geometry::{BlockAddress, NandGeometry};
use crate::hal::NandHal;
use crate::mapper::{Mapper, MapperConfig, MapperCtx, MapperTranslator, ShutdownFlag};
use crate::metadata::{MetaFlags, PageMetadata};
use crate::nssm::{NonsequentialSectorsMap, NssmCtx, RelocateNotifier};
use crate::nssm_manager::NssmManager;
use crate::virtual_block::BlockTranslator;

/// What a host provides to run the deferred-task worker on its own thread.
/// Not stored by `Media` — the host owns spawning, `Media` only owns the
/// state the spawned loop (`run_deferred_worker`) operates on.
pub trait OsThread {
    fn spawn(&mut self, run: Box<dyn FnOnce() + Send>);
}

/// Collects relocate requests raised while a deferred task or a sector
/// operation is already running, instead of posting them back into the
/// queue being drained — posting mid-drain would need a second live
/// `&mut` into the same `DeferredTaskQueue` the caller is already holding.
/// The caller posts these once its own borrow of the queue has ended.
pub(crate) struct BufferingNotifier<'a> {
    pub(crate) pending: &'a mut Vec<u32>,
}

impl<'a> RelocateNotifier for BufferingNotifier<'a> {
    fn request_relocate(&mut self, vbn: u32) {
        if !self.pending.contains(&vbn) {
            self.pending.push(vbn);
        }
    }
}

/// Everything a single relocate (whether run synchronously at init or by
/// the deferred worker) needs, borrowed disjointly from `Media`'s fields so
/// it never aliases `Media::queue`.
struct MediaRunner<'a> {
    mapper: &'a mut Mapper,
    hal: &'a mut dyn NandHal,
    shutdown_flag: &'a mut dyn ShutdownFlag,
    nssm_manager: &'a mut NssmManager,
    pending_relocates: &'a mut Vec<u32>,
}

impl<'a> TaskRunner for MediaRunner<'a> {
    fn relocate_virtual_block(&mut self, vbn: u32) -> Result<(), Error> {
        let mut translator =
            MapperTranslator { mapper: self.mapper, hal: self.hal, shutdown_flag: self.shutdown_flag };
        let mut notifier = BufferingNotifier { pending: self.pending_relocates };
        let index = {
            let mut ctx = NssmCtx { translator: &mut translator, notifier: &mut notifier, hidden: false };
            self.nssm_manager.get_map_for_virtual_block(vbn, &mut ctx)?
        };
        let result = {
            let mut ctx = NssmCtx { translator: &mut translator, notifier: &mut notifier, hidden: false };
            self.nssm_manager.nssm(index).relocate_virtual_block(&mut ctx)
        };
        self.nssm_manager.release(index);
        result
    }
}

pub struct Media {
    hal: Box<dyn NandHal>,
    mapper: Mapper,
    nssm_manager: NssmManager,
    queue: DeferredTaskQueue,
    shutdown_flag: Box<dyn ShutdownFlag>,
    sem: Box<dyn OsSemaphore>,
    geometry: NandGeometry,
    config: MapperConfig,
    data_allocator_seed: u64,
}

impl Media {
    pub fn new(
        hal: Box<dyn NandHal>,
        shutdown_flag: Box<dyn ShutdownFlag>,
        post_semaphore: Box<dyn OsSemaphore>,
        config: MapperConfig,
        base_nssm_count: u32,
        data_allocator_seed: u64,
    ) -> Self {
        let geometry = hal.geometry();
        let planes = geometry.planes_per_die;
        Media {
            mapper: Mapper::new(geometry, config, data_allocator_seed),
            nssm_manager: NssmManager::new(geometry, planes, base_nssm_count),
            queue: DeferredTaskQueue::new(),
            hal,
            shutdown_flag,
            sem: post_semaphore,
            geometry,
            config,
            data_allocator_seed,
        }
    }

    pub fn geometry(&self) -> NandGeometry {
        self.geometry
    }

    pub(crate) fn post_pending(&mut self, pending: Vec<u32>) {
        for vbn in pending {
            self.queue.post(Box::new(RelocateVirtualBlockTask::new(vbn)), &mut *self.sem);
        }
    }

    /// Relocate one virtual block right away (not through the deferred
    /// queue) — used to evacuate strays found in the reserved range at boot,
    /// before the drive is open for sector traffic.
    fn relocate_virtual_block_sync(&mut self, vbn: u32) -> Result<(), Error> {
        let mut pending = Vec::new();
        let result = {
            let mut runner = MediaRunner {
                mapper: &mut self.mapper,
                hal: &mut *self.hal,
                shutdown_flag: &mut *self.shutdown_flag,
                nssm_manager: &mut self.nssm_manager,
                pending_relocates: &mut pending,
            };
            runner.relocate_virtual_block(vbn)
        };
        self.post_pending(pending);
        result
    }

    /// `Mapper::init`/`evacuate_reserved_range` report strays only as raw
    /// mapper keys (vbn + plane), not a resolved plane-normalized vbn. Used
    /// directly as the vbn to relocate: exact when `planes == 1`, an
    /// approximation otherwise (see DESIGN.md).
    fn relocate_strays(&mut self, strays: Vec<u32>) -> Result<(), Error> {
        for vbn in strays {
            self.relocate_virtual_block_sync(vbn)?;
        }
        Ok(())
    }

    pub fn init(&mut self) -> Result<(), Error> {
        let strays = {
            let mut ctx = MapperCtx { hal: &mut *self.hal, shutdown_flag: &mut *self.shutdown_flag };
            self.mapper.init(&mut ctx)?
        };
        self.relocate_strays(strays)
    }

    pub fn rebuild(&mut self) -> Result<(), Error> {
        let strays = {
            let mut ctx = MapperCtx { hal: &mut *self.hal, shutdown_flag: &mut *self.shutdown_flag };
            self.mapper.rebuild(&mut ctx)?
        };
        self.nssm_manager.invalidate_all();
        self.relocate_strays(strays)
    }

    /// Erase every non-bad block, drop all in-RAM map state, and re-run the
    /// boot-time scan from scratch on the blank media.
    pub fn erase_drive(&mut self) -> Result<(), Error> {
        let total = self.geometry.total_blocks();
        for idx in 0..total {
            let block = BlockAddress(idx);
            if self.hal.is_block_bad(block, true) {
                continue;
            }
            match self.hal.erase_block(block)? {
                EraseStatus::Success => {}
                EraseStatus::EraseFailed => self.hal.mark_block_bad(block),
            }
        }
        self.nssm_manager.invalidate_all();
        self.mapper = Mapper::new(self.geometry, self.config, self.data_allocator_seed);
        self.shutdown_flag.set(false);
        self.init()
    }

    /// Flush every dirty NSSM, then the mapper's persistent maps, setting
    /// the clean-shutdown bit last so a power loss mid-flush still forces a
    /// rescan on the next boot.
    pub fn flush(&mut self) -> Result<(), Error> {
        let mut pending = Vec::new();
        {
            let mut translator = MapperTranslator {
                mapper: &mut self.mapper,
                hal: &mut *self.hal,
                shutdown_flag: &mut *self.shutdown_flag,
            };
            let mut notifier = BufferingNotifier { pending: &mut pending };
            let mut ctx = NssmCtx { translator: &mut translator, notifier: &mut notifier, hidden: false };
            self.nssm_manager.flush_all(&mut ctx)?;
        }
        {
            let mut ctx = MapperCtx { hal: &mut *self.hal, shutdown_flag: &mut *self.shutdown_flag };
            self.mapper.flush(&mut ctx)?;
        }
        self.post_pending(pending);
        Ok(())
    }

    /// Pop and run at most one deferred task. Intended to be called with the
    /// enclosing `spin::Mutex<Media>` locked only for the duration of this
    /// one call — see `run_deferred_worker`.
    pub fn step_deferred(&mut self) -> Result<bool, Error> {
        let mut pending = Vec::new();
        let ran = {
            let mut runner = MediaRunner {
                mapper: &mut self.mapper,
                hal: &mut *self.hal,
                shutdown_flag: &mut *self.shutdown_flag,
                nssm_manager: &mut self.nssm_manager,
                pending_relocates: &mut pending,
            };
            self.queue.run_one(&mut runner)?
        };
        self.post_pending(pending);
        Ok(ran)
    }

    /// Borrow everything `DataDrive` needs to run one sector operation,
    /// minus `queue`, so relocate requests raised mid-operation can be
    /// buffered and posted once the operation's own borrows end.
    pub(crate) fn translator_and_nssm(
        &mut self,
    ) -> (MapperTranslator<'_>, &mut NssmManager) {
        (
            MapperTranslator { mapper: &mut self.mapper, hal: &mut *self.hal, shutdown_flag: &mut *self.shutdown_flag },
            &mut self.nssm_manager,
        )
    }

    pub(crate) fn post_relocate(&mut self, vbn: u32) {
        self.queue.post(Box::new(RelocateVirtualBlockTask::new(vbn)), &mut *self.sem);
    }

    pub(crate) fn nssm_capacity(&self) -> usize {
        self.nssm_manager.capacity()
    }

    pub(crate) fn resize_nssm_pool(&mut self, base_count: u32) -> Result<(), Error> {
        let mut pending = Vec::new();
        let result = {
            let mut translator = MapperTranslator {
                mapper: &mut self.mapper,
                hal: &mut *self.hal,
                shutdown_flag: &mut *self.shutdown_flag,
            };
            let mut notifier = BufferingNotifier { pending: &mut pending };
            let mut ctx = NssmCtx { translator: &mut translator, notifier: &mut notifier, hidden: false };
            self.nssm_manager.resize(base_count, &mut ctx)
        };
        self.post_pending(pending);
        result
    }

    /// Read logical offset `lo` of virtual block `vbn` into `buf`. An
    /// unoccupied offset (never written) reads back as 0xFF, matching flash
    /// erased state, and is not an error (spec Sec 7).
    pub(crate) fn read_sector(&mut self, vbn: u32, lo: u32, buf: &mut [u8], hidden: bool) -> Result<(), Error> {
        let mut pending = Vec::new();
        let mut translator =
            MapperTranslator { mapper: &mut self.mapper, hal: &mut *self.hal, shutdown_flag: &mut *self.shutdown_flag };
        let mut notifier = BufferingNotifier { pending: &mut pending };

        let index = {
            let mut ctx = NssmCtx { translator: &mut translator, notifier: &mut notifier, hidden };
            match self.nssm_manager.get_map_for_virtual_block(vbn, &mut ctx) {
                Ok(i) => i,
                Err(e) => {
                    drop(translator);
                    self.post_pending(pending);
                    return Err(e);
                }
            }
        };

        let result = read_through_nssm(self.nssm_manager.nssm(index), buf, lo, hidden, &mut translator, &mut notifier);
        self.nssm_manager.release(index);
        drop(translator);
        self.post_pending(pending);
        result
    }

    /// Write `buf` to logical offset `lo` of virtual block `vbn`, recovering
    /// once on a `WRITE_FAILED` page write before surfacing an error.
    pub(crate) fn write_sector(&mut self, vbn: u32, lo: u32, buf: &[u8], hidden: bool) -> Result<(), Error> {
        let mut pending = Vec::new();
        let mut translator =
            MapperTranslator { mapper: &mut self.mapper, hal: &mut *self.hal, shutdown_flag: &mut *self.shutdown_flag };
        let mut notifier = BufferingNotifier { pending: &mut pending };

        let index = {
            let mut ctx = NssmCtx { translator: &mut translator, notifier: &mut notifier, hidden };
            match self.nssm_manager.get_map_for_virtual_block(vbn, &mut ctx) {
                Ok(i) => i,
                Err(e) => {
                    drop(translator);
                    self.post_pending(pending);
                    return Err(e);
                }
            }
        };

        let result =
            write_through_nssm(self.nssm_manager.nssm(index), vbn, lo, buf, hidden, &mut translator, &mut notifier);
        self.nssm_manager.release(index);
        drop(translator);
        self.post_pending(pending);
        result
    }
}

/// Shared by the single-sector and multi-sector transaction read paths.
fn read_through_nssm(
    nssm: &mut NonsequentialSectorsMap,
    buf: &mut [u8],
    lo: u32,
    hidden: bool,
    translator: &mut dyn BlockTranslator,
    notifier: &mut dyn RelocateNotifier,
) -> Result<(), Error> {
    let page = {
        let mut ctx = NssmCtx { translator: &mut *translator, notifier: &mut *notifier, hidden };
        nssm.get_physical_page_for_logical_offset(lo, &mut ctx)?
    };
    if !page.is_valid() {
        buf.fill(0xFF);
        return Ok(());
    }
    let mut meta = PageMetadata::erased();
    match translator.hal().read_page(page, buf, &mut meta)? {
        status if status.is_ok_for_caller() => {
            if status.needs_relocate() {
                notifier.request_relocate(nssm.virtual_block_number());
            }
            Ok(())
        }
        _ => Err(Error::EccFixFailed),
    }
}

/// Shared by the single-sector and multi-sector transaction write paths.
fn write_through_nssm(
    nssm: &mut NonsequentialSectorsMap,
    vbn: u32,
    lo: u32,
    buf: &[u8],
    hidden: bool,
    translator: &mut dyn BlockTranslator,
    notifier: &mut dyn RelocateNotifier,
) -> Result<(), Error> {
    let in_order = nssm.completes_sorted_prefix_for_next_write(lo);
    let mut flags = MetaFlags::empty();
    if in_order {
        flags |= MetaFlags::IN_LOGICAL_ORDER;
    }
    if hidden {
        flags |= MetaFlags::HIDDEN_BLOCK;
    }

    let (page, voff) = {
        let mut ctx = NssmCtx { translator: &mut *translator, notifier: &mut *notifier, hidden };
        nssm.get_next_physical_page_and_offset(lo, &mut ctx)?
    };
    let plane = voff % nssm.planes() as u32;
    let meta = PageMetadata::data(vbn + plane, lo, flags);

    match translator.hal().write_page(page, buf, &meta)? {
        WriteStatus::Success => {
            nssm.add_entry(lo, voff);
            Ok(())
        }
        WriteStatus::WriteFailed => {
            {
                let mut ctx = NssmCtx { translator: &mut *translator, notifier: &mut *notifier, hidden };
                nssm.recover_from_failed_write(voff, lo, &mut ctx)?;
            }
            let in_order = nssm.completes_sorted_prefix_for_next_write(lo);
            let mut flags = MetaFlags::empty();
            if in_order {
                flags |= MetaFlags::IN_LOGICAL_ORDER;
            }
            if hidden {
                flags |= MetaFlags::HIDDEN_BLOCK;
            }
            let (page, voff) = {
                let mut ctx = NssmCtx { translator: &mut *translator, notifier: &mut *notifier, hidden };
                nssm.get_next_physical_page_and_offset(lo, &mut ctx)?
            };
            let plane = voff % nssm.planes() as u32;
            let meta = PageMetadata::data(vbn + plane, lo, flags);
            match translator.hal().write_page(page, buf, &meta)? {
                WriteStatus::Success => {
                    nssm.add_entry(lo, voff);
                    Ok(())
                }
                WriteStatus::WriteFailed => Err(Error::WriteFailed),
            }
        }
    }
}

/// Drains `media`'s deferred queue forever, blocking on `sem` between
/// batches. The host spawns this (via its `OsThread` impl) on the one
/// dedicated background thread spec Sec 5 calls for; `sem` must be an
/// independent handle to the same underlying OS semaphore `Media` was built
/// with, since `Media::new`'s `post_semaphore` and this one both need to
/// operate on it concurrently from different threads.
pub fn run_deferred_worker(media: &spin::Mutex<Media>, sem: &mut dyn OsSemaphore) -> ! {
    loop {
        sem.wait();
        loop {
            let ran = media.lock().step_deferred();
            match ran {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    log::warn!("deferred worker: task failed: {e}");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_hal::FakeHal;
    use crate::mapper::InMemoryShutdownFlag;

    fn geo() -> NandGeometry {
        NandGeometry {
            page_data_size: 64,
            pages_per_block: 8,
            planes_per_die: 1,
            blocks_per_chip: 64,
            chip_count: 1,
            reserved_range_good_blocks: 4,
            max_bad_block_percent: 2,
        }
    }

    struct NoopSem;
    impl OsSemaphore for NoopSem {
        fn wait(&mut self) {}
        fn signal(&mut self) {}
    }

    fn new_media() -> Media {
        let g = geo();
        Media::new(
            Box::new(FakeHal::new(g)),
            Box::new(InMemoryShutdownFlag::new(false)),
            Box::new(NoopSem),
            MapperConfig::default(),
            1,
            7,
        )
    }

    #[test]
    fn init_on_blank_media_finds_no_strays() {
        let mut media = new_media();
        media.init().unwrap();
    }

    #[test]
    fn flush_does_not_disturb_in_ram_assignment() {
        let mut media = new_media();
        media.init().unwrap();

        let pbn = {
            let (mut translator, _) = media.translator_and_nssm();
            crate::virtual_block::BlockTranslator::get_block_and_assign(
                &mut translator,
                100,
                crate::allocator::Constraints::default(),
            )
            .unwrap()
        };
        media.flush().unwrap();

        let (mut translator, _) = media.translator_and_nssm();
        let reloaded = crate::virtual_block::BlockTranslator::get_block_info(&mut translator, 100).unwrap();
        assert_eq!(reloaded, pbn);
    }

    #[test]
    fn erase_drive_resets_block_assignment() {
        let mut media = new_media();
        media.init().unwrap();
        {
            let (mut translator, _) = media.translator_and_nssm();
            crate::virtual_block::BlockTranslator::get_block_and_assign(
                &mut translator,
                100,
                crate::allocator::Constraints::default(),
            )
            .unwrap();
        }
        media.erase_drive().unwrap();
        let (mut translator, _) = media.translator_and_nssm();
        let after = crate::virtual_block::BlockTranslator::get_block_info(&mut translator, 100).unwrap();
        assert!(!after.is_valid());
    }
}
