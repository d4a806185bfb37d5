//! Background relocation queue (spec Sec 4.10).
//!
//! One dedicated worker thread, outside this crate's control, drives
//! [`DeferredTaskQueue::run_forever`] in a loop; it blocks on an
//! [`OsSemaphore`] signalled by [`DeferredTaskQueue::post`]. Insertion is
//! priority-ordered (0 = highest); within a priority level, FIFO.
//!
//! The source's `examine`/`examineOne` de-dup hook is general (any task can
//! inspect the whole queue before being posted); every concrete task in this
//! crate only ever needs "coalesce with an existing task of the same kind
//! targeting the same virtual block", so that's what `dedup_key` captures
//! directly rather than a full visitor callback.

use alloc::boxed::Box;
use alloc::collections::BinaryHeap;

use crate::error::Error;

/// What a worker thread blocks on between `post()` calls. Implemented by
/// the embedding RTOS; `spin`-only builds can use a busy-polling stub.
pub trait OsSemaphore: Send {
    fn wait(&mut self);
    fn signal(&mut self);
}

/// What a deferred task needs from the rest of the core to do its job,
/// kept as a trait so this module doesn't depend on `nssm_manager` directly.
pub trait TaskRunner {
    fn relocate_virtual_block(&mut self, vbn: u32) -> Result<(), Error>;
}

pub trait DeferredTask: Send {
    /// 0 is highest priority.
    fn priority(&self) -> u8;
    /// `Some((kind, key))` if a same-kind, same-key task already queued
    /// should absorb this one instead of it being posted again.
    fn dedup_key(&self) -> Option<(u32, u32)>;
    fn run(&mut self, runner: &mut dyn TaskRunner) -> Result<(), Error>;
}

const TASK_KIND_RELOCATE: u32 = 1;

/// Posted after a `RelocateVirtualBlockTask`-eligible read (ECC
/// fixed-but-should-rewrite) to move a whole virtual block to fresh pages.
pub struct RelocateVirtualBlockTask {
    vbn: u32,
}

impl RelocateVirtualBlockTask {
    pub fn new(vbn: u32) -> Self {
        RelocateVirtualBlockTask { vbn }
    }
}

impl DeferredTask for RelocateVirtualBlockTask {
    fn priority(&self) -> u8 {
        5
    }

    fn dedup_key(&self) -> Option<(u32, u32)> {
        Some((TASK_KIND_RELOCATE, self.vbn))
    }

    fn run(&mut self, runner: &mut dyn TaskRunner) -> Result<(), Error> {
        runner.relocate_virtual_block(self.vbn)
    }
}

struct Entry {
    task: Box<dyn DeferredTask>,
    seq: u64,
}

impl Entry {
    /// Larger is popped first: lower `priority` and earlier `seq` both rank higher.
    fn rank(&self) -> (u8, u64) {
        (u8::MAX - self.task.priority(), u64::MAX - self.seq)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

pub struct DeferredTaskQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    running: bool,
}

impl DeferredTaskQueue {
    pub fn new() -> Self {
        DeferredTaskQueue { heap: BinaryHeap::new(), next_seq: 0, running: false }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty() && !self.running
    }

    /// Post a task, coalescing it away if `dedup_key` matches one already queued.
    pub fn post(&mut self, task: Box<dyn DeferredTask>, sem: &mut dyn OsSemaphore) {
        if let Some(key) = task.dedup_key() {
            if self.heap.iter().any(|e| e.task.dedup_key() == Some(key)) {
                log::trace!("deferred task coalesced into an existing entry");
                return;
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { task, seq });
        sem.signal();
    }

    /// Pop and run the single highest-priority task, if any.
    pub fn run_one(&mut self, runner: &mut dyn TaskRunner) -> Result<bool, Error> {
        let Some(mut entry) = self.heap.pop() else {
            return Ok(false);
        };
        self.running = true;
        let result = entry.task.run(runner);
        self.running = false;
        if let Err(e) = &result {
            log::warn!("deferred task failed: {e}");
        }
        result.map(|()| true)
    }

    /// Run until the queue is empty. The background worker calls this after
    /// waking from `sem.wait()`.
    pub fn run_forever(&mut self, sem: &mut dyn OsSemaphore, runner: &mut dyn TaskRunner) -> Result<(), Error> {
        loop {
            sem.wait();
            while self.run_one(runner)? {}
        }
    }

    /// Run every currently-queued task to completion; used by callers that
    /// can't park on a semaphore (tests, or a synchronous shutdown path).
    pub fn drain(&mut self, runner: &mut dyn TaskRunner) -> Result<(), Error> {
        while self.run_one(runner)? {}
        Ok(())
    }
}

impl Default for DeferredTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    struct NoopSem;
    impl OsSemaphore for NoopSem {
        fn wait(&mut self) {}
        fn signal(&mut self) {}
    }

    struct RecordingRunner {
        relocated: Vec<u32>,
    }
    impl TaskRunner for RecordingRunner {
        fn relocate_virtual_block(&mut self, vbn: u32) -> Result<(), Error> {
            self.relocated.push(vbn);
            Ok(())
        }
    }

    #[test]
    fn duplicate_relocate_tasks_coalesce() {
        let mut q = DeferredTaskQueue::new();
        let mut sem = NoopSem;
        q.post(Box::new(RelocateVirtualBlockTask::new(7)), &mut sem);
        q.post(Box::new(RelocateVirtualBlockTask::new(7)), &mut sem);
        q.post(Box::new(RelocateVirtualBlockTask::new(9)), &mut sem);
        assert_eq!(q.len(), 2);

        let mut runner = RecordingRunner { relocated: Vec::new() };
        q.drain(&mut runner).unwrap();
        assert_eq!(runner.relocated, alloc::vec![7, 9]);
    }

    struct HighPriorityTask;
    impl DeferredTask for HighPriorityTask {
        fn priority(&self) -> u8 {
            0
        }
        fn dedup_key(&self) -> Option<(u32, u32)> {
            None
        }
        fn run(&mut self, runner: &mut dyn TaskRunner) -> Result<(), Error> {
            runner.relocate_virtual_block(u32::MAX)
        }
    }

    #[test]
    fn higher_priority_runs_first_even_if_queued_later() {
        let mut q = DeferredTaskQueue::new();
        let mut sem = NoopSem;
        q.post(Box::new(RelocateVirtualBlockTask::new(1)), &mut sem);
        q.post(Box::new(HighPriorityTask), &mut sem);

        let mut runner = RecordingRunner { relocated: Vec::new() };
        q.run_one(&mut runner).unwrap();
        assert_eq!(runner.relocated, alloc::vec![u32::MAX]);
    }
}
