//! Inflight logical-range lock.
//!
//! A sharded set of locked pages enforcing mutual exclusion between host
//! I/O and GC relocation on the same logical address. Pages map to shards
//! by modulo; each shard has its own lock, so disjoint addresses rarely
//! contend. Multi-page ranges acquire their pages in ascending order,
//! which keeps two overlapping multi-page lockers from deadlocking.
//!
//! This is a leaf lock in the store's lock order and the only lock held
//! across device I/O submission.

use nftl_types::Lpn;
use parking_lot::Mutex;
use std::thread;
use tracing::trace;

const DEFAULT_SHARDS: usize = 64;

/// Who holds a locked range; carried for tracing only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockTag {
    Host,
    Gc,
}

#[derive(Debug)]
struct InflightEntry {
    page: u64,
    tag: LockTag,
}

#[derive(Debug)]
pub(crate) struct RangeLock {
    shards: Vec<Mutex<Vec<InflightEntry>>>,
}

impl RangeLock {
    pub(crate) fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub(crate) fn with_shards(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    fn shard_index(&self, page: u64) -> usize {
        (page % self.shards.len() as u64) as usize
    }

    fn lock_page(&self, page: u64, tag: LockTag) {
        let shard_idx = self.shard_index(page);
        loop {
            let mut shard = self.shards[shard_idx].lock();
            let holder = shard.iter().find(|e| e.page == page).map(|e| e.tag);
            match holder {
                None => {
                    shard.push(InflightEntry { page, tag });
                    return;
                }
                Some(holder) => {
                    trace!(
                        target: "nftl::inflight",
                        page,
                        holder = ?holder,
                        waiter = ?tag,
                        "range contention"
                    );
                }
            }
            drop(shard);
            thread::yield_now();
        }
    }

    fn unlock_page(&self, page: u64) {
        let shard_idx = self.shard_index(page);
        let mut shard = self.shards[shard_idx].lock();
        let before = shard.len();
        shard.retain(|e| e.page != page);
        debug_assert_eq!(before, shard.len() + 1, "unlock of page not locked");
    }

    /// Lock `count` pages starting at `start`, blocking while any of them
    /// is held. Returns a guard that releases the range on drop.
    pub(crate) fn lock(&self, start: Lpn, count: u64, tag: LockTag) -> RangeGuard<'_> {
        for page in start.0..start.0 + count {
            self.lock_page(page, tag);
        }
        RangeGuard {
            lock: self,
            start: start.0,
            count,
        }
    }

    /// Whether any page of the range is currently held (test support).
    #[must_use]
    pub(crate) fn is_locked(&self, start: Lpn, count: u64) -> bool {
        (start.0..start.0 + count).any(|page| {
            self.shards[self.shard_index(page)]
                .lock()
                .iter()
                .any(|e| e.page == page)
        })
    }
}

/// RAII guard for a locked logical range.
#[derive(Debug)]
pub(crate) struct RangeGuard<'a> {
    lock: &'a RangeLock,
    start: u64,
    count: u64,
}

impl Drop for RangeGuard<'_> {
    fn drop(&mut self) {
        for page in self.start..self.start + self.count {
            self.lock.unlock_page(page);
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
