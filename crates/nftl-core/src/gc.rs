//! Garbage collection.
//!
//! A background daemon sweeps every pool on a timer (and on demand via
//! kicks). A pool collects when its free-block count drops below
//! `nr_blocks / GC_LIMIT_INVERSE`: the fullest-invalidated victim is
//! pulled off the priority list, its remaining valid pages are relocated
//! through the normal write path one range-locked page at a time, and the
//! erased block returns to the free list.

use crate::FtlInner;
use crate::ap::block_to_ap;
use crate::inflight::LockTag;
use crate::pool::{Pool, bitmap_find_zero, bitmap_get, bitmap_is_full};
use nftl_error::{FtlError, Result};
use nftl_types::{BlockId, HOST_PAGE_SIZE, Ppn};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Collect when fewer than `nr_blocks / GC_LIMIT_INVERSE` blocks are
/// free.
const GC_LIMIT_INVERSE: u32 = 10;

/// How long a collection pass waits for outstanding references on a
/// victim to drain before giving up on it for this cycle.
const REF_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Wake-up channel between `kick_gc` and the daemon.
#[derive(Debug, Default)]
pub(crate) struct GcSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl GcSignal {
    pub(crate) fn kick(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        drop(pending);
        self.cond.notify_one();
    }

    /// Wait until kicked or `timeout` elapses; clears the pending flag.
    fn wait(&self, timeout: Duration) {
        let mut pending = self.pending.lock();
        if !*pending {
            let _ = self.cond.wait_for(&mut pending, timeout);
        }
        *pending = false;
    }
}

/// What became of one victim block.
enum VictimOutcome {
    Reclaimed,
    Quarantined,
}

impl FtlInner {
    /// Request an asynchronous collection pass.
    pub(crate) fn kick_gc(&self) {
        self.gc_signal.kick();
    }

    /// Synchronous collection across all pools. Returns the number of
    /// blocks returned to free lists.
    pub(crate) fn gc_collect_all(&self) -> usize {
        self.pools.iter().map(|pool| self.gc_collect_pool(pool)).sum()
    }

    /// One collection pass over one pool.
    pub(crate) fn gc_collect_pool(&self, pool: &Pool) -> usize {
        let _gc = pool.gc_lock.lock();
        let need = (pool.nr_blocks / GC_LIMIT_INVERSE).max(1);

        // Victim selection freezes the mapping so invalidation counts
        // cannot move while blocks are flagged.
        let victims = self.map.with_lock(|| {
            let mut victims = Vec::new();
            let mut lists = pool.lists.lock();
            while need > pool.free_blocks() && !lists.prio.is_empty() {
                let Some(victim) = self.select_victim(pool, &lists.prio) else {
                    break;
                };
                lists.prio.retain(|&b| b != victim);
                let block = pool.block(victim);
                debug_assert!(block.is_full(&self.geo));
                if block
                    .gc_running
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                victims.push(victim);
                if victims.len() as u32 + pool.free_blocks() >= need {
                    break;
                }
            }
            victims
        });

        if victims.is_empty() {
            return 0;
        }
        debug!(
            target: "nftl::gc",
            pool = pool.id.0,
            victims = victims.len(),
            free = pool.free_blocks(),
            "collection pass"
        );

        let mut reclaimed = 0;
        for victim in victims {
            match self.gc_block(pool, victim) {
                Ok(VictimOutcome::Reclaimed) => reclaimed += 1,
                Ok(VictimOutcome::Quarantined) => {}
                Err(e) => {
                    // Leave the victim on used and retry next pass.
                    warn!(
                        target: "nftl::gc",
                        block = victim.0,
                        error = %e,
                        "relocation failed, victim deferred"
                    );
                    let block = pool.block(victim);
                    block.gc_running.store(false, Ordering::Release);
                    let mut lists = pool.lists.lock();
                    if !lists.prio.contains(&victim) {
                        lists.prio.push(victim);
                    }
                }
            }
        }
        if reclaimed > 0 {
            self.counters
                .gc_reclaimed_blocks
                .fetch_add(reclaimed as u64, Ordering::Relaxed);
        }
        reclaimed
    }

    /// Highest invalid-page count wins; ties break toward the lower
    /// (older) block id. Blocks that are not full or have nothing
    /// invalid are never victims.
    fn select_victim(&self, pool: &Pool, prio: &[BlockId]) -> Option<BlockId> {
        let mut best: Option<(BlockId, u32)> = None;
        for &id in prio {
            let block = pool.block(id);
            let st = block.state.lock();
            if st.nr_invalid_pages == 0 || !crate::pool::Block::state_is_full(&st, &self.geo) {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_id, best_invalid)) => {
                    st.nr_invalid_pages > best_invalid
                        || (st.nr_invalid_pages == best_invalid && id.0 < best_id.0)
                }
            };
            if better {
                best = Some((id, st.nr_invalid_pages));
            }
        }
        best.map(|(id, _)| id)
    }

    /// Wait for outstanding I/O references on the victim to drain.
    fn wait_refs(&self, block: &crate::pool::Block) -> bool {
        let start = Instant::now();
        while block.ref_count.load(Ordering::Acquire) != 0 {
            if start.elapsed() > REF_DRAIN_TIMEOUT {
                return false;
            }
            thread::yield_now();
        }
        true
    }

    /// Relocate every valid page of `victim`, erase it, and return it to
    /// the free list.
    fn gc_block(&self, pool: &Pool, victim: BlockId) -> Result<VictimOutcome> {
        let block = pool.block(victim);
        if !self.wait_refs(block) {
            return Err(FtlError::Transient(
                "victim has outstanding references".to_owned(),
            ));
        }

        let ap = block_to_ap(&self.geo, self.config.nr_aps_per_pool, victim);
        let base = self.geo.block_to_addr(victim);
        let kh = self.geo.host_pages_in_blk();
        let mut slot = 0_u32;
        loop {
            let next = {
                let st = block.state.lock();
                bitmap_find_zero(&st.invalid_pages, kh, slot)
            };
            let Some(offset) = next else { break };
            slot = offset + 1;

            let p = Ppn(base.0 + u64::from(offset));
            let Some(l) = self.map.lookup_ptol(p) else {
                debug_assert!(false, "valid page {} missing from reverse map", p.0);
                error!(target: "nftl::gc", p = p.0, "valid page missing from reverse map");
                continue;
            };

            let _range = self.inflight.lock(l, 1, LockTag::Gc);
            // A host write may have beaten us to the range lock and
            // already invalidated this page.
            {
                let st = block.state.lock();
                if bitmap_get(&st.invalid_pages, offset) {
                    trace!(target: "nftl::gc", p = p.0, "page went stale before relocation");
                    continue;
                }
            }

            let mut buf = vec![0_u8; HOST_PAGE_SIZE];
            self.device_read(ap, p, &mut buf)?;

            let token = self.begin_gc(l, p);
            let mw = match self.gc_map_page(l, &token) {
                Ok(mw) => mw,
                Err(FtlError::OutOfSpace) => {
                    // No destination anywhere, including the emergency
                    // blocks: the store cannot make progress.
                    error!(target: "nftl::gc", l = l.0, "out of space during relocation");
                    return Err(FtlError::OutOfSpace);
                }
                Err(e) => return Err(e),
            };
            self.submit_write(&mw, &buf, true)?;
            self.counters.gc_moved_pages.fetch_add(1, Ordering::Relaxed);
        }

        {
            let st = block.state.lock();
            if !bitmap_is_full(&st.invalid_pages, kh) {
                debug_assert!(false, "victim {} not fully invalid after relocation", victim.0);
                error!(
                    target: "nftl::gc",
                    block = victim.0,
                    "victim not fully invalid after relocation"
                );
            }
        }

        // Erase and reuse.
        if pool.gate.enter(self.serialize()) {
            self.ap(ap).io_delayed.fetch_add(1, Ordering::Relaxed);
        }
        let start = Instant::now();
        let erased = self.device.erase_block(victim);
        if erased.is_ok() {
            self.simulate_wait(start, self.config.t_erase_us);
        }
        pool.gate.exit(self.serialize());

        match erased {
            Ok(()) => {
                block.gc_running.store(false, Ordering::Release);
                pool.put_block(&self.geo, victim);
                trace!(target: "nftl::gc", block = victim.0, "victim reclaimed");
                Ok(VictimOutcome::Reclaimed)
            }
            Err(e) => {
                warn!(
                    target: "nftl::gc",
                    block = victim.0,
                    error = %e,
                    "erase failed, block quarantined"
                );
                block.gc_running.store(false, Ordering::Release);
                pool.quarantine_block(victim);
                Ok(VictimOutcome::Quarantined)
            }
        }
    }
}

// ── Daemon ──────────────────────────────────────────────────────────────────

/// Handle for the background collection daemon. Shutdown stops the timer
/// and joins the worker; dropping the handle does the same.
pub struct GcDaemon {
    stop: Arc<AtomicBool>,
    inner: Arc<FtlInner>,
    join: Option<JoinHandle<()>>,
}

impl GcDaemon {
    pub(crate) fn spawn(inner: Arc<FtlInner>) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let worker = Arc::clone(&inner);
        let period = Duration::from_millis(inner.config.gc_time_ms.max(1));

        let join = thread::Builder::new()
            .name("nftl-gc".to_owned())
            .spawn(move || {
                info!(target: "nftl::gc", period_ms = period.as_millis() as u64, "gc daemon started");
                loop {
                    worker.gc_signal.wait(period);
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    let reclaimed = worker.gc_collect_all();
                    if reclaimed > 0 {
                        debug!(target: "nftl::gc", reclaimed, "gc cycle reclaimed blocks");
                    }
                }
                info!(target: "nftl::gc", "gc daemon stopped");
            })?;

        Ok(Self {
            stop,
            inner,
            join: Some(join),
        })
    }

    /// Request shutdown and block until the daemon exits.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.inner.gc_signal.kick();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for GcDaemon {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
