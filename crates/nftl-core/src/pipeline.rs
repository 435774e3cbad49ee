//! Request pipeline.
//!
//! Host reads and writes are validated, range-locked, placed by the
//! active strategy, and submitted to the device through a per-pool
//! single-in-flight gate. Completion accounts the I/O, feeds the block
//! commit counters, and simulates per-class device timings by
//! busy-delaying the remainder of the class target.

use crate::FtlInner;
use crate::ap::block_to_ap;
use crate::inflight::LockTag;
use crate::strategy::MappedWrite;
use nftl_error::{FtlError, Result};
use nftl_types::{ApId, EngineFlags, HOST_PAGE_SIZE, Lpn, Ppn, page_is_fast};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Delay remainders at or below this threshold are not worth spinning
/// for.
const MIN_WAIT_US: u64 = 50;

/// Attempts a host write makes before reporting out-of-space; a
/// synchronous collection pass runs between attempts.
const ALLOC_RETRIES: u32 = 3;

const READ: usize = 0;
const WRITE: usize = 1;

// ── Pool gate ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct GateQueue {
    active: bool,
    waiting: VecDeque<u64>,
    next_ticket: u64,
}

/// Single-in-flight gate for one pool.
///
/// With `POOL_SERIALIZE` set, at most one device-visible I/O runs per
/// pool; later submissions queue FIFO and are admitted one per
/// completion. Without the flag the gate still tracks activity (the
/// latency strategy reads it) but admits everyone.
#[derive(Debug, Default)]
pub(crate) struct PoolGate {
    queue: Mutex<GateQueue>,
    cond: Condvar,
    active: AtomicBool,
}

impl PoolGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Claim the gate, queueing behind earlier submissions when
    /// serialization is on. Returns whether this submission had to wait.
    pub(crate) fn enter(&self, serialize: bool) -> bool {
        if !serialize {
            self.active.store(true, Ordering::Release);
            return false;
        }

        let mut queue = self.queue.lock();
        if !queue.active && queue.waiting.is_empty() {
            queue.active = true;
            self.active.store(true, Ordering::Release);
            return false;
        }

        let ticket = queue.next_ticket;
        queue.next_ticket += 1;
        queue.waiting.push_back(ticket);
        loop {
            self.cond.wait(&mut queue);
            if !queue.active && queue.waiting.front() == Some(&ticket) {
                queue.waiting.pop_front();
                queue.active = true;
                self.active.store(true, Ordering::Release);
                return true;
            }
        }
    }

    /// Release the gate and admit the next waiter, if any.
    pub(crate) fn exit(&self, serialize: bool) {
        if !serialize {
            self.active.store(false, Ordering::Release);
            return;
        }
        let mut queue = self.queue.lock();
        queue.active = false;
        self.active.store(false, Ordering::Release);
        drop(queue);
        self.cond.notify_all();
    }

    /// Whether a device-visible I/O is outstanding on this pool.
    #[must_use]
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Force the activity flag (scheduling/test hook).
    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }
}

// ── Pipeline ────────────────────────────────────────────────────────────────

impl FtlInner {
    pub(crate) fn serialize(&self) -> bool {
        self.flags.contains(EngineFlags::POOL_SERIALIZE)
    }

    /// Busy-delay until `target_us` has elapsed since `start`, when the
    /// remaining budget is worth spinning for.
    pub(crate) fn simulate_wait(&self, start: Instant, target_us: u64) {
        if self.flags.contains(EngineFlags::NO_WAITS) || target_us == 0 {
            return;
        }
        let target = Duration::from_micros(target_us);
        let elapsed = start.elapsed();
        if target <= elapsed {
            return;
        }
        if (target - elapsed) > Duration::from_micros(MIN_WAIT_US) {
            while start.elapsed() < target {
                std::hint::spin_loop();
            }
        }
    }

    /// Write timing class for a destination page: swap-style stores halve
    /// the target on fast pages and double it on slow ones.
    fn write_wait_us(&self, addr: Ppn) -> u64 {
        let fast_slow = self
            .flags
            .intersects(EngineFlags::SWAP.union(EngineFlags::FAST_SLOW_PAGES));
        if !fast_slow {
            return self.config.t_write_us;
        }
        if page_is_fast(self.geo.flash_slot(addr), self.geo.pages_per_blk()) {
            self.config.t_write_us / 2
        } else {
            self.config.t_write_us * 2
        }
    }

    fn check_addr(&self, l: Lpn) -> Result<()> {
        if l.0 >= self.geo.nr_pages() {
            return Err(FtlError::BadAddress {
                addr: l.0,
                nr_pages: self.geo.nr_pages(),
            });
        }
        Ok(())
    }

    // ── Write path ──────────────────────────────────────────────────────

    pub(crate) fn write_page_inner(&self, l: Lpn, data: &[u8]) -> Result<()> {
        if data.len() != HOST_PAGE_SIZE {
            return Err(FtlError::Transient(format!(
                "write must be exactly one host page, got {} bytes",
                data.len()
            )));
        }
        self.check_addr(l)?;

        for attempt in 0..ALLOC_RETRIES {
            let range = self.inflight.lock(l, 1, LockTag::Host);
            match self.write_targets(l) {
                Ok(targets) => {
                    for mw in &targets {
                        self.submit_write(mw, data, false)?;
                    }
                    self.counters.host_writes.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(FtlError::OutOfSpace) if attempt + 1 < ALLOC_RETRIES => {
                    // Collection takes range locks of its own, so ours must
                    // be released before running it on this thread.
                    drop(range);
                    debug!(target: "nftl::pipeline", l = l.0, attempt, "allocation failed, collecting");
                    self.gc_collect_all();
                }
                Err(e) => return Err(e),
            }
        }
        Err(FtlError::OutOfSpace)
    }

    /// Buffer one host page into its block and program the flash page
    /// once all of its host pages are assembled. Shared by host and GC
    /// writes; the caller holds the range lock for `l`.
    pub(crate) fn submit_write(&self, mw: &MappedWrite, data: &[u8], is_gc: bool) -> Result<()> {
        let block = self.block(mw.block);
        block.ref_count.fetch_add(1, Ordering::AcqRel);

        let ap = {
            let st = block.state.lock();
            st.ap
        }
        .unwrap_or_else(|| block_to_ap(&self.geo, self.config.nr_aps_per_pool, mw.block));
        self.ap(ap).io_accesses[WRITE].fetch_add(1, Ordering::Relaxed);

        let h = self.geo.host_pages_in_flash_page();
        let flush = {
            let mut st = block.state.lock();
            let idx = self.geo.page_offset_in_blk(mw.addr) as usize;
            st.data[idx * HOST_PAGE_SIZE..(idx + 1) * HOST_PAGE_SIZE].copy_from_slice(data);
            st.data_size += 1;
            let fp = idx / h as usize;
            st.page_fill[fp] += 1;
            debug_assert!(st.page_fill[fp] as u32 <= h);
            if st.page_fill[fp] as u32 == h {
                let first = fp * h as usize;
                let flash_addr = Ppn(self.geo.block_to_addr(mw.block).0 + first as u64);
                let payload =
                    st.data[first * HOST_PAGE_SIZE..(first + h as usize) * HOST_PAGE_SIZE].to_vec();
                trace!(
                    target: "nftl::pipeline",
                    block = mw.block.0,
                    flash_page = fp,
                    buffered = st.data_size,
                    "flash_page_assembled"
                );
                Some((flash_addr, payload))
            } else {
                None
            }
        };

        let result = if let Some((flash_addr, payload)) = flush {
            let pool = self.pool(block.pool);
            if pool.gate.enter(self.serialize()) {
                self.ap(ap).io_delayed.fetch_add(1, Ordering::Relaxed);
            }
            let start = Instant::now();
            let res = self.device.write_flash_page(flash_addr, &payload);

            if res.is_ok() {
                let committed = block.data_cmnt_size.fetch_add(1, Ordering::AcqRel) + 1;
                if committed == self.geo.pages_per_blk() {
                    // Fully committed blocks are recycle candidates once
                    // their pages go stale.
                    self.kick_gc();
                }
                self.simulate_wait(start, self.write_wait_us(mw.addr));
            }
            pool.gate.exit(self.serialize());
            res
        } else {
            Ok(())
        };

        block.ref_count.fetch_sub(1, Ordering::AcqRel);
        if let Err(e) = &result {
            warn!(
                target: "nftl::pipeline",
                addr = mw.addr.0,
                is_gc,
                error = %e,
                "device write failed"
            );
        }
        result
    }

    // ── Read path ───────────────────────────────────────────────────────

    pub(crate) fn read_page_inner(&self, l: Lpn, out: &mut [u8]) -> Result<()> {
        if out.len() != HOST_PAGE_SIZE {
            return Err(FtlError::Transient(format!(
                "read must be exactly one host page, got {} bytes",
                out.len()
            )));
        }
        self.check_addr(l)?;

        let _range = self.inflight.lock(l, 1, LockTag::Host);
        self.counters.host_reads.fetch_add(1, Ordering::Relaxed);

        let entry = self.strategy_lookup(l);
        let Some(block_id) = entry.block else {
            // Never written: all zeroes, no device access.
            out.fill(0);
            return Ok(());
        };
        let block = self.block(block_id);

        let ap = {
            let st = block.state.lock();
            st.ap
        }
        .unwrap_or_else(|| block_to_ap(&self.geo, self.config.nr_aps_per_pool, block_id));
        self.ap(ap).io_accesses[READ].fetch_add(1, Ordering::Relaxed);

        // Host pages whose flash page has not been programmed yet are
        // served from the block's assembly buffer.
        let h = self.geo.host_pages_in_flash_page();
        let buffered = {
            let st = block.state.lock();
            let fp = (self.geo.flash_slot(entry.addr)) as usize;
            let idx = self.geo.page_offset_in_blk(entry.addr) as usize;
            if !st.data.is_empty() && (st.page_fill[fp] as u32) < h {
                out.copy_from_slice(&st.data[idx * HOST_PAGE_SIZE..(idx + 1) * HOST_PAGE_SIZE]);
                true
            } else {
                false
            }
        };

        let result = if buffered {
            Ok(())
        } else {
            self.device_read(ap, entry.addr, out)
        };

        block.ref_count.fetch_sub(1, Ordering::AcqRel);
        result
    }

    /// One gated, timed device read, delay-accounted against `ap`. Also
    /// used by GC relocation.
    pub(crate) fn device_read(&self, ap: ApId, addr: Ppn, out: &mut [u8]) -> Result<()> {
        let pool = self.pool(self.geo.pool_of_addr(addr));
        if pool.gate.enter(self.serialize()) {
            self.ap(ap).io_delayed.fetch_add(1, Ordering::Relaxed);
        }
        let start = Instant::now();
        let res = self.device.read_page(addr, out);
        if res.is_ok() {
            self.simulate_wait(start, self.config.t_read_us);
        }
        pool.gate.exit(self.serialize());
        res
    }
}
