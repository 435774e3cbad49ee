//! Append points.
//!
//! An append point (AP) is a logical writer owning a current block in one
//! pool; page allocation walks the block's cursor and pulls a fresh block
//! from the pool when the current one fills. Each AP also pre-acquires an
//! emergency block reserved for GC relocation writes.

use crate::pool::{Block, Pool};
use nftl_error::{FtlError, Result};
use nftl_types::{ApId, BlockId, Geometry, InodeNumber, PoolId, Ppn, page_is_fast};
use parking_lot::Mutex;
use std::sync::atomic::AtomicU64;
use std::time::Instant;
use tracing::{debug, trace};

/// Current and emergency blocks of an AP, guarded by the AP lock.
#[derive(Debug)]
pub(crate) struct ApState {
    pub cur: Option<BlockId>,
    /// Emergency GC block, consumed when the pool has nothing left.
    pub gc_cur: Option<BlockId>,
}

/// Inode affinity of a pack-reserved AP.
#[derive(Debug)]
pub(crate) struct PackAssoc {
    pub ino: Option<InodeNumber>,
    pub last_use: Instant,
}

#[derive(Debug)]
pub(crate) struct AppendPoint {
    pub id: ApId,
    pub pool: PoolId,
    pub state: Mutex<ApState>,
    /// `Some` iff this AP is reserved for pack-hinted writes.
    pub pack: Option<Mutex<PackAssoc>>,
    /// Semi-accurate read/write counters (no lock, like the rest of the
    /// accounting).
    pub io_accesses: [AtomicU64; 2],
    /// Submissions through this AP that queued behind a busy pool.
    pub io_delayed: AtomicU64,
}

impl AppendPoint {
    pub(crate) fn new(id: ApId, pool: PoolId, is_pack: bool) -> Self {
        Self {
            id,
            pool,
            state: Mutex::new(ApState {
                cur: None,
                gc_cur: None,
            }),
            pack: is_pack.then(|| {
                Mutex::new(PackAssoc {
                    ino: None,
                    last_use: Instant::now(),
                })
            }),
            io_accesses: [AtomicU64::new(0), AtomicU64::new(0)],
            io_delayed: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub(crate) fn is_pack(&self) -> bool {
        self.pack.is_some()
    }
}

/// Static block→AP attribution used for I/O accounting: blocks are
/// partitioned evenly among the pool's APs.
#[must_use]
pub(crate) fn block_to_ap(geo: &Geometry, nr_aps_per_pool: u32, block: BlockId) -> ApId {
    let pool = block.0 / geo.blks_per_pool();
    let local = block.0 % geo.blks_per_pool();
    let span = (geo.blks_per_pool() / nr_aps_per_pool).max(1);
    let within = (local / span).min(nr_aps_per_pool - 1);
    ApId(pool * nr_aps_per_pool + within)
}

/// Allocate the next host page of `block`.
///
/// Returns `None` when the block is full, or — under `req_fast` — when
/// the cursor would have to advance onto a slow flash page. When a flash
/// page holds several host pages the offset walks the flash page before
/// the page cursor advances.
pub(crate) fn alloc_phys_addr(geo: &Geometry, block: &Block, req_fast: bool) -> Option<Ppn> {
    let h = geo.host_pages_in_flash_page();
    let mut st = block.state.lock();

    if Block::state_is_full(&st, geo) {
        return None;
    }
    if st.next_offset == h {
        if req_fast && !page_is_fast(st.next_page + 1, geo.pages_per_blk()) {
            return None;
        }
        st.next_offset = 0;
        st.next_page += 1;
    } else if req_fast && !page_is_fast(st.next_page, geo.pages_per_blk()) {
        return None;
    }

    let addr = Ppn(
        geo.block_to_addr(block.id).0
            + u64::from(st.next_page * h)
            + u64::from(st.next_offset),
    );
    st.next_offset += 1;
    Some(addr)
}

/// Swap in a new current block, clearing the old block's back-reference
/// before installing the new one.
pub(crate) fn set_ap_cur(ap: &AppendPoint, state: &mut ApState, pool: &Pool, new_block: BlockId) {
    if let Some(old) = state.cur.take() {
        let mut st = pool.block(old).state.lock();
        st.ap = None;
    }
    pool.block(new_block).state.lock().ap = Some(ap.id);
    state.cur = Some(new_block);
    trace!(target: "nftl::ap", ap = ap.id.0, block = new_block.0, "ap_cur_installed");
}

/// Outcome of [`alloc_from_ap`].
pub(crate) struct ApAlloc {
    pub addr: Ppn,
    pub block: BlockId,
    /// Whether the AP retired its previous current block to satisfy this
    /// allocation.
    pub rotated: bool,
}

/// Allocate from the AP's current block, pulling fresh blocks from the
/// pool as blocks fill. For GC allocations the pre-reserved emergency
/// block is the last resort once the pool is exhausted.
pub(crate) fn alloc_from_ap(
    geo: &Geometry,
    ap: &AppendPoint,
    pool: &Pool,
    is_gc: bool,
) -> Result<ApAlloc> {
    let mut state = ap.state.lock();
    let mut rotated = false;

    if let Some(cur) = state.cur {
        if let Some(addr) = alloc_phys_addr(geo, pool.block(cur), false) {
            return Ok(ApAlloc {
                addr,
                block: cur,
                rotated,
            });
        }
    }

    loop {
        match pool.get_block(geo, is_gc) {
            Some(fresh) => {
                set_ap_cur(ap, &mut state, pool, fresh);
                rotated = true;
                if let Some(addr) = alloc_phys_addr(geo, pool.block(fresh), false) {
                    return Ok(ApAlloc {
                        addr,
                        block: fresh,
                        rotated,
                    });
                }
            }
            None if is_gc => {
                // Fall back to the emergency block reserved at init.
                if let Some(gc_cur) = state.gc_cur {
                    if let Some(addr) = alloc_phys_addr(geo, pool.block(gc_cur), false) {
                        return Ok(ApAlloc {
                            addr,
                            block: gc_cur,
                            rotated,
                        });
                    }
                    debug!(target: "nftl::ap", ap = ap.id.0, "emergency gc block exhausted");
                }
                return Err(FtlError::OutOfSpace);
            }
            None => return Err(FtlError::OutOfSpace),
        }
    }
}

/// Try the AP's current block under the fast-page predicate only; no
/// block rotation.
pub(crate) fn try_alloc_fast(geo: &Geometry, ap: &AppendPoint, pool: &Pool) -> Option<ApAlloc> {
    let state = ap.state.lock();
    let cur = state.cur?;
    alloc_phys_addr(geo, pool.block(cur), true).map(|addr| ApAlloc {
        addr,
        block: cur,
        rotated: false,
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(h: u32) -> (Geometry, Pool, AppendPoint) {
        let geo = Geometry::new(1, 4, 4, h).unwrap();
        let pool = Pool::new(PoolId(0), &geo);
        let ap = AppendPoint::new(ApId(0), PoolId(0), false);
        (geo, pool, ap)
    }

    #[test]
    fn block_addresses_are_sequential() {
        let (geo, pool, _) = setup(1);
        let id = pool.get_block(&geo, false).unwrap();
        let block = pool.block(id);
        for want in 0..4 {
            assert_eq!(alloc_phys_addr(&geo, block, false), Some(Ppn(want)));
        }
        assert_eq!(alloc_phys_addr(&geo, block, false), None, "block full");
    }

    #[test]
    fn offset_fills_flash_page_before_advancing() {
        let (geo, pool, _) = setup(2);
        let id = pool.get_block(&geo, false).unwrap();
        let block = pool.block(id);
        for want in 0..8 {
            assert_eq!(alloc_phys_addr(&geo, block, false), Some(Ppn(want)));
        }
        assert_eq!(alloc_phys_addr(&geo, block, false), None);
        let st = block.state.lock();
        assert_eq!(st.next_page, 3);
        assert_eq!(st.next_offset, 2);
    }

    #[test]
    fn alloc_from_ap_rotates_blocks_until_pool_empty() {
        let (geo, pool, ap) = setup(1);
        let mut seen = Vec::new();
        // 4 blocks × 4 pages.
        for _ in 0..16 {
            let alloc = alloc_from_ap(&geo, &ap, &pool, false).unwrap();
            seen.push(alloc.addr);
        }
        assert!(matches!(
            alloc_from_ap(&geo, &ap, &pool, false),
            Err(FtlError::OutOfSpace)
        ));
        // All addresses distinct.
        let mut dedup = seen.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(dedup.len(), 16);
    }

    #[test]
    fn retired_block_loses_its_back_reference() {
        let (geo, pool, ap) = setup(1);
        let first = alloc_from_ap(&geo, &ap, &pool, false).unwrap().block;
        assert_eq!(pool.block(first).state.lock().ap, Some(ApId(0)));
        for _ in 0..4 {
            let _ = alloc_from_ap(&geo, &ap, &pool, false).unwrap();
        }
        let second = ap.state.lock().cur.unwrap();
        assert_ne!(first, second);
        assert_eq!(pool.block(first).state.lock().ap, None);
        assert_eq!(pool.block(second).state.lock().ap, Some(ApId(0)));
    }

    #[test]
    fn gc_alloc_falls_back_to_emergency_block() {
        let (geo, pool, ap) = setup(1);
        let gc_block = pool.get_block(&geo, true).unwrap();
        ap.state.lock().gc_cur = Some(gc_block);

        // Drain the pool through the AP.
        for _ in 0..12 {
            let _ = alloc_from_ap(&geo, &ap, &pool, false).unwrap();
        }
        assert!(matches!(
            alloc_from_ap(&geo, &ap, &pool, false),
            Err(FtlError::OutOfSpace)
        ));

        let alloc = alloc_from_ap(&geo, &ap, &pool, true).unwrap();
        assert_eq!(alloc.block, gc_block);
    }

    #[test]
    fn fast_allocation_refuses_slow_pages() {
        // 16 flash pages so the pattern has a middle section.
        let geo = Geometry::new(1, 2, 16, 1).unwrap();
        let pool = Pool::new(PoolId(0), &geo);
        let id = pool.get_block(&geo, false).unwrap();
        let block = pool.block(id);

        // Pages 0..4 are fast.
        for want in 0..4 {
            assert_eq!(alloc_phys_addr(&geo, block, true), Some(Ppn(want)));
        }
        // Page 4 is slow: fast allocation refuses, normal allocation takes it.
        assert_eq!(alloc_phys_addr(&geo, block, true), None);
        assert_eq!(alloc_phys_addr(&geo, block, false), Some(Ppn(4)));
        assert_eq!(alloc_phys_addr(&geo, block, false), Some(Ppn(5)));
        // Page 6 is fast again.
        assert_eq!(alloc_phys_addr(&geo, block, true), Some(Ppn(6)));
    }

    #[test]
    fn block_to_ap_partitions_blocks() {
        let geo = Geometry::new(2, 4, 4, 1).unwrap();
        assert_eq!(block_to_ap(&geo, 2, BlockId(0)), ApId(0));
        assert_eq!(block_to_ap(&geo, 2, BlockId(1)), ApId(0));
        assert_eq!(block_to_ap(&geo, 2, BlockId(2)), ApId(1));
        assert_eq!(block_to_ap(&geo, 2, BlockId(5)), ApId(2));
        assert_eq!(block_to_ap(&geo, 2, BlockId(7)), ApId(3));
    }
}
