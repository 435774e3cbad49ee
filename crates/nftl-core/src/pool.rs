//! Block and pool store.
//!
//! A pool models one flash channel and owns a contiguous range of blocks.
//! Blocks move between three lists: *free* (erased, ready), *used*
//! (currently written into), and *priority* (GC candidates, a subset of
//! used). The free list is consumed at the head and refilled at the tail,
//! which yields naive round-robin wear leveling.

use crate::pipeline::PoolGate;
use nftl_types::{ApId, BlockId, Geometry, HOST_PAGE_SIZE, PoolId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::trace;

// ── Bitmap helpers ──────────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub(crate) fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    byte_idx < bitmap.len() && (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx`, returning its previous value.
pub(crate) fn bitmap_test_and_set(bitmap: &mut [u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    let was = (bitmap[byte_idx] >> bit_idx) & 1 == 1;
    bitmap[byte_idx] |= 1 << bit_idx;
    was
}

/// Count set bits in the first `count` bits of `bitmap`.
#[must_use]
pub(crate) fn bitmap_count_set(bitmap: &[u8], count: u32) -> u32 {
    (0..count).filter(|&idx| bitmap_get(bitmap, idx)).count() as u32
}

/// First zero bit at or after `start` within the first `count` bits.
#[must_use]
pub(crate) fn bitmap_find_zero(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    (start..count).find(|&idx| !bitmap_get(bitmap, idx))
}

/// Whether the first `count` bits are all set.
#[must_use]
pub(crate) fn bitmap_is_full(bitmap: &[u8], count: u32) -> bool {
    bitmap_find_zero(bitmap, count, 0).is_none()
}

// ── Block ───────────────────────────────────────────────────────────────────

/// Cursor and validity state of a block, guarded by the block lock.
#[derive(Debug)]
pub(crate) struct BlockState {
    /// Next writable flash page within the block.
    pub next_page: u32,
    /// Host-page offset within the current flash page; a flash page is
    /// filled before the cursor advances.
    pub next_offset: u32,
    /// Invalid host pages, with respect to host page size.
    pub nr_invalid_pages: u32,
    /// One bit per host page; set when the page went stale.
    pub invalid_pages: Vec<u8>,
    /// Host pages buffered until their flash page is programmed. Empty
    /// while the block sits on the free list.
    pub data: Vec<u8>,
    /// Host pages buffered into `data` so far.
    pub data_size: u32,
    /// Buffered host pages per flash page; a flash page is programmed
    /// when its count reaches H.
    pub page_fill: Vec<u8>,
    /// Owning append point while this block is some AP's current block.
    pub ap: Option<ApId>,
}

#[derive(Debug)]
pub(crate) struct Block {
    pub id: BlockId,
    pub pool: PoolId,
    pub state: Mutex<BlockState>,
    /// Flash pages committed to the device.
    pub data_cmnt_size: AtomicU32,
    pub gc_running: AtomicBool,
    /// Outstanding I/Os against this block.
    pub ref_count: AtomicU32,
}

impl Block {
    fn new(id: BlockId, pool: PoolId, geo: &Geometry) -> Self {
        let bitmap_bytes = geo.host_pages_in_blk().div_ceil(8) as usize;
        Self {
            id,
            pool,
            state: Mutex::new(BlockState {
                next_page: 0,
                next_offset: 0,
                nr_invalid_pages: 0,
                invalid_pages: vec![0; bitmap_bytes],
                data: Vec::new(),
                data_size: 0,
                page_fill: vec![0; geo.pages_per_blk() as usize],
                ap: None,
            }),
            data_cmnt_size: AtomicU32::new(0),
            gc_running: AtomicBool::new(false),
            ref_count: AtomicU32::new(0),
        }
    }

    /// Whether the write cursor has consumed every host page.
    #[must_use]
    pub(crate) fn state_is_full(state: &BlockState, geo: &Geometry) -> bool {
        state.next_page * geo.host_pages_in_flash_page() + state.next_offset
            == geo.host_pages_in_blk()
    }

    #[must_use]
    pub(crate) fn is_full(&self, geo: &Geometry) -> bool {
        Self::state_is_full(&self.state.lock(), geo)
    }

    /// Return the block to its erased state. Idempotent on an
    /// already-reset block.
    pub(crate) fn reset(&self) {
        let mut st = self.state.lock();
        st.invalid_pages.fill(0);
        st.next_page = 0;
        st.next_offset = 0;
        st.nr_invalid_pages = 0;
        st.data = Vec::new();
        st.data_size = 0;
        st.page_fill.fill(0);
        st.ap = None;
        drop(st);
        self.data_cmnt_size.store(0, Ordering::Release);
        self.gc_running.store(false, Ordering::Release);
        debug_assert_eq!(self.ref_count.load(Ordering::Acquire), 0);
    }
}

// ── Pool ────────────────────────────────────────────────────────────────────

/// The three block lists of a pool, guarded by the pool list lock.
#[derive(Debug, Default)]
pub(crate) struct PoolLists {
    pub free: VecDeque<BlockId>,
    /// Append-only in write order; the head is the oldest block.
    pub used: Vec<BlockId>,
    /// GC candidates; always a subset of `used`.
    pub prio: Vec<BlockId>,
    /// Blocks retired after an erase failure. Never reused.
    pub quarantined: Vec<BlockId>,
}

#[derive(Debug)]
pub(crate) struct Pool {
    pub id: PoolId,
    pub nr_blocks: u32,
    pub blocks: Vec<Block>,
    pub lists: Mutex<PoolLists>,
    pub nr_free_blocks: AtomicU32,
    /// Held for the duration of a collection pass over this pool.
    pub gc_lock: Mutex<()>,
    /// Single-in-flight gate for device access to this pool.
    pub gate: PoolGate,
}

impl Pool {
    pub(crate) fn new(id: PoolId, geo: &Geometry) -> Self {
        let range = geo.pool_blocks(id);
        let nr_blocks = range.len() as u32;
        let blocks: Vec<Block> = range
            .clone()
            .map(|blk| Block::new(BlockId(blk), id, geo))
            .collect();
        let lists = PoolLists {
            free: range.map(BlockId).collect(),
            ..PoolLists::default()
        };
        Self {
            id,
            nr_blocks,
            blocks,
            lists: Mutex::new(lists),
            nr_free_blocks: AtomicU32::new(nr_blocks),
            gc_lock: Mutex::new(()),
            gate: PoolGate::new(),
        }
    }

    pub(crate) fn block(&self, id: BlockId) -> &Block {
        let local = id.0 - self.blocks[0].id.0;
        &self.blocks[local as usize]
    }

    /// Move the head of the free list onto used + priority and hand it
    /// out. Block state is reset outside the list lock; the data buffer is
    /// allocated here and freed on `put_block`.
    pub(crate) fn get_block(&self, geo: &Geometry, is_gc: bool) -> Option<BlockId> {
        let id = {
            let mut lists = self.lists.lock();
            let id = lists.free.pop_front()?;
            lists.used.push(id);
            lists.prio.push(id);
            self.nr_free_blocks.fetch_sub(1, Ordering::AcqRel);
            id
        };

        let block = self.block(id);
        block.reset();
        {
            let mut st = block.state.lock();
            st.data = vec![0; geo.host_pages_in_blk() as usize * HOST_PAGE_SIZE];
        }
        trace!(
            target: "nftl::pool",
            pool = self.id.0,
            block = id.0,
            is_gc,
            free_left = self.nr_free_blocks.load(Ordering::Acquire),
            "block_acquired"
        );
        Some(id)
    }

    /// Return a fully-invalidated, erased block to the tail of the free
    /// list. Requires no outstanding references and GC not running.
    pub(crate) fn put_block(&self, geo: &Geometry, id: BlockId) {
        let block = self.block(id);
        debug_assert_eq!(block.ref_count.load(Ordering::Acquire), 0);
        debug_assert!(!block.gc_running.load(Ordering::Acquire));

        // Re-putting a block that is already free is a no-op.
        if self.lists.lock().free.contains(&id) {
            return;
        }

        // No reachable mapping entry may survive release: every host page
        // must have been invalidated before the block leaves used.
        debug_assert!(
            bitmap_is_full(&block.state.lock().invalid_pages, geo.host_pages_in_blk()),
            "block released with live pages"
        );

        // Reset before the block becomes visible on the free list; a
        // concurrent get_block may hand it out immediately after.
        block.reset();

        let mut lists = self.lists.lock();
        lists.used.retain(|&b| b != id);
        lists.prio.retain(|&b| b != id);
        if !lists.free.contains(&id) {
            lists.free.push_back(id);
            self.nr_free_blocks.fetch_add(1, Ordering::AcqRel);
        }
        drop(lists);
        trace!(target: "nftl::pool", pool = self.id.0, block = id.0, "block_released");
    }

    /// Remove a block from circulation after an erase failure.
    pub(crate) fn quarantine_block(&self, id: BlockId) {
        let mut lists = self.lists.lock();
        lists.used.retain(|&b| b != id);
        lists.prio.retain(|&b| b != id);
        lists.quarantined.push(id);
    }

    #[must_use]
    pub(crate) fn free_blocks(&self) -> u32 {
        self.nr_free_blocks.load(Ordering::Acquire)
    }
}

/// Resolve a block id to its `Block` across the pool array.
#[must_use]
pub(crate) fn block_ref<'a>(pools: &'a [Pool], geo: &Geometry, id: BlockId) -> &'a Block {
    pools[geo.pool_of_block(id).0 as usize].block(id)
}

// ── Tests ───────────────────────────────────────────────────────────────────
