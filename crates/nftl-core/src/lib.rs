#![forbid(unsafe_code)]
//! Flash translation layer engine.
//!
//! [`FtlStore`] presents a conventional page-addressed block front end on
//! top of a raw NAND-like device: out-of-place writes through per-pool
//! append points, a primary (and optionally shadow) logical-to-physical
//! map, hint-driven placement strategies, and a background garbage
//! collector.
//!
//! ## Lock order
//!
//! Acquired outermost first; no lock except the inflight range lock is
//! held across device I/O:
//!
//! 1. per-pool GC lock (collection passes only)
//! 2. global mapping lock
//! 3. per-AP lock
//! 4. per-pool block-list lock
//! 5. per-block lock
//! 6. per-shard inflight lock (leaf)

mod ap;
mod gc;
mod hint;
mod inflight;
mod map;
mod pipeline;
mod pool;
mod strategy;

pub use gc::GcDaemon;
pub use hint::classify_first_sector;
pub use map::{MapEntry, MapTarget};

use crate::ap::AppendPoint;
use crate::gc::GcSignal;
use crate::hint::HintStore;
use crate::inflight::RangeLock;
use crate::map::MappingTable;
use crate::pool::{Pool, bitmap_count_set};
use nftl_device::{DeviceIdentity, NandDevice};
use nftl_error::{FtlError, Result};
use nftl_types::{
    ApId, BlockId, EngineFlags, FtlConfig, Geometry, HOST_PAGE_SIZE, HintPayload, Lpn,
    NR_PHY_IN_LOG, PlacementMode, PoolId, Ppn,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

// ── Counters and metrics ────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct StoreCounters {
    pub host_reads: AtomicU64,
    pub host_writes: AtomicU64,
    pub gc_moved_pages: AtomicU64,
    pub gc_reclaimed_blocks: AtomicU64,
}

/// Per-AP accounting, in AP order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApIo {
    pub reads: u64,
    pub writes: u64,
    /// Submissions through this AP that queued behind a busy pool.
    pub delayed: u64,
}

/// Point-in-time counters of the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metrics {
    pub host_reads: u64,
    pub host_writes: u64,
    pub gc_moved_pages: u64,
    pub gc_reclaimed_blocks: u64,
    /// Total delayed submissions, summed over `aps`.
    pub io_delayed: u64,
    pub free_blocks: u32,
    pub aps: Vec<ApIo>,
}

/// Snapshot of one pool's block lists, for observability and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolListSnapshot {
    pub free: Vec<BlockId>,
    pub used: Vec<BlockId>,
    pub prio: Vec<BlockId>,
    pub quarantined: Vec<BlockId>,
}

/// Control-channel commands carrying a [`HintPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintCommand {
    /// Direct submission from an application.
    SubmitHint,
    /// Submission from an in-kernel classifier.
    KernelHint,
}

// ── Store ───────────────────────────────────────────────────────────────────

pub(crate) struct FtlInner {
    pub(crate) config: FtlConfig,
    pub(crate) geo: Geometry,
    pub(crate) flags: EngineFlags,
    pub(crate) device: Arc<dyn NandDevice>,
    pub(crate) pools: Vec<Pool>,
    pub(crate) aps: Vec<AppendPoint>,
    pub(crate) map: MappingTable,
    pub(crate) inflight: RangeLock,
    pub(crate) hints: HintStore,
    pub(crate) next_write_ap: AtomicU64,
    pub(crate) counters: StoreCounters,
    pub(crate) gc_signal: GcSignal,
}

impl FtlInner {
    pub(crate) fn pool(&self, id: PoolId) -> &Pool {
        &self.pools[id.0 as usize]
    }

    pub(crate) fn ap(&self, id: ApId) -> &AppendPoint {
        &self.aps[id.0 as usize]
    }

    pub(crate) fn block(&self, id: BlockId) -> &pool::Block {
        pool::block_ref(&self.pools, &self.geo, id)
    }
}

/// The flash translation layer store.
///
/// Cheap to share: the engine state lives behind an `Arc` also held by
/// the GC daemon.
pub struct FtlStore {
    inner: Arc<FtlInner>,
}

impl FtlStore {
    /// Build a store over `device` with the given configuration.
    ///
    /// Every append point acquires a current block and an emergency GC
    /// block up front, so each pool needs at least
    /// `2 · nr_aps_per_pool + 1` blocks.
    pub fn new(config: FtlConfig, device: Arc<dyn NandDevice>) -> Result<Self> {
        let geo = config.geometry()?;
        let flags = config.effective_flags();

        let pools: Vec<Pool> = (0..geo.nr_pools())
            .map(|i| Pool::new(PoolId(i), &geo))
            .collect();

        let mut aps = Vec::with_capacity(config.nr_aps() as usize);
        for pool in &pools {
            for j in 0..config.nr_aps_per_pool {
                let id = ApId(pool.id.0 * config.nr_aps_per_pool + j);
                // The last AP of each pool is reserved for pack-hinted
                // writes, but only when the pool has another AP left for
                // everything else.
                let is_pack = config.mode == PlacementMode::Pack
                    && config.nr_aps_per_pool > 1
                    && j == config.nr_aps_per_pool - 1;
                let ap = AppendPoint::new(id, pool.id, is_pack);

                let cur = pool.get_block(&geo, false).ok_or(FtlError::OutOfSpace)?;
                let gc_cur = pool.get_block(&geo, true).ok_or(FtlError::OutOfSpace)?;
                {
                    let mut state = ap.state.lock();
                    ap::set_ap_cur(&ap, &mut state, pool, cur);
                    state.gc_cur = Some(gc_cur);
                }
                aps.push(ap);
            }
        }

        let inner = Arc::new(FtlInner {
            map: MappingTable::new(geo, config.mode == PlacementMode::Latency),
            hints: HintStore::new(flags),
            inflight: RangeLock::new(),
            next_write_ap: AtomicU64::new(0),
            counters: StoreCounters::default(),
            gc_signal: GcSignal::default(),
            geo,
            flags,
            device,
            pools,
            aps,
            config,
        });

        info!(
            target: "nftl::store",
            pools = inner.geo.nr_pools(),
            blks_per_pool = inner.geo.blks_per_pool(),
            pages_per_blk = inner.geo.pages_per_blk(),
            host_pages_in_flash_page = inner.geo.host_pages_in_flash_page(),
            nr_pages = inner.geo.nr_pages(),
            aps = inner.aps.len(),
            mode = ?inner.config.mode,
            "store initialized"
        );
        Ok(Self { inner })
    }

    /// Spawn the periodic collection daemon for this store.
    pub fn start_gc_daemon(&self) -> Result<GcDaemon> {
        GcDaemon::spawn(Arc::clone(&self.inner))
            .map_err(|e| FtlError::Transient(format!("cannot spawn gc daemon: {e}")))
    }

    #[must_use]
    pub fn config(&self) -> &FtlConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.inner.geo
    }

    #[must_use]
    pub fn nr_pages(&self) -> u64 {
        self.inner.geo.nr_pages()
    }

    // ── Host I/O ────────────────────────────────────────────────────────

    /// Write one host page at logical page `l`.
    pub fn write_page(&self, l: Lpn, data: &[u8]) -> Result<()> {
        self.inner.write_page_inner(l, data)
    }

    /// Read one host page at logical page `l` into `out`.
    pub fn read_page_into(&self, l: Lpn, out: &mut [u8]) -> Result<()> {
        self.inner.read_page_inner(l, out)
    }

    /// Read one host page at logical page `l`.
    pub fn read_page(&self, l: Lpn) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; HOST_PAGE_SIZE];
        self.read_page_into(l, &mut buf)?;
        Ok(buf)
    }

    fn sector_to_lpn(&self, sector: u64) -> Result<Lpn> {
        if sector % NR_PHY_IN_LOG != 0 {
            return Err(FtlError::Transient(format!(
                "sector {sector} not aligned to {NR_PHY_IN_LOG}-sector host pages"
            )));
        }
        Ok(Lpn(sector / NR_PHY_IN_LOG))
    }

    /// Write one host page at a 512-byte sector address. The sector must
    /// be host-page aligned and `data` exactly one host page.
    pub fn write_sector(&self, sector: u64, data: &[u8]) -> Result<()> {
        let l = self.sector_to_lpn(sector)?;
        self.write_page(l, data)
    }

    /// Read one host page at a 512-byte sector address.
    pub fn read_sector(&self, sector: u64) -> Result<Vec<u8>> {
        let l = self.sector_to_lpn(sector)?;
        self.read_page(l)
    }

    // ── Hint channel ────────────────────────────────────────────────────

    /// Submit a decoded hint payload.
    pub fn submit_hint(&self, payload: &HintPayload) -> Result<()> {
        self.inner.hints.submit(payload)
    }

    /// Decode and dispatch a raw control-channel command.
    pub fn hint_cmd(&self, cmd: HintCommand, payload: &[u8]) -> Result<()> {
        let payload = HintPayload::decode(payload)?;
        match cmd {
            HintCommand::SubmitHint | HintCommand::KernelHint => self.submit_hint(&payload),
        }
    }

    // ── GC ──────────────────────────────────────────────────────────────

    /// Nudge the daemon to run a collection pass soon.
    pub fn gc_kick(&self) {
        self.inner.kick_gc();
    }

    /// Run one synchronous collection pass over every pool. Returns the
    /// number of blocks reclaimed.
    pub fn run_gc_cycle(&self) -> usize {
        self.inner.gc_collect_all()
    }

    // ── Introspection ───────────────────────────────────────────────────

    #[must_use]
    pub fn metrics(&self) -> Metrics {
        let c = &self.inner.counters;
        Metrics {
            host_reads: c.host_reads.load(Ordering::Relaxed),
            host_writes: c.host_writes.load(Ordering::Relaxed),
            gc_moved_pages: c.gc_moved_pages.load(Ordering::Relaxed),
            gc_reclaimed_blocks: c.gc_reclaimed_blocks.load(Ordering::Relaxed),
            io_delayed: self
                .inner
                .aps
                .iter()
                .map(|ap| ap.io_delayed.load(Ordering::Relaxed))
                .sum(),
            free_blocks: self.inner.pools.iter().map(Pool::free_blocks).sum(),
            aps: self
                .inner
                .aps
                .iter()
                .map(|ap| ApIo {
                    reads: ap.io_accesses[0].load(Ordering::Relaxed),
                    writes: ap.io_accesses[1].load(Ordering::Relaxed),
                    delayed: ap.io_delayed.load(Ordering::Relaxed),
                })
                .collect(),
        }
    }

    /// Current primary translation of `l`, if any.
    #[must_use]
    pub fn l2p(&self, l: Lpn) -> Option<(Ppn, BlockId)> {
        let entry = self.inner.map.peek(MapTarget::Primary, l);
        entry.block.map(|b| (entry.addr, b))
    }

    /// Current shadow translation of `l`, if any (latency mode).
    #[must_use]
    pub fn shadow_l2p(&self, l: Lpn) -> Option<(Ppn, BlockId)> {
        let entry = self.inner.map.peek(MapTarget::Shadow, l);
        entry.block.map(|b| (entry.addr, b))
    }

    /// Reverse translation of a physical page; `None` when unused or
    /// stale.
    #[must_use]
    pub fn p2l(&self, p: Ppn) -> Option<Lpn> {
        self.inner.map.lookup_ptol(p)
    }

    /// Invalid-page count of a block, as tracked by its bitmap.
    #[must_use]
    pub fn block_invalid_pages(&self, block: BlockId) -> (u32, u32) {
        let st = self.inner.block(block).state.lock();
        let counted = bitmap_count_set(&st.invalid_pages, self.inner.geo.host_pages_in_blk());
        (st.nr_invalid_pages, counted)
    }

    /// Whether the invalid bit for a physical page is set in its block's
    /// bitmap.
    #[must_use]
    pub fn page_is_invalid(&self, p: Ppn) -> bool {
        let block = self.inner.geo.addr_to_block(p);
        let offset = self.inner.geo.page_offset_in_blk(p);
        let st = self.inner.block(block).state.lock();
        pool::bitmap_get(&st.invalid_pages, offset)
    }

    #[must_use]
    pub fn pool_free_blocks(&self, pool: PoolId) -> u32 {
        self.inner.pool(pool).free_blocks()
    }

    /// Snapshot of a pool's block lists.
    #[must_use]
    pub fn pool_lists(&self, pool: PoolId) -> PoolListSnapshot {
        let lists = self.inner.pool(pool).lists.lock();
        PoolListSnapshot {
            free: lists.free.iter().copied().collect(),
            used: lists.used.clone(),
            prio: lists.prio.clone(),
            quarantined: lists.quarantined.clone(),
        }
    }

    /// Force a pool's activity flag; lets schedulers (and tests) steer
    /// the latency strategy's busy detection.
    #[doc(hidden)]
    pub fn set_pool_active(&self, pool: PoolId, active: bool) {
        self.inner.pool(pool).gate.set_active(active);
    }
}

/// Fill a configuration's geometry and timing fields from a device's
/// identify data.
pub fn config_from_identity(mut base: FtlConfig, id: &DeviceIdentity) -> Result<FtlConfig> {
    let geo = id.geometry()?;
    let chan = &id.channels[0];
    base.nr_pools = geo.nr_pools();
    base.nr_blks_per_pool = geo.blks_per_pool();
    base.nr_pages_per_blk = geo.pages_per_blk();
    base.nr_host_pages_in_flash_page = geo.host_pages_in_flash_page();
    base.t_read_us = chan.t_r_ns / 1000;
    base.t_write_us = chan.t_w_ns / 1000;
    base.t_erase_us = chan.t_e_ns / 1000;
    Ok(base)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use nftl_device::MemNandDevice;

    fn small_config() -> FtlConfig {
        FtlConfig {
            nr_pools: 2,
            nr_blks_per_pool: 8,
            nr_pages_per_blk: 4,
            nr_host_pages_in_flash_page: 1,
            flags: EngineFlags::NO_WAITS,
            ..FtlConfig::default()
        }
    }

    fn store(config: FtlConfig) -> FtlStore {
        let geo = config.geometry().unwrap();
        let device = Arc::new(MemNandDevice::new(geo, 25, 500, 1500));
        FtlStore::new(config, device).unwrap()
    }

    #[test]
    fn construction_primes_append_points() {
        let store = store(small_config());
        // Each pool gave out a current and an emergency block.
        assert_eq!(store.pool_free_blocks(PoolId(0)), 6);
        assert_eq!(store.pool_free_blocks(PoolId(1)), 6);
        assert_eq!(store.metrics().free_blocks, 12);
    }

    #[test]
    fn construction_fails_when_pool_cannot_seed_aps() {
        let config = FtlConfig {
            nr_blks_per_pool: 1,
            ..small_config()
        };
        let geo = config.geometry().unwrap();
        let device = Arc::new(MemNandDevice::new(geo, 25, 500, 1500));
        assert!(matches!(
            FtlStore::new(config, device),
            Err(FtlError::OutOfSpace)
        ));
    }

    #[test]
    fn sector_interface_requires_alignment() {
        let store = store(small_config());
        let page = vec![3_u8; HOST_PAGE_SIZE];
        assert!(store.write_sector(8, &page).is_ok());
        assert!(matches!(
            store.write_sector(9, &page),
            Err(FtlError::Transient(_))
        ));
        assert_eq!(store.read_sector(8).unwrap(), page);
    }

    #[test]
    fn out_of_range_addresses_are_rejected() {
        let store = store(small_config());
        let page = vec![0_u8; HOST_PAGE_SIZE];
        let n = store.nr_pages();
        assert!(matches!(
            store.write_page(Lpn(n), &page),
            Err(FtlError::BadAddress { .. })
        ));
        assert!(matches!(
            store.read_page(Lpn(n)),
            Err(FtlError::BadAddress { .. })
        ));
    }

    #[test]
    fn short_writes_are_transient_errors() {
        let store = store(small_config());
        assert!(matches!(
            store.write_page(Lpn(0), &[0_u8; 512]),
            Err(FtlError::Transient(_))
        ));
    }

    #[test]
    fn config_from_identity_matches_device() {
        let geo = Geometry::new(4, 8, 16, 2).unwrap();
        let device = MemNandDevice::new(geo, 30, 600, 2000);
        let config = config_from_identity(FtlConfig::default(), &device.identify()).unwrap();
        assert_eq!(config.nr_pools, 4);
        assert_eq!(config.nr_blks_per_pool, 8);
        assert_eq!(config.nr_pages_per_blk, 16);
        assert_eq!(config.nr_host_pages_in_flash_page, 2);
        assert_eq!(config.t_read_us, 30);
        assert_eq!(config.t_write_us, 600);
        assert_eq!(config.t_erase_us, 2000);
    }

    #[test]
    fn hint_cmd_decodes_and_dispatches() {
        let config = FtlConfig {
            mode: PlacementMode::Swap,
            ..small_config()
        };
        let store = store(config);
        let payload = HintPayload {
            lba: 5,
            sectors_count: 8,
            is_write: true,
            hint_flags: EngineFlags::SWAP,
            entries: vec![nftl_types::InoHint {
                ino: nftl_types::InodeNumber(0),
                start_lba: 5,
                count: 1,
                class: nftl_types::FileClass::Empty,
            }],
        };
        store
            .hint_cmd(HintCommand::SubmitHint, &payload.encode())
            .unwrap();
        assert!(matches!(
            store.hint_cmd(HintCommand::KernelHint, &[1, 2, 3]),
            Err(FtlError::Wire(_))
        ));
    }
}
