#![forbid(unsafe_code)]
//! NAND device interface.
//!
//! The engine consumes a raw page-addressed device through [`NandDevice`]:
//! `identify`, host-page reads, flash-page writes, and block erases. The
//! device performs no translation of its own; placement and garbage
//! collection happen above it.
//!
//! [`MemNandDevice`] is an in-memory implementation with per-op counters
//! and error-injection knobs, used by the test suites.

use nftl_error::{FtlError, Result};
use nftl_types::{BlockId, Geometry, HOST_PAGE_SIZE, Ppn, WireError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

// ── Identify records ────────────────────────────────────────────────────────

/// Per-channel identify record.
///
/// Granularities are expressed in host pages: `gran_erase` is the erase
/// unit (one block), `gran_write` the program unit (one flash page),
/// `gran_read` the read unit (one host page). Timings are in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelIdentity {
    pub laddr_begin: u64,
    pub laddr_end: u64,
    pub gran_erase: u32,
    pub gran_read: u32,
    pub gran_write: u32,
    pub t_r_ns: u64,
    pub t_w_ns: u64,
    pub t_e_ns: u64,
}

/// Device identify record: one entry per channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub channels: Vec<ChannelIdentity>,
}

impl DeviceIdentity {
    #[must_use]
    pub fn nr_channels(&self) -> u32 {
        self.channels.len() as u32
    }

    /// Derive the pool/block/page geometry from the identify data.
    ///
    /// All channels must share one layout; only channel 0 is consulted.
    pub fn geometry(&self) -> Result<Geometry> {
        let chan = self.channels.first().ok_or(WireError::InvalidField {
            field: "channels",
            reason: "identify reported zero channels",
        })?;
        if chan.gran_write == 0 || chan.gran_erase == 0 || chan.laddr_end < chan.laddr_begin {
            return Err(FtlError::Wire(WireError::InvalidField {
                field: "channel",
                reason: "degenerate granularity or address range",
            }));
        }
        let span = chan.laddr_end - chan.laddr_begin + 1;
        let blks_per_pool = (span / u64::from(chan.gran_erase)) as u32;
        let pages_per_blk = chan.gran_erase / chan.gran_write;
        Ok(Geometry::new(
            self.nr_channels(),
            blks_per_pool,
            pages_per_blk,
            chan.gran_write,
        )?)
    }
}

// ── Device interface ────────────────────────────────────────────────────────

/// A raw NAND-like device: physical pages, erase-before-write, no
/// translation.
pub trait NandDevice: Send + Sync {
    /// Report channel layout and timing characteristics.
    fn identify(&self) -> DeviceIdentity;

    /// Read one host page into `buf` (`buf.len() == HOST_PAGE_SIZE`).
    /// Unwritten pages read as zeroes.
    fn read_page(&self, addr: Ppn, buf: &mut [u8]) -> Result<()>;

    /// Program one flash page. `addr` must be aligned to the flash page
    /// (H host pages) and `data.len()` must equal H · `HOST_PAGE_SIZE`.
    fn write_flash_page(&self, addr: Ppn, data: &[u8]) -> Result<()>;

    /// Erase a block, returning all of its pages to the unwritten state.
    fn erase_block(&self, block: BlockId) -> Result<()>;
}

// ── In-memory simulator ─────────────────────────────────────────────────────

/// Monotonic operation counters maintained by [`MemNandDevice`].
#[derive(Debug, Default)]
pub struct DeviceCounters {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub erases: AtomicU64,
}

/// Snapshot of [`DeviceCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCounterSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub erases: u64,
}

/// In-memory NAND simulator backing the test suites.
#[derive(Debug)]
pub struct MemNandDevice {
    geometry: Geometry,
    t_read_us: u64,
    t_write_us: u64,
    t_erase_us: u64,
    pages: Mutex<HashMap<u64, Vec<u8>>>,
    counters: DeviceCounters,
    fail_reads: Mutex<HashSet<u64>>,
    fail_erases: Mutex<HashSet<u32>>,
}

impl MemNandDevice {
    #[must_use]
    pub fn new(geometry: Geometry, t_read_us: u64, t_write_us: u64, t_erase_us: u64) -> Self {
        Self {
            geometry,
            t_read_us,
            t_write_us,
            t_erase_us,
            pages: Mutex::new(HashMap::new()),
            counters: DeviceCounters::default(),
            fail_reads: Mutex::new(HashSet::new()),
            fail_erases: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn counters(&self) -> DeviceCounterSnapshot {
        DeviceCounterSnapshot {
            reads: self.counters.reads.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            erases: self.counters.erases.load(Ordering::Relaxed),
        }
    }

    /// Make the next reads of `addr` fail until cleared.
    pub fn inject_read_failure(&self, addr: Ppn) {
        self.fail_reads.lock().insert(addr.0);
    }

    pub fn clear_read_failure(&self, addr: Ppn) {
        self.fail_reads.lock().remove(&addr.0);
    }

    /// Make erases of `block` fail until cleared.
    pub fn inject_erase_failure(&self, block: BlockId) {
        self.fail_erases.lock().insert(block.0);
    }

    pub fn clear_erase_failure(&self, block: BlockId) {
        self.fail_erases.lock().remove(&block.0);
    }

    fn check_addr(&self, addr: Ppn) -> Result<()> {
        if addr.0 >= self.geometry.nr_pages() {
            return Err(FtlError::Device {
                addr: addr.0,
                detail: "physical page beyond device".to_owned(),
            });
        }
        Ok(())
    }
}

impl NandDevice for MemNandDevice {
    fn identify(&self) -> DeviceIdentity {
        let geo = &self.geometry;
        let pages_per_pool =
            u64::from(geo.blks_per_pool()) * u64::from(geo.host_pages_in_blk());
        let channels = (0..geo.nr_pools())
            .map(|chan| {
                let begin = u64::from(chan) * pages_per_pool;
                ChannelIdentity {
                    laddr_begin: begin,
                    laddr_end: begin + pages_per_pool - 1,
                    gran_erase: geo.host_pages_in_blk(),
                    gran_read: 1,
                    gran_write: geo.host_pages_in_flash_page(),
                    t_r_ns: self.t_read_us * 1000,
                    t_w_ns: self.t_write_us * 1000,
                    t_e_ns: self.t_erase_us * 1000,
                }
            })
            .collect();
        DeviceIdentity { channels }
    }

    fn read_page(&self, addr: Ppn, buf: &mut [u8]) -> Result<()> {
        self.check_addr(addr)?;
        if buf.len() != HOST_PAGE_SIZE {
            return Err(FtlError::Device {
                addr: addr.0,
                detail: format!("read buffer must be one host page, got {}", buf.len()),
            });
        }
        if self.fail_reads.lock().contains(&addr.0) {
            return Err(FtlError::Device {
                addr: addr.0,
                detail: "injected read failure".to_owned(),
            });
        }
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        let pages = self.pages.lock();
        match pages.get(&addr.0) {
            Some(data) => buf.copy_from_slice(data),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_flash_page(&self, addr: Ppn, data: &[u8]) -> Result<()> {
        self.check_addr(addr)?;
        let h = self.geometry.host_pages_in_flash_page() as usize;
        if addr.0 % h as u64 != 0 || data.len() != h * HOST_PAGE_SIZE {
            return Err(FtlError::Device {
                addr: addr.0,
                detail: "unaligned or short flash-page write".to_owned(),
            });
        }
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        let mut pages = self.pages.lock();
        for i in 0..h {
            let page = addr.0 + i as u64;
            let slice = &data[i * HOST_PAGE_SIZE..(i + 1) * HOST_PAGE_SIZE];
            // Erase-before-write: programming an already-written page is a
            // device misuse upstream of us.
            if pages.insert(page, slice.to_vec()).is_some() {
                return Err(FtlError::Device {
                    addr: page,
                    detail: "page programmed twice without erase".to_owned(),
                });
            }
        }
        trace!(target: "nftl::device", addr = addr.0, host_pages = h, "flash_page_programmed");
        Ok(())
    }

    fn erase_block(&self, block: BlockId) -> Result<()> {
        let base = self.geometry.block_to_addr(block);
        if self.geometry.addr_to_block(base) != block || block.0 >= self.geometry.nr_blocks() {
            return Err(FtlError::Device {
                addr: base.0,
                detail: "erase of block beyond device".to_owned(),
            });
        }
        if self.fail_erases.lock().contains(&block.0) {
            return Err(FtlError::Device {
                addr: base.0,
                detail: "injected erase failure".to_owned(),
            });
        }
        self.counters.erases.fetch_add(1, Ordering::Relaxed);
        let mut pages = self.pages.lock();
        for off in 0..u64::from(self.geometry.host_pages_in_blk()) {
            pages.remove(&(base.0 + off));
        }
        trace!(target: "nftl::device", block = block.0, "block_erased");
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
