#![forbid(unsafe_code)]
//! Shared identifiers, device geometry, flags, and wire formats.
//!
//! Everything here is plain data: the newtypes that keep logical and
//! physical page numbers from mixing, the validated [`Geometry`] all other
//! crates derive their arithmetic from, the engine flag word, and the
//! hint-channel payload codec.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Host page size exposed to the block layer, in bytes.
pub const HOST_PAGE_SIZE: usize = 4096;

/// 512-byte sectors per host page.
pub const NR_PHY_IN_LOG: u64 = (HOST_PAGE_SIZE / 512) as u64;

/// Maximum inode ranges carried by one hint payload.
pub const HINT_DATA_MAX_INOS: usize = 8;

/// Upper bound on distinct inodes tracked by the inode→class side table.
pub const HINT_MAX_INOS: usize = 500_000;

// ── Identifiers ─────────────────────────────────────────────────────────────

/// Logical page number (host-page granularity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lpn(pub u64);

/// Physical page number (host-page granularity, linear across all pools).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ppn(pub u64);

/// Stable block identifier, linear across all pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

/// Pool (flash channel) index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoolId(pub u32);

/// Append-point index, linear across all pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ApId(pub u32);

/// Inode number carried by hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

// ── Geometry ────────────────────────────────────────────────────────────────

/// Validated device geometry.
///
/// All address arithmetic in the workspace goes through this type so that
/// the `pool → block → flash page → host page` subdivision is computed in
/// exactly one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    nr_pools: u32,
    blks_per_pool: u32,
    /// Flash pages per block (K).
    pages_per_blk: u32,
    /// Host pages per flash page (H); power of two.
    host_pages_in_flash_page: u32,
}

impl Geometry {
    /// Create a geometry if every dimension is non-zero and H is a power
    /// of two.
    pub fn new(
        nr_pools: u32,
        blks_per_pool: u32,
        pages_per_blk: u32,
        host_pages_in_flash_page: u32,
    ) -> Result<Self, WireError> {
        if nr_pools == 0 || blks_per_pool == 0 || pages_per_blk == 0 {
            return Err(WireError::InvalidField {
                field: "geometry",
                reason: "pool, block, and page counts must be non-zero",
            });
        }
        if !host_pages_in_flash_page.is_power_of_two() {
            return Err(WireError::InvalidField {
                field: "host_pages_in_flash_page",
                reason: "must be a power of two",
            });
        }
        Ok(Self {
            nr_pools,
            blks_per_pool,
            pages_per_blk,
            host_pages_in_flash_page,
        })
    }

    #[must_use]
    pub fn nr_pools(&self) -> u32 {
        self.nr_pools
    }

    #[must_use]
    pub fn blks_per_pool(&self) -> u32 {
        self.blks_per_pool
    }

    /// Flash pages per block (K).
    #[must_use]
    pub fn pages_per_blk(&self) -> u32 {
        self.pages_per_blk
    }

    /// Host pages per flash page (H).
    #[must_use]
    pub fn host_pages_in_flash_page(&self) -> u32 {
        self.host_pages_in_flash_page
    }

    /// Host pages per block (K·H).
    #[must_use]
    pub fn host_pages_in_blk(&self) -> u32 {
        self.pages_per_blk * self.host_pages_in_flash_page
    }

    #[must_use]
    pub fn nr_blocks(&self) -> u32 {
        self.nr_pools * self.blks_per_pool
    }

    /// Total logical pages N = P·B·K·H.
    #[must_use]
    pub fn nr_pages(&self) -> u64 {
        u64::from(self.nr_blocks()) * u64::from(self.host_pages_in_blk())
    }

    /// First host-page address of a block.
    #[must_use]
    pub fn block_to_addr(&self, block: BlockId) -> Ppn {
        Ppn(u64::from(block.0) * u64::from(self.host_pages_in_blk()))
    }

    /// Block containing a physical page.
    #[must_use]
    pub fn addr_to_block(&self, addr: Ppn) -> BlockId {
        BlockId((addr.0 / u64::from(self.host_pages_in_blk())) as u32)
    }

    /// Host-page offset of `addr` within its block (0..K·H).
    #[must_use]
    pub fn page_offset_in_blk(&self, addr: Ppn) -> u32 {
        (addr.0 % u64::from(self.host_pages_in_blk())) as u32
    }

    /// Flash-page slot of `addr` within its block (0..K).
    #[must_use]
    pub fn flash_slot(&self, addr: Ppn) -> u32 {
        self.page_offset_in_blk(addr) / self.host_pages_in_flash_page
    }

    /// Pool owning a block. Blocks are laid out `[i·B, (i+1)·B)` per pool.
    #[must_use]
    pub fn pool_of_block(&self, block: BlockId) -> PoolId {
        PoolId(block.0 / self.blks_per_pool)
    }

    /// Pool owning a physical page.
    #[must_use]
    pub fn pool_of_addr(&self, addr: Ppn) -> PoolId {
        self.pool_of_block(self.addr_to_block(addr))
    }

    /// Block-id range owned by a pool.
    #[must_use]
    pub fn pool_blocks(&self, pool: PoolId) -> core::ops::Range<u32> {
        let start = pool.0 * self.blks_per_pool;
        start..start + self.blks_per_pool
    }
}

/// Fast/slow access pattern for a flash page within a block.
///
/// Pages: `F F F F | S S F F | S S F F | ... | S S S S`. The first four
/// pages are fast, the last four slow; in between, slots 2 and 3 of each
/// group of four are fast.
#[must_use]
pub fn page_is_fast(pagenr: u32, pages_per_blk: u32) -> bool {
    if pagenr < 4 {
        return true;
    }
    if pagenr >= pages_per_blk.saturating_sub(4) {
        return false;
    }
    matches!((pagenr - 4) % 4, 2 | 3)
}

// ── Engine flags ────────────────────────────────────────────────────────────

/// Bit offset separating engine-selection bits from misc option bits.
pub const OPT_MISC_OFFSET: u32 = 15;

/// Engine and option flag word.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EngineFlags(pub u32);

impl EngineFlags {
    pub const NONE: Self = Self(0);
    /// Swap-aware hints.
    pub const SWAP: Self = Self(1);
    /// Applications may submit direct hints through the control channel.
    pub const IOCTL: Self = Self(1 << 1);
    /// Latency-aware hints (dual write + shadow map).
    pub const LATENCY: Self = Self(1 << 2);
    /// Pack-aware hints (per-inode append-point affinity).
    pub const PACK: Self = Self(1 << 3);
    /// Serialize device access within each pool.
    pub const POOL_SERIALIZE: Self = Self(1 << OPT_MISC_OFFSET);
    /// Use the fast/slow page access pattern for write timing.
    pub const FAST_SLOW_PAGES: Self = Self(1 << (OPT_MISC_OFFSET + 1));
    /// Disable device timing waits.
    pub const NO_WAITS: Self = Self(1 << (OPT_MISC_OFFSET + 2));

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

// ── Placement mode and configuration ────────────────────────────────────────

/// Placement strategy selected at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementMode {
    /// Round-robin across all append points.
    #[default]
    RoundRobin,
    /// Prefer fast pages for swap-hinted writes.
    Swap,
    /// Dual write with a shadow map for latency-hinted writes.
    Latency,
    /// Per-inode append-point affinity for pack-hinted writes.
    Pack,
}

impl PlacementMode {
    /// Engine flag bits implied by the mode.
    #[must_use]
    pub fn engine_flags(self) -> EngineFlags {
        match self {
            Self::RoundRobin => EngineFlags::NONE,
            Self::Swap => EngineFlags::SWAP,
            Self::Latency => EngineFlags::LATENCY.union(EngineFlags::IOCTL),
            Self::Pack => EngineFlags::PACK.union(EngineFlags::IOCTL),
        }
    }
}

/// Construction-time configuration record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtlConfig {
    pub mode: PlacementMode,
    pub nr_pools: u32,
    pub nr_blks_per_pool: u32,
    /// Flash pages per block (K).
    pub nr_pages_per_blk: u32,
    /// Host pages per flash page (H).
    pub nr_host_pages_in_flash_page: u32,
    pub nr_aps_per_pool: u32,
    /// Misc option bits (`POOL_SERIALIZE`, `FAST_SLOW_PAGES`, `NO_WAITS`).
    pub flags: EngineFlags,
    /// GC timer period in milliseconds.
    pub gc_time_ms: u64,
    pub t_read_us: u64,
    pub t_write_us: u64,
    pub t_erase_us: u64,
    /// Idle time after which a pack AP sheds its inode association.
    pub ap_disassociate_ms: u64,
}

impl Default for FtlConfig {
    fn default() -> Self {
        Self {
            mode: PlacementMode::RoundRobin,
            nr_pools: 8,
            nr_blks_per_pool: 32,
            nr_pages_per_blk: 64,
            nr_host_pages_in_flash_page: 1,
            nr_aps_per_pool: 1,
            flags: EngineFlags::NONE,
            gc_time_ms: 10_000,
            t_read_us: 25,
            t_write_us: 500,
            t_erase_us: 1500,
            ap_disassociate_ms: 5000,
        }
    }
}

impl FtlConfig {
    /// Derive and validate the geometry described by this configuration.
    pub fn geometry(&self) -> Result<Geometry, WireError> {
        Geometry::new(
            self.nr_pools,
            self.nr_blks_per_pool,
            self.nr_pages_per_blk,
            self.nr_host_pages_in_flash_page,
        )
    }

    /// The full flag word: misc option bits plus the engine bits implied
    /// by the placement mode.
    #[must_use]
    pub fn effective_flags(&self) -> EngineFlags {
        self.flags.union(self.mode.engine_flags())
    }

    #[must_use]
    pub fn nr_aps(&self) -> u32 {
        self.nr_pools * self.nr_aps_per_pool
    }
}

// ── File classes ────────────────────────────────────────────────────────────

/// Access class attached to a hint entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileClass {
    #[default]
    Empty = 0,
    Unknown = 1,
    VideoSlow = 2,
    ImageSlow = 3,
    DbIndex = 4,
}

impl FileClass {
    pub fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(Self::Empty),
            1 => Ok(Self::Unknown),
            2 => Ok(Self::VideoSlow),
            3 => Ok(Self::ImageSlow),
            4 => Ok(Self::DbIndex),
            _ => Err(WireError::InvalidField {
                field: "class",
                reason: "unknown file class",
            }),
        }
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ── Hint wire payload ───────────────────────────────────────────────────────

/// One inode/LBA-range entry of a hint payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InoHint {
    pub ino: InodeNumber,
    pub start_lba: u32,
    /// Number of sequential LBAs covered, starting at `start_lba`.
    pub count: u32,
    pub class: FileClass,
}

/// Decoded hint-channel payload.
///
/// Wire layout, little-endian: `lba (u32), sectors_count (u32), is_write
/// (u32), hint_flags (u32), count (u32)` followed by `count` entries of
/// `ino (u64), start_lba (u32), count (u32), class (u8)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HintPayload {
    pub lba: u32,
    pub sectors_count: u32,
    pub is_write: bool,
    pub hint_flags: EngineFlags,
    pub entries: Vec<InoHint>,
}

const HINT_HEADER_SIZE: usize = 20;
const INO_HINT_SIZE: usize = 17;

impl HintPayload {
    /// Decode a payload from its wire form.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let lba = read_le_u32(data, 0)?;
        let sectors_count = read_le_u32(data, 4)?;
        let is_write = read_le_u32(data, 8)? != 0;
        let hint_flags = EngineFlags(read_le_u32(data, 12)?);
        let count = read_le_u32(data, 16)? as usize;

        if count > HINT_DATA_MAX_INOS {
            return Err(WireError::InvalidField {
                field: "count",
                reason: "too many inode entries",
            });
        }

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let base = HINT_HEADER_SIZE + i * INO_HINT_SIZE;
            let ino = InodeNumber(read_le_u64(data, base)?);
            let start_lba = read_le_u32(data, base + 8)?;
            let lba_count = read_le_u32(data, base + 12)?;
            let class = FileClass::from_u8(read_u8(data, base + 16)?)?;
            entries.push(InoHint {
                ino,
                start_lba,
                count: lba_count,
                class,
            });
        }

        Ok(Self {
            lba,
            sectors_count,
            is_write,
            hint_flags,
            entries,
        })
    }

    /// Encode the payload into its wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HINT_HEADER_SIZE + self.entries.len() * INO_HINT_SIZE);
        out.extend_from_slice(&self.lba.to_le_bytes());
        out.extend_from_slice(&self.sectors_count.to_le_bytes());
        out.extend_from_slice(&u32::from(self.is_write).to_le_bytes());
        out.extend_from_slice(&self.hint_flags.0.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            out.extend_from_slice(&entry.ino.0.to_le_bytes());
            out.extend_from_slice(&entry.start_lba.to_le_bytes());
            out.extend_from_slice(&entry.count.to_le_bytes());
            out.push(entry.class.as_u8());
        }
        out
    }
}

// ── Wire errors and checked readers ─────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], WireError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(WireError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(WireError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

fn read_u8(data: &[u8], offset: usize) -> Result<u8, WireError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, WireError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, WireError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

// ── Tests ───────────────────────────────────────────────────────────────────
