#![forbid(unsafe_code)]
//! Facade crate re-exporting the public nftl API.
//!
//! Most users want [`FtlStore`] over a [`NandDevice`] implementation,
//! configured through [`FtlConfig`]:
//!
//! ```
//! use nftl::{FtlConfig, FtlStore, Lpn, MemNandDevice, PlacementMode};
//! use std::sync::Arc;
//!
//! let config = FtlConfig {
//!     mode: PlacementMode::RoundRobin,
//!     nr_pools: 2,
//!     nr_blks_per_pool: 8,
//!     nr_pages_per_blk: 4,
//!     ..FtlConfig::default()
//! };
//! let geometry = config.geometry().unwrap();
//! let device = Arc::new(MemNandDevice::new(geometry, 25, 500, 1500));
//! let store = FtlStore::new(config, device).unwrap();
//!
//! let page = vec![0x5A; nftl::HOST_PAGE_SIZE];
//! store.write_page(Lpn(0), &page).unwrap();
//! assert_eq!(store.read_page(Lpn(0)).unwrap(), page);
//! ```

pub use nftl_core::{
    ApIo, FtlStore, GcDaemon, HintCommand, MapEntry, Metrics, PoolListSnapshot,
    classify_first_sector, config_from_identity,
};
pub use nftl_device::{
    ChannelIdentity, DeviceCounterSnapshot, DeviceIdentity, MemNandDevice, NandDevice,
};
pub use nftl_error::{FtlError, Result};
pub use nftl_types::{
    ApId, BlockId, EngineFlags, FileClass, FtlConfig, Geometry, HINT_DATA_MAX_INOS,
    HOST_PAGE_SIZE, HintPayload, InoHint, InodeNumber, Lpn, NR_PHY_IN_LOG, PlacementMode, PoolId,
    Ppn, page_is_fast,
};
