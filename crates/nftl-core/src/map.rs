//! Logical-to-physical mapping tables.
//!
//! A primary L→P table, a reverse P→L table, and (latency mode only) a
//! shadow L→P replica, all guarded by one mapping lock. Updating an entry
//! invalidates the previous physical page in its block's bitmap and
//! poisons the stale reverse entry in the same critical section, so the
//! bijection invariant never has an observable gap.

use crate::pool::{Pool, bitmap_test_and_set, block_ref};
use nftl_types::{BlockId, Geometry, Lpn, Ppn};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use tracing::{error, trace};

/// Which translation table an update or lookup addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapTarget {
    Primary,
    Shadow,
}

/// One L→P entry. `block == None` means the logical page was never
/// written; reads of it return zeroes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    pub addr: Ppn,
    pub block: Option<BlockId>,
}

impl MapEntry {
    pub(crate) const EMPTY: Self = Self {
        addr: Ppn(0),
        block: None,
    };

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.block.is_none()
    }
}

#[derive(Debug)]
struct MapTables {
    primary: Vec<MapEntry>,
    /// Reverse P→L entries; `None` marks unused or poisoned (stale) pages.
    reverse: Vec<Option<Lpn>>,
    shadow: Option<Vec<MapEntry>>,
}

/// The translation state of the store.
#[derive(Debug)]
pub(crate) struct MappingTable {
    geo: Geometry,
    tables: Mutex<MapTables>,
}

impl MappingTable {
    pub(crate) fn new(geo: Geometry, with_shadow: bool) -> Self {
        let n = geo.nr_pages() as usize;
        Self {
            geo,
            tables: Mutex::new(MapTables {
                primary: vec![MapEntry::EMPTY; n],
                reverse: vec![None; n],
                shadow: with_shadow.then(|| vec![MapEntry::EMPTY; n]),
            }),
        }
    }

    /// Mark the page behind `entry` invalid in its block and poison its
    /// reverse entry. Requires the mapping lock held (callers below).
    fn invalidate_page(&self, pools: &[Pool], reverse: &mut [Option<Lpn>], entry: MapEntry) {
        let Some(block_id) = entry.block else {
            return;
        };
        let block = block_ref(pools, &self.geo, block_id);
        let offset = self.geo.page_offset_in_blk(entry.addr);

        let mut st = block.state.lock();
        if bitmap_test_and_set(&mut st.invalid_pages, offset) {
            debug_assert!(false, "double invalidation of page {}", entry.addr.0);
            error!(
                target: "nftl::map",
                addr = entry.addr.0,
                block = block_id.0,
                "double invalidation of physical page"
            );
        } else {
            st.nr_invalid_pages += 1;
        }
        drop(st);

        reverse[entry.addr.0 as usize] = None;
    }

    /// Install `l → (p, block)` in the chosen table, invalidating the
    /// entry it replaces.
    pub(crate) fn update(
        &self,
        pools: &[Pool],
        target: MapTarget,
        l: Lpn,
        p: Ppn,
        block: BlockId,
    ) {
        debug_assert!(l.0 < self.geo.nr_pages());
        debug_assert!(p.0 < self.geo.nr_pages());

        let mut tables = self.tables.lock();
        let MapTables {
            primary,
            reverse,
            shadow,
        } = &mut *tables;
        let table = match target {
            MapTarget::Primary => primary,
            MapTarget::Shadow => shadow
                .as_mut()
                .expect("shadow update without a shadow table"),
        };

        let old = table[l.0 as usize];
        if !old.is_empty() {
            self.invalidate_page(pools, reverse, old);
        }
        table[l.0 as usize] = MapEntry {
            addr: p,
            block: Some(block),
        };
        reverse[p.0 as usize] = Some(l);
        trace!(
            target: "nftl::map",
            l = l.0,
            p = p.0,
            block = block.0,
            shadow = matches!(target, MapTarget::Shadow),
            "map_updated"
        );
    }

    /// Invalidate and clear the shadow entry of `l` without writing a
    /// replacement.
    pub(crate) fn trim_shadow(&self, pools: &[Pool], l: Lpn) {
        let mut tables = self.tables.lock();
        let MapTables {
            reverse, shadow, ..
        } = &mut *tables;
        let Some(shadow) = shadow.as_mut() else {
            return;
        };
        let old = shadow[l.0 as usize];
        if !old.is_empty() {
            self.invalidate_page(pools, reverse, old);
            shadow[l.0 as usize] = MapEntry::EMPTY;
            trace!(target: "nftl::map", l = l.0, "shadow_trimmed");
        }
    }

    /// Read an entry without taking a block reference.
    #[must_use]
    pub(crate) fn peek(&self, target: MapTarget, l: Lpn) -> MapEntry {
        let tables = self.tables.lock();
        match target {
            MapTarget::Primary => tables.primary[l.0 as usize],
            MapTarget::Shadow => tables
                .shadow
                .as_ref()
                .map_or(MapEntry::EMPTY, |s| s[l.0 as usize]),
        }
    }

    /// Look up `l` in the chosen table and take a reference on the
    /// backing block.
    ///
    /// While the entry's block is being GC-relocated the mapping is about
    /// to change; spin until relocation completes, then reference the
    /// block so it cannot be reclaimed under the caller. Empty entries
    /// are returned directly without a reference.
    #[must_use]
    pub(crate) fn lookup(&self, pools: &[Pool], target: MapTarget, l: Lpn) -> MapEntry {
        loop {
            let entry = self.peek(target, l);
            let Some(block_id) = entry.block else {
                return entry;
            };
            let block = block_ref(pools, &self.geo, block_id);
            if !block.gc_running.load(Ordering::Acquire) {
                block.ref_count.fetch_add(1, Ordering::AcqRel);
                return entry;
            }
            std::thread::yield_now();
        }
    }

    /// Reverse lookup; `None` for unused or stale physical pages.
    #[must_use]
    pub(crate) fn lookup_ptol(&self, p: Ppn) -> Option<Lpn> {
        self.tables.lock().reverse[p.0 as usize]
    }

    /// Run `f` under the mapping lock. GC victim selection uses this to
    /// freeze invalidation counts while it picks a block.
    pub(crate) fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.tables.lock();
        f()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use nftl_types::PoolId;

    fn setup() -> (Geometry, Vec<Pool>, MappingTable) {
        let geo = Geometry::new(2, 4, 4, 1).unwrap();
        let pools: Vec<Pool> = (0..2).map(|i| Pool::new(PoolId(i), &geo)).collect();
        let map = MappingTable::new(geo, true);
        (geo, pools, map)
    }

    #[test]
    fn update_invalidates_previous_page() {
        let (geo, pools, map) = setup();
        let b0 = pools[0].get_block(&geo, false).unwrap();
        let b1 = pools[0].get_block(&geo, false).unwrap();

        map.update(&pools, MapTarget::Primary, Lpn(3), Ppn(0), b0);
        assert_eq!(map.lookup_ptol(Ppn(0)), Some(Lpn(3)));
        assert_eq!(map.peek(MapTarget::Primary, Lpn(3)).addr, Ppn(0));

        map.update(&pools, MapTarget::Primary, Lpn(3), geo.block_to_addr(b1), b1);
        assert_eq!(map.lookup_ptol(Ppn(0)), None, "old reverse entry poisoned");
        assert_eq!(map.lookup_ptol(geo.block_to_addr(b1)), Some(Lpn(3)));

        let st = pools[0].block(b0).state.lock();
        assert_eq!(st.nr_invalid_pages, 1);
        assert!(crate::pool::bitmap_get(&st.invalid_pages, 0));
    }

    #[test]
    fn shadow_updates_do_not_touch_primary() {
        let (geo, pools, map) = setup();
        let b0 = pools[0].get_block(&geo, false).unwrap();
        let b1 = pools[1].get_block(&geo, false).unwrap();

        map.update(&pools, MapTarget::Primary, Lpn(7), Ppn(1), b0);
        map.update(&pools, MapTarget::Shadow, Lpn(7), geo.block_to_addr(b1), b1);

        assert_eq!(map.peek(MapTarget::Primary, Lpn(7)).addr, Ppn(1));
        assert_eq!(
            map.peek(MapTarget::Shadow, Lpn(7)).addr,
            geo.block_to_addr(b1)
        );
        assert_eq!(map.lookup_ptol(geo.block_to_addr(b1)), Some(Lpn(7)));
    }

    #[test]
    fn trim_shadow_invalidates_and_clears() {
        let (geo, pools, map) = setup();
        let b1 = pools[1].get_block(&geo, false).unwrap();
        let p = geo.block_to_addr(b1);

        map.update(&pools, MapTarget::Shadow, Lpn(2), p, b1);
        map.trim_shadow(&pools, Lpn(2));

        assert!(map.peek(MapTarget::Shadow, Lpn(2)).is_empty());
        assert_eq!(map.lookup_ptol(p), None);
        let st = pools[1].block(b1).state.lock();
        assert_eq!(st.nr_invalid_pages, 1);
    }

    #[test]
    fn trim_shadow_on_empty_entry_is_a_no_op() {
        let (_, pools, map) = setup();
        map.trim_shadow(&pools, Lpn(5));
        assert!(map.peek(MapTarget::Shadow, Lpn(5)).is_empty());
    }

    #[test]
    fn lookup_references_block_and_empty_does_not() {
        let (geo, pools, map) = setup();
        let b0 = pools[0].get_block(&geo, false).unwrap();
        map.update(&pools, MapTarget::Primary, Lpn(0), Ppn(0), b0);

        let entry = map.lookup(&pools, MapTarget::Primary, Lpn(0));
        assert_eq!(entry.block, Some(b0));
        assert_eq!(
            pools[0].block(b0).ref_count.load(Ordering::Acquire),
            1,
            "lookup takes a block reference"
        );
        pools[0].block(b0).ref_count.fetch_sub(1, Ordering::AcqRel);

        let empty = map.lookup(&pools, MapTarget::Primary, Lpn(9));
        assert!(empty.is_empty());
    }
}
