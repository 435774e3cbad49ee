//! Placement strategies.
//!
//! The four placement variants form a closed set, so dispatch is a match
//! on [`PlacementMode`] rather than a trait object. Each strategy decides
//! where a write lands (`write_targets`), which table a read consults
//! (`strategy_lookup`), and how a GC relocation re-homes a page
//! (`begin_gc` / `gc_map_page`).

use crate::FtlInner;
use crate::ap::{self, ApAlloc, AppendPoint};
use crate::map::{MapEntry, MapTarget};
use nftl_error::{FtlError, Result};
use nftl_types::{ApId, BlockId, EngineFlags, InodeNumber, Lpn, PlacementMode, Ppn, page_is_fast};
use std::sync::atomic::Ordering;
use tracing::{debug, error, trace, warn};

/// A write placement decision: one physical page plus the table it will
/// be recorded in.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MappedWrite {
    pub addr: Ppn,
    pub block: BlockId,
    pub target: MapTarget,
}

/// Opaque relocation context handed from `begin_gc` to `gc_map_page`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GcToken {
    pub old_p: Ppn,
    pub target: MapTarget,
}

impl FtlInner {
    /// Global round-robin AP cursor shared by all writers.
    fn next_ap(&self) -> &AppendPoint {
        let idx = self.next_write_ap.fetch_add(1, Ordering::AcqRel) % self.aps.len() as u64;
        &self.aps[idx as usize]
    }

    /// Round-robin over non-pack APs. Pack-reserved APs only serve
    /// pack-hinted writes.
    fn next_general_ap(&self) -> &AppendPoint {
        for _ in 0..self.aps.len() * 2 {
            let ap = self.next_ap();
            if !ap.is_pack() {
                return ap;
            }
        }
        // Unreachable in practice: pack APs are only ever a strict subset.
        &self.aps[0]
    }

    /// Default allocation: next general AP, normal cursor walk.
    fn alloc_rr(&self, is_gc: bool) -> Result<(ApAlloc, ApId)> {
        let ap = self.next_general_ap();
        let pool = self.pool(ap.pool);
        let alloc = ap::alloc_from_ap(&self.geo, ap, pool, is_gc)?;
        Ok((alloc, ap.id))
    }

    /// Scan APs round-robin for one whose current page passes the
    /// fast-page predicate. `None` when no AP currently sits on a fast
    /// page; callers fall back to the normal allocator.
    fn alloc_fastest(&self) -> Option<(ApAlloc, ApId)> {
        for _ in 0..self.aps.len() {
            let ap = self.next_ap();
            if ap.is_pack() {
                continue;
            }
            if let Some(alloc) = ap::try_alloc_fast(&self.geo, ap, self.pool(ap.pool)) {
                return Some((alloc, ap.id));
            }
        }
        None
    }

    // ── Host write placement ────────────────────────────────────────────

    /// Choose the physical target(s) of a host write to `l` and record
    /// them in the translation tables. Latency-hinted writes produce two
    /// targets; everything else produces one.
    pub(crate) fn write_targets(&self, l: Lpn) -> Result<Vec<MappedWrite>> {
        match self.config.mode {
            PlacementMode::RoundRobin => self.write_default(l),
            PlacementMode::Swap => self.write_swap(l),
            PlacementMode::Latency => self.write_latency(l),
            PlacementMode::Pack => self.write_pack(l),
        }
    }

    fn write_default(&self, l: Lpn) -> Result<Vec<MappedWrite>> {
        let (alloc, _) = self.alloc_rr(false)?;
        self.map
            .update(&self.pools, MapTarget::Primary, l, alloc.addr, alloc.block);
        Ok(vec![MappedWrite {
            addr: alloc.addr,
            block: alloc.block,
            target: MapTarget::Primary,
        }])
    }

    fn write_swap(&self, l: Lpn) -> Result<Vec<MappedWrite>> {
        if self
            .hints
            .consume(l, true, EngineFlags::SWAP)
            .is_some()
        {
            if let Some((alloc, _)) = self.alloc_fastest() {
                trace!(target: "nftl::strategy", l = l.0, addr = alloc.addr.0, "swap_fast_write");
                self.map
                    .update(&self.pools, MapTarget::Primary, l, alloc.addr, alloc.block);
                return Ok(vec![MappedWrite {
                    addr: alloc.addr,
                    block: alloc.block,
                    target: MapTarget::Primary,
                }]);
            }
            debug!(target: "nftl::strategy", l = l.0, "no fast page available, slow write");
        }
        self.write_default(l)
    }

    fn write_latency(&self, l: Lpn) -> Result<Vec<MappedWrite>> {
        if self
            .hints
            .consume(l, true, EngineFlags::LATENCY)
            .is_none()
        {
            // Unhinted write: single copy; any stale shadow copy of this
            // logical page must be dropped with it.
            let targets = self.write_default(l)?;
            self.map.trim_shadow(&self.pools, l);
            return Ok(targets);
        }

        let (first, first_ap) = self.alloc_rr(false)?;
        let first_pool = self.ap(first_ap).pool;

        // The replica must land in a different pool so the copies never
        // share a channel.
        let mut second = None;
        for _ in 0..self.aps.len() * 2 {
            let ap = self.next_general_ap();
            if ap.pool == first_pool {
                continue;
            }
            match ap::alloc_from_ap(&self.geo, ap, self.pool(ap.pool), false) {
                Ok(alloc) => {
                    second = Some(alloc);
                    break;
                }
                Err(FtlError::OutOfSpace) => continue,
                Err(e) => return Err(e),
            }
        }

        self.map
            .update(&self.pools, MapTarget::Primary, l, first.addr, first.block);
        let mut targets = vec![MappedWrite {
            addr: first.addr,
            block: first.block,
            target: MapTarget::Primary,
        }];

        match second {
            Some(alloc) => {
                self.map
                    .update(&self.pools, MapTarget::Shadow, l, alloc.addr, alloc.block);
                targets.push(MappedWrite {
                    addr: alloc.addr,
                    block: alloc.block,
                    target: MapTarget::Shadow,
                });
            }
            None => {
                warn!(
                    target: "nftl::strategy",
                    l = l.0,
                    "no second pool available for latency replica, single write"
                );
                self.map.trim_shadow(&self.pools, l);
            }
        }
        Ok(targets)
    }

    fn write_pack(&self, l: Lpn) -> Result<Vec<MappedWrite>> {
        let Some(hint) = self.hints.consume(l, true, EngineFlags::PACK) else {
            return self.write_default(l);
        };
        let Some(ap) = self.pack_ap_for(hint.ino) else {
            debug!(
                target: "nftl::strategy",
                l = l.0,
                ino = hint.ino.0,
                "no pack AP available, default placement"
            );
            return self.write_default(l);
        };

        let alloc = ap::alloc_from_ap(&self.geo, ap, self.pool(ap.pool), false)?;
        if let Some(assoc) = &ap.pack {
            let mut assoc = assoc.lock();
            // A rotation means the previous block filled; the fresh block
            // starts a fresh association.
            assoc.ino = Some(hint.ino);
            assoc.last_use = std::time::Instant::now();
        }
        trace!(
            target: "nftl::strategy",
            l = l.0,
            ino = hint.ino.0,
            class = hint.class.as_u8(),
            ap = ap.id.0,
            rotated = alloc.rotated,
            "pack_write"
        );
        self.map
            .update(&self.pools, MapTarget::Primary, l, alloc.addr, alloc.block);
        Ok(vec![MappedWrite {
            addr: alloc.addr,
            block: alloc.block,
            target: MapTarget::Primary,
        }])
    }

    /// Pack AP selection: the AP already bound to this inode, else one
    /// whose association is empty or stale.
    fn pack_ap_for(&self, ino: InodeNumber) -> Option<&AppendPoint> {
        let stale_after = std::time::Duration::from_millis(self.config.ap_disassociate_ms);

        for ap in self.aps.iter().filter(|ap| ap.is_pack()) {
            let assoc = ap.pack.as_ref().expect("pack AP has assoc").lock();
            if assoc.ino == Some(ino) {
                return Some(ap);
            }
        }
        for ap in self.aps.iter().filter(|ap| ap.is_pack()) {
            let assoc = ap.pack.as_ref().expect("pack AP has assoc").lock();
            if assoc.ino.is_none() || assoc.last_use.elapsed() >= stale_after {
                return Some(ap);
            }
        }
        None
    }

    // ── Read lookup ─────────────────────────────────────────────────────

    /// Resolve a read of `l`, taking a block reference on the returned
    /// entry. Latency mode serves the shadow copy while the primary
    /// copy's pool has an I/O in flight.
    pub(crate) fn strategy_lookup(&self, l: Lpn) -> MapEntry {
        if self.config.mode != PlacementMode::Latency {
            return self.map.lookup(&self.pools, MapTarget::Primary, l);
        }

        let shadow = self.map.peek(MapTarget::Shadow, l);
        if shadow.is_empty() {
            return self.map.lookup(&self.pools, MapTarget::Primary, l);
        }
        let primary = self.map.peek(MapTarget::Primary, l);
        let primary_busy = !primary.is_empty()
            && self
                .pool(self.geo.pool_of_addr(primary.addr))
                .gate
                .is_active();
        if primary_busy {
            trace!(target: "nftl::strategy", l = l.0, "primary pool busy, shadow read");
            self.map.lookup(&self.pools, MapTarget::Shadow, l)
        } else {
            self.map.lookup(&self.pools, MapTarget::Primary, l)
        }
    }

    // ── GC hooks ────────────────────────────────────────────────────────

    /// Determine which table the relocated page serves before its mapping
    /// is rewritten.
    pub(crate) fn begin_gc(&self, l: Lpn, old_p: Ppn) -> GcToken {
        let target = if self.config.mode == PlacementMode::Latency {
            let primary = self.map.peek(MapTarget::Primary, l);
            let shadow = self.map.peek(MapTarget::Shadow, l);
            if !primary.is_empty() && primary.addr == old_p {
                MapTarget::Primary
            } else if !shadow.is_empty() && shadow.addr == old_p {
                MapTarget::Shadow
            } else {
                debug_assert!(false, "reclaiming page {} mapped by no table", old_p.0);
                error!(
                    target: "nftl::strategy",
                    l = l.0,
                    old_p = old_p.0,
                    "reclaimed physical page not mapped by primary or shadow"
                );
                MapTarget::Primary
            }
        } else {
            MapTarget::Primary
        };
        GcToken { old_p, target }
    }

    /// Allocate the relocation target of a GC write and record the new
    /// mapping in the table the old page served.
    pub(crate) fn gc_map_page(&self, l: Lpn, token: &GcToken) -> Result<MappedWrite> {
        let alloc = match self.config.mode {
            PlacementMode::Swap => {
                let slot = self.geo.flash_slot(token.old_p);
                if page_is_fast(slot, self.geo.pages_per_blk()) {
                    // Keep hot swap pages on fast pages across relocation.
                    match self.alloc_fastest() {
                        Some((alloc, _)) => alloc,
                        None => self.alloc_rr(true)?.0,
                    }
                } else {
                    self.alloc_rr(true)?.0
                }
            }
            _ => self.alloc_rr(true)?.0,
        };

        self.map
            .update(&self.pools, token.target, l, alloc.addr, alloc.block);
        Ok(MappedWrite {
            addr: alloc.addr,
            block: alloc.block,
            target: token.target,
        })
    }
}
