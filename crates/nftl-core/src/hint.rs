//! Hint ingestion.
//!
//! Hints arrive over the control channel as [`HintPayload`] records and
//! land in a lock-protected list consumed by the placement strategies.
//! Latency and pack modes additionally remember an inode→class side
//! table. Each accepted range is consumed once per covered write; a fully
//! consumed record is removed.

use nftl_error::{FtlError, Result};
use nftl_types::{
    EngineFlags, FileClass, HINT_MAX_INOS, HintPayload, InodeNumber, Lpn,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};

/// `ftyp` box marker at byte offset 4 of an MP4-family container.
const VIDEO_MAGIC: [u8; 4] = [0x66, 0x74, 0x79, 0x70];
/// First four bytes of the SQLite file header.
const DB_INDEX_MAGIC: [u8; 4] = [0x53, 0x51, 0x4c, 0x69];

/// Classify a file from the unsigned bytes of its first sector.
#[must_use]
pub fn classify_first_sector(sector: &[u8]) -> FileClass {
    if sector.len() >= 8 && sector[4..8] == VIDEO_MAGIC {
        return FileClass::VideoSlow;
    }
    if sector.len() >= 4 && sector[..4] == DB_INDEX_MAGIC {
        return FileClass::DbIndex;
    }
    FileClass::Unknown
}

/// One accepted hint range.
#[derive(Debug, Clone)]
pub(crate) struct HintRecord {
    pub ino: InodeNumber,
    pub start_lba: u32,
    pub count: u32,
    pub class: FileClass,
    pub is_write: bool,
    pub flags: EngineFlags,
    /// How many covered LBAs have been consumed so far.
    pub processed: u32,
}

impl HintRecord {
    fn covers(&self, l: Lpn) -> bool {
        l.0 >= u64::from(self.start_lba) && l.0 < u64::from(self.start_lba) + u64::from(self.count)
    }
}

#[derive(Debug)]
pub(crate) struct HintStore {
    /// Engine bits active on the store; hints outside them are ignored.
    engine: EngineFlags,
    list: Mutex<Vec<HintRecord>>,
    ino2fc: Mutex<HashMap<InodeNumber, FileClass>>,
}

impl HintStore {
    pub(crate) fn new(engine: EngineFlags) -> Self {
        Self {
            engine,
            list: Mutex::new(Vec::new()),
            ino2fc: Mutex::new(HashMap::new()),
        }
    }

    /// Accept a decoded control-channel payload.
    ///
    /// Payloads carrying flags the active engine does not deploy are
    /// logged and dropped; that is not an error for the submitter. A
    /// payload that would grow the inode→class table past its capacity
    /// is rejected with a typed error; entries accepted before the
    /// failing one stay in the list.
    pub(crate) fn submit(&self, payload: &HintPayload) -> Result<()> {
        let engine_bits = EngineFlags::SWAP
            .union(EngineFlags::LATENCY)
            .union(EngineFlags::PACK);
        if !self.engine.intersects(engine_bits) {
            debug!(target: "nftl::hint", "no hint engine deployed, payload ignored");
            return Ok(());
        }
        if !payload.hint_flags.is_empty() && !self.engine.intersects(payload.hint_flags) {
            warn!(
                target: "nftl::hint",
                flags = payload.hint_flags.0,
                "hint flags not deployed on this store, payload ignored"
            );
            return Ok(());
        }

        let remember_class = self
            .engine
            .intersects(EngineFlags::LATENCY.union(EngineFlags::PACK));
        let mut list = self.list.lock();
        for entry in &payload.entries {
            if remember_class && entry.class != FileClass::Empty {
                let mut ino2fc = self.ino2fc.lock();
                if ino2fc.len() >= HINT_MAX_INOS && !ino2fc.contains_key(&entry.ino) {
                    warn!(
                        target: "nftl::hint",
                        ino = entry.ino.0,
                        "inode class table full, hint rejected"
                    );
                    return Err(FtlError::HintRejected(
                        "inode class table full".to_owned(),
                    ));
                }
                ino2fc.insert(entry.ino, entry.class);
            }
            debug!(
                target: "nftl::hint",
                ino = entry.ino.0,
                start_lba = entry.start_lba,
                count = entry.count,
                class = entry.class.as_u8(),
                is_write = payload.is_write,
                "hint_accepted"
            );
            list.push(HintRecord {
                ino: entry.ino,
                start_lba: entry.start_lba,
                count: entry.count,
                class: entry.class,
                is_write: payload.is_write,
                flags: payload.hint_flags,
                processed: 0,
            });
        }
        Ok(())
    }

    /// Find the first record covering `l` whose direction matches and
    /// whose flags intersect `wanted`; bump its consumption count and
    /// drop it once fully consumed.
    pub(crate) fn consume(&self, l: Lpn, is_write: bool, wanted: EngineFlags) -> Option<HintRecord> {
        let mut list = self.list.lock();
        let idx = list.iter().position(|h| {
            h.is_write == is_write && h.covers(l) && h.flags.intersects(wanted)
        })?;
        list[idx].processed += 1;
        let record = list[idx].clone();
        if record.processed >= record.count {
            list.swap_remove(idx);
        }
        Some(record)
    }

    /// Class previously recorded for an inode, if any.
    #[must_use]
    pub(crate) fn ino_class(&self, ino: InodeNumber) -> Option<FileClass> {
        self.ino2fc.lock().get(&ino).copied()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.list.lock().len()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
