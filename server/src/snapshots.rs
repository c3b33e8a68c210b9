//! Snapshot emission: what each client has been sent, and how a snapshot is
//! turned into `SNAP`/`SNAP_SINGLE`/`SNAP_EMPTY` messages against the
//! client's acknowledged base.

use shared::protocol::SnapPart;
use shared::{Snapshot, SnapshotDelta, SystemMessage, SERVER_TICK_SPEED};
use std::collections::BTreeMap;
use std::time::Instant;

/// Payload bytes per snapshot part
pub const MAX_SNAPSHOT_PACKSIZE: usize = 900;
/// Sent snapshots older than this many ticks are forgotten
pub const SENT_HISTORY_TICKS: i32 = SERVER_TICK_SPEED * 3;

#[derive(Debug)]
struct SentSnapshot {
    snapshot: Snapshot,
    sent_at: Instant,
}

/// Snapshots sent to one client that it may still use as a delta base
#[derive(Debug, Default)]
pub struct SentSnapshots {
    entries: BTreeMap<i32, SentSnapshot>,
}

impl SentSnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, tick: i32, snapshot: Snapshot, sent_at: Instant) {
        self.entries.insert(tick, SentSnapshot { snapshot, sent_at });
        let oldest = tick - SENT_HISTORY_TICKS;
        self.purge_before(oldest);
    }

    pub fn get(&self, tick: i32) -> Option<&Snapshot> {
        self.entries.get(&tick).map(|entry| &entry.snapshot)
    }

    pub fn sent_at(&self, tick: i32) -> Option<Instant> {
        self.entries.get(&tick).map(|entry| entry.sent_at)
    }

    /// Drops every snapshot older than `tick`
    pub fn purge_before(&mut self, tick: i32) {
        self.entries = self.entries.split_off(&tick);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Messages carrying `snapshot` for `tick`, delta-encoded against `base`
/// when the client has acknowledged one, otherwise as a keyframe.
pub fn snapshot_messages(
    tick: i32,
    snapshot: &Snapshot,
    base: Option<(i32, &Snapshot)>,
) -> Vec<SystemMessage> {
    let empty = Snapshot::empty();
    let (delta_tick, base) = base.unwrap_or((-1, &empty));

    let Some(data) = SnapshotDelta::encode(base, snapshot) else {
        return vec![SystemMessage::SnapEmpty { tick, delta_tick }];
    };

    let crc = snapshot.crc();
    let num_parts = data.len().div_ceil(MAX_SNAPSHOT_PACKSIZE) as i32;
    data.chunks(MAX_SNAPSHOT_PACKSIZE)
        .enumerate()
        .map(|(part, chunk)| {
            SystemMessage::Snap(SnapPart {
                tick,
                delta_tick,
                num_parts,
                part: part as i32,
                crc,
                data: chunk.to_vec(),
            })
        })
        .collect()
}
