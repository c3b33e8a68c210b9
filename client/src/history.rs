//! Per-connection store of confirmed snapshots.
//!
//! Holders live in an arena and are referenced by [`HolderId`]. The
//! previous/current cursors used for interpolation are ids into the arena,
//! and purging never evicts a holder a cursor still points at.

use shared::Snapshot;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HolderId(usize);

#[derive(Debug, Clone)]
pub struct SnapshotHolder {
    pub tick: i32,
    /// Wall time the snapshot was stored at
    pub received_at: i64,
    pub byte_size: usize,
    pub snapshot: Snapshot,
}

#[derive(Debug, Default)]
pub struct SnapshotHistory {
    slots: Vec<Option<SnapshotHolder>>,
    free: Vec<usize>,
    /// Occupied slots, oldest tick first
    order: VecDeque<usize>,
    previous: Option<HolderId>,
    current: Option<HolderId>,
}

impl SnapshotHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a snapshot; a snapshot already stored for `tick` is replaced
    pub fn add(&mut self, tick: i32, received_at: i64, snapshot: Snapshot) -> HolderId {
        let holder = SnapshotHolder {
            tick,
            received_at,
            byte_size: snapshot.data_size(),
            snapshot,
        };

        let position = self
            .order
            .partition_point(|&slot| self.tick_of(slot) < tick);
        if let Some(&slot) = self.order.get(position) {
            if self.tick_of(slot) == tick {
                self.slots[slot] = Some(holder);
                return HolderId(slot);
            }
        }

        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(holder);
                slot
            }
            None => {
                self.slots.push(Some(holder));
                self.slots.len() - 1
            }
        };
        self.order.insert(position, slot);
        HolderId(slot)
    }

    fn tick_of(&self, slot: usize) -> i32 {
        self.slots[slot].as_ref().map_or(i32::MIN, |holder| holder.tick)
    }

    fn find_slot(&self, tick: i32) -> Option<usize> {
        let position = self
            .order
            .partition_point(|&slot| self.tick_of(slot) < tick);
        self.order
            .get(position)
            .copied()
            .filter(|&slot| self.tick_of(slot) == tick)
    }

    /// Snapshot stored for exactly `tick`
    pub fn get(&self, tick: i32) -> Option<&Snapshot> {
        self.holder(tick).map(|holder| &holder.snapshot)
    }

    pub fn holder(&self, tick: i32) -> Option<&SnapshotHolder> {
        self.find_slot(tick).and_then(|slot| self.slots[slot].as_ref())
    }

    pub fn by_id(&self, id: HolderId) -> Option<&SnapshotHolder> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    /// Evicts every holder older than `tick`, or older than either cursor if
    /// that is earlier. Returns how many were evicted.
    pub fn purge_until(&mut self, tick: i32) -> usize {
        let limit = [self.previous, self.current]
            .into_iter()
            .flatten()
            .filter_map(|id| self.by_id(id).map(|holder| holder.tick))
            .fold(tick, i32::min);

        let mut evicted = 0;
        while let Some(&slot) = self.order.front() {
            if self.tick_of(slot) >= limit {
                break;
            }
            self.order.pop_front();
            self.slots[slot] = None;
            self.free.push(slot);
            evicted += 1;
        }
        evicted
    }

    /// Drops every holder and both cursors
    pub fn purge_all(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.order.clear();
        self.previous = None;
        self.current = None;
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn first(&self) -> Option<&SnapshotHolder> {
        self.order.front().and_then(|&slot| self.slots[slot].as_ref())
    }

    pub fn last(&self) -> Option<&SnapshotHolder> {
        self.order.back().and_then(|&slot| self.slots[slot].as_ref())
    }

    /// Stored ticks, oldest first
    pub fn ticks(&self) -> Vec<i32> {
        self.order.iter().map(|&slot| self.tick_of(slot)).collect()
    }

    /// Points the cursors at the oldest and newest holders
    pub fn reset_cursors(&mut self) -> bool {
        match (self.order.front(), self.order.back()) {
            (Some(&first), Some(&last)) => {
                self.previous = Some(HolderId(first));
                self.current = Some(HolderId(last));
                true
            }
            _ => false,
        }
    }

    /// Moves both cursors one holder forward if a newer holder exists
    pub fn advance_cursors(&mut self) -> bool {
        let Some(current) = self.current else {
            return false;
        };
        let Some(position) = self.order.iter().position(|&slot| slot == current.0) else {
            return false;
        };
        match self.order.get(position + 1) {
            Some(&next) => {
                self.previous = Some(current);
                self.current = Some(HolderId(next));
                true
            }
            None => false,
        }
    }

    pub fn previous(&self) -> Option<&SnapshotHolder> {
        self.previous.and_then(|id| self.by_id(id))
    }

    pub fn current(&self) -> Option<&SnapshotHolder> {
        self.current.and_then(|id| self.by_id(id))
    }
}
