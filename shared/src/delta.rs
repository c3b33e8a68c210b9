//! Snapshot delta compression.
//!
//! A delta is a flat stream of integers, varint-packed for the wire:
//!
//! ```text
//! num_deleted num_updated num_temp
//! deleted key words ...                  (type << 16 | id), num_deleted times
//! type id size word word ...             num_updated times
//! ```
//!
//! An updated item whose key survives in the base carries per-word
//! differences against the base payload; any other updated item carries its
//! payload verbatim. The decoder only ever reads from the network, so every
//! count and size is bounds-checked before it is trusted.

use crate::snapshot::{ItemKey, Snapshot, SnapshotError, SnapshotItem, MAX_ITEMS, MAX_SIZE};
use crate::varint::{self, WireError};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

const HEADER_INTS: usize = 3;
const ITEM_HEADER_INTS: usize = 3;

/// Upper bound on the integer count of a well-formed delta
pub const MAX_DELTA_INTS: usize = HEADER_INTS + MAX_ITEMS * (1 + ITEM_HEADER_INTS) + MAX_SIZE / 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed integer stream: {0}")]
    Wire(#[from] WireError),
    #[error("delta header truncated")]
    TruncatedHeader,
    #[error("negative count in delta header")]
    NegativeCount,
    #[error("delta declares {0} items, limit is {MAX_ITEMS}")]
    TooManyItems(usize),
    #[error("delta ends inside an item")]
    Truncated,
    #[error("item type {type_id} or id {id} out of range")]
    InvalidKey { type_id: i32, id: i32 },
    #[error("item {key} declares invalid size {size}")]
    InvalidSize { key: ItemKey, size: i32 },
    #[error("item {0} appears twice in one delta")]
    DuplicateItem(ItemKey),
    #[error("item {0} changes size against its base")]
    SizeMismatch(ItemKey),
    #[error("decoded snapshot exceeds {MAX_SIZE} bytes")]
    TooLarge,
}

impl From<SnapshotError> for DecodeError {
    fn from(error: SnapshotError) -> Self {
        match error {
            SnapshotError::DuplicateItem(key) => DecodeError::DuplicateItem(key),
            SnapshotError::TooManyItems => DecodeError::TooManyItems(MAX_ITEMS + 1),
            SnapshotError::TooLarge => DecodeError::TooLarge,
        }
    }
}

/// Delta decoder with per-object-type receive statistics
#[derive(Debug, Default)]
pub struct SnapshotDelta {
    data_rate: HashMap<u16, u64>,
    data_updates: HashMap<u16, u64>,
}

impl SnapshotDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bits of item payload received for `type_id` so far
    pub fn data_rate(&self, type_id: u16) -> u64 {
        self.data_rate.get(&type_id).copied().unwrap_or(0)
    }

    /// Number of item updates received for `type_id` so far
    pub fn data_updates(&self, type_id: u16) -> u64 {
        self.data_updates.get(&type_id).copied().unwrap_or(0)
    }

    pub fn reset_stats(&mut self) {
        self.data_rate.clear();
        self.data_updates.clear();
    }

    /// Unpacks `bytes` and applies the delta to `base`
    pub fn decode(&mut self, base: &Snapshot, bytes: &[u8]) -> Result<Snapshot, DecodeError> {
        let ints = varint::decompress(bytes, MAX_DELTA_INTS)?;
        self.apply(base, &ints)
    }

    /// Applies an already unpacked delta to `base`
    pub fn apply(&mut self, base: &Snapshot, delta: &[i32]) -> Result<Snapshot, DecodeError> {
        let header = delta.get(..HEADER_INTS).ok_or(DecodeError::TruncatedHeader)?;
        if header.iter().any(|&count| count < 0) {
            return Err(DecodeError::NegativeCount);
        }
        let num_deleted = header[0] as usize;
        let num_updated = header[1] as usize;
        if num_updated > MAX_ITEMS {
            return Err(DecodeError::TooManyItems(num_updated));
        }

        let mut pos = HEADER_INTS;
        let deleted: HashSet<i32> = take(delta, &mut pos, num_deleted)?
            .iter()
            .copied()
            .collect();

        let mut items: Vec<SnapshotItem> = base
            .items()
            .iter()
            .filter(|item| !deleted.contains(&item.key.packed()))
            .cloned()
            .collect();
        let kept: HashMap<ItemKey, usize> = items
            .iter()
            .enumerate()
            .map(|(index, item)| (item.key, index))
            .collect();

        let mut seen = HashSet::with_capacity(num_updated);
        let mut received: HashMap<u16, (u64, u64)> = HashMap::new();
        for _ in 0..num_updated {
            let item_header = take(delta, &mut pos, ITEM_HEADER_INTS)?;
            let (type_id, id, size) = (item_header[0], item_header[1], item_header[2]);
            let key =
                ItemKey::from_wire(type_id, id).ok_or(DecodeError::InvalidKey { type_id, id })?;
            if size < 0 || size as usize > MAX_SIZE / 4 {
                return Err(DecodeError::InvalidSize { key, size });
            }
            let words = take(delta, &mut pos, size as usize)?;

            if !seen.insert(key) {
                return Err(DecodeError::DuplicateItem(key));
            }

            match kept.get(&key) {
                Some(&index) => {
                    let item = &mut items[index];
                    if item.data.len() != words.len() {
                        return Err(DecodeError::SizeMismatch(key));
                    }
                    for (word, diff) in item.data.iter_mut().zip(words) {
                        *word = word.wrapping_add(*diff);
                    }
                }
                None => items.push(SnapshotItem::new(key, words.to_vec())),
            }

            let (bits, updates) = received.entry(key.type_id).or_default();
            *bits += words.len() as u64 * 32;
            *updates += 1;
        }

        if items.len() > MAX_ITEMS {
            return Err(DecodeError::TooManyItems(items.len()));
        }
        let snapshot = Snapshot::from_items(items)?;

        // only deltas that produced a snapshot count towards the stats
        for (type_id, (bits, updates)) in received {
            *self.data_rate.entry(type_id).or_default() += bits;
            *self.data_updates.entry(type_id).or_default() += updates;
        }
        Ok(snapshot)
    }

    /// Builds the integer stream that turns `from` into `to`
    pub fn create_delta(from: &Snapshot, to: &Snapshot) -> Vec<i32> {
        let mut deleted = Vec::new();
        for past in from.items() {
            match to.find(past.key) {
                Some(current) if current.data.len() == past.data.len() => {}
                _ => deleted.push(past.key.packed()),
            }
        }

        let mut updates = Vec::new();
        let mut num_updated = 0;
        for current in to.items() {
            let base = from
                .find(current.key)
                .filter(|past| past.data.len() == current.data.len());
            let payload: Vec<i32> = match base {
                Some(past) => {
                    if past.data == current.data {
                        continue;
                    }
                    current
                        .data
                        .iter()
                        .zip(&past.data)
                        .map(|(now, then)| now.wrapping_sub(*then))
                        .collect()
                }
                None => current.data.clone(),
            };
            updates.push(i32::from(current.key.type_id));
            updates.push(i32::from(current.key.id));
            updates.push(payload.len() as i32);
            updates.extend(payload);
            num_updated += 1;
        }

        let mut delta = Vec::with_capacity(HEADER_INTS + deleted.len() + updates.len());
        delta.push(deleted.len() as i32);
        delta.push(num_updated);
        delta.push(0);
        delta.extend(deleted);
        delta.extend(updates);
        delta
    }

    /// Wire form of the delta from `from` to `to`, or `None` when the two
    /// snapshots hold identical items
    pub fn encode(from: &Snapshot, to: &Snapshot) -> Option<Vec<u8>> {
        let delta = Self::create_delta(from, to);
        if delta[..HEADER_INTS].iter().all(|&count| count == 0) {
            return None;
        }
        Some(varint::compress(&delta))
    }
}

fn take<'a>(delta: &'a [i32], pos: &mut usize, count: usize) -> Result<&'a [i32], DecodeError> {
    let end = pos.checked_add(count).ok_or(DecodeError::Truncated)?;
    let slice = delta.get(*pos..end).ok_or(DecodeError::Truncated)?;
    *pos = end;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotBuilder;

    fn snapshot(items: &[(u16, u16, &[i32])]) -> Snapshot {
        let mut builder = SnapshotBuilder::new();
        for (type_id, id, data) in items {
            builder.add_item(*type_id, *id, data).unwrap();
        }
        builder.finish()
    }

    #[test]
    fn test_keyframe_single_item() {
        let bytes = varint::compress(&[0, 1, 0, 7, 3, 1, 42]);
        let mut codec = SnapshotDelta::new();
        let decoded = codec.decode(&Snapshot::empty(), &bytes).unwrap();

        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded.items()[0].key, ItemKey::new(7, 3));
        assert_eq!(decoded.items()[0].data, vec![42]);
        assert_eq!(decoded.crc(), 458_797);
        assert_eq!(codec.data_updates(7), 1);
        assert_eq!(codec.data_rate(7), 32);
    }

    #[test]
    fn test_update_delete_add() {
        let base = snapshot(&[(9, 0, &[10, 20, 30]), (9, 1, &[1, 1, 1]), (10, 0, &[5])]);
        let target = snapshot(&[(9, 0, &[11, 20, 29]), (10, 0, &[5]), (12, 4, &[-7, 8])]);

        let delta = SnapshotDelta::create_delta(&base, &target);
        assert_eq!(delta[0], 1);
        assert_eq!(delta[1], 2);

        let decoded = SnapshotDelta::new().apply(&base, &delta).unwrap();
        assert_eq!(decoded, target);
        assert_eq!(decoded.crc(), target.crc());
    }

    #[test]
    fn test_size_change_is_delete_and_add() {
        let base = snapshot(&[(9, 0, &[1, 2, 3])]);
        let target = snapshot(&[(9, 0, &[1, 2])]);
        let bytes = SnapshotDelta::encode(&base, &target).unwrap();
        let decoded = SnapshotDelta::new().decode(&base, &bytes).unwrap();
        assert_eq!(decoded, target);
    }

    #[test]
    fn test_unchanged_encodes_to_nothing() {
        let base = snapshot(&[(9, 0, &[1, 2, 3])]);
        assert!(SnapshotDelta::encode(&base, &base.clone()).is_none());
    }

    #[test]
    fn test_empty_delta_keeps_base() {
        let base = snapshot(&[(9, 0, &[1, 2, 3])]);
        let decoded = SnapshotDelta::new().apply(&base, &[0, 0, 0]).unwrap();
        assert_eq!(decoded, base);
    }

    #[test]
    fn test_truncated_streams() {
        let mut codec = SnapshotDelta::new();
        let base = Snapshot::empty();
        assert_eq!(codec.apply(&base, &[0, 1]), Err(DecodeError::TruncatedHeader));
        assert_eq!(codec.apply(&base, &[3, 0, 0, 1]), Err(DecodeError::Truncated));
        assert_eq!(codec.apply(&base, &[0, 1, 0, 7, 3]), Err(DecodeError::Truncated));
        assert_eq!(
            codec.apply(&base, &[0, 1, 0, 7, 3, 4, 1, 2]),
            Err(DecodeError::Truncated)
        );
    }

    #[test]
    fn test_hostile_counts_rejected() {
        let mut codec = SnapshotDelta::new();
        let base = Snapshot::empty();
        assert_eq!(codec.apply(&base, &[-1, 0, 0]), Err(DecodeError::NegativeCount));
        assert_eq!(
            codec.apply(&base, &[0, i32::MAX, 0]),
            Err(DecodeError::TooManyItems(i32::MAX as usize))
        );
        assert_eq!(
            codec.apply(&base, &[i32::MAX, 0, 0]),
            Err(DecodeError::Truncated)
        );
        assert_eq!(
            codec.apply(&base, &[0, 1, 0, 7, 3, -1]),
            Err(DecodeError::InvalidSize {
                key: ItemKey::new(7, 3),
                size: -1
            })
        );
        assert_eq!(
            codec.apply(&base, &[0, 1, 0, 0x8000, 0, 0]),
            Err(DecodeError::InvalidKey {
                type_id: 0x8000,
                id: 0
            })
        );
    }

    #[test]
    fn test_duplicate_update_rejected() {
        let mut codec = SnapshotDelta::new();
        let delta = [0, 2, 0, 7, 3, 1, 42, 7, 3, 1, 43];
        assert_eq!(
            codec.apply(&Snapshot::empty(), &delta),
            Err(DecodeError::DuplicateItem(ItemKey::new(7, 3)))
        );
    }

    #[test]
    fn test_rejected_delta_leaves_stats() {
        let mut codec = SnapshotDelta::new();
        let delta = [0, 2, 0, 7, 3, 1, 42, 7, 3, 1, 43];
        assert!(codec.apply(&Snapshot::empty(), &delta).is_err());
        assert_eq!(codec.data_updates(7), 0);
        assert_eq!(codec.data_rate(7), 0);

        codec.apply(&Snapshot::empty(), &[0, 1, 0, 7, 3, 1, 42]).unwrap();
        assert_eq!(codec.data_updates(7), 1);
        assert_eq!(codec.data_rate(7), 32);
    }

    #[test]
    fn test_size_mismatch_against_base() {
        let base = snapshot(&[(7, 3, &[1, 2])]);
        let delta = [0, 1, 0, 7, 3, 1, 42];
        assert_eq!(
            SnapshotDelta::new().apply(&base, &delta),
            Err(DecodeError::SizeMismatch(ItemKey::new(7, 3)))
        );
    }

    #[test]
    fn test_malformed_varint() {
        assert!(matches!(
            SnapshotDelta::new().decode(&Snapshot::empty(), &[0x80]),
            Err(DecodeError::Wire(WireError::Truncated))
        ));
    }

    #[test]
    fn test_deleting_unknown_key_is_ignored() {
        let base = snapshot(&[(9, 0, &[1])]);
        let delta = [1, 0, 0, ItemKey::new(50, 50).packed()];
        assert_eq!(SnapshotDelta::new().apply(&base, &delta).unwrap(), base);
    }
}
