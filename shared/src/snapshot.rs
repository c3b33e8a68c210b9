//! World state at one server tick.
//!
//! A [`Snapshot`] is a set of items, each identified by an [`ItemKey`]
//! (object type + id) and carrying an opaque payload of 32-bit words.
//! Items are always kept sorted by key, so two snapshots holding the same
//! items compare equal and produce the same CRC no matter how they were built.

use std::fmt;
use thiserror::Error;

/// Most items a single snapshot may hold
pub const MAX_ITEMS: usize = 1024;
/// Largest snapshot payload in bytes
pub const MAX_SIZE: usize = 64 * 1024;
/// Highest valid object type tag
pub const MAX_TYPE: i32 = 0x7fff;
/// Highest valid item id
pub const MAX_ID: i32 = 0xffff;

/// Bytes accounted per item for its key word
const ITEM_HEADER_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub type_id: u16,
    pub id: u16,
}

impl ItemKey {
    pub fn new(type_id: u16, id: u16) -> Self {
        Self { type_id, id }
    }

    /// Validates a key read off the wire
    pub fn from_wire(type_id: i32, id: i32) -> Option<Self> {
        if !(0..=MAX_TYPE).contains(&type_id) || !(0..=MAX_ID).contains(&id) {
            return None;
        }
        Some(Self::new(type_id as u16, id as u16))
    }

    /// Single-word form `type << 16 | id`
    pub fn packed(self) -> i32 {
        (i32::from(self.type_id) << 16) | i32::from(self.id)
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_id, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotItem {
    pub key: ItemKey,
    pub data: Vec<i32>,
}

impl SnapshotItem {
    pub fn new(key: ItemKey, data: Vec<i32>) -> Self {
        Self { key, data }
    }

    pub fn byte_size(&self) -> usize {
        ITEM_HEADER_SIZE + self.data.len() * 4
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("item {0} appears twice")]
    DuplicateItem(ItemKey),
    #[error("more than {MAX_ITEMS} items")]
    TooManyItems,
    #[error("payload exceeds {MAX_SIZE} bytes")]
    TooLarge,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    items: Vec<SnapshotItem>,
}

impl Snapshot {
    /// The canonical empty snapshot used as the base of a keyframe
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a snapshot from items in any order
    pub fn from_items(mut items: Vec<SnapshotItem>) -> Result<Self, SnapshotError> {
        if items.len() > MAX_ITEMS {
            return Err(SnapshotError::TooManyItems);
        }
        items.sort_by_key(|item| item.key);
        if let Some(pair) = items.windows(2).find(|pair| pair[0].key == pair[1].key) {
            return Err(SnapshotError::DuplicateItem(pair[0].key));
        }
        let snapshot = Self { items };
        if snapshot.data_size() > MAX_SIZE {
            return Err(SnapshotError::TooLarge);
        }
        Ok(snapshot)
    }

    pub fn items(&self) -> &[SnapshotItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn find(&self, key: ItemKey) -> Option<&SnapshotItem> {
        self.items
            .binary_search_by_key(&key, |item| item.key)
            .ok()
            .map(|index| &self.items[index])
    }

    pub fn items_of_type(&self, type_id: u16) -> impl Iterator<Item = &SnapshotItem> {
        self.items
            .iter()
            .filter(move |item| item.key.type_id == type_id)
    }

    /// Bytes taken by item keys and payloads
    pub fn data_size(&self) -> usize {
        self.items.iter().map(SnapshotItem::byte_size).sum()
    }

    /// Checksum sent alongside every delta.
    ///
    /// Wrapping sum of every item's key word and payload words. Addition
    /// commutes, so the value does not depend on item order.
    pub fn crc(&self) -> u32 {
        self.items.iter().fold(0u32, |crc, item| {
            let crc = crc.wrapping_add(item.key.packed() as u32);
            item.data
                .iter()
                .fold(crc, |crc, &word| crc.wrapping_add(word as u32))
        })
    }
}

/// Collects items for one snapshot and rejects duplicates early
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    items: Vec<SnapshotItem>,
    size: usize,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_item(&mut self, type_id: u16, id: u16, data: &[i32]) -> Result<(), SnapshotError> {
        let key = ItemKey::new(type_id, id);
        if self.items.iter().any(|item| item.key == key) {
            return Err(SnapshotError::DuplicateItem(key));
        }
        if self.items.len() == MAX_ITEMS {
            return Err(SnapshotError::TooManyItems);
        }
        let item = SnapshotItem::new(key, data.to_vec());
        if self.size + item.byte_size() > MAX_SIZE {
            return Err(SnapshotError::TooLarge);
        }
        self.size += item.byte_size();
        self.items.push(item);
        Ok(())
    }

    pub fn finish(mut self) -> Snapshot {
        self.items.sort_by_key(|item| item.key);
        Snapshot { items: self.items }
    }
}
