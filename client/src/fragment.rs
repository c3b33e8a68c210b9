//! Reassembly of snapshots split across several datagrams.
//!
//! Only one snapshot is assembled at a time. Parts for a newer tick abandon
//! whatever was in progress; parts for an older tick are dropped.

use thiserror::Error;

/// Payload bytes carried by every part except possibly the last
pub const PART_SIZE: usize = 1024;
/// Width of the presence mask
pub const MAX_PARTS: usize = 64;

/// Set of received part indices
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartMask(u64);

impl PartMask {
    /// Mask with parts `0..num_parts` set
    pub fn full(num_parts: usize) -> Self {
        if num_parts >= MAX_PARTS {
            PartMask(u64::MAX)
        } else {
            PartMask((1u64 << num_parts) - 1)
        }
    }

    pub fn insert(&mut self, part: usize) {
        self.0 |= 1u64 << part;
    }

    pub fn contains(self, part: usize) -> bool {
        part < MAX_PARTS && self.0 & (1u64 << part) != 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FragmentError {
    #[error("{0} parts is outside 1..={MAX_PARTS}")]
    InvalidPartCount(i32),
    #[error("part {part} out of range for {num_parts} parts")]
    PartOutOfRange { part: i32, num_parts: i32 },
    #[error("part of {0} bytes exceeds {PART_SIZE}")]
    PartTooLarge(usize),
    #[error("tick {tick} declared {num_parts} parts, expected {expected}")]
    PartCountChanged {
        tick: i32,
        num_parts: i32,
        expected: usize,
    },
    #[error("part for tick {tick} superseded by tick {current}")]
    Superseded { tick: i32, current: i32 },
}

/// A fully reassembled snapshot payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Complete {
    pub tick: i32,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct FragmentAssembler {
    /// Tick being assembled, or the last completed one when `mask` is empty
    tick: i32,
    completed_tick: i32,
    num_parts: usize,
    mask: PartMask,
    buffer: Vec<u8>,
    part_len: [usize; MAX_PARTS],
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self {
            tick: -1,
            completed_tick: -1,
            num_parts: 0,
            mask: PartMask::default(),
            buffer: vec![0; PART_SIZE * MAX_PARTS],
            part_len: [0; MAX_PARTS],
        }
    }

    /// Records one part. Returns the whole payload once every part of the
    /// tick has arrived; an `Err` means the part was dropped and nothing changed.
    pub fn accept(
        &mut self,
        tick: i32,
        part: i32,
        num_parts: i32,
        payload: &[u8],
    ) -> Result<Option<Complete>, FragmentError> {
        if num_parts < 1 || num_parts as usize > MAX_PARTS {
            return Err(FragmentError::InvalidPartCount(num_parts));
        }
        if part < 0 || part >= num_parts {
            return Err(FragmentError::PartOutOfRange { part, num_parts });
        }
        if payload.len() > PART_SIZE {
            return Err(FragmentError::PartTooLarge(payload.len()));
        }
        if tick < self.tick || tick <= self.completed_tick {
            return Err(FragmentError::Superseded {
                tick,
                current: self.tick.max(self.completed_tick),
            });
        }

        let (part, num_parts) = (part as usize, num_parts as usize);

        if tick != self.tick {
            self.tick = tick;
            self.num_parts = num_parts;
            self.mask = PartMask::default();
        } else if num_parts != self.num_parts {
            return Err(FragmentError::PartCountChanged {
                tick,
                num_parts: num_parts as i32,
                expected: self.num_parts,
            });
        }

        let offset = part * PART_SIZE;
        self.buffer[offset..offset + payload.len()].copy_from_slice(payload);
        self.part_len[part] = payload.len();
        self.mask.insert(part);

        if self.mask != PartMask::full(self.num_parts) {
            return Ok(None);
        }

        let total: usize = self.part_len[..self.num_parts].iter().sum();
        let mut data = Vec::with_capacity(total);
        for (index, &len) in self.part_len[..self.num_parts].iter().enumerate() {
            let offset = index * PART_SIZE;
            data.extend_from_slice(&self.buffer[offset..offset + len]);
        }

        self.completed_tick = tick;
        self.mask = PartMask::default();
        Ok(Some(Complete { tick, data }))
    }

    /// Forgets all progress, including which tick completed last
    pub fn reset(&mut self) {
        self.tick = -1;
        self.completed_tick = -1;
        self.num_parts = 0;
        self.mask = PartMask::default();
    }

    /// Tick currently being assembled, if any parts are pending
    pub fn pending_tick(&self) -> Option<i32> {
        (!self.mask.is_empty()).then_some(self.tick)
    }

    pub fn received(&self) -> PartMask {
        self.mask
    }
}

impl Default for FragmentAssembler {
    fn default() -> Self {
        Self::new()
    }
}
