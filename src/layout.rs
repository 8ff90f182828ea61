//! `repr`-free but fixed-offset byte layouts for the map and array index
//! and data regions. Every accessor here reads/writes through
//! [`crate::region::Region`]'s endian-explicit big-endian loads/stores —
//! nothing is ever cast through a `repr(C)` struct pointer, since these
//! layouts are shared between execution contexts that may disagree on
//! native struct padding.

use crate::region::Region;

/// Fraction of buckets that may be occupied before a map rehashes.
pub const LOAD_FACTOR: f64 = 0.75;

/// Live/total ratio below which a `set` prefers defragmentation over growth.
pub const DEFRAG_THRESHOLD: f64 = 0.5;

/// Once a data region exceeds this size, growth switches from doubling to
/// a flat additive step.
pub const GROWTH_DOUBLING_CEILING: usize = 512 * 1024 * 1024;

/// Additive growth step once `GROWTH_DOUBLING_CEILING` is exceeded.
pub const GROWTH_ADDITIVE_STEP: usize = 256 * 1024 * 1024;

/// Offset 0 in a data region is reserved and never allocated to; the
/// smallest valid entry offset is 4.
pub const INITIAL_DATA_OFFSET: u32 = 4;

pub mod lock_state {
    pub const UNLOCKED: u32 = 0;
    pub const WRITE_LOCKED: u32 = 1;
    pub const READ_LOCKED: u32 = 2;
}

// ---------------------------------------------------------------------
// Map index header (spec.md §3.2): bytes 0..24, then bucket[] (32-bit each)
// ---------------------------------------------------------------------

pub mod map_header {
    pub const SIZE: usize = 0;
    pub const BUCKETS_IN_USE: usize = 4;
    pub const FREE_START: usize = 8;
    pub const LOCK_STATE: usize = 12;
    pub const USED_SPACE: usize = 16;
    pub const READ_COUNT: usize = 20;
    pub const HEADER_LEN: usize = 24;
    pub const BUCKET_TABLE_OFFSET: usize = HEADER_LEN;
}

pub struct MapIndex<'a> {
    pub region: &'a Region,
}

impl<'a> MapIndex<'a> {
    pub fn new(region: &'a Region) -> Self {
        MapIndex { region }
    }

    pub fn bucket_count(&self) -> u32 {
        ((self.region.len() - map_header::HEADER_LEN) / 4) as u32
    }

    pub fn size(&self) -> u32 {
        self.region.load_u32(map_header::SIZE)
    }
    pub fn set_size(&self, v: u32) {
        self.region.store_u32(map_header::SIZE, v);
    }
    pub fn buckets_in_use(&self) -> u32 {
        self.region.load_u32(map_header::BUCKETS_IN_USE)
    }
    pub fn set_buckets_in_use(&self, v: u32) {
        self.region.store_u32(map_header::BUCKETS_IN_USE, v);
    }
    pub fn free_start(&self) -> u32 {
        self.region.load_u32(map_header::FREE_START)
    }
    pub fn set_free_start(&self, v: u32) {
        self.region.store_u32(map_header::FREE_START, v);
    }
    pub fn used_space(&self) -> u32 {
        self.region.load_u32(map_header::USED_SPACE)
    }
    pub fn set_used_space(&self, v: u32) {
        self.region.store_u32(map_header::USED_SPACE, v);
    }

    pub fn bucket_offset(&self, bucket: u32) -> u32 {
        self.region
            .load_u32(map_header::BUCKET_TABLE_OFFSET + bucket as usize * 4)
    }
    pub fn set_bucket_offset(&self, bucket: u32, entry_offset: u32) {
        self.region
            .store_u32(map_header::BUCKET_TABLE_OFFSET + bucket as usize * 4, entry_offset);
    }

    /// Zero the header and every bucket slot — used on creation and `clear`.
    pub fn reset(&self) {
        let bucket_count = self.bucket_count();
        self.region.zero_range(
            0,
            map_header::BUCKET_TABLE_OFFSET + bucket_count as usize * 4,
        );
        self.set_free_start(INITIAL_DATA_OFFSET);
    }
}

// ---------------------------------------------------------------------
// Map entry record in D (spec.md §3.3): 20-byte header + key + value
// ---------------------------------------------------------------------

pub mod map_entry {
    pub const NEXT_OFFSET: usize = 0;
    pub const KEY_LENGTH: usize = 4;
    pub const VALUE_LENGTH: usize = 8;
    pub const KEY_KIND: usize = 12;
    pub const VALUE_ENCODER_ID: usize = 14;
    pub const HASH: usize = 16;
    pub const HEADER_LEN: usize = 20;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    RawString = 1,
    StringifiedComposite = 0,
}

impl KeyKind {
    pub fn from_u16(v: u16) -> Self {
        if v == 1 {
            KeyKind::RawString
        } else {
            KeyKind::StringifiedComposite
        }
    }
}

pub struct MapEntry<'a> {
    pub region: &'a Region,
    pub offset: u32,
}

impl<'a> MapEntry<'a> {
    pub fn at(region: &'a Region, offset: u32) -> Self {
        MapEntry { region, offset }
    }

    fn f(&self, field: usize) -> usize {
        self.offset as usize + field
    }

    pub fn next_offset(&self) -> u32 {
        self.region.load_u32(self.f(map_entry::NEXT_OFFSET))
    }
    pub fn set_next_offset(&self, v: u32) {
        self.region.store_u32(self.f(map_entry::NEXT_OFFSET), v);
    }
    pub fn key_length(&self) -> u32 {
        self.region.load_u32(self.f(map_entry::KEY_LENGTH))
    }
    pub fn value_length(&self) -> u32 {
        self.region.load_u32(self.f(map_entry::VALUE_LENGTH))
    }
    pub fn set_value_length(&self, v: u32) {
        self.region.store_u32(self.f(map_entry::VALUE_LENGTH), v);
    }
    pub fn key_kind(&self) -> KeyKind {
        KeyKind::from_u16(self.region.load_u16(self.f(map_entry::KEY_KIND)))
    }
    pub fn value_encoder_id(&self) -> u16 {
        self.region.load_u16(self.f(map_entry::VALUE_ENCODER_ID))
    }
    pub fn set_value_encoder_id(&self, v: u16) {
        self.region.store_u16(self.f(map_entry::VALUE_ENCODER_ID), v);
    }
    pub fn hash(&self) -> u32 {
        self.region.load_u32(self.f(map_entry::HASH))
    }

    pub fn key_offset(&self) -> usize {
        self.f(map_entry::HEADER_LEN)
    }
    pub fn value_offset(&self) -> usize {
        self.key_offset() + self.key_length() as usize
    }

    pub fn key_bytes(&self) -> &'a [u8] {
        self.region.read_slice(self.key_offset(), self.key_length() as usize)
    }
    pub fn value_bytes(&self) -> &'a [u8] {
        self.region.read_slice(self.value_offset(), self.value_length() as usize)
    }

    /// Total footprint of this entry in D: header + key + value.
    pub fn byte_len(&self) -> u32 {
        map_entry::HEADER_LEN as u32 + self.key_length() + self.value_length()
    }

    /// Write a brand new entry header + key + value at `offset`.
    #[allow(clippy::too_many_arguments)]
    pub fn write_new(
        region: &Region,
        offset: u32,
        next_offset: u32,
        key_kind: KeyKind,
        value_encoder_id: u16,
        hash: u32,
        key: &[u8],
        value: &[u8],
    ) {
        let base = offset as usize;
        region.store_u32(base + map_entry::NEXT_OFFSET, next_offset);
        region.store_u32(base + map_entry::KEY_LENGTH, key.len() as u32);
        region.store_u32(base + map_entry::VALUE_LENGTH, value.len() as u32);
        region.store_u16(base + map_entry::KEY_KIND, key_kind as u16);
        region.store_u16(base + map_entry::VALUE_ENCODER_ID, value_encoder_id);
        region.store_u32(base + map_entry::HASH, hash);
        region.copy_from_slice(base + map_entry::HEADER_LEN, key);
        region.copy_from_slice(base + map_entry::HEADER_LEN + key.len(), value);
    }
}

// ---------------------------------------------------------------------
// Array index header (spec.md §3.4, extended per §5 to carry lock words)
// ---------------------------------------------------------------------

pub mod array_header {
    pub const LENGTH: usize = 0;
    pub const FREE_START: usize = 4;
    pub const USED_SPACE: usize = 8;
    pub const LOCK_STATE: usize = 12;
    pub const READ_COUNT: usize = 16;
    pub const HEADER_LEN: usize = 20;
    pub const SLOT_TABLE_OFFSET: usize = HEADER_LEN;
}

/// Sentinel slot values.
pub const SLOT_UNINITIALIZED: u32 = 0;
pub const SLOT_ABSENT: u32 = 1;

pub struct ArrayIndex<'a> {
    pub region: &'a Region,
}

impl<'a> ArrayIndex<'a> {
    pub fn new(region: &'a Region) -> Self {
        ArrayIndex { region }
    }

    pub fn slot_count(&self) -> u32 {
        ((self.region.len() - array_header::HEADER_LEN) / 4) as u32
    }

    pub fn length(&self) -> u32 {
        self.region.load_u32(array_header::LENGTH)
    }
    pub fn set_length(&self, v: u32) {
        self.region.store_u32(array_header::LENGTH, v);
    }
    pub fn free_start(&self) -> u32 {
        self.region.load_u32(array_header::FREE_START)
    }
    pub fn set_free_start(&self, v: u32) {
        self.region.store_u32(array_header::FREE_START, v);
    }
    pub fn used_space(&self) -> u32 {
        self.region.load_u32(array_header::USED_SPACE)
    }
    pub fn set_used_space(&self, v: u32) {
        self.region.store_u32(array_header::USED_SPACE, v);
    }

    pub fn slot(&self, index: u32) -> u32 {
        self.region.load_u32(array_header::SLOT_TABLE_OFFSET + index as usize * 4)
    }
    pub fn set_slot(&self, index: u32, value: u32) {
        self.region
            .store_u32(array_header::SLOT_TABLE_OFFSET + index as usize * 4, value);
    }

    pub fn reset(&self) {
        let slot_count = self.slot_count();
        self.region.zero_range(
            array_header::HEADER_LEN,
            slot_count as usize * 4,
        );
        self.region.store_u32(array_header::LENGTH, 0);
        self.region.store_u32(array_header::FREE_START, INITIAL_DATA_OFFSET);
        self.region.store_u32(array_header::USED_SPACE, 0);
    }
}

// ---------------------------------------------------------------------
// Array entry record in D (spec.md §3.5): 8-byte header + value
// ---------------------------------------------------------------------

pub mod array_entry {
    pub const ENCODER_ID: usize = 0;
    pub const VALUE_LENGTH: usize = 4;
    pub const HEADER_LEN: usize = 8;
}

pub struct ArrayEntry<'a> {
    pub region: &'a Region,
    pub offset: u32,
}

impl<'a> ArrayEntry<'a> {
    pub fn at(region: &'a Region, offset: u32) -> Self {
        ArrayEntry { region, offset }
    }

    pub fn encoder_id(&self) -> u32 {
        self.region.load_u32(self.offset as usize + array_entry::ENCODER_ID)
    }
    pub fn value_length(&self) -> u32 {
        self.region.load_u32(self.offset as usize + array_entry::VALUE_LENGTH)
    }
    pub fn value_bytes(&self) -> &'a [u8] {
        self.region.read_slice(
            self.offset as usize + array_entry::HEADER_LEN,
            self.value_length() as usize,
        )
    }
    pub fn byte_len(&self) -> u32 {
        array_entry::HEADER_LEN as u32 + self.value_length()
    }

    pub fn write_new(region: &Region, offset: u32, encoder_id: u32, value: &[u8]) {
        let base = offset as usize;
        region.store_u32(base + array_entry::ENCODER_ID, encoder_id);
        region.store_u32(base + array_entry::VALUE_LENGTH, value.len() as u32);
        region.copy_from_slice(base + array_entry::HEADER_LEN, value);
    }
}

/// Growth target for a region currently sized `current`, needing room for
/// at least `current + additional` bytes — spec.md §4.5.
pub fn next_region_size(current: usize, additional: usize) -> usize {
    let needed = current + additional;
    let mut target = if current == 0 { additional.max(64) } else { current };
    while target < needed {
        if target >= GROWTH_DOUBLING_CEILING {
            target += GROWTH_ADDITIVE_STEP;
        } else {
            target *= 2;
        }
    }
    target
}

#[inline]
pub fn lock_state_offset_for_map() -> usize {
    map_header::LOCK_STATE
}
#[inline]
pub fn read_count_offset_for_map() -> usize {
    map_header::READ_COUNT
}
#[inline]
pub fn lock_state_offset_for_array() -> usize {
    array_header::LOCK_STATE
}
#[inline]
pub fn read_count_offset_for_array() -> usize {
    array_header::READ_COUNT
}
