//! Shareable array: a slot table over the data region, addressed purely
//! by byte offset so it can cross the same handoff boundary as the map.

use std::sync::Arc;
use std::time::Duration;

use crate::encoder::{encoder_for_id, select_encoder, Value, ValueEncoder};
use crate::envelope::{region_from_bytes, RegionKind, TransferableState};
use crate::error::{StoreError, StoreResult};
use crate::layout::{
    array_entry, array_header, lock_state_offset_for_array, next_region_size,
    read_count_offset_for_array, ArrayEntry, ArrayIndex, DEFRAG_THRESHOLD, INITIAL_DATA_OFFSET,
    SLOT_ABSENT, SLOT_UNINITIALIZED,
};
use crate::lock::RwLock;
use crate::region::Region;

pub struct ArrayOptions {
    pub name: Option<String>,
    pub initial_slots: u32,
    pub max_index_bytes: usize,
    pub max_data_bytes: usize,
    pub lock_timeout: Duration,
    pub encoder: Option<Arc<dyn ValueEncoder>>,
}

impl Default for ArrayOptions {
    fn default() -> Self {
        ArrayOptions {
            name: None,
            initial_slots: 16,
            max_index_bytes: 16 * 1024 * 1024,
            max_data_bytes: 64 * 1024 * 1024,
            lock_timeout: crate::lock::DEFAULT_TIMEOUT,
            encoder: None,
        }
    }
}

pub struct ShareableArray {
    index: Region,
    data: Region,
    lock_timeout: Duration,
    encoder: Option<Arc<dyn ValueEncoder>>,
}

impl ShareableArray {
    pub fn new(options: ArrayOptions, initial_items: &[Value]) -> StoreResult<Self> {
        let slot_count = options.initial_slots.max(1);
        let index_len = array_header::HEADER_LEN + slot_count as usize * 4;
        if index_len > options.max_index_bytes {
            return Err(StoreError::InvalidConfiguration(
                "max_index_bytes too small to hold initial_slots",
            ));
        }
        let index = match &options.name {
            Some(name) => Region::new_shared(&format!("{name}.index"), index_len, options.max_index_bytes)?,
            None => Region::new_local(index_len, options.max_index_bytes)?,
        };
        let data_len = INITIAL_DATA_OFFSET as usize;
        let data = match &options.name {
            Some(name) => Region::new_shared(&format!("{name}.data"), data_len, options.max_data_bytes)?,
            None => Region::new_local(data_len, options.max_data_bytes)?,
        };
        ArrayIndex::new(&index).reset();
        let array = ShareableArray {
            index,
            data,
            lock_timeout: options.lock_timeout,
            encoder: options.encoder,
        };
        for item in initial_items {
            array.push(item)?;
        }
        Ok(array)
    }

    pub(crate) fn from_regions(index_bytes: Vec<u8>, data_bytes: Vec<u8>) -> StoreResult<Self> {
        let index = region_from_bytes(index_bytes)?;
        let data = region_from_bytes(data_bytes)?;
        Ok(ShareableArray {
            index,
            data,
            lock_timeout: crate::lock::DEFAULT_TIMEOUT,
            encoder: None,
        })
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn ValueEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    fn rw_lock(&self) -> RwLock<'_> {
        RwLock::new(&self.index, lock_state_offset_for_array(), read_count_offset_for_array())
            .with_timeout(self.lock_timeout)
    }

    pub fn len(&self) -> StoreResult<u32> {
        let rw_lock = self.rw_lock();
        let _guard = rw_lock.acquire_read()?;
        Ok(ArrayIndex::new(&self.index).length())
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// `readItem`/`at` (spec.md §4.4.3). Out of range or the explicit
    /// absent sentinel both read as `None`.
    pub fn at(&self, index: u32) -> StoreResult<Option<Value>> {
        let rw_lock = self.rw_lock();
        let _guard = rw_lock.acquire_read()?;
        let idx = ArrayIndex::new(&self.index);
        if index >= idx.length() {
            return Ok(None);
        }
        let slot = idx.slot(index);
        if slot == SLOT_UNINITIALIZED || slot == SLOT_ABSENT {
            return Ok(None);
        }
        let entry = ArrayEntry::at(&self.data, slot);
        let scratch = entry.value_bytes().to_vec();
        let value = self.decode_value(entry.encoder_id() as u16, &scratch)?;
        Ok(Some(value))
    }

    pub fn push(&self, value: &Value) -> StoreResult<u32> {
        let rw_lock = self.rw_lock();
        let _guard = rw_lock.acquire_write()?;
        let index = ArrayIndex::new(&self.index).length();
        self.ensure_slot_capacity(index)?;
        let idx = ArrayIndex::new(&self.index);
        self.write_slot(&idx, index, Some(value))?;
        idx.set_length(index + 1);
        Ok(index)
    }

    pub fn pop(&self) -> StoreResult<Option<Value>> {
        let rw_lock = self.rw_lock();
        let _guard = rw_lock.acquire_write()?;
        let idx = ArrayIndex::new(&self.index);
        let length = idx.length();
        if length == 0 {
            return Ok(None);
        }
        let last = length - 1;
        let slot = idx.slot(last);
        let value = if slot == SLOT_UNINITIALIZED || slot == SLOT_ABSENT {
            None
        } else {
            let entry = ArrayEntry::at(&self.data, slot);
            let scratch = entry.value_bytes().to_vec();
            idx.set_used_space(idx.used_space() - entry.byte_len());
            Some(self.decode_value(entry.encoder_id() as u16, &scratch)?)
        };
        idx.set_slot(last, SLOT_UNINITIALIZED);
        idx.set_length(last);
        Ok(value)
    }

    /// `set(index, value)` (spec.md §4.4.2): writes at an existing or
    /// beyond-length index, extending `length` and the slot table as
    /// needed.
    pub fn set(&self, index: u32, value: &Value) -> StoreResult<()> {
        let rw_lock = self.rw_lock();
        let _guard = rw_lock.acquire_write()?;
        self.ensure_slot_capacity(index)?;
        let idx = ArrayIndex::new(&self.index);
        self.write_slot(&idx, index, Some(value))?;
        if index + 1 > idx.length() {
            idx.set_length(index + 1);
        }
        Ok(())
    }

    /// Writes the explicit absent marker at `index` without shifting
    /// anything — distinct from [`ShareableArray::delete`], which shifts.
    pub fn unset(&self, index: u32) -> StoreResult<()> {
        let rw_lock = self.rw_lock();
        let _guard = rw_lock.acquire_write()?;
        self.ensure_slot_capacity(index)?;
        let idx = ArrayIndex::new(&self.index);
        self.write_slot(&idx, index, None)?;
        if index + 1 > idx.length() {
            idx.set_length(index + 1);
        }
        Ok(())
    }

    /// Shifts all slots after `index` one to the left and decrements
    /// `length` (spec.md §4.4.4).
    pub fn delete(&self, index: u32) -> StoreResult<bool> {
        let rw_lock = self.rw_lock();
        let _guard = rw_lock.acquire_write()?;
        let idx = ArrayIndex::new(&self.index);
        let length = idx.length();
        if index >= length {
            return Ok(false);
        }
        let removed = idx.slot(index);
        if removed != SLOT_UNINITIALIZED && removed != SLOT_ABSENT {
            let entry = ArrayEntry::at(&self.data, removed);
            idx.set_used_space(idx.used_space() - entry.byte_len());
        }
        for i in index..length - 1 {
            let next = idx.slot(i + 1);
            idx.set_slot(i, next);
        }
        idx.set_slot(length - 1, SLOT_UNINITIALIZED);
        idx.set_length(length - 1);
        Ok(true)
    }

    /// Shifts all slots at positions `>= index` one to the right, growing
    /// the slot table first if needed, then writes `value` at `index`.
    /// Backs `unshift` (index 0) and middle-of-array `splice` insertion.
    pub fn insert(&self, index: u32, value: &Value) -> StoreResult<()> {
        let rw_lock = self.rw_lock();
        let _guard = rw_lock.acquire_write()?;
        let length = ArrayIndex::new(&self.index).length();
        let insert_at = index.min(length);
        self.ensure_slot_capacity(length)?;
        let idx = ArrayIndex::new(&self.index);
        let mut i = length;
        while i > insert_at {
            let prev = idx.slot(i - 1);
            idx.set_slot(i, prev);
            i -= 1;
        }
        idx.set_slot(insert_at, SLOT_UNINITIALIZED);
        idx.set_length(length + 1);
        self.write_slot(&idx, insert_at, Some(value))?;
        Ok(())
    }

    pub fn clear(&self) -> StoreResult<()> {
        let rw_lock = self.rw_lock();
        let _guard = rw_lock.acquire_write()?;
        ArrayIndex::new(&self.index).reset();
        self.data.set_len(INITIAL_DATA_OFFSET as usize);
        Ok(())
    }

    /// Snapshot every element (sentinel absences as `None`) under a
    /// single read lock.
    pub fn snapshot(&self) -> StoreResult<Vec<Option<Value>>> {
        let rw_lock = self.rw_lock();
        let _guard = rw_lock.acquire_read()?;
        let idx = ArrayIndex::new(&self.index);
        let length = idx.length();
        let mut out = Vec::with_capacity(length as usize);
        for i in 0..length {
            let slot = idx.slot(i);
            if slot == SLOT_UNINITIALIZED || slot == SLOT_ABSENT {
                out.push(None);
            } else {
                let entry = ArrayEntry::at(&self.data, slot);
                let scratch = entry.value_bytes().to_vec();
                out.push(Some(self.decode_value(entry.encoder_id() as u16, &scratch)?));
            }
        }
        Ok(out)
    }

    pub fn into_transferable(self) -> TransferableState {
        TransferableState::new(self.index.to_vec(), self.data.to_vec(), RegionKind::Array)
    }

    pub(crate) fn decode_value(&self, id: u16, bytes: &[u8]) -> StoreResult<Value> {
        if let Some(user) = &self.encoder {
            if user.id() == id {
                return user.decode(bytes);
            }
        }
        match encoder_for_id(id) {
            Some(enc) => enc.decode(bytes),
            None => Err(StoreError::InvalidLayout("value has an unrecognized encoder id")),
        }
    }

    fn write_slot(&self, idx: &ArrayIndex, index: u32, value: Option<&Value>) -> StoreResult<()> {
        let prev_slot = idx.slot(index);
        if prev_slot != SLOT_UNINITIALIZED && prev_slot != SLOT_ABSENT {
            let prev_entry = ArrayEntry::at(&self.data, prev_slot);
            idx.set_used_space(idx.used_space() - prev_entry.byte_len());
        }
        match value {
            None => idx.set_slot(index, SLOT_ABSENT),
            Some(v) => {
                let encoder = select_encoder(v, self.encoder.as_deref());
                let mut encoded = Vec::with_capacity(encoder.max_len(v));
                encoder.encode(v, &mut encoded)?;
                let needed = array_entry::HEADER_LEN as u32 + encoded.len() as u32;
                self.ensure_data_capacity(idx, needed)?;
                let offset = idx.free_start();
                ArrayEntry::write_new(&self.data, offset, encoder.id() as u32, &encoded);
                idx.set_slot(index, offset);
                idx.set_free_start(offset + needed);
                idx.set_used_space(idx.used_space() + needed);
            }
        }
        Ok(())
    }

    fn ensure_slot_capacity(&self, index: u32) -> StoreResult<()> {
        let required_slots = index + 1;
        let idx = ArrayIndex::new(&self.index);
        let mut slot_count = idx.slot_count().max(1);
        if required_slots <= slot_count {
            return Ok(());
        }
        while slot_count < required_slots {
            slot_count *= 2;
        }
        let new_index_len = array_header::HEADER_LEN + slot_count as usize * 4;
        self.index.grow_to(new_index_len)?;
        Ok(())
    }

    fn ensure_data_capacity(&self, idx: &ArrayIndex, needed: u32) -> StoreResult<()> {
        let required = idx.free_start() as u64 + needed as u64;
        if required <= self.data.len() as u64 {
            return Ok(());
        }
        let total = self.data.len() as u32;
        let live = idx.used_space();
        if total > 0 && (live as f64 / total as f64) < DEFRAG_THRESHOLD {
            self.defragment(idx)?;
            if idx.free_start() as u64 + needed as u64 <= self.data.len() as u64 {
                return Ok(());
            }
        }
        let new_len = next_region_size(self.data.len(), needed as usize);
        self.data.grow_to(new_len)?;
        tracing::debug!(new_len, "array data region grown");
        Ok(())
    }

    /// Packs every live entry contiguously in position order, per
    /// spec.md §4.4.5.
    pub(crate) fn defragment(&self, idx: &ArrayIndex) -> StoreResult<()> {
        let length = idx.length();
        let mut cursor = INITIAL_DATA_OFFSET;
        for i in 0..length {
            let slot = idx.slot(i);
            if slot == SLOT_UNINITIALIZED || slot == SLOT_ABSENT {
                continue;
            }
            let entry = ArrayEntry::at(&self.data, slot);
            let len = entry.byte_len();
            if slot != cursor {
                self.data.copy_within(slot as usize, cursor as usize, len as usize);
            }
            idx.set_slot(i, cursor);
            cursor += len;
        }
        idx.set_free_start(cursor);
        idx.set_used_space(cursor - INITIAL_DATA_OFFSET);
        tracing::debug!(free_start = cursor, "array data region defragmented");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_array() -> ShareableArray {
        ShareableArray::new(
            ArrayOptions {
                initial_slots: 4,
                max_index_bytes: 4096,
                max_data_bytes: 1 << 20,
                ..Default::default()
            },
            &[],
        )
        .unwrap()
    }

    #[test]
    fn new_seeds_initial_items() {
        let array = ShareableArray::new(
            ArrayOptions {
                initial_slots: 4,
                max_index_bytes: 4096,
                max_data_bytes: 1 << 20,
                ..Default::default()
            },
            &[Value::Int(1), Value::Int(2), Value::Int(3)],
        )
        .unwrap();
        assert_eq!(array.len().unwrap(), 3);
        assert_eq!(array.at(2).unwrap(), Some(Value::Int(3)));
    }

    #[test]
    fn push_then_at_round_trips() {
        let array = small_array();
        array.push(&Value::Int(1)).unwrap();
        array.push(&Value::Int(2)).unwrap();
        assert_eq!(array.len().unwrap(), 2);
        assert_eq!(array.at(0).unwrap(), Some(Value::Int(1)));
        assert_eq!(array.at(1).unwrap(), Some(Value::Int(2)));
    }

    #[test]
    fn pop_returns_and_removes_last() {
        let array = small_array();
        array.push(&Value::Int(1)).unwrap();
        array.push(&Value::Int(2)).unwrap();
        assert_eq!(array.pop().unwrap(), Some(Value::Int(2)));
        assert_eq!(array.len().unwrap(), 1);
    }

    #[test]
    fn set_past_end_extends_length() {
        let array = small_array();
        array.set(3, &Value::Int(42)).unwrap();
        assert_eq!(array.len().unwrap(), 4);
        assert_eq!(array.at(3).unwrap(), Some(Value::Int(42)));
        assert_eq!(array.at(1).unwrap(), None);
    }

    #[test]
    fn delete_shifts_left() {
        let array = small_array();
        for i in 0..5 {
            array.push(&Value::Int(i)).unwrap();
        }
        assert!(array.delete(1).unwrap());
        assert_eq!(array.len().unwrap(), 4);
        let snapshot = array.snapshot().unwrap();
        assert_eq!(
            snapshot,
            vec![Some(Value::Int(0)), Some(Value::Int(2)), Some(Value::Int(3)), Some(Value::Int(4))]
        );
    }

    #[test]
    fn insert_shifts_right() {
        let array = small_array();
        for i in 0..3 {
            array.push(&Value::Int(i)).unwrap();
        }
        array.insert(1, &Value::Int(99)).unwrap();
        let snapshot = array.snapshot().unwrap();
        assert_eq!(
            snapshot,
            vec![
                Some(Value::Int(0)),
                Some(Value::Int(99)),
                Some(Value::Int(1)),
                Some(Value::Int(2)),
            ]
        );
    }

    #[test]
    fn unset_marks_absent_without_shifting() {
        let array = small_array();
        array.push(&Value::Int(1)).unwrap();
        array.push(&Value::Int(2)).unwrap();
        array.unset(0).unwrap();
        assert_eq!(array.at(0).unwrap(), None);
        assert_eq!(array.len().unwrap(), 2);
    }

    #[test]
    fn grows_slot_table_beyond_initial_capacity() {
        let array = small_array();
        for i in 0..64 {
            array.push(&Value::Int(i)).unwrap();
        }
        assert_eq!(array.len().unwrap(), 64);
        for i in 0..64 {
            assert_eq!(array.at(i).unwrap(), Some(Value::Int(i as i64)));
        }
    }

    #[test]
    fn handoff_round_trip_preserves_state() {
        let array = small_array();
        array.push(&Value::Int(1)).unwrap();
        array.push(&Value::Str("two".into())).unwrap();
        let envelope = array.into_transferable();
        let rebuilt = envelope.into_array().unwrap();
        assert_eq!(rebuilt.len().unwrap(), 2);
        assert_eq!(rebuilt.at(0).unwrap(), Some(Value::Int(1)));
        assert_eq!(rebuilt.at(1).unwrap(), Some(Value::Str("two".into())));
    }
}
