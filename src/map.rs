//! Shareable hash map: an open-hash bucket table with chained entries,
//! both regions addressed entirely by byte offset so the container can be
//! torn down into a [`crate::envelope::TransferableState`] and rebuilt in
//! another execution context without re-walking a single entry.

use std::sync::Arc;
use std::time::Duration;

use crate::encoder::{encoder_for_id, select_encoder, GeneralEncoder, Value, ValueEncoder};
use crate::envelope::{region_from_bytes, RegionKind, TransferableState};
use crate::error::{EncoderError, StoreError, StoreResult};
use crate::hash::fnv1a_32;
use crate::layout::{
    lock_state_offset_for_map, map_entry, map_header, next_region_size, read_count_offset_for_map,
    KeyKind, MapEntry, MapIndex, DEFRAG_THRESHOLD, INITIAL_DATA_OFFSET, LOAD_FACTOR,
};
use crate::lock::RwLock;
use crate::region::Region;

/// Construction-time configuration for a [`ShareableMap`].
pub struct MapOptions {
    /// When set, the map's regions live in POSIX shared memory under this
    /// name (suffixed `.index`/`.data`); otherwise they are process-local.
    pub name: Option<String>,
    pub initial_buckets: u32,
    /// Upper bound reserved for the index region; rehashing beyond this
    /// fails with [`StoreError::CapacityExhausted`] rather than relocating.
    pub max_index_bytes: usize,
    /// Upper bound reserved for the data region.
    pub max_data_bytes: usize,
    pub lock_timeout: Duration,
    pub encoder: Option<Arc<dyn ValueEncoder>>,
}

impl Default for MapOptions {
    fn default() -> Self {
        MapOptions {
            name: None,
            initial_buckets: 16,
            max_index_bytes: 16 * 1024 * 1024,
            max_data_bytes: 64 * 1024 * 1024,
            lock_timeout: crate::lock::DEFAULT_TIMEOUT,
            encoder: None,
        }
    }
}

pub struct ShareableMap {
    index: Region,
    data: Region,
    lock_timeout: Duration,
    encoder: Option<Arc<dyn ValueEncoder>>,
}

impl ShareableMap {
    pub fn new(options: MapOptions) -> StoreResult<Self> {
        let bucket_count = options.initial_buckets.max(1);
        let index_len = map_header::HEADER_LEN + bucket_count as usize * 4;
        if index_len > options.max_index_bytes {
            return Err(StoreError::InvalidConfiguration(
                "max_index_bytes too small to hold initial_buckets",
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
        MapIndex::new(&index).reset();
        Ok(ShareableMap {
            index,
            data,
            lock_timeout: options.lock_timeout,
            encoder: options.encoder,
        })
    }

    /// Rebuild a map from envelope bytes, regaining growth headroom by
    /// doubling the handed-off size as the new capacity reservation (the
    /// spec's byte layout says nothing about headroom; a transferred
    /// container staying usable rather than frozen is a deliberate choice).
    pub(crate) fn from_regions(index_bytes: Vec<u8>, data_bytes: Vec<u8>) -> StoreResult<Self> {
        let index = region_from_bytes(index_bytes)?;
        let data = region_from_bytes(data_bytes)?;
        Ok(ShareableMap {
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
        RwLock::new(&self.index, lock_state_offset_for_map(), read_count_offset_for_map())
            .with_timeout(self.lock_timeout)
    }

    pub fn len(&self) -> StoreResult<u32> {
        let rw_lock = self.rw_lock();
        let _guard = rw_lock.acquire_read()?;
        Ok(MapIndex::new(&self.index).size())
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn has(&self, key: &Value) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn get(&self, key: &Value) -> StoreResult<Option<Value>> {
        let (key_bytes, _) = canonicalize_key(key);
        let hash = fnv1a_32(&key_bytes);
        let rw_lock = self.rw_lock();
        let _guard = rw_lock.acquire_read()?;
        let idx = MapIndex::new(&self.index);
        let bucket_count = idx.bucket_count();
        if bucket_count == 0 {
            return Ok(None);
        }
        let bucket = hash % bucket_count;
        let mut off = idx.bucket_offset(bucket);
        while off != 0 {
            let entry = MapEntry::at(&self.data, off);
            if entry.hash() == hash && entry.key_bytes() == key_bytes.as_slice() {
                let scratch = entry.value_bytes().to_vec();
                let value = self.decode_value(entry.value_encoder_id(), &scratch)?;
                return Ok(Some(value));
            }
            off = entry.next_offset();
        }
        Ok(None)
    }

    pub fn set(&self, key: &Value, value: &Value) -> StoreResult<()> {
        let (key_bytes, key_kind) = canonicalize_key(key);
        let hash = fnv1a_32(&key_bytes);
        let rw_lock = self.rw_lock();
        let _guard = rw_lock.acquire_write()?;
        let idx = MapIndex::new(&self.index);
        let bucket_count = idx.bucket_count();
        let bucket = hash % bucket_count;

        let mut off = idx.bucket_offset(bucket);
        let mut prev: Option<u32> = None;
        while off != 0 {
            let entry = MapEntry::at(&self.data, off);
            if entry.hash() == hash && entry.key_bytes() == key_bytes.as_slice() {
                let encoder = select_encoder(value, self.encoder.as_deref());
                let mut encoded = Vec::with_capacity(encoder.max_len(value));
                encoder.encode(value, &mut encoded)?;
                if encoded.len() as u32 <= entry.value_length() {
                    let diff = entry.value_length() - encoded.len() as u32;
                    self.data.copy_from_slice(entry.value_offset(), &encoded);
                    entry.set_value_length(encoded.len() as u32);
                    entry.set_value_encoder_id(encoder.id());
                    if diff > 0 {
                        idx.set_used_space(idx.used_space() - diff);
                    }
                } else {
                    self.unlink(&idx, bucket, prev, off);
                    self.insert_new(&idx, bucket, hash, key_kind, &key_bytes, value)?;
                }
                return Ok(());
            }
            prev = Some(off);
            off = entry.next_offset();
        }

        self.insert_new(&idx, bucket, hash, key_kind, &key_bytes, value)?;
        self.maybe_rehash()?;
        Ok(())
    }

    pub fn delete(&self, key: &Value) -> StoreResult<bool> {
        let (key_bytes, _) = canonicalize_key(key);
        let hash = fnv1a_32(&key_bytes);
        let rw_lock = self.rw_lock();
        let _guard = rw_lock.acquire_write()?;
        let idx = MapIndex::new(&self.index);
        let bucket_count = idx.bucket_count();
        if bucket_count == 0 {
            return Ok(false);
        }
        let bucket = hash % bucket_count;
        let mut off = idx.bucket_offset(bucket);
        let mut prev: Option<u32> = None;
        while off != 0 {
            let entry = MapEntry::at(&self.data, off);
            let next = entry.next_offset();
            if entry.hash() == hash && entry.key_bytes() == key_bytes.as_slice() {
                self.unlink(&idx, bucket, prev, off);
                return Ok(true);
            }
            prev = Some(off);
            off = next;
        }
        Ok(false)
    }

    pub fn clear(&self) -> StoreResult<()> {
        let rw_lock = self.rw_lock();
        let _guard = rw_lock.acquire_write()?;
        MapIndex::new(&self.index).reset();
        self.data.set_len(INITIAL_DATA_OFFSET as usize);
        Ok(())
    }

    /// Snapshot every (key, value) pair reachable from the bucket table,
    /// decoded, under a single read lock held for the walk's duration.
    pub fn pairs(&self) -> StoreResult<Vec<(Value, Value)>> {
        let rw_lock = self.rw_lock();
        let _guard = rw_lock.acquire_read()?;
        let idx = MapIndex::new(&self.index);
        let bucket_count = idx.bucket_count();
        let mut out = Vec::with_capacity(idx.size() as usize);
        for bucket in 0..bucket_count {
            let mut off = idx.bucket_offset(bucket);
            while off != 0 {
                let entry = MapEntry::at(&self.data, off);
                let key = self.decode_key(entry.key_kind(), entry.key_bytes())?;
                let value_bytes = entry.value_bytes().to_vec();
                let value = self.decode_value(entry.value_encoder_id(), &value_bytes)?;
                out.push((key, value));
                off = entry.next_offset();
            }
        }
        Ok(out)
    }

    pub fn keys(&self) -> StoreResult<Vec<Value>> {
        Ok(self.pairs()?.into_iter().map(|(k, _)| k).collect())
    }

    pub fn values(&self) -> StoreResult<Vec<Value>> {
        Ok(self.pairs()?.into_iter().map(|(_, v)| v).collect())
    }

    pub fn for_each(&self, mut f: impl FnMut(&Value, &Value)) -> StoreResult<()> {
        for (k, v) in self.pairs()? {
            f(&k, &v);
        }
        Ok(())
    }

    pub fn into_transferable(self) -> TransferableState {
        TransferableState::new(self.index.to_vec(), self.data.to_vec(), RegionKind::Map)
    }

    fn decode_key(&self, kind: KeyKind, bytes: &[u8]) -> StoreResult<Value> {
        match kind {
            KeyKind::RawString => std::str::from_utf8(bytes)
                .map(|s| Value::Str(s.to_owned()))
                .map_err(|e| EncoderError::new(e).into()),
            KeyKind::StringifiedComposite => GeneralEncoder.decode(bytes),
        }
    }

    fn decode_value(&self, id: u16, bytes: &[u8]) -> StoreResult<Value> {
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

    fn unlink(&self, idx: &MapIndex, bucket: u32, prev: Option<u32>, off: u32) {
        let entry = MapEntry::at(&self.data, off);
        let next = entry.next_offset();
        match prev {
            Some(p) => MapEntry::at(&self.data, p).set_next_offset(next),
            None => idx.set_bucket_offset(bucket, next),
        }
        if prev.is_none() && next == 0 {
            idx.set_buckets_in_use(idx.buckets_in_use() - 1);
        }
        idx.set_used_space(idx.used_space() - entry.byte_len());
        idx.set_size(idx.size() - 1);
    }

    /// Append a brand-new entry at the tail of `bucket`'s chain, per
    /// spec.md §4.3.3 step 5.
    fn insert_new(
        &self,
        idx: &MapIndex,
        bucket: u32,
        hash: u32,
        key_kind: KeyKind,
        key_bytes: &[u8],
        value: &Value,
    ) -> StoreResult<()> {
        let encoder = select_encoder(value, self.encoder.as_deref());
        let mut encoded = Vec::with_capacity(encoder.max_len(value));
        encoder.encode(value, &mut encoded)?;
        let needed = map_entry::HEADER_LEN as u32 + key_bytes.len() as u32 + encoded.len() as u32;
        self.ensure_data_capacity(idx, needed)?;

        let offset = idx.free_start();
        let head = idx.bucket_offset(bucket);
        if head == 0 {
            idx.set_bucket_offset(bucket, offset);
            idx.set_buckets_in_use(idx.buckets_in_use() + 1);
        } else {
            let mut tail = head;
            loop {
                let next = MapEntry::at(&self.data, tail).next_offset();
                if next == 0 {
                    break;
                }
                tail = next;
            }
            MapEntry::at(&self.data, tail).set_next_offset(offset);
        }
        MapEntry::write_new(&self.data, offset, 0, key_kind, encoder.id(), hash, key_bytes, &encoded);
        idx.set_free_start(offset + needed);
        idx.set_used_space(idx.used_space() + needed);
        idx.set_size(idx.size() + 1);
        Ok(())
    }

    fn maybe_rehash(&self) -> StoreResult<()> {
        let idx = MapIndex::new(&self.index);
        let bucket_count = idx.bucket_count();
        if bucket_count == 0 {
            return Ok(());
        }
        if idx.buckets_in_use() as f64 / bucket_count as f64 >= LOAD_FACTOR {
            self.rehash(bucket_count * 2)?;
        }
        Ok(())
    }

    /// Double the bucket table and re-thread every entry into its new
    /// bucket, per spec.md §4.3.5. The data region is untouched.
    fn rehash(&self, new_bucket_count: u32) -> StoreResult<()> {
        let new_index_len = map_header::HEADER_LEN + new_bucket_count as usize * 4;
        if new_index_len > self.index.capacity() {
            return Err(StoreError::CapacityExhausted {
                requested: new_index_len,
                reserved: self.index.capacity(),
            });
        }

        let old = MapIndex::new(&self.index);
        let old_bucket_count = old.bucket_count();
        let mut entry_offsets = Vec::with_capacity(old.size() as usize);
        for bucket in 0..old_bucket_count {
            let mut off = old.bucket_offset(bucket);
            while off != 0 {
                entry_offsets.push(off);
                off = MapEntry::at(&self.data, off).next_offset();
            }
        }

        self.index.grow_to(new_index_len)?;
        let new_idx = MapIndex::new(&self.index);
        for bucket in 0..new_bucket_count {
            new_idx.set_bucket_offset(bucket, 0);
        }

        let mut tails = vec![0u32; new_bucket_count as usize];
        for off in entry_offsets {
            let entry = MapEntry::at(&self.data, off);
            entry.set_next_offset(0);
            let bucket = entry.hash() % new_bucket_count;
            let tail = tails[bucket as usize];
            if tail == 0 {
                new_idx.set_bucket_offset(bucket, off);
            } else {
                MapEntry::at(&self.data, tail).set_next_offset(off);
            }
            tails[bucket as usize] = off;
        }
        let used = tails.iter().filter(|&&t| t != 0).count() as u32;
        new_idx.set_buckets_in_use(used);
        tracing::debug!(new_bucket_count, "map rehashed");
        Ok(())
    }

    fn ensure_data_capacity(&self, idx: &MapIndex, needed: u32) -> StoreResult<()> {
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
        tracing::debug!(new_len, "map data region grown");
        Ok(())
    }

    /// Pack every live entry contiguously from `INITIAL_DATA_OFFSET`,
    /// rebuilding bucket links as it goes, per spec.md §4.3.6.
    fn defragment(&self, idx: &MapIndex) -> StoreResult<()> {
        let bucket_count = idx.bucket_count();
        let mut cursor = INITIAL_DATA_OFFSET;
        for bucket in 0..bucket_count {
            let mut off = idx.bucket_offset(bucket);
            let mut new_head: Option<u32> = None;
            let mut prev_new: Option<u32> = None;
            while off != 0 {
                let entry = MapEntry::at(&self.data, off);
                let len = entry.byte_len();
                let next = entry.next_offset();
                if off != cursor {
                    self.data.copy_within(off as usize, cursor as usize, len as usize);
                }
                let new_off = cursor;
                if new_head.is_none() {
                    new_head = Some(new_off);
                }
                if let Some(prev) = prev_new {
                    MapEntry::at(&self.data, prev).set_next_offset(new_off);
                }
                prev_new = Some(new_off);
                cursor += len;
                off = next;
            }
            if let Some(prev) = prev_new {
                MapEntry::at(&self.data, prev).set_next_offset(0);
            }
            idx.set_bucket_offset(bucket, new_head.unwrap_or(0));
        }
        idx.set_free_start(cursor);
        idx.set_used_space(cursor - INITIAL_DATA_OFFSET);
        tracing::debug!(free_start = cursor, "map data region defragmented");
        Ok(())
    }
}

fn canonicalize_key(key: &Value) -> (Vec<u8>, KeyKind) {
    match key {
        Value::Str(s) => (s.as_bytes().to_vec(), KeyKind::RawString),
        other => {
            let mut buf = Vec::new();
            GeneralEncoder
                .encode(other, &mut buf)
                .expect("canonical encoding of a well-formed key never fails");
            (buf, KeyKind::StringifiedComposite)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_map() -> ShareableMap {
        ShareableMap::new(MapOptions {
            initial_buckets: 4,
            max_index_bytes: 4096,
            max_data_bytes: 1 << 20,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn set_then_get_round_trips() {
        let map = small_map();
        map.set(&Value::Str("a".into()), &Value::Int(1)).unwrap();
        assert_eq!(map.get(&Value::Str("a".into())).unwrap(), Some(Value::Int(1)));
        assert_eq!(map.len().unwrap(), 1);
    }

    #[test]
    fn overwrite_updates_value() {
        let map = small_map();
        map.set(&Value::Str("a".into()), &Value::Int(1)).unwrap();
        map.set(&Value::Str("a".into()), &Value::Int(2)).unwrap();
        assert_eq!(map.get(&Value::Str("a".into())).unwrap(), Some(Value::Int(2)));
        assert_eq!(map.len().unwrap(), 1);
    }

    #[test]
    fn delete_removes_entry() {
        let map = small_map();
        map.set(&Value::Str("a".into()), &Value::Int(1)).unwrap();
        assert!(map.delete(&Value::Str("a".into())).unwrap());
        assert_eq!(map.get(&Value::Str("a".into())).unwrap(), None);
        assert_eq!(map.len().unwrap(), 0);
    }

    #[test]
    fn non_string_key_round_trips() {
        let map = small_map();
        let key = Value::List(vec![Value::Int(1), Value::Int(2)]);
        map.set(&key, &Value::Str("composite".into())).unwrap();
        assert_eq!(map.get(&key).unwrap(), Some(Value::Str("composite".into())));
    }

    #[test]
    fn rehash_preserves_all_entries() {
        let map = small_map();
        for i in 0..64 {
            map.set(&Value::Str(format!("k{i}")), &Value::Int(i)).unwrap();
        }
        assert_eq!(map.len().unwrap(), 64);
        for i in 0..64 {
            assert_eq!(map.get(&Value::Str(format!("k{i}"))).unwrap(), Some(Value::Int(i)));
        }
    }

    #[test]
    fn clear_empties_the_map() {
        let map = small_map();
        map.set(&Value::Str("a".into()), &Value::Int(1)).unwrap();
        map.clear().unwrap();
        assert_eq!(map.len().unwrap(), 0);
        assert_eq!(map.get(&Value::Str("a".into())).unwrap(), None);
    }

    #[test]
    fn defragmentation_reclaims_deleted_space() {
        let map = ShareableMap::new(MapOptions {
            initial_buckets: 8,
            max_index_bytes: 4096,
            max_data_bytes: 1 << 20,
            ..Default::default()
        })
        .unwrap();
        for i in 0..200 {
            map.set(&Value::Str(format!("key-{i}")), &Value::Int(i)).unwrap();
        }
        for i in 0..180 {
            map.delete(&Value::Str(format!("key-{i}"))).unwrap();
        }
        for i in 0..180 {
            map.set(&Value::Str(format!("key-{i}")), &Value::Int(i)).unwrap();
        }
        assert_eq!(map.len().unwrap(), 200);
        for i in 0..200 {
            assert_eq!(map.get(&Value::Str(format!("key-{i}"))).unwrap(), Some(Value::Int(i)));
        }
    }

    #[test]
    fn pairs_snapshot_matches_entries() {
        let map = small_map();
        map.set(&Value::Str("a".into()), &Value::Int(1)).unwrap();
        map.set(&Value::Str("b".into()), &Value::Int(2)).unwrap();
        let mut pairs = map.pairs().unwrap();
        pairs.sort_by(|a, b| format!("{:?}", a.0).cmp(&format!("{:?}", b.0)));
        assert_eq!(
            pairs,
            vec![
                (Value::Str("a".into()), Value::Int(1)),
                (Value::Str("b".into()), Value::Int(2)),
            ]
        );
    }

    mod properties {
        use super::*;
        use quickcheck_macros::quickcheck;

        /// For every state reachable by a sequence of set/delete, `size`
        /// must equal the number of entries actually reachable by
        /// walking the bucket chains (spec.md §8).
        #[quickcheck]
        fn size_matches_bucket_chain_reachability(ops: Vec<(bool, u8, i32)>) -> bool {
            let map = ShareableMap::new(MapOptions {
                initial_buckets: 4,
                max_index_bytes: 1 << 20,
                max_data_bytes: 1 << 20,
                ..Default::default()
            })
            .unwrap();
            for (is_set, key, value) in ops {
                let k = Value::Str(format!("k{key}"));
                if is_set {
                    map.set(&k, &Value::Int(value as i64)).unwrap();
                } else {
                    let _ = map.delete(&k).unwrap();
                }
            }
            map.pairs().unwrap().len() as u32 == map.len().unwrap()
        }

        #[quickcheck]
        fn deleted_keys_are_absent(keys: Vec<u8>) -> bool {
            let map = ShareableMap::new(MapOptions {
                initial_buckets: 4,
                max_index_bytes: 1 << 20,
                max_data_bytes: 1 << 20,
                ..Default::default()
            })
            .unwrap();
            for key in &keys {
                map.set(&Value::Str(format!("k{key}")), &Value::Int(*key as i64)).unwrap();
            }
            for key in &keys {
                map.delete(&Value::Str(format!("k{key}"))).unwrap();
            }
            keys.iter().all(|key| !map.has(&Value::Str(format!("k{key}"))).unwrap())
        }
    }

    #[test]
    fn handoff_round_trip_preserves_state() {
        let map = small_map();
        map.set(&Value::Str("a".into()), &Value::Int(1)).unwrap();
        map.set(&Value::Str("b".into()), &Value::Int(2)).unwrap();
        let envelope = map.into_transferable();
        let rebuilt = envelope.into_map().unwrap();
        assert_eq!(rebuilt.len().unwrap(), 2);
        assert_eq!(rebuilt.get(&Value::Str("a".into())).unwrap(), Some(Value::Int(1)));
        assert_eq!(rebuilt.get(&Value::Str("b".into())).unwrap(), Some(Value::Int(2)));
    }
}
