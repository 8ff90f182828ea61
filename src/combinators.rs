//! Surface combinators: the pass-through array/map operations from
//! `spec.md` re-expressed as ordinary Rust methods over the eagerly
//! materialized snapshots `array.rs`/`map.rs` already build under a read
//! lock. None of these hold a lock across a lazy sequence — per the
//! spec's own fallback for implementations that can't do that, every
//! sequence here is fully materialized before the lock is released.

use crate::array::ShareableArray;
use crate::encoder::Value;
use crate::error::StoreResult;
use crate::map::ShareableMap;

impl ShareableArray {
    pub fn shift(&self) -> StoreResult<Option<Value>> {
        let first = self.at(0)?;
        if first.is_some() || self.len()? > 0 {
            self.delete(0)?;
        }
        Ok(first)
    }

    pub fn unshift(&self, value: &Value) -> StoreResult<()> {
        self.insert(0, value)
    }

    /// Removes `delete_count` elements starting at `start` and inserts
    /// `items` in their place, returning the removed elements.
    pub fn splice(&self, start: u32, delete_count: u32, items: &[Value]) -> StoreResult<Vec<Option<Value>>> {
        let length = self.len()?;
        let start = start.min(length);
        let delete_count = delete_count.min(length - start);
        let mut removed = Vec::with_capacity(delete_count as usize);
        for _ in 0..delete_count {
            removed.push(self.at(start)?);
            self.delete(start)?;
        }
        for (i, item) in items.iter().enumerate() {
            self.insert(start + i as u32, item)?;
        }
        Ok(removed)
    }

    pub fn slice(&self, start: u32, end: u32) -> StoreResult<Vec<Option<Value>>> {
        let snapshot = self.snapshot()?;
        let start = (start as usize).min(snapshot.len());
        let end = (end as usize).min(snapshot.len()).max(start);
        Ok(snapshot[start..end].to_vec())
    }

    pub fn concat(&self, other: &ShareableArray) -> StoreResult<Vec<Option<Value>>> {
        let mut combined = self.snapshot()?;
        combined.extend(other.snapshot()?);
        Ok(combined)
    }

    /// Rewrites the array from only its present values, in reverse
    /// order; holes are dropped rather than relocated, so the length
    /// shrinks to the present-value count.
    pub fn reverse(&self) -> StoreResult<()> {
        let snapshot = self.snapshot()?;
        let mut present: Vec<Value> = snapshot.into_iter().flatten().collect();
        present.reverse();
        self.rewrite(present)
    }

    pub fn sort_by(&self, mut cmp: impl FnMut(&Value, &Value) -> std::cmp::Ordering) -> StoreResult<()> {
        let snapshot = self.snapshot()?;
        let mut present: Vec<Value> = snapshot.into_iter().flatten().collect();
        present.sort_by(&mut cmp);
        self.rewrite(present)
    }

    pub fn to_reversed(&self) -> StoreResult<Vec<Value>> {
        let mut present: Vec<Value> = self.snapshot()?.into_iter().flatten().collect();
        present.reverse();
        Ok(present)
    }

    pub fn to_sorted(&self, mut cmp: impl FnMut(&Value, &Value) -> std::cmp::Ordering) -> StoreResult<Vec<Value>> {
        let mut present: Vec<Value> = self.snapshot()?.into_iter().flatten().collect();
        present.sort_by(&mut cmp);
        Ok(present)
    }

    pub fn fill(&self, value: &Value, start: u32, end: u32) -> StoreResult<()> {
        let length = self.len()?;
        let end = end.min(length);
        for i in start..end {
            self.set(i, value)?;
        }
        Ok(())
    }

    pub fn contains(&self, value: &Value) -> StoreResult<bool> {
        Ok(self.snapshot()?.iter().any(|v| v.as_ref() == Some(value)))
    }

    pub fn position(&self, value: &Value) -> StoreResult<Option<u32>> {
        Ok(self.snapshot()?.iter().position(|v| v.as_ref() == Some(value)).map(|i| i as u32))
    }

    pub fn rposition(&self, value: &Value) -> StoreResult<Option<u32>> {
        let snapshot = self.snapshot()?;
        Ok(snapshot
            .iter()
            .rposition(|v| v.as_ref() == Some(value))
            .map(|i| i as u32))
    }

    pub fn find(&self, mut predicate: impl FnMut(&Value) -> bool) -> StoreResult<Option<Value>> {
        Ok(self.snapshot()?.into_iter().flatten().find(|v| predicate(v)))
    }

    pub fn find_index(&self, mut predicate: impl FnMut(&Value) -> bool) -> StoreResult<Option<u32>> {
        Ok(self
            .snapshot()?
            .iter()
            .enumerate()
            .find(|(_, v)| v.as_ref().is_some_and(&mut predicate))
            .map(|(i, _)| i as u32))
    }

    pub fn find_last(&self, mut predicate: impl FnMut(&Value) -> bool) -> StoreResult<Option<Value>> {
        Ok(self.snapshot()?.into_iter().flatten().rev().find(|v| predicate(v)))
    }

    pub fn find_last_index(&self, mut predicate: impl FnMut(&Value) -> bool) -> StoreResult<Option<u32>> {
        let snapshot = self.snapshot()?;
        Ok(snapshot
            .iter()
            .enumerate()
            .rev()
            .find(|(_, v)| v.as_ref().is_some_and(&mut predicate))
            .map(|(i, _)| i as u32))
    }

    pub fn flat_map(&self, mut f: impl FnMut(&Value) -> Vec<Value>) -> StoreResult<Vec<Value>> {
        Ok(self.snapshot()?.into_iter().flatten().flat_map(|v| f(&v)).collect())
    }

    pub fn every(&self, mut predicate: impl FnMut(&Value) -> bool) -> StoreResult<bool> {
        Ok(self.snapshot()?.into_iter().flatten().all(|v| predicate(&v)))
    }

    pub fn some(&self, mut predicate: impl FnMut(&Value) -> bool) -> StoreResult<bool> {
        Ok(self.snapshot()?.into_iter().flatten().any(|v| predicate(&v)))
    }

    pub fn filter(&self, mut predicate: impl FnMut(&Value) -> bool) -> StoreResult<Vec<Value>> {
        Ok(self.snapshot()?.into_iter().flatten().filter(|v| predicate(v)).collect())
    }

    pub fn map(&self, mut f: impl FnMut(&Value) -> Value) -> StoreResult<Vec<Value>> {
        Ok(self.snapshot()?.into_iter().flatten().map(|v| f(&v)).collect())
    }

    pub fn reduce(&self, mut f: impl FnMut(Value, &Value) -> Value, init: Option<Value>) -> StoreResult<Value> {
        let present: Vec<Value> = self.snapshot()?.into_iter().flatten().collect();
        let mut iter = present.into_iter();
        let mut acc = match init {
            Some(v) => v,
            None => iter.next().ok_or(crate::error::StoreError::EmptyReduce)?,
        };
        for item in iter {
            acc = f(acc, &item);
        }
        Ok(acc)
    }

    pub fn reduce_right(&self, mut f: impl FnMut(Value, &Value) -> Value, init: Option<Value>) -> StoreResult<Value> {
        let present: Vec<Value> = self.snapshot()?.into_iter().flatten().collect();
        let mut iter = present.into_iter().rev();
        let mut acc = match init {
            Some(v) => v,
            None => iter.next().ok_or(crate::error::StoreError::EmptyReduce)?,
        };
        for item in iter {
            acc = f(acc, &item);
        }
        Ok(acc)
    }

    pub fn for_each(&self, mut f: impl FnMut(&Value)) -> StoreResult<()> {
        for v in self.snapshot()?.into_iter().flatten() {
            f(&v);
        }
        Ok(())
    }

    /// `Array.prototype.join`: absent slots render as the empty string.
    pub fn join(&self, separator: &str) -> StoreResult<String> {
        let parts: Vec<String> = self
            .snapshot()?
            .into_iter()
            .map(|v| v.map(render_for_join).unwrap_or_default())
            .collect();
        Ok(parts.join(separator))
    }

    pub fn entries(&self) -> StoreResult<Vec<(u32, Option<Value>)>> {
        Ok(self.snapshot()?.into_iter().enumerate().map(|(i, v)| (i as u32, v)).collect())
    }

    pub fn index_keys(&self) -> StoreResult<Vec<u32>> {
        Ok((0..self.len()?).collect())
    }

    pub fn iter(&self) -> StoreResult<std::vec::IntoIter<Option<Value>>> {
        Ok(self.snapshot()?.into_iter())
    }

    /// Replace the entire slot table with `values`, densely packed from
    /// index 0 — used by `reverse`/`sort_by`, which only reorder the
    /// present elements and drop accumulated holes.
    fn rewrite(&self, values: Vec<Value>) -> StoreResult<()> {
        self.clear()?;
        for value in &values {
            self.push(value)?;
        }
        Ok(())
    }
}

fn render_for_join(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Int(n) => n.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Str(s) => s,
        Value::Bytes(b) => b.iter().map(|byte| format!("{byte:02x}")).collect(),
        other @ (Value::List(_) | Value::Map(_)) => format!("{other:?}"),
    }
}

impl ShareableMap {
    /// Alias for [`ShareableMap::pairs`] reached as an iterator, matching
    /// the array side's `iter()`.
    pub fn iter(&self) -> StoreResult<std::vec::IntoIter<(Value, Value)>> {
        Ok(self.pairs()?.into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::ArrayOptions;

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
    fn shift_and_unshift() {
        let array = small_array();
        array.push(&Value::Int(1)).unwrap();
        array.push(&Value::Int(2)).unwrap();
        assert_eq!(array.shift().unwrap(), Some(Value::Int(1)));
        array.unshift(&Value::Int(0)).unwrap();
        assert_eq!(array.snapshot().unwrap(), vec![Some(Value::Int(0)), Some(Value::Int(2))]);
    }

    #[test]
    fn splice_removes_and_inserts() {
        let array = small_array();
        for i in 0..5 {
            array.push(&Value::Int(i)).unwrap();
        }
        let removed = array.splice(1, 2, &[Value::Int(99)]).unwrap();
        assert_eq!(removed, vec![Some(Value::Int(1)), Some(Value::Int(2))]);
        assert_eq!(
            array.snapshot().unwrap(),
            vec![
                Some(Value::Int(0)),
                Some(Value::Int(99)),
                Some(Value::Int(3)),
                Some(Value::Int(4)),
            ]
        );
    }

    #[test]
    fn sort_by_orders_present_values() {
        let array = small_array();
        for i in [3, 1, 2] {
            array.push(&Value::Int(i)).unwrap();
        }
        array.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)).unwrap();
        assert_eq!(
            array.snapshot().unwrap(),
            vec![Some(Value::Int(1)), Some(Value::Int(2)), Some(Value::Int(3))]
        );
    }

    #[test]
    fn reduce_sums_values() {
        let array = small_array();
        for i in 1..=4 {
            array.push(&Value::Int(i)).unwrap();
        }
        let sum = array
            .reduce(
                |acc, v| match (acc, v) {
                    (Value::Int(a), Value::Int(b)) => Value::Int(a + b),
                    (other, _) => other,
                },
                None,
            )
            .unwrap();
        assert_eq!(sum, Value::Int(10));
    }

    #[test]
    fn join_treats_absent_as_empty_string() {
        let array = small_array();
        array.push(&Value::Int(1)).unwrap();
        array.unset(1).unwrap();
        array.push(&Value::Int(3)).unwrap();
        assert_eq!(array.join(",").unwrap(), "1,,3");
    }
}
